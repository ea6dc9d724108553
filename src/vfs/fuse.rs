//! FUSE upcall adapter: maps the kernel's inode-oriented surface onto
//! the path-resolving [`Tree`], keeps per-open content handles so reads
//! see a stable byte snapshot, and hosts the waypoint-upload drop box.
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use log::{debug, error, info, warn};

use super::{Attr, Node, Tree};
use crate::error::FsError;
use crate::wpt;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Per-open state.
enum Handle {
    /// Immutable content snapshot taken at open time.
    Content(Arc<Vec<u8>>),
    /// The memory pseudo-file reads through the page cache instead.
    Memory,
    /// Waypoint-upload drop box, keyed back to its inode.
    Upload(u64),
}

/// Bytes accumulated for a drop-box file under `waypoints/`.
struct Upload {
    name: String,
    data: Vec<u8>,
    uploaded: bool,
}

pub struct FlytecFs {
    tree: Tree,
    uid: u32,
    gid: u32,
    inode_to_path: HashMap<u64, String>,
    path_to_inode: HashMap<String, u64>,
    next_inode: u64,
    handles: HashMap<u64, Handle>,
    next_handle: u64,
    uploads: HashMap<u64, Upload>,
}

impl FlytecFs {
    pub fn new(tree: Tree) -> Self {
        let mut inode_to_path = HashMap::new();
        let mut path_to_inode = HashMap::new();
        inode_to_path.insert(ROOT_INO, String::new());
        path_to_inode.insert(String::new(), ROOT_INO);
        Self {
            tree,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            inode_to_path,
            path_to_inode,
            next_inode: ROOT_INO + 1,
            handles: HashMap::new(),
            next_handle: 1,
            uploads: HashMap::new(),
        }
    }

    fn inode_for(&mut self, path: &str) -> u64 {
        if let Some(inode) = self.path_to_inode.get(path) {
            return *inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.inode_to_path.insert(inode, path.to_string());
        self.path_to_inode.insert(path.to_string(), inode);
        inode
    }

    fn path_of(&self, inode: u64) -> Result<&str, FsError> {
        self.inode_to_path
            .get(&inode)
            .map(String::as_str)
            .ok_or(FsError::NotFound)
    }

    fn node_of(&self, inode: u64) -> Result<Node, FsError> {
        let path = self.path_of(inode)?.to_string();
        self.tree.resolve(&path)
    }

    fn file_attr(&self, inode: u64, attr: &Attr) -> FileAttr {
        FileAttr {
            ino: inode,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.ctime,
            kind: if attr.directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: attr.perm,
            nlink: attr.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: attr.blksize,
            flags: 0,
        }
    }

    fn upload_attr(&self, inode: u64, upload: &Upload) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: inode,
            size: upload.data.len() as u64,
            blocks: (upload.data.len() as u64).div_ceil(4096),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    /// Parse and upload a drop-box buffer once. Every parsed waypoint
    /// goes to the device through `waypoint_create`.
    fn upload_waypoints(&mut self, inode: u64) -> Result<(), FsError> {
        let Some(upload) = self.uploads.get_mut(&inode) else {
            return Ok(());
        };
        if upload.uploaded || upload.data.is_empty() {
            return Ok(());
        }
        upload.uploaded = true;
        let data = upload.data.clone();
        let name = upload.name.clone();
        let waypoints = wpt::parse(&data)?;
        info!("uploading {} waypoints from {name}", waypoints.len());
        for waypoint in &waypoints {
            self.tree.cache().waypoint_create(waypoint)?;
        }
        Ok(())
    }

    fn drop_upload(&mut self, inode: u64) {
        if let Some(upload) = self.uploads.remove(&inode) {
            let path = format!("/waypoints/{}", upload.name);
            self.path_to_inode.remove(&path);
            self.inode_to_path.remove(&inode);
        }
    }
}

fn errno(error: &FsError) -> i32 {
    match error {
        FsError::NotFound => debug!("fs: {error}"),
        _ => warn!("fs: {error}"),
    }
    error.errno()
}

impl Filesystem for FlytecFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), i32> {
        info!(
            "mounted {} serial {}",
            self.tree.cache().snp().instrument,
            self.tree.cache().snp().serial_number
        );
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let parent_path = match self.path_of(parent) {
            Ok(path) => path.to_string(),
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        let path = format!("{parent_path}/{name}");
        // Pending drop-box files are visible while they are open.
        if let Some(&inode) = self.path_to_inode.get(&path) {
            if let Some(upload) = self.uploads.get(&inode) {
                reply.entry(&TTL, &self.upload_attr(inode, upload), 0);
                return;
            }
        }
        match self.tree.resolve(&path).and_then(|node| self.tree.attr(&node)) {
            Ok(attr) => {
                let inode = self.inode_for(&path);
                reply.entry(&TTL, &self.file_attr(inode, &attr), 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if let Some(upload) = self.uploads.get(&ino) {
            reply.attr(&TTL, &self.upload_attr(ino, upload));
            return;
        }
        match self.node_of(ino).and_then(|node| self.tree.attr(&node)) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(ino, &attr)),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let listing = self.node_of(ino).and_then(|node| {
            if !node.is_directory() {
                return Err(FsError::NotFound);
            }
            self.tree.children(&node)
        });
        let children = match listing {
            Ok(children) => children,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        let parent_path = match self.path_of(ino) {
            Ok(path) => path.to_string(),
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ROOT_INO, FileType::Directory, "..".to_string()),
        ];
        for (name, node) in children {
            let inode = self.inode_for(&format!("{parent_path}/{name}"));
            let kind = if node.is_directory() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((inode, kind, name));
        }
        for (position, (inode, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(inode, position as i64 + 1, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if self.uploads.contains_key(&ino) {
            let handle = self.next_handle;
            self.next_handle += 1;
            self.handles.insert(handle, Handle::Upload(ino));
            reply.opened(handle, 0);
            return;
        }
        let node = match self.node_of(ino) {
            Ok(node) => node,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EACCES);
            return;
        }
        let handle_data = match node {
            Node::MemoryFile => Ok(Handle::Memory),
            node => self.tree.content(&node).map(Handle::Content),
        };
        match handle_data {
            Ok(data) => {
                let handle = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(handle, data);
                reply.opened(handle, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = offset.max(0) as usize;
        match self.handles.get(&fh) {
            Some(Handle::Content(content)) => {
                if offset >= content.len() {
                    reply.data(&[]);
                } else {
                    let end = (offset + size as usize).min(content.len());
                    reply.data(&content[offset..end]);
                }
            }
            Some(Handle::Memory) => {
                match self.tree.read(&Node::MemoryFile, offset as u64, size) {
                    Ok(bytes) => reply.data(&bytes),
                    Err(err) => reply.error(errno(&err)),
                }
            }
            Some(Handle::Upload(inode)) => match self.uploads.get(inode) {
                Some(upload) if offset < upload.data.len() => {
                    let end = (offset + size as usize).min(upload.data.len());
                    reply.data(&upload.data[offset..end]);
                }
                Some(_) => reply.data(&[]),
                None => reply.error(libc::ENOENT),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EPERM);
            return;
        };
        // New files are only accepted in the waypoints drop box.
        match self.path_of(parent) {
            Ok("/waypoints") => {}
            _ => {
                reply.error(libc::EPERM);
                return;
            }
        }
        let path = format!("/waypoints/{name}");
        let inode = self.inode_for(&path);
        let upload = Upload {
            name: name.to_string(),
            data: Vec::new(),
            uploaded: false,
        };
        let attr = self.upload_attr(inode, &upload);
        self.uploads.insert(inode, upload);
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, Handle::Upload(inode));
        reply.created(&TTL, &attr, 0, handle, 0);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(Handle::Upload(inode)) = self.handles.get(&fh) else {
            reply.error(libc::EPERM);
            return;
        };
        let Some(upload) = self.uploads.get_mut(inode) else {
            reply.error(libc::ENOENT);
            return;
        };
        let offset = offset.max(0) as usize;
        if upload.data.len() < offset + data.len() {
            upload.data.resize(offset + data.len(), 0);
        }
        upload.data[offset..offset + data.len()].copy_from_slice(data);
        reply.written(data.len() as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if let Some(Handle::Upload(inode)) = self.handles.get(&fh) {
            let inode = *inode;
            if let Err(err) = self.upload_waypoints(inode) {
                error!("waypoint upload failed: {err}");
                reply.error(err.errno());
                return;
            }
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(Handle::Upload(inode)) = self.handles.remove(&fh) {
            if let Err(err) = self.upload_waypoints(inode) {
                error!("waypoint upload failed: {err}");
            }
            self.drop_upload(inode);
        }
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let parent_path = match self.path_of(parent) {
            Ok(path) => path.to_string(),
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        let path = format!("{parent_path}/{name}");
        // Unlinking a pending drop-box file just abandons it.
        if let Some(&inode) = self.path_to_inode.get(&path) {
            if self.uploads.contains_key(&inode) {
                self.drop_upload(inode);
                reply.ok();
                return;
            }
        }
        match self.tree.resolve(&path).and_then(|node| self.tree.unlink(&node)) {
            Ok(()) => {
                if let Some(inode) = self.path_to_inode.remove(&path) {
                    self.inode_to_path.remove(&inode);
                }
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EPERM);
            return;
        };
        if parent != newparent {
            reply.error(libc::EPERM);
            return;
        }
        let parent_path = match self.path_of(parent) {
            Ok(path) => path.to_string(),
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        let path = format!("{parent_path}/{name}");
        match self
            .tree
            .resolve(&path)
            .and_then(|node| self.tree.rename(&node, newname))
        {
            Ok(()) => {
                if let Some(inode) = self.path_to_inode.remove(&path) {
                    self.inode_to_path.remove(&inode);
                }
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }
}

/// Mount the tree and serve upcalls until unmounted.
pub fn mount(tree: Tree, mountpoint: &Path, options: &[MountOption]) -> std::io::Result<()> {
    fuser::mount2(FlytecFs::new(tree), mountpoint, options)
}
