//! Virtual directory tree: lazy path resolution over the cache, node
//! attributes, content materialization, and the unlink/rename entry
//! points. The FUSE adapter in [`fuse`] wires this tree to the kernel.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use crate::archive;
use crate::cache::{FlytecCache, MEMORY_PAGE, MEMORY_SIZE};
use crate::core::{Route, Tracklog, Waypoint};
use crate::error::FsError;
use crate::gpx;

pub mod fuse;

/// Node addressed by path resolution. File nodes carry the key of the
/// entity they render (route name, waypoint long name, tracklog id), so
/// they stay valid across renames of their directory siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Root,
    RoutesDir,
    SettingsDir,
    TracklogsDir,
    WaypointsDir,
    /// Keyed by the trimmed route name.
    RouteFile(String),
    RoutesAggregate,
    /// Keyed by the trimmed waypoint long name.
    WaypointFile(String),
    WaypointsAggregate,
    /// Keyed by the tracklog stable id.
    TracklogFile(String),
    TracklogsZip,
    MemoryFile,
}

impl Node {
    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            Node::Root | Node::RoutesDir | Node::SettingsDir | Node::TracklogsDir | Node::WaypointsDir
        )
    }
}

/// Stat-shaped attributes served through `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub directory: bool,
    pub perm: u16,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

const DIR_PERM: u16 = 0o555;
const FILE_PERM: u16 = 0o444;
const DEFAULT_BLKSIZE: u32 = 4096;

fn system_time(dt: &DateTime<Utc>) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(dt.timestamp().max(0) as u64)
}

fn blocks(size: u64, blksize: u32) -> u64 {
    size.div_ceil(u64::from(blksize))
}

/// The tree itself. Stateless apart from the zip memo; every lookup
/// consults the cache's current snapshots.
pub struct Tree {
    cache: Arc<FlytecCache>,
    mount_time: SystemTime,
    /// `tracklogs.zip` bytes together with the tracklogs revision they
    /// were built from.
    zip_memo: Mutex<Option<(u64, Arc<Vec<u8>>)>>,
}

impl Tree {
    pub fn new(cache: Arc<FlytecCache>) -> Self {
        Self {
            cache,
            mount_time: SystemTime::now(),
            zip_memo: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &FlytecCache {
        &self.cache
    }

    /// Walk slash-separated components from the root.
    pub fn resolve(&self, path: &str) -> Result<Node, FsError> {
        let mut node = Node::Root;
        for component in path.split('/').filter(|component| !component.is_empty()) {
            node = self.child(&node, component)?;
        }
        Ok(node)
    }

    /// Resolve one child inside a directory node.
    pub fn child(&self, node: &Node, name: &str) -> Result<Node, FsError> {
        let children = self.children(node)?;
        // Later entries shadow earlier ones, so an aggregate file beats
        // an entity that happens to share its name.
        children
            .into_iter()
            .rev()
            .find(|(child_name, _)| child_name == name)
            .map(|(_, child)| child)
            .ok_or(FsError::NotFound)
    }

    /// Current directory listing, in presentation order.
    pub fn children(&self, node: &Node) -> Result<Vec<(String, Node)>, FsError> {
        match node {
            Node::Root => Ok(vec![
                ("routes".to_string(), Node::RoutesDir),
                ("settings".to_string(), Node::SettingsDir),
                ("tracklogs".to_string(), Node::TracklogsDir),
                ("waypoints".to_string(), Node::WaypointsDir),
            ]),
            Node::RoutesDir => {
                let mut children: Vec<(String, Node)> = self
                    .cache
                    .routes()?
                    .iter()
                    .map(|route| {
                        let name = route.name.trim_end().to_string();
                        (format!("{name}.gpx"), Node::RouteFile(name))
                    })
                    .collect();
                children.push(("routes.gpx".to_string(), Node::RoutesAggregate));
                Ok(children)
            }
            Node::WaypointsDir => {
                let mut children: Vec<(String, Node)> = self
                    .cache
                    .waypoints()?
                    .iter()
                    .map(|waypoint| {
                        let name = waypoint.long_name.trim_end().to_string();
                        (format!("{name}.gpx"), Node::WaypointFile(name))
                    })
                    .collect();
                children.push(("waypoints.gpx".to_string(), Node::WaypointsAggregate));
                Ok(children)
            }
            Node::TracklogsDir => {
                let mut children: Vec<(String, Node)> = self
                    .cache
                    .tracklogs()?
                    .iter()
                    .map(|tracklog| {
                        (tracklog.filename.clone(), Node::TracklogFile(tracklog.id.clone()))
                    })
                    .collect();
                children.push(("tracklogs.zip".to_string(), Node::TracklogsZip));
                Ok(children)
            }
            Node::SettingsDir => Ok(vec![(".memory".to_string(), Node::MemoryFile)]),
            _ => Err(FsError::NotFound),
        }
    }

    fn route(&self, name: &str) -> Result<Route, FsError> {
        self.cache
            .routes()?
            .iter()
            .find(|route| route.name.trim_end() == name)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    fn waypoint(&self, long_name: &str) -> Result<Waypoint, FsError> {
        self.cache
            .waypoints()?
            .iter()
            .find(|waypoint| waypoint.long_name.trim_end() == long_name)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    fn tracklog(&self, id: &str) -> Result<Tracklog, FsError> {
        self.cache
            .tracklogs()?
            .iter()
            .find(|tracklog| tracklog.id == id)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    /// Materialize the full byte content of a file node.
    pub fn content(&self, node: &Node) -> Result<Arc<Vec<u8>>, FsError> {
        match node {
            Node::RouteFile(name) => {
                let route = self.route(name)?;
                let waypoints = self.cache.waypoints()?;
                Ok(Arc::new(gpx::route_gpx(&route, &waypoints)?))
            }
            Node::RoutesAggregate => {
                let routes = self.cache.routes()?;
                let waypoints = self.cache.waypoints()?;
                Ok(Arc::new(gpx::routes_gpx(&routes, &waypoints)?))
            }
            Node::WaypointFile(long_name) => {
                let waypoint = self.waypoint(long_name)?;
                Ok(Arc::new(gpx::waypoint_gpx(&waypoint)?))
            }
            Node::WaypointsAggregate => {
                let waypoints = self.cache.waypoints()?;
                Ok(Arc::new(gpx::waypoints_gpx(&waypoints)?))
            }
            Node::TracklogFile(id) => {
                let tracklog = self.tracklog(id)?;
                Ok(self.cache.tracklog(&tracklog)?)
            }
            Node::TracklogsZip => self.tracklogs_zip(),
            Node::MemoryFile => Ok(Arc::new(self.cache.memory(0, MEMORY_SIZE)?)),
            _ => Err(FsError::NotFound),
        }
    }

    /// Archive of every tracklog, rebuilt only when the tracklogs
    /// revision moves.
    fn tracklogs_zip(&self) -> Result<Arc<Vec<u8>>, FsError> {
        let revision = self.cache.revision("tracklogs");
        {
            let memo = self.zip_memo.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((observed, bytes)) = &*memo {
                if *observed == revision {
                    return Ok(Arc::clone(bytes));
                }
            }
        }
        let tracklogs = self.cache.tracklogs()?;
        let bytes = Arc::new(archive::tracklogs_zip(&tracklogs, |tracklog| {
            self.cache.tracklog(tracklog).map_err(FsError::from)
        })?);
        *self.zip_memo.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((revision, Arc::clone(&bytes)));
        Ok(bytes)
    }

    /// `content[offset..offset + size]`, with an empty slice at EOF. The
    /// memory pseudo-file reads through the page cache instead of
    /// materializing.
    pub fn read(&self, node: &Node, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        if let Node::MemoryFile = node {
            return Ok(self.cache.memory(offset as usize, size as usize)?);
        }
        let content = self.content(node)?;
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(Vec::new());
        }
        let end = (offset + size as usize).min(content.len());
        Ok(content[offset..end].to_vec())
    }

    /// Stat attributes. Regular files report the length of their current
    /// content, so the first `getattr` of a tracklog downloads it.
    pub fn attr(&self, node: &Node) -> Result<Attr, FsError> {
        if node.is_directory() {
            let nlink = 2 + self
                .children(node)?
                .iter()
                .filter(|(_, child)| child.is_directory())
                .count() as u32;
            return Ok(Attr {
                directory: true,
                perm: DIR_PERM,
                nlink,
                size: 0,
                blksize: DEFAULT_BLKSIZE,
                blocks: 0,
                atime: self.mount_time,
                mtime: self.mount_time,
                ctime: self.mount_time,
            });
        }
        match node {
            Node::MemoryFile => Ok(Attr {
                directory: false,
                perm: FILE_PERM,
                nlink: 1,
                size: MEMORY_SIZE as u64,
                blksize: MEMORY_PAGE as u32,
                blocks: blocks(MEMORY_SIZE as u64, MEMORY_PAGE as u32),
                atime: self.mount_time,
                mtime: self.mount_time,
                ctime: self.mount_time,
            }),
            Node::TracklogFile(id) => {
                let tracklog = self.tracklog(id)?;
                let size = self.content(node)?.len() as u64;
                let start = system_time(&tracklog.dt);
                let end = system_time(&(tracklog.dt + tracklog.duration));
                Ok(Attr {
                    directory: false,
                    perm: FILE_PERM,
                    nlink: 1,
                    size,
                    blksize: DEFAULT_BLKSIZE,
                    blocks: blocks(size, DEFAULT_BLKSIZE),
                    atime: end,
                    mtime: end,
                    ctime: start,
                })
            }
            Node::TracklogsZip => {
                let tracklogs = self.cache.tracklogs()?;
                let size = self.content(node)?.len() as u64;
                let start = tracklogs.iter().map(|t| t.dt).min();
                let end = tracklogs.iter().map(|t| t.dt + t.duration).max();
                let ctime = start.map_or(self.mount_time, |dt| system_time(&dt));
                let mtime = end.map_or(self.mount_time, |dt| system_time(&dt));
                Ok(Attr {
                    directory: false,
                    perm: FILE_PERM,
                    nlink: 1,
                    size,
                    blksize: DEFAULT_BLKSIZE,
                    blocks: blocks(size, DEFAULT_BLKSIZE),
                    atime: mtime,
                    mtime,
                    ctime,
                })
            }
            node => {
                let size = self.content(node)?.len() as u64;
                Ok(Attr {
                    directory: false,
                    perm: FILE_PERM,
                    nlink: 1,
                    size,
                    blksize: DEFAULT_BLKSIZE,
                    blocks: blocks(size, DEFAULT_BLKSIZE),
                    atime: self.mount_time,
                    mtime: self.mount_time,
                    ctime: self.mount_time,
                })
            }
        }
    }

    /// Delete the entity behind a file node. Routes and waypoints answer
    /// `PermissionDenied` when the cache refuses (reserved route,
    /// referenced waypoint); tracklog unlink drops cached artifacts.
    pub fn unlink(&self, node: &Node) -> Result<(), FsError> {
        match node {
            Node::RouteFile(name) => {
                let route = self.route(name)?;
                if self.cache.route_unlink(&route)? {
                    Ok(())
                } else {
                    Err(FsError::PermissionDenied)
                }
            }
            Node::WaypointFile(long_name) => {
                let waypoint = self.waypoint(long_name)?;
                if self.cache.waypoint_unlink(&waypoint)? {
                    Ok(())
                } else {
                    Err(FsError::PermissionDenied)
                }
            }
            Node::TracklogFile(id) => {
                let tracklog = self.tracklog(id)?;
                Ok(self.cache.tracklog_unlink(&tracklog)?)
            }
            _ => Err(FsError::PermissionDenied),
        }
    }

    /// Rename is supported for tracklog files only.
    pub fn rename(&self, node: &Node, new_name: &str) -> Result<(), FsError> {
        match node {
            Node::TracklogFile(id) => {
                let tracklog = self.tracklog(id)?;
                Ok(self.cache.tracklog_rename(&tracklog, new_name)?)
            }
            _ => Err(FsError::PermissionDenied),
        }
    }
}
