//! High-level cache on top of the serial proxy: lazy in-process
//! snapshots of routes/waypoints/tracklogs, a persistent gzip'd tracklog
//! store, rename persistence, derived IGC naming, and revision-counter
//! freshness tracking.
//!
//! The cache exclusively owns the memoized lists and the on-disk cache
//! directory; every device exchange goes through the proxy it owns.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};

use crate::core::{
    self, Manufacturer, Route, Snp, Tracklog, TracklogInfo, Waypoint, TRACKLOG_ID_FORMAT,
};
use crate::error::{FlytecError, ProxyError};
use crate::infra::codec;
use crate::protocol::proxy::{Backend, Request, Response, SerialProxy};

/// Size of the instrument's parameter memory in bytes.
pub const MEMORY_SIZE: usize = 352;
/// Page granularity of `PBRMEMR` reads.
pub const MEMORY_PAGE: usize = 8;

/// Monotonic counters keyed by kind (`routes`, `waypoints`, `tracklogs`,
/// and fine per-entity kinds such as `route_<name>`). Every mutating
/// operation strictly increases the relevant counters; a stored snapshot
/// whose observed counter differs from the current one is stale.
#[derive(Debug, Default)]
pub struct Revisions {
    counters: HashMap<String, u64>,
}

impl Revisions {
    pub fn get(&self, kind: &str) -> u64 {
        self.counters.get(kind).copied().unwrap_or(0)
    }

    pub fn bump(&mut self, kind: &str) -> u64 {
        let counter = self.counters.entry(kind.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

/// One memoized list snapshot together with the revision it observed.
type Snapshot<T> = Option<(u64, Arc<Vec<T>>)>;

#[derive(Default)]
struct CacheState {
    revs: Revisions,
    routes: Snapshot<Route>,
    waypoints: Snapshot<Waypoint>,
    tracklogs: Snapshot<Tracklog>,
    /// Downloaded IGC bodies keyed by tracklog stable id.
    bodies: HashMap<String, Arc<Vec<u8>>>,
    /// Parameter-memory pages keyed by their start address. Entries are
    /// only ever written when absent.
    memory: HashMap<u16, Vec<u8>>,
}

/// Cache façade owning the proxy, the identity record, and the per
/// instrument cache directory.
pub struct FlytecCache {
    proxy: SerialProxy,
    snp: Snp,
    manufacturer: Manufacturer,
    cachedir: PathBuf,
    state: Mutex<CacheState>,
    /// Serializes invalidate-then-refetch sequences so a stale snapshot
    /// is reloaded once, not raced.
    reload: Mutex<()>,
}

impl FlytecCache {
    /// Wrap a backend. Reads the identity record immediately; the cache
    /// directory is `<base>/<instrument>/<serial>`.
    pub fn new<B: Backend>(backend: B, base: &Path) -> Result<Self, FlytecError> {
        let proxy = SerialProxy::new(backend);
        let snp = match proxy.call(Request::Snp)? {
            Response::Snp(snp) => snp,
            _ => return Err(ProxyError::UnexpectedResponse.into()),
        };
        let manufacturer = core::manufacturer(&snp.instrument);
        let cachedir = base.join(&snp.instrument).join(&snp.serial_number);
        Ok(Self {
            proxy,
            snp,
            manufacturer,
            cachedir,
            state: Mutex::new(CacheState::default()),
            reload: Mutex::new(()),
        })
    }

    pub fn snp(&self) -> &Snp {
        &self.snp
    }

    pub fn manufacturer(&self) -> Manufacturer {
        self.manufacturer
    }

    /// Current counter for a revision kind. Exposed for the tree layer's
    /// derived-artifact memos and for tests.
    pub fn revision(&self, kind: &str) -> u64 {
        self.lock_state().revs.get(kind)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn contents_dir(&self) -> PathBuf {
        self.cachedir.join("tracklogs").join("contents")
    }

    fn rename_dir(&self) -> PathBuf {
        self.cachedir.join("tracklogs").join("rename")
    }

    //==============================================================SNAPSHOTS

    /// Route list, refetched when a mutation has bumped `routes`.
    pub fn routes(&self) -> Result<Arc<Vec<Route>>, FlytecError> {
        {
            let state = self.lock_state();
            if let Some((observed, routes)) = &state.routes {
                if *observed == state.revs.get("routes") {
                    return Ok(Arc::clone(routes));
                }
            }
        }
        let _reload = self.reload.lock().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have reloaded while this one waited.
        let current = {
            let state = self.lock_state();
            if let Some((observed, routes)) = &state.routes {
                if *observed == state.revs.get("routes") {
                    return Ok(Arc::clone(routes));
                }
            }
            state.revs.get("routes")
        };
        self.proxy.invalidate(&Request::Routes);
        let routes = match self.proxy.call(Request::Routes)? {
            Response::Routes(routes) => Arc::new(routes),
            _ => return Err(ProxyError::UnexpectedResponse.into()),
        };
        self.lock_state().routes = Some((current, Arc::clone(&routes)));
        Ok(routes)
    }

    /// Waypoint list, refetched when a mutation has bumped `waypoints`.
    pub fn waypoints(&self) -> Result<Arc<Vec<Waypoint>>, FlytecError> {
        {
            let state = self.lock_state();
            if let Some((observed, waypoints)) = &state.waypoints {
                if *observed == state.revs.get("waypoints") {
                    return Ok(Arc::clone(waypoints));
                }
            }
        }
        let _reload = self.reload.lock().unwrap_or_else(PoisonError::into_inner);
        let current = {
            let state = self.lock_state();
            if let Some((observed, waypoints)) = &state.waypoints {
                if *observed == state.revs.get("waypoints") {
                    return Ok(Arc::clone(waypoints));
                }
            }
            state.revs.get("waypoints")
        };
        self.proxy.invalidate(&Request::Waypoints);
        let waypoints = match self.proxy.call(Request::Waypoints)? {
            Response::Waypoints(waypoints) => Arc::new(waypoints),
            _ => return Err(ProxyError::UnexpectedResponse.into()),
        };
        self.lock_state().waypoints = Some((current, Arc::clone(&waypoints)));
        Ok(waypoints)
    }

    /// Look up one waypoint by its long name.
    pub fn waypoint(&self, long_name: &str) -> Result<Option<Waypoint>, FlytecError> {
        let waypoints = self.waypoints()?;
        Ok(waypoints
            .iter()
            .find(|waypoint| waypoint.long_name == long_name)
            .cloned())
    }

    /// Tracklog index with derived naming. Sibling-indexes are computed
    /// over the union of device start times and start times recovered
    /// from the contents directory, so a tracklog that was deleted from
    /// the device keeps contributing to stable numbering.
    pub fn tracklogs(&self) -> Result<Arc<Vec<Tracklog>>, FlytecError> {
        {
            let state = self.lock_state();
            if let Some((observed, tracklogs)) = &state.tracklogs {
                if *observed == state.revs.get("tracklogs") {
                    return Ok(Arc::clone(tracklogs));
                }
            }
        }
        let _reload = self.reload.lock().unwrap_or_else(PoisonError::into_inner);
        let current = {
            let state = self.lock_state();
            if let Some((observed, tracklogs)) = &state.tracklogs {
                if *observed == state.revs.get("tracklogs") {
                    return Ok(Arc::clone(tracklogs));
                }
            }
            state.revs.get("tracklogs")
        };
        self.proxy.invalidate(&Request::TracklogIndex);
        let infos = match self.proxy.call(Request::TracklogIndex)? {
            Response::Tracklogs(infos) => infos,
            _ => return Err(ProxyError::UnexpectedResponse.into()),
        };
        let tracklogs = Arc::new(self.derive_names(infos));
        self.lock_state().tracklogs = Some((current, Arc::clone(&tracklogs)));
        Ok(tracklogs)
    }

    fn derive_names(&self, infos: Vec<TracklogInfo>) -> Vec<Tracklog> {
        // Exact duplicates collapse: a cached copy of a tracklog that is
        // still on the device must not shift anyone's rank.
        let mut union: BTreeSet<DateTime<Utc>> = infos.iter().map(|info| info.dt).collect();
        union.extend(self.cached_datetimes());
        let mut by_date: BTreeMap<chrono::NaiveDate, Vec<DateTime<Utc>>> = BTreeMap::new();
        for dt in &union {
            by_date.entry(dt.date_naive()).or_default().push(*dt);
        }
        let mut rank = HashMap::new();
        for datetimes in by_date.values() {
            for (position, dt) in datetimes.iter().enumerate() {
                rank.insert(*dt, position as u32 + 1);
            }
        }
        let serial = self.snp.serial_number.trim_start_matches('0');
        infos
            .into_iter()
            .map(|info| {
                let id = core::tracklog_id(&info.dt);
                let igc_filename =
                    core::igc_filename(&info.dt, self.manufacturer.code, serial, rank[&info.dt]);
                let filename = self.renamed(&id).unwrap_or_else(|| igc_filename.clone());
                Tracklog {
                    count: info.count,
                    index: info.index,
                    dt: info.dt,
                    duration: info.duration,
                    id,
                    igc_filename,
                    filename,
                }
            })
            .collect()
    }

    /// Start times recovered from previously cached bodies.
    fn cached_datetimes(&self) -> Vec<DateTime<Utc>> {
        let Ok(entries) = fs::read_dir(self.contents_dir()) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                NaiveDateTime::parse_from_str(&name.to_string_lossy(), TRACKLOG_ID_FORMAT)
                    .ok()
                    .map(|naive| naive.and_utc())
            })
            .collect()
    }

    /// User filename persisted for a tracklog id, if any.
    fn renamed(&self, id: &str) -> Option<String> {
        fs::read_link(self.rename_dir().join(id))
            .ok()
            .map(|target| target.to_string_lossy().into_owned())
    }

    //==================================================================BODIES

    /// IGC body of one tracklog: in-process copy, then the gzip'd cache
    /// file, then the device. A fresh download is persisted through a
    /// sibling temp file; cache-write failures are swallowed because the
    /// body is already in hand.
    pub fn tracklog(&self, tracklog: &Tracklog) -> Result<Arc<Vec<u8>>, FlytecError> {
        if let Some(body) = self.lock_state().bodies.get(&tracklog.id) {
            return Ok(Arc::clone(body));
        }
        if let Some(body) = self.read_body(&tracklog.id) {
            let body = Arc::new(body);
            self.lock_state()
                .bodies
                .insert(tracklog.id.clone(), Arc::clone(&body));
            return Ok(body);
        }
        let body = match self.proxy.call(Request::TracklogDownload {
            index: tracklog.index,
        })? {
            Response::Bytes(body) => Arc::new(body),
            _ => return Err(ProxyError::UnexpectedResponse.into()),
        };
        if let Err(error) = self.write_body(&tracklog.id, &body) {
            warn!("cannot cache tracklog {}: {error}", tracklog.id);
        }
        self.lock_state()
            .bodies
            .insert(tracklog.id.clone(), Arc::clone(&body));
        Ok(body)
    }

    fn read_body(&self, id: &str) -> Option<Vec<u8>> {
        let path = self.contents_dir().join(id);
        let file = File::open(&path).ok()?;
        let mut body = Vec::new();
        match GzDecoder::new(file).read_to_end(&mut body) {
            Ok(_) => {
                debug!("tracklog {id} served from {}", path.display());
                Some(body)
            }
            Err(error) => {
                warn!("unreadable cache entry {}: {error}", path.display());
                None
            }
        }
    }

    fn write_body(&self, id: &str, body: &[u8]) -> std::io::Result<()> {
        let dir = self.contents_dir();
        fs::create_dir_all(&dir)?;
        let temp = tempfile::NamedTempFile::new_in(&dir)?;
        let mut encoder = GzEncoder::new(temp, Compression::best());
        encoder.write_all(body)?;
        let temp = encoder.finish()?;
        temp.persist(dir.join(id)).map_err(|error| error.error)?;
        Ok(())
    }

    //===============================================================MUTATIONS

    /// Delete a route from the device. Returns `false` without issuing a
    /// device command when the route is the reserved competition route.
    pub fn route_unlink(&self, route: &Route) -> Result<bool, FlytecError> {
        if route.index == 0 {
            return Ok(false);
        }
        self.proxy.call(Request::RouteDelete {
            name: route.name.clone(),
        })?;
        let mut state = self.lock_state();
        state.revs.bump("routes");
        state.revs.bump(&format!("route_{}", route.name.trim_end()));
        Ok(true)
    }

    /// Upload a waypoint. Names are scrubbed to printable ASCII first.
    pub fn waypoint_create(&self, waypoint: &Waypoint) -> Result<(), FlytecError> {
        let waypoint = Waypoint {
            short_name: codec::scrub(&waypoint.short_name),
            long_name: codec::scrub(&waypoint.long_name),
            ..waypoint.clone()
        };
        let long_name = waypoint.long_name.clone();
        self.proxy.call(Request::WaypointWrite(waypoint))?;
        let mut state = self.lock_state();
        state.revs.bump("waypoints");
        state
            .revs
            .bump(&format!("waypoint_{}", long_name.trim_end()));
        Ok(())
    }

    /// Delete a waypoint from the device. Returns `false` without any
    /// device command while a route still references the long name.
    pub fn waypoint_unlink(&self, waypoint: &Waypoint) -> Result<bool, FlytecError> {
        let routes = self.routes()?;
        let referenced = routes.iter().any(|route| {
            route
                .routepoints
                .iter()
                .any(|routepoint| routepoint.long_name == waypoint.long_name)
        });
        if referenced {
            return Ok(false);
        }
        self.proxy.call(Request::WaypointDelete {
            long_name: Some(waypoint.long_name.clone()),
        })?;
        let mut state = self.lock_state();
        state.revs.bump("waypoints");
        state
            .revs
            .bump(&format!("waypoint_{}", waypoint.long_name.trim_end()));
        Ok(true)
    }

    /// Persist a user-chosen filename as the symlink target of
    /// `rename/<id>`.
    pub fn tracklog_rename(&self, tracklog: &Tracklog, name: &str) -> std::io::Result<()> {
        let scrubbed = codec::scrub(name);
        let dir = self.rename_dir();
        fs::create_dir_all(&dir)?;
        let link = dir.join(&tracklog.id);
        match fs::remove_file(&link) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error),
        }
        std::os::unix::fs::symlink(&scrubbed, &link)?;
        let mut state = self.lock_state();
        state.revs.bump("tracklogs");
        state.revs.bump(&format!("tracklog_{}", tracklog.id));
        Ok(())
    }

    /// Drop the cached artifacts of a tracklog. The protocol offers no
    /// body deletion, so the entry reappears from the device while it
    /// remains on the instrument.
    pub fn tracklog_unlink(&self, tracklog: &Tracklog) -> std::io::Result<()> {
        for path in [
            self.contents_dir().join(&tracklog.id),
            self.rename_dir().join(&tracklog.id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }
        }
        let mut state = self.lock_state();
        state.bodies.remove(&tracklog.id);
        state.revs.bump("tracklogs");
        state.revs.bump(&format!("tracklog_{}", tracklog.id));
        Ok(())
    }

    //==================================================================MEMORY

    /// Byte view over the 352-byte parameter memory, assembled from
    /// demand-read 8-byte pages. A short page ends the read early; the
    /// result may be shorter than requested at the tail.
    pub fn memory(&self, offset: usize, size: usize) -> Result<Vec<u8>, FlytecError> {
        if offset >= MEMORY_SIZE {
            return Ok(Vec::new());
        }
        let end = (offset + size).min(MEMORY_SIZE);
        let mut view = Vec::with_capacity(end - offset);
        let mut address = offset - offset % MEMORY_PAGE;
        while address < end {
            let page = self.page(address as u16)?;
            if page.is_empty() {
                break;
            }
            let start = address.max(offset);
            let stop = (address + page.len()).min(end);
            if start < stop {
                view.extend_from_slice(&page[start - address..stop - address]);
            }
            if page.len() < MEMORY_PAGE {
                break;
            }
            address += page.len();
        }
        Ok(view)
    }

    /// One memory page, reused from the page cache when present.
    fn page(&self, address: u16) -> Result<Vec<u8>, FlytecError> {
        if let Some(page) = self.lock_state().memory.get(&address) {
            return Ok(page.clone());
        }
        let page = match self.proxy.call(Request::MemoryRead { address })? {
            Response::Memory(page) => page,
            _ => return Err(ProxyError::UnexpectedResponse.into()),
        };
        // Pages overwrite a cached entry only when absent.
        Ok(self
            .lock_state()
            .memory
            .entry(address)
            .or_insert(page)
            .clone())
    }
}
