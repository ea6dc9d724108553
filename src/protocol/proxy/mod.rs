//! Serialization proxy: funnels every device operation from the
//! filesystem's many upcall threads onto one worker thread that owns the
//! driver, and memoizes results by request value.
//!
//! Contract:
//! - identical requests execute at most once per process lifetime unless
//!   explicitly invalidated by the cache layer;
//! - device operations happen in enqueue order;
//! - concurrent identical requests collapse to one device round trip;
//! - a captured error is returned to every waiter of that request and
//!   stays cached like any other result.
use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use log::debug;

use crate::core::{Route, Snp, TracklogInfo, Waypoint};
use crate::error::{FlytecError, ProxyError};
use crate::infra::serial::RawPort;
use crate::protocol::device::Flytec;

/// Every device operation, with typed arguments. The pair of a variant
/// and its payload is the memoization key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Request {
    Snp,
    Conf,
    MemoryRead { address: u16 },
    Routes,
    RouteDelete { name: String },
    TracklogIndex,
    TracklogDownload { index: u32 },
    CurrentIgc,
    Waypoints,
    WaypointWrite(Waypoint),
    WaypointDelete { long_name: Option<String> },
}

/// Result payload matching the request variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Snp(Snp),
    Memory(Vec<u8>),
    Routes(Vec<Route>),
    Tracklogs(Vec<TracklogInfo>),
    Bytes(Vec<u8>),
    Waypoints(Vec<Waypoint>),
    /// Action commands carry no data.
    Done,
}

/// Executor behind the proxy. Implemented by the driver; tests substitute
/// counting or scripted doubles.
pub trait Backend: Send + 'static {
    fn execute(&mut self, request: &Request) -> Result<Response, FlytecError>;
}

impl<P: RawPort + Send + 'static> Backend for Flytec<P> {
    fn execute(&mut self, request: &Request) -> Result<Response, FlytecError> {
        match request {
            Request::Snp => self.pbrsnp().map(Response::Snp),
            Request::Conf => self.pbrconf().map(|()| Response::Done),
            Request::MemoryRead { address } => self.pbrmemr(*address).map(Response::Memory),
            Request::Routes => self.pbrrts().map(Response::Routes),
            Request::RouteDelete { name } => self.pbrrtx(name).map(|()| Response::Done),
            Request::TracklogIndex => self.pbrtl().map(Response::Tracklogs),
            Request::TracklogDownload { index } => self.pbrtr(*index).map(Response::Bytes),
            Request::CurrentIgc => self.pbrigc().map(Response::Bytes),
            Request::Waypoints => self.pbrwps().map(Response::Waypoints),
            Request::WaypointWrite(waypoint) => self.pbrwpr(waypoint).map(|()| Response::Done),
            Request::WaypointDelete { long_name } => {
                self.pbrwpx(long_name.as_deref()).map(|()| Response::Done)
            }
        }
    }
}

/// Readiness signal shared by every waiter of one request.
#[derive(Default)]
struct Gate {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .condvar
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn set(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.condvar.notify_all();
    }
}

type ResultMap = HashMap<Request, Result<Response, FlytecError>>;

/// Handle to the single worker thread owning the driver. Cloning is not
/// needed: the handle itself is `Sync` and shared behind an `Arc` by the
/// cache layer.
pub struct SerialProxy {
    queue: Sender<(Request, Arc<Gate>)>,
    events: Mutex<HashMap<Request, Arc<Gate>>>,
    results: Arc<Mutex<ResultMap>>,
}

impl SerialProxy {
    /// Spawn the worker thread around a backend. The thread exits when
    /// the proxy is dropped and its queue disconnects.
    pub fn new<B: Backend>(mut backend: B) -> Self {
        let (queue, incoming) = mpsc::channel::<(Request, Arc<Gate>)>();
        let results: Arc<Mutex<ResultMap>> = Arc::default();
        let worker_results = Arc::clone(&results);
        thread::Builder::new()
            .name("flytec-serial".to_string())
            .spawn(move || {
                while let Ok((request, gate)) = incoming.recv() {
                    let memoized = worker_results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .contains_key(&request);
                    if memoized {
                        debug!("coalesced {request:?}");
                    } else {
                        let result = backend.execute(&request);
                        worker_results
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(request.clone(), result);
                    }
                    gate.set();
                }
            })
            .expect("spawn serial worker");
        Self {
            queue,
            events: Mutex::new(HashMap::new()),
            results,
        }
    }

    /// Execute a request, or wait for the in-flight/memoized execution of
    /// an identical one. Errors are replayed exactly like successes.
    pub fn call(&self, request: Request) -> Result<Response, FlytecError> {
        let gate = {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            match events.get(&request) {
                Some(gate) => Arc::clone(gate),
                None => {
                    let gate = Arc::new(Gate::default());
                    // Register only after a successful enqueue, so a dead
                    // worker never leaves an unset gate behind.
                    self.queue
                        .send((request.clone(), Arc::clone(&gate)))
                        .map_err(|_| ProxyError::Disconnected)?;
                    events.insert(request.clone(), Arc::clone(&gate));
                    gate
                }
            }
        };
        gate.wait();
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request)
            .cloned()
            .unwrap_or(Err(ProxyError::Disconnected.into()))
    }

    /// Drop the memoized entry for one request so the next identical call
    /// reaches the device again. The cache layer serializes invalidation
    /// against reloads of the same request.
    pub fn invalidate(&self, request: &Request) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request);
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request);
    }
}
