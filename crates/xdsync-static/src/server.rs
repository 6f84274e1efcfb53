//! Static discovery server
//!
//! Serves a [`Snapshot`] over in-process streams. Useful for development, for
//! the CLI, and for exercising the engine without a control plane.

use crate::snapshot::Snapshot;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use xdsync_core::{
    DiscoveryRequest, DiscoveryResponse, DiscoveryStream, Node, ResponseObserver, Result,
    SessionFactory, XdsError,
};

/// In-process discovery server
#[derive(Clone)]
pub struct StaticDiscoveryServer {
    state: Arc<ServerState>,
}

struct ServerState {
    snapshot: RwLock<Snapshot>,

    /// Open streams indexed by stream ID
    streams: DashMap<u64, Arc<StaticStream>>,

    /// Every request received, in arrival order
    requests: Mutex<Vec<DiscoveryRequest>>,

    /// Every response sent or pushed, in order
    responses: Mutex<Vec<DiscoveryResponse>>,

    next_stream_id: AtomicU64,
    next_nonce: AtomicU64,

    /// When false, subscription requests are recorded but never answered
    responsive: AtomicBool,

    /// When false, new streams are refused
    accepting: AtomicBool,
}

impl StaticDiscoveryServer {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            state: Arc::new(ServerState {
                snapshot: RwLock::new(snapshot),
                streams: DashMap::new(),
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
                next_stream_id: AtomicU64::new(1),
                next_nonce: AtomicU64::new(1),
                responsive: AtomicBool::new(true),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Replace the served snapshot. Open streams see it on their next request or push.
    pub fn set_snapshot(&self, snapshot: Snapshot) {
        *self
            .state
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.state.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.state.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Push the current snapshot to every open stream of `type_url`.
    /// Returns the number of streams pushed to.
    pub fn push(&self, type_url: &str) -> usize {
        let streams: Vec<Arc<StaticStream>> = self
            .state
            .streams
            .iter()
            .filter(|s| s.type_url == type_url)
            .map(|s| s.value().clone())
            .collect();

        for stream in &streams {
            let names = stream.subscribed_names();
            let response = self.state.respond(type_url, &names);
            tracing::debug!(stream = stream.id, nonce = %response.nonce, "Pushing snapshot");
            stream.observer.on_next(response);
        }
        streams.len()
    }

    /// Break every open stream. Returns the number of streams failed.
    pub fn fail_sessions(&self, reason: &str) -> usize {
        self.end_sessions(|observer| observer.on_error(XdsError::StreamClosed(reason.to_string())))
    }

    /// End every open stream cleanly. Returns the number of streams completed.
    pub fn complete_sessions(&self) -> usize {
        self.end_sessions(|observer| observer.on_completed())
    }

    fn end_sessions(&self, notify: impl Fn(&dyn ResponseObserver)) -> usize {
        let ids: Vec<u64> = self.state.streams.iter().map(|s| *s.key()).collect();
        let mut ended = 0;
        for id in ids {
            if let Some((_, stream)) = self.state.streams.remove(&id) {
                stream.closed.store(true, Ordering::SeqCst);
                notify(stream.observer.as_ref());
                ended += 1;
            }
        }
        ended
    }

    /// All requests received so far
    pub fn requests(&self) -> Vec<DiscoveryRequest> {
        self.state
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All responses sent so far
    pub fn responses(&self) -> Vec<DiscoveryResponse> {
        self.state
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// ACK and NACK requests received so far
    pub fn acks(&self) -> Vec<DiscoveryRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.response_nonce.is_some())
            .collect()
    }

    /// Total streams ever opened
    pub fn sessions_opened(&self) -> u64 {
        self.state.next_stream_id.load(Ordering::SeqCst) - 1
    }

    /// Streams currently open
    pub fn open_sessions(&self) -> usize {
        self.state.streams.len()
    }
}

impl ServerState {
    fn respond(&self, type_url: &str, names: &BTreeSet<String>) -> DiscoveryResponse {
        let response = {
            let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
            DiscoveryResponse {
                type_url: type_url.to_string(),
                version_info: snapshot.version.clone(),
                nonce: self.next_nonce.fetch_add(1, Ordering::SeqCst).to_string(),
                resources: snapshot.select(type_url, names),
            }
        };
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(response.clone());
        response
    }

    fn record(&self, request: &DiscoveryRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
    }
}

impl SessionFactory for StaticDiscoveryServer {
    fn open_session(
        &self,
        node: &Node,
        type_url: &str,
        observer: Arc<dyn ResponseObserver>,
    ) -> Result<Arc<dyn DiscoveryStream>> {
        if !self.state.accepting.load(Ordering::SeqCst) {
            return Err(XdsError::Transport("server is not accepting streams".into()));
        }

        let id = self.state.next_stream_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(stream = id, node = %node.id, type_url, "Opening static stream");

        let stream = Arc::new(StaticStream {
            id,
            type_url: type_url.to_string(),
            names: Mutex::new(BTreeSet::new()),
            observer,
            closed: AtomicBool::new(false),
            server: Arc::downgrade(&self.state),
        });
        self.state.streams.insert(id, stream.clone());
        Ok(stream)
    }
}

/// One in-process stream. Responses are delivered inline from `send`.
struct StaticStream {
    id: u64,
    type_url: String,

    /// Names from the latest subscription request
    names: Mutex<BTreeSet<String>>,

    observer: Arc<dyn ResponseObserver>,
    closed: AtomicBool,
    server: Weak<ServerState>,
}

impl StaticStream {
    fn subscribed_names(&self) -> BTreeSet<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DiscoveryStream for StaticStream {
    fn send(&self, request: DiscoveryRequest) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(XdsError::StreamClosed(format!("stream {} is closed", self.id)));
        }
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| XdsError::StreamClosed("server stopped".into()))?;

        server.record(&request);

        // ACK or NACK
        if request.response_nonce.is_some() {
            return Ok(());
        }

        *self.names.lock().unwrap_or_else(PoisonError::into_inner) =
            request.resource_names.clone();

        if !server.responsive.load(Ordering::SeqCst) {
            return Ok(());
        }

        let response = server.respond(&request.type_url, &request.resource_names);
        self.observer.on_next(response);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(server) = self.server.upgrade() {
            server.streams.remove(&self.id);
        }
    }
}
