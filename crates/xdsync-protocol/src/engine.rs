//! Discovery protocol engine
//!
//! Correlates discovery responses with the callers waiting on them and
//! acknowledges every response it receives. Three id-indexed tables carry all
//! shared state: pending calls, sessions, and the resource names tracked per
//! subscription.
//!
//! A transport only enqueues events for a session; a per-session task owned by
//! the engine decodes, acknowledges and delivers them.

use crate::decoder::{decode_response, Decoded, ResourceDecoder};
use crate::filter::{FilterChain, ResolveFilter};
use crate::scheduler::{ResyncScheduler, ResyncState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use xdsync_core::{
    AckPolicy, DiscoveryRequest, DiscoveryResponse, DiscoveryStream, ErrorDetail, Node,
    ResponseObserver, Result, SessionFactory, SubscriptionId, XdsConfig, XdsError,
};

/// Callback receiving every batch delivered to a durable subscription
pub type Consumer<R> = Arc<dyn Fn(Vec<R>) + Send + Sync>;

/// Sizes of the engine's tables
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EngineStats {
    pub subscriptions: usize,
    pub pending_calls: usize,
    pub sessions: usize,
    pub tracked_names: usize,
}

enum SubscriptionKind<R> {
    OneShot,
    Durable { consumer: Consumer<R> },
}

/// A caller waiting for the answer to one request
struct PendingCall<R> {
    /// Session the request went out on
    generation: u64,

    /// Names carried by the request
    resource_names: BTreeSet<String>,

    sender: oneshot::Sender<Vec<R>>,
}

struct SessionSlot {
    /// Distinguishes successive sessions of the same subscription
    generation: u64,
    stream: Arc<dyn DiscoveryStream>,
}

/// Where a decoded response goes
enum Delivery<R> {
    /// Answer to an explicit fetch
    Solicited(PendingCall<R>),
    /// Unsolicited push to a durable subscription
    Pushed(Consumer<R>),
    /// Nobody is listening
    Orphaned,
}

enum SessionEvent {
    Response(DiscoveryResponse),
    Error(XdsError),
    Completed,
}

/// Observer handed to the transport. Only enqueues.
struct SessionEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ResponseObserver for SessionEvents {
    fn on_next(&self, response: DiscoveryResponse) {
        let _ = self.tx.send(SessionEvent::Response(response));
    }

    fn on_error(&self, error: XdsError) {
        let _ = self.tx.send(SessionEvent::Error(error));
    }

    fn on_completed(&self) {
        let _ = self.tx.send(SessionEvent::Completed);
    }
}

/// Builder for [`XdsEngine`]
pub struct XdsEngineBuilder<D: ResourceDecoder> {
    config: XdsConfig,
    decoder: D,
    factory: Arc<dyn SessionFactory>,
    node: Option<Arc<Node>>,
    filters: FilterChain<D::Resource>,
}

impl<D: ResourceDecoder> XdsEngineBuilder<D> {
    /// Use an explicit node identity instead of deriving one from the config
    pub fn node(mut self, node: Arc<Node>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn filter(mut self, filter: Arc<dyn ResolveFilter<D::Resource>>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> Result<XdsEngine<D>> {
        self.config.validate()?;

        let node = self
            .node
            .unwrap_or_else(|| Node::from_config(&self.config.node));
        let scheduler =
            ResyncScheduler::new(self.config.polling_interval, self.config.polling_pool_size);

        tracing::info!(
            node = %node.id,
            type_url = self.decoder.type_url(),
            polling_interval = ?self.config.polling_interval,
            "Created discovery engine"
        );

        Ok(XdsEngine {
            inner: Arc::new(EngineInner {
                node,
                config: self.config,
                decoder: self.decoder,
                factory: self.factory,
                filters: self.filters,
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                subscriptions: DashMap::new(),
                pending: DashMap::new(),
                sessions: DashMap::new(),
                tracked_names: DashMap::new(),
                accepted_versions: DashMap::new(),
                dependent_names: DashMap::new(),
                scheduler,
            }),
        })
    }
}

/// Keeps one resource type in sync with a discovery service
pub struct XdsEngine<D: ResourceDecoder> {
    inner: Arc<EngineInner<D>>,
}

impl<D: ResourceDecoder> Clone for XdsEngine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct EngineInner<D: ResourceDecoder> {
    node: Arc<Node>,
    config: XdsConfig,
    decoder: D,
    factory: Arc<dyn SessionFactory>,
    filters: FilterChain<D::Resource>,

    /// Next subscription ID
    next_id: AtomicU64,

    /// Next session generation
    next_generation: AtomicU64,

    subscriptions: DashMap<SubscriptionId, SubscriptionKind<D::Resource>>,

    /// Callers waiting for a response
    pending: DashMap<SubscriptionId, PendingCall<D::Resource>>,

    /// Open sessions
    sessions: DashMap<SubscriptionId, SessionSlot>,

    /// Current resource names per subscription
    tracked_names: DashMap<SubscriptionId, BTreeSet<String>>,

    /// Last version acknowledged per subscription
    accepted_versions: DashMap<SubscriptionId, String>,

    /// Names resolved from the last decoded batch
    dependent_names: DashMap<SubscriptionId, BTreeSet<String>>,

    scheduler: ResyncScheduler,
}

impl<D: ResourceDecoder> XdsEngine<D> {
    pub fn builder(
        config: XdsConfig,
        decoder: D,
        factory: Arc<dyn SessionFactory>,
    ) -> XdsEngineBuilder<D> {
        XdsEngineBuilder {
            config,
            decoder,
            factory,
            node: None,
            filters: FilterChain::new(),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.inner.node
    }

    pub fn type_url(&self) -> &str {
        self.inner.decoder.type_url()
    }

    /// Subscribe durably to `resource_names`.
    ///
    /// `consumer` is invoked once with the result of an initial fetch before
    /// this returns, then with every server push and every resync result for
    /// the rest of the engine's life. Failures are logged and delivered as an
    /// empty batch.
    pub async fn observe_resource<F>(
        &self,
        resource_names: BTreeSet<String>,
        consumer: F,
    ) -> SubscriptionId
    where
        F: Fn(Vec<D::Resource>) + Send + Sync + 'static,
    {
        let consumer: Consumer<D::Resource> = Arc::new(consumer);
        let id = self.inner.allocate_id();
        self.inner.subscriptions.insert(
            id,
            SubscriptionKind::Durable {
                consumer: consumer.clone(),
            },
        );

        tracing::debug!(subscription = %id, names = ?resource_names, "Observing resources");

        let timeout = self.inner.config.request_timeout;
        let initial = self.inner.fetch_or_empty(id, resource_names.clone(), timeout).await;
        deliver(&consumer, id, initial);

        if self.inner.config.polling_enabled {
            let engine = Arc::downgrade(&self.inner);
            self.inner.scheduler.schedule(id, move || {
                resync_tick(engine.clone(), id, resource_names.clone(), consumer.clone())
            });
        }

        id
    }

    /// Fetch `resource_names` once, bounded by the configured request timeout.
    pub async fn get_resource(&self, resource_names: BTreeSet<String>) -> Result<Vec<D::Resource>> {
        self.get_resource_with_timeout(resource_names, self.inner.config.request_timeout)
            .await
    }

    /// Fetch `resource_names` once.
    ///
    /// Returns an empty batch if the stream fails before a response arrives and
    /// [`XdsError::Timeout`] if nothing arrives within `timeout`. Every trace of
    /// the call is gone from the engine when this returns or is dropped.
    pub async fn get_resource_with_timeout(
        &self,
        resource_names: BTreeSet<String>,
        timeout: Duration,
    ) -> Result<Vec<D::Resource>> {
        let id = self.inner.allocate_id();
        self.inner.subscriptions.insert(id, SubscriptionKind::OneShot);
        let _cleanup = OneShotCleanup {
            inner: &self.inner,
            id,
        };

        self.inner.fetch_once(id, resource_names, timeout).await
    }

    /// Names referenced by the last batch decoded for `id`
    pub fn dependent_resource_names(&self, id: SubscriptionId) -> BTreeSet<String> {
        self.inner
            .dependent_names
            .get(&id)
            .map(|names| names.value().clone())
            .unwrap_or_default()
    }

    pub fn resync_state(&self, id: SubscriptionId) -> Option<ResyncState> {
        self.inner.scheduler.state(id)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            subscriptions: self.inner.subscriptions.len(),
            pending_calls: self.inner.pending.len(),
            sessions: self.inner.sessions.len(),
            tracked_names: self.inner.tracked_names.len(),
        }
    }

    /// Stop all resync tasks and close every session
    pub fn shutdown(&self) {
        tracing::info!(type_url = self.type_url(), "Shutting down discovery engine");
        self.inner.scheduler.shutdown();

        let ids: Vec<SubscriptionId> = self.inner.sessions.iter().map(|s| *s.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.inner.sessions.remove(&id) {
                slot.stream.close();
            }
        }
    }
}

async fn resync_tick<D: ResourceDecoder>(
    engine: Weak<EngineInner<D>>,
    id: SubscriptionId,
    resource_names: BTreeSet<String>,
    consumer: Consumer<D::Resource>,
) -> ControlFlow<()> {
    let Some(inner) = engine.upgrade() else {
        return ControlFlow::Break(());
    };

    let timeout = inner.config.request_timeout;
    let resources = inner.fetch_or_empty(id, resource_names, timeout).await;
    deliver(&consumer, id, resources);
    ControlFlow::Continue(())
}

/// Hand a batch to a consumer. A panic is contained to this one delivery.
fn deliver<R>(consumer: &Consumer<R>, id: SubscriptionId, resources: Vec<R>) {
    if catch_unwind(AssertUnwindSafe(|| consumer(resources))).is_err() {
        tracing::error!(subscription = %id, "Resource consumer panicked");
    }
}

impl<D: ResourceDecoder> EngineInner<D> {
    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// One request/response cycle on the session for `id`
    async fn fetch_once(
        self: &Arc<Self>,
        id: SubscriptionId,
        resource_names: BTreeSet<String>,
        timeout: Duration,
    ) -> Result<Vec<D::Resource>> {
        self.tracked_names.insert(id, resource_names.clone());
        let (generation, stream) = self.session(id)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                generation,
                resource_names: resource_names.clone(),
                sender: tx,
            },
        );
        let _pending = PendingGuard {
            pending: &self.pending,
            id,
        };

        let request =
            DiscoveryRequest::subscribe(self.node.clone(), self.decoder.type_url(), resource_names);
        if let Err(e) = stream.send(request) {
            // The stream is unusable; the next fetch opens a fresh one
            self.discard_session(id, generation);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resources)) => Ok(resources),
            // Pending call dropped without an answer
            Ok(Err(_)) => Ok(Vec::new()),
            Err(_) => {
                tracing::warn!(subscription = %id, ?timeout, "Discovery request timed out");
                Err(XdsError::Timeout)
            }
        }
    }

    async fn fetch_or_empty(
        self: &Arc<Self>,
        id: SubscriptionId,
        resource_names: BTreeSet<String>,
        timeout: Duration,
    ) -> Vec<D::Resource> {
        match self.fetch_once(id, resource_names, timeout).await {
            Ok(resources) => resources,
            Err(e) if e.is_retriable() => {
                tracing::warn!(subscription = %id, error = %e, "Fetch failed, retrying on next resync");
                Vec::new()
            }
            Err(e) => {
                tracing::error!(subscription = %id, error = %e, "Failed to fetch resources");
                Vec::new()
            }
        }
    }

    /// Session for `id`, opened if absent
    fn session(self: &Arc<Self>, id: SubscriptionId) -> Result<(u64, Arc<dyn DiscoveryStream>)> {
        if let Some(slot) = self.sessions.get(&id) {
            return Ok((slot.generation, slot.stream.clone()));
        }

        // The factory may block; no shard lock is held while it runs
        let opened = self.open_session(id)?;
        let (current, lost) = match self.sessions.entry(id) {
            Entry::Occupied(entry) => {
                let slot = entry.get();
                ((slot.generation, slot.stream.clone()), Some(opened))
            }
            Entry::Vacant(entry) => {
                let current = (opened.generation, opened.stream.clone());
                entry.insert(opened);
                (current, None)
            }
        };

        if let Some(lost) = lost {
            tracing::debug!(subscription = %id, generation = lost.generation, "Closing redundant session");
            lost.stream.close();
        }
        Ok(current)
    }

    fn open_session(self: &Arc<Self>, id: SubscriptionId) -> Result<SessionSlot> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let stream = self.factory.open_session(
            &self.node,
            self.decoder.type_url(),
            Arc::new(SessionEvents { tx }),
        )?;

        tokio::spawn(dispatch_events(Arc::downgrade(self), id, generation, rx));
        tracing::debug!(subscription = %id, generation, "Opened discovery session");

        Ok(SessionSlot { generation, stream })
    }

    /// Remove the session for `id` if it is still `generation`
    fn discard_session(&self, id: SubscriptionId, generation: u64) -> bool {
        match self.sessions.remove_if(&id, |_, slot| slot.generation == generation) {
            Some((_, slot)) => {
                slot.stream.close();
                true
            }
            None => false,
        }
    }

    fn is_current(&self, id: SubscriptionId, generation: u64) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|slot| slot.generation == generation)
    }

    fn on_response(&self, id: SubscriptionId, generation: u64, response: DiscoveryResponse) {
        if !self.is_current(id, generation) {
            tracing::debug!(
                subscription = %id,
                generation,
                nonce = %response.nonce,
                "Dropping response from a replaced session"
            );
            return;
        }

        if self.config.log_xds {
            tracing::info!(
                subscription = %id,
                type_url = %response.type_url,
                version = %response.version_info,
                nonce = %response.nonce,
                resources = response.resources.len(),
                "Received discovery response"
            );
        } else {
            tracing::debug!(subscription = %id, nonce = %response.nonce, "Received discovery response");
        }

        let decoded = decode_response(&self.decoder, &response);
        for failure in &decoded.failures {
            tracing::warn!(subscription = %id, error = %failure, "Failed to decode resource");
        }

        self.filters.run(&decoded.resources);
        self.dependent_names
            .insert(id, self.decoder.resolve_resource_names(&decoded.resources));

        let delivery = self.route(id, generation);
        let ack_names = match &delivery {
            Delivery::Solicited(call) => call.resource_names.clone(),
            _ => self
                .tracked_names
                .get(&id)
                .map(|names| names.value().clone())
                .unwrap_or_default(),
        };
        self.acknowledge(id, generation, &response, ack_names, &decoded);

        match delivery {
            Delivery::Solicited(call) => {
                let _ = call.sender.send(decoded.resources);
            }
            Delivery::Pushed(consumer) => deliver(&consumer, id, decoded.resources),
            Delivery::Orphaned => {
                tracing::debug!(subscription = %id, "Dropping response nobody is waiting for");
            }
        }
    }

    fn route(&self, id: SubscriptionId, generation: u64) -> Delivery<D::Resource> {
        if let Some((_, call)) = self
            .pending
            .remove_if(&id, |_, call| call.generation == generation)
        {
            return Delivery::Solicited(call);
        }

        match self.subscriptions.get(&id).as_deref() {
            Some(SubscriptionKind::Durable { consumer }) => Delivery::Pushed(consumer.clone()),
            Some(SubscriptionKind::OneShot) | None => Delivery::Orphaned,
        }
    }

    /// Answer `response` on the session it arrived on
    fn acknowledge(
        &self,
        id: SubscriptionId,
        generation: u64,
        response: &DiscoveryResponse,
        resource_names: BTreeSet<String>,
        decoded: &Decoded<D::Resource>,
    ) {
        let stream = self
            .sessions
            .get(&id)
            .filter(|slot| slot.generation == generation)
            .map(|slot| slot.stream.clone());
        let Some(stream) = stream else {
            tracing::debug!(subscription = %id, generation, "Session gone, skipping acknowledgement");
            return;
        };

        let nack = self.config.ack_policy == AckPolicy::NackOnDecodeError && !decoded.is_clean();
        let request = if nack {
            let accepted = self
                .accepted_versions
                .get(&id)
                .map(|v| v.value().clone())
                .unwrap_or_default();
            DiscoveryRequest::nack(
                self.node.clone(),
                response,
                resource_names,
                accepted,
                ErrorDetail::invalid_argument(decoded.failure_summary()),
            )
        } else {
            self.accepted_versions
                .insert(id, response.version_info.clone());
            DiscoveryRequest::ack(self.node.clone(), response, resource_names)
        };

        if self.config.log_xds {
            tracing::info!(subscription = %id, nonce = %response.nonce, nack, "Sending acknowledgement");
        }
        if let Err(e) = stream.send(request) {
            tracing::warn!(subscription = %id, error = %e, "Failed to send acknowledgement");
        }
    }

    fn on_error(&self, id: SubscriptionId, generation: u64, error: XdsError) {
        tracing::error!(subscription = %id, generation, error = %error, "Discovery stream failed");
        self.teardown(id, generation);
    }

    fn on_completed(&self, id: SubscriptionId, generation: u64) {
        tracing::info!(subscription = %id, generation, "Discovery stream completed by server");
        self.teardown(id, generation);
    }

    /// Unblock the pending call of `generation` and drop its session
    fn teardown(&self, id: SubscriptionId, generation: u64) {
        if let Some((_, call)) = self
            .pending
            .remove_if(&id, |_, call| call.generation == generation)
        {
            let _ = call.sender.send(Vec::new());
        }

        if self.discard_session(id, generation) {
            self.tracked_names.remove(&id);
        } else {
            tracing::debug!(subscription = %id, generation, "Session already replaced");
        }
    }
}

/// Drains one session's events until it fails or the transport lets go of it
async fn dispatch_events<D: ResourceDecoder>(
    engine: Weak<EngineInner<D>>,
    id: SubscriptionId,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
) {
    let mut guard = DispatchGuard {
        engine: engine.clone(),
        id,
        generation,
        finished: false,
    };

    while let Some(event) = rx.recv().await {
        let Some(inner) = engine.upgrade() else {
            return;
        };
        match event {
            SessionEvent::Response(response) => inner.on_response(id, generation, response),
            SessionEvent::Error(error) => {
                guard.finished = true;
                inner.on_error(id, generation, error);
                return;
            }
            SessionEvent::Completed => {
                guard.finished = true;
                inner.on_completed(id, generation);
                return;
            }
        }
    }
}

/// Tears the session down when its event task ends without a terminal event,
/// including by panic
struct DispatchGuard<D: ResourceDecoder> {
    engine: Weak<EngineInner<D>>,
    id: SubscriptionId,
    generation: u64,
    finished: bool,
}

impl<D: ResourceDecoder> Drop for DispatchGuard<D> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(inner) = self.engine.upgrade() else {
            return;
        };
        if std::thread::panicking() {
            tracing::error!(subscription = %self.id, generation = self.generation, "Session event task panicked");
        } else {
            tracing::debug!(subscription = %self.id, generation = self.generation, "Session event task stopped");
        }
        inner.teardown(self.id, self.generation);
    }
}

struct PendingGuard<'a, R> {
    pending: &'a DashMap<SubscriptionId, PendingCall<R>>,
    id: SubscriptionId,
}

impl<R> Drop for PendingGuard<'_, R> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Removes every table entry of a one-shot fetch
struct OneShotCleanup<'a, D: ResourceDecoder> {
    inner: &'a Arc<EngineInner<D>>,
    id: SubscriptionId,
}

impl<D: ResourceDecoder> Drop for OneShotCleanup<'_, D> {
    fn drop(&mut self) {
        let inner = self.inner;
        inner.pending.remove(&self.id);
        inner.tracked_names.remove(&self.id);
        inner.accepted_versions.remove(&self.id);
        inner.dependent_names.remove(&self.id);
        inner.subscriptions.remove(&self.id);
        if let Some((_, slot)) = inner.sessions.remove(&self.id) {
            slot.stream.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicBool;
    use std::sync::{Mutex, OnceLock};
    use xdsync_core::{LDS_TYPE_URL, RDS_TYPE_URL};
    use xdsync_static::{Snapshot, StaticDiscoveryServer};

    type Engine = XdsEngine<crate::JsonDecoder<Value>>;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn config() -> XdsConfig {
        XdsConfig {
            request_timeout: Duration::from_secs(5),
            ..XdsConfig::default()
        }
    }

    fn snapshot(version: &str, resources: &[&str]) -> Snapshot {
        resources.iter().fold(Snapshot::new(version), |s, name| {
            s.with_resource(LDS_TYPE_URL, json!({ "name": name }))
        })
    }

    fn engine_with(server: &StaticDiscoveryServer, config: XdsConfig) -> Engine {
        XdsEngine::builder(
            config,
            crate::JsonDecoder::new(LDS_TYPE_URL),
            Arc::new(server.clone()),
        )
        .build()
        .unwrap()
    }

    fn resource_names_of(resources: &[Value]) -> Vec<String> {
        resources
            .iter()
            .filter_map(|r| r["name"].as_str().map(str::to_string))
            .collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_observe_delivers_before_returning() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let engine = engine_with(&server, config());

        let calls: Arc<Mutex<Vec<Vec<Value>>>> = Default::default();
        let sink = calls.clone();
        engine
            .observe_resource(names(&["svcA"]), move |resources| {
                sink.lock().unwrap().push(resources)
            })
            .await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(resource_names_of(&calls[0]), vec!["svcA"]);
    }

    #[tokio::test]
    async fn test_push_reaches_consumer_and_is_acked_once() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["R1"]));
        let engine = engine_with(&server, config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .observe_resource(names(&["R1", "R2"]), move |resources| {
                let _ = tx.send(resources);
            })
            .await;
        let first = rx.recv().await.unwrap();
        assert_eq!(resource_names_of(&first), vec!["R1"]);

        server.set_snapshot(snapshot("2", &["R1", "R2"]));
        assert_eq!(server.push(LDS_TYPE_URL), 1);

        let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resource_names_of(&pushed), vec!["R1", "R2"]);

        let push = server.responses().pop().unwrap();
        let acks = server.acks();
        assert_eq!(acks.len(), 2);

        let push_acks: Vec<_> = acks
            .iter()
            .filter(|a| a.response_nonce.as_deref() == Some(push.nonce.as_str()))
            .collect();
        assert_eq!(push_acks.len(), 1);
        assert!(push_acks[0].is_ack());
        assert_eq!(push_acks[0].version_info.as_deref(), Some("2"));
        assert_eq!(push_acks[0].resource_names, names(&["R1", "R2"]));
    }

    #[tokio::test]
    async fn test_stream_error_unblocks_get_resource() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcB"]));
        server.set_responsive(false);
        let engine = engine_with(&server, config());

        let caller = engine.clone();
        let handle = tokio::spawn(async move { caller.get_resource(names(&["svcB"])).await });

        wait_until(|| server.requests().len() == 1).await;
        assert_eq!(engine.stats().pending_calls, 1);
        assert_eq!(server.fail_sessions("connection reset"), 1);

        let resources = handle.await.unwrap().unwrap();
        assert!(resources.is_empty());
        assert_eq!(engine.stats(), EngineStats::default());
    }

    #[tokio::test]
    async fn test_completed_stream_unblocks_get_resource() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcB"]));
        server.set_responsive(false);
        let engine = engine_with(&server, config());

        let caller = engine.clone();
        let handle = tokio::spawn(async move { caller.get_resource(names(&["svcB"])).await });

        wait_until(|| server.requests().len() == 1).await;
        assert_eq!(server.complete_sessions(), 1);

        let resources = handle.await.unwrap().unwrap();
        assert!(resources.is_empty());
        assert_eq!(engine.stats(), EngineStats::default());
    }

    #[tokio::test]
    async fn test_get_resource_returns_response_and_cleans_up() {
        let server = StaticDiscoveryServer::new(snapshot("3", &["svcA", "svcB"]));
        let engine = engine_with(&server, config());

        let resources = engine.get_resource(names(&["svcB"])).await.unwrap();
        assert_eq!(resource_names_of(&resources), vec!["svcB"]);
        assert_eq!(engine.stats(), EngineStats::default());
        assert_eq!(server.open_sessions(), 0);

        let acks = server.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].version_info.as_deref(), Some("3"));
        assert_eq!(acks[0].resource_names, names(&["svcB"]));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_are_isolated() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA", "svcB"]));
        let engine = engine_with(&server, config());

        let (a, b) = tokio::join!(
            engine.get_resource(names(&["svcA"])),
            engine.get_resource(names(&["svcB"]))
        );

        assert_eq!(resource_names_of(&a.unwrap()), vec!["svcA"]);
        assert_eq!(resource_names_of(&b.unwrap()), vec!["svcB"]);
        assert_eq!(server.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn test_unanswered_fetch_times_out() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        server.set_responsive(false);
        let engine = engine_with(&server, config());

        let result = engine
            .get_resource_with_timeout(names(&["svcA"]), Duration::from_millis(20))
            .await;

        assert!(matches!(result, Err(XdsError::Timeout)));
        assert_eq!(engine.stats(), EngineStats::default());
    }

    #[tokio::test]
    async fn test_refused_session_is_an_error() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        server.set_accepting(false);
        let engine = engine_with(&server, config());

        let result = engine.get_resource(names(&["svcA"])).await;
        assert!(matches!(result, Err(XdsError::Transport(_))));
        assert_eq!(engine.stats(), EngineStats::default());

        server.set_accepting(true);
        let resources = engine.get_resource(names(&["svcA"])).await.unwrap();
        assert_eq!(resource_names_of(&resources), vec!["svcA"]);
    }

    #[tokio::test]
    async fn test_dropped_fetch_leaves_no_state() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        server.set_responsive(false);
        let engine = engine_with(&server, config());

        let mut fetch = tokio_test::task::spawn(engine.get_resource(names(&["svcA"])));
        tokio_test::assert_pending!(fetch.poll());
        assert_eq!(engine.stats().pending_calls, 1);
        assert_eq!(engine.stats().sessions, 1);

        drop(fetch);
        assert_eq!(engine.stats(), EngineStats::default());
        assert_eq!(server.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_error_forces_new_session() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let engine = engine_with(&server, config());
        let id = engine.inner.allocate_id();
        let timeout = Duration::from_secs(5);

        engine.inner.fetch_once(id, names(&["svcA"]), timeout).await.unwrap();
        let (first_generation, _) = engine.inner.session(id).unwrap();

        server.fail_sessions("reset");
        wait_until(|| engine.stats().sessions == 0).await;
        assert_eq!(engine.stats().tracked_names, 0);

        let resources = engine.inner.fetch_once(id, names(&["svcA"]), timeout).await.unwrap();
        assert_eq!(resource_names_of(&resources), vec!["svcA"]);
        let (second_generation, _) = engine.inner.session(id).unwrap();

        assert_ne!(first_generation, second_generation);
        assert_eq!(server.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn test_panicking_consumer_keeps_subscription_alive() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let engine = engine_with(&server, config());

        let armed = Arc::new(AtomicBool::new(false));
        let trigger = armed.clone();
        let id = engine
            .observe_resource(names(&["svcA"]), move |_| {
                if trigger.load(Ordering::SeqCst) {
                    panic!("consumer failure");
                }
            })
            .await;

        armed.store(true, Ordering::SeqCst);
        server.push(LDS_TYPE_URL);
        wait_until(|| server.acks().len() == 2).await;
        armed.store(false, Ordering::SeqCst);

        let resources = engine
            .inner
            .fetch_once(id, names(&["svcA"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resource_names_of(&resources), vec!["svcA"]);
        assert_eq!(server.sessions_opened(), 1);
    }

    struct PanickingFilter(AtomicBool);

    impl ResolveFilter<Value> for PanickingFilter {
        fn name(&self) -> &str {
            "panicking"
        }

        fn resolve(&self, _resources: &[Value]) -> Result<bool> {
            if self.0.load(Ordering::SeqCst) {
                panic!("filter failure");
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_failed_event_task_releases_session() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let filter = Arc::new(PanickingFilter(AtomicBool::new(false)));
        let engine = XdsEngine::builder(
            config(),
            crate::JsonDecoder::<Value>::new(LDS_TYPE_URL),
            Arc::new(server.clone()),
        )
        .filter(filter.clone())
        .build()
        .unwrap();

        let id = engine.observe_resource(names(&["svcA"]), |_| {}).await;

        filter.0.store(true, Ordering::SeqCst);
        server.push(LDS_TYPE_URL);
        wait_until(|| engine.stats().sessions == 0).await;
        filter.0.store(false, Ordering::SeqCst);

        let resources = engine
            .inner
            .fetch_once(id, names(&["svcA"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resource_names_of(&resources), vec!["svcA"]);
        assert_eq!(server.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn test_response_from_replaced_session_is_dropped() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let engine = engine_with(&server, config());

        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let id = engine
            .observe_resource(names(&["svcA"]), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let (generation, _) = engine.inner.session(id).unwrap();

        engine.inner.on_response(
            id,
            generation + 100,
            DiscoveryResponse {
                type_url: LDS_TYPE_URL.to_string(),
                version_info: "9".to_string(),
                nonce: "late".to_string(),
                resources: Vec::new(),
            },
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.acks().len(), 1);
        assert_eq!(engine.stats().sessions, 1);
    }

    /// Static server that runs a hook the first time a session is opened
    struct HookedFactory {
        server: StaticDiscoveryServer,
        hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
        armed: AtomicBool,
    }

    impl HookedFactory {
        fn new(server: &StaticDiscoveryServer) -> Arc<Self> {
            Arc::new(Self {
                server: server.clone(),
                hook: OnceLock::new(),
                armed: AtomicBool::new(true),
            })
        }
    }

    impl SessionFactory for HookedFactory {
        fn open_session(
            &self,
            node: &Node,
            type_url: &str,
            observer: Arc<dyn ResponseObserver>,
        ) -> Result<Arc<dyn DiscoveryStream>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                if let Some(hook) = self.hook.get() {
                    hook();
                }
            }
            self.server.open_session(node, type_url, observer)
        }
    }

    #[tokio::test]
    async fn test_session_factory_runs_without_table_locks() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let factory = HookedFactory::new(&server);
        let engine: Engine = XdsEngine::builder(
            config(),
            crate::JsonDecoder::new(LDS_TYPE_URL),
            factory.clone(),
        )
        .build()
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (observer, record) = (engine.clone(), seen.clone());
        let _ = factory.hook.set(Box::new(move || {
            record.lock().unwrap().push(observer.stats());
        }));

        let resources = engine.get_resource(names(&["svcA"])).await.unwrap();
        assert_eq!(resource_names_of(&resources), vec!["svcA"]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sessions, 0);
        assert_eq!(seen[0].subscriptions, 1);
    }

    #[tokio::test]
    async fn test_concurrently_opened_session_is_closed() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let factory = HookedFactory::new(&server);
        let engine: Engine = XdsEngine::builder(
            config(),
            crate::JsonDecoder::new(LDS_TYPE_URL),
            factory.clone(),
        )
        .build()
        .unwrap();
        let id = engine.inner.allocate_id();

        // Another caller opens the session while this one is still connecting
        let winner = Arc::new(Mutex::new(None));
        let (racer, slot) = (engine.clone(), winner.clone());
        let _ = factory.hook.set(Box::new(move || {
            let opened = racer.inner.session(id).map(|(generation, _)| generation);
            *slot.lock().unwrap() = Some(opened.unwrap());
        }));

        let (generation, _) = engine.inner.session(id).unwrap();
        assert_eq!(*winner.lock().unwrap(), Some(generation));
        assert_eq!(server.sessions_opened(), 2);
        assert_eq!(server.open_sessions(), 1);

        let resources = engine
            .inner
            .fetch_once(id, names(&["svcA"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resource_names_of(&resources), vec!["svcA"]);
    }

    #[tokio::test]
    async fn test_stale_error_keeps_current_session() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let engine = engine_with(&server, config());
        let id = engine.inner.allocate_id();

        engine
            .inner
            .fetch_once(id, names(&["svcA"]), Duration::from_secs(5))
            .await
            .unwrap();
        let (generation, _) = engine.inner.session(id).unwrap();

        engine
            .inner
            .on_error(id, generation + 100, XdsError::StreamClosed("old".into()));

        assert_eq!(engine.stats().sessions, 1);
        assert_eq!(engine.stats().tracked_names, 1);
    }

    #[derive(Clone, Debug, Deserialize)]
    struct Listener {
        #[allow(dead_code)]
        name: String,
        #[allow(dead_code)]
        port: u16,
    }

    fn listener_server() -> StaticDiscoveryServer {
        StaticDiscoveryServer::new(
            Snapshot::new("5")
                .with_resource(LDS_TYPE_URL, json!({"name": "ok", "port": 80}))
                .with_resource(LDS_TYPE_URL, json!({"name": "broken"})),
        )
    }

    #[tokio::test]
    async fn test_decode_failure_is_still_acked_by_default() {
        let server = listener_server();
        let engine = XdsEngine::builder(
            config(),
            crate::JsonDecoder::<Listener>::new(LDS_TYPE_URL),
            Arc::new(server.clone()),
        )
        .build()
        .unwrap();

        let resources = engine.get_resource(BTreeSet::new()).await.unwrap();
        assert_eq!(resources.len(), 1);

        let acks = server.acks();
        assert_eq!(acks.len(), 1);
        assert!(acks[0].is_ack());
        assert_eq!(acks[0].version_info.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_decode_failure_is_nacked_when_configured() {
        let server = listener_server();
        let config = XdsConfig {
            ack_policy: AckPolicy::NackOnDecodeError,
            ..config()
        };
        let engine = XdsEngine::builder(
            config,
            crate::JsonDecoder::<Listener>::new(LDS_TYPE_URL),
            Arc::new(server.clone()),
        )
        .build()
        .unwrap();

        engine.get_resource(BTreeSet::new()).await.unwrap();

        let acks = server.acks();
        assert_eq!(acks.len(), 1);
        assert!(acks[0].is_nack());
        assert_eq!(acks[0].version_info.as_deref(), Some(""));
        assert!(acks[0]
            .error_detail
            .as_ref()
            .unwrap()
            .message
            .contains("missing field"));
    }

    #[tokio::test]
    async fn test_nack_keeps_last_accepted_version() {
        let server = StaticDiscoveryServer::new(
            Snapshot::new("4").with_resource(LDS_TYPE_URL, json!({"name": "ok", "port": 80})),
        );
        let config = XdsConfig {
            ack_policy: AckPolicy::NackOnDecodeError,
            ..config()
        };
        let engine = XdsEngine::builder(
            config,
            crate::JsonDecoder::<Listener>::new(LDS_TYPE_URL),
            Arc::new(server.clone()),
        )
        .build()
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .observe_resource(BTreeSet::new(), move |listeners: Vec<Listener>| {
                let _ = tx.send(listeners.len());
            })
            .await;
        assert_eq!(rx.recv().await, Some(1));

        server.set_snapshot(
            Snapshot::new("5")
                .with_resource(LDS_TYPE_URL, json!({"name": "ok", "port": 80}))
                .with_resource(LDS_TYPE_URL, json!({"name": "broken"})),
        );
        server.push(LDS_TYPE_URL);
        assert_eq!(rx.recv().await, Some(1));

        let push = server.responses().pop().unwrap();
        let acks = server.acks();
        assert_eq!(acks.len(), 2);
        assert!(acks[0].is_ack());
        assert_eq!(acks[0].version_info.as_deref(), Some("4"));
        assert!(acks[1].is_nack());
        assert_eq!(acks[1].version_info.as_deref(), Some("4"));
        assert_eq!(acks[1].response_nonce, Some(push.nonce));
    }

    #[tokio::test]
    async fn test_engine_serves_configured_type() {
        let server = StaticDiscoveryServer::new(
            Snapshot::new("1").with_resource(RDS_TYPE_URL, json!({"name": "route"})),
        );
        let engine = XdsEngine::builder(
            config(),
            crate::JsonDecoder::<Value>::new(RDS_TYPE_URL),
            Arc::new(server.clone()),
        )
        .build()
        .unwrap();

        let routes = engine.get_resource(BTreeSet::new()).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(engine.type_url(), RDS_TYPE_URL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_refetches_on_interval() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let config = XdsConfig {
            polling_interval: Duration::from_secs(30),
            ..config()
        };
        let engine = engine_with(&server, config);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = engine
            .observe_resource(names(&["svcA", "svcB"]), move |resources| {
                let _ = tx.send(resources);
            })
            .await;
        assert_eq!(resource_names_of(&rx.recv().await.unwrap()), vec!["svcA"]);
        assert_eq!(engine.resync_state(id), Some(ResyncState::Scheduled));

        server.set_snapshot(snapshot("2", &["svcA", "svcB"]));

        // Paused clock advances to the next tick while we wait
        let refreshed = rx.recv().await.unwrap();
        assert_eq!(resource_names_of(&refreshed), vec!["svcA", "svcB"]);

        let subscribes = server
            .requests()
            .into_iter()
            .filter(|r| r.response_nonce.is_none())
            .count();
        assert_eq!(subscribes, 2);
        assert_eq!(server.sessions_opened(), 1);

        engine.shutdown();
        assert_eq!(engine.resync_state(id), Some(ResyncState::Terminated));
        assert_eq!(engine.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_polling_disabled_schedules_nothing() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        let config = XdsConfig {
            polling_enabled: false,
            ..config()
        };
        let engine = engine_with(&server, config);

        let id = engine.observe_resource(BTreeSet::new(), |_| {}).await;
        assert_eq!(engine.resync_state(id), None);
        assert_eq!(engine.stats().subscriptions, 1);
    }

    #[tokio::test]
    async fn test_observe_survives_unreachable_server() {
        let server = StaticDiscoveryServer::new(snapshot("1", &["svcA"]));
        server.set_responsive(false);
        let config = XdsConfig {
            request_timeout: Duration::from_millis(20),
            ..config()
        };
        let engine = engine_with(&server, config);

        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        engine
            .observe_resource(names(&["svcA"]), move |resources| {
                assert!(resources.is_empty());
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().pending_calls, 0);
    }

    struct RouteNames;

    impl ResourceDecoder for RouteNames {
        type Resource = Value;

        fn type_url(&self) -> &str {
            LDS_TYPE_URL
        }

        fn decode_resource(&self, raw: &xdsync_core::RawResource) -> Result<Value> {
            Ok(serde_json::from_slice(&raw.value)?)
        }

        fn resolve_resource_names(&self, resources: &[Value]) -> BTreeSet<String> {
            resources
                .iter()
                .filter_map(|r| r["route"].as_str().map(str::to_string))
                .collect()
        }
    }

    struct CountingFilter(AtomicU64);

    impl ResolveFilter<Value> for CountingFilter {
        fn name(&self) -> &str {
            "counting"
        }

        fn resolve(&self, resources: &[Value]) -> Result<bool> {
            self.0.fetch_add(resources.len() as u64, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_filters_and_dependent_names() {
        let server = StaticDiscoveryServer::new(
            Snapshot::new("1")
                .with_resource(LDS_TYPE_URL, json!({"name": "inbound", "route": "reviews"}))
                .with_resource(LDS_TYPE_URL, json!({"name": "outbound", "route": "ratings"})),
        );
        let filter = Arc::new(CountingFilter(AtomicU64::new(0)));
        let engine = XdsEngine::builder(config(), RouteNames, Arc::new(server.clone()))
            .filter(filter.clone())
            .build()
            .unwrap();

        let id = engine.observe_resource(BTreeSet::new(), |_| {}).await;

        assert_eq!(filter.0.load(Ordering::SeqCst), 2);
        assert_eq!(
            engine.dependent_resource_names(id),
            names(&["ratings", "reviews"])
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let server = StaticDiscoveryServer::new(Snapshot::new("1"));
        let config = XdsConfig {
            polling_interval: Duration::ZERO,
            ..XdsConfig::default()
        };
        let result = XdsEngine::builder(
            config,
            crate::JsonDecoder::<Value>::new(LDS_TYPE_URL),
            Arc::new(server),
        )
        .build();
        assert!(matches!(result, Err(XdsError::Config(_))));
    }
}
