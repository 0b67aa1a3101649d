/// Coordinator — single-owner event loop for all media state.
///
/// Sockets, the HTTP API and the staleness ticker send `CoordinatorEvent`s
/// into this loop.  The coordinator owns the `MediaStore` and the subscriber
/// registry exclusively; nothing else touches them, so no lock guards the
/// record map.
///
/// Work that has to wait on the browser (liveness probes, command delivery,
/// source injection) is spawned against the `TabHost` and reports back as a
/// later event.  By then the record in question may already be gone, so every
/// result handler copes with a missing record.
use std::sync::Arc;
use std::time::Duration;

use media_proto::config::{Config, DispatchConfig};
use media_proto::discovery::MediaHosts;
use media_proto::protocol::{Control, Outgoing};
use media_proto::record::{AggregateView, MediaReport, TabMediaRecord};
use media_proto::TabId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::store::MediaStore;
use crate::subscribers::{SubscriberId, SubscriberRegistry};
use crate::tabs::{DispatchError, EnsureOutcome, TabHost};

/// Wall-clock milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

// ── CoordinatorEvent ──────────────────────────────────────────────────────────

/// All inputs into the Coordinator loop.
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// MEDIA_DETECTED / MEDIA_STATE_CHANGED / CURRENT_STATE from a source.
    Report {
        tab_id: Option<TabId>,
        report: MediaReport,
    },
    GetState(oneshot::Sender<AggregateView>),
    ListTabs(oneshot::Sender<Vec<TabMediaRecord>>),
    /// CONTROL_MEDIA from a consumer, already validated.
    Control(Control),
    /// The browser removed the tab.
    TabClosed(TabId),
    TabNavigated {
        tab_id: TabId,
        url: String,
        complete: bool,
    },
    Subscribe {
        tx: mpsc::Sender<Outgoing>,
        reply: oneshot::Sender<SubscriberId>,
    },
    Unsubscribe(SubscriberId),
    /// Staleness sweep.
    SweepTick,
    ProbeResult {
        tab_id: TabId,
        exists: bool,
    },
    ControlTargetMissing {
        tab_id: TabId,
    },
    DispatchFailed {
        tab_id: TabId,
        control: Control,
        attempt: u32,
        error: DispatchError,
    },
    Shutdown,
}

// ── DispatchPolicy ────────────────────────────────────────────────────────────

/// Decides what happens when a control command cannot be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl DispatchPolicy {
    /// Evict on the first failure.
    pub const NO_RETRY: Self = Self {
        max_retries: 0,
        backoff: Duration::ZERO,
    };

    /// `attempt` is the number of deliveries that have failed so far.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

impl From<&DispatchConfig> for DispatchPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct Coordinator<H: TabHost> {
    store: MediaStore,
    host: H,
    subscribers: SubscriberRegistry,
    media_hosts: MediaHosts,
    policy: DispatchPolicy,
    stale_threshold_ms: u64,
    sweep_interval: Duration,
    /// Loop-back channel for results of spawned work.
    event_tx: mpsc::Sender<CoordinatorEvent>,
    clock: Clock,
    /// Last view pushed to subscribers (to skip no-op broadcasts on eviction).
    last_view: AggregateView,
}

impl<H: TabHost> Coordinator<H> {
    pub fn new(config: &Config, host: H, event_tx: mpsc::Sender<CoordinatorEvent>) -> Self {
        let coordinator = &config.coordinator;
        let store = MediaStore::new(coordinator.default_volume, coordinator.volume_policy);
        let last_view = store.view();
        Self {
            store,
            host,
            subscribers: SubscriberRegistry::new(),
            media_hosts: MediaHosts::new(&config.discovery.media_hosts),
            policy: DispatchPolicy::from(&coordinator.dispatch),
            stale_threshold_ms: coordinator.stale_threshold_ms,
            sweep_interval: Duration::from_millis(coordinator.sweep_interval_ms.max(1)),
            event_tx,
            clock: system_clock(),
            last_view,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn view(&self) -> AggregateView {
        self.store.view()
    }

    pub fn store(&self) -> &MediaStore {
        &self.store
    }

    /// Run the event loop until a `Shutdown` event arrives.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoordinatorEvent>) {
        info!("Coordinator: starting event loop");

        // Staleness ticker.  The first tick of an interval fires at once; skip it.
        let sweep_tx = self.event_tx.clone();
        let sweep_interval = self.sweep_interval;
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sweep_tx.send(CoordinatorEvent::SweepTick).await.is_err() {
                    break;
                }
            }
        });

        while let Some(event) = event_rx.recv().await {
            if matches!(event, CoordinatorEvent::Shutdown) {
                info!("Coordinator: shutdown requested");
                break;
            }
            self.handle(event);
        }

        sweeper.abort();
        info!("Coordinator: event loop finished");
    }

    /// Apply one event.  Never blocks; anything that has to wait is spawned.
    pub fn handle(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Report { tab_id, report } => {
                let now = (self.clock)();
                if self.store.report(tab_id, report, now) {
                    self.broadcast();
                }
            }

            CoordinatorEvent::GetState(reply) => {
                let _ = reply.send(self.store.view());
            }

            CoordinatorEvent::ListTabs(reply) => {
                let _ = reply.send(self.store.records());
            }

            CoordinatorEvent::Control(control) => match self.store.selected_tab() {
                Some(tab_id) => {
                    debug!("Coordinator: forwarding {:?} to tab {}", control, tab_id);
                    self.spawn_forward(tab_id, control, 1, Duration::ZERO);
                }
                None => info!("Coordinator: no active media tab to control"),
            },

            CoordinatorEvent::TabClosed(tab_id) => {
                debug!("Coordinator: tab {} closed", tab_id);
                self.evict(tab_id);
            }

            CoordinatorEvent::TabNavigated {
                tab_id,
                url,
                complete,
            } => {
                if complete && self.media_hosts.matches(&url) {
                    self.spawn_ensure_source(tab_id, url);
                }
            }

            CoordinatorEvent::Subscribe { tx, reply } => {
                let id = self.subscribers.register(tx);
                debug!("Coordinator: subscriber {:?} registered", id);
                let _ = reply.send(id);
            }

            CoordinatorEvent::Unsubscribe(id) => {
                self.subscribers.remove(id);
            }

            CoordinatorEvent::SweepTick => {
                let now = (self.clock)();
                for tab_id in self.store.stale_tabs(now, self.stale_threshold_ms) {
                    self.spawn_probe(tab_id);
                }
            }

            CoordinatorEvent::ProbeResult { tab_id, exists } => {
                if exists {
                    debug!("Coordinator: tab {} idle but still open", tab_id);
                } else {
                    info!("Coordinator: stale tab {} no longer exists", tab_id);
                    self.evict(tab_id);
                }
            }

            CoordinatorEvent::ControlTargetMissing { tab_id } => {
                info!("Coordinator: control target tab {} is gone", tab_id);
                self.evict(tab_id);
            }

            CoordinatorEvent::DispatchFailed {
                tab_id,
                control,
                attempt,
                error,
            } => {
                if self.policy.should_retry(attempt) {
                    warn!(
                        "Coordinator: failed to send control command (attempt {}): {}, retrying",
                        attempt, error
                    );
                    self.spawn_forward(tab_id, control, attempt + 1, self.policy.backoff);
                } else {
                    warn!("Coordinator: failed to send control command: {}", error);
                    self.evict(tab_id);
                }
            }

            CoordinatorEvent::Shutdown => {}
        }
    }

    fn evict(&mut self, tab_id: TabId) {
        if self.store.evict(tab_id) && self.store.view() != self.last_view {
            self.broadcast();
        }
    }

    fn broadcast(&mut self) {
        let view = self.store.view();
        self.subscribers.broadcast(&view);
        self.last_view = view;
    }

    // ── spawned work ──────────────────────────────────────────────────────────

    fn spawn_forward(&self, tab_id: TabId, control: Control, attempt: u32, delay: Duration) {
        let host = self.host.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !host.tab_exists(tab_id).await {
                let _ = tx
                    .send(CoordinatorEvent::ControlTargetMissing { tab_id })
                    .await;
                return;
            }
            if let Err(error) = host.dispatch(tab_id, Outgoing::control(&control)).await {
                let _ = tx
                    .send(CoordinatorEvent::DispatchFailed {
                        tab_id,
                        control,
                        attempt,
                        error,
                    })
                    .await;
            }
        });
    }

    fn spawn_probe(&self, tab_id: TabId) {
        let host = self.host.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let exists = host.tab_exists(tab_id).await;
            let _ = tx
                .send(CoordinatorEvent::ProbeResult { tab_id, exists })
                .await;
        });
    }

    fn spawn_ensure_source(&self, tab_id: TabId, url: String) {
        let host = self.host.clone();
        tokio::spawn(async move {
            match host.ensure_source(tab_id).await {
                Ok(EnsureOutcome::AlreadyPresent) => {
                    debug!("Coordinator: source already present in tab {}", tab_id)
                }
                Ok(EnsureOutcome::Requested) => {
                    info!("Coordinator: requested source for tab {} ({})", tab_id, url)
                }
                Err(e) => debug!("Coordinator: could not request source: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_proto::config::VolumePolicy;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        open: HashSet<TabId>,
        dispatched: Vec<(TabId, Outgoing)>,
        /// Number of upcoming dispatches that fail.
        failures: u32,
        ensured: Vec<TabId>,
    }

    #[derive(Clone, Default)]
    struct MockHost(Arc<Mutex<MockState>>);

    impl MockHost {
        fn open(&self, tab_id: TabId) {
            self.0.lock().unwrap().open.insert(tab_id);
        }

        fn close(&self, tab_id: TabId) {
            self.0.lock().unwrap().open.remove(&tab_id);
        }

        fn fail_next(&self, n: u32) {
            self.0.lock().unwrap().failures = n;
        }

        fn dispatched(&self) -> Vec<(TabId, Outgoing)> {
            self.0.lock().unwrap().dispatched.clone()
        }

        fn ensured(&self) -> Vec<TabId> {
            self.0.lock().unwrap().ensured.clone()
        }
    }

    impl TabHost for MockHost {
        async fn tab_exists(&self, tab_id: TabId) -> bool {
            self.0.lock().unwrap().open.contains(&tab_id)
        }

        async fn dispatch(&self, tab_id: TabId, message: Outgoing) -> Result<(), DispatchError> {
            let mut state = self.0.lock().unwrap();
            if state.failures > 0 {
                state.failures -= 1;
                return Err(DispatchError::NoListener(tab_id));
            }
            state.dispatched.push((tab_id, message));
            Ok(())
        }

        async fn ensure_source(&self, tab_id: TabId) -> Result<EnsureOutcome, DispatchError> {
            self.0.lock().unwrap().ensured.push(tab_id);
            Ok(EnsureOutcome::Requested)
        }
    }

    struct Harness {
        core: Coordinator<MockHost>,
        rx: mpsc::Receiver<CoordinatorEvent>,
        host: MockHost,
        now: Arc<AtomicI64>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(Config::default())
        }

        fn with_config(config: Config) -> Self {
            let (tx, rx) = mpsc::channel(64);
            let host = MockHost::default();
            let now = Arc::new(AtomicI64::new(1_000));
            let clock_now = now.clone();
            let core = Coordinator::new(&config, host.clone(), tx)
                .with_clock(Arc::new(move || clock_now.load(Ordering::SeqCst)));
            Self {
                core,
                rx,
                host,
                now,
            }
        }

        fn at(&mut self, ms: i64) -> &mut Self {
            self.now.store(ms, Ordering::SeqCst);
            self
        }

        fn report(&mut self, tab_id: TabId, json: &str) {
            let report = serde_json::from_str(json).unwrap();
            self.core.handle(CoordinatorEvent::Report {
                tab_id: Some(tab_id),
                report,
            });
        }

        /// Feed results of spawned work back into the loop until it goes quiet.
        async fn settle(&mut self) {
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await
            {
                self.core.handle(event);
            }
        }
    }

    #[tokio::test]
    async fn test_recency_beats_playing_state() {
        let mut h = Harness::new();
        h.at(100).report(1, r#"{"hasMedia":true,"isPlaying":true}"#);
        h.at(200).report(2, r#"{"hasMedia":true,"isPlaying":false}"#);

        let view = h.core.view();
        assert_eq!(view.tab_id, Some(2));
        assert!(!view.is_playing);
    }

    #[tokio::test]
    async fn test_report_without_tab_is_dropped() {
        let mut h = Harness::new();
        h.core.handle(CoordinatorEvent::Report {
            tab_id: None,
            report: MediaReport {
                has_media: Some(true),
                ..MediaReport::default()
            },
        });
        assert!(h.core.store().is_empty());
    }

    #[tokio::test]
    async fn test_evicted_tab_is_never_current() {
        let mut h = Harness::new();
        h.report(1, r#"{"isPlaying":true}"#);
        h.core.handle(CoordinatorEvent::TabClosed(1));

        let (tx, rx) = oneshot::channel();
        h.core.handle(CoordinatorEvent::GetState(tx));
        let view = rx.await.unwrap();
        assert!(!view.has_media);
        assert_ne!(view.tab_id, Some(1));
    }

    #[tokio::test]
    async fn test_control_without_selection_is_noop() {
        let mut h = Harness::new();
        h.host.open(1);
        h.report(1, r#"{"hasMedia":false}"#);

        h.core.handle(CoordinatorEvent::Control(Control::Play));
        h.settle().await;
        assert!(h.host.dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_volume_command_reaches_selected_tab_unchanged() {
        let mut h = Harness::new();
        h.host.open(1);
        h.host.open(2);
        h.report(1, r#"{"hasMedia":true,"volume":80}"#);
        h.report(2, r#"{"hasMedia":true,"volume":10}"#);
        let before = h.core.store().get(2).cloned();

        h.core.handle(CoordinatorEvent::Control(Control::Volume(42)));
        h.settle().await;

        let dispatched = h.host.dispatched();
        assert_eq!(dispatched.len(), 1);
        let (tab_id, message) = &dispatched[0];
        assert_eq!(*tab_id, 2);
        match message {
            Outgoing::ControlCommand { action, data } => {
                assert_eq!(action, "volume");
                assert_eq!(data.volume, Some(42.0));
            }
            other => panic!("Wrong message: {:?}", other),
        }
        // the coordinator's own record waits for the source to report back
        assert_eq!(h.core.store().get(2).cloned(), before);
        assert_eq!(h.core.view().volume, 10);

        h.report(2, r#"{"volume":42}"#);
        assert_eq!(h.core.view().volume, 42);
    }

    #[tokio::test]
    async fn test_control_to_closed_tab_evicts() {
        let mut h = Harness::new();
        h.host.open(1);
        h.report(1, r#"{"hasMedia":true}"#);
        h.report(2, r#"{"hasMedia":true}"#);

        h.core.handle(CoordinatorEvent::Control(Control::Next));
        h.settle().await;

        assert!(h.host.dispatched().is_empty());
        assert!(h.core.store().get(2).is_none());
        assert_eq!(h.core.view().tab_id, Some(1));
    }

    #[tokio::test]
    async fn test_failed_dispatch_evicts_without_retries() {
        let mut h = Harness::new();
        h.host.open(1);
        h.host.fail_next(1);
        h.report(1, r#"{"hasMedia":true}"#);

        h.core.handle(CoordinatorEvent::Control(Control::Toggle));
        h.settle().await;

        assert!(h.host.dispatched().is_empty());
        assert!(h.core.store().is_empty());
        assert!(!h.core.view().has_media);
    }

    #[tokio::test]
    async fn test_retry_policy_redelivers_before_evicting() {
        let mut h = Harness::new();
        h.core = h.core.with_policy(DispatchPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        });
        h.host.open(1);
        h.report(1, r#"{"hasMedia":true}"#);

        h.host.fail_next(2);
        h.core.handle(CoordinatorEvent::Control(Control::Pause));
        h.settle().await;
        assert_eq!(h.host.dispatched().len(), 1);
        assert!(h.core.store().get(1).is_some());

        h.host.fail_next(3);
        h.core.handle(CoordinatorEvent::Control(Control::Pause));
        h.settle().await;
        assert_eq!(h.host.dispatched().len(), 1);
        assert!(h.core.store().get(1).is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_confirmed_missing_tabs() {
        let mut h = Harness::new();
        h.host.open(2);
        h.at(0).report(1, r#"{"hasMedia":true}"#);
        h.at(1).report(2, r#"{"hasMedia":true}"#);
        h.at(25_000).report(3, r#"{"hasMedia":true}"#);

        h.at(40_000);
        h.core.handle(CoordinatorEvent::SweepTick);
        h.settle().await;

        // 1: stale and gone; 2: stale but open; 3: fresh (and unknown to the host)
        assert!(h.core.store().get(1).is_none());
        assert!(h.core.store().get(2).is_some());
        assert!(h.core.store().get(3).is_some());
    }

    #[tokio::test]
    async fn test_probe_result_for_evicted_tab_is_harmless() {
        let mut h = Harness::new();
        h.report(1, r#"{"hasMedia":true}"#);
        h.core.handle(CoordinatorEvent::TabClosed(1));
        h.core.handle(CoordinatorEvent::ProbeResult {
            tab_id: 1,
            exists: false,
        });
        h.core.handle(CoordinatorEvent::ControlTargetMissing { tab_id: 1 });
        assert!(h.core.store().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates() {
        let mut h = Harness::new();
        let (tx, mut updates) = mpsc::channel(8);
        let (reply_tx, reply_rx) = oneshot::channel();
        h.core.handle(CoordinatorEvent::Subscribe { tx, reply: reply_tx });
        let id = reply_rx.await.unwrap();

        h.report(5, r#"{"hasMedia":true,"title":"Track"}"#);
        match updates.recv().await {
            Some(Outgoing::MediaUpdate { data }) => {
                assert_eq!(data.tab_id, Some(5));
                assert_eq!(data.current_track.as_deref(), Some("Track"));
            }
            other => panic!("Wrong message: {:?}", other),
        }

        // evicting a non-selected, non-candidate tab leaves the view alone
        h.report(6, r#"{"hasMedia":false}"#);
        let _ = updates.recv().await;
        h.core.handle(CoordinatorEvent::TabClosed(6));
        assert!(updates.try_recv().is_err());

        h.core.handle(CoordinatorEvent::TabClosed(5));
        match updates.recv().await {
            Some(Outgoing::MediaUpdate { data }) => assert!(!data.has_media),
            other => panic!("Wrong message: {:?}", other),
        }

        h.core.handle(CoordinatorEvent::Unsubscribe(id));
        h.report(7, r#"{"hasMedia":true}"#);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_navigation_to_media_host_requests_source() {
        let mut h = Harness::new();
        h.core.handle(CoordinatorEvent::TabNavigated {
            tab_id: 1,
            url: "https://www.youtube.com/watch?v=1".into(),
            complete: true,
        });
        h.core.handle(CoordinatorEvent::TabNavigated {
            tab_id: 2,
            url: "https://example.com/".into(),
            complete: true,
        });
        h.core.handle(CoordinatorEvent::TabNavigated {
            tab_id: 3,
            url: "https://soundcloud.com/".into(),
            complete: false,
        });
        h.settle().await;
        assert_eq!(h.host.ensured(), vec![1]);
    }

    #[tokio::test]
    async fn test_global_volume_policy() {
        let mut config = Config::default();
        config.coordinator.volume_policy = VolumePolicy::Global;
        config.coordinator.default_volume = 55;
        let mut h = Harness::with_config(config);
        h.report(1, r#"{"hasMedia":true,"volume":20}"#);
        assert_eq!(h.core.view().volume, 55);
    }

    #[tokio::test]
    async fn test_list_tabs() {
        let mut h = Harness::new();
        h.report(2, r#"{"hasMedia":true}"#);
        h.report(1, r#"{"isPlaying":true}"#);
        h.host.close(1);

        let (tx, rx) = oneshot::channel();
        h.core.handle(CoordinatorEvent::ListTabs(tx));
        let tabs = rx.await.unwrap();
        assert_eq!(tabs.iter().map(|t| t.tab_id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_dispatch_policy() {
        assert!(!DispatchPolicy::NO_RETRY.should_retry(1));
        let policy = DispatchPolicy::from(&DispatchConfig {
            max_retries: 1,
            retry_backoff_ms: 10,
        });
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert_eq!(policy.backoff, Duration::from_millis(10));
    }
}
