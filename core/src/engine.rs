//! Connectivity engine: check dispatch, cancellation and shutdown
//!
//! The engine owns the configuration handle, the transport and resolver
//! seams, and the registry of in-flight checks. Each started check runs on
//! its own task; the registry lock is the only serialization point, held
//! only for map operations and never across an await or a callback.

use schema::{AddrFamily, ConnectivitySettings, ReachabilityState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checker::{run_check, Verdict};
use crate::config::{ConfigHandle, ConnectivityConfig};
use crate::error::CheckError;
use crate::registry::{CheckId, CheckRegistry, IfSpec, RegisteredCheck};
use crate::resolver::{ResolveStrategy, SystemdResolver};
use crate::transport::{HttpTransport, HyperTransport};

/// Entry point to connectivity checking
///
/// Cloning is cheap; all clones share the same configuration, registry and
/// transport. Checks started through any clone are visible to all.
#[derive(Clone)]
pub struct ConnectivityEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: ConfigHandle,
    transport: Arc<dyn HttpTransport>,
    resolver: Arc<dyn ResolveStrategy>,
    registry: Mutex<CheckRegistry>,
    next_id: AtomicU64,
}

impl ConnectivityEngine {
    /// Create an engine over explicit transport and resolver implementations
    pub fn new(transport: Arc<dyn HttpTransport>, resolver: Arc<dyn ResolveStrategy>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config: ConfigHandle::new(),
                transport,
                resolver,
                registry: Mutex::new(CheckRegistry::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create an engine with the production transport and resolver
    pub fn system() -> Self {
        Self::new(
            Arc::new(HyperTransport::new()),
            Arc::new(SystemdResolver::new()),
        )
    }

    /// Apply new connectivity settings; see [`ConfigHandle::apply`]
    pub fn apply_config(&self, settings: &ConnectivitySettings) -> bool {
        self.inner.config.apply(settings)
    }

    /// Subscribe to configuration change notifications
    pub fn subscribe_config(&self) -> watch::Receiver<Arc<ConnectivityConfig>> {
        self.inner.config.subscribe()
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<ConnectivityConfig> {
        self.inner.config.snapshot()
    }

    /// Whether real checks would currently run
    pub fn check_enabled(&self) -> bool {
        self.inner.config.snapshot().enabled
    }

    /// Polling interval; zero when checking is disabled
    pub fn interval(&self) -> Duration {
        let config = self.inner.config.snapshot();
        if config.enabled {
            config.interval
        } else {
            Duration::ZERO
        }
    }

    /// Number of in-flight checks
    pub fn active_checks(&self) -> usize {
        self.inner.registry().len()
    }

    /// Start a connectivity check on the given interface
    ///
    /// The check runs against the configuration snapshot taken here; a
    /// later reload does not affect it. `callback` is invoked exactly once
    /// with the terminal state, from a task (never from inside this call).
    /// Without an interface the check terminates with an error; with
    /// checking disabled it terminates with a fake online result. Both of
    /// those are still delivered asynchronously.
    pub fn start_check(
        &self,
        family: AddrFamily,
        ifindex: i32,
        ifname: Option<&str>,
        callback: impl FnOnce(CheckId, ReachabilityState, Option<CheckError>) + Send + 'static,
    ) -> CheckId {
        let id = CheckId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let config = self.inner.config.snapshot();
        let ifspec = ifname
            .filter(|name| !name.is_empty())
            .map(|name| IfSpec {
                ifindex,
                ifname: name.to_string(),
            });

        debug!(
            "starting {} (family={}, iface={})",
            id,
            family,
            ifspec
                .as_ref()
                .map(|spec| spec.ifspec())
                .unwrap_or_else(|| "(none)".to_string())
        );

        self.inner.registry().insert(
            id,
            RegisteredCheck {
                family,
                ifspec: ifspec.clone(),
                callback: Box::new(callback),
                task: None,
            },
        );

        let synthetic = if ifspec.is_none() {
            Some(Verdict::error(CheckError::MissingInterface))
        } else if !config.enabled {
            Some(Verdict::fake())
        } else {
            None
        };

        let inner = self.inner.clone();
        let task = match synthetic {
            Some(verdict) => tokio::spawn(async move {
                // deliver asynchronously even for the synthetic outcomes
                tokio::task::yield_now().await;
                inner.finish(id, verdict);
            }),
            None => {
                let transport = self.inner.transport.clone();
                let resolver = self.inner.resolver.clone();
                tokio::spawn(async move {
                    let verdict = run_check(config, transport, resolver, family, ifspec).await;
                    inner.finish(id, verdict);
                })
            }
        };
        self.inner.registry().attach_task(id, task);

        id
    }

    /// Cancel an in-flight check
    ///
    /// The callback fires with `Error` and a cancellation error before this
    /// returns. Returns `false` when the check already reached a terminal
    /// state (completion won the race); the earlier callback stands.
    pub fn cancel_check(&self, id: CheckId) -> bool {
        let check = self.inner.registry().remove(id);
        match check {
            Some(check) => {
                self.inner
                    .deliver(id, check, Verdict::error(CheckError::Cancelled));
                true
            }
            None => {
                warn!("{} not cancelled: already completed", id);
                false
            }
        }
    }

    /// Drain every in-flight check and deliver a shutdown error to each
    ///
    /// The engine remains usable afterwards but is expected to be dropped.
    pub fn shutdown(&self) {
        let drained = self.inner.registry().drain_all();
        if !drained.is_empty() {
            info!("shutting down with {} check(s) in flight", drained.len());
        }
        for (id, check) in drained {
            self.inner
                .deliver(id, check, Verdict::error(CheckError::ShuttingDown));
        }
    }
}

impl EngineInner {
    fn registry(&self) -> std::sync::MutexGuard<'_, CheckRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Terminate a check from its own task
    ///
    /// Removal from the registry decides the race against cancel and
    /// shutdown; losing it means the callback already fired.
    fn finish(&self, id: CheckId, verdict: Verdict) {
        let check = self.registry().remove(id);
        if let Some(check) = check {
            self.deliver(id, check, verdict);
        }
    }

    /// Invoke the callback and tear down the task, outside the lock
    fn deliver(&self, id: CheckId, check: RegisteredCheck, verdict: Verdict) {
        let iface = check
            .ifspec
            .as_ref()
            .map(|spec| spec.ifname.as_str())
            .unwrap_or("(none)");
        if verdict.state == ReachabilityState::Error {
            error!(
                "{} completed: {}; {} (family={}, iface={})",
                id, verdict.state, verdict.reason, check.family, iface
            );
        } else {
            info!(
                "{} completed: {}; {} (family={}, iface={})",
                id, verdict.state, verdict.reason, check.family, iface
            );
        }
        (check.callback)(id, verdict.state, verdict.error);
        if let Some(task) = check.task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::CHECK_TIMEOUT;
    use crate::registry::CheckCallback;
    use crate::resolver::ResolvedAddress;
    use crate::transport::{ProbeRequest, TransportError, TransportEvent};
    use async_trait::async_trait;
    use bytes::Bytes;
    use hyper::StatusCode;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, oneshot};

    /// Transport that plays back a fixed event script
    struct ScriptedTransport {
        script: Mutex<Vec<TransportEvent>>,
        requests: Mutex<Vec<ProbeRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<TransportEvent>) -> Self {
            Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn fetch(&self, request: ProbeRequest, events: mpsc::Sender<TransportEvent>) {
            self.requests.lock().unwrap().push(request);
            let script = std::mem::take(&mut *self.script.lock().unwrap());
            for event in script {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Transport that never produces an event
    struct NeverTransport;

    #[async_trait]
    impl HttpTransport for NeverTransport {
        async fn fetch(&self, _request: ProbeRequest, _events: mpsc::Sender<TransportEvent>) {
            std::future::pending::<()>().await;
        }
    }

    /// Transport that holds the exchange until released, then plays a script
    struct GatedTransport {
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        script: Mutex<Vec<TransportEvent>>,
    }

    #[async_trait]
    impl HttpTransport for GatedTransport {
        async fn fetch(&self, _request: ProbeRequest, events: mpsc::Sender<TransportEvent>) {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let script = std::mem::take(&mut *self.script.lock().unwrap());
            for event in script {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    struct MockResolver {
        addrs: Option<Vec<IpAddr>>,
    }

    /// Resolution strategy that never answers
    struct StallingResolver;

    #[async_trait]
    impl ResolveStrategy for StallingResolver {
        async fn resolve(
            &self,
            _host: &str,
            _family: AddrFamily,
            _ifindex: i32,
        ) -> Option<Vec<IpAddr>> {
            std::future::pending::<()>().await;
            None
        }
    }

    #[async_trait]
    impl ResolveStrategy for MockResolver {
        async fn resolve(
            &self,
            _host: &str,
            _family: AddrFamily,
            _ifindex: i32,
        ) -> Option<Vec<IpAddr>> {
            self.addrs.clone()
        }
    }

    fn engine_with(transport: Arc<dyn HttpTransport>) -> ConnectivityEngine {
        engine_with_resolver(transport, MockResolver { addrs: None })
    }

    fn engine_with_resolver(
        transport: Arc<dyn HttpTransport>,
        resolver: MockResolver,
    ) -> ConnectivityEngine {
        let engine = ConnectivityEngine::new(transport, Arc::new(resolver));
        engine.apply_config(&ConnectivitySettings {
            uri: Some("http://check.example.org/probe".to_string()),
            response: Some("OK".to_string()),
            ..Default::default()
        });
        engine
    }

    fn callback_channel() -> (
        oneshot::Receiver<(CheckId, ReachabilityState, Option<CheckError>)>,
        CheckCallback,
    ) {
        let (tx, rx) = oneshot::channel();
        (
            rx,
            Box::new(move |id, state, error| {
                let _ = tx.send((id, state, error));
            }),
        )
    }

    #[tokio::test]
    async fn test_full_verdict_delivered_once() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            TransportEvent::Body(Bytes::from_static(b"OK and then some")),
            TransportEvent::Done {
                status: StatusCode::OK,
            },
        ]));
        let engine = engine_with(transport);
        let (rx, callback) = callback_channel();

        let id = engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), callback);
        let (got_id, state, error) = rx.await.unwrap();
        assert_eq!(got_id, id);
        assert_eq!(state, ReachabilityState::Full);
        assert_eq!(error, None);
        assert_eq!(engine.active_checks(), 0);
    }

    #[tokio::test]
    async fn test_portal_verdict_on_mismatch() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            TransportEvent::Body(Bytes::from_static(b"<html>sign in</html>")),
            TransportEvent::Done {
                status: StatusCode::OK,
            },
        ]));
        let engine = engine_with(transport);
        let (rx, callback) = callback_channel();

        engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), callback);
        let (_, state, _) = rx.await.unwrap();
        assert_eq!(state, ReachabilityState::Portal);
    }

    #[tokio::test]
    async fn test_transport_failure_is_limited() {
        let transport = Arc::new(ScriptedTransport::new(vec![TransportEvent::Failed(
            TransportError::Resolve("check.example.org".to_string()),
        )]));
        let engine = engine_with(transport);
        let (rx, callback) = callback_channel();

        engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), callback);
        let (_, state, error) = rx.await.unwrap();
        assert_eq!(state, ReachabilityState::Limited);
        assert_eq!(error, None);
    }

    #[tokio::test]
    async fn test_missing_interface_is_error() {
        let engine = engine_with(Arc::new(NeverTransport));
        let (rx, callback) = callback_channel();

        engine.start_check(AddrFamily::Unspecified, 0, None, callback);
        let (_, state, error) = rx.await.unwrap();
        assert_eq!(state, ReachabilityState::Error);
        assert_eq!(error, Some(CheckError::MissingInterface));
    }

    #[tokio::test]
    async fn test_empty_ifname_treated_as_missing() {
        let engine = engine_with(Arc::new(NeverTransport));
        let (rx, callback) = callback_channel();

        engine.start_check(AddrFamily::Unspecified, 0, Some(""), callback);
        let (_, state, error) = rx.await.unwrap();
        assert_eq!(state, ReachabilityState::Error);
        assert_eq!(error, Some(CheckError::MissingInterface));
    }

    #[tokio::test]
    async fn test_disabled_checking_yields_fake() {
        let engine = ConnectivityEngine::new(
            Arc::new(NeverTransport),
            Arc::new(MockResolver { addrs: None }),
        );
        // no URI configured, so checking is disabled
        let (rx, callback) = callback_channel();

        engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), callback);
        let (_, state, error) = rx.await.unwrap();
        assert_eq!(state, ReachabilityState::Fake);
        assert_eq!(error, None);
    }

    #[tokio::test]
    async fn test_cancel_delivers_cancelled_synchronously() {
        let engine = engine_with(Arc::new(NeverTransport));
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let cb_counter = counter.clone();

        let id = engine.start_check(
            AddrFamily::Ipv4,
            2,
            Some("eth0"),
            move |_, state, error| {
                cb_counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((state, error));
            },
        );

        assert!(engine.cancel_check(id));
        // callback already fired when cancel_check returned
        let (state, error) = rx.await.unwrap();
        assert_eq!(state, ReachabilityState::Error);
        assert_eq!(error, Some(CheckError::Cancelled));

        // a second cancel finds nothing
        assert!(!engine.cancel_check(id));
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_after_cancel_does_not_fire_twice() {
        let transport = Arc::new(ScriptedTransport::new(vec![TransportEvent::Done {
            status: StatusCode::NO_CONTENT,
        }]));
        let engine = engine_with(transport);
        let counter = Arc::new(AtomicUsize::new(0));
        let cb_counter = counter.clone();

        let id = engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), move |_, _, _| {
            cb_counter.fetch_add(1, Ordering::SeqCst);
        });
        engine.cancel_check(id);

        // give any leftover completion path a chance to run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_times_out_to_limited() {
        let engine = engine_with(Arc::new(NeverTransport));
        let (rx, callback) = callback_channel();

        engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), callback);
        tokio::time::advance(CHECK_TIMEOUT + Duration::from_secs(1)).await;

        let (_, state, error) = rx.await.unwrap();
        assert_eq!(state, ReachabilityState::Limited);
        assert_eq!(error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_covers_stalled_resolution() {
        let engine =
            ConnectivityEngine::new(Arc::new(NeverTransport), Arc::new(StallingResolver));
        engine.apply_config(&ConnectivitySettings {
            uri: Some("http://check.example.org/probe".to_string()),
            ..Default::default()
        });
        let (rx, callback) = callback_channel();

        engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), callback);
        tokio::time::advance(CHECK_TIMEOUT + Duration::from_secs(1)).await;

        let (_, state, error) = rx.await.unwrap();
        assert_eq!(state, ReachabilityState::Limited);
        assert_eq!(error, None);
        assert_eq!(engine.active_checks(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_all_checks() {
        let engine = engine_with(Arc::new(NeverTransport));
        let (rx1, cb1) = callback_channel();
        let (rx2, cb2) = callback_channel();

        engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), cb1);
        engine.start_check(AddrFamily::Ipv6, 3, Some("wlan0"), cb2);
        assert_eq!(engine.active_checks(), 2);

        engine.shutdown();
        assert_eq!(engine.active_checks(), 0);

        for rx in [rx1, rx2] {
            let (_, state, error) = rx.await.unwrap();
            assert_eq!(state, ReachabilityState::Error);
            assert_eq!(error, Some(CheckError::ShuttingDown));
        }
    }

    #[tokio::test]
    async fn test_resolver_addresses_seed_the_transport() {
        let transport = Arc::new(ScriptedTransport::new(vec![TransportEvent::Body(
            Bytes::from_static(b"OK"),
        )]));
        let engine = engine_with_resolver(
            transport.clone(),
            MockResolver {
                addrs: Some(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9))]),
            },
        );
        let (rx, callback) = callback_channel();

        engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), callback);
        rx.await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].resolve,
            vec![ResolvedAddress {
                host: "check.example.org".to_string(),
                port: 80,
                addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)),
            }]
        );
        assert_eq!(requests[0].ifname.as_deref(), Some("eth0"));
    }

    #[tokio::test]
    async fn test_unavailable_resolver_leaves_seed_empty() {
        let transport = Arc::new(ScriptedTransport::new(vec![TransportEvent::Body(
            Bytes::from_static(b"OK"),
        )]));
        let engine = engine_with(transport.clone());
        let (rx, callback) = callback_channel();

        engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), callback);
        rx.await.unwrap();

        assert!(transport.requests.lock().unwrap()[0].resolve.is_empty());
    }

    #[tokio::test]
    async fn test_reload_does_not_affect_in_flight_check() {
        let (release, gate) = oneshot::channel();
        let transport = Arc::new(GatedTransport {
            gate: Mutex::new(Some(gate)),
            script: Mutex::new(vec![
                TransportEvent::Body(Bytes::from_static(b"OK")),
                TransportEvent::Done {
                    status: StatusCode::OK,
                },
            ]),
        });
        // expected response is "OK" at start time
        let engine = engine_with(transport);
        let (rx, callback) = callback_channel();
        engine.start_check(AddrFamily::Ipv4, 2, Some("eth0"), callback);

        // reload with a different expected response while the exchange is held
        assert!(engine.apply_config(&ConnectivitySettings {
            uri: Some("http://check.example.org/probe".to_string()),
            response: Some("something else entirely".to_string()),
            ..Default::default()
        }));
        release.send(()).unwrap();

        // the body matches the snapshot the check started with
        let (_, state, error) = rx.await.unwrap();
        assert_eq!(state, ReachabilityState::Full);
        assert_eq!(error, None);
    }

    #[tokio::test]
    async fn test_check_runs_against_start_time_config() {
        let transport = Arc::new(NeverTransport);
        let engine = engine_with(transport);
        let before = engine.config();

        engine.apply_config(&ConnectivitySettings {
            uri: Some("http://other.example.org/".to_string()),
            ..Default::default()
        });

        assert_eq!(before.host.as_deref(), Some("check.example.org"));
        assert_eq!(engine.config().host.as_deref(), Some("other.example.org"));
    }

    #[test]
    fn test_interval_zero_when_disabled() {
        let engine = ConnectivityEngine::new(
            Arc::new(NeverTransport),
            Arc::new(MockResolver { addrs: None }),
        );
        assert_eq!(engine.interval(), Duration::ZERO);
        assert!(!engine.check_enabled());

        engine.apply_config(&ConnectivitySettings {
            uri: Some("http://check.example.org/".to_string()),
            interval_secs: 60,
            ..Default::default()
        });
        assert_eq!(engine.interval(), Duration::from_secs(60));
    }
}
