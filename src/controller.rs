//! Wires the queue, workers, repair scheduler, resync and failure intake into one engine.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    IngressKey, Result,
    config::ControllerConfig,
    lookup::ResourceLookup,
    metrics::{Metrics, run_reporter},
    queue::WorkQueue,
    reconciler::Reconciler,
    repair::RepairScheduler,
    simpleevent::SimpleEventRecorder,
    store::StateStore,
    tunnel::{FailureReceiver, TunnelTransport, failure_channel},
    worker::WorkerPool,
};

pub struct Controller {
    config: Arc<ControllerConfig>,
    lookup: Arc<dyn ResourceLookup>,
    transport: Arc<dyn TunnelTransport>,
    store: Arc<StateStore>,
    queue: Arc<WorkQueue<IngressKey>>,
    metrics: Arc<Metrics>,
    events: Option<SimpleEventRecorder>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        queue: Arc<WorkQueue<IngressKey>>,
        lookup: Arc<dyn ResourceLookup>,
        transport: Arc<dyn TunnelTransport>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            lookup,
            transport,
            store: Arc::new(StateStore::new()),
            queue,
            metrics,
            events: None,
        })
    }

    pub fn with_events(mut self, events: SimpleEventRecorder) -> Self {
        self.events = Some(events);
        self
    }

    pub fn queue(&self) -> Arc<WorkQueue<IngressKey>> {
        self.queue.clone()
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.store.clone()
    }

    ///
    /// Runs the engine until `shutdown` fires, then stops accepting work, lets the workers
    /// finish their current keys, drops all repair timers and closes every remaining tunnel.
    ///
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let timers_stop = CancellationToken::new();
        let (repairs, timers) = RepairScheduler::spawn(self.queue.clone(), timers_stop.clone());
        let (failures_tx, failures_rx) = failure_channel();

        let mut reconciler = Reconciler::new(
            self.config.clone(),
            self.lookup.clone(),
            self.transport.clone(),
            self.store.clone(),
            repairs.clone(),
            failures_tx,
        )?;
        if let Some(events) = self.events.clone() {
            reconciler = reconciler.with_events(events);
        }
        let reconciler = Arc::new(reconciler);
        let pool = WorkerPool::spawn(self.config.workers, self.queue.clone(), reconciler.clone(), repairs.clone());

        let mut background = JoinSet::new();
        background.spawn(resync(
            self.config.clone(),
            self.lookup.clone(),
            self.transport.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.metrics.clone(),
            shutdown.clone(),
        ));
        background.spawn(intake_failures(
            failures_rx,
            self.store.clone(),
            self.queue.clone(),
            self.metrics.clone(),
            shutdown.clone(),
        ));
        background.spawn(run_reporter(
            self.metrics.clone(),
            self.store.clone(),
            repairs,
            self.queue.clone(),
            self.config.metrics_interval,
            shutdown.clone(),
        ));

        shutdown.cancelled().await;
        info!("Shutting down, {} key(s) still queued", self.queue.len());

        self.queue.shutdown();
        pool.join().await;
        timers_stop.cancel();
        if let Err(e) = timers.await {
            warn!("Repair scheduler terminated abnormally: {e}");
        }
        while let Some(result) = background.join_next().await {
            if let Err(e) = result {
                warn!("Background task terminated abnormally: {e}");
            }
        }

        reconciler.teardown().await;
        info!("Controller stopped");
        Ok(())
    }
}

///
/// Re-enqueues every known Ingress and every stored key each resync period, starting
/// immediately. This is also the only way out of `Failed`.
///
async fn resync(
    config: Arc<ControllerConfig>,
    lookup: Arc<dyn ResourceLookup>,
    transport: Arc<dyn TunnelTransport>,
    store: Arc<StateStore>,
    queue: Arc<WorkQueue<IngressKey>>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.resync_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut enqueued = 0;
        match lookup.ingress_keys().await {
            Ok(keys) => {
                for key in keys {
                    enqueued += usize::from(queue.enqueue(key));
                }
            }
            Err(e) => warn!("Resync could not list Ingresses: {e}"),
        }
        for key in store.keys() {
            enqueued += usize::from(queue.enqueue(key));
        }
        metrics.resyncs.inc();
        debug!("Resync enqueued {enqueued} key(s)");

        if let Err(e) = transport.sweep().await {
            warn!("Failed to sweep orphaned tunnels: {e}");
        }
    }
}

/// Turns asynchronous transport failures into reconcile requests.
async fn intake_failures(
    mut failures: FailureReceiver,
    store: Arc<StateStore>,
    queue: Arc<WorkQueue<IngressKey>>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    loop {
        let failure = tokio::select! {
            _ = shutdown.cancelled() => break,
            failure = failures.recv() => failure,
        };
        let Some(failure) = failure else {
            break;
        };
        if store.note_failure(&failure.key, failure.handle, failure.reason) {
            metrics.tunnel_failures.inc();
            queue.enqueue(failure.key);
        } else {
            debug!("Ignoring failure of released tunnel `{}`", failure.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::task::JoinHandle;

    use super::*;
    use crate::{
        fixtures::{FakeLookup, ingress, origin_secret, service},
        repair::RepairBackoff,
        secret::SecretRef,
        store::TunnelState,
        tunnel::fake::FakeTransport,
    };

    struct Running {
        lookup: Arc<FakeLookup>,
        transport: Arc<FakeTransport>,
        store: Arc<StateStore>,
        queue: Arc<WorkQueue<IngressKey>>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
        engine: JoinHandle<Result<()>>,
    }

    fn key() -> IngressKey {
        IngressKey::new("shop", "storefront")
    }

    fn start() -> Running {
        let lookup = Arc::new(FakeLookup::default());
        lookup.put_service(service("shop", "web", &[("http", 80)]));
        lookup.put_secret(origin_secret("cloudflare", "origin"));
        lookup.put_ingress(ingress("shop", "storefront", "argo-tunnel", "shop.example.com", "web", 80));
        let transport = Arc::new(FakeTransport::default());
        let metrics = Arc::new(Metrics::new().unwrap());

        let config = ControllerConfig {
            default_secret: Some(SecretRef::new("cloudflare", "origin")),
            resync_period: Duration::from_secs(60),
            workers: 2,
            repair: RepairBackoff {
                delay: Duration::from_secs(1),
                jitter: 0.1,
                steps: 3,
            },
            ..Default::default()
        };
        let controller = Controller::new(
            config,
            Arc::new(WorkQueue::new()),
            lookup.clone(),
            transport.clone(),
            metrics.clone(),
        )
        .unwrap();
        let store = controller.store();
        let queue = controller.queue();
        let shutdown = CancellationToken::new();
        let engine = tokio::spawn(controller.run(shutdown.clone()));

        Running {
            lookup,
            transport,
            store,
            queue,
            metrics,
            shutdown,
            engine,
        }
    }

    impl Running {
        async fn stop(self) -> (Arc<FakeTransport>, Arc<StateStore>) {
            self.shutdown.cancel();
            self.engine.await.unwrap().unwrap();
            (self.transport, self.store)
        }
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        let result = Controller::new(
            config,
            Arc::new(WorkQueue::new()),
            Arc::new(FakeLookup::default()),
            Arc::new(FakeTransport::default()),
            Arc::new(Metrics::new().unwrap()),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn initial_resync_opens_existing_ingresses() {
        let engine = start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.store.state(&key()), Some(TunnelState::Running));
        assert_eq!(engine.transport.live(), 1);
        assert_eq!(engine.metrics.resyncs.get(), 1);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_is_repaired() {
        let engine = start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = engine.transport.live_handle(&key()).unwrap();

        engine.transport.drop_connection(&key());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.store.state(&key()), Some(TunnelState::Repairing));
        assert_eq!(engine.metrics.tunnel_failures.get(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.store.state(&key()), Some(TunnelState::Running));
        let second = engine.transport.live_handle(&key()).unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.transport.live(), 1);
        assert_eq!(engine.store.view(&key()).unwrap().repair.count, 0);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn watch_event_removes_deleted_ingress() {
        let engine = start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.transport.live(), 1);

        engine.lookup.remove_ingress(&key());
        engine.queue.enqueue(key());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.transport.live(), 0);
        assert!(engine.store.is_empty());
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resync_retries_failed_keys() {
        let engine = start();
        engine.transport.fail_next_opens(4);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(engine.store.state(&key()), Some(TunnelState::Failed));
        assert_eq!(engine.transport.open_count(), 4);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(engine.metrics.resyncs.get(), 2);
        assert_eq!(engine.store.state(&key()), Some(TunnelState::Running));
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_every_tunnel() {
        let engine = start();
        engine
            .lookup
            .put_ingress(ingress("shop", "checkout", "argo-tunnel", "pay.example.com", "web", 80));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.transport.live(), 2);

        let queue = engine.queue.clone();
        let (transport, store) = engine.stop().await;
        assert_eq!(transport.live(), 0);
        assert!(store.is_empty());
        assert!(queue.is_shutting_down());
        assert!(!queue.enqueue(key()));
    }
}
