//! The per-key state machine that converges tunnels toward their Ingress.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::{
    Action, Error, IngressKey, Reconcile, Result,
    config::ControllerConfig,
    desired::{DesiredTunnelSpec, build_spec, class_matches},
    lookup::ResourceLookup,
    repair::RepairScheduler,
    secret::SecretResolver,
    simpleevent::SimpleEventRecorder,
    store::{RecordView, RepairDecision, StateStore, TunnelState},
    tunnel::{FailureSender, TunnelHandle, TunnelTransport},
};

pub struct Reconciler {
    config: Arc<ControllerConfig>,
    resolver: SecretResolver,
    lookup: Arc<dyn ResourceLookup>,
    transport: Arc<dyn TunnelTransport>,
    store: Arc<StateStore>,
    repairs: RepairScheduler,
    failures: FailureSender,
    events: Option<SimpleEventRecorder>,
}

impl Reconciler {
    pub fn new(
        config: Arc<ControllerConfig>,
        lookup: Arc<dyn ResourceLookup>,
        transport: Arc<dyn TunnelTransport>,
        store: Arc<StateStore>,
        repairs: RepairScheduler,
        failures: FailureSender,
    ) -> Result<Self> {
        let resolver = SecretResolver::new(&config.secret_groups, config.default_secret.clone())?;
        Ok(Self {
            config,
            resolver,
            lookup,
            transport,
            store,
            repairs,
            failures,
            events: None,
        })
    }

    pub fn with_events(mut self, events: SimpleEventRecorder) -> Self {
        self.events = Some(events);
        self
    }

    async fn bounded<T>(&self, what: String, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.operation_timeout, operation)
            .await
            .map_err(|_| Error::Timeout(what))?
    }

    async fn warn_event(&self, ingress: &Ingress, reason: &str, note: String) {
        if let Some(events) = &self.events {
            events.warn(ingress, reason, note).await;
        }
    }

    async fn try_reconcile(&self, key: &IngressKey) -> Result<Action> {
        let ingress = match self.lookup.ingress(key).await? {
            Some(ingress) if class_matches(&ingress, &self.config.ingress_class) => ingress,
            Some(_) => {
                debug!("Ingress `{key}` is not of class `{}`", self.config.ingress_class);
                return self.terminate(key).await;
            }
            None => return self.terminate(key).await,
        };

        let current = self.store.observe(key);
        let desired = match build_spec(key, &ingress, &self.config, &self.resolver, self.lookup.as_ref()).await {
            Ok(desired) => desired,
            Err(e) if e.is_config() => {
                warn!("Ingress `{key}` cannot be tunneled, leaving it {}: {e}", current.state);
                self.warn_event(&ingress, "InvalidIngress", e.to_string()).await;
                return Ok(Action::AwaitChange);
            }
            Err(e) => return Err(e),
        };

        let changed = current.desired.as_ref() != Some(&desired);
        match current.state {
            TunnelState::Absent | TunnelState::Connecting | TunnelState::Terminating => {
                self.connect(key, &ingress, desired).await
            }
            TunnelState::Running if changed => {
                info!("Configuration of `{key}` changed, replacing its tunnel");
                self.connect(key, &ingress, desired).await
            }
            TunnelState::Running => self.verify(key, &ingress, desired, current).await,
            TunnelState::Repairing if changed => {
                info!("Configuration of `{key}` changed during repair, retrying now");
                self.repairs.cancel(key);
                self.connect(key, &ingress, desired).await
            }
            TunnelState::Repairing => {
                let due = current.repair.next_eligible.is_none_or(|at| at <= Instant::now());
                if due {
                    self.connect(key, &ingress, desired).await
                } else {
                    debug!("Repair of `{key}` is not due yet");
                    Ok(Action::AwaitChange)
                }
            }
            TunnelState::Failed => {
                info!("Retrying failed tunnel for `{key}`");
                self.connect(key, &ingress, desired).await
            }
        }
    }

    /// Checks a running tunnel that still matches its Ingress.
    async fn verify(
        &self,
        key: &IngressKey,
        ingress: &Ingress,
        desired: DesiredTunnelSpec,
        current: RecordView,
    ) -> Result<Action> {
        if let Some(reason) = current.reported_failure {
            return self.begin_repair(key, ingress, &reason).await;
        }
        let Some(handle) = self.store.take_handle(key) else {
            return self.connect(key, ingress, desired).await;
        };

        let healthy = self
            .bounded(format!("checking tunnel of `{key}`"), self.transport.check(&handle))
            .await;
        self.store.restore_handle(key, handle);
        match healthy {
            Ok(true) => Ok(Action::AwaitChange),
            Ok(false) => self.begin_repair(key, ingress, "health check failed").await,
            Err(e) => {
                warn!("Could not check tunnel of `{key}`, keeping it: {e}");
                Ok(Action::AwaitChange)
            }
        }
    }

    async fn begin_repair(&self, key: &IngressKey, ingress: &Ingress, reason: &str) -> Result<Action> {
        warn!("Tunnel of `{key}` failed: {reason}");
        if let Err(e) = self.release_handle(key).await {
            warn!("Failed to close broken tunnel of `{key}`: {e}");
        }
        Ok(self.record_failure(key, ingress).await)
    }

    async fn record_failure(&self, key: &IngressKey, ingress: &Ingress) -> Action {
        match self.store.repair_failed(key, &self.config.repair) {
            RepairDecision::Retry(delay) => {
                info!("Repairing `{key}` in {delay:?}");
                Action::Repair(delay)
            }
            RepairDecision::Exhausted => {
                let note = format!(
                    "tunnel did not recover after {} repair attempts, waiting for the next resync",
                    self.config.repair.steps
                );
                warn!("Giving up on `{key}`: {note}");
                self.warn_event(ingress, "RepairFailed", note).await;
                Action::AwaitChange
            }
        }
    }

    /// Closes the handle of `key`, if any. On failure the record keeps the handle.
    async fn release_handle(&self, key: &IngressKey) -> Result<()> {
        let Some(handle) = self.store.take_handle(key) else {
            return Ok(());
        };
        match self.close(key, &handle).await {
            Ok(()) => {
                self.store.release(key);
                Ok(())
            }
            Err(e) => {
                self.store.restore_handle(key, handle);
                Err(e)
            }
        }
    }

    async fn close(&self, key: &IngressKey, handle: &TunnelHandle) -> Result<()> {
        debug!("Closing tunnel `{}` of `{key}`", handle.id);
        self.bounded(format!("closing tunnel of `{key}`"), self.transport.close(handle))
            .await
    }

    /// Replaces whatever tunnel `key` has with a fresh one for `desired`.
    async fn connect(&self, key: &IngressKey, ingress: &Ingress, desired: DesiredTunnelSpec) -> Result<Action> {
        if let Err(e) = self.release_handle(key).await {
            warn!("Failed to close previous tunnel of `{key}`: {e}");
            return Ok(self.record_failure(key, ingress).await);
        }

        let hosts = desired.hosts().collect::<Vec<_>>().join(", ");
        info!("Opening tunnel for `{key}` ({hosts})");
        self.store.begin_connect(key, desired.clone());

        let opened = self
            .bounded(
                format!("opening tunnel of `{key}`"),
                self.transport.open(&desired, self.failures.clone()),
            )
            .await;
        match opened {
            Ok(handle) => {
                self.repairs.cancel(key);
                let id = handle.id;
                if self.store.connected(key, handle) {
                    debug!("Tunnel `{id}` of `{key}` failed while connecting");
                }
                info!("Tunnel `{id}` of `{key}` is running");
                Ok(Action::AwaitChange)
            }
            Err(e) => {
                warn!("Failed to open tunnel for `{key}`: {e}");
                Ok(self.record_failure(key, ingress).await)
            }
        }
    }

    /// Drives `key` through `Terminating` and drops its record once the tunnel is closed.
    async fn terminate(&self, key: &IngressKey) -> Result<Action> {
        let Some(handle) = self.store.begin_terminate(key) else {
            return Ok(Action::AwaitChange);
        };
        self.repairs.cancel(key);

        if let Some(handle) = handle {
            info!("Closing tunnel `{}` of `{key}`", handle.id);
            if let Err(e) = self.close(key, &handle).await {
                warn!("Failed to close tunnel of `{key}`, will retry: {e}");
                self.store.restore_handle(key, handle);
                return Ok(Action::Repair(self.config.repair.delay(1)));
            }
        }

        self.store.remove(key);
        info!("Removed `{key}`");
        Ok(Action::AwaitChange)
    }

    /// Closes every tunnel the store still holds. Used once the workers have stopped.
    pub async fn teardown(&self) {
        for key in self.store.keys() {
            if let Err(e) = self.terminate(&key).await {
                warn!("Failed to tear down `{key}`: {e}");
            }
        }
        if !self.store.is_empty() {
            warn!("{} tunnel(s) could not be closed during shutdown", self.store.len());
        }
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &IngressKey) -> Action {
        debug!("Reconciling `{key}`");
        match self.try_reconcile(key).await {
            Ok(action) => action,
            Err(e) => {
                warn!("Reconcile of `{key}` failed, retrying: {e}");
                Action::Repair(self.config.repair.delay(1))
            }
        }
    }
}
