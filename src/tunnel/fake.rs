//! Scriptable in-memory transport for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use super::{Connection, FailureSender, HandleId, TunnelFailure, TunnelHandle, TunnelTransport};
use crate::{Error, IngressKey, Result, desired::DesiredTunnelSpec};

#[derive(Default)]
struct State {
    /// Number of upcoming `open` calls that fail.
    failing_opens: usize,
    failing_closes: usize,
    open_delay: Option<Duration>,
    live: HashMap<HandleId, (IngressKey, FailureSender)>,
    unhealthy: HashSet<HandleId>,
    opened: Vec<DesiredTunnelSpec>,
    closed: Vec<HandleId>,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<State>,
}

impl FakeTransport {
    pub fn fail_next_opens(&self, n: usize) {
        self.state.lock().unwrap().failing_opens = n;
    }

    pub fn fail_next_closes(&self, n: usize) {
        self.state.lock().unwrap().failing_closes = n;
    }

    pub fn delay_opens(&self, delay: Duration) {
        self.state.lock().unwrap().open_delay = Some(delay);
    }

    pub fn mark_unhealthy(&self, handle: HandleId) {
        self.state.lock().unwrap().unhealthy.insert(handle);
    }

    /// Reports connection loss for every live tunnel of `key`, as the real transport would.
    pub fn drop_connection(&self, key: &IngressKey) {
        let state = self.state.lock().unwrap();
        for (handle, (owner, failures)) in &state.live {
            if owner == key {
                let _ = failures.send(TunnelFailure {
                    key: owner.clone(),
                    handle: *handle,
                    reason: "connection reset".into(),
                });
            }
        }
    }

    pub fn opened(&self) -> Vec<DesiredTunnelSpec> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opened.len()
    }

    pub fn closed(&self) -> Vec<HandleId> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn live_handle(&self, key: &IngressKey) -> Option<HandleId> {
        let state = self.state.lock().unwrap();
        state.live.iter().find(|(_, (owner, _))| owner == key).map(|(id, _)| *id)
    }
}

#[async_trait]
impl TunnelTransport for FakeTransport {
    async fn open(&self, spec: &DesiredTunnelSpec, failures: FailureSender) -> Result<TunnelHandle> {
        let delay = self.state.lock().unwrap().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.opened.push(spec.clone());
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(Error::TransportError("edge unreachable".into()));
        }
        let connections = spec
            .routes
            .iter()
            .map(|r| Connection {
                host: r.host.clone(),
                namespace: r.origin_secret.namespace.clone(),
                name: format!("fake-{}", r.host),
            })
            .collect();
        let handle = TunnelHandle::new(spec.key.clone(), connections);
        state.live.insert(handle.id, (spec.key.clone(), failures));
        Ok(handle)
    }

    async fn close(&self, handle: &TunnelHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_closes > 0 {
            state.failing_closes -= 1;
            return Err(Error::TransportError("close failed".into()));
        }
        state.live.remove(&handle.id);
        state.closed.push(handle.id);
        Ok(())
    }

    async fn check(&self, handle: &TunnelHandle) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.live.contains_key(&handle.id) && !state.unhealthy.contains(&handle.id))
    }
}
