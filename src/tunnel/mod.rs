//! Boundary to the component that actually runs tunnels.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{IngressKey, Result, desired::DesiredTunnelSpec};

pub mod deployment;

#[cfg(test)]
pub mod fake;

/// Identifies one opened tunnel for the lifetime of the process.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Returns a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The transport-side object carrying traffic for one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub host: String,
    pub namespace: String,
    pub name: String,
}

///
/// A live tunnel. Deliberately not `Clone`: the state store owns exactly one handle per key,
/// and a handle that was closed successfully is dropped.
///
#[derive(Debug)]
pub struct TunnelHandle {
    pub id: HandleId,
    pub key: IngressKey,
    pub connections: Vec<Connection>,
}

impl TunnelHandle {
    pub fn new(key: IngressKey, connections: Vec<Connection>) -> Self {
        Self {
            id: HandleId::next(),
            key,
            connections,
        }
    }
}

/// Asynchronous report that a previously opened tunnel lost its connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelFailure {
    pub key: IngressKey,
    pub handle: HandleId,
    pub reason: String,
}

pub type FailureSender = mpsc::UnboundedSender<TunnelFailure>;
pub type FailureReceiver = mpsc::UnboundedReceiver<TunnelFailure>;

pub fn failure_channel() -> (FailureSender, FailureReceiver) {
    mpsc::unbounded_channel()
}

#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Opens a tunnel for every route of `spec`. Connection loss after a successful open is
    /// reported on `failures`, tagged with the id of the returned handle.
    async fn open(&self, spec: &DesiredTunnelSpec, failures: FailureSender) -> Result<TunnelHandle>;

    /// Closes a tunnel. Closing a tunnel that is already gone succeeds.
    async fn close(&self, handle: &TunnelHandle) -> Result<()>;

    /// Returns false if the tunnel is known to be broken.
    async fn check(&self, handle: &TunnelHandle) -> Result<bool>;

    /// Removes transport objects no live handle owns. Called on every resync.
    async fn sweep(&self) -> Result<()> {
        Ok(())
    }
}
