//! Desired and actual tunnel state per Ingress key.

use std::{
    collections::HashMap,
    fmt,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    IngressKey,
    desired::DesiredTunnelSpec,
    repair::RepairBackoff,
    tunnel::{HandleId, TunnelHandle},
};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum TunnelState {
    Absent,
    Connecting,
    Running,
    Repairing,
    Terminating,
    Failed,
}

impl TunnelState {
    pub const ALL: [TunnelState; 6] = [
        TunnelState::Absent,
        TunnelState::Connecting,
        TunnelState::Running,
        TunnelState::Repairing,
        TunnelState::Terminating,
        TunnelState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Absent => "absent",
            TunnelState::Connecting => "connecting",
            TunnelState::Running => "running",
            TunnelState::Repairing => "repairing",
            TunnelState::Terminating => "terminating",
            TunnelState::Failed => "failed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repair bookkeeping for one key. Reset whenever the tunnel reaches `Running`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairAttempt {
    pub count: u32,
    pub next_eligible: Option<Instant>,
    pub current_delay: Duration,
}

#[derive(Debug)]
struct TunnelRecord {
    state: TunnelState,
    /// Spec of the live tunnel, or of the last attempt to open one.
    desired: Option<DesiredTunnelSpec>,
    handle: Option<TunnelHandle>,
    /// Id of the handle this record owns, kept while the handle is lent out.
    active: Option<HandleId>,
    repair: RepairAttempt,
    reported_failure: Option<String>,
    /// Set between `begin_connect` and the outcome of the open.
    opening: bool,
    /// Failures reported while opening, before the handle was stored.
    early_failures: Vec<(HandleId, String)>,
}

impl TunnelRecord {
    fn new() -> Self {
        Self {
            state: TunnelState::Absent,
            desired: None,
            handle: None,
            active: None,
            repair: RepairAttempt::default(),
            reported_failure: None,
            opening: false,
            early_failures: Vec::new(),
        }
    }

    fn view(&self) -> RecordView {
        RecordView {
            state: self.state,
            desired: self.desired.clone(),
            handle: self.active,
            repair: self.repair.clone(),
            reported_failure: self.reported_failure.clone(),
        }
    }
}

/// Snapshot of a record, detached from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordView {
    pub state: TunnelState,
    pub desired: Option<DesiredTunnelSpec>,
    pub handle: Option<HandleId>,
    pub repair: RepairAttempt,
    pub reported_failure: Option<String>,
}

/// Outcome of recording a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairDecision {
    Retry(Duration),
    Exhausted,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub states: HashMap<TunnelState, usize>,
    /// Sum of the attempt counters of all keys.
    pub repair_attempts: u64,
}

impl StoreSummary {
    pub fn count(&self, state: TunnelState) -> usize {
        self.states.get(&state).copied().unwrap_or(0)
    }
}

///
/// The single owner of every [`TunnelRecord`]. Each method is one atomic step; callers never
/// hold the lock while talking to the transport.
///
#[derive(Debug, Default)]
pub struct StateStore {
    records: RwLock<HashMap<IngressKey, TunnelRecord>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<IngressKey, TunnelRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<IngressKey, TunnelRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the record for `key`, creating an `Absent` one on first observation.
    pub fn observe(&self, key: &IngressKey) -> RecordView {
        self.write().entry(key.clone()).or_insert_with(TunnelRecord::new).view()
    }

    pub fn view(&self, key: &IngressKey) -> Option<RecordView> {
        self.read().get(key).map(TunnelRecord::view)
    }

    pub fn state(&self, key: &IngressKey) -> Option<TunnelState> {
        self.read().get(key).map(|r| r.state)
    }

    /// Records the desired tunnel about to be opened. Fresh and replaced tunnels move to `Connecting`;
    /// keys under repair keep their state until the attempt resolves.
    pub fn begin_connect(&self, key: &IngressKey, desired: DesiredTunnelSpec) {
        let mut records = self.write();
        let record = records.entry(key.clone()).or_insert_with(TunnelRecord::new);
        if !matches!(record.state, TunnelState::Repairing | TunnelState::Failed) {
            record.state = TunnelState::Connecting;
        }
        record.desired = Some(desired);
        record.opening = true;
        record.early_failures.clear();
    }

    /// Stores a freshly opened handle and moves the key to `Running`. Returns true if the
    /// transport already reported this handle as failed.
    pub fn connected(&self, key: &IngressKey, handle: TunnelHandle) -> bool {
        let mut records = self.write();
        let record = records.entry(key.clone()).or_insert_with(TunnelRecord::new);
        record.state = TunnelState::Running;
        record.repair = RepairAttempt::default();
        record.active = Some(handle.id);
        record.reported_failure = record
            .early_failures
            .drain(..)
            .find(|(id, _)| *id == handle.id)
            .map(|(_, reason)| reason);
        record.early_failures.clear();
        record.opening = false;
        record.handle = Some(handle);
        record.reported_failure.is_some()
    }

    /// Counts a failed attempt. Moves the key to `Repairing` with the next backoff delay, or
    /// to `Failed` once the attempts exceed the configured steps.
    pub fn repair_failed(&self, key: &IngressKey, backoff: &RepairBackoff) -> RepairDecision {
        let mut records = self.write();
        let record = records.entry(key.clone()).or_insert_with(TunnelRecord::new);
        record.repair.count = record.repair.count.saturating_add(1);
        record.reported_failure = None;
        record.opening = false;
        record.early_failures.clear();

        if backoff.allows(record.repair.count) {
            let delay = backoff.delay(record.repair.count);
            record.state = TunnelState::Repairing;
            record.repair.current_delay = delay;
            record.repair.next_eligible = Some(Instant::now() + delay);
            RepairDecision::Retry(delay)
        } else {
            record.state = TunnelState::Failed;
            record.repair.next_eligible = None;
            RepairDecision::Exhausted
        }
    }

    /// Lends the handle out, e.g. for a health check. The record still owns its id.
    pub fn take_handle(&self, key: &IngressKey) -> Option<TunnelHandle> {
        self.write().get_mut(key).and_then(|r| r.handle.take())
    }

    pub fn restore_handle(&self, key: &IngressKey, handle: TunnelHandle) {
        if let Some(record) = self.write().get_mut(key) {
            record.active = Some(handle.id);
            record.handle = Some(handle);
        }
    }

    /// Forgets the handle after it was closed.
    pub fn release(&self, key: &IngressKey) {
        if let Some(record) = self.write().get_mut(key) {
            record.handle = None;
            record.active = None;
            record.reported_failure = None;
        }
    }

    /// Moves an existing record to `Terminating` and hands its handle (if any) to the caller.
    /// Returns `None` if there is no record.
    pub fn begin_terminate(&self, key: &IngressKey) -> Option<Option<TunnelHandle>> {
        let mut records = self.write();
        let record = records.get_mut(key)?;
        record.state = TunnelState::Terminating;
        record.repair.next_eligible = None;
        record.opening = false;
        Some(record.handle.take())
    }

    pub fn remove(&self, key: &IngressKey) -> bool {
        self.write().remove(key).is_some()
    }

    /// Notes an asynchronous failure of `handle`. Reports about handles the record no longer
    /// owns are ignored; returns true if the key needs a reconcile.
    pub fn note_failure(&self, key: &IngressKey, handle: HandleId, reason: String) -> bool {
        let mut records = self.write();
        let Some(record) = records.get_mut(key) else {
            return false;
        };
        if record.active == Some(handle) {
            record.reported_failure = Some(reason);
            true
        } else if record.opening {
            record.early_failures.push((handle, reason));
            true
        } else {
            false
        }
    }

    pub fn keys(&self) -> Vec<IngressKey> {
        let mut keys: Vec<_> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> StoreSummary {
        let mut summary = StoreSummary::default();
        for record in self.read().values() {
            *summary.states.entry(record.state).or_default() += 1;
            summary.repair_attempts += u64::from(record.repair.count);
        }
        summary
    }
}
