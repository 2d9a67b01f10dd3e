//! Backoff computation and the timer arena that re-enqueues keys due for repair.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use log::{debug, info};
use rand::Rng;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{
    sync::CancellationToken,
    time::{DelayQueue, delay_queue},
};

use crate::{IngressKey, queue::WorkQueue};

///
/// Exponential backoff with multiplicative jitter, capped after a fixed number of steps.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RepairBackoff {
    /// Delay before the first repair attempt.
    pub delay: Duration,
    /// Jitter as a fraction of the computed delay, in `[0, 1)`.
    pub jitter: f64,
    /// Number of timed attempts before a key is given up on until the next resync.
    pub steps: u32,
}

impl RepairBackoff {
    /// The un-jittered delay for 1-indexed `attempt`, `delay * 2^(attempt-1)` capped at
    /// `delay * 2^(steps-1)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.clamp(1, self.steps.max(1)) - 1;
        self.delay.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
    }

    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        base.mul_f64(factor.max(0.0))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Upper bound on any delay this backoff hands out.
    pub fn max_delay(&self) -> Duration {
        self.base_delay(self.steps).mul_f64(1.0 + self.jitter.max(0.0))
    }

    /// True while `attempt` still gets a timed retry.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.steps
    }
}

#[derive(Debug)]
enum Command {
    Schedule(IngressKey, Duration),
    Cancel(IngressKey),
}

///
/// Handle to the repair timer task. Cloning is cheap; all clones feed the same arena.
///
#[derive(Clone, Debug)]
pub struct RepairScheduler {
    commands: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
}

impl RepairScheduler {
    /// Starts the timer task. Expired timers enqueue their key on `queue`; cancelling
    /// `shutdown` drops every pending timer and ends the task.
    pub fn spawn(queue: Arc<WorkQueue<IngressKey>>, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run_timers(rx, queue, pending.clone(), shutdown));
        (RepairScheduler { commands, pending }, task)
    }

    /// Arms (or re-arms) the timer for `key`.
    pub fn schedule(&self, key: IngressKey, delay: Duration) {
        let _ = self.commands.send(Command::Schedule(key, delay));
    }

    /// Disarms the timer for `key`, if any.
    pub fn cancel(&self, key: &IngressKey) {
        let _ = self.commands.send(Command::Cancel(key.clone()));
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct TimerArena {
    timers: DelayQueue<IngressKey>,
    index: HashMap<IngressKey, delay_queue::Key>,
}

impl TimerArena {
    fn arm(&mut self, key: IngressKey, delay: Duration) {
        match self.index.get(&key) {
            Some(timer) => self.timers.reset(timer, delay),
            None => {
                let timer = self.timers.insert(key.clone(), delay);
                self.index.insert(key, timer);
            }
        }
    }

    fn disarm(&mut self, key: &IngressKey) -> bool {
        match self.index.remove(key) {
            Some(timer) => {
                self.timers.remove(&timer);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

async fn run_timers(
    mut commands: mpsc::UnboundedReceiver<Command>,
    queue: Arc<WorkQueue<IngressKey>>,
    pending: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    let mut arena = TimerArena::default();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Schedule(key, delay)) => {
                    debug!("Repair of `{key}` scheduled in {delay:?}");
                    arena.arm(key, delay);
                }
                Some(Command::Cancel(key)) => {
                    if arena.disarm(&key) {
                        debug!("Repair timer of `{key}` cancelled");
                    }
                }
                None => break,
            },
            Some(expired) = arena.timers.next(), if !arena.timers.is_empty() => {
                let key = expired.into_inner();
                arena.index.remove(&key);
                debug!("Repair timer of `{key}` fired");
                queue.enqueue(key);
            }
        }
        pending.store(arena.len(), Ordering::Relaxed);
    }

    if arena.len() > 0 {
        info!("Dropping {} pending repair timer(s)", arena.len());
    }
    pending.store(0, Ordering::Relaxed);
}
