use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use super::ApiError;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 50;
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(15);

/// Authorization header to replay with, or the reason the refresh failed.
pub(crate) type Settlement = Result<String, ApiError>;

/// Requests parked behind a reactive refresh.
///
/// The first request to hit a 401 leads the refresh; the ones arriving while it runs wait
/// here and are released in arrival order when the leader settles.
#[derive(Debug)]
pub struct PendingQueue {
    state: Mutex<State>,
    capacity: usize,
    timeout: Duration,
}

#[derive(Debug, Default)]
struct State {
    leading: bool,
    waiters: VecDeque<oneshot::Sender<Settlement>>,
}

pub(crate) enum Ticket<'a> {
    Leader(Leader<'a>),
    Follower(Follower),
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE, DEFAULT_QUEUE_TIMEOUT)
    }
}

impl PendingQueue {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            capacity,
            timeout,
        }
    }

    /// Number of requests currently waiting.
    pub fn len(&self) -> usize {
        self.lock().waiters.iter().filter(|tx| !tx.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a reactive refresh currently has a leader.
    pub fn is_refreshing(&self) -> bool {
        self.lock().leading
    }

    /// Join the queue. Becomes the leader when no reactive refresh is running; rejects
    /// the caller outright when the queue is full.
    pub(crate) fn enter(&self) -> Result<Ticket<'_>, ApiError> {
        let mut state = self.lock();
        if !state.leading {
            state.leading = true;
            return Ok(Ticket::Leader(Leader {
                queue: self,
                outcome: None,
            }));
        }

        state.waiters.retain(|tx| !tx.is_closed());
        if state.waiters.len() >= self.capacity {
            debug!(capacity = self.capacity, "pending request queue full");
            return Err(ApiError::QueueOverflow);
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        debug!(position = state.waiters.len(), "request queued behind refresh");
        Ok(Ticket::Follower(Follower {
            rx,
            timeout: self.timeout,
        }))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the request driving the refresh. Dropping it without settling releases the
/// followers so one of them can take over.
pub(crate) struct Leader<'a> {
    queue: &'a PendingQueue,
    outcome: Option<Settlement>,
}

impl Leader<'_> {
    pub(crate) fn settle(mut self, outcome: Settlement) {
        self.outcome = Some(outcome);
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        let waiters = {
            let mut state = self.queue.lock();
            state.leading = false;
            std::mem::take(&mut state.waiters)
        };

        match &self.outcome {
            Some(outcome) => {
                for tx in waiters {
                    let _ = tx.send(outcome.clone());
                }
            }
            None if !waiters.is_empty() => {
                debug!(released = waiters.len(), "refresh leader went away");
            }
            None => {}
        }
    }
}

pub(crate) struct Follower {
    rx: oneshot::Receiver<Settlement>,
    timeout: Duration,
}

impl Follower {
    /// `None` when the leader went away before settling; the caller should enter again.
    pub(crate) async fn wait(self) -> Option<Settlement> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) => None,
            Err(_) => Some(Err(ApiError::QueueTimeout)),
        }
    }
}
