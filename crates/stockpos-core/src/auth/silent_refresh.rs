//! Proactive token refresh.
//!
//! The scheduler is a single task that owns one timer and reacts to explicit events sent
//! through its [`SilentRefreshHandle`]. Dropping the handle ends the task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RefreshCoordinator, Session, SessionStore};

pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(120);
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Login and other pages that work without a session.
    Public,
    Protected,
}

/// External triggers fed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The application came back to the foreground.
    Foreground,
    /// Network connectivity was restored.
    Online,
    Navigated(RouteKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Checking,
    Armed { refresh_at: DateTime<Utc> },
    Refreshing,
}

#[derive(Debug, Clone, Copy)]
pub struct SilentRefreshConfig {
    /// How long before expiry the token is refreshed.
    pub buffer: Duration,
    /// Minimum spacing between two proactive refreshes.
    pub min_interval: Duration,
}

impl Default for SilentRefreshConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_REFRESH_BUFFER,
            min_interval: DEFAULT_MIN_INTERVAL,
        }
    }
}

impl SilentRefreshConfig {
    pub fn with_buffer(buffer: Duration) -> Self {
        Self {
            buffer,
            ..Self::default()
        }
    }
}

/// What the scheduler should do for a given session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    Idle,
    Check,
    Arm { refresh_at: DateTime<Utc> },
}

pub(crate) fn plan(
    session: &Session,
    has_refresh_credential: bool,
    route: RouteKind,
    buffer: Duration,
    now: DateTime<Utc>,
) -> Plan {
    if route == RouteKind::Public || session.is_authenticating {
        return Plan::Idle;
    }

    match session.expires_at {
        Some(expires_at) if session.is_authenticated => {
            let refresh_at = expires_at - to_chrono(buffer);
            if refresh_at <= now {
                Plan::Check
            } else {
                Plan::Arm { refresh_at }
            }
        }
        _ if has_refresh_credential => Plan::Check,
        _ => Plan::Idle,
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Control surface for a running scheduler.
pub struct SilentRefreshHandle {
    events: mpsc::UnboundedSender<SchedulerEvent>,
    state: watch::Receiver<SchedulerState>,
    task: Option<JoinHandle<()>>,
}

impl SilentRefreshHandle {
    pub fn notify(&self, event: SchedulerEvent) {
        if self.events.send(event).is_err() {
            debug!(?event, "silent refresh scheduler already stopped");
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SilentRefreshHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start the scheduler on the current tokio runtime.
pub fn spawn(
    session: Arc<SessionStore>,
    refresh: RefreshCoordinator,
    config: SilentRefreshConfig,
    route: RouteKind,
) -> SilentRefreshHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
    let scheduler = Scheduler {
        session_rx: session.subscribe(),
        session,
        refresh,
        config,
        events: events_rx,
        state: state_tx,
        route,
        parked: None,
        last_refresh: None,
    };
    SilentRefreshHandle {
        events: events_tx,
        state: state_rx,
        task: Some(tokio::spawn(scheduler.run())),
    }
}

struct Scheduler {
    session: Arc<SessionStore>,
    session_rx: watch::Receiver<Session>,
    refresh: RefreshCoordinator,
    config: SilentRefreshConfig,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    state: watch::Sender<SchedulerState>,
    route: RouteKind,
    /// Session (epoch, access token) a refresh last failed for. Cleared by any trigger or
    /// once the session moves on.
    parked: Option<(u64, Option<String>)>,
    last_refresh: Option<Instant>,
}

enum Step {
    Refresh,
    Idle,
    Wait {
        delay: Duration,
        refresh_at: DateTime<Utc>,
    },
}

enum Wake {
    Timer,
    Event(SchedulerEvent),
    SessionChanged,
    Closed,
}

impl Scheduler {
    async fn run(mut self) {
        loop {
            let wake = match self.next_step() {
                Step::Refresh => {
                    self.refresh().await;
                    continue;
                }
                Step::Idle => {
                    self.publish(SchedulerState::Idle);
                    self.session.mark_hydrated();
                    self.wait(None).await
                }
                Step::Wait { delay, refresh_at } => {
                    self.publish(SchedulerState::Armed { refresh_at });
                    self.session.mark_hydrated();
                    self.wait(Some(delay)).await
                }
            };

            match wake {
                Wake::Timer => self.refresh().await,
                Wake::Event(event) => self.handle(event),
                Wake::SessionChanged => {
                    if self.parked != Some(self.session_key()) {
                        self.parked = None;
                    }
                }
                Wake::Closed => break,
            }
        }
        debug!("silent refresh scheduler stopped");
    }

    fn next_step(&mut self) -> Step {
        let session = self.session_rx.borrow_and_update().clone();
        let now = Utc::now();
        let plan = plan(
            &session,
            self.session.has_refresh_credential(),
            self.route,
            self.config.buffer,
            now,
        );

        match plan {
            Plan::Idle => Step::Idle,
            Plan::Check if self.parked.is_some() => Step::Idle,
            Plan::Check => match self.cooldown() {
                Some(delay) => Step::Wait {
                    delay,
                    refresh_at: now + to_chrono(delay),
                },
                None => {
                    self.publish(SchedulerState::Checking);
                    Step::Refresh
                }
            },
            Plan::Arm { refresh_at } => Step::Wait {
                delay: (refresh_at - now).to_std().unwrap_or_default(),
                refresh_at,
            },
        }
    }

    fn session_key(&self) -> (u64, Option<String>) {
        (
            self.session.epoch(),
            self.session_rx.borrow().access_token.clone(),
        )
    }

    /// Time left before another refresh is allowed.
    fn cooldown(&self) -> Option<Duration> {
        let elapsed = self.last_refresh?.elapsed();
        self.config.min_interval.checked_sub(elapsed).filter(|left| !left.is_zero())
    }

    async fn wait(&mut self, delay: Option<Duration>) -> Wake {
        let timer = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = timer => Wake::Timer,
            event = self.events.recv() => match event {
                Some(event) => Wake::Event(event),
                None => Wake::Closed,
            },
            changed = self.session_rx.changed() => match changed {
                Ok(()) => Wake::SessionChanged,
                Err(_) => Wake::Closed,
            },
        }
    }

    fn handle(&mut self, event: SchedulerEvent) {
        debug!(?event, "silent refresh trigger");
        self.parked = None;
        if let SchedulerEvent::Navigated(route) = event {
            self.route = route;
        }
    }

    async fn refresh(&mut self) {
        if self.cooldown().is_some() {
            return;
        }
        self.publish(SchedulerState::Refreshing);
        let result = self.refresh.request_refresh().await;
        self.last_refresh = Some(Instant::now());

        match result {
            Ok(token) => {
                info!(expires_in = token.expires_in, "session refreshed ahead of expiry");
                self.parked = None;
            }
            Err(err) => {
                warn!(error = %err, "proactive refresh failed; waiting for a trigger");
                self.parked = Some(self.session_key());
            }
        }
        self.session.mark_hydrated();
    }

    fn publish(&self, state: SchedulerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(?state, "silent refresh state");
                *current = state;
                true
            }
        });
    }
}
