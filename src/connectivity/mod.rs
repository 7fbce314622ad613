//! Single authoritative connectivity state, driven by OS signals, health
//! probes and out-of-band resource errors.

pub mod probe;
pub mod state;

pub use probe::{HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use state::{transition, Banner, MonitorEvent, Transition};

use crate::bus::{Notification, NotificationBus};
use crate::config::SyncSettings;
use crate::models::ConnectivityState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<Mutex<ConnectivityState>>,
    // Bumped by every OS-driven transition; probe results from an older generation are dropped.
    generation: Arc<AtomicU64>,
    probe_in_flight: Arc<AtomicBool>,
    // Set by an OS-driven trigger that found a health check outstanding.
    recheck_requested: Arc<AtomicBool>,
    banner_dismissed: Arc<AtomicBool>,
    probe: Arc<dyn HealthProbe>,
    bus: NotificationBus,
    interval: Duration,
    probe_timeout: Duration,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.state())
            .field("probe_in_flight", &self.probe_in_flight())
            .field("interval", &self.interval)
            .finish()
    }
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, bus: NotificationBus, settings: &SyncSettings) -> Self {
        let initial = if settings.initially_online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        Self {
            state: Arc::new(Mutex::new(initial)),
            generation: Arc::new(AtomicU64::new(0)),
            probe_in_flight: Arc::new(AtomicBool::new(false)),
            recheck_requested: Arc::new(AtomicBool::new(false)),
            banner_dismissed: Arc::new(AtomicBool::new(false)),
            probe,
            bus,
            interval: settings.probe_interval(),
            probe_timeout: settings.probe_timeout(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectivityState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectivityState {
        *self.lock_state()
    }

    pub fn probe_in_flight(&self) -> bool {
        self.probe_in_flight.load(Ordering::SeqCst)
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Feeds one event through the state machine and announces any transition.
    pub fn apply(&self, event: MonitorEvent) -> Option<Transition> {
        self.apply_guarded(event, None)
    }

    fn apply_guarded(&self, event: MonitorEvent, ticket: Option<u64>) -> Option<Transition> {
        let step = {
            let mut state = self.lock_state();
            if let Some(ticket) = ticket {
                if self.generation.load(Ordering::SeqCst) != ticket {
                    tracing::debug!(?event, "stale probe result discarded");
                    return None;
                }
            }
            let step = transition(*state, event)?;
            *state = step.to;
            if matches!(event, MonitorEvent::OsOnline | MonitorEvent::OsOffline) {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            step
        };

        self.banner_dismissed.store(false, Ordering::SeqCst);
        tracing::info!(from = %step.from, to = %step.to, ?event, "connectivity changed");
        self.bus.publish(Notification::ConnectivityChanged(step.to));
        if step.recovered {
            self.bus.publish(Notification::RefreshData);
        }
        Some(step)
    }

    /// OS reported the network is back. Probes right away on a transition.
    pub async fn os_online(&self) -> Option<Transition> {
        let step = self.apply(MonitorEvent::OsOnline)?;
        self.run_check(true).await;
        Some(step)
    }

    pub fn os_offline(&self) -> Option<Transition> {
        self.apply(MonitorEvent::OsOffline)
    }

    pub fn report_resource_error(&self) -> Option<Transition> {
        self.apply(MonitorEvent::ResourceError)
    }

    /// Runs one health probe unless offline or another probe is outstanding.
    pub async fn probe_now(&self) -> Option<ProbeOutcome> {
        self.run_check(false).await
    }

    /// With `after_os_signal` set, a check that is already outstanding owes
    /// one more run once it settles, since its own result will be stale.
    async fn run_check(&self, after_os_signal: bool) -> Option<ProbeOutcome> {
        if after_os_signal {
            self.recheck_requested.store(true, Ordering::SeqCst);
        }
        let mut last = None;
        loop {
            if self.state() == ConnectivityState::Offline {
                tracing::debug!("offline, probe skipped");
                return last;
            }
            if self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                tracing::debug!(rerun = after_os_signal, "probe already in flight, trigger dropped");
                return last;
            }
            self.recheck_requested.store(false, Ordering::SeqCst);
            last = Some(self.check_once().await);
            if !self.recheck_requested.load(Ordering::SeqCst) {
                return last;
            }
            tracing::debug!("os signal arrived mid-check, checking again");
        }
    }

    async fn check_once(&self) -> ProbeOutcome {
        let _in_flight = InFlight(&self.probe_in_flight);
        let ticket = self.generation.load(Ordering::SeqCst);

        let outcome = match tokio::time::timeout(self.probe_timeout, self.probe.check()).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Failed {
                reason: format!("health check timed out after {}ms", self.probe_timeout.as_millis()),
            },
        };
        tracing::debug!(?outcome, "probe finished");
        self.apply_guarded(outcome.event(), Some(ticket));
        outcome
    }

    pub fn can_retry(&self) -> bool {
        state::can_retry(self.state(), self.probe_in_flight())
    }

    /// Manual retry. Refused while offline or while a probe is outstanding.
    pub async fn retry_now(&self) -> Option<ProbeOutcome> {
        if !self.can_retry() {
            tracing::info!(state = %self.state(), "manual retry refused");
            return None;
        }
        self.probe_now().await
    }

    pub fn banner(&self) -> Option<Banner> {
        if self.banner_dismissed.load(Ordering::SeqCst) {
            return None;
        }
        state::banner_for(self.state(), self.probe_in_flight())
    }

    /// Hides the banner until the next transition.
    pub fn dismiss_banner(&self) {
        self.banner_dismissed.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        !self.lock_tasks().is_empty()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns the probe schedule (first probe immediately) and the
    /// `resource-error` listener. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.lock_tasks();
        if !tasks.is_empty() {
            return;
        }

        let monitor = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.probe_now().await;
            }
        }));

        let monitor = self.clone();
        let mut receiver = self.bus.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if envelope.notification == Notification::ResourceError {
                            monitor.report_resource_error();
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "connectivity listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        tracing::info!(interval_secs = self.interval.as_secs(), "connectivity monitor started");
    }

    pub fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            handle.abort();
        }
        tracing::info!("connectivity monitor stopped");
    }
}
