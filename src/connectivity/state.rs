use crate::models::{ConnectivityState, DegradedReason};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    OsOffline,
    OsOnline,
    ProbeSucceeded,
    ProbeResourceExhausted,
    ProbeFailed,
    /// Out-of-band resource exhaustion reported by any component.
    ResourceError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
    /// Entered `Online` from any other state.
    pub recovered: bool,
}

/// Next state for `event`, or `None` when the event changes nothing.
///
/// `Offline` is left only by an OS online signal; probe results and
/// resource signals arriving while offline are ignored.
pub fn transition(state: ConnectivityState, event: MonitorEvent) -> Option<Transition> {
    use ConnectivityState::{Degraded, Offline, Online};

    let next = match (state, event) {
        (Offline, MonitorEvent::OsOffline) => return None,
        (_, MonitorEvent::OsOffline) => Offline,
        (Offline, MonitorEvent::OsOnline) => Online,
        (Offline, _) => return None,
        (_, MonitorEvent::OsOnline) => return None,
        (Degraded(_), MonitorEvent::ProbeSucceeded) => Online,
        (Online, MonitorEvent::ProbeSucceeded) => return None,
        (_, MonitorEvent::ProbeResourceExhausted | MonitorEvent::ResourceError) => {
            Degraded(DegradedReason::ResourceExhausted)
        }
        (_, MonitorEvent::ProbeFailed) => Degraded(DegradedReason::ConnectionError),
    };

    if next == state {
        return None;
    }
    Some(Transition {
        from: state,
        to: next,
        recovered: next.is_online(),
    })
}

/// Persistent, dismissible notice shown while not `Online`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Banner {
    pub condition: ConnectivityState,
    pub message: String,
    pub showing_cached: bool,
    pub retry_enabled: bool,
}

pub(crate) fn banner_for(state: ConnectivityState, probe_in_flight: bool) -> Option<Banner> {
    let message = match state {
        ConnectivityState::Online => return None,
        ConnectivityState::Offline => "You are offline. Changes are saved locally and will sync when you reconnect.",
        ConnectivityState::Degraded(DegradedReason::ResourceExhausted) => {
            "The server is overloaded. Showing cached data."
        }
        ConnectivityState::Degraded(DegradedReason::ConnectionError) => "Cannot reach the server. Showing cached data.",
    };
    Some(Banner {
        condition: state,
        message: message.to_string(),
        showing_cached: true,
        retry_enabled: can_retry(state, probe_in_flight),
    })
}

pub(crate) fn can_retry(state: ConnectivityState, probe_in_flight: bool) -> bool {
    state != ConnectivityState::Offline && !probe_in_flight
}
