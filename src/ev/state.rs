//! Charging session lifecycle.
//!
//! The control signals polled from the charger are noisy and lag behind the
//! commands sent to it: a vehicle may need a while to start drawing current
//! after the relay closes. The state machine only moves to [`ChargerState::Charging`]
//! once charging is actually observed, while [`ChargingStateMachine::is_on`]
//! keeps the relay energized for a grace period after a start request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Seconds to wait for the vehicle to start charging after a start request
pub const DEFAULT_DETECTION_DELAY_SECONDS: u32 = 300;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChargerState {
    NotConnected,
    Connected,
    Charging,
    ChargingCompleted,
    Error,
}

/// Control signals polled from the charger once per cycle.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ControlSignals {
    pub vehicle_connected: bool,
    pub vehicle_not_connected: bool,
    pub charging: bool,
    pub in_error: bool,
}

#[derive(Debug, Clone)]
pub struct ChargingSession {
    pub state: ChargerState,
    /// Number of times each state was entered since the last reset
    pub entries: BTreeMap<ChargerState, usize>,
    pub start_requested: bool,
    pub stop_requested: bool,
    pub detection_delay_seconds: u32,
    pub attempt_started_at_millis: Option<i64>,
}

impl ChargingSession {
    pub fn new(detection_delay_seconds: u32) -> Self {
        let mut session = Self {
            state: ChargerState::NotConnected,
            entries: BTreeMap::new(),
            start_requested: false,
            stop_requested: false,
            detection_delay_seconds,
            attempt_started_at_millis: None,
        };
        session.enter(ChargerState::NotConnected);
        session
    }

    fn enter(&mut self, state: ChargerState) {
        self.state = state;
        *self.entries.entry(state).or_insert(0) += 1;
    }

    fn reset(&mut self) {
        *self = ChargingSession::new(self.detection_delay_seconds);
    }

    fn entry_count(&self, state: ChargerState) -> usize {
        self.entries.get(&state).copied().unwrap_or(0)
    }
}

/// Rule deciding whether a state counts as "entered one time".
pub trait OneTimeVisitPolicy {
    fn was_in_state_one_time(&mut self, session: &ChargingSession, state: ChargerState) -> bool;
}

/// True while `state` has been entered exactly once since the last reset.
#[derive(Debug, Default, Clone)]
pub struct SingleEntry;

impl OneTimeVisitPolicy for SingleEntry {
    fn was_in_state_one_time(&mut self, session: &ChargingSession, state: ChargerState) -> bool {
        session.entry_count(state) == 1
    }
}

/// True once per entry into `state`; further queries return false until the
/// state is entered again.
#[derive(Debug, Default, Clone)]
pub struct EdgeLatch {
    reported: Vec<(ChargerState, usize)>,
}

impl OneTimeVisitPolicy for EdgeLatch {
    fn was_in_state_one_time(&mut self, session: &ChargingSession, state: ChargerState) -> bool {
        let entries = session.entry_count(state);
        let reported = self
            .reported
            .iter_mut()
            .find(|(s, _)| *s == state);
        match reported {
            // the session was reset since the last report
            Some((_, n)) if *n > entries => {
                *n = entries;
                entries > 0
            }
            Some((_, n)) if *n == entries => false,
            Some((_, n)) => {
                *n = entries;
                true
            }
            None => {
                self.reported.push((state, entries));
                entries > 0
            }
        }
    }
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub state: ChargerState,
    pub relay_on: bool,
    /// False while a start request waits for charging to be observed
    pub start_confirmed: bool,
    /// States entered during this evaluation, in order
    pub entered: Vec<ChargerState>,
}

pub struct ChargingStateMachine<P: OneTimeVisitPolicy = SingleEntry> {
    appliance_id: String,
    session: ChargingSession,
    policy: P,
}

impl ChargingStateMachine<SingleEntry> {
    pub fn new(appliance_id: &str, detection_delay_seconds: u32) -> Self {
        Self::with_policy(appliance_id, detection_delay_seconds, SingleEntry)
    }
}

impl<P: OneTimeVisitPolicy> ChargingStateMachine<P> {
    pub fn with_policy(appliance_id: &str, detection_delay_seconds: u32, policy: P) -> Self {
        Self {
            appliance_id: appliance_id.to_owned(),
            session: ChargingSession::new(detection_delay_seconds),
            policy,
        }
    }

    pub fn state(&self) -> ChargerState {
        self.session.state
    }

    pub fn session(&self) -> &ChargingSession {
        &self.session
    }

    pub fn reset(&mut self) {
        self.session.reset();
    }

    /// Request charging to start. The detection delay starts over with the
    /// next evaluation.
    pub fn request_start_charging(&mut self) {
        self.session.start_requested = true;
        self.session.stop_requested = false;
        self.session.attempt_started_at_millis = None;
    }

    pub fn request_stop_charging(&mut self, requested: bool) {
        self.session.stop_requested = requested;
        if requested {
            self.session.start_requested = false;
            self.session.attempt_started_at_millis = None;
        }
    }

    pub fn was_in_state(&self, state: ChargerState) -> bool {
        self.session.entries.contains_key(&state)
    }

    pub fn was_in_state_one_time(&mut self, state: ChargerState) -> bool {
        self.policy.was_in_state_one_time(&self.session, state)
    }

    /// Advance the session with the signals polled in this cycle.
    ///
    /// Transitions are applied until none fires any more, so evaluating the
    /// same signals again in the same cycle leaves the state unchanged.
    pub fn evaluate(&mut self, signals: &ControlSignals, now: DateTime<Utc>) -> Evaluation {
        let now_millis = now.timestamp_millis();
        if self.session.start_requested && self.session.attempt_started_at_millis.is_none() {
            self.session.attempt_started_at_millis = Some(now_millis);
        }

        let mut entered = Vec::new();
        let mut seen = vec![self.session.state];
        loop {
            let current = self.session.state;
            let next = self.next_state(current, signals);
            if next == current || seen.contains(&next) {
                break;
            }
            self.transition(current, next);
            entered.push(next);
            seen.push(next);
        }

        let relay_on = self.is_on(
            self.session.detection_delay_seconds,
            now_millis,
            self.session.attempt_started_at_millis,
        );
        if !relay_on && self.session.start_requested && self.session.attempt_started_at_millis.is_some() {
            info!(
                appliance = %self.appliance_id,
                "Vehicle did not start charging within {}s, start request abandoned",
                self.session.detection_delay_seconds
            );
            self.session.start_requested = false;
            self.session.attempt_started_at_millis = None;
        }

        Evaluation {
            state: self.session.state,
            relay_on,
            start_confirmed: !self.session.start_requested,
            entered,
        }
    }

    fn next_state(&self, from: ChargerState, signals: &ControlSignals) -> ChargerState {
        use ChargerState::*;
        let start = self.session.start_requested && signals.charging;
        match from {
            // contradicting connection signals keep the vehicle disconnected
            NotConnected if signals.vehicle_connected && !signals.vehicle_not_connected => Connected,
            Connected if signals.vehicle_not_connected => NotConnected,
            Connected if start => Charging,
            Charging if signals.vehicle_not_connected => NotConnected,
            Charging if signals.in_error => Error,
            Charging if !signals.charging && self.session.stop_requested => Connected,
            Charging if !signals.charging => ChargingCompleted,
            ChargingCompleted if signals.vehicle_not_connected => NotConnected,
            ChargingCompleted if start => Charging,
            Error if signals.vehicle_not_connected => NotConnected,
            Error if !signals.in_error && signals.charging => Charging,
            s => s,
        }
    }

    fn transition(&mut self, from: ChargerState, to: ChargerState) {
        info!(
            appliance = %self.appliance_id,
            "Vehicle state changed: previousState={:?} newState={:?}", from, to
        );
        match to {
            ChargerState::NotConnected => {
                self.session.reset();
                return;
            }
            ChargerState::Charging => {
                self.session.start_requested = false;
                self.session.attempt_started_at_millis = None;
            }
            ChargerState::Connected if from == ChargerState::Charging => {
                self.session.stop_requested = false;
            }
            _ => {}
        }
        self.session.enter(to);
    }

    /// Whether the relay should be energized.
    pub fn is_on(
        &self,
        detection_delay_seconds: u32,
        now_millis: i64,
        attempt_started_at_millis: Option<i64>,
    ) -> bool {
        if self.session.state == ChargerState::Charging {
            return true;
        }
        let within = within_detection_delay(detection_delay_seconds, now_millis, attempt_started_at_millis);
        if within {
            debug!(appliance = %self.appliance_id, "Within start charging state detection delay");
        }
        within
    }

    #[cfg(test)]
    pub(crate) fn set_state(&mut self, state: ChargerState) {
        self.session.enter(state);
    }
}

pub fn within_detection_delay(
    detection_delay_seconds: u32,
    now_millis: i64,
    attempt_started_at_millis: Option<i64>,
) -> bool {
    match attempt_started_at_millis {
        Some(started) => now_millis - started <= detection_delay_seconds as i64 * 1000,
        None => false,
    }
}
