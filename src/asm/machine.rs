//! A single alarm state machine

use std::collections::VecDeque;

use tracing::debug;

use super::record::AlarmRecord;
use super::{AckResult, AlarmState, DELETE_DELAY, MICROS_PER_SEC, Micros};
use crate::UveKey;
use crate::rules::{AlarmConfig, MatchSet, Severity};

/// Change to the public alarm record caused by an input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmEvent {
    /// Record created or changed
    Updated,

    /// Record withdrawn
    Cleared,
}

/// Timer and frequency settings, refreshed from the config on every input
#[derive(Debug, Clone, Copy, Default)]
struct Timers {
    active: Micros,
    idle: Micros,
    freq_check: bool,
    freq_times: usize,
    freq_window: Micros,
}

impl From<&AlarmConfig> for Timers {
    fn from(cfg: &AlarmConfig) -> Self {
        Self {
            active: cfg.active_timer_s.saturating_mul(MICROS_PER_SEC),
            idle: cfg.idle_timer_s.saturating_mul(MICROS_PER_SEC),
            freq_check: cfg.freq_exceeded_check,
            freq_times: cfg.freq_check_times as usize,
            freq_window: cfg.freq_check_seconds.saturating_mul(MICROS_PER_SEC),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlarmStateMachine {
    state: AlarmState,
    severity: Severity,
    timers: Timers,

    /// Last time the public match set changed
    head_ts: Micros,

    active_deadline: Option<Micros>,
    idle_deadline: Option<Micros>,
    delete_deadline: Option<Micros>,

    /// Times of transitions into `Active`, oldest first
    frequency_history: VecDeque<Micros>,

    /// A clear arrived while latched by the frequency check
    pending_clear: bool,

    ack: bool,
    ack_timestamp: Option<Micros>,

    /// Last computed match set
    matches: Option<MatchSet>,
}

impl AlarmStateMachine {
    pub fn new(cfg: &AlarmConfig) -> Self {
        Self {
            state: AlarmState::Idle,
            severity: cfg.severity,
            timers: Timers::from(cfg),
            head_ts: 0,
            active_deadline: None,
            idle_deadline: None,
            delete_deadline: None,
            frequency_history: VecDeque::new(),
            pending_clear: false,
            ack: false,
            ack_timestamp: None,
            matches: None,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn head_ts(&self) -> Micros {
        self.head_ts
    }

    pub fn is_acked(&self) -> bool {
        self.ack
    }

    /// Whether an alarm record is currently published
    pub fn is_public(&self) -> bool {
        matches!(self.state, AlarmState::Active | AlarmState::SoakIdle)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Micros> {
        [self.active_deadline, self.idle_deadline, self.delete_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Feed the result of a rule evaluation
    pub fn process(&mut self, cfg: &AlarmConfig, result: Option<MatchSet>, now: Micros) -> Option<AsmEvent> {
        self.timers = Timers::from(cfg);
        self.severity = cfg.severity;

        match result.filter(|set| !set.is_empty()) {
            Some(set) => self.on_set(set, now),
            None => self.on_clear(now),
        }
    }

    fn on_set(&mut self, set: MatchSet, now: Micros) -> Option<AsmEvent> {
        self.pending_clear = false;

        match self.state {
            AlarmState::Idle => {
                self.delete_deadline = None;
                self.matches = Some(set);
                if self.timers.active == 0 {
                    self.enter_active(now);
                    Some(AsmEvent::Updated)
                } else {
                    self.transition(AlarmState::SoakActive);
                    self.active_deadline = Some(now.saturating_add(self.timers.active));
                    None
                }
            }
            AlarmState::SoakActive => {
                self.matches = Some(set);
                None
            }
            AlarmState::Active => self.replace_matches(set, now),
            AlarmState::SoakIdle => {
                self.idle_deadline = None;
                self.transition(AlarmState::Active);
                self.record_activation(now);
                self.replace_matches(set, now)
            }
        }
    }

    fn on_clear(&mut self, now: Micros) -> Option<AsmEvent> {
        match self.state {
            AlarmState::Idle | AlarmState::SoakIdle => None,
            AlarmState::SoakActive => {
                self.enter_idle(now);
                None
            }
            AlarmState::Active => {
                if self.frequency_exceeded(now) {
                    debug!("frequency exceeded, holding alarm active");
                    self.pending_clear = true;
                    return None;
                }
                self.leave_active(now)
            }
        }
    }

    fn replace_matches(&mut self, set: MatchSet, now: Micros) -> Option<AsmEvent> {
        if self.matches.as_ref() == Some(&set) {
            return None;
        }
        self.matches = Some(set);
        self.head_ts = now;
        self.clear_ack();
        Some(AsmEvent::Updated)
    }

    fn leave_active(&mut self, now: Micros) -> Option<AsmEvent> {
        if self.timers.idle == 0 {
            self.enter_idle(now);
            Some(AsmEvent::Cleared)
        } else {
            self.transition(AlarmState::SoakIdle);
            self.idle_deadline = Some(now.saturating_add(self.timers.idle));
            None
        }
    }

    fn enter_active(&mut self, now: Micros) {
        self.transition(AlarmState::Active);
        self.active_deadline = None;
        self.head_ts = now;
        self.clear_ack();
        self.record_activation(now);
    }

    fn record_activation(&mut self, now: Micros) {
        if self.timers.freq_check {
            self.frequency_history.push_back(now);
        }
    }

    fn enter_idle(&mut self, now: Micros) {
        self.transition(AlarmState::Idle);
        self.active_deadline = None;
        self.idle_deadline = None;
        self.delete_deadline = Some(now.saturating_add(DELETE_DELAY));
        self.pending_clear = false;
        self.matches = None;
        self.clear_ack();
    }

    fn transition(&mut self, to: AlarmState) {
        debug!("alarm state {} -> {}", self.state, to);
        self.state = to;
    }

    fn clear_ack(&mut self) {
        self.ack = false;
        self.ack_timestamp = None;
    }

    fn prune_history(&mut self, now: Micros) {
        let window = self.timers.freq_window;
        while self
            .frequency_history
            .front()
            .is_some_and(|&ts| now.saturating_sub(ts) >= window)
        {
            self.frequency_history.pop_front();
        }
    }

    fn frequency_exceeded(&mut self, now: Micros) -> bool {
        if !self.timers.freq_check {
            return false;
        }
        self.prune_history(now);
        self.frequency_history.len() > self.timers.freq_times
    }

    /// Fire due timers
    ///
    /// Returns the record change, and whether the machine should be removed.
    pub fn run_timers(&mut self, now: Micros) -> (Option<AsmEvent>, bool) {
        if self.timers.freq_check {
            self.prune_history(now);
        }

        let due = |deadline: Option<Micros>| deadline.is_some_and(|d| d <= now);

        let state = self.state;
        match state {
            AlarmState::SoakActive if due(self.active_deadline) => {
                self.enter_active(now);
                (Some(AsmEvent::Updated), false)
            }
            AlarmState::SoakIdle if due(self.idle_deadline) => {
                self.enter_idle(now);
                (Some(AsmEvent::Cleared), false)
            }
            AlarmState::Active if self.pending_clear && !self.frequency_exceeded(now) => {
                self.pending_clear = false;
                (self.leave_active(now), false)
            }
            AlarmState::Idle => (None, due(self.delete_deadline) || self.delete_deadline.is_none()),
            _ => (None, false),
        }
    }

    /// Acknowledge the currently reported alarm
    ///
    /// `timestamp` must equal the reported `head_ts`.
    pub fn ack(&mut self, timestamp: Micros, now: Micros) -> AckResult {
        if !self.is_public() || timestamp != self.head_ts {
            return AckResult::InvalidRequest;
        }
        if !self.ack {
            self.ack = true;
            self.ack_timestamp = Some(now);
        }
        AckResult::Success
    }

    /// Public record, if the alarm is `Active` or `SoakIdle`
    pub fn record(&self, key: &UveKey, alarm_name: &str) -> Option<AlarmRecord> {
        if !self.is_public() {
            return None;
        }
        Some(AlarmRecord {
            table: key.table.clone(),
            name: key.name.clone(),
            alarm_name: alarm_name.to_string(),
            severity: self.severity,
            or_list: self.matches.clone().unwrap_or_default(),
            ack: self.ack,
            ack_timestamp: self.ack_timestamp,
            timestamp: self.head_ts,
        })
    }
}
