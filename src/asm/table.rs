//! All alarm state machines of this instance

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use super::machine::AlarmStateMachine;
use super::record::UveAlarms;
use super::{AckResult, AlarmState, Micros};
use crate::UveKey;
use crate::rules::{AlarmConfig, MatchSet};

/// Result of one timer pass
#[derive(Debug, Default, PartialEq)]
pub struct TimerOutcome {
    /// Machines removed after their delete timer fired
    pub deleted: Vec<(UveKey, String)>,

    /// Keys whose public alarms changed
    pub changed: Vec<UveKey>,
}

/// `(key, alarm_name) -> AlarmStateMachine`
#[derive(Debug, Default)]
pub struct AlarmTable {
    machines: BTreeMap<UveKey, BTreeMap<String, AlarmStateMachine>>,
}

impl AlarmTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live state machines
    pub fn len(&self) -> usize {
        self.machines.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn state(&self, key: &UveKey, alarm_name: &str) -> Option<AlarmState> {
        Some(self.machines.get(key)?.get(alarm_name)?.state())
    }

    pub fn machine(&self, key: &UveKey, alarm_name: &str) -> Option<&AlarmStateMachine> {
        self.machines.get(key)?.get(alarm_name)
    }

    /// Feed a rule evaluation result for `key`
    ///
    /// Machines are created lazily on the first match. Returns whether the
    /// key's public alarms changed.
    pub fn process(&mut self, key: &UveKey, cfg: &AlarmConfig, result: Option<MatchSet>, now: Micros) -> bool {
        let matched = result.as_ref().is_some_and(|set| !set.is_empty());
        let exists = self
            .machines
            .get(key)
            .is_some_and(|alarms| alarms.contains_key(&cfg.name));
        if !matched && !exists {
            return false;
        }

        let asm = self
            .machines
            .entry(key.clone())
            .or_default()
            .entry(cfg.name.clone())
            .or_insert_with(|| {
                trace!("creating alarm {} on {key}", cfg.name);
                AlarmStateMachine::new(cfg)
            });

        let event = asm.process(cfg, result, now);
        if let Some(event) = event {
            debug!("alarm {} on {key}: {event:?}", cfg.name);
        }
        event.is_some()
    }

    /// Fire every due timer
    pub fn run_timers(&mut self, now: Micros) -> TimerOutcome {
        let mut outcome = TimerOutcome::default();
        let mut changed = BTreeSet::new();

        for (key, alarms) in self.machines.iter_mut() {
            alarms.retain(|alarm_name, asm| {
                let (event, delete) = asm.run_timers(now);
                if event.is_some() {
                    changed.insert(key.clone());
                }
                if delete {
                    trace!("deleting alarm {alarm_name} on {key}");
                    outcome.deleted.push((key.clone(), alarm_name.clone()));
                }
                !delete
            });
        }
        self.machines.retain(|_, alarms| !alarms.is_empty());

        outcome.changed = changed.into_iter().collect();
        outcome
    }

    /// Earliest pending deadline over all machines
    pub fn next_deadline(&self) -> Option<Micros> {
        self.machines
            .values()
            .flat_map(BTreeMap::values)
            .filter_map(AlarmStateMachine::next_deadline)
            .min()
    }

    /// Acknowledge an alarm
    ///
    /// Returns the RPC result and whether the public record changed.
    pub fn ack(&mut self, key: &UveKey, alarm_name: &str, timestamp: Micros, now: Micros) -> (AckResult, bool) {
        let Some(asm) = self.machines.get_mut(key).and_then(|alarms| alarms.get_mut(alarm_name)) else {
            return (AckResult::NotPresent, false);
        };
        let was_acked = asm.is_acked();
        let result = asm.ack(timestamp, now);
        (result, result == AckResult::Success && !was_acked)
    }

    /// Public alarms of one UVE
    pub fn uve_alarms(&self, key: &UveKey) -> Option<UveAlarms> {
        let alarms: Vec<_> = self
            .machines
            .get(key)?
            .iter()
            .filter_map(|(alarm_name, asm)| asm.record(key, alarm_name))
            .collect();

        if alarms.is_empty() {
            return None;
        }
        Some(UveAlarms {
            key: key.clone(),
            alarms,
        })
    }

    /// Public alarms of every UVE
    pub fn all_alarms(&self) -> Vec<UveAlarms> {
        self.machines
            .keys()
            .filter_map(|key| self.uve_alarms(key))
            .collect()
    }

    /// Tear down every machine of a key
    ///
    /// Returns whether the key had public alarms.
    pub fn remove_key(&mut self, key: &UveKey) -> bool {
        self.machines
            .remove(key)
            .is_some_and(|alarms| alarms.values().any(AlarmStateMachine::is_public))
    }

    /// Tear down every machine of an alarm
    ///
    /// Returns the keys whose public alarms changed.
    pub fn remove_alarm(&mut self, alarm_name: &str) -> Vec<UveKey> {
        let mut changed = Vec::new();
        for (key, alarms) in self.machines.iter_mut() {
            if alarms.remove(alarm_name).is_some_and(|asm| asm.is_public()) {
                changed.push(key.clone());
            }
        }
        self.machines.retain(|_, alarms| !alarms.is_empty());
        changed
    }

    /// Tear down one machine
    ///
    /// Returns whether it had a public record.
    pub fn remove(&mut self, key: &UveKey, alarm_name: &str) -> bool {
        let Some(alarms) = self.machines.get_mut(key) else {
            return false;
        };
        let was_public = alarms.remove(alarm_name).is_some_and(|asm| asm.is_public());
        if alarms.is_empty() {
            self.machines.remove(key);
        }
        was_public
    }

    /// Keys with at least one machine
    pub fn keys(&self) -> Vec<UveKey> {
        self.machines.keys().cloned().collect()
    }
}
