//! In-process coordination service
//!
//! Sessions expire when not heartbeated within the session timeout.
//! Enabled partitions are dealt round-robin over live sessions ordered by
//! instance id, so every instance computes the same layout.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::coordinator::{Coordinator, SessionId};
use super::error::{CoordinationError, CoordinationResult};

#[derive(Debug)]
struct Session {
    instance_id: String,
    expires: Instant,
}

#[derive(Debug)]
struct CoordinatorState {
    sessions: BTreeMap<SessionId, Session>,
    next_session: SessionId,
    disabled: BTreeSet<u32>,
    available: bool,
}

pub struct MemoryCoordinator {
    partitions: u32,
    session_timeout: Duration,
    state: Mutex<CoordinatorState>,
}

impl MemoryCoordinator {
    pub fn new(partitions: u32, session_timeout: Duration) -> Self {
        Self {
            partitions,
            session_timeout,
            state: Mutex::new(CoordinatorState {
                sessions: BTreeMap::new(),
                next_session: 1,
                disabled: BTreeSet::new(),
                available: true,
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Instance ids with a live session
    pub fn live_instances(&self) -> Vec<String> {
        let mut state = self.state.lock();
        Self::expire(&mut state);
        state.sessions.values().map(|s| s.instance_id.clone()).collect()
    }

    fn expire(state: &mut CoordinatorState) {
        let now = Instant::now();
        state.sessions.retain(|id, session| {
            let live = session.expires > now;
            if !live {
                info!("session {id} of instance {} expired", session.instance_id);
            }
            live
        });
    }

    fn check_available(state: &CoordinatorState) -> CoordinationResult<()> {
        if state.available {
            Ok(())
        } else {
            Err(CoordinationError::Unavailable("coordinator offline".to_string()))
        }
    }

    fn layout(&self, state: &CoordinatorState) -> BTreeMap<SessionId, BTreeSet<u32>> {
        let mut sessions: Vec<(&String, SessionId)> = state
            .sessions
            .iter()
            .map(|(id, session)| (&session.instance_id, *id))
            .collect();
        sessions.sort();

        let mut layout: BTreeMap<SessionId, BTreeSet<u32>> =
            sessions.iter().map(|(_, id)| (*id, BTreeSet::new())).collect();
        if sessions.is_empty() {
            return layout;
        }

        let enabled = (0..self.partitions).filter(|p| !state.disabled.contains(p));
        for (i, partition) in enabled.enumerate() {
            let (_, session) = sessions[i % sessions.len()];
            layout.entry(session).or_default().insert(partition);
        }
        layout
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn register(&self, instance_id: &str) -> CoordinationResult<SessionId> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        Self::expire(&mut state);

        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            Session {
                instance_id: instance_id.to_string(),
                expires: Instant::now() + self.session_timeout,
            },
        );
        debug!("instance {instance_id} registered as session {id}");
        Ok(id)
    }

    async fn heartbeat(&self, session: SessionId) -> CoordinationResult<()> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        Self::expire(&mut state);

        let Some(entry) = state.sessions.get_mut(&session) else {
            return Err(CoordinationError::SessionLost(format!("session {session}")));
        };
        entry.expires = Instant::now() + self.session_timeout;
        Ok(())
    }

    async fn assignment(&self, session: SessionId) -> CoordinationResult<BTreeSet<u32>> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        Self::expire(&mut state);

        if !state.sessions.contains_key(&session) {
            return Err(CoordinationError::SessionLost(format!("session {session}")));
        }
        Ok(self.layout(&state).remove(&session).unwrap_or_default())
    }

    async fn release(&self, session: SessionId) -> CoordinationResult<()> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.sessions.remove(&session);
        Ok(())
    }

    async fn set_partition(&self, partition: u32, owned: bool) -> CoordinationResult<()> {
        if partition >= self.partitions {
            return Err(CoordinationError::Rejected(format!(
                "partition {partition} out of range (0..{})",
                self.partitions
            )));
        }
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if owned {
            state.disabled.remove(&partition);
        } else {
            state.disabled.insert(partition);
        }
        Ok(())
    }
}
