//! OwnershipActor - Holds the coordination session
//!
//! Registers this instance with the coordination service, heartbeats the
//! session and reports every change of the assigned partition set to the
//! partition manager.
//!
//! ```text
//! tick ──▶ register (if no session) ──▶ heartbeat ──▶ assignment ──changed?──▶ OwnershipEvent::Owned ──▶ wait for ack
//! ```
//!
//! A new set is only adopted once the manager acknowledged it, i.e. after
//! every released partition has been dropped. A lost session is reported as
//! an empty set right away; the actor then registers again. Staying without
//! a session (or without reaching the service) for longer than the grace
//! period is fatal.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::ownership::{CoordinationError, Coordinator, SessionId};
use crate::retry::{BackoffPolicy, retry_with_backoff};

use super::messages::{OwnershipCommand, OwnershipEvent};

#[derive(Debug, Clone)]
pub struct OwnershipConfig {
    pub instance_id: String,
    pub heartbeat_interval: Duration,

    /// Longest tolerated time without a healthy session
    pub session_grace: Duration,

    pub retry: BackoffPolicy,
}

impl OwnershipConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            heartbeat_interval: Duration::from_secs(1),
            session_grace: Duration::from_secs(60),
            retry: BackoffPolicy {
                max_retries: 3,
                base_delay_ms: 100,
                max_delay_ms: 400,
            },
        }
    }
}

pub struct OwnershipActor {
    coordinator: Arc<dyn Coordinator>,
    config: OwnershipConfig,
    command_rx: mpsc::Receiver<OwnershipCommand>,
    event_tx: mpsc::Sender<OwnershipEvent>,

    session: Option<SessionId>,

    /// Last set acknowledged by the manager
    owned: BTreeSet<u32>,

    /// Start of the current stretch without a healthy session
    unhealthy_since: Option<Instant>,
}

impl OwnershipActor {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        config: OwnershipConfig,
        command_rx: mpsc::Receiver<OwnershipCommand>,
        event_tx: mpsc::Sender<OwnershipEvent>,
    ) -> Self {
        Self {
            coordinator,
            config,
            command_rx,
            event_tx,
            session: None,
            owned: BTreeSet::new(),
            unhealthy_since: None,
        }
    }

    #[instrument(skip(self), fields(instance = %self.config.instance_id))]
    pub async fn run(mut self) {
        debug!("starting ownership actor");

        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(reason) = self.refresh().await {
                        error!("{reason}");
                        let _ = self.event_tx.send(OwnershipEvent::Fatal { reason }).await;
                        break;
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(OwnershipCommand::SetPartition { partition, owned, respond_to }) => {
                            debug!("setting partition {partition} owned={owned}");
                            let result = self
                                .coordinator
                                .set_partition(partition, owned)
                                .await
                                .with_context(|| format!("failed to set partition {partition}"));
                            if result.is_ok()
                                && let Err(reason) = self.refresh().await
                            {
                                warn!("refresh after manual partition change failed: {reason}");
                            }
                            let _ = respond_to.send(result);
                        }

                        Some(OwnershipCommand::GetOwned { respond_to }) => {
                            let _ = respond_to.send(self.owned.clone());
                        }

                        Some(OwnershipCommand::Shutdown) => {
                            debug!("received shutdown command");
                            self.release().await;
                            break;
                        }

                        None => {
                            warn!("command channel closed, shutting down");
                            self.release().await;
                            break;
                        }
                    }
                }
            }
        }

        debug!("ownership actor stopped");
    }

    /// Heartbeat and pick up the current assignment
    ///
    /// Returns the fatal reason once the grace period is exceeded.
    async fn refresh(&mut self) -> Result<(), String> {
        let session = match self.session {
            Some(session) => session,
            None => {
                let registered = retry_with_backoff("register", self.config.retry, || {
                    self.coordinator.register(&self.config.instance_id)
                })
                .await;
                match registered {
                    Ok(session) => {
                        info!("registered with session {session}");
                        self.session = Some(session);
                        session
                    }
                    Err(e) => return self.unhealthy(e),
                }
            }
        };

        let heartbeat = retry_with_backoff("heartbeat", self.config.retry, || {
            self.coordinator.heartbeat(session)
        })
        .await;
        let assigned = match heartbeat {
            Ok(()) => self.coordinator.assignment(session).await,
            Err(e) => Err(e),
        };

        match assigned {
            Ok(assigned) => {
                self.unhealthy_since = None;
                self.report(assigned).await;
                Ok(())
            }
            Err(CoordinationError::SessionLost(msg)) => {
                warn!("coordination session lost: {msg}");
                self.session = None;
                self.report(BTreeSet::new()).await;
                self.unhealthy(CoordinationError::SessionLost(msg))
            }
            Err(e) => self.unhealthy(e),
        }
    }

    fn unhealthy(&mut self, e: CoordinationError) -> Result<(), String> {
        let since = *self.unhealthy_since.get_or_insert_with(Instant::now);
        let elapsed = since.elapsed();
        warn!("coordination unhealthy for {elapsed:?}: {e}");

        if elapsed > self.config.session_grace {
            return Err(format!(
                "no coordination session for {elapsed:?} (grace {:?}): {e}",
                self.config.session_grace
            ));
        }
        Ok(())
    }

    /// Announce a changed assignment and wait until the manager applied it
    async fn report(&mut self, assigned: BTreeSet<u32>) {
        if assigned == self.owned {
            return;
        }
        info!("owned partitions changed: {:?} -> {:?}", self.owned, assigned);

        let (ack_tx, ack_rx) = oneshot::channel();
        let event = OwnershipEvent::Owned {
            partitions: assigned.clone(),
            ack: ack_tx,
        };
        if self.event_tx.send(event).await.is_err() {
            warn!("partition manager gone, ignoring assignment");
            return;
        }
        if ack_rx.await.is_err() {
            warn!("partition manager dropped the assignment");
            return;
        }
        self.owned = assigned;
    }

    async fn release(&mut self) {
        if let Some(session) = self.session.take()
            && let Err(e) = self.coordinator.release(session).await
        {
            warn!("failed to release session {session}: {e}");
        }
    }
}

/// Handle for controlling an OwnershipActor
#[derive(Clone)]
pub struct OwnershipHandle {
    sender: mpsc::Sender<OwnershipCommand>,
}

impl OwnershipHandle {
    /// Spawn the actor; ownership changes are delivered on `event_tx`
    pub fn spawn(
        coordinator: Arc<dyn Coordinator>,
        config: OwnershipConfig,
        event_tx: mpsc::Sender<OwnershipEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = OwnershipActor::new(coordinator, config, cmd_rx, event_tx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Manually acquire (`owned = true`) or withhold a partition
    pub async fn set_partition(&self, partition: u32, owned: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OwnershipCommand::SetPartition {
                partition,
                owned,
                respond_to: tx,
            })
            .await
            .context("failed to send SetPartition command")?;

        rx.await.context("failed to receive response")?
    }

    /// Partitions acknowledged by the manager
    pub async fn owned(&self) -> Result<BTreeSet<u32>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OwnershipCommand::GetOwned { respond_to: tx })
            .await
            .context("failed to send GetOwned command")?;

        rx.await.context("failed to receive response")
    }

    /// Release the session and stop
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(OwnershipCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
