//! OutputActor - Serialises downstream emission of alarm records
//!
//! ## Sinks
//!
//! - An in-process broadcast stream (websocket endpoint, tests)
//! - An optional HTTP webhook, retried with backoff; a record that still
//!   fails after `max_send_failures` attempts is dropped and counted
//!
//! A record equal to the last one emitted for the same identity is
//! suppressed, as is a `Clear` for a UVE that has nothing published. With a
//! rate limit, records beyond the per-second cap wait for the next second.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, instrument, trace, warn};

use crate::config::WebhookConfig;
use crate::retry::{BackoffPolicy, Retryable, retry_with_backoff};

use super::messages::{AlarmOutput, OutputCommand, OutputStats};

/// Capacity of the input queue and the broadcast stream
const OUTPUT_QUEUE: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct OutputSettings {
    /// Records per second; 0 disables the cap
    pub rate_limit: u32,

    pub webhook: Option<WebhookConfig>,

    /// Time allowed to flush queued records on shutdown
    pub shutdown_deadline: Duration,
}

#[derive(Debug)]
enum WebhookError {
    Transport(String),
    Status(reqwest::StatusCode),
}

impl fmt::Display for WebhookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookError::Transport(msg) => write!(f, "webhook request failed: {}", msg),
            WebhookError::Status(status) => write!(f, "webhook returned {}", status),
        }
    }
}

impl Retryable for WebhookError {
    fn is_retryable(&self) -> bool {
        match self {
            WebhookError::Transport(_) => true,
            WebhookError::Status(status) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

struct Webhook {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl Webhook {
    async fn post(&self, output: &AlarmOutput) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(output)
            .send()
            .await
            .map_err(|e| WebhookError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WebhookError::Status(response.status()));
        }
        Ok(())
    }
}

pub struct OutputActor {
    input_rx: mpsc::Receiver<AlarmOutput>,
    command_rx: mpsc::Receiver<OutputCommand>,
    stream_tx: broadcast::Sender<AlarmOutput>,
    webhook: Option<Webhook>,

    /// Last emitted record per identity
    last: HashMap<String, AlarmOutput>,

    rate_limit: u32,
    window_start: Instant,
    window_count: u32,

    shutdown_deadline: Duration,
    stats: OutputStats,
}

impl OutputActor {
    pub fn new(
        settings: OutputSettings,
        input_rx: mpsc::Receiver<AlarmOutput>,
        command_rx: mpsc::Receiver<OutputCommand>,
        stream_tx: broadcast::Sender<AlarmOutput>,
    ) -> Result<Self> {
        let webhook = match settings.webhook {
            Some(config) => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_millis(config.timeout_ms))
                    .build()
                    .context("failed to build webhook client")?;
                Some(Webhook { config, client })
            }
            None => None,
        };

        Ok(Self {
            input_rx,
            command_rx,
            stream_tx,
            webhook,
            last: HashMap::new(),
            rate_limit: settings.rate_limit,
            window_start: Instant::now(),
            window_count: 0,
            shutdown_deadline: settings.shutdown_deadline,
            stats: OutputStats::default(),
        })
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting output actor");
        let mut input_open = true;

        loop {
            tokio::select! {
                output = self.input_rx.recv(), if input_open => {
                    match output {
                        Some(output) => self.handle(output).await,
                        None => {
                            // Commands, Shutdown included, are still served
                            debug!("input channel closed");
                            input_open = false;
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("all handles dropped, shutting down");
                        break;
                    };
                    match cmd {
                        OutputCommand::GetStats { respond_to } => {
                            let stats = OutputStats {
                                tracked: self.last.len(),
                                ..self.stats.clone()
                            };
                            let _ = respond_to.send(stats);
                        }

                        OutputCommand::Flush { respond_to } => {
                            self.flush().await;
                            let _ = respond_to.send(());
                        }

                        OutputCommand::Shutdown { respond_to } => {
                            debug!("received shutdown command");
                            if timeout(self.shutdown_deadline, self.flush()).await.is_err() {
                                warn!("shutdown deadline reached with records still queued");
                            }
                            let _ = respond_to.send(());
                            break;
                        }
                    }
                }
            }
        }

        debug!("output actor stopped");
    }

    async fn flush(&mut self) {
        while let Ok(output) = self.input_rx.try_recv() {
            self.handle(output).await;
        }
    }

    async fn handle(&mut self, output: AlarmOutput) {
        let identity = output.identity();

        let suppress = match (&output, self.last.get(&identity)) {
            (_, Some(last)) if *last == output => true,
            (AlarmOutput::Clear { .. }, None) => true,
            _ => false,
        };
        if suppress {
            trace!("suppressing repeated record for {identity}");
            self.stats.suppressed += 1;
            return;
        }

        self.throttle().await;
        if let AlarmOutput::Clear { .. } = output {
            self.last.remove(&identity);
        } else {
            self.last.insert(identity, output.clone());
        }
        self.emit(output).await;
    }

    /// Wait for the next one-second window once the cap is reached
    async fn throttle(&mut self) {
        if self.rate_limit == 0 {
            return;
        }
        let window = Duration::from_secs(1);
        if self.window_start.elapsed() >= window {
            self.window_start = Instant::now();
            self.window_count = 0;
        }
        if self.window_count >= self.rate_limit {
            trace!("rate limit reached, waiting for next window");
            sleep_until(self.window_start + window).await;
            self.window_start = Instant::now();
            self.window_count = 0;
        }
        self.window_count += 1;
    }

    async fn emit(&mut self, output: AlarmOutput) {
        if let Some(webhook) = &self.webhook {
            let policy = BackoffPolicy {
                max_retries: webhook.config.max_send_failures,
                ..BackoffPolicy::default()
            };
            match retry_with_backoff("webhook", policy, || webhook.post(&output)).await {
                Ok(()) => self.stats.webhook_sent += 1,
                Err(e) => {
                    warn!("dropping record for {}: {e}", output.identity());
                    self.stats.dropped += 1;
                }
            }
        }

        match self.stream_tx.send(output) {
            Ok(receivers) => trace!("published record to {receivers} receivers"),
            Err(_) => trace!("no receivers for record"),
        }
        self.stats.emitted += 1;
    }
}

/// Handle for controlling an OutputActor
#[derive(Clone)]
pub struct OutputHandle {
    sender: mpsc::Sender<OutputCommand>,
    stream_tx: broadcast::Sender<AlarmOutput>,
}

impl OutputHandle {
    /// Spawn the actor; returns the handle and the sender records are queued on
    pub fn spawn(settings: OutputSettings) -> Result<(Self, mpsc::Sender<AlarmOutput>)> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (input_tx, input_rx) = mpsc::channel(OUTPUT_QUEUE);
        let (stream_tx, _) = broadcast::channel(OUTPUT_QUEUE);

        let actor = OutputActor::new(settings, input_rx, cmd_rx, stream_tx.clone())?;
        tokio::spawn(actor.run());

        Ok((
            Self {
                sender: cmd_tx,
                stream_tx,
            },
            input_tx,
        ))
    }

    /// Subscribe to emitted records
    pub fn subscribe(&self) -> broadcast::Receiver<AlarmOutput> {
        self.stream_tx.subscribe()
    }

    pub async fn stats(&self) -> Result<OutputStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OutputCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;

        rx.await.context("failed to receive response")
    }

    /// Wait until every queued record was emitted
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OutputCommand::Flush { respond_to: tx })
            .await
            .context("failed to send Flush command")?;

        rx.await.context("failed to receive response")
    }

    /// Flush within the shutdown deadline and stop
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OutputCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;

        rx.await.context("failed to receive response")
    }
}
