//! Main loop of a relay: pull or drain events, deduplicate them and forward them to the intake.
use std::sync::Arc;
use std::time;

use chrono::Utc;
use relay_common::dedup::DedupCache;
use relay_common::event::Event;
use relay_common::health::HealthHandle;
use relay_common::intake::Intake;
use relay_common::queue::{QueueConsumer, QueueProducer};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::ConsumerHandle;
use crate::cursor::PullCursor;
use crate::error::RelayError;
use crate::source::{PollingSource, StreamingSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Timing and batching settings of a `RelaySupervisor`.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between two ticks. The first tick fires right away.
    pub interval: time::Duration,
    pub sweep_interval: time::Duration,
    /// Upper bound on joining background tasks while stopping.
    pub stop_timeout: time::Duration,
    pub batch_limit: usize,
    pub batch_block: bool,
    pub batch_timeout: time::Duration,
    pub batch_retries: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: time::Duration::from_secs(5),
            sweep_interval: time::Duration::from_secs(60),
            stop_timeout: time::Duration::from_secs(2),
            batch_limit: 1000,
            batch_block: true,
            batch_timeout: time::Duration::from_millis(100),
            batch_retries: 10,
        }
    }
}

enum Mode {
    Polling {
        source: Box<dyn PollingSource>,
        cursor: PullCursor,
    },
    Streaming {
        consumer: ConsumerHandle,
        queue: QueueConsumer,
        id_field: String,
        /// Events that failed to be forwarded, retried first on the next tick.
        pending: Vec<Event>,
    },
}

/// Drives one source: owns its cursor or consumer, the dedup sweeper and the forward path.
pub struct RelaySupervisor {
    mode: Mode,
    datasource: &'static str,
    intake: Arc<dyn Intake>,
    cache: DedupCache,
    config: SupervisorConfig,
    liveness: HealthHandle,
    state: SupervisorState,
    sweeper: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Events surviving deduplication, each with the identifier it was admitted under.
struct Admitted {
    events: Vec<(Option<String>, Event)>,
    duplicates: usize,
}

/// Keep the first occurrence of every identifier not seen within the cache window.
/// Events without an identifier are always kept. Order is preserved.
fn deduplicate(cache: &DedupCache, events: Vec<Event>, id_field: &str) -> Admitted {
    let mut admitted = Admitted {
        events: Vec::with_capacity(events.len()),
        duplicates: 0,
    };

    for event in events {
        match event.id(id_field) {
            Some(id) if cache.admit(&id) => admitted.events.push((Some(id), event)),
            Some(_) => admitted.duplicates += 1,
            None => admitted.events.push((None, event)),
        }
    }

    admitted
}

impl RelaySupervisor {
    pub fn polling(
        source: Box<dyn PollingSource>,
        cursor: PullCursor,
        intake: Arc<dyn Intake>,
        cache: DedupCache,
        liveness: HealthHandle,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            datasource: source.datasource(),
            mode: Mode::Polling { source, cursor },
            intake,
            cache,
            config,
            liveness,
            state: SupervisorState::Starting,
            sweeper: None,
        }
    }

    pub fn streaming(
        source: Arc<dyn StreamingSource>,
        queue: (QueueProducer, QueueConsumer),
        intake: Arc<dyn Intake>,
        cache: DedupCache,
        liveness: HealthHandle,
        config: SupervisorConfig,
    ) -> Self {
        let (producer, consumer) = queue;

        Self {
            datasource: source.datasource(),
            mode: Mode::Streaming {
                id_field: source.id_field().to_owned(),
                consumer: ConsumerHandle::new(source, producer),
                queue: consumer,
                pending: Vec::new(),
            },
            intake,
            cache,
            config,
            liveness,
            state: SupervisorState::Starting,
            sweeper: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Start of the next polling window, if this supervisor polls.
    pub fn last_pull_date(&self) -> Option<chrono::DateTime<Utc>> {
        match &self.mode {
            Mode::Polling { cursor, .. } => Some(cursor.last_pull_date()),
            Mode::Streaming { .. } => None,
        }
    }

    /// Number of times the streaming consumer was restarted, if this supervisor streams.
    pub fn consumer_restarts(&self) -> Option<u64> {
        match &self.mode {
            Mode::Polling { .. } => None,
            Mode::Streaming { consumer, .. } => Some(consumer.restarts()),
        }
    }

    /// Run until `shutdown` is cancelled. Only a failing startup returns an error.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), RelayError> {
        self.start().await?;

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.tick().await;
            self.liveness.report_healthy();
        }

        self.stop().await;
        Ok(())
    }

    /// Activate the source, spawn the dedup sweeper and, when streaming, the consumer.
    pub async fn start(&mut self) -> Result<(), RelayError> {
        if let Mode::Polling { source, .. } = &self.mode {
            source.activate().await?;
        }

        let shutdown = CancellationToken::new();
        let sweeper = self
            .cache
            .spawn_sweeper(self.config.sweep_interval, shutdown.clone());
        self.sweeper = Some((shutdown, sweeper));

        if let Mode::Streaming { consumer, .. } = &mut self.mode {
            consumer.start();
        }

        self.state = SupervisorState::Running;
        info!(datasource = self.datasource, "relay started");
        Ok(())
    }

    /// Run one cycle. Failures are logged and retried on a later tick.
    pub async fn tick(&mut self) {
        match &mut self.mode {
            Mode::Polling { source, cursor } => {
                let start = cursor.last_pull_date();
                let end = Utc::now();

                let events = match source.pull(start, end).await {
                    Ok(events) => events,
                    Err(error) => {
                        error!(datasource = self.datasource, %start, %end, %error, "pull failed");
                        metrics::counter!("relay_source_errors_total", "datasource" => self.datasource)
                            .increment(1);
                        return;
                    }
                };

                let admitted = deduplicate(&self.cache, events, source.id_field());
                match forward(self.intake.as_ref(), self.datasource, admitted, &self.cache).await {
                    Ok(()) => cursor.advance(end).await,
                    Err(_) => debug!(%start, "keeping pull cursor"),
                }
            }
            Mode::Streaming {
                consumer,
                queue,
                id_field,
                pending,
            } => {
                consumer.ensure_running().await;

                // Pending events count against the queue capacity: once they fill it, the
                // queue is left alone so producers hit the full queue policy.
                let room = queue.capacity().saturating_sub(pending.len());
                let mut events = std::mem::take(pending);
                if room == 0 {
                    debug!(
                        datasource = self.datasource,
                        pending = events.len(),
                        "retrying pending events before draining the queue"
                    );
                } else {
                    events.extend(
                        queue
                            .drain_batch(
                                self.config.batch_limit.min(room),
                                self.config.batch_block,
                                self.config.batch_timeout,
                                self.config.batch_retries,
                            )
                            .await,
                    );
                }

                let admitted = deduplicate(&self.cache, events, id_field);
                if let Err(unsent) =
                    forward(self.intake.as_ref(), self.datasource, admitted, &self.cache).await
                {
                    *pending = unsent;
                }
            }
        }
    }

    /// Stop background tasks, then forward what is left in the queue.
    pub async fn stop(&mut self) {
        self.state = SupervisorState::Stopping;
        info!(datasource = self.datasource, "stopping relay");

        if let Some((shutdown, sweeper)) = self.sweeper.take() {
            shutdown.cancel();
            join_or_abort(sweeper, self.config.stop_timeout).await;
        }

        if let Mode::Streaming {
            consumer,
            queue,
            id_field,
            pending,
        } = &mut self.mode
        {
            consumer.stop(self.config.stop_timeout).await;

            let mut events = std::mem::take(pending);
            events.extend(
                queue
                    .drain_batch(self.config.batch_limit, false, self.config.batch_timeout, 1)
                    .await,
            );

            let admitted = deduplicate(&self.cache, events, id_field);
            if let Err(unsent) =
                forward(self.intake.as_ref(), self.datasource, admitted, &self.cache).await
            {
                warn!(count = unsent.len(), "dropping events left over at shutdown");
            }
        }

        self.state = SupervisorState::Stopped;
        info!(datasource = self.datasource, "relay stopped");
    }
}

/// Wait for the sweeper to stop, aborting it past `timeout`. Returns whether it stopped on its own.
async fn join_or_abort(mut sweeper: JoinHandle<()>, timeout: time::Duration) -> bool {
    if tokio::time::timeout(timeout, &mut sweeper).await.is_ok() {
        return true;
    }

    warn!(
        timeout_ms = timeout.as_millis() as u64,
        "dedup cache sweeper did not stop in time, aborting it"
    );
    sweeper.abort();
    false
}

/// Push admitted events to the intake as a single call.
///
/// On failure, returns the events the intake did not accept and releases their
/// identifiers from the cache, so they are not taken for duplicates when they come back.
/// Events accepted before the failure stay in the cache.
async fn forward(
    intake: &dyn Intake,
    datasource: &'static str,
    admitted: Admitted,
    cache: &DedupCache,
) -> Result<(), Vec<Event>> {
    if admitted.duplicates > 0 {
        debug!(datasource, duplicates = admitted.duplicates, "dropped duplicate events");
        metrics::counter!("relay_duplicate_events_total", "datasource" => datasource)
            .increment(admitted.duplicates as u64);
    }

    let mut lines = Vec::with_capacity(admitted.events.len());
    let mut sent = Vec::with_capacity(admitted.events.len());
    for (id, event) in admitted.events {
        match event.to_line() {
            Ok(line) => {
                lines.push(line);
                sent.push((id, event));
            }
            Err(error) => warn!(datasource, %error, "skipping event that failed to serialize"),
        }
    }

    if lines.is_empty() {
        return Ok(());
    }

    let count = lines.len();
    let labels = [
        ("datasource", datasource.to_owned()),
        ("intake_key", intake.key().to_owned()),
    ];
    let started = tokio::time::Instant::now();

    match intake.push_events(lines).await {
        Ok(()) => {
            info!(datasource, count, "forwarded events");
            metrics::counter!("relay_events_forwarded_total", &labels).increment(count as u64);
            metrics::histogram!("relay_forward_duration_seconds", &labels)
                .record(started.elapsed().as_secs_f64());
            Ok(())
        }
        Err(error) => {
            let accepted = error.accepted().min(count);
            error!(datasource, count, accepted, %error, "failed to forward events");
            metrics::counter!("relay_forward_failures_total", &labels).increment(1);
            if accepted > 0 {
                metrics::counter!("relay_events_forwarded_total", &labels)
                    .increment(accepted as u64);
            }

            let unsent = sent.split_off(accepted);
            cache.release(unsent.iter().filter_map(|(id, _)| id.as_deref()));
            Err(unsent.into_iter().map(|(_, event)| event).collect())
        }
    }
}
