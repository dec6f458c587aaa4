use std::sync::Arc;
use std::time;

use relay_common::queue::QueueProducer;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SourceError;
use crate::source::StreamingSource;

/// Lifecycle of a background streaming consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    NotStarted,
    Running,
    Stopped,
    /// The task ended while it was expected to keep running.
    Dead,
}

/// Owns the background task consuming a `StreamingSource` into the event queue.
///
/// Only the supervisor holds a handle, and only it starts, restarts or stops the task.
pub struct ConsumerHandle {
    source: Arc<dyn StreamingSource>,
    queue: QueueProducer,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), SourceError>>>,
    state: ConsumerState,
    restarts: u64,
}

impl ConsumerHandle {
    pub fn new(source: Arc<dyn StreamingSource>, queue: QueueProducer) -> Self {
        Self {
            source,
            queue,
            shutdown: CancellationToken::new(),
            task: None,
            state: ConsumerState::NotStarted,
            restarts: 0,
        }
    }

    /// Spawn the consumer task. Does nothing if a task is already running.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let source = self.source.clone();
        let queue = self.queue.clone();
        let shutdown = CancellationToken::new();
        self.shutdown = shutdown.clone();

        self.task = Some(tokio::spawn(async move {
            source.consume(queue, shutdown).await
        }));
        self.state = ConsumerState::Running;
        info!(datasource = self.source.datasource(), "started event consumer");
    }

    pub fn is_alive(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn state(&self) -> ConsumerState {
        if self.state == ConsumerState::Running && !self.is_alive() {
            return ConsumerState::Dead;
        }
        self.state
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Start a new consumer if the current one died. Returns true when a restart happened.
    pub async fn ensure_running(&mut self) -> bool {
        if self.state() != ConsumerState::Dead {
            return false;
        }

        if let Some(task) = self.task.take() {
            match describe_exit(task.await) {
                Some(cause) => warn!(
                    datasource = self.source.datasource(),
                    cause = %cause, "event consumer died, restarting"
                ),
                None => warn!(
                    datasource = self.source.datasource(),
                    "event consumer exited, restarting"
                ),
            }
        }

        self.restarts += 1;
        metrics::counter!("relay_consumer_restarts_total", "datasource" => self.source.datasource())
            .increment(1);
        self.start();
        true
    }

    /// Ask the consumer to stop and wait for it at most `timeout`.
    /// A consumer that does not stop in time is aborted.
    pub async fn stop(&mut self, timeout: time::Duration) {
        self.shutdown.cancel();
        self.state = ConsumerState::Stopped;

        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(result) => {
                if let Some(cause) = describe_exit(result) {
                    warn!(
                        datasource = self.source.datasource(),
                        cause = %cause, "event consumer failed while stopping"
                    );
                }
                info!(datasource = self.source.datasource(), "stopped event consumer");
            }
            Err(_) => {
                warn!(
                    datasource = self.source.datasource(),
                    timeout_ms = timeout.as_millis() as u64,
                    "event consumer did not stop in time, aborting it"
                );
                task.abort();
            }
        }
    }
}

/// Returns the reason a consumer task ended abnormally, if it did.
fn describe_exit(result: Result<Result<(), SourceError>, JoinError>) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(error.to_string()),
        Err(error) if error.is_panic() => Some("consumer task panicked".to_owned()),
        Err(error) => Some(error.to_string()),
    }
}
