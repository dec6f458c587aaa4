use std::time;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde_derive::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Enumeration of errors raised while pushing events to an intake.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("failed to build intake client: {0}")]
    ClientError(reqwest::Error),
    #[error("error parsing intake url: {0}")]
    ParseUrlError(#[from] url::ParseError),
    #[error("failed to send events to the intake: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("intake rejected a batch of {count} events with status {status}")]
    RejectedError { status: StatusCode, count: usize },
    #[error("intake accepted the first {accepted} events, then failed: {error}")]
    PartialError {
        accepted: usize,
        error: Box<IntakeError>,
    },
}

impl IntakeError {
    /// Number of leading events the intake accepted before failing.
    pub fn accepted(&self) -> usize {
        match self {
            IntakeError::PartialError { accepted, .. } => *accepted,
            _ => 0,
        }
    }
}

/// Downstream endpoint receiving forwarded events.
#[async_trait]
pub trait Intake: Send + Sync {
    /// Identifier of the intake, used to label metrics and logs.
    fn key(&self) -> &str;

    /// Queue serialized events for delivery. Each item is a self-contained JSON record.
    /// Order is preserved. Returns once every event has been accepted by the intake.
    ///
    /// When only a prefix of `events` got through, the error reports its length through
    /// `IntakeError::accepted`.
    async fn push_events(&self, events: Vec<String>) -> Result<(), IntakeError>;
}

#[derive(Serialize)]
struct BatchPayload<'a> {
    intake_key: &'a str,
    jsons: &'a [String],
}

/// Intake reached over HTTP, posting chunks of events to its `/batch` endpoint.
pub struct HttpIntake {
    client: reqwest::Client,
    batch_url: reqwest::Url,
    intake_key: String,
    chunk_size: usize,
}

impl HttpIntake {
    pub fn new(
        base_url: &str,
        intake_key: &str,
        chunk_size: usize,
        request_timeout: time::Duration,
    ) -> Result<Self, IntakeError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("intake-relay")
            .timeout(request_timeout)
            .build()
            .map_err(IntakeError::ClientError)?;

        let batch_url = reqwest::Url::parse(base_url)?.join("batch")?;

        Ok(Self {
            client,
            batch_url,
            intake_key: intake_key.to_owned(),
            chunk_size: chunk_size.max(1),
        })
    }

    async fn push_chunk(&self, chunk: &[String]) -> Result<(), IntakeError> {
        let payload = BatchPayload {
            intake_key: &self.intake_key,
            jsons: chunk,
        };

        let response = self
            .client
            .post(self.batch_url.clone())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IntakeError::RejectedError {
                status,
                count: chunk.len(),
            });
        }

        debug!(count = chunk.len(), "pushed chunk to intake");
        Ok(())
    }
}

#[async_trait]
impl Intake for HttpIntake {
    fn key(&self) -> &str {
        &self.intake_key
    }

    async fn push_events(&self, events: Vec<String>) -> Result<(), IntakeError> {
        let mut accepted = 0;

        for chunk in events.chunks(self.chunk_size) {
            if let Err(error) = self.push_chunk(chunk).await {
                if accepted == 0 {
                    return Err(error);
                }
                return Err(IntakeError::PartialError {
                    accepted,
                    error: Box::new(error),
                });
            }
            accepted += chunk.len();
        }

        Ok(())
    }
}

/// Intake that only logs what it receives. Useful when running a connector locally.
pub struct PrintIntake {
    intake_key: String,
}

impl PrintIntake {
    pub fn new(intake_key: &str) -> Self {
        Self {
            intake_key: intake_key.to_owned(),
        }
    }
}

#[async_trait]
impl Intake for PrintIntake {
    fn key(&self) -> &str {
        &self.intake_key
    }

    async fn push_events(&self, events: Vec<String>) -> Result<(), IntakeError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events");
        let _enter = span.enter();

        for event in events {
            info!("event: {}", event);
        }

        Ok(())
    }
}
