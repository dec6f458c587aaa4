use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::event::Event;
use relay_common::queue::QueueProducer;
use tokio_util::sync::CancellationToken;

use crate::error::{ActivationError, SourceError};

pub mod office365;
pub mod retarus;

/// A source the supervisor pulls from on every tick, one time window at a time.
#[async_trait]
pub trait PollingSource: Send + Sync {
    /// Name of the datasource, used to label metrics and logs.
    fn datasource(&self) -> &'static str;

    /// Field holding the vendor identifier of each event.
    fn id_field(&self) -> &str;

    /// Make sure the vendor is ready to serve events. Only missing pieces are set up,
    /// so this can run on every start.
    async fn activate(&self) -> Result<(), ActivationError> {
        Ok(())
    }

    /// Fetch every event available in `[start, end)`, in the order the vendor returned them.
    ///
    /// Failing items are skipped; an error is only returned when the whole window must be
    /// retried later, in which case the caller keeps its cursor untouched.
    async fn pull(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Event>, SourceError>;
}

/// A source pushing events on its own schedule, consumed by a background task.
#[async_trait]
pub trait StreamingSource: Send + Sync + 'static {
    /// Name of the datasource, used to label metrics and logs.
    fn datasource(&self) -> &'static str;

    /// Field holding the vendor identifier of each event.
    fn id_field(&self) -> &str;

    /// Receive events and hand them to `queue` until `shutdown` is cancelled.
    ///
    /// Returning `Ok` means a cooperative stop. Any error means the consumer died and
    /// the supervisor should start a new one.
    async fn consume(
        &self,
        queue: QueueProducer,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError>;
}
