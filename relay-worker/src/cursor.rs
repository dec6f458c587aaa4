use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

/// How far back the first pull reaches when no cursor was saved.
pub fn first_pull_lookback() -> TimeDelta {
    TimeDelta::hours(3)
}

/// High-water mark of the last successfully forwarded polling window.
///
/// Only the supervisor advances it, and only once the window was forwarded. When a
/// path is configured the cursor is saved there as an RFC 3339 timestamp so a restarted
/// worker resumes where the previous one stopped.
#[derive(Debug, Clone)]
pub struct PullCursor {
    last_pull_date: DateTime<Utc>,
    path: Option<PathBuf>,
}

impl PullCursor {
    /// An in-memory cursor starting at `last_pull_date`.
    pub fn new(last_pull_date: DateTime<Utc>) -> Self {
        Self {
            last_pull_date,
            path: None,
        }
    }

    /// Load the cursor saved at `path`. A missing or unreadable file starts from
    /// three hours ago.
    pub async fn load(path: Option<PathBuf>) -> Self {
        let default = Utc::now() - first_pull_lookback();

        let Some(path) = path else {
            return Self::new(default);
        };

        let last_pull_date = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(date) => date.with_timezone(&Utc),
                Err(error) => {
                    warn!(path = %path.display(), %error, "ignoring malformed pull cursor");
                    default
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => default,
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to read pull cursor");
                default
            }
        };

        info!(%last_pull_date, path = %path.display(), "loaded pull cursor");
        Self {
            last_pull_date,
            path: Some(path),
        }
    }

    pub fn last_pull_date(&self) -> DateTime<Utc> {
        self.last_pull_date
    }

    /// Move the cursor to `end`. Saving failures are logged: the in-memory cursor still moves.
    pub async fn advance(&mut self, end: DateTime<Utc>) {
        if end <= self.last_pull_date {
            return;
        }
        self.last_pull_date = end;

        let Some(path) = &self.path else {
            return;
        };
        if let Err(error) = tokio::fs::write(path, end.to_rfc3339()).await {
            warn!(path = %path.display(), %error, "failed to save pull cursor");
        }
    }
}
