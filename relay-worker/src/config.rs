use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use relay_common::queue::FullQueuePolicy;

use crate::error::ConfigError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    pub connector: ConnectorKind,

    /// Tick interval of the supervisor. Defaults depend on the connector.
    pub poll_interval: Option<EnvMsDuration>,

    #[envconfig(default = "21600000")]
    pub dedup_retention: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub dedup_sweep_interval: EnvMsDuration,

    #[envconfig(default = "2000")]
    pub stop_timeout: EnvMsDuration,

    pub cursor_path: Option<String>,

    #[envconfig(nested = true)]
    pub intake: IntakeConfig,

    #[envconfig(nested = true)]
    pub queue: QueueConfig,

    #[envconfig(nested = true)]
    pub office365: Office365Config,

    #[envconfig(nested = true)]
    pub retarus: RetarusConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_interval(&self) -> time::Duration {
        match self.poll_interval {
            Some(interval) => interval.0,
            None => self.connector.default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Office365,
    Retarus,
}

impl ConnectorKind {
    pub fn default_poll_interval(&self) -> time::Duration {
        match self {
            ConnectorKind::Office365 => time::Duration::from_secs(300),
            ConnectorKind::Retarus => time::Duration::from_secs(5),
        }
    }
}

impl FromStr for ConnectorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "office365" => Ok(ConnectorKind::Office365),
            "retarus" => Ok(ConnectorKind::Retarus),
            invalid => Err(ConfigError::UnknownConnector(invalid.to_owned())),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct IntakeConfig {
    pub intake_key: NonEmptyString,

    #[envconfig(default = "https://intake.sekoia.io")]
    pub intake_url: String,

    #[envconfig(default = "http")]
    pub intake_mode: IntakeMode,

    #[envconfig(default = "1000")]
    pub intake_chunk_size: usize,

    #[envconfig(default = "30000")]
    pub intake_timeout: EnvMsDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeMode {
    Http,
    Print,
}

impl FromStr for IntakeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "http" => Ok(IntakeMode::Http),
            "print" => Ok(IntakeMode::Print),
            invalid => Err(ConfigError::UnknownIntakeMode(invalid.to_owned())),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct QueueConfig {
    #[envconfig(default = "10000")]
    pub queue_size: NonZeroUsize,

    #[envconfig(default = "1000")]
    pub queue_get_limit: usize,

    #[envconfig(default = "100")]
    pub queue_get_timeout: EnvMsDuration,

    #[envconfig(default = "true")]
    pub queue_get_block: bool,

    #[envconfig(default = "10")]
    pub queue_get_retries: usize,

    #[envconfig(default = "true")]
    pub queue_put_block: bool,

    #[envconfig(default = "1000")]
    pub queue_put_timeout: EnvMsDuration,
}

impl QueueConfig {
    pub fn full_queue_policy(&self) -> FullQueuePolicy {
        if self.queue_put_block {
            FullQueuePolicy::Block(self.queue_put_timeout.0)
        } else {
            FullQueuePolicy::Drop
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct Office365Config {
    pub office365_client_id: Option<String>,

    pub office365_client_secret: Option<String>,

    pub office365_tenant_id: Option<String>,

    pub office365_publisher_id: Option<String>,

    #[envconfig(
        default = "Audit.AzureActiveDirectory,Audit.Exchange,Audit.SharePoint,Audit.General,DLP.All"
    )]
    pub office365_content_types: ContentTypes,

    #[envconfig(default = "https://manage.office.com/api/v1.0")]
    pub office365_base_url: String,

    #[envconfig(default = "https://login.microsoftonline.com")]
    pub office365_authority_url: String,
}

#[derive(Envconfig, Clone)]
pub struct RetarusConfig {
    pub retarus_ws_url: Option<String>,

    pub retarus_ws_key: Option<String>,
}

/// Return the value of an optional setting, or report it under its variable name.
pub fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ConfigError> {
    match value.as_deref() {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Comma separated list of Office 365 content types, e.g. `Audit.Exchange,DLP.All`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTypes(pub BTreeSet<String>);

impl FromStr for ContentTypes {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let content_types: BTreeSet<String> = s
            .split(',')
            .map(str::trim)
            .filter(|content_type| !content_type.is_empty())
            .map(str::to_owned)
            .collect();

        if content_types.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(ContentTypes(content_types))
        }
    }
}
