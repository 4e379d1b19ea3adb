use crate::telemetry::ConnectStatus;
use core::fmt;
use core::time::Duration;

#[derive(Debug)]
pub enum ConnectError<E> {
    AssociationTimeout(Duration),
    Radio(E),
}

impl<E: fmt::Debug> fmt::Display for ConnectError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AssociationTimeout(waited) => write!(
                f,
                "Access point did not associate within {} ms",
                waited.as_millis()
            ),
            Self::Radio(err) => write!(f, "Radio driver error: {err:?}"),
        }
    }
}

impl<E: fmt::Debug> std::error::Error for ConnectError<E> {}

#[derive(Debug)]
pub enum TelemetryError {
    RetriesExhausted { attempts: u8, last: ConnectStatus },
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted { attempts, last } => write!(
                f,
                "Broker unreachable after {attempts} attempts, last status: {last}"
            ),
        }
    }
}

impl std::error::Error for TelemetryError {}

#[derive(Debug)]
pub enum ConfigError {
    Json(serde_json::Error),
    InvalidPort(String),
    InvalidSleepDuration(String),
    InvalidOverrideMode(String),
    InvalidTimeoutAction(String),
    TopicTooLong(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(err) => write!(f, "Malformed configuration document: {err}"),
            Self::InvalidPort(s) => write!(f, "Invalid broker port '{s}'"),
            Self::InvalidSleepDuration(s) => write!(f, "Invalid deep sleep duration '{s}'"),
            Self::InvalidOverrideMode(s) => write!(f, "Unknown override mode '{s}'"),
            Self::InvalidTimeoutAction(s) => write!(f, "Unknown association timeout action '{s}'"),
            Self::TopicTooLong(s) => write!(f, "Feed topic '{s}' exceeds the topic buffer"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}
