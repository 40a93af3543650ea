use crate::config::ServerVersion;
use crate::db::value::ConversionError;
use thiserror::Error;

/// Failures inside a collection cycle. None of them escape the cycle; each is
/// logged and counted against the job or target it happened in.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not connect to {instance}: {source}")]
    Connection {
        instance: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("could not get server version: {0}")]
    VersionDetection(#[source] sqlx::Error),

    #[error("could not set statement timeout: {0}")]
    StatementTimeoutSetup(#[source] sqlx::Error),

    #[error("canceled due to statement timeout")]
    Timeout,

    #[error("query error: {0}")]
    Query(#[source] sqlx::Error),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("could not find a {query:?} query variant for server version {version}")]
    UnresolvedVersion {
        query: String,
        version: ServerVersion,
    },

    #[error("could not create metric: {0}")]
    Sink(#[from] prometheus::Error),
}

impl Error {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
