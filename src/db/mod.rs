//! The database side of a collection cycle: one connection per worker.

pub mod postgres;
pub mod value;

pub use postgres::{PgConnector, PgDatabase};
pub use value::RawValue;

use crate::config::{ServerVersion, Target};
use crate::error::Result;
use futures::future::BoxFuture;
use std::time::Duration;

static NULL: RawValue = RawValue::Null;

/// One result row, columns in result order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, RawValue)>,
}

impl Row {
    #[must_use]
    pub const fn new(columns: Vec<(String, RawValue)>) -> Self {
        Self { columns }
    }

    /// Value of `column`; a missing column reads as `Null`.
    #[must_use]
    pub fn get(&self, column: &str) -> &RawValue {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map_or(&NULL, |(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl<S: Into<String>> FromIterator<(S, RawValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (S, RawValue)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A single physical connection owned by one worker for one cycle.
pub trait Database: Send {
    fn set_statement_timeout(&mut self, timeout: Duration) -> BoxFuture<'_, Result<()>>;

    /// Run `sql` and return every row. A statement timeout is reported as
    /// [`crate::error::Error::Timeout`].
    fn execute<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>>>;

    fn detect_version(&mut self) -> BoxFuture<'_, Result<ServerVersion>>;

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Opens connections for a target.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<Box<dyn Database>>>;
}
