//! Turns observations into prometheus metrics.
//!
//! Every cycle gets its own [`Registry`]; counters and gauges are created
//! fresh with the value read in that cycle, and the registry merges metrics
//! sharing a name into one family.

use super::stats::ScrapeStats;
use crate::error::{Error, Result};
use prometheus::proto::MetricFamily;
use prometheus::{Counter, Gauge, Opts, Registry};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Namespace of the exporter's own metrics.
pub const INTERNAL_NAMESPACE: &str = "pg_exporter";
pub const SCRAPE_DURATION: &str = "last_scrape_duration_seconds";
pub const SCRAPE_TIMEOUTS: &str = "last_scrape_timeouts";
pub const SCRAPE_ERRORS: &str = "last_scrape_errors";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// One metric value read from a result row.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    /// The query name.
    pub namespace: String,
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

#[derive(Default)]
pub struct MetricSink {
    registry: Registry,
}

impl MetricSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `obs` as a counter or gauge.
    ///
    /// Counters holding NaN (a NULL column) are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid names, negative counters and label sets
    /// that clash with an already materialized metric of the same name.
    pub fn materialize(&self, obs: Observation) -> Result<()> {
        let help = if obs.help.is_empty() {
            format!("{}_{}", obs.namespace, obs.name)
        } else {
            obs.help
        };
        let opts = Opts::new(obs.name, help)
            .namespace(obs.namespace)
            .const_labels(obs.labels);

        match obs.kind {
            MetricKind::Counter => {
                if obs.value.is_nan() {
                    debug!(metric = %opts.fq_name(), "skipping counter without a value");
                    return Ok(());
                }
                if obs.value < 0.0 {
                    return Err(Error::Sink(prometheus::Error::Msg(format!(
                        "counter {} cannot be negative: {}",
                        opts.fq_name(),
                        obs.value
                    ))));
                }
                let counter = Counter::with_opts(opts)?;
                counter.inc_by(obs.value);
                self.registry.register(Box::new(counter))?;
            }
            MetricKind::Gauge => {
                let gauge = Gauge::with_opts(opts)?;
                gauge.set(obs.value);
                self.registry.register(Box::new(gauge))?;
            }
        }

        Ok(())
    }

    /// Add the cycle's duration, timeout and error metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if one of them is already registered.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_internal(&self, duration: Duration, stats: &ScrapeStats) -> Result<()> {
        let duration_gauge = Gauge::with_opts(
            Opts::new(SCRAPE_DURATION, "Duration of the last scrape of metrics")
                .namespace(INTERNAL_NAMESPACE),
        )?;
        duration_gauge.set(duration.as_secs_f64());

        let timeouts = Counter::with_opts(
            Opts::new(SCRAPE_TIMEOUTS, "Number of timed out statements")
                .namespace(INTERNAL_NAMESPACE),
        )?;
        timeouts.inc_by(stats.timeouts() as f64);

        let errors = Counter::with_opts(
            Opts::new(SCRAPE_ERRORS, "Number of errors during scraping")
                .namespace(INTERNAL_NAMESPACE),
        )?;
        errors.inc_by(stats.errors() as f64);

        self.registry.register(Box::new(duration_gauge))?;
        self.registry.register(Box::new(timeouts))?;
        self.registry.register(Box::new(errors))?;

        Ok(())
    }

    #[must_use]
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}
