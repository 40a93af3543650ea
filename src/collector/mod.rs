//! The collection cycle.
//!
//! One call to [`QueryCollector::collect`] is one scrape:
//!
//! 1. provision `workers` connections per target, detecting the server
//!    version once per `host:port` and applying the statement timeout;
//! 2. push one job per configured query onto that target's queue;
//! 3. wait for every worker while a consumer task materializes the
//!    observations they send;
//! 4. report duration, timeouts and errors, then close every connection.
//!
//! Cycles never overlap: a second caller waits for the first to finish.
//! Nothing inside a cycle is fatal; failures are logged, counted and
//! reported through `pg_exporter_last_scrape_errors`.

pub mod sink;
pub mod stats;
pub mod worker;

pub use sink::{MetricKind, MetricSink, Observation};
pub use stats::ScrapeStats;
pub use worker::{Job, merge_labels};

use crate::config::{Config, ServerVersion, Target};
use crate::db::{Connector, Database};
use arc_swap::ArcSwap;
use prometheus::proto::MetricFamily;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, instrument, warn};
use tracing_futures::Instrument as _;

/// Output channel capacity shared by all workers of a cycle.
const OUTPUT_BUFFER: usize = 1024;

pub struct QueryCollector {
    config: ArcSwap<Config>,
    connector: Arc<dyn Connector>,
    cycle: Arc<Mutex<()>>,
}

impl QueryCollector {
    #[must_use]
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            connector,
            cycle: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the configuration used by the next cycle.
    pub fn reload(&self, config: Config) {
        self.config.store(Arc::new(config));
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Run one collection cycle and return everything it gathered.
    ///
    /// The cycle runs in its own task holding the cycle lock, so it finishes
    /// and closes its connections even if the caller stops waiting.
    #[instrument(skip(self), level = "info", fields(otel.kind = "internal"))]
    pub async fn collect(&self) -> Vec<MetricFamily> {
        let guard = Arc::clone(&self.cycle).lock_owned().await;

        let cycle = Cycle {
            config: self.config.load_full(),
            connector: Arc::clone(&self.connector),
            stats: Arc::new(ScrapeStats::new()),
            workers: Vec::new(),
            versions: HashMap::new(),
        };

        let handle = tokio::spawn(
            async move {
                let families = cycle.run().await;
                drop(guard);
                families
            }
            .in_current_span(),
        );

        handle.await.unwrap_or_else(|e| {
            error!(error = %e, "collection cycle failed");
            Vec::new()
        })
    }
}

/// State of one collection cycle: its config snapshot, tallies and the
/// workers it started.
struct Cycle {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    stats: Arc<ScrapeStats>,
    workers: Vec<JoinHandle<Box<dyn Database>>>,
    versions: HashMap<String, ServerVersion>,
}

impl Cycle {
    async fn run(mut self) -> Vec<MetricFamily> {
        let start = Instant::now();

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_BUFFER);
        let consumer = tokio::spawn(consume(out_rx, Arc::clone(&self.stats)));

        let config = Arc::clone(&self.config);
        for target in config.targets() {
            let span = info_span!("collector.target", target_name = %target.name);
            self.dispatch(target, &out_tx).instrument(span).await;
        }
        drop(out_tx);

        let mut connections = Vec::with_capacity(self.workers.len());
        for handle in self.workers.drain(..) {
            match handle.await {
                Ok(db) => connections.push(db),
                Err(e) => {
                    error!(error = %e, "worker task failed");
                    self.stats.record_error();
                }
            }
        }

        let sink = consumer.await.unwrap_or_else(|e| {
            error!(error = %e, "metric consumer task failed");
            self.stats.record_error();
            MetricSink::new()
        });

        let elapsed = start.elapsed();
        if let Err(e) = sink.record_internal(elapsed, &self.stats) {
            error!(error = %e, "could not record internal metrics");
        }

        debug!(
            duration = elapsed.as_secs_f64(),
            timeouts = self.stats.timeouts(),
            errors = self.stats.errors(),
            "scrape finished"
        );

        for db in connections {
            if let Err(e) = db.close().await {
                warn!(error = %e, "could not close db connection");
            }
        }

        sink.gather()
    }

    /// Provision a target's workers and queue its jobs.
    async fn dispatch(&mut self, target: &Target, out: &mpsc::Sender<Observation>) {
        let (job_tx, job_rx) = mpsc::channel(target.workers.max(1));
        let jobs = Arc::new(Mutex::new(job_rx));

        let provisioned = self.provision(target, &jobs, out).await;
        if provisioned == 0 {
            warn!(target_name = %target.name, "no connections available, skipping queries");
            return;
        }

        let version = self
            .versions
            .get(&target.instance())
            .copied()
            .unwrap_or(ServerVersion::NONE);
        let name: Arc<str> = Arc::from(target.name.as_str());

        for query in &target.queries {
            let job = Job {
                target: Arc::clone(&name),
                query: Arc::clone(query),
                labels: Arc::clone(&target.labels),
                version,
            };
            if job_tx.send(job).await.is_err() {
                error!(target_name = %target.name, "all workers are gone");
                self.stats.record_error();
                break;
            }
        }
    }

    /// Open up to `target.workers` connections and start a worker on each.
    /// Stops at the first failure and returns how many workers started.
    async fn provision(
        &mut self,
        target: &Target,
        jobs: &worker::JobQueue,
        out: &mpsc::Sender<Observation>,
    ) -> usize {
        let instance = target.instance();
        let wanted = target.workers.max(1);
        let mut started = 0;

        while started < wanted {
            let mut db = match self.connector.connect(target).await {
                Ok(db) => db,
                Err(e) => {
                    error!(target_name = %target.name, error = %e, "could not create db instance");
                    self.stats.record_error();
                    break;
                }
            };

            if let Err(e) = Self::prepare(target, &instance, db.as_mut(), &mut self.versions).await {
                error!(target_name = %target.name, error = %e, "could not prepare db instance");
                self.stats.record_error();
                if let Err(e) = db.close().await {
                    warn!(target_name = %target.name, error = %e, "could not close db connection");
                }
                break;
            }

            self.workers.push(tokio::spawn(worker::run(
                started,
                db,
                Arc::clone(jobs),
                out.clone(),
                Arc::clone(&self.stats),
            )));
            started += 1;
        }

        started
    }

    /// Detect the version once per instance and apply the statement timeout.
    async fn prepare(
        target: &Target,
        instance: &str,
        db: &mut dyn Database,
        versions: &mut HashMap<String, ServerVersion>,
    ) -> crate::error::Result<()> {
        if !versions.contains_key(instance) {
            let version = if target.skip_version_detection {
                ServerVersion::NONE
            } else {
                db.detect_version().await?
            };
            debug!(instance, %version, "detected server version");
            versions.insert(instance.to_string(), version);
        }

        if let Some(timeout) = target.statement_timeout {
            db.set_statement_timeout(timeout).await?;
        }

        Ok(())
    }
}

/// Materialize observations until every worker has dropped its sender.
async fn consume(mut rx: mpsc::Receiver<Observation>, stats: Arc<ScrapeStats>) -> MetricSink {
    let sink = MetricSink::new();
    while let Some(obs) = rx.recv().await {
        let name = format!("{}_{}", obs.namespace, obs.name);
        if let Err(e) = sink.materialize(obs) {
            warn!(metric = %name, error = %e, "could not create metric");
            stats.record_error();
        }
    }
    sink
}
