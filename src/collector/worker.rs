use super::sink::{MetricKind, Observation};
use super::stats::ScrapeStats;
use crate::config::version::resolve;
use crate::config::{Query, ServerVersion, Usage};
use crate::db::value::{ConversionError, to_f64, to_label};
use crate::db::{Database, RawValue, Row};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info_span, warn};
use tracing_futures::Instrument as _;

/// One query to run against one target.
#[derive(Clone, Debug)]
pub struct Job {
    pub target: Arc<str>,
    pub query: Arc<Query>,
    pub labels: Arc<HashMap<String, String>>,
    pub version: ServerVersion,
}

pub type JobQueue = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Merge static and row labels; row labels win on a key collision.
#[must_use]
pub fn merge_labels(
    static_labels: &HashMap<String, String>,
    dynamic: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = static_labels.clone();
    merged.extend(dynamic.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Build the observation for metric `name`, or `None` if its usage does not
/// produce a value.
fn observation(
    job: &Job,
    name: &str,
    definition: &str,
    labels: &HashMap<String, String>,
    raw: &RawValue,
) -> Result<Option<Observation>> {
    let Some(metric) = job.query.metric(definition) else {
        return Ok(None);
    };

    let kind = match metric.usage {
        Usage::Counter => MetricKind::Counter,
        Usage::Gauge => MetricKind::Gauge,
        Usage::Label | Usage::Discard => return Ok(None),
    };

    Ok(Some(Observation {
        namespace: job.query.name.clone(),
        name: name.to_string(),
        help: metric.description.clone(),
        kind,
        labels: labels.clone(),
        value: to_f64(raw)?,
    }))
}

/// Run one job and send its observations to `out`.
///
/// A failed label conversion is counted and leaves an empty label; any other
/// failure abandons the rest of the job and is returned.
///
/// # Errors
///
/// Returns an error if no SQL variant applies, the query fails, or a metric
/// name or value cannot be converted.
pub async fn process_job(
    db: &mut dyn Database,
    job: &Job,
    out: &mpsc::Sender<Observation>,
    stats: &ScrapeStats,
) -> Result<usize> {
    let sql = resolve(&job.query.variants, job.version).ok_or_else(|| Error::UnresolvedVersion {
        query: job.query.name.clone(),
        version: job.version,
    })?;

    let label_columns: Vec<&str> = job.query.label_columns().collect();

    let rows = db.execute(sql).await?;
    let mut sent = 0;

    for row in &rows {
        let mut row_labels = HashMap::with_capacity(label_columns.len());
        for &column in &label_columns {
            let raw = row.get(column);
            let value = to_label(raw).unwrap_or_else(|| {
                warn!(
                    query = %job.query.name,
                    column,
                    type_name = raw.type_name(),
                    "could not convert label column value to string"
                );
                stats.record_error();
                String::new()
            });
            row_labels.insert(column.to_string(), value);
        }
        let labels = merge_labels(&job.labels, &row_labels);

        if let Some((name_column, value_column)) = job.query.name_value_columns() {
            if let Some(obs) = name_value_observation(job, row, name_column, value_column, &labels)?
            {
                if !emit(out, job, obs).await {
                    return Ok(sent);
                }
                sent += 1;
            }
            continue;
        }

        // Metrics already sent from this row stay sent if a later column fails.
        for (column, raw) in row.iter() {
            if row_labels.contains_key(column) || job.query.metric(column).is_none() {
                continue;
            }
            let Some(obs) = observation(job, column, column, &labels, raw)? else {
                continue;
            };
            if !emit(out, job, obs).await {
                return Ok(sent);
            }
            sent += 1;
        }
    }

    Ok(sent)
}

/// Send `obs`; `false` once the consumer is gone.
async fn emit(out: &mpsc::Sender<Observation>, job: &Job, obs: Observation) -> bool {
    if out.send(obs).await.is_err() {
        debug!(query = %job.query.name, "metric consumer is gone");
        return false;
    }
    true
}

fn name_value_observation(
    job: &Job,
    row: &Row,
    name_column: &str,
    value_column: &str,
    labels: &HashMap<String, String>,
) -> Result<Option<Observation>> {
    let raw_name = row.get(name_column);
    let name = to_label(raw_name)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ConversionError::MetricName {
            column: name_column.to_string(),
            type_name: raw_name.type_name().to_string(),
        })?;

    let definition = if job.query.metric(&name).is_some() {
        name.as_str()
    } else {
        value_column
    };

    observation(job, &name, definition, labels, row.get(value_column))
}

/// Pull jobs until the queue is closed, then hand the connection back.
pub async fn run(
    id: usize,
    mut db: Box<dyn Database>,
    jobs: JobQueue,
    out: mpsc::Sender<Observation>,
    stats: Arc<ScrapeStats>,
) -> Box<dyn Database> {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        let span = info_span!(
            "collector.job",
            worker = id,
            target_name = %job.target,
            query = %job.query.name,
            otel.kind = "internal"
        );

        match process_job(db.as_mut(), &job, &out, &stats).instrument(span).await {
            Ok(sent) => debug!(
                worker = id,
                target_name = %job.target,
                query = %job.query.name,
                metrics = sent,
                "job finished"
            ),
            Err(e) => {
                if e.is_timeout() {
                    stats.record_timeout();
                } else {
                    stats.record_error();
                }
                warn!(
                    worker = id,
                    target_name = %job.target,
                    query = %job.query.name,
                    error = %e,
                    "could not fetch metric"
                );
            }
        }
    }

    db
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Metric, VersionedSql};
    use crate::db::value::RawValue;
    use futures::future::BoxFuture;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    pub(crate) type EventLog = Arc<StdMutex<Vec<String>>>;

    pub(crate) fn push_event(log: &EventLog, event: impl Into<String>) {
        if let Ok(mut events) = log.lock() {
            events.push(event.into());
        }
    }

    /// Replays canned results; every query text maps to one outcome.
    #[derive(Default)]
    pub(crate) struct FakeDb {
        pub results: HashMap<String, FakeResult>,
        pub version: i64,
        pub delay: Option<Duration>,
        pub fail_version: bool,
        pub fail_timeout_setup: bool,
        pub log: EventLog,
    }

    #[derive(Clone)]
    pub(crate) enum FakeResult {
        Rows(Vec<Row>),
        Timeout,
        Fail,
    }

    impl Database for FakeDb {
        fn set_statement_timeout(&mut self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
            push_event(&self.log, format!("timeout {}ms", timeout.as_millis()));
            let fail = self.fail_timeout_setup;
            Box::pin(async move {
                if fail {
                    return Err(Error::StatementTimeoutSetup(sqlx::Error::Protocol(
                        "permission denied to set parameter".to_string(),
                    )));
                }
                Ok(())
            })
        }

        fn execute<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                match self.results.get(sql) {
                    Some(FakeResult::Rows(rows)) => Ok(rows.clone()),
                    Some(FakeResult::Timeout) => Err(Error::Timeout),
                    Some(FakeResult::Fail) | None => Err(Error::Query(sqlx::Error::Protocol(
                        format!("relation for {sql:?} does not exist"),
                    ))),
                }
            })
        }

        fn detect_version(&mut self) -> BoxFuture<'_, Result<ServerVersion>> {
            push_event(&self.log, "version");
            let version = ServerVersion::new(self.version);
            let fail = self.fail_version;
            Box::pin(async move {
                if fail {
                    return Err(Error::VersionDetection(sqlx::Error::Protocol(
                        "unrecognized configuration parameter".to_string(),
                    )));
                }
                Ok(version)
            })
        }

        fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
            push_event(&self.log, "close");
            Box::pin(async { Ok(()) })
        }
    }

    pub(crate) fn metric(usage: Usage) -> Metric {
        Metric {
            usage,
            description: "test".to_string(),
        }
    }

    pub(crate) fn query(name: &str, sql: &str, metrics: &[(&str, Usage)]) -> Query {
        Query {
            name: name.to_string(),
            variants: vec![VersionedSql::unbounded(sql)],
            metrics: metrics
                .iter()
                .map(|(col, usage)| ((*col).to_string(), metric(*usage)))
                .collect::<BTreeMap<_, _>>(),
            name_column: None,
            value_column: None,
        }
    }

    fn job(query: Query, labels: &[(&str, &str)]) -> Job {
        Job {
            target: Arc::from("main"),
            query: Arc::new(query),
            labels: Arc::new(
                labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            version: ServerVersion::NONE,
        }
    }

    fn text(s: &str) -> RawValue {
        RawValue::Text(s.to_string())
    }

    async fn run_job(db: &mut FakeDb, job: &Job, stats: &ScrapeStats) -> (Result<usize>, Vec<Observation>) {
        let (tx, mut rx) = mpsc::channel(64);
        let res = process_job(db, job, &tx, stats).await;
        drop(tx);
        let mut out = Vec::new();
        while let Some(obs) = rx.recv().await {
            out.push(obs);
        }
        (res, out)
    }

    #[test]
    fn test_merge_labels_dynamic_wins() {
        let static_labels = HashMap::from([("env".to_string(), "prod".to_string())]);
        let dynamic = HashMap::from([
            ("env".to_string(), "staging".to_string()),
            ("shard".to_string(), "1".to_string()),
        ]);
        let merged = merge_labels(&static_labels, &dynamic);
        assert_eq!(merged, dynamic);
    }

    #[tokio::test]
    #[allow(clippy::indexing_slicing)]
    async fn test_column_mode_emits_one_metric_per_column() {
        let sql = "SELECT datname, numbackends, xact_commit, extra FROM pg_stat_database";
        let mut db = FakeDb::default();
        db.results.insert(
            sql.to_string(),
            FakeResult::Rows(vec![Row::from_iter([
                ("datname", text("postgres")),
                ("numbackends", RawValue::Int(3)),
                ("xact_commit", RawValue::Int(100)),
                ("extra", RawValue::Int(7)),
            ])]),
        );
        let job = job(
            query(
                "pg_stat_database",
                sql,
                &[
                    ("datname", Usage::Label),
                    ("numbackends", Usage::Gauge),
                    ("xact_commit", Usage::Counter),
                ],
            ),
            &[("env", "prod")],
        );
        let stats = ScrapeStats::new();

        let (res, out) = run_job(&mut db, &job, &stats).await;

        assert!(matches!(res, Ok(2)));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "numbackends");
        assert_eq!(out[0].kind, MetricKind::Gauge);
        assert_eq!(out[1].name, "xact_commit");
        assert_eq!(out[1].kind, MetricKind::Counter);
        assert_eq!(out[1].namespace, "pg_stat_database");
        assert_eq!(out[1].labels.get("datname").map(String::as_str), Some("postgres"));
        assert_eq!(out[1].labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(stats.errors(), 0);
    }

    #[tokio::test]
    async fn test_name_value_mode() {
        let sql = "SELECT name, setting FROM pg_settings";
        let mut db = FakeDb::default();
        db.results.insert(
            sql.to_string(),
            FakeResult::Rows(vec![
                Row::from_iter([("name", text("work_mem")), ("setting", text("4096"))]),
                Row::from_iter([("name", text("max_connections")), ("setting", text("100"))]),
            ]),
        );
        let mut q = query("pg_settings", sql, &[("setting", Usage::Gauge)]);
        q.name_column = Some("name".to_string());
        q.value_column = Some("setting".to_string());
        let job = job(q, &[]);
        let stats = ScrapeStats::new();

        let (res, out) = run_job(&mut db, &job, &stats).await;

        assert!(matches!(res, Ok(2)));
        let got: Vec<(&str, f64)> = out.iter().map(|o| (o.name.as_str(), o.value)).collect();
        assert_eq!(got, vec![("work_mem", 4096.0), ("max_connections", 100.0)]);
        assert!(out.iter().all(|o| o.kind == MetricKind::Gauge));
    }

    #[tokio::test]
    async fn test_name_value_mode_prefers_definition_for_name() {
        let sql = "SELECT name, value FROM counters";
        let mut db = FakeDb::default();
        db.results.insert(
            sql.to_string(),
            FakeResult::Rows(vec![Row::from_iter([
                ("name", text("commits")),
                ("value", RawValue::Int(5)),
            ])]),
        );
        let mut q = query(
            "stats",
            sql,
            &[("value", Usage::Gauge), ("commits", Usage::Counter)],
        );
        q.name_column = Some("name".to_string());
        q.value_column = Some("value".to_string());
        let stats = ScrapeStats::new();

        let (_, out) = run_job(&mut db, &job(q, &[]), &stats).await;

        assert_eq!(out.len(), 1);
        assert!(out.iter().all(|o| o.kind == MetricKind::Counter));
    }

    #[tokio::test]
    async fn test_bad_name_column_abandons_rest_of_job() {
        let sql = "SELECT name, setting FROM pg_settings";
        let mut db = FakeDb::default();
        db.results.insert(
            sql.to_string(),
            FakeResult::Rows(vec![
                Row::from_iter([("name", text("work_mem")), ("setting", text("4096"))]),
                Row::from_iter([
                    ("name", RawValue::Unsupported("JSONB".to_string())),
                    ("setting", text("1")),
                ]),
                Row::from_iter([("name", text("max_connections")), ("setting", text("100"))]),
            ]),
        );
        let mut q = query("pg_settings", sql, &[("setting", Usage::Gauge)]);
        q.name_column = Some("name".to_string());
        q.value_column = Some("setting".to_string());
        let stats = ScrapeStats::new();

        let (res, out) = run_job(&mut db, &job(q, &[]), &stats).await;

        assert!(matches!(res, Err(Error::Conversion(_))));
        assert_eq!(out.len(), 1);
        assert!(out.iter().all(|o| o.name == "work_mem"));
    }

    #[tokio::test]
    async fn test_bad_label_column_degrades_label_only() {
        let sql = "SELECT datname, numbackends FROM pg_stat_database";
        let mut db = FakeDb::default();
        db.results.insert(
            sql.to_string(),
            FakeResult::Rows(vec![Row::from_iter([
                ("datname", RawValue::Unsupported("JSONB".to_string())),
                ("numbackends", RawValue::Int(3)),
            ])]),
        );
        let q = query(
            "pg_stat_database",
            sql,
            &[("datname", Usage::Label), ("numbackends", Usage::Gauge)],
        );
        let stats = ScrapeStats::new();

        let (res, out) = run_job(&mut db, &job(q, &[]), &stats).await;

        assert!(matches!(res, Ok(1)));
        assert_eq!(stats.errors(), 1);
        assert_eq!(
            out.first().and_then(|o| o.labels.get("datname")).map(String::as_str),
            Some("")
        );
    }

    #[tokio::test]
    #[allow(clippy::float_cmp)]
    async fn test_bad_metric_value_abandons_rest_of_job() {
        let sql = "SELECT datname, numbackends, blks_hit, xact_commit FROM pg_stat_database";
        let mut db = FakeDb::default();
        db.results.insert(
            sql.to_string(),
            FakeResult::Rows(vec![
                Row::from_iter([
                    ("datname", text("postgres")),
                    ("numbackends", RawValue::Int(3)),
                    ("blks_hit", text("abc")),
                    ("xact_commit", RawValue::Int(100)),
                ]),
                Row::from_iter([
                    ("datname", text("app")),
                    ("numbackends", RawValue::Int(5)),
                    ("blks_hit", RawValue::Int(10)),
                    ("xact_commit", RawValue::Int(200)),
                ]),
            ]),
        );
        let q = query(
            "pg_stat_database",
            sql,
            &[
                ("datname", Usage::Label),
                ("numbackends", Usage::Gauge),
                ("blks_hit", Usage::Gauge),
                ("xact_commit", Usage::Counter),
            ],
        );
        let stats = ScrapeStats::new();

        let (res, out) = run_job(&mut db, &job(q, &[]), &stats).await;

        assert!(matches!(
            res,
            Err(Error::Conversion(ConversionError::NotANumber { .. }))
        ));
        let got: Vec<(&str, f64)> = out.iter().map(|o| (o.name.as_str(), o.value)).collect();
        assert_eq!(got, vec![("numbackends", 3.0)]);
    }

    #[tokio::test]
    async fn test_timeout_is_returned() {
        let sql = "SELECT pg_sleep(10)";
        let mut db = FakeDb::default();
        db.results.insert(sql.to_string(), FakeResult::Timeout);
        let q = query("slow", sql, &[]);
        let stats = ScrapeStats::new();

        let (res, out) = run_job(&mut db, &job(q, &[]), &stats).await;

        assert!(res.is_err_and(|e| e.is_timeout()));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_version() {
        let mut q = query("versioned", "unused", &[]);
        q.variants = vec![
            VersionedSql {
                min: ServerVersion::new(100_000),
                max: ServerVersion::UNBOUNDED,
                sql: "A".to_string(),
            },
            VersionedSql {
                min: ServerVersion::new(90_400),
                max: ServerVersion::new(100_000),
                sql: "B".to_string(),
            },
        ];
        let mut j = job(q, &[]);
        j.version = ServerVersion::new(80_000);
        let stats = ScrapeStats::new();

        let (res, _) = run_job(&mut FakeDb::default(), &j, &stats).await;

        assert!(matches!(res, Err(Error::UnresolvedVersion { .. })));
    }

    #[tokio::test]
    async fn test_worker_counts_failures_and_returns_connection() {
        let mut db = FakeDb::default();
        db.results.insert("slow".to_string(), FakeResult::Timeout);
        db.results.insert("broken".to_string(), FakeResult::Fail);

        let (job_tx, job_rx) = mpsc::channel(2);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let stats = Arc::new(ScrapeStats::new());

        let handle = tokio::spawn(run(
            0,
            Box::new(db),
            Arc::new(Mutex::new(job_rx)),
            out_tx,
            Arc::clone(&stats),
        ));

        for sql in ["slow", "broken"] {
            let _ = job_tx.send(job(query(sql, sql, &[]), &[])).await;
        }
        drop(job_tx);

        assert!(handle.await.is_ok());
        assert_eq!(stats.timeouts(), 1);
        assert_eq!(stats.errors(), 2);
    }
}
