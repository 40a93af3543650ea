use super::{Connector, Database, RawValue, Row};
use crate::config::{APPLICATION_NAME, ServerVersion, Target};
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::BoxFuture;
use secrecy::ExposeSecret;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{Column, Connection, Executor as _, Row as _, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info_span, instrument};
use tracing_futures::Instrument as _;

/// SQLSTATE `query_canceled`.
const QUERY_CANCELED: &str = "57014";

/// A single `PostgreSQL` connection.
pub struct PgDatabase {
    conn: PgConnection,
}

impl PgDatabase {
    /// Open and ping a connection to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the options are invalid, the server is
    /// unreachable or the ping fails.
    #[instrument(skip(target), level = "debug", fields(target_name = %target.name, instance = %target.instance()))]
    pub async fn connect(target: &Target) -> Result<Self> {
        let instance = target.instance();
        let connection_error = |source| Error::Connection {
            instance: instance.clone(),
            source,
        };

        let ssl_mode = PgSslMode::from_str(&target.sslmode).map_err(connection_error)?;

        let mut opts = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .ssl_mode(ssl_mode)
            .application_name(APPLICATION_NAME);

        if !target.user.is_empty() {
            opts = opts.username(&target.user);
        }
        if !target.dbname.is_empty() {
            opts = opts.database(&target.dbname);
        }
        if let Some(password) = &target.password {
            opts = opts.password(password.expose_secret());
        }

        let span = info_span!(
            "db.connect",
            db.system = "postgresql",
            otel.kind = "client"
        );
        let mut conn = PgConnection::connect_with(&opts)
            .instrument(span)
            .await
            .map_err(connection_error)?;

        conn.ping().await.map_err(connection_error)?;

        Ok(Self { conn })
    }
}

fn query_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.code().as_deref() == Some(QUERY_CANCELED)
        && db_err.message().contains("statement timeout")
    {
        return Error::Timeout;
    }
    Error::Query(err)
}

fn decode(row: &PgRow, idx: usize, type_name: &str) -> RawValue {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return RawValue::Null,
        Ok(_) => {}
        Err(e) => {
            debug!(column = idx, error = %e, "could not read column");
            return RawValue::Unsupported(type_name.to_string());
        }
    }

    let value = match type_name {
        "INT2" => row.try_get::<i16, _>(idx).map(|v| RawValue::Int(v.into())),
        "INT4" => row.try_get::<i32, _>(idx).map(|v| RawValue::Int(v.into())),
        "INT8" => row.try_get::<i64, _>(idx).map(RawValue::Int),
        "OID" => row.try_get::<Oid, _>(idx).map(|v| RawValue::Int(v.0.into())),
        "FLOAT4" => row
            .try_get::<f32, _>(idx)
            .map(|v| RawValue::Float(v.into())),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(RawValue::Float),
        "BOOL" => row.try_get::<bool, _>(idx).map(RawValue::Bool),
        "TIMESTAMPTZ" => row
            .try_get::<DateTime<Utc>, _>(idx)
            .map(RawValue::Timestamp),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(idx)
            .map(|v| RawValue::Timestamp(v.and_utc())),
        "BYTEA" => row.try_get::<Vec<u8>, _>(idx).map(RawValue::Bytes),
        // Simple-protocol results arrive as text, so numerics parse as strings.
        "NUMERIC" | "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" | "\"CHAR\"" | "CHAR" | "UNKNOWN"
        | "CITEXT" => row.try_get_unchecked::<String, _>(idx).map(RawValue::Text),
        other => return RawValue::Unsupported(other.to_string()),
    };

    value.unwrap_or_else(|e| {
        debug!(column = idx, type_name, error = %e, "could not decode column");
        RawValue::Unsupported(type_name.to_string())
    })
}

fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|col| {
            (
                col.name().to_string(),
                decode(row, col.ordinal(), col.type_info().name()),
            )
        })
        .collect()
}

impl Database for PgDatabase {
    fn set_statement_timeout(&mut self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let sql = format!("SET statement_timeout = {}", timeout.as_millis());
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SET",
                db.statement = %sql,
                otel.kind = "client"
            );
            self.conn
                .execute(sqlx::raw_sql(&sql))
                .instrument(span)
                .await
                .map_err(Error::StatementTimeoutSetup)?;
            Ok(())
        })
    }

    fn execute<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>>> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = sql,
                otel.kind = "client"
            );
            let rows = self
                .conn
                .fetch_all(sqlx::raw_sql(sql))
                .instrument(span)
                .await
                .map_err(query_error)?;

            Ok(rows.iter().map(convert_row).collect())
        })
    }

    fn detect_version(&mut self) -> BoxFuture<'_, Result<ServerVersion>> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = "SELECT current_setting('server_version_num')",
                otel.kind = "client"
            );
            let num = sqlx::query_scalar::<_, i32>(
                "SELECT current_setting('server_version_num')::int4",
            )
            .fetch_one(&mut self.conn)
            .instrument(span)
            .await
            .map_err(Error::VersionDetection)?;

            Ok(ServerVersion::new(num.into()))
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        let conn = self.conn;
        Box::pin(async move { conn.close().await.map_err(Error::Query) })
    }
}

/// Opens [`PgDatabase`] connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn connect<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<Box<dyn Database>>> {
        Box::pin(async move {
            let db = PgDatabase::connect(target).await?;
            Ok(Box::new(db) as Box<dyn Database>)
        })
    }
}
