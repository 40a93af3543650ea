use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;

/// Queries every test config loads.
pub const QUERIES: &str = r#"
[pg_stat_database]
query = "SELECT datname, numbackends FROM pg_stat_database"

[pg_stat_database.metrics.datname]
usage = "LABEL"
description = "Name of the database"

[pg_stat_database.metrics.numbackends]
usage = "GAUGE"
description = "Number of backends currently connected to this database"
"#;

/// Get an available port for testing
#[allow(dead_code)]
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Build test URL for HTTP requests
#[allow(dead_code)]
pub fn get_test_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

/// Wait for server to be ready
#[allow(dead_code)]
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{port}"))
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Write a config with one target and the shared query file into `dir`.
#[allow(dead_code)]
pub fn write_config(dir: &Path, host: &str, port: u16, extra: &str) -> PathBuf {
    std::fs::write(dir.join("queries.toml"), QUERIES).expect("Failed to write query file");

    let config = format!(
        r#"[main]
host = "{host}"
port = {port}
user = "postgres"
dbname = "postgres"
sslmode = "disable"
statement_timeout = "5s"
query_files = ["queries.toml"]
{extra}
[main.labels]
env = "test"
"#
    );

    let path = dir.join("config.toml");
    std::fs::write(&path, config).expect("Failed to write config file");
    path
}

/// A target nothing listens on.
#[allow(dead_code)]
pub fn write_unreachable_config(dir: &Path) -> PathBuf {
    write_config(dir, "127.0.0.1", 1, "")
}
