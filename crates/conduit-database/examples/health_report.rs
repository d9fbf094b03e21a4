//! Print the database health report as JSON.
//!
//! ```sh
//! APP_ENV=development POSTGRES_HOST=localhost DB_SSL_MODE=disable \
//!     cargo run -p conduit-database --example health_report
//! ```

use conduit_common_log::{info, init, LogConfig};
use conduit_database::{DatabaseService, HealthStatus};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init(LogConfig::from_env())?;

    let service = DatabaseService::from_env()?;
    info!(url = %service.config().redacted_url(), "probing database");

    let report = service.get_info().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    println!("\n{}", service.metrics().export_prometheus());

    service.shutdown(Duration::from_secs(5)).await;

    if report.status == HealthStatus::Error {
        anyhow::bail!("database is unhealthy");
    }
    Ok(())
}
