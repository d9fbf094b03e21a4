//! PostgreSQL connector over `sqlx`.

use async_trait::async_trait;
use conduit_common_log::SQL_TARGET;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Executor};
use std::ops::{Deref, DerefMut};
use tracing::info;

use crate::config::{ConnectionConfig, SslMode};
use crate::connection::{Connection, Connector};
use crate::error::{DbError, DbResult};

/// Opens [`PgSession`]s from a [`ConnectionConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl PgConnector {
    pub fn new() -> Self {
        Self
    }

    pub fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(config.password.expose())
            .ssl_mode(pg_ssl_mode(config.ssl_mode))
            .application_name(&config.application_name);

        // Echo is done by the session on `conduit::sql`; keep sqlx's own
        // statement log quiet unless echo is on.
        if config.echo {
            options
        } else {
            options.disable_statement_logging()
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgSession;

    async fn connect(&self, config: &ConnectionConfig) -> DbResult<PgSession> {
        let options = Self::connect_options(config);
        let conn = <PgConnection as sqlx::Connection>::connect_with(&options)
            .await
            .map_err(classify)?;

        Ok(PgSession {
            conn,
            echo: config.echo,
        })
    }
}

fn pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

/// A live PostgreSQL session.
///
/// Derefs to [`PgConnection`], so units of work can run ordinary `sqlx`
/// queries against it.
pub struct PgSession {
    conn: PgConnection,
    echo: bool,
}

impl PgSession {
    fn echo(&self, sql: &str) {
        if self.echo {
            info!(target: SQL_TARGET, sql, "executing statement");
        }
    }
}

impl Deref for PgSession {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.conn
    }
}

impl DerefMut for PgSession {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

#[async_trait]
impl Connection for PgSession {
    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.echo(sql);
        let result = (&mut self.conn).execute(sql).await.map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn ping(&mut self) -> DbResult<()> {
        const SQL: &str = "SELECT 1";
        self.echo(SQL);
        sqlx::query_scalar::<_, i32>(SQL)
            .fetch_one(&mut self.conn)
            .await
            .map(drop)
            .map_err(classify)
    }

    async fn server_version(&mut self) -> DbResult<String> {
        const SQL: &str = "SELECT version()";
        self.echo(SQL);
        sqlx::query_scalar::<_, String>(SQL)
            .fetch_one(&mut self.conn)
            .await
            .map_err(classify)
    }

    async fn close(self) -> DbResult<()> {
        sqlx::Connection::close(self.conn).await.map_err(classify)
    }
}

/// Sort a driver error into [`DbError::Transient`] or [`DbError::Fatal`].
pub fn classify(err: sqlx::Error) -> DbError {
    let transient = match &err {
        sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
        _ => false,
    };

    if transient {
        DbError::transient(err)
    } else {
        DbError::fatal(err)
    }
}

/// SQLSTATE codes worth retrying: connection exceptions (class 08),
/// server shutdown or startup, too many connections, serialization
/// failures and deadlocks.
pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || matches!(code, "57P01" | "57P02" | "57P03" | "53300" | "40001" | "40P01")
}
