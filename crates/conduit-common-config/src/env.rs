//! Environment variable handling.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable errors.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("failed to load .env file: {0}")]
    DotenvError(#[from] dotenvy::Error),
}

impl EnvError {
    fn invalid(var: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            var: var.to_string(),
            message: message.into(),
        }
    }
}

/// Environment variable names.
pub mod vars {
    // Run mode
    pub const APP_ENV: &str = "APP_ENV";

    // Database location and credentials
    pub const POSTGRES_HOST: &str = "POSTGRES_HOST";
    pub const POSTGRES_PORT: &str = "POSTGRES_PORT";
    pub const POSTGRES_DB: &str = "POSTGRES_DB";
    pub const POSTGRES_USER: &str = "POSTGRES_USER";
    pub const POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";

    // Pool sizing and connection behaviour
    pub const DB_POOL_SIZE: &str = "DB_POOL_SIZE";
    pub const DB_MAX_OVERFLOW: &str = "DB_MAX_OVERFLOW";
    pub const DB_POOL_TIMEOUT: &str = "DB_POOL_TIMEOUT";
    pub const DB_POOL_RECYCLE: &str = "DB_POOL_RECYCLE";
    pub const DB_ECHO: &str = "DB_ECHO";
    pub const DB_SSL_MODE: &str = "DB_SSL_MODE";
    pub const DB_CONNECT_TIMEOUT: &str = "DB_CONNECT_TIMEOUT";
    pub const DB_CONNECT_RETRIES: &str = "DB_CONNECT_RETRIES";
    pub const DB_RETRY_BASE_DELAY_MS: &str = "DB_RETRY_BASE_DELAY_MS";
    pub const DB_APPLICATION_NAME: &str = "DB_APPLICATION_NAME";

    // Logging
    pub const CONDUIT_LOG_LEVEL: &str = "CONDUIT_LOG_LEVEL";
    pub const CONDUIT_LOG_FORMAT: &str = "CONDUIT_LOG_FORMAT";
    pub const CONDUIT_LOG_FILE: &str = "CONDUIT_LOG_FILE";
    pub const CONDUIT_LOG_SOURCE: &str = "CONDUIT_LOG_SOURCE";
    pub const CONDUIT_LOG_SPANS: &str = "CONDUIT_LOG_SPANS";
    pub const CONDUIT_LOG_TIMESTAMPS: &str = "CONDUIT_LOG_TIMESTAMPS";

    // Development
    pub const RUST_LOG: &str = "RUST_LOG";
}

/// A key/value source that configuration is resolved from.
pub trait EnvSource {
    /// Raw lookup. `None` when the key is absent.
    fn var(&self, key: &str) -> Option<String>;
}

impl<S: EnvSource + ?Sized> EnvSource for &S {
    fn var(&self, key: &str) -> Option<String> {
        (**self).var(key)
    }
}

/// The process environment, optionally seeded from `.env` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl ProcessEnv {
    /// Load `.env` files from the working directory, then return the source.
    pub fn init() -> Result<Self, EnvError> {
        Self::init_from(Path::new("."))
    }

    /// Load `.env`, `.env.local` and `.env.<APP_ENV>` from `dir`.
    ///
    /// Missing files are skipped; variables already present in the process
    /// environment are never overwritten.
    pub fn init_from(dir: &Path) -> Result<Self, EnvError> {
        for name in [".env", ".env.local"] {
            load_optional(&dir.join(name))?;
        }

        if let Ok(mode) = env::var(vars::APP_ENV) {
            load_optional(&dir.join(format!(".env.{}", mode.to_lowercase())))?;
        }

        Ok(Self)
    }
}

fn load_optional(path: &Path) -> Result<(), EnvError> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// An in-memory source, used for tests and for embedding the layer in
/// processes that carry their own configuration map.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }
}

impl EnvSource for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Typed access to an [`EnvSource`].
///
/// Values are trimmed and blank values are treated as unset, so
/// `POSTGRES_USER=` counts as a missing credential.
pub struct Environment<'a, S: EnvSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: EnvSource + ?Sized> Environment<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Get an optional string variable.
    pub fn get(&self, var: &str) -> Option<String> {
        self.source
            .var(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Get a boolean variable.
    pub fn get_bool(&self, var: &str) -> Result<Option<bool>, EnvError> {
        match self.get(var) {
            None => Ok(None),
            Some(v) => match v.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                _ => Err(EnvError::invalid(var, format!("expected boolean, got {:?}", v))),
            },
        }
    }

    /// Get an integer variable.
    pub fn get_int<T: FromStr>(&self, var: &str) -> Result<Option<T>, EnvError> {
        match self.get(var) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| EnvError::invalid(var, format!("expected integer, got {:?}", v))),
        }
    }

    /// Get a duration expressed in whole seconds.
    pub fn get_secs(&self, var: &str) -> Result<Option<Duration>, EnvError> {
        Ok(self.get_int::<u64>(var)?.map(Duration::from_secs))
    }

    /// Get a duration expressed in milliseconds.
    pub fn get_millis(&self, var: &str) -> Result<Option<Duration>, EnvError> {
        Ok(self.get_int::<u64>(var)?.map(Duration::from_millis))
    }

    /// Parse a variable with a custom parser; the parser's message is
    /// reported against the variable name.
    pub fn get_parsed<T, F>(&self, var: &str, parse: F) -> Result<Option<T>, EnvError>
    where
        F: FnOnce(&str) -> Result<T, String>,
    {
        match self.get(var) {
            None => Ok(None),
            Some(v) => parse(&v).map(Some).map_err(|m| EnvError::invalid(var, m)),
        }
    }
}
