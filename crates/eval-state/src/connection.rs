//! SurrealDB connection setup
//!
//! [`ConnectionTarget::resolve`] picks the first configured option:
//! 1. `SURREALDB_ENDPOINT` with `SURREALDB_USERNAME`/`SURREALDB_PASSWORD`
//!    (authenticated remote, optional `SURREALDB_NAMESPACE`,
//!    `SURREALDB_DATABASE`, `SURREALDB_ROOT`)
//! 2. `SURREALDB_URL`, any engine URL such as `ws://localhost:8000` or `mem://`
//! 3. local persistence under `.evald/db` (`surrealkv://`)

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

pub const DEFAULT_NAMESPACE: &str = "evald";
pub const DEFAULT_DATABASE: &str = "main";
pub const DEFAULT_LOCAL_PATH: &str = ".evald/db";

/// Credentials for an authenticated remote database.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint, e.g. `wss://xxx.aws-use1.surrealdb.cloud`
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
    /// Sign in as a root user instead of a database user.
    pub is_root: bool,
}

/// Where the evaluation tables live.
#[derive(Debug, Clone)]
pub enum ConnectionTarget {
    Cloud(CloudConfig),
    Url(String),
    Local(String),
}

impl ConnectionTarget {
    /// Resolve from process environment.
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve using `lookup` for variable access.
    ///
    /// A partial cloud configuration (endpoint without credentials) falls
    /// through to the next option.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let cloud = (|| {
            Some(CloudConfig {
                endpoint: lookup("SURREALDB_ENDPOINT")?,
                username: lookup("SURREALDB_USERNAME")?,
                password: lookup("SURREALDB_PASSWORD")?,
                namespace: lookup("SURREALDB_NAMESPACE")
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                database: lookup("SURREALDB_DATABASE")
                    .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
                is_root: lookup("SURREALDB_ROOT")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            })
        })();

        match (cloud, lookup("SURREALDB_URL")) {
            (Some(cloud), _) => ConnectionTarget::Cloud(cloud),
            (None, Some(url)) => ConnectionTarget::Url(url),
            (None, None) => ConnectionTarget::Local(DEFAULT_LOCAL_PATH.to_string()),
        }
    }

    /// Open the connection, authenticate where needed and apply migrations.
    #[instrument(skip(self), fields(target = %self.describe()))]
    pub async fn connect(&self) -> Result<Surreal<Any>> {
        let db = match self {
            ConnectionTarget::Cloud(config) => open_cloud(config).await?,
            ConnectionTarget::Url(url) => open_url(url).await?,
            ConnectionTarget::Local(path) => {
                std::fs::create_dir_all(path).map_err(|e| {
                    StateError::Connection(format!(
                        "Failed to create database directory {}: {}",
                        path, e
                    ))
                })?;
                open_url(&format!("surrealkv://{}", path)).await?
            }
        };
        migrations::init_schema(&db).await?;
        info!("evaluation database ready");
        Ok(db)
    }

    /// Log-safe description (never includes credentials).
    pub fn describe(&self) -> String {
        match self {
            ConnectionTarget::Cloud(c) => {
                format!("{} ({}/{})", c.endpoint, c.namespace, c.database)
            }
            ConnectionTarget::Url(url) => url.clone(),
            ConnectionTarget::Local(path) => format!("surrealkv://{}", path),
        }
    }
}

async fn open_url(url: &str) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;
    db.use_ns(DEFAULT_NAMESPACE)
        .use_db(DEFAULT_DATABASE)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;
    Ok(db)
}

async fn open_cloud(config: &CloudConfig) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(&config.endpoint)
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
        })?;

    let signin = if config.is_root {
        db.signin(Root {
            username: &config.username,
            password: &config.password,
        })
        .await
    } else {
        db.signin(Database {
            namespace: &config.namespace,
            database: &config.database,
            username: &config.username,
            password: &config.password,
        })
        .await
    };
    signin.map_err(|e| StateError::Connection(format!("Authentication failed: {e}")))?;

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;
    Ok(db)
}

/// Connect to `url` with the default namespace and database, then migrate.
pub async fn connect_url(url: &str) -> Result<Surreal<Any>> {
    ConnectionTarget::Url(url.to_string()).connect().await
}

/// Connect to whatever the environment selects.
pub async fn connect_from_env() -> Result<Surreal<Any>> {
    ConnectionTarget::from_env().connect().await
}
