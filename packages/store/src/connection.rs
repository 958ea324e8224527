//! Store selection, connection settings and errors.

use queue_core::JobRef;
use thiserror::Error;

/// Which JobStore variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local maps, for single-process use and tests.
    Memory,
    /// SurrealDB, shared between processes when the endpoint is.
    Surreal,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Surreal => "surreal",
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SurrealDB endpoint: `mem://`, `file://path`, `rocksdb://path` or a
    /// remote `ws://` address.
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            endpoint: "mem://".to_string(),
            namespace: "jobqueue".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl StoreConfig {
    /// In-process memory store.
    pub fn memory() -> Self {
        Self::default()
    }

    /// SurrealDB running embedded in memory.
    pub fn surreal_memory() -> Self {
        Self {
            backend: StoreBackend::Surreal,
            ..Default::default()
        }
    }

    /// SurrealDB with file-based persistence.
    pub fn file(path: impl Into<String>) -> Self {
        Self::surreal(format!("file://{}", path.into()))
    }

    /// SurrealDB on RocksDB (requires the `rocksdb` feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self::surreal(format!("rocksdb://{}", path.into()))
    }

    /// SurrealDB at an arbitrary endpoint.
    pub fn surreal(endpoint: impl Into<String>) -> Self {
        Self {
            backend: StoreBackend::Surreal,
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `STORE_BACKEND`: `memory` (default) or `surreal`
    /// - `STORE_ENDPOINT` (default: `mem://`)
    /// - `STORE_NAMESPACE`, `STORE_DATABASE`
    /// - `STORE_USER`, `STORE_PASS` (both required for credentials)
    pub fn from_env() -> Result<Self, StoreError> {
        let backend = match std::env::var("STORE_BACKEND").ok().as_deref() {
            None | Some("") | Some("memory") | Some("mem") => StoreBackend::Memory,
            Some("surreal") | Some("surrealdb") => StoreBackend::Surreal,
            Some(other) => {
                return Err(StoreError::InvalidConfig(format!(
                    "unsupported STORE_BACKEND={other} (expected memory|surreal)"
                )));
            }
        };

        let mut cfg = Self {
            backend,
            ..Default::default()
        };
        if let Some(endpoint) = env_non_empty("STORE_ENDPOINT") {
            cfg.endpoint = endpoint;
        }
        if let Some(namespace) = env_non_empty("STORE_NAMESPACE") {
            cfg.namespace = namespace;
        }
        if let Some(database) = env_non_empty("STORE_DATABASE") {
            cfg.database = database;
        }
        if let (Some(user), Some(pass)) = (env_non_empty("STORE_USER"), env_non_empty("STORE_PASS"))
        {
            cfg.credentials = Some((user, pass));
        }
        Ok(cfg)
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Queue not registered: {0}")]
    UnknownQueue(String),
    #[error("Job not found: {0}")]
    NotFound(JobRef),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("invalid store config: {0}")]
    InvalidConfig(String),
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
}

impl StoreError {
    /// Whether the error only means "no such job".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
