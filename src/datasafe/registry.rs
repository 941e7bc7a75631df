use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::file::FileDataSafe;
use super::nil::NilDataSafe;
use super::postgres::PostgresDataSafe;
use super::{DataSafe, DataSafeError};

/// Builds a fresh, unconfigured backend.
pub type DataSafeFactory = fn() -> Arc<dyn DataSafe>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown data safe '{0}'")]
    Unknown(String),

    #[error("data safe '{0}' already registered")]
    AlreadyRegistered(String),

    #[error("can not configure data safe '{name}': {source}")]
    Configure {
        name: String,
        #[source]
        source: DataSafeError,
    },
}

fn nil() -> Arc<dyn DataSafe> {
    Arc::new(NilDataSafe)
}

fn file() -> Arc<dyn DataSafe> {
    Arc::new(FileDataSafe::new())
}

fn postgres() -> Arc<dyn DataSafe> {
    Arc::new(PostgresDataSafe::new())
}

/// Name to backend lookup, built once at startup.
pub struct DataSafeRegistry {
    known: HashMap<String, DataSafeFactory>,
}

impl DataSafeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            known: HashMap::new(),
        }
    }

    /// A registry holding every backend shipped with the server.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let builtin: [(&str, DataSafeFactory); 8] = [
            ("", nil),
            ("Nil", nil),
            ("nil", nil),
            ("File", file),
            ("file", file),
            ("PostgreSQL", postgres),
            ("Postgres", postgres),
            ("postgres", postgres),
        ];
        for (name, factory) in builtin {
            // Names above are distinct.
            let _ = registry.register(name, factory);
        }
        registry
    }

    /// Register a backend under `name`. Names must be unique.
    pub fn register(&mut self, name: &str, factory: DataSafeFactory) -> Result<(), RegistryError> {
        if self.known.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        self.known.insert(name.to_string(), factory);
        Ok(())
    }

    /// Create an unconfigured backend by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn DataSafe>, RegistryError> {
        self.known
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    /// Create and configure the backend the process will use.
    pub async fn open(&self, name: &str, config: &str) -> Result<Arc<dyn DataSafe>, RegistryError> {
        let safe = self.get(name)?;
        safe.configure(config).await.map_err(|source| RegistryError::Configure {
            name: name.to_string(),
            source,
        })?;
        info!("Data safe '{}' configured (durable: {})", name, safe.is_durable());
        Ok(safe)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.known.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for DataSafeRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
