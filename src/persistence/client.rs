use std::sync::Arc;

use libsql::{Builder, Connection, Database};
use tracing::{info, instrument};

use crate::errors::PersistenceError;

use super::schema;

/// Owns the single on-disk database for the process (spec.md §4.5: "the
/// database is opened exactly once per process"). Cloning shares the
/// underlying driver; each call site gets its own `Connection`.
#[derive(Clone)]
pub struct PersistenceClient {
    driver: Arc<Database>,
}

impl PersistenceClient {
    #[instrument(skip(path))]
    pub async fn open(path: &str) -> Result<Self, PersistenceError> {
        let driver = Builder::new_local(path)
            .build()
            .await
            .map_err(|source| PersistenceError::Open {
                path: path.to_string(),
                source,
            })?;

        let bootstrap = driver.connect().map_err(|source| PersistenceError::Open {
            path: path.to_string(),
            source,
        })?;
        schema::apply(&bootstrap).await?;
        info!(path, "opened persistence database");

        Ok(PersistenceClient {
            driver: Arc::new(driver),
        })
    }

    pub fn connection(&self) -> Result<Connection, PersistenceError> {
        self.driver.connect().map_err(|source| PersistenceError::Open {
            path: String::from("<pooled>"),
            source,
        })
    }
}
