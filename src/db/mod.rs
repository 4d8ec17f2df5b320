mod connection;
mod query;
mod schema;

pub use connection::*;
pub use query::*;
pub use schema::*;

use async_trait::async_trait;
use tokio_postgres::Client;

use crate::error::{ConnectionError, IntrospectionError};

/// The two things the pipeline needs from a database: its catalog and a way to run SQL.
#[async_trait]
pub trait Database: Send + Sync {
    async fn fetch_schema(&self, namespace: &str) -> Result<SchemaSnapshot, IntrospectionError>;

    /// Run one statement; failures are carried in `QueryResult::error`.
    async fn execute(&self, sql: &str) -> QueryResult;
}

/// A live PostgreSQL connection.
pub struct PgDatabase {
    client: Client,
    profile: ConnectionProfile,
}

impl PgDatabase {
    pub async fn connect(profile: ConnectionProfile) -> Result<Self, ConnectionError> {
        let client = create_client(&profile).await?;
        Ok(Self { client, profile })
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn fetch_schema(&self, namespace: &str) -> Result<SchemaSnapshot, IntrospectionError> {
        introspect(&self.client, namespace).await
    }

    async fn execute(&self, sql: &str) -> QueryResult {
        execute_query(&self.client, sql).await
    }
}
