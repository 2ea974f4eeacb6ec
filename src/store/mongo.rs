//! MongoDB document store
//!
//! Pattern adapted from the doorway MongoDB client wrapper: connect with
//! short selection timeouts, verify with a ping, map driver errors onto
//! [`BusError::Database`].

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::{
    options::{ClientOptions, Credential, FindOptions},
    Client, Database,
};
use std::time::Duration;
use tracing::{debug, info};

use super::{DocumentStore, FindSpec, SaveOutcome};
use crate::types::{BusError, Result};

/// Time allowed for server selection and connection setup
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection settings for [`MongoStore`]
#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    /// No authentication when unset
    pub username: Option<String>,
    pub password: Option<String>,
    /// Application name reported to the server
    pub app_name: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 27017,
            db_name: "daedalus2".to_string(),
            username: None,
            password: None,
            app_name: "docbus".to_string(),
        }
    }
}

impl MongoConfig {
    /// Connection string without credentials
    pub fn uri(&self) -> String {
        format!("mongodb://{}:{}", self.host, self.port)
    }
}

/// MongoDB-backed [`DocumentStore`]
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    /// Connect and verify the connection with a ping
    pub async fn connect(config: &MongoConfig) -> Result<Self> {
        let uri = config.uri();
        info!("Connecting to MongoDB at {}", uri);

        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| BusError::Database(format!("Invalid MongoDB URI: {}", e)))?;
        options.app_name = Some(config.app_name.clone());
        options.server_selection_timeout = Some(CONNECT_TIMEOUT);
        options.connect_timeout = Some(CONNECT_TIMEOUT);

        if let Some(ref username) = config.username {
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(config.password.clone())
                    .build(),
            );
        }

        let client = Client::with_options(options)
            .map_err(|e| BusError::Database(format!("Failed to connect to MongoDB: {}", e)))?;
        let database = client.database(&config.db_name);

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BusError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", config.db_name);

        Ok(Self { client, database })
    }

    /// Get the database handle
    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn save(&self, collection: &str, document: Document) -> Result<SaveOutcome> {
        let target = self.database.collection::<Document>(collection);

        match document.get("_id").cloned() {
            Some(id) => {
                let result = target
                    .replace_one(doc! { "_id": id.clone() }, document)
                    .upsert(true)
                    .await
                    .map_err(|e| BusError::Database(format!("Upsert failed: {}", e)))?;

                if result.matched_count > 0 {
                    Ok(SaveOutcome::Updated(id))
                } else {
                    Ok(SaveOutcome::Inserted(result.upserted_id.unwrap_or(id)))
                }
            }
            None => {
                let result = target
                    .insert_one(document)
                    .await
                    .map_err(|e| BusError::Database(format!("Insert failed: {}", e)))?;
                Ok(SaveOutcome::Inserted(result.inserted_id))
            }
        }
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        spec: FindSpec,
    ) -> Result<Vec<Document>> {
        let mut options = FindOptions::default();
        options.projection = spec.projection;
        options.sort = spec.sort;
        options.limit = spec.limit;
        options.skip = (spec.skip > 0).then_some(spec.skip);

        let cursor = self
            .database
            .collection::<Document>(collection)
            .find(filter)
            .with_options(options)
            .await
            .map_err(|e| BusError::Database(format!("Find failed: {}", e)))?;

        let documents: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| BusError::Database(format!("Reading find cursor failed: {}", e)))?;

        debug!(collection = %collection, count = documents.len(), "Find completed");
        Ok(documents)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<Document> {
        let stages: Vec<Bson> = pipeline.into_iter().map(Bson::Document).collect();
        let command = doc! {
            "aggregate": collection,
            "pipeline": stages,
            "cursor": {},
        };

        self.database
            .run_command(command)
            .await
            .map_err(|e| BusError::Database(format!("Aggregation failed: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        info!("MongoDB client shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MongoConfig::default();
        assert_eq!(config.uri(), "mongodb://127.0.0.1:27017");
        assert_eq!(config.db_name, "daedalus2");
        assert!(config.username.is_none());
    }

    // Store operations against a live server are covered by MemoryStore tests;
    // MongoStore needs a running MongoDB instance.
}
