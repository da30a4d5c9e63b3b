//! MongoDB adapter: one of find/insert/update/delete/aggregate per tick.
//! Target is `database.collection`, subtarget the operation name.

use anyhow::Context as _;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, Credential};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::generator::{Generator, WorkerContext};
use crate::stats::{TraceKind, TraceRecord};

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct MongoOptions {
    #[builder(default = "mongodb://localhost:27017".into(), setter(into))]
    pub connection_string: String,
    #[builder(default = "test".into(), setter(into))]
    pub database: String,
    #[builder(default = "test".into(), setter(into))]
    pub collection: String,
    /// One of find, insert, update, delete, aggregate.
    #[builder(default = "find".into(), setter(into))]
    pub operation: String,
    #[builder(default = "{}".into(), setter(into))]
    pub document: String,
    #[builder(default = "{}".into(), setter(into))]
    pub filter: String,
    #[builder(default = "{}".into(), setter(into))]
    pub update: String,
    #[builder(default, setter(into))]
    pub username: String,
    #[builder(default, setter(into))]
    pub password: String,
    #[builder(default = "admin".into(), setter(into))]
    pub auth_db: String,
}

impl Default for MongoOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

enum Operation {
    Find(Document),
    Insert(Document),
    Update(Document, Document),
    Delete(Document),
    Aggregate(Vec<Document>),
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Find(_) => "find",
            Operation::Insert(_) => "insert",
            Operation::Update(..) => "update",
            Operation::Delete(_) => "delete",
            Operation::Aggregate(_) => "aggregate",
        }
    }
}

pub struct MongoGenerator {
    context: WorkerContext,
    options: MongoOptions,
    client: Option<Client>,
    collection: Option<Collection<Document>>,
    operation: Option<Operation>,
    target: String,
}

impl MongoGenerator {
    pub fn new(context: WorkerContext, options: MongoOptions) -> Self {
        Self {
            context,
            options,
            client: None,
            collection: None,
            operation: None,
            target: String::new(),
        }
    }

    fn parse_operation(&self) -> anyhow::Result<Operation> {
        let filter = parse_document(&self.options.filter).context("invalid filter JSON")?;
        Ok(match self.options.operation.to_lowercase().as_str() {
            "find" => Operation::Find(filter),
            "insert" => {
                Operation::Insert(parse_document(&self.options.document).context("invalid document JSON")?)
            }
            "update" => Operation::Update(
                filter,
                parse_document(&self.options.update).context("invalid update JSON")?,
            ),
            "delete" => Operation::Delete(filter),
            "aggregate" => Operation::Aggregate(
                parse_pipeline(&self.options.filter).context("invalid aggregate pipeline JSON")?,
            ),
            other => anyhow::bail!("unsupported operation: {other}"),
        })
    }

    async fn run_operation(&self, operation: &Operation) -> anyhow::Result<()> {
        let collection = self
            .collection
            .as_ref()
            .context("mongo generator not initialized")?;
        match operation {
            Operation::Find(filter) => {
                let mut cursor = collection.find(filter.clone()).await?;
                while cursor.try_next().await?.is_some() {}
            }
            Operation::Insert(document) => {
                collection.insert_one(document.clone()).await?;
            }
            Operation::Update(filter, update) => {
                collection.update_many(filter.clone(), update.clone()).await?;
            }
            Operation::Delete(filter) => {
                collection.delete_many(filter.clone()).await?;
            }
            Operation::Aggregate(pipeline) => {
                let mut cursor = collection.aggregate(pipeline.clone()).await?;
                while cursor.try_next().await?.is_some() {}
            }
        }
        Ok(())
    }
}

fn parse_document(json: &str) -> anyhow::Result<Document> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let bson: Bson = value.try_into()?;
    match bson {
        Bson::Document(document) => Ok(document),
        other => anyhow::bail!("expected a JSON object, got {other}"),
    }
}

fn parse_pipeline(json: &str) -> anyhow::Result<Vec<Document>> {
    if json.trim() == "{}" {
        return Ok(vec![doc! { "$match": {} }]);
    }
    let value: serde_json::Value = serde_json::from_str(json)?;
    match value {
        serde_json::Value::Array(stages) => stages
            .into_iter()
            .map(|stage| parse_document(&stage.to_string()))
            .collect(),
        object @ serde_json::Value::Object(_) => Ok(vec![parse_document(&object.to_string())?]),
        _ => anyhow::bail!("aggregate pipeline must be an array or object"),
    }
}

#[async_trait]
impl Generator for MongoGenerator {
    async fn init(&mut self) -> anyhow::Result<()> {
        self.operation = Some(self.parse_operation()?);
        self.target = format!("{}.{}", self.options.database, self.options.collection);

        let mut client_options = ClientOptions::parse(&self.options.connection_string)
            .await
            .context("invalid mongodb connection string")?;
        if !self.options.username.is_empty() && !self.options.password.is_empty() {
            client_options.credential = Some(
                Credential::builder()
                    .username(self.options.username.clone())
                    .password(self.options.password.clone())
                    .source(self.options.auth_db.clone())
                    .build(),
            );
        }

        let client = Client::with_options(client_options)?;
        let database = client.database(&self.options.database);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .context("cannot ping mongodb")?;
        self.collection = Some(database.collection(&self.options.collection));
        self.client = Some(client);

        tracing::debug!("connected to {}", self.target);
        Ok(())
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let operation = self
            .operation
            .take()
            .context("mongo generator not initialized")?;

        let mut record =
            TraceRecord::new(TraceKind::Mongo, self.target.clone(), operation.name());
        let start = Instant::now();

        let result = tokio::select! {
            _ = self.context.cancel.cancelled() => {
                self.operation = Some(operation);
                return Ok(());
            }
            result = self.run_operation(&operation) => result,
        };
        self.operation = Some(operation);

        match result {
            Ok(()) => record.duration = start.elapsed(),
            Err(err) => {
                record.error = true;
                tracing::error!("mongodb {} error: {err:#}", self.options.operation);
            }
        }
        self.context.stats.record(record).await;
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_parse_from_json() {
        let document = parse_document(r#"{"status": "active", "age": {"$gt": 21}}"#).unwrap();
        assert_eq!(document.get_str("status").unwrap(), "active");
        assert!(parse_document("[1, 2]").is_err());
    }

    #[test]
    fn default_pipeline_matches_everything() {
        let pipeline = parse_pipeline("{}").unwrap();
        assert_eq!(pipeline, vec![doc! { "$match": {} }]);

        let explicit = parse_pipeline(r#"[{"$match": {"a": 1}}, {"$limit": 5}]"#).unwrap();
        assert_eq!(explicit.len(), 2);
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected() {
        use crate::stats::Stats;
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        let (stats, _handle) = Stats::spawn("t", 1, 1, Duration::ZERO, false);
        let context = WorkerContext {
            id: 1,
            requestrate: 1,
            concurrency: 1,
            cancel: CancellationToken::new(),
            stats,
        };
        let generator =
            MongoGenerator::new(context, MongoOptions::builder().operation("drop").build());
        assert!(generator.parse_operation().is_err());
    }
}
