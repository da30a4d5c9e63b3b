use std::sync::Arc;

use clap::Args;

use crate::generator::{Generator, GeneratorFactory};
use crate::protocols::mongo::{MongoGenerator, MongoOptions};

/// MongoDB load generator
#[derive(Args, Debug, Clone)]
#[command(after_help = "Examples:
  surge mongo --database mydb --collection users --operation find \\
      --filter '{\"status\":\"active\"}' mongodb://localhost:27017
  surge mongo --database mydb --collection users --operation insert \\
      --document '{\"name\":\"John\",\"age\":30}' mongodb://localhost:27017")]
pub struct MongoArgs {
    /// Connection string
    #[arg(default_value = "mongodb://localhost:27017")]
    pub connection_string: String,

    /// Database name
    #[arg(long, default_value = "test")]
    pub database: String,

    /// Collection name
    #[arg(long, default_value = "test")]
    pub collection: String,

    /// Operation: find, insert, update, delete, aggregate
    #[arg(long, default_value = "find")]
    pub operation: String,

    /// Document for insert operations (JSON)
    #[arg(long, default_value = "{}")]
    pub document: String,

    /// Filter for find/update/delete, or the aggregate pipeline (JSON)
    #[arg(long, default_value = "{}")]
    pub filter: String,

    /// Update document for update operations (JSON)
    #[arg(long, default_value = "{}")]
    pub update: String,

    #[arg(long, default_value = "")]
    pub username: String,

    #[arg(long, default_value = "")]
    pub password: String,

    /// Authentication database
    #[arg(long, default_value = "admin")]
    pub auth_db: String,
}

impl MongoArgs {
    pub(crate) fn factory(&self) -> anyhow::Result<GeneratorFactory> {
        let options = MongoOptions::builder()
            .connection_string(self.connection_string.clone())
            .database(self.database.clone())
            .collection(self.collection.clone())
            .operation(self.operation.clone())
            .document(self.document.clone())
            .filter(self.filter.clone())
            .update(self.update.clone())
            .username(self.username.clone())
            .password(self.password.clone())
            .auth_db(self.auth_db.clone())
            .build();
        Ok(Arc::new(move |context| {
            Box::new(MongoGenerator::new(context, options.clone())) as Box<dyn Generator>
        }))
    }
}
