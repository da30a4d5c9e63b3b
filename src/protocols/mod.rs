//! Protocol adapters. Each implements the [`crate::Generator`] lifecycle
//! over one concrete client stack and emits one trace record per tick.

pub mod clickhouse;
pub mod cql;
pub mod grpc;
pub mod http;
pub mod kafka;
pub mod mongo;
pub mod mysql;
pub mod psql;
pub mod redis;
pub mod smtp;
