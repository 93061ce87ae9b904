//! Profiling artifact ingestion, tiered stack storage and flame graph
//! queries.

pub mod clock;
pub mod config;
pub mod engine;
pub mod export;
pub mod ingest;
pub mod migrate;
pub mod query;
pub mod stack;
pub mod store;
pub mod writer;
