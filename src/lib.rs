//! vct-ingest: scrape-and-ingest pipeline for Valorant esports data
//!
//! Pages from configured sources are fetched under per-source rate limits,
//! parsed by versioned extraction rules into candidate records, reconciled
//! against canonical identities, and committed idempotently to SQLite.

pub mod commands;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod schedule;
pub mod store;

pub use error::{Error, ErrorClass, Result};
