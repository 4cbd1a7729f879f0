#![deny(missing_docs)]

//! Core library for docstream, an asynchronous document ingestion pipeline.

/// HTTP routing and REST handlers.
pub mod api;
/// Users, password hashing and bearer tokens.
pub mod auth;
/// Token-aware text chunking with deterministic chunk ids.
pub mod chunking;
/// Environment-driven configuration management.
pub mod config;
/// SQLite connection and schema.
pub mod db;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Error classification shared by every component.
pub mod error;
/// Text extraction from uploaded documents.
pub mod extraction;
/// Vector index abstraction with Qdrant and in-memory backends.
pub mod index;
/// Upload acceptance: blob write, job record and publish.
pub mod ingress;
/// Job records and their lifecycle.
pub mod jobs;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline counters.
pub mod metrics;
/// Semantic search.
pub mod query;
/// Durable job queue abstraction with AMQP and in-memory backends.
pub mod queue;
/// Process wiring from configuration.
pub mod runtime;
/// Service facade used by the HTTP layer.
pub mod service;
/// Blob storage abstraction with S3 and in-memory backends.
pub mod storage;
/// Orphaned blob reconciliation.
pub mod sweep;
/// Job workers and their supervisor.
pub mod worker;
