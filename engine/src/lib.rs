//! Ragtime Engine Library
//!
//! This library provides the experiment pipeline behind the Ragtime binary
//! and HTTP server: generation and evaluation stages, LLM and retriever
//! capabilities, file stores and statistics. It is used by both binaries and
//! the integration tests.

/// Configuration management module
pub mod config;

/// Credential store module
pub mod secrets;

/// Database persistence module
pub mod db;

/// LLM provider abstraction layer
pub mod llm;

/// Retriever abstraction layer
pub mod retriever;

/// Prompt builders and reply parsers
pub mod prompter;

/// Stage executors
pub mod generators;

/// Experiment orchestration and the file pipeline
pub mod pipeline;

/// Experiment and validation-set storage
pub mod store;

/// Item statistics
pub mod stats;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
