//! CLI interface for Ragtime
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for running experiments and
//! managing their inputs and results.

use crate::pipeline::steps::Step;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Ragtime experiment pipeline
///
/// Generates answers to a validation set with one or more LLMs, grades them
/// against reference facts and stores the results as experiments.
#[derive(Parser, Debug)]
#[command(name = "ragtime")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an experiment from a JSON configuration file
    Run {
        /// Experiment configuration (same shape as the start-experiment request)
        config_file: PathBuf,
    },

    /// Run the answers/facts/evals file pipeline
    Pipeline {
        /// Pipeline description in TOML
        pipeline_file: PathBuf,

        /// First step to run
        #[arg(long, value_enum)]
        start_from: Option<Step>,

        /// Last step to run
        #[arg(long, value_enum)]
        stop_after: Option<Step>,
    },

    /// Manage stored experiments
    Experiments {
        #[command(subcommand)]
        action: ExperimentAction,
    },

    /// Manage validation sets
    ValidationSets {
        #[command(subcommand)]
        action: ValidationSetAction,
    },

    /// Show statistics of an experiment or validation-set file
    Stats {
        /// JSON document with an `items` array
        file: PathBuf,
    },

    /// Manage stored API keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// List available models and retrievers
    Models,
}

/// Experiment management actions
#[derive(Subcommand, Debug)]
pub enum ExperimentAction {
    /// List stored experiments
    List,

    /// Show one experiment
    Show {
        /// Experiment name
        name: String,
    },

    /// Delete one experiment
    Delete {
        /// Experiment name
        name: String,
    },
}

/// Validation-set management actions
#[derive(Subcommand, Debug)]
pub enum ValidationSetAction {
    /// List validation sets
    List,

    /// Show one validation set
    Show {
        /// Validation set name
        name: String,
    },

    /// Delete one validation set
    Delete {
        /// Validation set name
        name: String,
    },
}

/// API key management actions
#[derive(Subcommand, Debug)]
pub enum KeyAction {
    /// List stored keys (masked)
    List,

    /// Store or overwrite a key
    Set {
        /// Key name (e.g., "OPENAI_API_KEY")
        name: String,
        /// Key value
        value: String,
    },

    /// Delete a stored key
    Delete {
        /// Key name
        name: String,
    },

    /// Show which providers have a key
    Status,
}
