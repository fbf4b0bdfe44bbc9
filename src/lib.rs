#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Script Orchestrator
//!
//! Queue-driven orchestrator that runs graph-shaped automation scripts on a pool of
//! worker machines.
//!
//! ## Overview
//!
//! A script is a user-authored graph of steps. Submitting it validates and sorts the
//! graph, creates an execution with one row per step, and enqueues the first step.
//! Workers consume dispatch messages, pick the least-loaded machine, take an
//! exclusive lock on the shared browser profile, and hand the step to a remote
//! automation backend. The backend reports back through a completion signal, which
//! enqueues the next step or finishes the execution.
//!
//! ## Module Organization
//!
//! - [`models`] - Scripts, executions, machines, profiles and uploads
//! - [`database`] - Execution state store (PostgreSQL and in-memory)
//! - [`state_machine`] - Execution and step lifecycles
//! - [`messaging`] - Queue abstraction, pgmq and in-memory queues, wire messages
//! - [`backend`] - Remote automation backend client
//! - [`orchestration`] - Sorting, selection, locking, dispatch and completion
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use script_orchestrator::config::ConfigManager;
//! use script_orchestrator::logging::init_structured_logging;
//! use script_orchestrator::orchestration::OrchestratorSystem;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! init_structured_logging();
//! let manager = ConfigManager::load()?;
//! let system = OrchestratorSystem::bootstrap(manager).await?;
//!
//! let result = system
//!     .core()
//!     .submit(uuid::Uuid::new_v4(), uuid::Uuid::new_v4())
//!     .await?;
//! println!("execution {} is {}", result.execution_id, result.status);
//!
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod state_machine;

pub use config::{ConfigManager, OrchestratorConfig};
pub use database::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore};
pub use error::{OrchestratorError, Result};
pub use messaging::{InMemoryMessageQueue, MessageQueue, PgmqMessageQueue};
pub use orchestration::{OrchestrationCore, OrchestratorSystem, SubmissionResult};
pub use state_machine::{ExecutionState, StepExecutionState};
