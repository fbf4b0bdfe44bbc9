//! # Orchestration Engine
//!
//! Turns a submitted script into an ordered run of remotely executed steps.
//!
//! ## Control flow
//!
//! ```text
//! submit ─▶ sort graph ─▶ create execution + step rows ─▶ enqueue step 0
//!                                                            │
//!            ┌───────────────────────────────────────────────┘
//!            ▼
//!   DispatchWorker ─▶ StepDispatcher ─▶ select machine, lock profile ─▶ backend
//!                                                                         │
//!   CompletionListener ◀── completion signal ◀──────────────────────────┘
//!            │
//!            ▼
//!   CompletionBridge ─▶ enqueue step N+1 │ complete execution │ retry │ fail
//! ```
//!
//! ## Components
//!
//! - [`graph`]: validation and topological sort
//! - [`machine_selector`]: least-loaded machine from telemetry
//! - [`lock_manager`]: time-boxed profile lock
//! - [`submission`]: submit entry point
//! - [`step_dispatcher`] and [`dispatch_worker`]: queue consumption
//! - [`completion_bridge`] and [`completion_listener`]: result handling
//! - [`supervisor`]: resubscribe-with-backoff for queue consumers
//! - [`upload_registry`]: per-step uploaded files
//! - [`bootstrap`]: wiring and lifecycle

pub mod bootstrap;
pub mod completion_bridge;
pub mod completion_listener;
pub mod dispatch_worker;
pub mod error_classifier;
pub mod graph;
pub mod lock_manager;
pub mod machine_selector;
pub mod step_dispatcher;
pub mod submission;
pub mod supervisor;
pub mod upload_registry;

pub use bootstrap::{OrchestrationCore, OrchestratorSystem};
pub use completion_bridge::{CompletionBridge, CompletionOutcome};
pub use completion_listener::CompletionListener;
pub use dispatch_worker::{DispatchWorker, MessageDisposition};
pub use error_classifier::{classify, classify_reason, ErrorCategory};
pub use graph::{DependencyGraph, GraphError};
pub use lock_manager::ResourceLockManager;
pub use machine_selector::{eligible_candidates, MachineSelector};
pub use step_dispatcher::{ConsumeOutcome, StepDispatcher};
pub use submission::{ScriptSubmitter, SubmissionResult};
pub use supervisor::{spawn_supervised, QueueConsumer};
pub use upload_registry::UploadRegistry;
