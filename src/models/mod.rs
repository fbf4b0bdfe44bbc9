//! # Models
//!
//! Plain data records shared by the execution store backends, the dispatcher and the
//! completion bridge. Persistence lives behind [`crate::database::ExecutionStore`].

pub mod execution;
pub mod machine;
pub mod profile;
pub mod script;
pub mod upload;

pub use execution::{Execution, NewExecution, StepExecution, TunnelAssignment};
pub use machine::Machine;
pub use profile::{LockGrant, LockState, Profile};
pub use script::{EdgeDefinition, Script, ScriptDefinition, ScriptGraph, ScriptStep, StepDefinition, StepEdge};
pub use upload::{NewUploadAssociation, UploadAssociation};
