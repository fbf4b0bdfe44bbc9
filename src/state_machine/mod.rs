// State machine module for script executions
//
// Executions and step executions follow small, fixed lifecycles. Transitions are
// computed here as pure functions; persistence lives in the execution store, which
// applies the computed target state with a conditional update.

pub mod errors;
pub mod events;
pub mod execution_state_machine;
pub mod states;
pub mod step_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::{ExecutionEvent, StepEvent};
pub use execution_state_machine::ExecutionStateMachine;
pub use states::{ExecutionState, StepExecutionState};
pub use step_state_machine::StepStateMachine;
