//! Experience engine subsystem: state models, bootstrap, command discovery,
//! intent resolution, execution and the merge/apply protocol.
//!
//! Most callers only need [`ExperienceEngine`]; the component modules are
//! public so they can be driven and tested on their own.

pub mod admin;
pub mod bootstrap;
pub mod dispatch;
pub mod errors;
pub mod execution;
pub mod intent;
pub mod interpreter;
pub mod merge;
pub mod registry;
pub mod storage;
pub mod template;
pub mod types;

pub use dispatch::{EngineOptions, ExperienceEngine};
pub use errors::EngineError;
pub use interpreter::{DisabledInterpreter, Interpreter, InterpreterError, InterpreterRequest};
pub use merge::{ApplyReport, DroppedMutation, MergeEngine};
pub use storage::{AuditEntry, StateStore, StateStoreBuilder};
pub use types::{MessageResponse, MutationKind, MutationTarget, StateModel, StateMutation};
