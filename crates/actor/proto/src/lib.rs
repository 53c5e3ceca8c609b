//! Shared data model for the keel actor task transport.
//!
//! This crate defines the identifiers, task descriptors, wire messages, and
//! failure taxonomy exchanged between the task submitter and its
//! collaborators (dependency resolver, task manager, actor directory, and
//! the RPC layer).

#![warn(missing_docs)]

pub mod error;
pub mod types;

pub use error::{ActorDeathCause, ErrorInfo, ErrorType, NodeDeathReason, RpcError};
pub use types::{
	ActorId, ActorState, Address, CancelTaskReply, CancelTaskRequest, CreateActorReply, NodeId,
	ObjectId, PushTaskReply, PushTaskRequest, TaskAttempt, TaskId, TaskSpec, WorkerId,
};
