//! Transport status and the task failure taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ActorId;

/// Failure of a transport-level or directory call.
///
/// `Result<Reply, RpcError>` is the status attached to every reply path; an
/// `Ok` reply can still carry an application-level failure inside it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RpcError {
	/// The call failed at the network or process level. No information about
	/// whether the receiver ran the request.
	#[error("io error: {0}")]
	Io(String),
	/// The scheduler abandoned the request before it executed.
	#[error("scheduling cancelled: {0}")]
	SchedulingCancelled(String),
	/// The actor creation task itself failed in user code.
	#[error("creation task error: {0}")]
	CreationTask(String),
}

/// Category of a task failure surfaced to the task manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
	/// The resolver could not materialize the task's dependencies.
	DependencyResolutionFailed,
	/// The caller cancelled the task, or the scheduler abandoned it.
	TaskCancelled,
	/// The directory rejected or abandoned the actor creation task.
	ActorCreationFailed,
	/// The actor could not be reached; it may come back.
	ActorUnavailable,
	/// The actor is known dead.
	ActorDied,
	/// The task raised a retryable user exception.
	TaskExecutionException,
}

/// Why a node went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeDeathReason {
	/// The node stopped reporting without an announced cause.
	Unexpected,
	/// The autoscaler drained the node because it was idle.
	AutoscalerDrainIdle,
	/// The autoscaler preempted the node.
	AutoscalerDrainPreempted,
}

/// Authoritative reason an actor died, as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorDeathCause {
	/// The actor process exited.
	ActorExit {
		/// Human-readable exit description.
		error_message: String,
	},
	/// The actor's creation task failed in user code.
	CreationTaskFailed {
		/// Serialized creation failure.
		error_message: String,
	},
	/// The actor was killed to reclaim memory.
	OutOfMemory {
		/// Human-readable kill description.
		error_message: String,
		/// Fail dependent tasks without consuming a retry.
		fail_immediately: bool,
	},
	/// The node hosting the actor died.
	NodeDied {
		/// Why the node went away.
		reason: NodeDeathReason,
		/// Human-readable node-death description.
		reason_message: String,
	},
	/// The owner dropped the last handle to the actor.
	OutOfScope,
}

impl ActorDeathCause {
	/// Whether tasks hitting this cause must fail without further retries.
	#[must_use]
	pub fn fail_immediately(&self) -> bool {
		matches!(
			self,
			Self::OutOfMemory {
				fail_immediately: true,
				..
			}
		)
	}

	/// Short label for logs.
	#[must_use]
	pub fn describe(&self) -> &'static str {
		match self {
			Self::ActorExit { .. } => "actor exit",
			Self::CreationTaskFailed { .. } => "creation task failed",
			Self::OutOfMemory { .. } => "out of memory",
			Self::NodeDied { .. } => "node died",
			Self::OutOfScope => "out of scope",
		}
	}

	fn message(&self) -> String {
		match self {
			Self::ActorExit { error_message }
			| Self::CreationTaskFailed { error_message }
			| Self::OutOfMemory { error_message, .. } => error_message.clone(),
			Self::NodeDied { reason_message, .. } => reason_message.clone(),
			Self::OutOfScope => "the actor handle went out of scope".to_string(),
		}
	}
}

/// Structured failure details attached to a task outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
	/// Failure category.
	pub error_type: ErrorType,
	/// Human-readable failure description.
	pub error_message: String,
	/// Death details, when the failure is an actor death.
	pub actor_died: Option<ActorDeathCause>,
	/// The unreachable actor, for [`ErrorType::ActorUnavailable`] failures.
	pub unavailable_actor: Option<ActorId>,
}

impl ErrorInfo {
	/// An error info with no structured context.
	#[must_use]
	pub fn new(error_type: ErrorType, error_message: impl Into<String>) -> Self {
		Self {
			error_type,
			error_message: error_message.into(),
			actor_died: None,
			unavailable_actor: None,
		}
	}

	/// Derive the failure surfaced for a death with the given cause. An
	/// unknown cause still reports the actor dead.
	#[must_use]
	pub fn from_death_cause(cause: Option<&ActorDeathCause>) -> Self {
		match cause {
			Some(cause) => Self {
				error_type: ErrorType::ActorDied,
				error_message: format!("The actor died: {}", cause.message()),
				actor_died: Some(cause.clone()),
				unavailable_actor: None,
			},
			None => Self::new(ErrorType::ActorDied, "The actor died with unknown cause."),
		}
	}

	/// Whether the failure demands the task fail without further retries.
	#[must_use]
	pub fn fail_immediately(&self) -> bool {
		self.actor_died
			.as_ref()
			.is_some_and(ActorDeathCause::fail_immediately)
	}
}
