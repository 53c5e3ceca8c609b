//! Identifiers, task descriptors, and wire messages for actor tasks.

use serde::{Deserialize, Serialize};

use crate::error::ActorDeathCause;

/// Unique identifier for an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub u64);

/// Unique identifier for a task, derived from its spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

/// Unique identifier for a worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

/// Unique identifier for a cluster node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Unique identifier for an object in the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Tag bit distinguishing actor-handle objects from task return objects.
const ACTOR_HANDLE_TAG: u64 = 1 << 63;

impl ObjectId {
	/// The id of the handle object representing a reference to an actor.
	#[must_use]
	pub fn for_actor_handle(actor_id: ActorId) -> Self {
		Self(actor_id.0 | ACTOR_HANDLE_TAG)
	}
}

/// One delivery attempt of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskAttempt {
	/// The task being attempted.
	pub task_id: TaskId,
	/// Zero-based attempt counter, bumped by the task manager on retry.
	pub attempt_number: u32,
}

/// Network location of a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
	/// The node hosting the worker.
	pub node_id: NodeId,
	/// The worker process.
	pub worker_id: WorkerId,
	/// IP address the worker listens on.
	pub ip_address: String,
	/// Port the worker listens on.
	pub port: u16,
}

/// Lifecycle state of an actor as known to this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorState {
	/// Creation has been requested but the actor is not yet running.
	PendingCreation,
	/// The actor is running and reachable.
	Alive,
	/// The actor died and a restart is in progress or expected.
	Restarting,
	/// The actor is permanently dead.
	Dead,
}

/// Immutable description of one actor method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
	/// Identifier of this invocation.
	pub task_id: TaskId,
	/// The actor the method runs on.
	pub actor_id: ActorId,
	/// Caller-assigned submit-order position for this (caller, actor) pair.
	/// The receiver executes tasks in this order unless told to skip it.
	pub sequence_number: u64,
	/// Zero-based attempt counter, bumped by the task manager on retry.
	pub attempt_number: u32,
	/// Whether this spec describes the actor creation task rather than a
	/// method call.
	pub is_actor_creation: bool,
	/// The worker submitting the invocation.
	pub caller_worker_id: WorkerId,
	/// Serialized invocation payload, opaque to the transport.
	pub body: serde_json::Value,
}

impl TaskSpec {
	/// The attempt key for this spec.
	#[must_use]
	pub fn task_attempt(&self) -> TaskAttempt {
		TaskAttempt {
			task_id: self.task_id,
			attempt_number: self.attempt_number,
		}
	}
}

/// Request to execute one task on an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushTaskRequest {
	/// The invocation to run.
	pub task_spec: TaskSpec,
	/// The worker incarnation the request is addressed to. A receiver that
	/// is not this worker rejects the request.
	pub intended_worker_id: WorkerId,
	/// Copy of the spec's sequence number, used by the receiver to serialize
	/// execution.
	pub sequence_number: u64,
}

/// Reply to a [`PushTaskRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushTaskReply {
	/// The task raised a user exception eligible for retry.
	pub is_retryable_error: bool,
	/// The task completed with an application-level error.
	pub is_application_error: bool,
	/// Serialized execution error, when the task raised one.
	pub task_execution_error: Option<String>,
	/// Objects the executing worker borrowed from the caller.
	pub borrowed_refs: Vec<ObjectId>,
	/// Address of the created actor, set on creation replies.
	pub actor_address: Option<Address>,
}

/// Request that the receiver abandon a previously pushed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTaskRequest {
	/// The task to cancel.
	pub intended_task_id: TaskId,
	/// Kill the executing worker rather than cancelling cooperatively.
	/// Unsupported for actor tasks; always false.
	pub force_kill: bool,
	/// Also cancel tasks the target task spawned.
	pub recursive: bool,
	/// The worker that owns the task.
	pub caller_worker_id: WorkerId,
}

/// Reply to a [`CancelTaskRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTaskReply {
	/// Whether the receiver acted on the cancellation this attempt. The
	/// caller retries until the task is observed finished.
	pub attempt_succeeded: bool,
}

/// Reply from the actor directory to a creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateActorReply {
	/// Objects the creation task borrowed from the caller.
	pub borrowed_refs: Vec<ObjectId>,
	/// Where the created actor is reachable.
	pub actor_address: Option<Address>,
	/// Why creation was abandoned, when the actor died before it ran.
	pub death_cause: Option<ActorDeathCause>,
}
