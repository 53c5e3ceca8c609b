//! Interfaces to the submitter's collaborators.
//!
//! The submitter consumes these and never implements them; the hosting
//! worker wires in the process-level implementations.

use std::sync::Arc;

use async_trait::async_trait;
use keel_actor_proto::{
	ActorId, Address, CancelTaskReply, CancelTaskRequest, CreateActorReply, ErrorInfo, ErrorType,
	NodeId, ObjectId, PushTaskReply, PushTaskRequest, RpcError, TaskId, TaskSpec, WorkerId,
};

/// Resolves a task's object references to concrete values.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
	/// Resolve every dependency of `task_spec`. Completes once all are
	/// available, or fails.
	async fn resolve(&self, task_spec: &TaskSpec) -> Result<(), RpcError>;

	/// Abort an in-progress resolution for the task. No-op when none is
	/// running.
	fn cancel_dependency_resolution(&self, task_id: TaskId);
}

/// Records task lifecycle transitions and owns retry accounting.
///
/// Some of these methods run with the submitter's internal lock held; they
/// must not call back into the submitter.
pub trait TaskManager: Send + Sync {
	/// The task's dependencies finished resolving (successfully or not).
	fn mark_dependencies_resolved(&self, task_id: TaskId);

	/// The task was handed to a worker for execution.
	fn mark_task_waiting_for_execution(&self, task_id: TaskId, node_id: NodeId, worker_id: WorkerId);

	/// The caller asked for the task to be cancelled.
	fn mark_task_canceled(&self, task_id: TaskId);

	/// Whether the task has neither completed nor terminally failed.
	fn is_task_pending(&self, task_id: TaskId) -> bool;

	/// The spec of a task that is still pending, if any.
	fn get_task_spec(&self, task_id: TaskId) -> Option<TaskSpec>;

	/// Record a completed execution. `is_application_error` marks replies
	/// whose payload is a user-level failure.
	fn complete_pending_task(
		&self,
		task_id: TaskId,
		reply: &PushTaskReply,
		addr: &Address,
		is_application_error: bool,
	);

	/// Record a terminal failure.
	fn fail_pending_task(
		&self,
		task_id: TaskId,
		error_type: ErrorType,
		status: Option<&RpcError>,
		error_info: Option<&ErrorInfo>,
	);

	/// Fail the task or schedule a retry, per the task's retry budget.
	/// Returns whether a retry will happen. `mark_task_object_failed`
	/// poisons the task's result objects on failure; `fail_immediately`
	/// skips the remaining retry budget.
	fn fail_or_retry_pending_task(
		&self,
		task_id: TaskId,
		error_type: ErrorType,
		status: Option<&RpcError>,
		error_info: Option<&ErrorInfo>,
		mark_task_object_failed: bool,
		fail_immediately: bool,
	) -> bool;

	/// Fail a streaming generator so its next submission recomputes the
	/// lost output.
	fn mark_generator_failed_and_resubmit(&self, task_id: TaskId);
}

/// Outcome of an actor creation request: the directory's status plus the
/// reply payload, which can carry data (borrowed refs, a death cause) even
/// when the status is an error.
#[derive(Debug, Clone)]
pub struct CreateActorResult {
	/// How the creation request concluded.
	pub status: Result<(), RpcError>,
	/// Payload accompanying the status.
	pub reply: CreateActorReply,
}

/// Global directory that creates, restarts, and reaps actors.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
	/// Schedule the actor's creation task. Transient errors and creation
	/// retries are the directory's responsibility; the caller does not
	/// retry.
	async fn create_actor(&self, task_spec: TaskSpec) -> CreateActorResult;

	/// Restart a dead actor so it can recompute lost objects.
	async fn restart_for_lineage(
		&self,
		actor_id: ActorId,
		num_restarts_due_to_lineage: u64,
	) -> Result<(), RpcError>;

	/// Report that the owner no longer references the actor, so the
	/// directory can tear it down.
	async fn report_out_of_scope(
		&self,
		actor_id: ActorId,
		num_restarts_due_to_lineage: u64,
	) -> Result<(), RpcError>;
}

/// One connection to a remote worker hosting an actor.
#[async_trait]
pub trait RpcClient: Send + Sync {
	/// The address this client is connected to.
	fn addr(&self) -> Address;

	/// Deliver one task and await its reply. `skip_queue` tells the
	/// receiver to execute without waiting for earlier sequence numbers.
	async fn push_actor_task(
		&self,
		request: PushTaskRequest,
		skip_queue: bool,
	) -> Result<PushTaskReply, RpcError>;

	/// Ask the receiver to abandon a previously pushed task.
	async fn cancel_task(&self, request: CancelTaskRequest) -> Result<CancelTaskReply, RpcError>;
}

/// Shared pool of RPC clients keyed by worker address.
pub trait RpcClientPool: Send + Sync {
	/// The client for `address`, connecting if needed.
	fn get_or_connect(&self, address: &Address) -> Arc<dyn RpcClient>;

	/// Drop the pooled client for a worker.
	fn disconnect(&self, worker_id: WorkerId);
}

/// One-shot callback fired when an object leaves scope or is freed.
pub type OutOfScopeCallback = Box<dyn FnOnce(ObjectId) + Send>;

/// Tracks object reference lifetimes for the owning worker.
pub trait ReferenceCounter: Send + Sync {
	/// Register a one-shot callback for when `object_id` goes out of scope
	/// or is freed. Returns false when the object is already out of scope;
	/// the callback is then dropped uninvoked and the caller acts directly.
	fn add_out_of_scope_or_freed_callback(
		&self,
		object_id: ObjectId,
		callback: OutOfScopeCallback,
	) -> bool;
}
