//! Task and actor-creation submission, lineage restarts, and the
//! out-of-scope path.

use std::sync::Arc;

use keel_actor_proto::{
	ActorId, ActorState, ErrorInfo, ErrorType, ObjectId, PushTaskReply, RpcError, TaskId, TaskSpec,
};

use crate::external::CreateActorResult;
use crate::submitter::ActorTaskSubmitter;
use crate::submitter::queue::ClientQueue;

impl ActorTaskSubmitter {
	/// Queue one actor task for dispatch.
	///
	/// The task takes its place in the actor's submit queue immediately,
	/// before dependency resolution, so the send order is fixed even when
	/// resolution completes out of order. Submitting to a dead restartable
	/// actor owned by this worker triggers lineage reconstruction;
	/// submitting to a terminally dead actor fails the task with the
	/// recorded death cause.
	pub fn submit_task(self: &Arc<Self>, task_spec: TaskSpec) {
		let task_id = task_spec.task_id;
		let actor_id = task_spec.actor_id;
		debug_assert!(!task_spec.is_actor_creation);
		tracing::debug!(?task_id, ?actor_id, "submitting task");

		let send_pos = task_spec.sequence_number;
		let task_queued = {
			let mut state = self.lock_state();
			let queue = state
				.client_queues
				.get_mut(&actor_id)
				.expect("actor queue must be registered before tasks are submitted");
			if queue.state == ActorState::Dead && queue.is_restartable && queue.owned {
				self.restart_actor_for_lineage_reconstruction(queue);
			}
			if queue.state == ActorState::Dead {
				false
			} else {
				queue.submit_queue.emplace(send_pos, task_spec.clone());
				queue.cur_pending_calls += 1;
				true
			}
		};

		if task_queued {
			let this = Arc::clone(self);
			tokio::spawn(async move {
				// Resolution runs off the lock; the resolver may complete in
				// the same call stack.
				let resolved = this.resolver.resolve(&task_spec).await;
				this.on_task_dependencies_resolved(actor_id, task_id, send_pos, resolved);
			});
		} else {
			self.fail_task_of_dead_actor(actor_id, task_id);
		}
	}

	fn on_task_dependencies_resolved(
		self: &Arc<Self>,
		actor_id: ActorId,
		task_id: TaskId,
		send_pos: u64,
		resolved: Result<(), RpcError>,
	) {
		self.task_manager.mark_dependencies_resolved(task_id);
		let mut resolution_error = None;
		{
			let mut state = self.lock_state();
			let queue = state
				.client_queues
				.get_mut(&actor_id)
				.expect("actor queue outlives its tasks");
			// Only dispatch if the task is still queued; the actor may have
			// failed and dequeued it since.
			if queue.submit_queue.contains(send_pos) {
				match resolved {
					Ok(()) => {
						queue.submit_queue.mark_dependency_resolved(send_pos);
						self.send_pending_tasks(queue);
					}
					Err(err) => {
						// A cancelled entry already failed through its own
						// path and is left alone.
						if queue.submit_queue.mark_dependency_failed(send_pos) {
							tracing::warn!(?task_id, %err, "task dependency resolution failed");
							queue.cur_pending_calls -= 1;
							resolution_error = Some(err);
						}
					}
				}
			}
		}
		if let Some(err) = resolution_error {
			self.task_manager.fail_or_retry_pending_task(
				task_id,
				ErrorType::DependencyResolutionFailed,
				Some(&err),
				None,
				true,
				false,
			);
		}
	}

	/// Fail a task submitted to a terminally dead actor. The task never
	/// entered the queue, so there is no pending-call accounting to undo.
	fn fail_task_of_dead_actor(&self, actor_id: ActorId, task_id: TaskId) {
		self.task_manager.mark_task_canceled(task_id);
		let error_info = {
			let state = self.lock_state();
			let queue = state
				.client_queues
				.get(&actor_id)
				.expect("actor queue outlives its tasks");
			ErrorInfo::from_death_cause(queue.death_cause.as_ref())
		};
		let status = RpcError::Io("cancelling task of dead actor".to_string());
		let fail_immediately = error_info.fail_immediately();
		self.task_manager.fail_or_retry_pending_task(
			task_id,
			error_info.error_type,
			Some(&status),
			Some(&error_info),
			true,
			fail_immediately,
		);
	}

	/// Resolve the creation task's dependencies and ask the directory to
	/// create the actor. Creation retries live in the directory; a failed
	/// creation task completes here as an application error.
	pub fn submit_actor_creation_task(self: &Arc<Self>, task_spec: TaskSpec) {
		debug_assert!(task_spec.is_actor_creation);
		let actor_id = task_spec.actor_id;
		let task_id = task_spec.task_id;
		tracing::debug!(?actor_id, ?task_id, "submitting actor creation task");

		let this = Arc::clone(self);
		tokio::spawn(async move {
			let resolved = this.resolver.resolve(&task_spec).await;
			this.task_manager.mark_dependencies_resolved(task_id);
			if let Err(err) = resolved {
				tracing::warn!(?actor_id, ?task_id, %err, "resolving actor creation task dependencies failed");
				this.task_manager.fail_or_retry_pending_task(
					task_id,
					ErrorType::DependencyResolutionFailed,
					Some(&err),
					None,
					true,
					false,
				);
				return;
			}
			tracing::debug!(?actor_id, ?task_id, "creating actor via the directory");
			let result = this.directory.create_actor(task_spec).await;
			this.on_create_actor_reply(actor_id, task_id, result);
		});
	}

	fn on_create_actor_reply(&self, actor_id: ActorId, task_id: TaskId, result: CreateActorResult) {
		let CreateActorResult { status, reply } = result;
		match status {
			Ok(()) | Err(RpcError::CreationTask(_)) => {
				let mut push_reply = PushTaskReply {
					borrowed_refs: reply.borrowed_refs,
					actor_address: reply.actor_address,
					..PushTaskReply::default()
				};
				if let Err(RpcError::CreationTask(message)) = &status {
					tracing::info!(
						?actor_id,
						?task_id,
						"actor creation failed; the creation task will not be retried"
					);
					push_reply.task_execution_error = Some(message.clone());
					push_reply.is_application_error = true;
				} else {
					tracing::debug!(?actor_id, ?task_id, "created actor");
				}
				let addr = push_reply.actor_address.clone().unwrap_or_default();
				let is_application_error = push_reply.is_application_error;
				self.task_manager
					.complete_pending_task(task_id, &push_reply, &addr, is_application_error);
			}
			Err(err) => {
				let mut error_info = None;
				if matches!(err, RpcError::SchedulingCancelled(_)) {
					tracing::debug!(?actor_id, ?task_id, "actor creation cancelled");
					self.task_manager.mark_task_canceled(task_id);
					error_info = reply
						.death_cause
						.as_ref()
						.map(|cause| ErrorInfo::from_death_cause(Some(cause)));
				} else {
					tracing::info!(?actor_id, ?task_id, %err, "failed to create actor");
				}
				self.task_manager.fail_pending_task(
					task_id,
					ErrorType::ActorCreationFailed,
					Some(&err),
					error_info.as_ref(),
				);
			}
		}
	}

	/// Bring a dead restartable actor back to recompute lost objects.
	/// Caller holds the state lock.
	pub(super) fn restart_actor_for_lineage_reconstruction(
		self: &Arc<Self>,
		queue: &mut ClientQueue,
	) {
		let actor_id = queue.actor_id;
		tracing::info!(?actor_id, "reconstructing actor");
		debug_assert!(queue.owned, "only the owner can restart a dead actor");
		debug_assert!(queue.is_restartable, "actor is no longer restartable");
		queue.state = ActorState::Restarting;
		queue.num_restarts_due_to_lineage += 1;
		let lineage_generation = queue.num_restarts_due_to_lineage;

		let this = Arc::clone(self);
		tokio::spawn(async move {
			match this
				.directory
				.restart_for_lineage(actor_id, lineage_generation)
				.await
			{
				// The rebuilt incarnation needs its own out-of-scope report.
				Ok(()) => this.notify_directory_when_out_of_scope(actor_id, lineage_generation),
				Err(err) => tracing::error!(?actor_id, %err, "failed to reconstruct actor"),
			}
		});
	}

	/// Arrange for the directory to learn when the owner drops its last
	/// handle to the actor.
	pub(super) fn notify_directory_when_out_of_scope(
		self: &Arc<Self>,
		actor_id: ActorId,
		lineage_generation: u64,
	) {
		let handle_object = ObjectId::for_actor_handle(actor_id);
		let weak = Arc::downgrade(self);
		let registered = self.reference_counter.add_out_of_scope_or_freed_callback(
			handle_object,
			Box::new(move |_object_id| {
				if let Some(this) = weak.upgrade() {
					this.on_actor_out_of_scope(actor_id, lineage_generation);
				}
			}),
		);
		if !registered {
			tracing::debug!(?actor_id, "actor handle already out of scope");
			self.on_actor_out_of_scope(actor_id, lineage_generation);
		}
	}

	/// The owner dropped its handle: hold dispatch until the directory
	/// confirms the death (or a lineage restart revives the actor), and
	/// report the actor out of scope.
	fn on_actor_out_of_scope(self: &Arc<Self>, actor_id: ActorId, lineage_generation: u64) {
		{
			let mut state = self.lock_state();
			if let Some(queue) = state.client_queues.get_mut(&actor_id)
				&& queue.state != ActorState::Dead
			{
				queue.pending_out_of_scope_death = true;
			}
		}
		let this = Arc::clone(self);
		tokio::spawn(async move {
			if let Err(err) = this
				.directory
				.report_out_of_scope(actor_id, lineage_generation)
				.await
			{
				tracing::error!(
					?actor_id,
					%err,
					"failed to report actor out of scope; the actor will not be killed"
				);
			}
		});
	}
}
