//! Best-effort asynchronous task cancellation.

use std::sync::Arc;
use std::time::Duration;

use keel_actor_proto::{ActorState, CancelTaskRequest, ErrorInfo, ErrorType, TaskSpec};

use crate::submitter::ActorTaskSubmitter;

impl ActorTaskSubmitter {
	/// Cancel one actor task.
	///
	/// A task still queued is failed immediately and dropped from the queue
	/// at pop time. A task already sent needs the receiver's cooperation:
	/// cancel RPCs are retried until the task is observed finished, since
	/// delivery ordering against the original push is not guaranteed.
	/// Force-killing the actor is not supported for actor tasks.
	pub fn cancel_task(self: &Arc<Self>, task_spec: TaskSpec, recursive: bool) {
		let force_kill = false;
		let task_id = task_spec.task_id;
		let actor_id = task_spec.actor_id;
		let send_pos = task_spec.sequence_number;
		tracing::info!(?task_id, ?actor_id, recursive, "cancelling actor task");

		// A task is unresolved, queued, sent, or finished.

		// The task manager cannot be called under the lock.
		self.task_manager.mark_task_canceled(task_id);
		if !self.task_manager.is_task_pending(task_id) {
			tracing::debug!(?task_id, "task is already finished or cancelled");
			return;
		}

		let task_queued = {
			let mut state = self.lock_state();
			// Cancellation dominates any pending generator resubmission.
			state.generators_to_resubmit.remove(&task_id);

			let queue = state
				.client_queues
				.get_mut(&actor_id)
				.expect("actor queue must be registered before cancellation");
			if queue.state == ActorState::Dead {
				// The death path already failed everything outstanding.
				tracing::debug!(?task_id, "actor is already dead; ignoring the cancel request");
				return;
			}
			let task_queued = queue.submit_queue.contains(send_pos);
			if task_queued {
				if !queue.submit_queue.dependencies_resolved(send_pos) {
					tracing::debug!(?task_id, "cancelling in-progress dependency resolution");
					self.resolver.cancel_dependency_resolution(task_id);
				}
				if queue.submit_queue.mark_task_canceled(send_pos) {
					queue.cur_pending_calls -= 1;
				}
			}
			task_queued
		};

		if task_queued {
			// Never sent; fail it now. The queue drops the entry at pop time.
			let error_info = ErrorInfo::new(
				ErrorType::TaskCancelled,
				format!("task {task_id:?} was cancelled on actor {actor_id:?} before it executed"),
			);
			self.task_manager.fail_or_retry_pending_task(
				task_id,
				ErrorType::TaskCancelled,
				None,
				Some(&error_info),
				true,
				false,
			);
			return;
		}

		// The task was sent and has not finished.
		let client = {
			let state = self.lock_state();
			let queue = state
				.client_queues
				.get(&actor_id)
				.expect("actor queue must be registered before cancellation");
			match &queue.rpc_client {
				Some(client) => Arc::clone(client),
				None => {
					// The actor is not up yet; try again shortly.
					self.retry_cancel_task(task_spec, recursive, self.config.cancel_retry_no_client);
					return;
				}
			}
		};

		tracing::debug!(?task_id, "task was sent; issuing a cancel rpc");
		let request = CancelTaskRequest {
			intended_task_id: task_id,
			force_kill,
			recursive,
			caller_worker_id: task_spec.caller_worker_id,
		};
		let this = Arc::clone(self);
		tokio::spawn(async move {
			let result = client.cancel_task(request).await;
			let attempt_succeeded = match result {
				Ok(reply) => {
					tracing::debug!(
						?task_id,
						attempt_succeeded = reply.attempt_succeeded,
						"cancel rpc response received"
					);
					reply.attempt_succeeded
				}
				Err(err) => {
					tracing::debug!(?task_id, %err, "cancel rpc failed");
					false
				}
			};

			// Keep retrying until the task is officially finished.
			if this.task_manager.get_task_spec(task_id).is_none() {
				tracing::debug!(?task_id, "task is finished; stopping cancel retries");
				return;
			}
			if !attempt_succeeded {
				this.retry_cancel_task(task_spec, recursive, this.config.cancel_retry_inflight);
			}
		});
	}

	/// Schedule another cancel attempt after `delay`.
	fn retry_cancel_task(self: &Arc<Self>, task_spec: TaskSpec, recursive: bool, delay: Duration) {
		tracing::debug!(task_id = ?task_spec.task_id, ?delay, "task cancellation will be retried");
		let this = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			this.cancel_task(task_spec, recursive);
		});
	}

	/// Mark a streaming generator task so its next valid reply is converted
	/// into a failure and resubmission, recomputing lost output. Always
	/// succeeds; a cancel issued afterwards clears the mark.
	pub fn queue_generator_for_resubmit(&self, task_spec: &TaskSpec) -> bool {
		let mut state = self.lock_state();
		state.generators_to_resubmit.insert(task_spec.task_id);
		true
	}
}
