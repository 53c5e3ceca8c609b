//! Dispatching ready tasks and classifying their replies.

use std::sync::Arc;

use keel_actor_proto::{
	ActorDeathCause, ActorId, ActorState, Address, ErrorInfo, ErrorType, NodeDeathReason,
	PushTaskReply, PushTaskRequest, RpcError, TaskAttempt, TaskSpec,
};
use tokio::time::Instant;

use crate::submitter::ActorTaskSubmitter;
use crate::submitter::queue::{ClientQueue, InflightReply, PendingDeathWait};

impl ActorTaskSubmitter {
	/// Pop and send every dispatchable task for the queue. Caller holds the
	/// state lock.
	///
	/// Nothing is sent while an out-of-scope death is pending: the tasks
	/// stay queued until either a lineage restart reconnects the actor or a
	/// terminal death fails them. Without a client, tasks normally also
	/// wait, except that a fail-fast actor stuck restarting fails them with
	/// a synthetic network error right away.
	pub(super) fn send_pending_tasks(self: &Arc<Self>, queue: &mut ClientQueue) {
		if queue.pending_out_of_scope_death {
			return;
		}
		if queue.rpc_client.is_none() {
			if queue.state == ActorState::Restarting && queue.fail_if_actor_unreachable {
				while let Some((task_spec, _skip_queue)) = queue.submit_queue.pop_next_to_send() {
					let this = Arc::clone(self);
					// The reply runs without the lock held.
					tokio::spawn(async move {
						this.handle_push_task_reply(
							Err(RpcError::Io("The actor is restarting.".to_string())),
							Address::default(),
							task_spec,
						);
					});
				}
			}
			return;
		}

		while let Some((task_spec, skip_queue)) = queue.submit_queue.pop_next_to_send() {
			self.push_actor_task(queue, task_spec, skip_queue);
		}
	}

	/// Hand one task to the actor's client and register its reply slot.
	/// Caller holds the state lock.
	fn push_actor_task(
		self: &Arc<Self>,
		queue: &mut ClientQueue,
		task_spec: TaskSpec,
		skip_queue: bool,
	) {
		let task_id = task_spec.task_id;
		let actor_id = task_spec.actor_id;
		let worker_id = queue
			.worker_id
			.expect("connected queue must have a worker id");
		let client = Arc::clone(
			queue
				.rpc_client
				.as_ref()
				.expect("connected queue must have a client"),
		);

		let request = PushTaskRequest {
			task_spec: task_spec.clone(),
			intended_worker_id: worker_id,
			sequence_number: task_spec.sequence_number,
		};

		let num_inflight = queue.inflight_replies.len();
		tracing::debug!(
			?task_id,
			?actor_id,
			sequence_number = task_spec.sequence_number,
			num_inflight,
			"pushing task to actor"
		);
		if num_inflight >= queue.next_queueing_warn_threshold {
			tracing::warn!(
				?actor_id,
				num_inflight,
				"inflight task backlog keeps growing; the actor may be overloaded or stalled"
			);
			queue.next_queueing_warn_threshold *= 2;
		}

		let addr = client.addr();
		let task_attempt = task_spec.task_attempt();
		queue.inflight_replies.insert(
			task_attempt,
			InflightReply {
				task_spec,
				addr: addr.clone(),
			},
		);

		self.task_manager
			.mark_task_waiting_for_execution(task_id, addr.node_id, addr.worker_id);

		let this = Arc::clone(self);
		tokio::spawn(async move {
			let result = client.push_actor_task(request, skip_queue).await;
			this.on_push_task_response(actor_id, task_attempt, result);
		});
	}

	/// Resolve the inflight slot for a reply, if it still exists. A slot
	/// already removed by a restart or disconnect flush wins; the late
	/// reply is dropped, so every attempt is concluded exactly once.
	fn on_push_task_response(
		self: &Arc<Self>,
		actor_id: ActorId,
		task_attempt: TaskAttempt,
		result: Result<PushTaskReply, RpcError>,
	) {
		let inflight = {
			let mut state = self.lock_state();
			let queue = state
				.client_queues
				.get_mut(&actor_id)
				.expect("actor queue outlives its tasks");
			queue.inflight_replies.remove(&task_attempt)
		};
		let Some(inflight) = inflight else {
			tracing::debug!(
				task_id = ?task_attempt.task_id,
				"task already marked failed; ignoring the reply"
			);
			return;
		};
		self.handle_push_task_reply(result, inflight.addr, inflight.task_spec);
	}

	/// Classify one reply or transport failure and drive the task manager
	/// to an outcome. Must be called with the lock released.
	pub(super) fn handle_push_task_reply(
		self: &Arc<Self>,
		result: Result<PushTaskReply, RpcError>,
		addr: Address,
		task_spec: TaskSpec,
	) {
		let task_id = task_spec.task_id;
		let actor_id = task_spec.actor_id;

		// A generator queued for resubmission consumes its next valid reply.
		let resubmit_generator = {
			let mut state = self.lock_state();
			let resubmit = state.generators_to_resubmit.remove(&task_id) && result.is_ok();
			if resubmit {
				let queue = state
					.client_queues
					.get_mut(&actor_id)
					.expect("actor queue outlives its tasks");
				queue.cur_pending_calls -= 1;
			}
			resubmit
		};
		if resubmit_generator {
			self.task_manager.mark_generator_failed_and_resubmit(task_id);
			return;
		}

		let mut stashed = false;
		match &result {
			// The worker ran the task; completion covers both success and
			// non-retryable application errors.
			Ok(reply) if !reply.is_retryable_error => {
				self.task_manager.complete_pending_task(
					task_id,
					reply,
					&addr,
					reply.is_application_error,
				);
			}
			Err(RpcError::SchedulingCancelled(_)) => {
				tracing::debug!(?task_id, ?actor_id, "task cancelled before execution");
				let error_info = ErrorInfo::new(
					ErrorType::TaskCancelled,
					format!("task {task_id:?} was cancelled on actor {actor_id:?} before it executed"),
				);
				self.task_manager.fail_pending_task(
					task_id,
					ErrorType::TaskCancelled,
					None,
					Some(&error_info),
				);
			}
			_ => {
				stashed = self.fail_or_retry_task_reply(&result, &addr, &task_spec);
			}
		}

		if !stashed {
			let mut state = self.lock_state();
			let queue = state
				.client_queues
				.get_mut(&actor_id)
				.expect("actor queue outlives its tasks");
			queue.cur_pending_calls -= 1;
		}
	}

	/// Handle a retryable user exception or a transport failure. Returns
	/// whether the task was stashed to wait for death info, in which case it
	/// still counts as pending.
	fn fail_or_retry_task_reply(
		&self,
		result: &Result<PushTaskReply, RpcError>,
		addr: &Address,
		task_spec: &TaskSpec,
	) -> bool {
		let task_id = task_spec.task_id;
		let actor_id = task_spec.actor_id;

		let mut is_actor_dead = false;
		let mut fail_immediately = false;
		let error_info = match result {
			Ok(reply) => {
				// Retryable user exception.
				debug_assert!(reply.is_retryable_error);
				ErrorInfo::new(
					ErrorType::TaskExecutionException,
					reply.task_execution_error.clone().unwrap_or_default(),
				)
			}
			Err(status) => {
				// Transport failure. If the actor is known dead the death
				// cause decides the failure; otherwise the failure is
				// temporary, and a grace period below may still upgrade it
				// once the death cause arrives.
				let state = self.lock_state();
				let queue = state
					.client_queues
					.get(&actor_id)
					.expect("actor queue outlives its tasks");
				is_actor_dead = queue.state == ActorState::Dead;
				if is_actor_dead {
					let info = ErrorInfo::from_death_cause(queue.death_cause.as_ref());
					fail_immediately = info.fail_immediately();
					info
				} else {
					ErrorInfo {
						error_type: ErrorType::ActorUnavailable,
						error_message: format!("The actor is temporarily unavailable: {status}"),
						actor_died: None,
						unavailable_actor: Some(actor_id),
					}
				}
			}
		};

		// A late resolver completion must not revive the task.
		self.resolver.cancel_dependency_resolution(task_id);

		let will_retry = self.task_manager.fail_or_retry_pending_task(
			task_id,
			error_info.error_type,
			result.as_ref().err(),
			Some(&error_info),
			is_actor_dead,
			fail_immediately,
		);
		if is_actor_dead || will_retry {
			return false;
		}

		// Retries exhausted; the last failure is either the user exception
		// or a suspected actor death.
		match result {
			Ok(reply) => {
				self.task_manager.complete_pending_task(
					task_id,
					reply,
					addr,
					reply.is_application_error,
				);
				false
			}
			Err(status) => {
				if let Some(timeout) = self.config.wait_for_death_info_timeout {
					// The actor still looks alive; wait a bounded grace
					// period for the authoritative death cause before
					// committing to a terminal error.
					let deadline = Instant::now() + timeout;
					let mut state = self.lock_state();
					let queue = state
						.client_queues
						.get_mut(&actor_id)
						.expect("actor queue outlives its tasks");
					queue.wait_for_death_info.push_back(PendingDeathWait {
						deadline,
						task_spec: task_spec.clone(),
						status: status.clone(),
						timeout_error_info: error_info,
						actor_preempted: false,
					});
					tracing::info!(
						?task_id,
						wait_queue_size = queue.wait_for_death_info.len(),
						"push failed with a network error; stashing the task until death info arrives"
					);
					true
				} else {
					self.task_manager.fail_pending_task(
						task_id,
						error_info.error_type,
						Some(status),
						Some(&error_info),
					);
					false
				}
			}
		}
	}

	/// Fail every stashed task whose death-info grace period has expired.
	/// Invoked periodically, either by the host's scheduler or by
	/// [`spawn_timeout_sweeper`](crate::spawn_timeout_sweeper).
	pub fn check_timeout_tasks(&self) {
		let now = Instant::now();
		let mut timed_out = Vec::new();
		{
			let mut state = self.lock_state();
			for queue in state.client_queues.values_mut() {
				while let Some(wait) = queue.wait_for_death_info.front() {
					if wait.deadline >= now {
						break;
					}
					let mut wait = queue
						.wait_for_death_info
						.pop_front()
						.expect("front checked above");
					wait.actor_preempted = queue.preempted;
					queue.cur_pending_calls -= 1;
					timed_out.push(wait);
				}
			}
		}
		// The task manager runs with the lock released.
		for wait in timed_out {
			self.fail_stashed_task(wait);
		}
	}

	fn fail_stashed_task(&self, wait: PendingDeathWait) {
		let error_info = if wait.actor_preempted {
			// No death info arrived in time, but a preempted actor is known
			// dead regardless.
			ErrorInfo {
				error_type: ErrorType::ActorDied,
				error_message: "Actor died by preemption.".to_string(),
				actor_died: Some(ActorDeathCause::NodeDied {
					reason: NodeDeathReason::AutoscalerDrainPreempted,
					reason_message: "the node was inferred to be dead due to draining.".to_string(),
				}),
				unavailable_actor: None,
			}
		} else {
			wait.timeout_error_info
		};
		self.task_manager.fail_pending_task(
			wait.task_spec.task_id,
			error_info.error_type,
			Some(&wait.status),
			Some(&error_info),
		);
	}
}
