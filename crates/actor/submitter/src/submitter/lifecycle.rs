//! Actor liveness transitions: connect, restart, and death notifications.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use keel_actor_proto::{
	ActorDeathCause, ActorId, ActorState, Address, ErrorInfo, RpcError, TaskAttempt,
};

use crate::submitter::ActorTaskSubmitter;
use crate::submitter::queue::{ClientQueue, InflightReply};

impl ActorTaskSubmitter {
	/// Route new RPCs for the actor to `address`.
	///
	/// `num_restarts` is the actor's restart generation; notifications about
	/// generations older than the current one are discarded. Connecting over
	/// an existing client to a different address tears the old client down
	/// and fails its inflight replies with a synthetic network error.
	pub fn connect_actor(self: &Arc<Self>, actor_id: ActorId, address: Address, num_restarts: i64) {
		tracing::debug!(?actor_id, worker_id = ?address.worker_id, "connecting to actor");

		let mut flushed = HashMap::new();
		{
			let mut state = self.lock_state();
			let queue = state
				.client_queues
				.get_mut(&actor_id)
				.expect("actor queue must be registered before liveness notifications");
			if num_restarts < queue.num_restarts {
				tracing::info!(
					?actor_id,
					"skipping connect notification for an actor that has since restarted"
				);
				return;
			}
			if let Some(client) = &queue.rpc_client {
				let current = client.addr();
				if current.ip_address == address.ip_address && current.port == address.port {
					tracing::debug!(?actor_id, "actor is already connected");
					return;
				}
			}
			if queue.state == ActorState::Dead {
				// Stale notification about an actor that has since died.
				return;
			}

			queue.num_restarts = num_restarts;
			if queue.rpc_client.is_some() {
				// Drop the client to the previous incarnation.
				self.disconnect_rpc_client(queue);
				flushed = std::mem::take(&mut queue.inflight_replies);
			}

			queue.state = ActorState::Alive;
			queue.worker_id = Some(address.worker_id);
			queue.rpc_client = Some(self.client_pool.get_or_connect(&address));
			self.send_pending_tasks(queue);
		}

		// The lock must be released before the flushed replies run.
		self.fail_inflight_tasks_on_restart(flushed);
	}

	/// Apply a restart (`dead = false`) or death (`dead = true`) notification.
	///
	/// Restart notifications must advance the generation; death is
	/// authoritative and applies regardless. Death of a restartable actor
	/// owned by this worker with queued tasks triggers lineage
	/// reconstruction; any other death drains and fails everything still
	/// outstanding.
	pub fn disconnect_actor(
		self: &Arc<Self>,
		actor_id: ActorId,
		num_restarts: i64,
		dead: bool,
		death_cause: Option<ActorDeathCause>,
		is_restartable: bool,
	) {
		tracing::debug!(
			?actor_id,
			dead,
			cause = death_cause.as_ref().map(ActorDeathCause::describe),
			"disconnecting from actor"
		);

		let flushed;
		let mut death_waits = VecDeque::new();
		let mut task_ids_to_fail = Vec::new();
		{
			let mut state = self.lock_state();
			let queue = state
				.client_queues
				.get_mut(&actor_id)
				.expect("actor queue must be registered before liveness notifications");
			if !dead {
				debug_assert!(num_restarts > 0);
				if num_restarts <= queue.num_restarts {
					tracing::info!(
						?actor_id,
						"skipping disconnect notification for an actor that has since restarted"
					);
					return;
				}
			}

			// Tear down the client now. Either the actor is permanently dead
			// or a new client is installed once it restarts.
			self.disconnect_rpc_client(queue);
			flushed = std::mem::take(&mut queue.inflight_replies);

			if dead {
				queue.state = ActorState::Dead;
				queue.death_cause = death_cause.clone();
				queue.pending_out_of_scope_death = false;
				queue.is_restartable = is_restartable;

				if queue.is_restartable && queue.owned {
					// Out-of-scope death: nothing can be inflight or waiting.
					debug_assert!(queue.wait_for_death_info.is_empty());
					debug_assert!(flushed.is_empty());
					if !queue.submit_queue.is_empty() {
						// Queued lineage tasks; bring the actor back.
						self.restart_actor_for_lineage_reconstruction(queue);
					}
				} else {
					tracing::info!(?actor_id, "failing pending tasks of a dead actor");
					task_ids_to_fail = queue.submit_queue.clear_all_tasks();
					death_waits = std::mem::take(&mut queue.wait_for_death_info);
					queue.cur_pending_calls -=
						(task_ids_to_fail.len() + death_waits.len()) as i32;
				}
			} else if queue.state != ActorState::Dead {
				// A permanently dead actor never transitions back.
				queue.state = ActorState::Restarting;
				queue.num_restarts = num_restarts;
			}
		}

		if !task_ids_to_fail.is_empty() || !death_waits.is_empty() {
			// Failing tasks re-enters the task manager; the lock is released.
			let status = RpcError::Io("cancelling all pending tasks of dead actor".to_string());
			let error_info = ErrorInfo::from_death_cause(death_cause.as_ref());
			let fail_immediately = error_info.fail_immediately();
			for task_id in task_ids_to_fail {
				self.task_manager.mark_task_canceled(task_id);
				// A late resolver completion must not revive the task.
				self.resolver.cancel_dependency_resolution(task_id);
				self.task_manager.fail_or_retry_pending_task(
					task_id,
					error_info.error_type,
					Some(&status),
					Some(&error_info),
					true,
					fail_immediately,
				);
			}
			if !death_waits.is_empty() {
				tracing::debug!(
					?actor_id,
					count = death_waits.len(),
					"failing tasks waiting for death info"
				);
				for wait in death_waits {
					self.task_manager.fail_pending_task(
						wait.task_spec.task_id,
						error_info.error_type,
						Some(&wait.status),
						Some(&error_info),
					);
				}
			}
		}
		self.fail_inflight_tasks_on_restart(flushed);
	}

	/// Drop the queue's client and release its pooled connection. Caller
	/// holds the state lock.
	pub(super) fn disconnect_rpc_client(&self, queue: &mut ClientQueue) {
		queue.rpc_client = None;
		if let Some(worker_id) = queue.worker_id.take() {
			self.client_pool.disconnect(worker_id);
		}
	}

	/// Deliver a synthetic network failure for every reply that was inflight
	/// when the actor's client was torn down. Runs the full reply path (not
	/// a direct task failure) so retry and accounting decisions stay in one
	/// place. Must be called with the lock released.
	pub(super) fn fail_inflight_tasks_on_restart(
		self: &Arc<Self>,
		flushed: HashMap<TaskAttempt, InflightReply>,
	) {
		for (_, inflight) in flushed {
			let status = RpcError::Io("The actor was restarted".to_string());
			self.handle_push_task_reply(Err(status), inflight.addr, inflight.task_spec);
		}
	}
}
