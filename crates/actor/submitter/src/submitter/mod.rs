//! The actor task submitter: per-actor client queues and the thread-safe
//! entry points that drive them.

mod cancel;
mod dispatch;
mod lifecycle;
mod queue;
mod submit;

#[cfg(test)]
mod tests;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use keel_actor_proto::{ActorId, ActorState, Address, TaskId};

use crate::external::{
	ActorDirectory, DependencyResolver, ReferenceCounter, RpcClientPool, TaskManager,
};
use queue::ClientQueue;

/// Tunables for the submitter.
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
	/// Grace period to wait for an authoritative death cause after a
	/// transport failure exhausts its retries. `None` fails such tasks
	/// immediately.
	pub wait_for_death_info_timeout: Option<Duration>,
	/// Delay before retrying a cancel when the actor has no client yet.
	pub cancel_retry_no_client: Duration,
	/// Delay before retrying a cancel the receiver could not act on.
	pub cancel_retry_inflight: Duration,
	/// Inflight count at which the first excess-queueing warning fires.
	pub queueing_warn_threshold: usize,
}

impl Default for SubmitterConfig {
	fn default() -> Self {
		Self {
			wait_for_death_info_timeout: Some(Duration::from_secs(1)),
			cancel_retry_no_client: Duration::from_millis(1000),
			cancel_retry_inflight: Duration::from_millis(2000),
			queueing_warn_threshold: 5000,
		}
	}
}

pub(crate) struct SubmitterState {
	pub(crate) client_queues: HashMap<ActorId, ClientQueue>,
	/// Generator tasks whose next valid reply is converted into a
	/// failed-and-resubmit, recomputing lost streaming output.
	pub(crate) generators_to_resubmit: HashSet<TaskId>,
}

/// Dispatches task invocations to remote actors and translates transport
/// and actor failures into task outcomes.
///
/// One long-lived instance per worker. All entry points are callable from
/// any thread; a single internal mutex serializes state transitions, and
/// anything that can suspend runs on spawned tasks with the lock released.
pub struct ActorTaskSubmitter {
	pub(crate) state: Mutex<SubmitterState>,
	pub(crate) resolver: Arc<dyn DependencyResolver>,
	pub(crate) task_manager: Arc<dyn TaskManager>,
	pub(crate) directory: Arc<dyn ActorDirectory>,
	pub(crate) client_pool: Arc<dyn RpcClientPool>,
	pub(crate) reference_counter: Arc<dyn ReferenceCounter>,
	pub(crate) config: SubmitterConfig,
}

impl ActorTaskSubmitter {
	pub fn new(
		resolver: Arc<dyn DependencyResolver>,
		task_manager: Arc<dyn TaskManager>,
		directory: Arc<dyn ActorDirectory>,
		client_pool: Arc<dyn RpcClientPool>,
		reference_counter: Arc<dyn ReferenceCounter>,
		config: SubmitterConfig,
	) -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(SubmitterState {
				client_queues: HashMap::new(),
				generators_to_resubmit: HashSet::new(),
			}),
			resolver,
			task_manager,
			directory,
			client_pool,
			reference_counter,
			config,
		})
	}

	pub(crate) fn lock_state(&self) -> MutexGuard<'_, SubmitterState> {
		self.state.lock().unwrap()
	}

	/// Ensure a client queue exists for the actor. Idempotent; the first
	/// call wins the configuration. For newly registered owned actors the
	/// out-of-scope callback is armed so the directory can reap the actor
	/// once the owner drops its handle.
	pub fn add_actor_queue(
		self: &Arc<Self>,
		actor_id: ActorId,
		max_pending_calls: i32,
		execute_out_of_order: bool,
		fail_if_actor_unreachable: bool,
		owned: bool,
	) {
		let inserted = {
			let mut state = self.lock_state();
			match state.client_queues.entry(actor_id) {
				Entry::Occupied(_) => false,
				Entry::Vacant(entry) => {
					tracing::info!(?actor_id, max_pending_calls, "registering actor queue");
					entry.insert(ClientQueue::new(
						actor_id,
						execute_out_of_order,
						max_pending_calls,
						fail_if_actor_unreachable,
						owned,
						self.config.queueing_warn_threshold,
					));
					true
				}
			}
		};
		if owned && inserted {
			self.notify_directory_when_out_of_scope(actor_id, 0);
		}
	}

	/// The actor's lifecycle state, if the actor is known.
	#[must_use]
	pub fn local_actor_state(&self, actor_id: ActorId) -> Option<ActorState> {
		let state = self.lock_state();
		state.client_queues.get(&actor_id).map(|queue| queue.state)
	}

	/// Whether the actor is known and currently connected.
	#[must_use]
	pub fn is_actor_alive(&self, actor_id: ActorId) -> bool {
		let state = self.lock_state();
		state
			.client_queues
			.get(&actor_id)
			.is_some_and(|queue| queue.rpc_client.is_some())
	}

	/// The address of the actor's connected worker, if any.
	#[must_use]
	pub fn actor_address(&self, actor_id: ActorId) -> Option<Address> {
		let state = self.lock_state();
		state
			.client_queues
			.get(&actor_id)?
			.rpc_client
			.as_ref()
			.map(|client| client.addr())
	}

	/// Whether the actor's outstanding calls have reached its cap.
	#[must_use]
	pub fn pending_tasks_full(&self, actor_id: ActorId) -> bool {
		let state = self.lock_state();
		let queue = state
			.client_queues
			.get(&actor_id)
			.expect("actor queue must be registered");
		queue.max_pending_calls > 0 && queue.cur_pending_calls >= queue.max_pending_calls
	}

	/// Outstanding calls for the actor: queued, inflight, and waiting for
	/// death info.
	#[must_use]
	pub fn num_pending_tasks(&self, actor_id: ActorId) -> usize {
		let state = self.lock_state();
		let queue = state
			.client_queues
			.get(&actor_id)
			.expect("actor queue must be registered");
		queue.cur_pending_calls.max(0) as usize
	}

	/// Whether a queue has been registered for the actor.
	#[must_use]
	pub fn actor_exists(&self, actor_id: ActorId) -> bool {
		let state = self.lock_state();
		state.client_queues.contains_key(&actor_id)
	}

	/// Diagnostic summary of the actor's queue.
	#[must_use]
	pub fn debug_string(&self, actor_id: ActorId) -> String {
		let state = self.lock_state();
		let queue = state
			.client_queues
			.get(&actor_id)
			.expect("actor queue must be registered");
		format!("submitter state for actor {actor_id:?}: {}", queue.debug_string())
	}

	/// Record that the actor's node was preempted by the autoscaler. A
	/// death-info wait that expires on a preempted actor is failed as a
	/// death rather than a transient unavailability.
	pub fn mark_actor_preempted(&self, actor_id: ActorId) {
		let mut state = self.lock_state();
		if let Some(queue) = state.client_queues.get_mut(&actor_id) {
			tracing::info!(?actor_id, "marking actor as preempted");
			queue.preempted = true;
		}
	}
}
