//! Per-actor client state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use keel_actor_proto::{
	ActorDeathCause, ActorId, ActorState, Address, ErrorInfo, RpcError, TaskAttempt, TaskSpec,
	WorkerId,
};
use tokio::time::Instant;

use crate::external::RpcClient;
use crate::submit_queue::SubmitQueue;

/// Reply bookkeeping for one dispatched attempt. Present in the inflight
/// table exactly while a reply (real or synthetic) is still owed; whichever
/// path removes the entry delivers the reply, so every attempt is concluded
/// exactly once.
#[derive(Debug, Clone)]
pub(crate) struct InflightReply {
	pub(crate) task_spec: TaskSpec,
	pub(crate) addr: Address,
}

/// A task stashed after a transport failure, waiting a bounded grace period
/// for the authoritative death cause.
#[derive(Debug, Clone)]
pub(crate) struct PendingDeathWait {
	pub(crate) deadline: Instant,
	pub(crate) task_spec: TaskSpec,
	/// The transport failure that put the task here.
	pub(crate) status: RpcError,
	/// Failure reported if the grace period expires without death info.
	pub(crate) timeout_error_info: ErrorInfo,
	/// Snapshot of the queue's preemption flag, taken at expiry.
	pub(crate) actor_preempted: bool,
}

/// Everything this worker knows about one actor: lifecycle state, the
/// connection to it, queued and inflight tasks, and death bookkeeping.
///
/// Created by `add_actor_queue` and kept for the submitter's lifetime; a
/// dead actor keeps its queue so late replies and observers stay coherent.
pub(crate) struct ClientQueue {
	pub(crate) actor_id: ActorId,
	pub(crate) state: ActorState,
	/// Highest restart generation observed from the directory.
	pub(crate) num_restarts: i64,
	/// Owner-initiated reconstructions; counted separately from directory
	/// restarts.
	pub(crate) num_restarts_due_to_lineage: u64,
	/// Cap on outstanding calls; `<= 0` means unlimited.
	pub(crate) max_pending_calls: i32,
	/// Queued + inflight + death-info-waiting tasks.
	pub(crate) cur_pending_calls: i32,
	/// Fail tasks with a synthetic network error while the actor restarts
	/// instead of holding them.
	pub(crate) fail_if_actor_unreachable: bool,
	/// Whether this worker owns the actor (restarts it and reports it out
	/// of scope).
	pub(crate) owned: bool,
	/// Whether the actor may be restarted. Meaningful once dead.
	pub(crate) is_restartable: bool,
	/// The owner dropped its handle; hold dispatch until the death resolves.
	pub(crate) pending_out_of_scope_death: bool,
	/// The hosting node was preempted by the autoscaler.
	pub(crate) preempted: bool,
	pub(crate) death_cause: Option<ActorDeathCause>,
	/// Present exactly while the actor is alive.
	pub(crate) rpc_client: Option<Arc<dyn RpcClient>>,
	/// The worker incarnation requests are addressed to; cleared on
	/// disconnect.
	pub(crate) worker_id: Option<WorkerId>,
	pub(crate) submit_queue: SubmitQueue,
	pub(crate) inflight_replies: HashMap<TaskAttempt, InflightReply>,
	/// Ordered by deadline; pushed at the back as failures arrive.
	pub(crate) wait_for_death_info: VecDeque<PendingDeathWait>,
	/// Inflight count at which the next excess-queueing warning fires;
	/// doubles each time.
	pub(crate) next_queueing_warn_threshold: usize,
}

impl ClientQueue {
	pub(crate) fn new(
		actor_id: ActorId,
		execute_out_of_order: bool,
		max_pending_calls: i32,
		fail_if_actor_unreachable: bool,
		owned: bool,
		queueing_warn_threshold: usize,
	) -> Self {
		Self {
			actor_id,
			state: ActorState::PendingCreation,
			num_restarts: 0,
			num_restarts_due_to_lineage: 0,
			max_pending_calls,
			cur_pending_calls: 0,
			fail_if_actor_unreachable,
			owned,
			is_restartable: false,
			pending_out_of_scope_death: false,
			preempted: false,
			death_cause: None,
			rpc_client: None,
			worker_id: None,
			submit_queue: SubmitQueue::new(execute_out_of_order),
			inflight_replies: HashMap::new(),
			wait_for_death_info: VecDeque::new(),
			next_queueing_warn_threshold: queueing_warn_threshold,
		}
	}

	pub(crate) fn debug_string(&self) -> String {
		format!(
			"state={:?} num_restarts={} num_restarts_due_to_lineage={} \
			 cur_pending_calls={} queued={} inflight={} wait_for_death_info={} \
			 pending_out_of_scope_death={} preempted={}",
			self.state,
			self.num_restarts,
			self.num_restarts_due_to_lineage,
			self.cur_pending_calls,
			self.submit_queue.len(),
			self.inflight_replies.len(),
			self.wait_for_death_info.len(),
			self.pending_out_of_scope_death,
			self.preempted,
		)
	}
}
