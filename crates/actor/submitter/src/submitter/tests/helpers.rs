//! Shared fixtures and recording collaborators for submitter tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keel_actor_proto::{
	ActorId, Address, CancelTaskReply, CancelTaskRequest, CreateActorReply, ErrorInfo, ErrorType,
	NodeId, ObjectId, PushTaskReply, PushTaskRequest, RpcError, TaskId, TaskSpec, WorkerId,
};
use tokio::sync::{Notify, oneshot};

use crate::SubmitterConfig;
use crate::external::{
	ActorDirectory, CreateActorResult, DependencyResolver, OutOfScopeCallback, ReferenceCounter,
	RpcClient, RpcClientPool, TaskManager,
};
use crate::submitter::ActorTaskSubmitter;

pub fn test_spec(actor_id: ActorId, task_id: u64, sequence_number: u64) -> TaskSpec {
	TaskSpec {
		task_id: TaskId(task_id),
		actor_id,
		sequence_number,
		attempt_number: 0,
		is_actor_creation: false,
		caller_worker_id: WorkerId(1),
		body: serde_json::Value::Null,
	}
}

pub fn creation_spec(actor_id: ActorId, task_id: u64) -> TaskSpec {
	TaskSpec {
		is_actor_creation: true,
		..test_spec(actor_id, task_id, 0)
	}
}

pub fn worker_address(n: u64) -> Address {
	Address {
		node_id: NodeId(n),
		worker_id: WorkerId(n),
		ip_address: format!("10.0.0.{n}"),
		port: 7000 + n as u16,
	}
}

/// Let spawned submitter tasks run to quiescence on a current-thread
/// runtime.
pub async fn settle() {
	for _ in 0..8 {
		tokio::task::yield_now().await;
	}
}

/// Every task-manager call the submitter makes, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
	DependenciesResolved(TaskId),
	WaitingForExecution(TaskId, NodeId, WorkerId),
	Canceled(TaskId),
	Completed {
		task_id: TaskId,
		is_application_error: bool,
	},
	Failed {
		task_id: TaskId,
		error_type: ErrorType,
	},
	FailedOrRetried {
		task_id: TaskId,
		error_type: ErrorType,
		will_retry: bool,
		fail_immediately: bool,
	},
	GeneratorResubmitted(TaskId),
}

/// Task manager that records every call and plays back a per-task retry
/// budget.
#[derive(Default)]
pub struct RecordingTaskManager {
	events: Mutex<Vec<ManagerEvent>>,
	pending: Mutex<HashMap<TaskId, TaskSpec>>,
	retries: Mutex<HashMap<TaskId, u32>>,
	completions: Mutex<HashMap<TaskId, (PushTaskReply, Address)>>,
	failures: Mutex<HashMap<TaskId, ErrorInfo>>,
}

impl RecordingTaskManager {
	pub fn add_pending(&self, task_spec: &TaskSpec) {
		self.pending
			.lock()
			.unwrap()
			.insert(task_spec.task_id, task_spec.clone());
	}

	pub fn remove_pending(&self, task_id: TaskId) {
		self.pending.lock().unwrap().remove(&task_id);
	}

	/// Grant the task a retry budget; `fail_or_retry_pending_task` answers
	/// `will_retry = true` until it is spent.
	pub fn set_retries(&self, task_id: TaskId, retries: u32) {
		self.retries.lock().unwrap().insert(task_id, retries);
	}

	pub fn events(&self) -> Vec<ManagerEvent> {
		self.events.lock().unwrap().clone()
	}

	pub fn completion(&self, task_id: TaskId) -> Option<(PushTaskReply, Address)> {
		self.completions.lock().unwrap().get(&task_id).cloned()
	}

	pub fn last_failure(&self, task_id: TaskId) -> Option<ErrorInfo> {
		self.failures.lock().unwrap().get(&task_id).cloned()
	}

	fn record(&self, event: ManagerEvent) {
		self.events.lock().unwrap().push(event);
	}
}

impl TaskManager for RecordingTaskManager {
	fn mark_dependencies_resolved(&self, task_id: TaskId) {
		self.record(ManagerEvent::DependenciesResolved(task_id));
	}

	fn mark_task_waiting_for_execution(&self, task_id: TaskId, node_id: NodeId, worker_id: WorkerId) {
		self.record(ManagerEvent::WaitingForExecution(task_id, node_id, worker_id));
	}

	fn mark_task_canceled(&self, task_id: TaskId) {
		self.record(ManagerEvent::Canceled(task_id));
	}

	fn is_task_pending(&self, task_id: TaskId) -> bool {
		self.pending.lock().unwrap().contains_key(&task_id)
	}

	fn get_task_spec(&self, task_id: TaskId) -> Option<TaskSpec> {
		self.pending.lock().unwrap().get(&task_id).cloned()
	}

	fn complete_pending_task(
		&self,
		task_id: TaskId,
		reply: &PushTaskReply,
		addr: &Address,
		is_application_error: bool,
	) {
		self.pending.lock().unwrap().remove(&task_id);
		self.completions
			.lock()
			.unwrap()
			.insert(task_id, (reply.clone(), addr.clone()));
		self.record(ManagerEvent::Completed {
			task_id,
			is_application_error,
		});
	}

	fn fail_pending_task(
		&self,
		task_id: TaskId,
		error_type: ErrorType,
		_status: Option<&RpcError>,
		error_info: Option<&ErrorInfo>,
	) {
		self.pending.lock().unwrap().remove(&task_id);
		if let Some(info) = error_info {
			self.failures.lock().unwrap().insert(task_id, info.clone());
		}
		self.record(ManagerEvent::Failed {
			task_id,
			error_type,
		});
	}

	fn fail_or_retry_pending_task(
		&self,
		task_id: TaskId,
		error_type: ErrorType,
		_status: Option<&RpcError>,
		error_info: Option<&ErrorInfo>,
		_mark_task_object_failed: bool,
		fail_immediately: bool,
	) -> bool {
		let will_retry = {
			let mut retries = self.retries.lock().unwrap();
			match retries.get_mut(&task_id) {
				Some(budget) if *budget > 0 && !fail_immediately => {
					*budget -= 1;
					true
				}
				_ => false,
			}
		};
		if !will_retry {
			self.pending.lock().unwrap().remove(&task_id);
		}
		if let Some(info) = error_info {
			self.failures.lock().unwrap().insert(task_id, info.clone());
		}
		self.record(ManagerEvent::FailedOrRetried {
			task_id,
			error_type,
			will_retry,
			fail_immediately,
		});
		will_retry
	}

	fn mark_generator_failed_and_resubmit(&self, task_id: TaskId) {
		self.pending.lock().unwrap().remove(&task_id);
		self.record(ManagerEvent::GeneratorResubmitted(task_id));
	}
}

/// Resolver that completes immediately unless a gate was installed for the
/// task, and records cancellations.
#[derive(Default)]
pub struct GateResolver {
	gates: Mutex<HashMap<TaskId, oneshot::Receiver<Result<(), RpcError>>>>,
	cancelled: Mutex<Vec<TaskId>>,
}

impl GateResolver {
	/// Make resolution for the task wait until the returned sender fires.
	pub fn gate(&self, task_id: TaskId) -> oneshot::Sender<Result<(), RpcError>> {
		let (tx, rx) = oneshot::channel();
		self.gates.lock().unwrap().insert(task_id, rx);
		tx
	}

	pub fn cancelled(&self) -> Vec<TaskId> {
		self.cancelled.lock().unwrap().clone()
	}
}

#[async_trait]
impl DependencyResolver for GateResolver {
	async fn resolve(&self, task_spec: &TaskSpec) -> Result<(), RpcError> {
		let gate = self.gates.lock().unwrap().remove(&task_spec.task_id);
		match gate {
			Some(rx) => rx
				.await
				.unwrap_or(Err(RpcError::Io("resolution abandoned".to_string()))),
			None => Ok(()),
		}
	}

	fn cancel_dependency_resolution(&self, task_id: TaskId) {
		self.cancelled.lock().unwrap().push(task_id);
	}
}

/// Directory with scripted creation outcomes and recorded restart and
/// out-of-scope calls.
#[derive(Default)]
pub struct ScriptedDirectory {
	create_results: Mutex<VecDeque<CreateActorResult>>,
	restarts: Mutex<Vec<(ActorId, u64)>>,
	out_of_scope_reports: Mutex<Vec<(ActorId, u64)>>,
}

impl ScriptedDirectory {
	pub fn script_create(&self, result: CreateActorResult) {
		self.create_results.lock().unwrap().push_back(result);
	}

	pub fn restarts(&self) -> Vec<(ActorId, u64)> {
		self.restarts.lock().unwrap().clone()
	}

	pub fn out_of_scope_reports(&self) -> Vec<(ActorId, u64)> {
		self.out_of_scope_reports.lock().unwrap().clone()
	}
}

#[async_trait]
impl ActorDirectory for ScriptedDirectory {
	async fn create_actor(&self, task_spec: TaskSpec) -> CreateActorResult {
		self.create_results
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or_else(|| CreateActorResult {
				status: Ok(()),
				reply: CreateActorReply {
					borrowed_refs: Vec::new(),
					actor_address: Some(worker_address(task_spec.actor_id.0)),
					death_cause: None,
				},
			})
	}

	async fn restart_for_lineage(
		&self,
		actor_id: ActorId,
		num_restarts_due_to_lineage: u64,
	) -> Result<(), RpcError> {
		self.restarts
			.lock()
			.unwrap()
			.push((actor_id, num_restarts_due_to_lineage));
		Ok(())
	}

	async fn report_out_of_scope(
		&self,
		actor_id: ActorId,
		num_restarts_due_to_lineage: u64,
	) -> Result<(), RpcError> {
		self.out_of_scope_reports
			.lock()
			.unwrap()
			.push((actor_id, num_restarts_due_to_lineage));
		Ok(())
	}
}

/// An intercepted push, held until the test responds.
pub struct PushIntercept {
	pub request: PushTaskRequest,
	pub skip_queue: bool,
	reply: oneshot::Sender<Result<PushTaskReply, RpcError>>,
}

impl PushIntercept {
	pub fn respond(self, result: Result<PushTaskReply, RpcError>) {
		let _ = self.reply.send(result);
	}
}

/// An intercepted cancel, held until the test responds.
pub struct CancelIntercept {
	pub request: CancelTaskRequest,
	reply: oneshot::Sender<Result<CancelTaskReply, RpcError>>,
}

impl CancelIntercept {
	pub fn respond(self, result: Result<CancelTaskReply, RpcError>) {
		let _ = self.reply.send(result);
	}
}

/// Client whose RPCs park until the test answers them.
pub struct MockClient {
	addr: Address,
	pushes: Mutex<VecDeque<PushIntercept>>,
	cancels: Mutex<VecDeque<CancelIntercept>>,
	notify: Notify,
}

impl MockClient {
	fn new(addr: Address) -> Self {
		Self {
			addr,
			pushes: Mutex::new(VecDeque::new()),
			cancels: Mutex::new(VecDeque::new()),
			notify: Notify::new(),
		}
	}

	pub async fn next_push(&self) -> PushIntercept {
		loop {
			let notified = self.notify.notified();
			if let Some(intercept) = self.pushes.lock().unwrap().pop_front() {
				return intercept;
			}
			notified.await;
		}
	}

	pub async fn next_cancel(&self) -> CancelIntercept {
		loop {
			let notified = self.notify.notified();
			if let Some(intercept) = self.cancels.lock().unwrap().pop_front() {
				return intercept;
			}
			notified.await;
		}
	}

	pub fn try_next_push(&self) -> Option<PushIntercept> {
		self.pushes.lock().unwrap().pop_front()
	}

	pub fn pending_pushes(&self) -> usize {
		self.pushes.lock().unwrap().len()
	}
}

#[async_trait]
impl RpcClient for MockClient {
	fn addr(&self) -> Address {
		self.addr.clone()
	}

	async fn push_actor_task(
		&self,
		request: PushTaskRequest,
		skip_queue: bool,
	) -> Result<PushTaskReply, RpcError> {
		let (tx, rx) = oneshot::channel();
		self.pushes.lock().unwrap().push_back(PushIntercept {
			request,
			skip_queue,
			reply: tx,
		});
		self.notify.notify_waiters();
		rx.await
			.unwrap_or(Err(RpcError::Io("client dropped".to_string())))
	}

	async fn cancel_task(&self, request: CancelTaskRequest) -> Result<CancelTaskReply, RpcError> {
		let (tx, rx) = oneshot::channel();
		self.cancels
			.lock()
			.unwrap()
			.push_back(CancelIntercept { request, reply: tx });
		self.notify.notify_waiters();
		rx.await
			.unwrap_or(Err(RpcError::Io("client dropped".to_string())))
	}
}

/// Pool handing out [`MockClient`]s keyed by address; tests can grab a
/// client before the submitter connects.
#[derive(Default)]
pub struct MockClientPool {
	clients: Mutex<HashMap<(String, u16), Arc<MockClient>>>,
	disconnects: Mutex<Vec<WorkerId>>,
}

impl MockClientPool {
	pub fn client_for(&self, address: &Address) -> Arc<MockClient> {
		let mut clients = self.clients.lock().unwrap();
		Arc::clone(
			clients
				.entry((address.ip_address.clone(), address.port))
				.or_insert_with(|| Arc::new(MockClient::new(address.clone()))),
		)
	}

	pub fn disconnects(&self) -> Vec<WorkerId> {
		self.disconnects.lock().unwrap().clone()
	}
}

impl RpcClientPool for MockClientPool {
	fn get_or_connect(&self, address: &Address) -> Arc<dyn RpcClient> {
		self.client_for(address)
	}

	fn disconnect(&self, worker_id: WorkerId) {
		self.disconnects.lock().unwrap().push(worker_id);
	}
}

/// Reference counter holding registered callbacks until the test fires them.
#[derive(Default)]
pub struct MockReferenceCounter {
	callbacks: Mutex<HashMap<ObjectId, Vec<OutOfScopeCallback>>>,
	out_of_scope: Mutex<HashSet<ObjectId>>,
}

impl MockReferenceCounter {
	/// Make future registrations for the object report it already out of
	/// scope.
	pub fn set_out_of_scope(&self, object_id: ObjectId) {
		self.out_of_scope.lock().unwrap().insert(object_id);
	}

	/// Fire and consume every callback registered for the object.
	pub fn fire(&self, object_id: ObjectId) {
		let callbacks = self
			.callbacks
			.lock()
			.unwrap()
			.remove(&object_id)
			.unwrap_or_default();
		for callback in callbacks {
			callback(object_id);
		}
	}

	pub fn registered(&self, object_id: ObjectId) -> usize {
		self.callbacks
			.lock()
			.unwrap()
			.get(&object_id)
			.map_or(0, Vec::len)
	}
}

impl ReferenceCounter for MockReferenceCounter {
	fn add_out_of_scope_or_freed_callback(
		&self,
		object_id: ObjectId,
		callback: OutOfScopeCallback,
	) -> bool {
		if self.out_of_scope.lock().unwrap().contains(&object_id) {
			return false;
		}
		self.callbacks
			.lock()
			.unwrap()
			.entry(object_id)
			.or_default()
			.push(callback);
		true
	}
}

/// A submitter wired to recording collaborators.
pub struct TestHarness {
	pub submitter: Arc<ActorTaskSubmitter>,
	pub resolver: Arc<GateResolver>,
	pub manager: Arc<RecordingTaskManager>,
	pub directory: Arc<ScriptedDirectory>,
	pub pool: Arc<MockClientPool>,
	pub refs: Arc<MockReferenceCounter>,
}

impl TestHarness {
	pub fn new() -> Self {
		Self::with_config(SubmitterConfig::default())
	}

	pub fn with_config(config: SubmitterConfig) -> Self {
		let resolver = Arc::new(GateResolver::default());
		let manager = Arc::new(RecordingTaskManager::default());
		let directory = Arc::new(ScriptedDirectory::default());
		let pool = Arc::new(MockClientPool::default());
		let refs = Arc::new(MockReferenceCounter::default());
		let submitter = ActorTaskSubmitter::new(
			Arc::clone(&resolver) as Arc<dyn DependencyResolver>,
			Arc::clone(&manager) as Arc<dyn TaskManager>,
			Arc::clone(&directory) as Arc<dyn ActorDirectory>,
			Arc::clone(&pool) as Arc<dyn RpcClientPool>,
			Arc::clone(&refs) as Arc<dyn ReferenceCounter>,
			config,
		);
		Self {
			submitter,
			resolver,
			manager,
			directory,
			pool,
			refs,
		}
	}

	/// In-order owned queue with a generous pending cap.
	pub fn add_queue(&self, actor_id: ActorId) {
		self.submitter.add_actor_queue(actor_id, 10, false, false, true);
	}

	/// Register the task as pending with the manager and submit it.
	pub fn submit(&self, task_spec: &TaskSpec) {
		self.manager.add_pending(task_spec);
		self.submitter.submit_task(task_spec.clone());
	}

	pub fn submit_creation(&self, task_spec: &TaskSpec) {
		self.manager.add_pending(task_spec);
		self.submitter.submit_actor_creation_task(task_spec.clone());
	}
}
