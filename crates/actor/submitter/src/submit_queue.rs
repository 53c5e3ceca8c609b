//! Per-actor buffers of tasks awaiting dispatch.

use std::collections::BTreeMap;

use keel_actor_proto::{TaskId, TaskSpec};

/// Dependency and dispatch state of one queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
	/// Waiting on dependency resolution.
	PendingDeps,
	/// Ready to send.
	Resolved,
	/// Dependency resolution failed; dropped at pop.
	DepFailed,
	/// Cancelled by the caller; dropped at pop.
	Canceled,
}

#[derive(Debug, Clone)]
struct QueueEntry {
	task_spec: TaskSpec,
	state: EntryState,
}

impl QueueEntry {
	fn is_live(&self) -> bool {
		matches!(self.state, EntryState::PendingDeps | EntryState::Resolved)
	}
}

/// Buffer of queued tasks for one actor, keyed by sequence number.
///
/// The in-order variant releases tasks in contiguous sequence order: an
/// unresolved entry blocks everything queued behind it, and popped tasks ask
/// the receiver to honor submit order. The out-of-order variant releases any
/// resolved entry and tells the receiver to skip its own ordering.
#[derive(Debug)]
pub(crate) enum SubmitQueue {
	InOrder(InOrderSubmitQueue),
	OutOfOrder(OutOfOrderSubmitQueue),
}

impl SubmitQueue {
	pub(crate) fn new(execute_out_of_order: bool) -> Self {
		if execute_out_of_order {
			Self::OutOfOrder(OutOfOrderSubmitQueue::default())
		} else {
			Self::InOrder(InOrderSubmitQueue::default())
		}
	}

	fn entries(&self) -> &BTreeMap<u64, QueueEntry> {
		match self {
			Self::InOrder(queue) => &queue.entries,
			Self::OutOfOrder(queue) => &queue.entries,
		}
	}

	fn entries_mut(&mut self) -> &mut BTreeMap<u64, QueueEntry> {
		match self {
			Self::InOrder(queue) => &mut queue.entries,
			Self::OutOfOrder(queue) => &mut queue.entries,
		}
	}

	/// Insert a task at its sequence position. The position must be fresh.
	pub(crate) fn emplace(&mut self, sequence_number: u64, task_spec: TaskSpec) {
		let previous = self.entries_mut().insert(
			sequence_number,
			QueueEntry {
				task_spec,
				state: EntryState::PendingDeps,
			},
		);
		assert!(
			previous.is_none(),
			"sequence number {sequence_number} queued twice"
		);
	}

	pub(crate) fn contains(&self, sequence_number: u64) -> bool {
		self.entries().contains_key(&sequence_number)
	}

	pub(crate) fn dependencies_resolved(&self, sequence_number: u64) -> bool {
		self.entries()
			.get(&sequence_number)
			.is_some_and(|entry| entry.state == EntryState::Resolved)
	}

	/// Mark the entry ready to send. A cancelled or dep-failed entry stays
	/// as it is; a late resolution must not revive it.
	pub(crate) fn mark_dependency_resolved(&mut self, sequence_number: u64) {
		if let Some(entry) = self.entries_mut().get_mut(&sequence_number)
			&& entry.state == EntryState::PendingDeps
		{
			entry.state = EntryState::Resolved;
		}
	}

	/// Returns whether a live entry was transitioned; an entry already
	/// cancelled or failed is left alone.
	pub(crate) fn mark_dependency_failed(&mut self, sequence_number: u64) -> bool {
		if let Some(entry) = self.entries_mut().get_mut(&sequence_number)
			&& entry.is_live()
		{
			entry.state = EntryState::DepFailed;
			return true;
		}
		false
	}

	/// Returns whether a live entry was transitioned; an entry already
	/// cancelled or failed is left alone.
	pub(crate) fn mark_task_canceled(&mut self, sequence_number: u64) -> bool {
		if let Some(entry) = self.entries_mut().get_mut(&sequence_number)
			&& entry.is_live()
		{
			entry.state = EntryState::Canceled;
			return true;
		}
		false
	}

	/// The next task eligible for dispatch, with the `skip_queue` flag for
	/// the receiver. Cancelled and dep-failed entries encountered along the
	/// way are dropped.
	pub(crate) fn pop_next_to_send(&mut self) -> Option<(TaskSpec, bool)> {
		match self {
			Self::InOrder(queue) => queue.pop_next_to_send(),
			Self::OutOfOrder(queue) => queue.pop_next_to_send(),
		}
	}

	/// Drain the queue on terminal actor death. Returns the ids of entries
	/// that were still live; cancelled and dep-failed entries were already
	/// failed through their own paths.
	pub(crate) fn clear_all_tasks(&mut self) -> Vec<TaskId> {
		let entries = self.entries_mut();
		let task_ids = entries
			.values()
			.filter(|entry| entry.is_live())
			.map(|entry| entry.task_spec.task_id)
			.collect();
		entries.clear();
		task_ids
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.entries().is_empty()
	}

	pub(crate) fn len(&self) -> usize {
		self.entries().len()
	}
}

/// Releases tasks in contiguous sequence order.
#[derive(Debug, Default)]
pub(crate) struct InOrderSubmitQueue {
	entries: BTreeMap<u64, QueueEntry>,
}

impl InOrderSubmitQueue {
	fn pop_next_to_send(&mut self) -> Option<(TaskSpec, bool)> {
		loop {
			let (&sequence_number, entry) = self.entries.first_key_value()?;
			match entry.state {
				// An unresolved head blocks everything behind it.
				EntryState::PendingDeps => return None,
				EntryState::Resolved => {
					let entry = self.entries.remove(&sequence_number)?;
					return Some((entry.task_spec, false));
				}
				EntryState::DepFailed | EntryState::Canceled => {
					// Dropped entries stop blocking the head of the line.
					self.entries.remove(&sequence_number);
				}
			}
		}
	}
}

/// Releases any resolved task; the receiver is told to skip its ordering.
#[derive(Debug, Default)]
pub(crate) struct OutOfOrderSubmitQueue {
	entries: BTreeMap<u64, QueueEntry>,
}

impl OutOfOrderSubmitQueue {
	fn pop_next_to_send(&mut self) -> Option<(TaskSpec, bool)> {
		let mut dropped = Vec::new();
		let mut found = None;
		for (&sequence_number, entry) in &self.entries {
			match entry.state {
				EntryState::DepFailed | EntryState::Canceled => dropped.push(sequence_number),
				EntryState::Resolved => {
					found = Some(sequence_number);
					break;
				}
				EntryState::PendingDeps => {}
			}
		}
		for sequence_number in dropped {
			self.entries.remove(&sequence_number);
		}
		let entry = self.entries.remove(&found?)?;
		Some((entry.task_spec, true))
	}
}
