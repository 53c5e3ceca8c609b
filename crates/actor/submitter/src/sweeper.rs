//! Background driver for the death-info grace-period sweep.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::submitter::ActorTaskSubmitter;

/// Handle to a running timeout sweeper.
pub struct TimeoutSweeperHandle {
	cancel: CancellationToken,
}

impl TimeoutSweeperHandle {
	/// Stop the sweep loop. Entries already expired keep their outcome;
	/// entries still waiting are only failed by a later death notification.
	pub fn stop(&self) {
		self.cancel.cancel();
	}
}

/// Run [`ActorTaskSubmitter::check_timeout_tasks`] every `period`.
///
/// For hosts without their own periodic scheduler. The loop holds only a
/// weak reference and exits once the submitter is dropped.
pub fn spawn_timeout_sweeper(
	submitter: &Arc<ActorTaskSubmitter>,
	period: Duration,
) -> TimeoutSweeperHandle {
	let cancel = CancellationToken::new();
	let task_cancel = cancel.clone();
	let weak: Weak<ActorTaskSubmitter> = Arc::downgrade(submitter);
	tokio::spawn(async move {
		loop {
			tokio::select! {
				biased;
				_ = task_cancel.cancelled() => break,
				_ = tokio::time::sleep(period) => {}
			}
			let Some(submitter) = weak.upgrade() else {
				break;
			};
			submitter.check_timeout_tasks();
		}
	});
	TimeoutSweeperHandle { cancel }
}
