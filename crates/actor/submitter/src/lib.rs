//! Client-side dispatch of method invocations to remote stateful actors.
//!
//! The submitter owns one client queue per known actor: a small state
//! machine (pending-creation, alive, restarting, dead) plus an ordered
//! buffer of tasks awaiting dispatch. Tasks are queued
//! with a caller-assigned sequence number before their dependencies resolve,
//! so the receiver can serialize execution in submit order without the
//! submitter deadlocking on out-of-order resolution. Transport failures are
//! translated into the task failure taxonomy, optionally after a bounded
//! grace period waiting for an authoritative death cause.
//!
//! All entry points are thread-safe; work that can suspend (dependency
//! resolution, RPCs, directory calls, timers) runs on spawned tasks, never
//! under the internal lock.

pub mod external;
mod submit_queue;
mod submitter;
mod sweeper;

pub use submitter::{ActorTaskSubmitter, SubmitterConfig};
pub use sweeper::{TimeoutSweeperHandle, spawn_timeout_sweeper};
