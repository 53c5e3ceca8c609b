//! Unit tests for the actor task submitter.

mod helpers;
