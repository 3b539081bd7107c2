//! Causa Journal - queryable history of tracked world mutations.
//!
//! This crate records what happened to every transaction the tracking engine
//! processed: committed, rolled back, or discarded, with the capturing phase
//! and the cause chain of the event it was posted in. Debug tools and tests
//! query it by target, phase, outcome, or unwind.
//!
//! # Modules
//!
//! - [`journal`]: The rolling [`TransactionJournal`](journal::TransactionJournal)
//!   and its entry types.

#![deny(unsafe_code)]

pub mod journal;
