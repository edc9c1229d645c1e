//! # Previously, on Spillway...
//!
//! 🎬 The records were trapped. Somebody had to hold them, and that somebody had
//! to be cheap, fast, and gone the moment the process exits.
//!
//! `in_mem` provides a queue, a sink and a backup store that live entirely in
//! RAM, with knobs to make them fail on purpose. Tests use them to stage every
//! bad day the real backends can have, without needing a real bad day.
//!
//! ⚠️ This is NOT for production. If you're deploying this to prod, please also
//! deploy a therapist.
//!
//! 🦆

// -- 🧪 the inspection and failure-injection knobs are for tests only
#![cfg_attr(not(test), allow(dead_code))]

mod in_mem_backup;
mod in_mem_queue;
mod in_mem_sink;

pub(crate) use in_mem_backup::InMemoryBackupStore;
pub(crate) use in_mem_queue::InMemoryQueue;
pub(crate) use in_mem_sink::{FailureScript, InMemorySink};
