#![forbid(unsafe_code)]

//! Embedded script host for Rowgate.
//!
//! Endpoint and job scripts evaluate in a fresh JavaScript sandbox
//! (`boa_engine`) with a single global, `$sys`, carrying the coerced
//! request parameters, a writable `result` slot, and `acquire` for
//! checking database connections out of the configured pools. Each
//! evaluation runs on a blocking thread; the database methods bridge back
//! into the async pool through the runtime handle.

pub mod host;

pub use boa_engine::Context;
pub use host::{InitHook, ScriptHost, ScriptOutcome, ScriptValue};
