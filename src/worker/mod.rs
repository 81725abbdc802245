//! Worker processes and the protocol spoken over their pipes.
//!
//! Each worker is a long-lived interpreter process running the embedded
//! bridge loop. The host talks to it over stdin/stdout, one JSON object per
//! line, strictly one request in flight at a time.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Host Process   │
//!                     │  (WorkerPool)   │
//!                     └────────┬────────┘
//!                              │  JSON lines
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │ bridge.py │  │ bridge.py │  │ bridge.py │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Interpreter state (imports, globals defined by `exec`) persists across
//! calls served by the same worker. Callers that need isolation send a
//! `reset` first.

mod handle;
mod ipc;
mod proc;
mod protocol;
mod signals;
mod spawn;

pub use handle::{CallError, Worker, WorkerState};
pub use protocol::{ScriptError, WorkerOp, WorkerReply};
pub use signals::TerminationReason;
pub use spawn::{BRIDGE_SOURCE, WorkerSpec};
