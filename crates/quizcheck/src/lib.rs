//! # quizcheck
//!
//! A grading engine for untrusted Python submissions.
//!
//! A submission is graded by running it against a registered check:
//!
//! - **[`Sandbox`]** runs the source in a fresh `python3` process with its own
//!   working directory, process group and kernel resource limits, under a
//!   hard wall-clock bound.
//! - **[`CheckRegistry`]** maps a check id to its definition, loaded from a
//!   [`TestBank`] and swapped atomically on reload.
//! - **[`Grader`]** ties the two together: one lookup plus one run per request,
//!   mapped to a [`CheckResult`].
//!
//! Every run ends in exactly one [`Outcome`]; the client-visible [`Status`]
//! adds the request-level classifications on top.
//!
//! ## Safety
//!
//! The crate denies unsafe code and allows it only on the items that call
//! `setrlimit` and `kill` for the child process. It targets Unix.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use quizcheck::{Check, CheckRegistry, CheckRequest, CheckSet, Grader, Sandbox};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), quizcheck::Error> {
//!     let checks = CheckSet::from_checks([Check::new("add_ok")
//!         .with_name("add")
//!         .with_assertion("adds", "assert add(2, 3) == 5")])?;
//!     let registry = Arc::new(CheckRegistry::new(checks));
//!     let grader = Grader::new(registry, Arc::new(Sandbox::builder().build()?));
//!
//!     let result = grader
//!         .grade(&CheckRequest::new("add_ok", "def add(a, b):\n    return a + b\n"))
//!         .await;
//!     println!("{}: {}", result.status, result.response);
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

mod bank;
mod check;
mod error;
pub mod harness;
mod outcome;
mod process;
mod registry;
mod sandbox;
mod session;

pub use bank::{CheckSet, TestBank};
pub use check::{Assertion, Check, CheckGroup, Scoring, Signature};
pub use error::Error;
pub use outcome::{CheckResult, ExecutionOutcome, Outcome, Score, Status};
pub use registry::CheckRegistry;
pub use sandbox::{Executor, Job, ResourceLimits, Sandbox, SandboxBuilder};
pub use session::{
    CheckRequest, Grader, GradingSession, RequestLimits, TimeBounds, render,
};
