//! # quizcheck-server
//!
//! The `checker.Checker` gRPC service in front of the [`quizcheck`] engine.
//!
//! A request passes through, in order:
//!
//! 1. validation against [`RequestLimits`](quizcheck::RequestLimits), failing
//!    with `INVALID_ARGUMENT`;
//! 2. [`Admission`] control, failing with an `OVERLOADED` result;
//! 3. one grading session on its own task.
//!
//! Every well-formed request gets a `CheckResult`.

pub mod admission;
pub mod client;
pub mod config;
pub mod service;
pub mod telemetry;

/// Generated protobuf and gRPC types for the `checker` package.
pub mod proto {
    #![allow(missing_docs, missing_debug_implementations, clippy::all)]
    tonic::include_proto!("checker");
}

pub use admission::{Admission, AdmissionPolicy, Rejection};
pub use client::Client;
pub use config::{AdmissionMode, EngineArgs, LogFormat, ServeArgs};
pub use service::{CheckerService, serve};
