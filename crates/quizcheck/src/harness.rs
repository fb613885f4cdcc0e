//! The trusted driver run inside each sandboxed interpreter.
//!
//! The driver ships with the crate as Python source. The host writes it next
//! to the submission together with a `check.json` derived from the [`Check`],
//! hands it a fresh nonce on stdin, and reads the verdict back from the
//! child's stderr as a single `<nonce> <json>` line. The submission's own
//! output is redirected to stdout, so nothing it prints can carry the nonce.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::check::{Check, Scoring, Signature};
use crate::outcome::{Outcome, Score};

/// Python source of the driver.
pub(crate) const HARNESS_SOURCE: &str = include_str!("harness.py");

/// File name the driver is written to.
pub(crate) const HARNESS_FILE: &str = "harness.py";

/// File name the submission is written to.
pub(crate) const SUBMISSION_FILE: &str = "submission.py";

/// File name the check definition is written to. The driver deletes it
/// before the submission runs.
pub(crate) const CHECK_FILE: &str = "check.json";

/// Exit status the driver uses when it fails before reporting.
pub(crate) const HARNESS_FAULT_STATUS: i32 = 70;

const NONCE_BYTES: usize = 16;

/// A fresh, unguessable report tag.
pub(crate) fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Serialize)]
struct AssertionSpec<'a> {
    name: String,
    code: &'a str,
}

/// What the driver reads from `check.json`.
#[derive(Debug, Serialize)]
pub(crate) struct HarnessSpec<'a> {
    name: Option<&'a str>,
    require_docstring: bool,
    signature: Option<&'a Signature>,
    tokens_required: &'a [String],
    tokens_forbidden: &'a [String],
    scoring: Scoring,
    assertions: Vec<AssertionSpec<'a>>,
    recursion_limit: u32,
}

impl<'a> HarnessSpec<'a> {
    pub(crate) fn new(check: &'a Check, recursion_limit: u32) -> Self {
        let assertions = check
            .assertions
            .iter()
            .enumerate()
            .map(|(index, assertion)| AssertionSpec {
                name: check.assertion_label(index),
                code: &assertion.code,
            })
            .collect();
        Self {
            name: check.name.as_deref(),
            require_docstring: check.require_docstring,
            signature: check.signature.as_ref(),
            tokens_required: &check.tokens_required,
            tokens_forbidden: &check.tokens_forbidden,
            scoring: check.scoring,
            assertions,
            recursion_limit,
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Classification reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    /// Every assertion passed.
    Success,
    /// An assertion or structural rule failed.
    AssertionFailure,
    /// The submission raised.
    RuntimeError,
    /// The submission did not compile.
    SyntaxError,
    /// The driver could not load the check.
    InternalError,
}

impl From<ReportOutcome> for Outcome {
    fn from(outcome: ReportOutcome) -> Self {
        match outcome {
            ReportOutcome::Success => Outcome::Success,
            ReportOutcome::AssertionFailure => Outcome::AssertionFailure,
            ReportOutcome::RuntimeError => Outcome::RuntimeError,
            ReportOutcome::SyntaxError => Outcome::SyntaxError,
            ReportOutcome::InternalError => Outcome::InternalError,
        }
    }
}

/// A verdict line emitted by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Report {
    /// Classification.
    pub outcome: ReportOutcome,
    /// Diagnostic text, empty on success.
    #[serde(default)]
    pub message: String,
    /// Assertions that passed.
    #[serde(default)]
    pub passed: u32,
    /// Assertions the check defines.
    #[serde(default)]
    pub total: u32,
}

impl Report {
    /// Assertion counts, if the check defines any assertions.
    #[must_use]
    pub fn score(&self) -> Option<Score> {
        (self.total > 0).then_some(Score {
            passed: self.passed.min(self.total),
            total: self.total,
        })
    }
}

/// Find the verdict in the driver's report stream.
///
/// Only lines starting with `nonce` followed by a space count. If several
/// lines match, the last one wins. Lines that fail to parse are ignored.
#[must_use]
pub fn parse_report(stream: &[u8], nonce: &str) -> Option<Report> {
    let text = String::from_utf8_lossy(stream);
    text.lines().rev().find_map(|line| {
        let payload = line.strip_prefix(nonce)?.strip_prefix(' ')?;
        match serde_json::from_str::<Report>(payload) {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed harness report");
                None
            }
        }
    })
}
