//! Check definitions.
//!
//! A [`Check`] is the verification routine a submission must satisfy. It is
//! declarative: the executor's harness evaluates it inside the sandbox after
//! the submission has been loaded.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How a check's assertions are scored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    /// Stop at the first failed assertion.
    #[default]
    AllOrNothing,
    /// Evaluate every assertion and report how many passed.
    Partial,
}

/// One assertion of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Assertion {
    /// Label used in failure messages. Defaults to `assertion <n>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Python code run in the submission's namespace. Raising
    /// `AssertionError` fails the assertion.
    pub code: String,
}

/// The call shape required of the function named by [`Check::name`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signature {
    /// Positional parameter names, in order. Unchecked when absent.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Builtin type every call must return, e.g. `int`, `list` or `None`.
    /// Calls made by the assertions fail when they return anything else.
    #[serde(default)]
    pub returns: Option<String>,
}

/// A named set of interchangeable checks, e.g. variants of one question.
///
/// A group id is listed and reserved like a check id, but it is not
/// gradeable: submissions name one of the member checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckGroup {
    /// Group identifier, conventionally `@`-prefixed.
    pub id: String,
    /// Free-text description, for listings.
    #[serde(default)]
    pub description: Option<String>,
    /// Ids of the member checks.
    pub checks: Vec<String>,
}

impl CheckGroup {
    /// Create a group over `checks`.
    #[must_use]
    pub fn new(id: impl Into<String>, checks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            description: None,
            checks: checks.into_iter().map(Into::into).collect(),
        }
    }

    /// Check the group on its own. Member resolution happens when the
    /// surrounding set is built.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCheck`] describing the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: String| Error::InvalidCheck {
            id: self.id.clone(),
            reason,
        };
        if !is_check_id(&self.id) {
            return Err(invalid(format!(
                "group id {:?} must be non-empty and contain no whitespace",
                self.id
            )));
        }
        if self.checks.is_empty() {
            return Err(invalid("a group needs at least one check".to_string()));
        }
        Ok(())
    }
}

/// A registered verification routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Check {
    /// Primary identifier.
    pub id: String,
    /// Additional identifiers resolving to this check.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Free-text description, for listings.
    #[serde(default)]
    pub description: Option<String>,
    /// A symbol the submission must define.
    #[serde(default)]
    pub name: Option<String>,
    /// The named symbol must be a function with a docstring.
    #[serde(default)]
    pub require_docstring: bool,
    /// The named symbol must be a function with this call shape.
    #[serde(default)]
    pub signature: Option<Signature>,
    /// AST node class names the submission must use.
    #[serde(default)]
    pub tokens_required: Vec<String>,
    /// AST node class names the submission must not use.
    #[serde(default)]
    pub tokens_forbidden: Vec<String>,
    /// Assertions evaluated in order.
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    /// Scoring mode.
    #[serde(default)]
    pub scoring: Scoring,
    /// Execution bound for this check, overriding the global default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Check {
    /// Create a check with no rules.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            aliases: Vec::new(),
            description: None,
            name: None,
            require_docstring: false,
            signature: None,
            tokens_required: Vec::new(),
            tokens_forbidden: Vec::new(),
            assertions: Vec::new(),
            scoring: Scoring::default(),
            timeout_ms: None,
        }
    }

    /// Require the submission to define `name`.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require the named function to carry a docstring.
    #[must_use]
    pub const fn require_docstring(mut self) -> Self {
        self.require_docstring = true;
        self
    }

    /// Require the named function to take exactly these positional parameters.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.signature.get_or_insert_with(Signature::default).args =
            Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Require every call of the named function to return `type_name`.
    #[must_use]
    pub fn with_returns(mut self, type_name: impl Into<String>) -> Self {
        self.signature.get_or_insert_with(Signature::default).returns = Some(type_name.into());
        self
    }

    /// Append an assertion.
    #[must_use]
    pub fn with_assertion(mut self, name: impl Into<String>, code: impl Into<String>) -> Self {
        self.assertions.push(Assertion {
            name: Some(name.into()),
            code: code.into(),
        });
        self
    }

    /// Set the scoring mode.
    #[must_use]
    pub const fn with_scoring(mut self, scoring: Scoring) -> Self {
        self.scoring = scoring;
        self
    }

    /// Set the execution bound.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Add a required AST node class.
    #[must_use]
    pub fn require_token(mut self, token: impl Into<String>) -> Self {
        self.tokens_required.push(token.into());
        self
    }

    /// Add a forbidden AST node class.
    #[must_use]
    pub fn forbid_token(mut self, token: impl Into<String>) -> Self {
        self.tokens_forbidden.push(token.into());
        self
    }

    /// The per-check execution bound, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Every id this check answers to, primary first.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Label of the assertion at `index`.
    #[must_use]
    pub fn assertion_label(&self, index: usize) -> String {
        self.assertions
            .get(index)
            .and_then(|a| a.name.clone())
            .unwrap_or_else(|| format!("assertion {}", index + 1))
    }

    /// Check the definition for problems that would make it unusable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCheck`] describing the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: String| Error::InvalidCheck {
            id: self.id.clone(),
            reason,
        };

        for id in self.ids() {
            if !is_check_id(id) {
                return Err(invalid(format!(
                    "id {id:?} must be non-empty and contain no whitespace"
                )));
            }
        }
        if let Some(name) = &self.name
            && !is_identifier(name)
        {
            return Err(invalid(format!("name {name:?} is not a Python identifier")));
        }
        if self.name.is_none() && (self.require_docstring || self.signature.is_some()) {
            return Err(invalid(
                "signature and docstring rules need a name".to_string(),
            ));
        }
        if let Some(signature) = &self.signature {
            let args = signature.args.as_deref().unwrap_or_default();
            if let Some(arg) = args.iter().find(|a| !is_identifier(a)) {
                return Err(invalid(format!("argument {arg:?} is not a Python identifier")));
            }
            if let Some((index, arg)) = args
                .iter()
                .enumerate()
                .find(|(index, arg)| args[..*index].contains(*arg))
            {
                return Err(invalid(format!("argument {arg:?} repeats at position {index}")));
            }
            if let Some(returns) = &signature.returns
                && !is_identifier(returns)
            {
                return Err(invalid(format!("return type {returns:?} is not a type name")));
            }
        }
        for token in self.tokens_required.iter().chain(&self.tokens_forbidden) {
            if !is_identifier(token) {
                return Err(invalid(format!("token {token:?} is not an AST node name")));
            }
        }
        if let Some(token) = self
            .tokens_required
            .iter()
            .find(|t| self.tokens_forbidden.contains(t))
        {
            return Err(invalid(format!(
                "token {token:?} is both required and forbidden"
            )));
        }
        if let Some(index) = self.assertions.iter().position(|a| a.code.trim().is_empty()) {
            return Err(invalid(format!(
                "{} has no code",
                self.assertion_label(index)
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(invalid("timeout_ms must be positive".to_string()));
        }
        if self.assertions.is_empty()
            && self.name.is_none()
            && self.tokens_required.is_empty()
            && self.tokens_forbidden.is_empty()
        {
            return Err(invalid(
                "a check needs at least one assertion, a name, or a token rule".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_check_id(id: &str) -> bool {
    !id.is_empty() && !id.chars().any(char::is_whitespace)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}
