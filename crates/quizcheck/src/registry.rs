//! Check registry: the process-wide table of checks.
//!
//! The [`CheckRegistry`] serves lookups from an immutable [`CheckSet`]
//! snapshot. A reload builds a complete new snapshot off to the side and
//! swaps a single `Arc` under a short write lock, so a concurrent lookup sees
//! either the old table or the new one, never a mix of both.
//!
//! ## Example
//!
//! ```rust,no_run
//! use quizcheck::{CheckRegistry, TestBank};
//!
//! # fn main() -> Result<(), quizcheck::Error> {
//! let mut bank = TestBank::new();
//! bank.add_path("/srv/testbank")?;
//! let registry = CheckRegistry::from_bank(bank)?;
//!
//! let check = registry.lookup("add_ok")?;
//! println!("{} has {} assertions", check.id, check.assertions.len());
//!
//! // Later, e.g. on SIGHUP:
//! registry.reload()?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use crate::bank::{CheckSet, TestBank};
use crate::check::Check;
use crate::error::Error;

/// A registry of checks, safe for any number of concurrent readers.
#[derive(Debug)]
pub struct CheckRegistry {
    /// Where reloads read from. `None` for registries built in memory.
    source: Option<TestBank>,
    /// The current snapshot.
    current: RwLock<Arc<CheckSet>>,
}

impl CheckRegistry {
    /// Create a registry serving a fixed set of checks.
    #[must_use]
    pub fn new(checks: CheckSet) -> Self {
        Self {
            source: None,
            current: RwLock::new(Arc::new(checks)),
        }
    }

    /// Create a registry by loading a test bank. The bank is kept for [`reload`](Self::reload).
    ///
    /// # Errors
    ///
    /// Returns an error if the bank fails to load.
    pub fn from_bank(bank: TestBank) -> Result<Self, Error> {
        let checks = bank.load()?;
        Ok(Self {
            source: Some(bank),
            current: RwLock::new(Arc::new(checks)),
        })
    }

    /// Look up a check by id or alias.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GroupNotGradeable`] if `id` names a group, and
    /// [`Error::CheckNotFound`] if nothing is registered under it.
    pub fn lookup(&self, id: &str) -> Result<Arc<Check>, Error> {
        let checks = self.snapshot();
        if let Some(check) = checks.get(id) {
            return Ok(Arc::clone(check));
        }
        match checks.group(id) {
            Some(group) => Err(Error::GroupNotGradeable {
                id: group.id.clone(),
                checks: group.checks.clone(),
            }),
            None => Err(Error::CheckNotFound(id.to_string())),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CheckSet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of distinct checks in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the current snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Swap in a new snapshot, returning the previous one.
    pub fn replace(&self, checks: CheckSet) -> Arc<CheckSet> {
        let next = Arc::new(checks);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }

    /// Reload from the test bank this registry was created from.
    ///
    /// On failure the current snapshot stays in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry has no bank or the bank fails to load.
    pub fn reload(&self) -> Result<Arc<CheckSet>, Error> {
        let Some(bank) = &self.source else {
            return Err(Error::NoTestBank);
        };

        let checks = bank.load()?;
        let previous = self.replace(checks);
        let current = self.snapshot();
        if previous.digest() == current.digest() {
            tracing::info!(checks = current.len(), "Test bank reloaded, unchanged");
        } else {
            tracing::info!(
                checks = current.len(),
                previous = previous.len(),
                digest = %current.digest(),
                "Test bank reloaded"
            );
        }
        Ok(current)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> CheckSet {
        CheckSet::from_checks(ids.iter().map(|id| Check::new(*id).with_name("f"))).unwrap()
    }

    #[test]
    fn lookup_unknown_id_is_not_found() {
        let registry = CheckRegistry::new(set(&["a"]));
        assert!(registry.lookup("a").is_ok());
        assert!(matches!(
            registry.lookup("missing"),
            Err(Error::CheckNotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn lookup_of_group_lists_members() {
        let checks = CheckSet::from_parts(
            [Check::new("v1").with_name("f"), Check::new("v2").with_name("f")],
            [crate::check::CheckGroup::new("@variants", ["v1", "v2"])],
        )
        .unwrap();
        let registry = CheckRegistry::new(checks);
        match registry.lookup("@variants") {
            Err(Error::GroupNotGradeable { id, checks }) => {
                assert_eq!(id, "@variants");
                assert_eq!(checks, ["v1", "v2"]);
            }
            other => panic!("expected a group error, got {other:?}"),
        }
    }

    #[test]
    fn replace_swaps_whole_snapshot() {
        let registry = CheckRegistry::new(set(&["a", "b"]));
        let before = registry.snapshot();

        let previous = registry.replace(set(&["c"]));

        assert!(Arc::ptr_eq(&before, &previous));
        assert!(before.get("a").is_some(), "old snapshot stays intact");
        assert!(registry.lookup("a").is_err());
        assert!(registry.lookup("c").is_ok());
    }

    #[test]
    fn reload_without_bank_fails() {
        let registry = CheckRegistry::new(set(&["a"]));
        assert!(registry.reload().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("bank.json");
        std::fs::write(
            &file,
            r#"{"checks": [{"id": "a", "name": "f"}]}"#,
        )
        .unwrap();
        let mut bank = TestBank::new();
        bank.add_path(dir.path()).unwrap();
        let registry = CheckRegistry::from_bank(bank).unwrap();

        std::fs::write(&file, "not json").unwrap();
        assert!(registry.reload().is_err());
        assert!(registry.lookup("a").is_ok());

        std::fs::write(
            &file,
            r#"{"checks": [{"id": "b", "name": "f"}]}"#,
        )
        .unwrap();
        registry.reload().unwrap();
        assert!(registry.lookup("a").is_err());
        assert!(registry.lookup("b").is_ok());
    }

    #[test]
    fn concurrent_lookups_see_consistent_snapshots() {
        let registry = Arc::new(CheckRegistry::new(set(&["a1", "a2"])));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let snapshot = registry.snapshot();
                        let old = snapshot.get("a1").is_some() && snapshot.get("a2").is_some();
                        let new = snapshot.get("b1").is_some() && snapshot.get("b2").is_some();
                        assert!(old ^ new, "observed a half-updated registry");
                    }
                })
            })
            .collect();

        for i in 0..200 {
            if i % 2 == 0 {
                registry.replace(set(&["b1", "b2"]));
            } else {
                registry.replace(set(&["a1", "a2"]));
            }
        }
        for reader in readers {
            reader.join().expect("reader panicked");
        }
    }
}
