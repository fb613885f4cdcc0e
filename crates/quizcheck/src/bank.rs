//! Test bank loading.
//!
//! A [`TestBank`] is a list of search paths. Loading it reads every check
//! definition file and produces an immutable [`CheckSet`], the snapshot type
//! the [`CheckRegistry`](crate::CheckRegistry) serves lookups from.
//!
//! ## File format
//!
//! ```json
//! {
//!   "checks": [
//!     {
//!       "id": "add_ok",
//!       "name": "add",
//!       "assertions": [{"name": "adds", "code": "assert add(2, 3) == 5"}]
//!     }
//!   ],
//!   "groups": [{"id": "@adders", "checks": ["add_ok"]}]
//! }
//! ```
//!
//! Both keys are optional. A group may name checks from any file of the bank.
//! A directory path contributes every `*.json` file directly inside it, in
//! file-name order. A file path contributes that file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::check::{Check, CheckGroup};
use crate::error::Error;

/// File extension for test bank files.
const BANK_EXTENSION: &str = "json";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BankFile {
    #[serde(default)]
    checks: Vec<Check>,
    #[serde(default)]
    groups: Vec<CheckGroup>,
}

/// A set of paths check definitions are loaded from.
#[derive(Debug, Clone, Default)]
pub struct TestBank {
    paths: Vec<PathBuf>,
}

impl TestBank {
    /// Create an empty test bank.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a search path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingPath`] if the path does not exist.
    pub fn add_path(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingPath(path.to_path_buf()));
        }
        let path = std::path::absolute(path)?;
        tracing::info!(path = %path.display(), "Adding test bank search path");
        self.paths.push(path);
        Ok(())
    }

    /// The configured search paths.
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Every bank file under the configured paths, in load order.
    ///
    /// # Errors
    ///
    /// Returns an error if a path has disappeared or a directory cannot be read.
    pub fn files(&self) -> Result<Vec<PathBuf>, Error> {
        let mut files = Vec::new();
        for path in &self.paths {
            if path.is_file() {
                files.push(path.clone());
                continue;
            }
            if !path.is_dir() {
                return Err(Error::MissingPath(path.clone()));
            }

            let mut found = Vec::new();
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                let file = entry.path();
                if file.is_file()
                    && file.extension().and_then(|e| e.to_str()) == Some(BANK_EXTENSION)
                {
                    found.push(file);
                }
            }
            found.sort();
            files.extend(found);
        }
        Ok(files)
    }

    /// Load every check in the bank.
    ///
    /// # Errors
    ///
    /// Fails as a whole if any file is unreadable or malformed, any check is
    /// invalid, an id is defined twice, or a group names an unknown check.
    pub fn load(&self) -> Result<CheckSet, Error> {
        let mut builder = CheckSetBuilder::default();
        for file in self.files()? {
            let bytes = std::fs::read(&file)?;
            let parsed: BankFile =
                serde_json::from_slice(&bytes).map_err(|source| Error::BankParse {
                    path: file.clone(),
                    source,
                })?;
            builder.hasher.update(&bytes);
            for check in parsed.checks {
                tracing::debug!(file = %file.display(), id = %check.id, "Found check");
                builder.insert(check, &file)?;
            }
            for group in parsed.groups {
                tracing::debug!(file = %file.display(), id = %group.id, "Found check group");
                builder.pending.push((group, file.clone()));
            }
            tracing::info!(file = %file.display(), "Loaded test bank file");
        }
        builder.resolve_groups()?;
        let set = builder.finish();
        tracing::info!(
            checks = set.len(),
            groups = set.group_order.len(),
            digest = %set.digest(),
            "Loaded test bank"
        );
        Ok(set)
    }
}

#[derive(Default)]
struct CheckSetBuilder {
    by_id: HashMap<String, Arc<Check>>,
    checks: Vec<Arc<Check>>,
    pending: Vec<(CheckGroup, PathBuf)>,
    groups: HashMap<String, Arc<CheckGroup>>,
    group_order: Vec<Arc<CheckGroup>>,
    hasher: Sha256,
}

impl CheckSetBuilder {
    fn insert(&mut self, check: Check, origin: &Path) -> Result<(), Error> {
        check.validate()?;
        if let Some(id) = check.ids().find(|id| self.by_id.contains_key(*id)) {
            return Err(Error::DuplicateCheck {
                id: id.to_string(),
                path: origin.to_path_buf(),
            });
        }
        let check = Arc::new(check);
        let mut seen = Vec::new();
        for id in check.ids() {
            if seen.contains(&id) {
                return Err(Error::DuplicateCheck {
                    id: id.to_string(),
                    path: origin.to_path_buf(),
                });
            }
            seen.push(id);
        }
        for id in seen {
            self.by_id.insert(id.to_string(), Arc::clone(&check));
        }
        self.checks.push(check);
        Ok(())
    }

    /// Register pending groups once every check is known.
    fn resolve_groups(&mut self) -> Result<(), Error> {
        for (group, origin) in std::mem::take(&mut self.pending) {
            group.validate()?;
            if self.by_id.contains_key(&group.id) || self.groups.contains_key(&group.id) {
                return Err(Error::DuplicateCheck {
                    id: group.id,
                    path: origin,
                });
            }
            if let Some(member) = group.checks.iter().find(|m| !self.by_id.contains_key(*m)) {
                return Err(Error::InvalidCheck {
                    reason: format!("group member {member:?} is not a registered check"),
                    id: group.id,
                });
            }
            let group = Arc::new(group);
            self.groups.insert(group.id.clone(), Arc::clone(&group));
            self.group_order.push(group);
        }
        Ok(())
    }

    fn finish(self) -> CheckSet {
        CheckSet {
            by_id: self.by_id,
            checks: self.checks,
            groups: self.groups,
            group_order: self.group_order,
            digest: hex::encode(self.hasher.finalize()),
        }
    }
}

/// An immutable snapshot of loaded checks.
#[derive(Debug, Clone)]
pub struct CheckSet {
    by_id: HashMap<String, Arc<Check>>,
    checks: Vec<Arc<Check>>,
    groups: HashMap<String, Arc<CheckGroup>>,
    group_order: Vec<Arc<CheckGroup>>,
    digest: String,
}

impl Default for CheckSet {
    fn default() -> Self {
        CheckSetBuilder::default().finish()
    }
}

impl CheckSet {
    /// Build a snapshot from in-memory checks.
    ///
    /// # Errors
    ///
    /// Returns an error if a check is invalid or an id is defined twice.
    pub fn from_checks(checks: impl IntoIterator<Item = Check>) -> Result<Self, Error> {
        Self::from_parts(checks, [])
    }

    /// Build a snapshot from in-memory checks and groups.
    ///
    /// # Errors
    ///
    /// Returns an error if a check or group is invalid, an id is defined
    /// twice, or a group names an unknown check.
    pub fn from_parts(
        checks: impl IntoIterator<Item = Check>,
        groups: impl IntoIterator<Item = CheckGroup>,
    ) -> Result<Self, Error> {
        let mut builder = CheckSetBuilder::default();
        let origin = Path::new("<memory>");
        for check in checks {
            builder
                .hasher
                .update(serde_json::to_vec(&check).map_err(|e| Error::InvalidCheck {
                    id: check.id.clone(),
                    reason: e.to_string(),
                })?);
            builder.insert(check, origin)?;
        }
        for group in groups {
            builder
                .hasher
                .update(serde_json::to_vec(&group).map_err(|e| Error::InvalidCheck {
                    id: group.id.clone(),
                    reason: e.to_string(),
                })?);
            builder.pending.push((group, origin.to_path_buf()));
        }
        builder.resolve_groups()?;
        Ok(builder.finish())
    }

    /// Find a check by id or alias.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Check>> {
        self.by_id.get(id)
    }

    /// Find a group by id.
    #[must_use]
    pub fn group(&self, id: &str) -> Option<&Arc<CheckGroup>> {
        self.groups.get(id)
    }

    /// Groups in load order.
    pub fn groups(&self) -> impl Iterator<Item = &Arc<CheckGroup>> {
        self.group_order.iter()
    }

    /// Number of distinct checks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether the set holds no checks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Checks in load order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Check>> {
        self.checks.iter()
    }

    /// SHA-256 over the loaded definitions, hex encoded.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const BASICS: &str = r#"{
        "checks": [
            {"id": "add_ok", "aliases": ["@Add"], "name": "add",
             "assertions": [{"name": "adds", "code": "assert add(2, 3) == 5"}]},
            {"id": "loop", "assertions": [{"code": "assert True"}], "timeout_ms": 2000}
        ]
    }"#;

    fn bank_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, body) in files {
            std::fs::write(dir.path().join(name), body).expect("write bank file");
        }
        dir
    }

    #[test]
    fn add_path_rejects_missing_paths() {
        let mut bank = TestBank::new();
        let err = bank.add_path("/nonexistent/quizcheck-bank").unwrap_err();
        assert!(matches!(err, Error::MissingPath(_)));
    }

    #[test]
    fn loads_directory_of_json_files() {
        let dir = bank_dir(&[("basics.json", BASICS), ("notes.txt", "ignored")]);
        let mut bank = TestBank::new();
        bank.add_path(dir.path()).unwrap();

        let set = bank.load().unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get("add_ok").is_some());
        assert!(Arc::ptr_eq(
            set.get("@Add").unwrap(),
            set.get("add_ok").unwrap()
        ));
        assert_eq!(set.digest().len(), 64);
    }

    #[test]
    fn loads_single_file_path() {
        let dir = bank_dir(&[("basics.json", BASICS)]);
        let mut bank = TestBank::new();
        bank.add_path(dir.path().join("basics.json")).unwrap();
        assert_eq!(bank.load().unwrap().len(), 2);
    }

    #[test]
    fn duplicate_ids_across_files_fail() {
        let dir = bank_dir(&[("a.json", BASICS), ("b.json", BASICS)]);
        let mut bank = TestBank::new();
        bank.add_path(dir.path()).unwrap();
        let err = bank.load().unwrap_err();
        assert!(matches!(err, Error::DuplicateCheck { .. }), "{err}");
    }

    #[test]
    fn alias_equal_to_own_id_fails() {
        let mut check = Check::new("x").with_name("x");
        check.aliases.push("x".into());
        assert!(CheckSet::from_checks([check]).is_err());
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = bank_dir(&[("broken.json", "{\"checks\": [")]);
        let mut bank = TestBank::new();
        bank.add_path(dir.path()).unwrap();
        let err = bank.load().unwrap_err();
        assert!(err.to_string().contains("broken.json"), "{err}");
    }

    const GROUPS: &str = r#"{
        "groups": [{"id": "@adders", "description": "Variants of add", "checks": ["add_ok", "loop"]}]
    }"#;

    #[test]
    fn groups_resolve_across_files() {
        let dir = bank_dir(&[("a_groups.json", GROUPS), ("b_basics.json", BASICS)]);
        let mut bank = TestBank::new();
        bank.add_path(dir.path()).unwrap();

        let set = bank.load().unwrap();
        let group = set.group("@adders").unwrap();
        assert_eq!(group.checks, ["add_ok", "loop"]);
        assert_eq!(set.groups().count(), 1);
        assert!(set.get("@adders").is_none());
    }

    #[test]
    fn group_with_unknown_member_fails() {
        let err = CheckSet::from_parts(
            [Check::new("a").with_name("f")],
            [CheckGroup::new("@g", ["a", "b"])],
        )
        .unwrap_err();
        assert!(err.to_string().contains("\"b\""), "{err}");
    }

    #[test]
    fn group_id_cannot_shadow_a_check() {
        let err = CheckSet::from_parts(
            [Check::new("a").with_name("f")],
            [CheckGroup::new("a", ["a"])],
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateCheck { .. }), "{err}");
    }

    #[test]
    fn assertion_typos_fail_the_load() {
        let dir = bank_dir(&[(
            "typo.json",
            r#"{"checks": [{"id": "x", "assertions": [{"nmae": "t", "code": "assert True"}]}]}"#,
        )]);
        let mut bank = TestBank::new();
        bank.add_path(dir.path()).unwrap();
        let err = bank.load().unwrap_err();
        assert!(matches!(err, Error::BankParse { .. }), "{err}");
    }

    #[test]
    fn digest_changes_with_content() {
        let a = CheckSet::from_checks([Check::new("a").with_name("f")]).unwrap();
        let b = CheckSet::from_checks([Check::new("a").with_name("g")]).unwrap();
        assert_ne!(a.digest(), b.digest());
    }
}
