use crate::config::{Action, MatchType, Rule, RuleSet};
use crate::filter::compile_prefix_pattern;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to access rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Rule file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Rule already exists: {match_type} '{pattern}'")]
    DuplicateRule { pattern: String, match_type: MatchType },

    #[error("Please enter an email, domain or regex pattern")]
    EmptyPattern,

    #[error("Invalid regex pattern '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("No rule with id '{0}'")]
    RuleNotFound(String),

    #[error("Id prefix '{0}' matches more than one rule")]
    AmbiguousId(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The persisted rule list.
///
/// Every operation reloads the file, so edits made by other processes are
/// picked up. Mutations are load, modify, save; concurrent writers race and
/// the last one wins.
#[derive(Debug, Clone)]
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RuleStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the rule set. A missing file yields an empty set that keeps
    /// everything. Loading never writes the file.
    ///
    /// Rules stored without an id get one derived from their match type and
    /// pattern, so every read of the same file hands out the same ids. The
    /// next mutation persists them.
    pub fn load(&self) -> Result<RuleSet> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Rule file {} not found, using empty rule set", self.path.display());
                return Ok(RuleSet::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut rule_set: RuleSet =
            serde_json::from_str(&content).map_err(|source| StoreError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        let assigned = assign_missing_ids(&mut rule_set);
        if assigned > 0 {
            log::debug!(
                "Derived ids for {assigned} rule(s) in {}",
                self.path.display()
            );
        }

        Ok(rule_set)
    }

    /// Write the rule set through a temporary file in the same directory and
    /// rename it into place, so readers never see a partial file.
    pub fn save(&self, rule_set: &RuleSet) -> Result<()> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let json = rule_set.to_json().map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rules.json".to_string());
        let tmp_path = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));

        let write_tmp = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &self.path)
        };
        if let Err(e) = write_tmp() {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(io_err(e));
        }

        log::debug!(
            "Saved {} rule(s) to {}",
            rule_set.rules.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn add_rule(&self, pattern: &str, match_type: MatchType, action: Action) -> Result<Rule> {
        let pattern = validate_pattern(pattern, match_type)?;
        let mut rule_set = self.load()?;

        if rule_set.rules.iter().any(|r| r.same_key(&pattern, match_type)) {
            return Err(StoreError::DuplicateRule {
                pattern,
                match_type,
            });
        }

        let rule = Rule::new(pattern, match_type, action);
        rule_set.rules.push(rule.clone());
        self.save(&rule_set)?;
        log::info!("Added rule {}: {} '{}' -> {}", rule.short_id(), match_type, rule.pattern, action);
        Ok(rule)
    }

    /// Replace a rule's fields in place, keeping its id and position.
    pub fn update_rule(
        &self,
        id: &str,
        pattern: &str,
        match_type: MatchType,
        action: Action,
    ) -> Result<Rule> {
        let pattern = validate_pattern(pattern, match_type)?;
        let mut rule_set = self.load()?;
        let index = resolve(&rule_set, id)?;
        let target = rule_set.rules[index].id;

        if rule_set
            .rules
            .iter()
            .any(|r| r.id != target && r.same_key(&pattern, match_type))
        {
            return Err(StoreError::DuplicateRule {
                pattern,
                match_type,
            });
        }

        let rule = &mut rule_set.rules[index];
        rule.pattern = pattern;
        rule.match_type = match_type;
        rule.action = action;
        let updated = rule.clone();

        self.save(&rule_set)?;
        log::info!("Updated rule {}", updated.short_id());
        Ok(updated)
    }

    /// Delete every rule named in `ids`. Either all are deleted or none.
    pub fn delete_rules<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<Rule>> {
        let mut rule_set = self.load()?;

        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let index = resolve(&rule_set, id.as_ref())?;
            targets.push(rule_set.rules[index].id);
        }

        let (removed, kept): (Vec<Rule>, Vec<Rule>) = rule_set
            .rules
            .into_iter()
            .partition(|r| targets.contains(&r.id));
        rule_set.rules = kept;

        self.save(&rule_set)?;
        for rule in &removed {
            log::info!("Deleted rule {}: {} '{}'", rule.short_id(), rule.match_type, rule.pattern);
        }
        Ok(removed)
    }

    /// Move a rule to `position` (zero-based, clamped to the end of the list).
    pub fn move_rule(&self, id: &str, position: usize) -> Result<Rule> {
        let mut rule_set = self.load()?;
        let index = resolve(&rule_set, id)?;

        let rule = rule_set.rules.remove(index);
        let position = position.min(rule_set.rules.len());
        rule_set.rules.insert(position, rule.clone());

        self.save(&rule_set)?;
        log::info!("Moved rule {} to position {position}", rule.short_id());
        Ok(rule)
    }

    pub fn set_default_action(&self, action: Action) -> Result<()> {
        let mut rule_set = self.load()?;
        rule_set.default_action = action;
        self.save(&rule_set)?;
        log::info!("Default action set to {action}");
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<Rule> {
        let rule_set = self.load()?;
        let index = resolve(&rule_set, id)?;
        Ok(rule_set.rules[index].clone())
    }
}

/// Give every nil-id rule a name-based id over `match_type:pattern`. Repeats
/// of the same key get an occurrence suffix so ids stay unique.
fn assign_missing_ids(rule_set: &mut RuleSet) -> usize {
    let mut seen: HashMap<(MatchType, String), usize> = HashMap::new();
    let mut assigned = 0;
    for rule in rule_set.rules.iter_mut() {
        let occurrence = seen.entry((rule.match_type, rule.pattern.clone())).or_insert(0);
        if rule.id.is_nil() {
            let mut name = format!("{}:{}", rule.match_type, rule.pattern);
            if *occurrence > 0 {
                name.push_str(&format!("#{occurrence}"));
            }
            rule.id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
            assigned += 1;
        }
        *occurrence += 1;
    }
    assigned
}

fn validate_pattern(pattern: &str, match_type: MatchType) -> Result<String> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(StoreError::EmptyPattern);
    }
    if match_type == MatchType::Regex {
        compile_prefix_pattern(pattern).map_err(|e| StoreError::InvalidRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(pattern.to_string())
}

/// Find a rule by full id or unique id prefix (hyphens optional).
fn resolve(rule_set: &RuleSet, id: &str) -> Result<usize> {
    let needle: String = id.trim().to_lowercase().replace('-', "");
    if needle.is_empty() {
        return Err(StoreError::RuleNotFound(id.to_string()));
    }

    let mut found = rule_set
        .rules
        .iter()
        .enumerate()
        .filter(|(_, r)| r.id.simple().to_string().starts_with(&needle));

    match (found.next(), found.next()) {
        (Some((index, _)), None) => Ok(index),
        (Some(_), Some(_)) => Err(StoreError::AmbiguousId(id.to_string())),
        (None, _) => Err(StoreError::RuleNotFound(id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, RuleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(dir.path().join("rules.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_empty_keep_set() {
        let (_dir, store) = store();
        let rule_set = store.load().unwrap();
        assert!(rule_set.rules.is_empty());
        assert_eq!(rule_set.default_action, Action::Keep);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "{ \"rules\": [ oops").unwrap();
        match store.load() {
            Err(StoreError::Malformed { .. }) => {}
            other => panic!("Expected malformed error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        let (_dir, store) = store();
        std::fs::write(
            store.path(),
            r#"{"rules": [{"pattern": "a@b.com", "action": "keep"}]}"#,
        )
        .unwrap();
        assert!(matches!(store.load(), Err(StoreError::Malformed { .. })));
    }

    #[test]
    fn test_add_then_reload() {
        let (_dir, store) = store();
        let rule = store
            .add_rule("  a@b.com ", MatchType::Exact, Action::Archive)
            .unwrap();
        assert_eq!(rule.pattern, "a@b.com");

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.rules, vec![rule]);
    }

    #[test]
    fn test_duplicate_rule_is_rejected() {
        let (_dir, store) = store();
        store.add_rule("a@b.com", MatchType::Exact, Action::Archive).unwrap();

        let err = store
            .add_rule("a@b.com", MatchType::Exact, Action::Delete)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRule { .. }));

        let rules = store.load().unwrap().rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, Action::Archive);
    }

    #[test]
    fn test_same_pattern_different_match_type_is_allowed() {
        let (_dir, store) = store();
        store.add_rule("b.com", MatchType::Domain, Action::Archive).unwrap();
        store.add_rule("b.com", MatchType::Regex, Action::Delete).unwrap();
        assert_eq!(store.load().unwrap().rules.len(), 2);
    }

    #[test]
    fn test_empty_pattern_and_bad_regex_are_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.add_rule("   ", MatchType::Exact, Action::Keep),
            Err(StoreError::EmptyPattern)
        ));
        assert!(matches!(
            store.add_rule("(oops", MatchType::Regex, Action::Keep),
            Err(StoreError::InvalidRegex { .. })
        ));
        assert!(!store.path().exists());
    }

    const LEGACY_RULES: &str = r#"{
        "rules": [
            {"pattern": "a@b.com", "match_type": "exact", "action": "delete"},
            {"pattern": "c.com", "match_type": "domain", "action": "archive"}
        ],
        "default_action": "archive"
    }"#;

    #[test]
    fn test_missing_rules_list_is_malformed() {
        let (_dir, store) = store();
        std::fs::write(
            store.path(),
            r#"{"rule": [{"pattern": "boss@work.com", "match_type": "exact", "action": "keep"}], "default_action": "delete"}"#,
        )
        .unwrap();
        assert!(matches!(store.load(), Err(StoreError::Malformed { .. })));
    }

    #[test]
    fn test_legacy_file_gets_stable_ids() {
        let (_dir, store) = store();
        std::fs::write(store.path(), LEGACY_RULES).unwrap();

        let first = store.load().unwrap();
        assert!(first.rules.iter().all(|r| !r.id.is_nil()));
        assert_ne!(first.rules[0].id, first.rules[1].id);
        let second = store.load().unwrap();
        assert_eq!(first, second);
        assert_eq!(second.default_action, Action::Archive);
    }

    #[test]
    fn test_load_does_not_rewrite_file() {
        let (_dir, store) = store();
        std::fs::write(store.path(), LEGACY_RULES).unwrap();

        store.load().unwrap();
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), LEGACY_RULES);
    }

    #[test]
    fn test_legacy_ids_are_persisted_by_mutation() {
        let (_dir, store) = store();
        std::fs::write(store.path(), LEGACY_RULES).unwrap();
        let listed = store.load().unwrap();

        // An id shown by a read addresses the same rule in a later write.
        store.delete_rules(&[listed.rules[1].short_id()]).unwrap();
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains(&listed.rules[0].id.to_string()));
        assert_eq!(store.load().unwrap().rules, vec![listed.rules[0].clone()]);
    }

    #[test]
    fn test_repeated_legacy_keys_get_distinct_ids() {
        let mut rule_set = RuleSet::default();
        for _ in 0..2 {
            let mut rule = Rule::new("a@b.com", MatchType::Exact, Action::Keep);
            rule.id = Uuid::nil();
            rule_set.rules.push(rule);
        }
        assert_eq!(assign_missing_ids(&mut rule_set), 2);
        assert_ne!(rule_set.rules[0].id, rule_set.rules[1].id);
    }

    #[test]
    fn test_update_keeps_id_and_position() {
        let (_dir, store) = store();
        let first = store.add_rule("a@b.com", MatchType::Exact, Action::Keep).unwrap();
        store.add_rule("c.com", MatchType::Domain, Action::Delete).unwrap();

        let updated = store
            .update_rule(&first.short_id(), "x.com", MatchType::Domain, Action::Archive)
            .unwrap();
        assert_eq!(updated.id, first.id);

        let rules = store.load().unwrap().rules;
        assert_eq!(rules[0].id, first.id);
        assert_eq!(rules[0].pattern, "x.com");
        assert_eq!(rules[0].action, Action::Archive);
    }

    #[test]
    fn test_update_into_duplicate_is_rejected() {
        let (_dir, store) = store();
        let first = store.add_rule("a@b.com", MatchType::Exact, Action::Keep).unwrap();
        store.add_rule("c.com", MatchType::Domain, Action::Delete).unwrap();

        let err = store
            .update_rule(&first.id.to_string(), "c.com", MatchType::Domain, Action::Keep)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRule { .. }));

        // Re-saving a rule under its own key is fine.
        store
            .update_rule(&first.id.to_string(), "a@b.com", MatchType::Exact, Action::Delete)
            .unwrap();
    }

    #[test]
    fn test_delete_by_id() {
        let (_dir, store) = store();
        let a = store.add_rule("a@b.com", MatchType::Exact, Action::Keep).unwrap();
        let b = store.add_rule("c.com", MatchType::Domain, Action::Delete).unwrap();
        let c = store.add_rule("spam", MatchType::Regex, Action::MoveToSpam).unwrap();

        let removed = store
            .delete_rules(&[a.short_id(), c.id.to_string()])
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.load().unwrap().rules, vec![b]);
    }

    #[test]
    fn test_delete_unknown_id_deletes_nothing() {
        let (_dir, store) = store();
        let a = store.add_rule("a@b.com", MatchType::Exact, Action::Keep).unwrap();

        let err = store
            .delete_rules(&[a.short_id(), "ffffffff-not-there".to_string()])
            .unwrap_err();
        assert!(matches!(err, StoreError::RuleNotFound(_)));
        assert_eq!(store.load().unwrap().rules.len(), 1);
    }

    #[test]
    fn test_ids_survive_external_reorder() {
        let (_dir, store) = store();
        let a = store.add_rule("a@b.com", MatchType::Exact, Action::Keep).unwrap();
        let b = store.add_rule("c.com", MatchType::Domain, Action::Delete).unwrap();

        // Another process reverses the list between listing and deleting.
        let mut rule_set = store.load().unwrap();
        rule_set.rules.reverse();
        store.save(&rule_set).unwrap();

        store.delete_rules(&[a.short_id()]).unwrap();
        assert_eq!(store.load().unwrap().rules, vec![b]);
    }

    #[test]
    fn test_move_rule() {
        let (_dir, store) = store();
        let a = store.add_rule("a@b.com", MatchType::Exact, Action::Keep).unwrap();
        let b = store.add_rule("c.com", MatchType::Domain, Action::Delete).unwrap();
        let c = store.add_rule("spam", MatchType::Regex, Action::MoveToSpam).unwrap();

        store.move_rule(&c.short_id(), 0).unwrap();
        let order: Vec<Uuid> = store.load().unwrap().rules.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![c.id, a.id, b.id]);

        store.move_rule(&c.short_id(), 99).unwrap();
        let order: Vec<Uuid> = store.load().unwrap().rules.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_set_default_action() {
        let (_dir, store) = store();
        store.set_default_action(Action::Archive).unwrap();
        assert_eq!(store.load().unwrap().default_action, Action::Archive);
    }

    #[test]
    fn test_resolve_rejects_empty_and_ambiguous() {
        let mut rule_set = RuleSet::default();
        let mut a = Rule::new("a", MatchType::Exact, Action::Keep);
        let mut b = Rule::new("b", MatchType::Exact, Action::Keep);
        a.id = Uuid::parse_str("abcd0000-0000-4000-8000-000000000001").unwrap();
        b.id = Uuid::parse_str("abcd0000-0000-4000-8000-000000000002").unwrap();
        rule_set.rules = vec![a, b];

        assert!(matches!(resolve(&rule_set, ""), Err(StoreError::RuleNotFound(_))));
        assert!(matches!(resolve(&rule_set, "abcd"), Err(StoreError::AmbiguousId(_))));
        assert_eq!(
            resolve(&rule_set, "ABCD0000-0000-4000-8000-000000000002").unwrap(),
            1
        );
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let (dir, store) = store();
        store.add_rule("a@b.com", MatchType::Exact, Action::Keep).unwrap();
        store.add_rule("c.com", MatchType::Domain, Action::Keep).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["rules.json".to_string()]);
    }
}
