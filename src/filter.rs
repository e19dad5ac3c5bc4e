use crate::config::{Action, MatchType, Rule, RuleSet};

use regex::Regex;
use std::collections::HashMap;

/// Outcome of evaluating one sender against the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision<'a> {
    pub action: Action,
    /// The rule that fired, or `None` when the default action applied.
    pub rule: Option<&'a Rule>,
}

/// Rule set with every regex pattern compiled up front.
pub struct RuleEngine {
    rule_set: RuleSet,
    compiled_patterns: HashMap<String, Regex>,
}

/// Regex rules match from the start of the sender but not to its end.
pub fn compile_prefix_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})"))
}

fn literal_matches(rule: &Rule, sender: &str) -> bool {
    match rule.match_type {
        MatchType::Exact => sender == rule.pattern,
        // Plain suffix test: "example.com" also matches "notexample.com".
        MatchType::Domain => sender.ends_with(&rule.pattern),
        MatchType::Regex => false,
    }
}

/// Decide the action for `sender` without a prepared engine.
///
/// Regex rules are compiled on the fly; a pattern that does not compile never
/// matches.
pub fn decide(sender: &str, rule_set: &RuleSet) -> Action {
    for rule in &rule_set.rules {
        let matches = match rule.match_type {
            MatchType::Regex => match compile_prefix_pattern(&rule.pattern) {
                Ok(regex) => regex.is_match(sender),
                Err(e) => {
                    log::warn!("Skipping rule with invalid regex '{}': {e}", rule.pattern);
                    false
                }
            },
            _ => literal_matches(rule, sender),
        };
        if matches {
            return rule.action;
        }
    }
    rule_set.default_action
}

impl RuleEngine {
    pub fn new(rule_set: RuleSet) -> anyhow::Result<Self> {
        let mut engine = RuleEngine {
            rule_set,
            compiled_patterns: HashMap::new(),
        };

        engine.compile_patterns()?;
        Ok(engine)
    }

    fn compile_patterns(&mut self) -> anyhow::Result<()> {
        for rule in &self.rule_set.rules {
            if rule.match_type != MatchType::Regex
                || self.compiled_patterns.contains_key(&rule.pattern)
            {
                continue;
            }
            let regex = compile_prefix_pattern(&rule.pattern)
                .map_err(|e| anyhow::anyhow!("Invalid regex pattern '{}': {}", rule.pattern, e))?;
            self.compiled_patterns.insert(rule.pattern.clone(), regex);
        }
        Ok(())
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rule_set
    }

    fn rule_matches(&self, rule: &Rule, sender: &str) -> bool {
        match rule.match_type {
            MatchType::Regex => self
                .compiled_patterns
                .get(&rule.pattern)
                .is_some_and(|regex| regex.is_match(sender)),
            _ => literal_matches(rule, sender),
        }
    }

    pub fn evaluate(&self, sender: &str) -> Decision<'_> {
        for rule in &self.rule_set.rules {
            if self.rule_matches(rule, sender) {
                log::debug!(
                    "Rule {} ({} '{}') matched {sender}, action: {}",
                    rule.short_id(),
                    rule.match_type,
                    rule.pattern,
                    rule.action
                );
                return Decision {
                    action: rule.action,
                    rule: Some(rule),
                };
            }
        }

        log::debug!(
            "No rules matched {sender}, using default action: {}",
            self.rule_set.default_action
        );
        Decision {
            action: self.rule_set.default_action,
            rule: None,
        }
    }
}
