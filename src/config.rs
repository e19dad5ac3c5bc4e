use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub default_action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Stable identifier. Rule files written before ids existed deserialize
    /// to the nil id, which the store replaces with one derived from the key.
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    pub pattern: String,
    pub match_type: MatchType,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Domain,
    Regex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Keep,
    Delete,
    Archive,
    MoveToSpam,
}

impl Default for RuleSet {
    fn default() -> Self {
        RuleSet {
            rules: Vec::new(),
            default_action: Action::Keep,
        }
    }
}

impl Rule {
    pub fn new(pattern: impl Into<String>, match_type: MatchType, action: Action) -> Self {
        Rule {
            id: Uuid::new_v4(),
            pattern: pattern.into(),
            match_type,
            action,
        }
    }

    /// First eight hex digits of the id, enough to address a rule from the CLI.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    pub fn same_key(&self, pattern: &str, match_type: MatchType) -> bool {
        self.pattern == pattern && self.match_type == match_type
    }
}

impl RuleSet {
    /// Pretty JSON with four-space indentation.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        // serde_json only ever emits valid UTF-8
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn position(&self, id: Uuid) -> Option<usize> {
        self.rules.iter().position(|r| r.id == id)
    }
}

impl MatchType {
    pub const ALL: [MatchType; 3] = [MatchType::Exact, MatchType::Domain, MatchType::Regex];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Domain => "domain",
            MatchType::Regex => "regex",
        }
    }
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::Keep,
        Action::Delete,
        Action::Archive,
        Action::MoveToSpam,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Keep => "keep",
            Action::Delete => "delete",
            Action::Archive => "archive",
            Action::MoveToSpam => "move_to_spam",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatchType::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown match type '{}' (expected exact, domain or regex)", s))
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown action '{}' (expected keep, delete, archive or move_to_spam)",
                    s
                )
            })
    }
}
