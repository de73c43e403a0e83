use super::selector::consistent_hash;
use crate::config::{GrayRuleConfig, MatchType};
use http::HeaderMap;

/// A gray rule with its match value parsed up front.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    matcher: Matcher,
    pub target_version: String,
}

#[derive(Debug, Clone)]
enum Matcher {
    UserId(String),
    UserList(Vec<String>),
    Header { name: String, value: String },
    Percentage(u32),
}

impl CompiledRule {
    pub fn compile(rule: &GrayRuleConfig) -> Result<Self, String> {
        let matcher = match rule.match_type {
            MatchType::UserId => Matcher::UserId(rule.match_value.trim().to_string()),
            MatchType::UserList => Matcher::UserList(
                rule.match_value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            MatchType::Header => Matcher::Header {
                name: rule.match_key.clone(),
                value: rule.match_value.clone(),
            },
            MatchType::Percentage => {
                let pct: u32 = rule
                    .match_value
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentage '{}'", rule.match_value))?;
                if pct > 100 {
                    return Err(format!("percentage {} out of range", pct));
                }
                Matcher::Percentage(pct)
            }
        };
        Ok(Self {
            matcher,
            target_version: rule.target_version.clone(),
        })
    }

    /// `bucket` is the caller's hash source for percentage rules: the
    /// consistent hash of the user id, or a random draw for anonymous
    /// requests.
    pub fn matches(&self, user_id: Option<&str>, headers: &HeaderMap, bucket: u32) -> bool {
        match &self.matcher {
            Matcher::UserId(id) => user_id == Some(id.as_str()),
            Matcher::UserList(ids) => user_id.is_some_and(|u| ids.iter().any(|id| id == u)),
            Matcher::Header { name, value } => headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == value),
            Matcher::Percentage(pct) => bucket % 100 < *pct,
        }
    }
}

/// Hash source shared by percentage rules and weighted selection.
pub fn user_bucket(user_id: Option<&str>) -> u32 {
    match user_id {
        Some(id) => consistent_hash(id),
        None => rand::random::<u32>(),
    }
}
