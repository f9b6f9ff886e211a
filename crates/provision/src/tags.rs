//! Tag evaluation.
//!
//! A node's tags are the tags of every rule whose matchers accept its
//! attributes, plus each of its hardware ids as a literal tag, plus the
//! tags of the system rules from configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::models::Node;
use crate::store::{Document, Kind};

/// Something that can tag a node.
pub trait TagSource {
    /// Whether the rule applies to these attributes.
    ///
    /// # Errors
    /// Returns an error when the rule itself is malformed.
    fn matches(&self, attributes: &BTreeMap<String, String>) -> EngineResult<bool>;

    /// Tag to apply to `node`.
    fn tag_for(&self, node: &Node) -> String;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Comparison a matcher performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compare {
    /// Exact string equality.
    #[default]
    Equal,
    /// Regular-expression match.
    Like,
}

/// One attribute predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMatcher {
    /// Attribute name.
    pub key: String,
    /// Comparison.
    #[serde(default)]
    pub compare: Compare,
    /// Expected value or pattern. A pattern is compiled on first use and
    /// not recompiled afterwards.
    pub value: String,
    /// Negate the result.
    #[serde(default)]
    pub inverse: bool,
    #[serde(skip)]
    pattern: PatternCache,
}

/// Compiled `like` pattern. Ignored by equality.
#[derive(Debug, Clone, Default)]
struct PatternCache(OnceLock<Result<Regex, regex::Error>>);

impl PartialEq for PatternCache {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Eq for PatternCache {}

impl TagMatcher {
    /// `key == value`.
    #[must_use]
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            compare: Compare::Equal,
            value: value.into(),
            inverse: false,
            pattern: PatternCache::default(),
        }
    }

    /// `key =~ pattern`.
    #[must_use]
    pub fn like(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            compare: Compare::Like,
            value: pattern.into(),
            inverse: false,
            pattern: PatternCache::default(),
        }
    }

    /// Negate.
    #[must_use]
    pub fn inverted(mut self) -> Self {
        self.inverse = !self.inverse;
        self
    }

    fn evaluate(&self, attributes: &BTreeMap<String, String>) -> EngineResult<bool> {
        // A missing attribute never matches, inverted or not.
        let Some(actual) = attributes.get(&self.key) else {
            return Ok(false);
        };
        let hit = match self.compare {
            Compare::Equal => actual == &self.value,
            Compare::Like => self.compiled()?.is_match(actual),
        };
        Ok(hit != self.inverse)
    }

    fn compiled(&self) -> EngineResult<&Regex> {
        self.pattern
            .0
            .get_or_init(|| Regex::new(&self.value))
            .as_ref()
            .map_err(|e| EngineError::Input(format!("invalid pattern for '{}': {e}", self.key)))
    }
}

/// Operator-defined rule producing one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRule {
    /// Identifier.
    pub uuid: String,
    /// Rule name.
    pub name: String,
    /// Tag to apply. `%key%` is replaced with the node's `key` attribute.
    pub tag: String,
    /// Every matcher must hold. A rule without matchers never applies.
    #[serde(default)]
    pub matchers: Vec<TagMatcher>,
    /// Store version.
    #[serde(default)]
    pub version: u64,
}

impl TagRule {
    /// A new rule.
    #[must_use]
    pub fn new(name: impl Into<String>, tag: impl Into<String>, matchers: Vec<TagMatcher>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            name: name.into(),
            tag: tag.into(),
            matchers,
            version: 0,
        }
    }
}

impl TagSource for TagRule {
    fn matches(&self, attributes: &BTreeMap<String, String>) -> EngineResult<bool> {
        if self.matchers.is_empty() {
            return Ok(false);
        }
        for matcher in &self.matchers {
            if !matcher.evaluate(attributes)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn tag_for(&self, node: &Node) -> String {
        let mut tag = self.tag.clone();
        for (key, value) in &node.attributes {
            let placeholder = format!("%{key}%");
            if tag.contains(&placeholder) {
                tag = tag.replace(&placeholder, value);
            }
        }
        tag
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Document for TagRule {
    const KIND: Kind = Kind::TagRule;

    fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// Compute the full tag set of `node`.
///
/// A rule that fails to evaluate is logged and contributes nothing.
#[must_use]
pub fn node_tags<R: TagSource>(node: &Node, rules: &[R], system_rules: &[R]) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    collect(node, rules, &mut tags);
    tags.extend(node.hw_ids.iter().cloned());
    collect(node, system_rules, &mut tags);
    tags
}

fn collect<R: TagSource>(node: &Node, rules: &[R], tags: &mut BTreeSet<String>) {
    for rule in rules {
        match rule.matches(&node.attributes) {
            Ok(true) => {
                let tag = rule.tag_for(node);
                if !tag.is_empty() {
                    tags.insert(tag);
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    rule = rule.name(),
                    node_id = %node.uuid,
                    error = %e,
                    "Tag rule failed, skipping"
                );
            }
        }
    }
}
