//! Policy records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// How a policy's tags are compared with a node's tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Every policy tag must be present on the node.
    #[default]
    And,
    /// At least one policy tag must be present on the node.
    Or,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "and"),
            Self::Or => write!(f, "or"),
        }
    }
}

/// A tag-matching rule that binds nodes to a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Identifier.
    pub uuid: String,
    /// Human-readable label.
    pub label: String,
    /// Tags a node must carry.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Tag comparison mode.
    #[serde(default)]
    pub match_using: MatchMode,
    /// Disabled policies never match.
    pub enabled: bool,
    /// The catch-all policy pinned to the end of the table.
    #[serde(default)]
    pub is_default: bool,
    /// Maximum concurrent bindings; 0 means unlimited.
    #[serde(default)]
    pub maximum: u32,
    /// Current number of bindings.
    #[serde(default)]
    pub bind_count: u32,
    /// Monotonic sequence handed to each new binding (hostname suffix).
    #[serde(default)]
    pub bind_sequence: u64,
    /// Position in the policy table, refreshed on every read.
    #[serde(default)]
    pub line_number: usize,
    /// Model this policy provisions.
    pub model_id: String,
    /// Optional broker handoff target.
    #[serde(default)]
    pub broker: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Store version.
    #[serde(default)]
    pub version: u64,
}

impl Policy {
    /// A new, disabled, non-default policy for `model_id`.
    #[must_use]
    pub fn new(label: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            label: label.into(),
            tags: Vec::new(),
            match_using: MatchMode::And,
            enabled: false,
            is_default: false,
            maximum: 0,
            bind_count: 0,
            bind_sequence: 0,
            line_number: 0,
            model_id: model_id.into(),
            broker: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    /// Set tags and match mode.
    #[must_use]
    pub fn with_tags<S: Into<String>>(
        mut self,
        tags: impl IntoIterator<Item = S>,
        mode: MatchMode,
    ) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.match_using = mode;
        self
    }

    /// Set the enabled flag.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the bind maximum.
    #[must_use]
    pub fn with_maximum(mut self, maximum: u32) -> Self {
        self.maximum = maximum;
        self
    }

    /// Mark as the default policy.
    #[must_use]
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self.enabled = true;
        self
    }

    /// Attach a broker.
    #[must_use]
    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = Some(broker.into());
        self
    }

    /// Whether another binding is allowed.
    #[must_use]
    pub fn is_under_maximum(&self) -> bool {
        self.maximum == 0 || self.bind_count < self.maximum
    }
}

/// Split a tag expression into tags and a match mode.
///
/// `a,b` matches with `and`, `a|b` with `or`. Mixing separators is an
/// input error; a single tag matches with `and`.
///
/// # Errors
/// Returns [`EngineError::Input`] on mixed separators or when no tag remains.
pub fn parse_tag_expression(expr: &str) -> EngineResult<(Vec<String>, MatchMode)> {
    let has_comma = expr.contains(',');
    let has_pipe = expr.contains('|');
    if has_comma && has_pipe {
        return Err(EngineError::Input(
            "mixing ',' and '|' separators in a tag expression is not supported".into(),
        ));
    }

    let (separator, mode) = if has_pipe {
        ('|', MatchMode::Or)
    } else {
        (',', MatchMode::And)
    };

    let tags: Vec<String> = expr
        .split(separator)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    if tags.is_empty() {
        return Err(EngineError::Input("tag expression contains no tags".into()));
    }
    Ok((tags, mode))
}
