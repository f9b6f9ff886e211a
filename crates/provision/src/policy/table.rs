//! Ordered policy table.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::store::{Document, Kind};

/// Fixed key of the singleton table document.
pub const POLICY_TABLE_ID: &str = "policy_table";

/// Match precedence of policies, first entry first.
///
/// When a default policy exists it always occupies the last slot, so every
/// bound check reserves that slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Always [`POLICY_TABLE_ID`].
    pub uuid: String,
    /// Policy ids in match order.
    #[serde(default)]
    pub entries: Vec<String>,
    /// Store version.
    #[serde(default)]
    pub version: u64,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            uuid: POLICY_TABLE_ID.to_string(),
            entries: Vec::new(),
            version: 0,
        }
    }
}

impl Document for PolicyTable {
    const KIND: Kind = Kind::PolicyTable;

    fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl PolicyTable {
    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `policy_id` is in the table.
    #[must_use]
    pub fn contains(&self, policy_id: &str) -> bool {
        self.entries.iter().any(|e| e == policy_id)
    }

    /// Position of `policy_id`.
    #[must_use]
    pub fn position_of(&self, policy_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e == policy_id)
    }

    /// Insert `policy_id` at `index` (or append), or move it there when it
    /// is already present.
    ///
    /// # Errors
    /// Returns [`EngineError::Input`] when `index` is out of range.
    pub fn add_or_move(
        &mut self,
        policy_id: &str,
        index: Option<usize>,
        has_default: bool,
    ) -> EngineResult<()> {
        if self.contains(policy_id) {
            if let Some(index) = index {
                self.move_to(policy_id, index, has_default)?;
            }
            return Ok(());
        }

        match index {
            Some(index) => {
                self.check_index(index, has_default, false)?;
                self.entries.insert(index, policy_id.to_string());
            }
            None => self.entries.push(policy_id.to_string()),
        }
        Ok(())
    }

    /// Shift `policy_id` to `new_index` by adjacent swaps.
    ///
    /// Returns `false` when it is already there.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the id is not in the table and
    /// [`EngineError::Input`] when `new_index` is out of range.
    pub fn move_to(
        &mut self,
        policy_id: &str,
        new_index: usize,
        has_default: bool,
    ) -> EngineResult<bool> {
        let mut current = self.position_of(policy_id).ok_or_else(|| {
            EngineError::NotFound(format!("policy {policy_id} is not in the policy table"))
        })?;
        if current == new_index {
            return Ok(false);
        }
        self.check_index(new_index, has_default, true)?;

        while current > new_index {
            self.entries.swap(current, current - 1);
            current -= 1;
        }
        while current < new_index {
            self.entries.swap(current, current + 1);
            current += 1;
        }
        debug!(policy_id, new_index, "Moved policy");
        Ok(true)
    }

    fn check_index(&self, index: usize, has_default: bool, moving: bool) -> EngineResult<()> {
        let offset = usize::from(has_default) + usize::from(moving);
        let max = self.entries.len().checked_sub(offset);
        match max {
            Some(max) if index <= max => Ok(()),
            Some(max) if has_default => Err(EngineError::Input(format!(
                "cannot move policies below the default policy; \
                 line number must be between 0 and {max}"
            ))),
            Some(max) => Err(EngineError::Input(format!(
                "line number {index} is not valid; should be between 0 and {max}"
            ))),
            None => Err(EngineError::Input(format!(
                "line number {index} is not valid for a table of {} entries",
                self.entries.len()
            ))),
        }
    }

    /// Drop ids without a backing policy, collapse duplicates and pin the
    /// default policy to the last slot.
    ///
    /// Which occurrence of a duplicate survives is not defined. Returns
    /// whether anything changed.
    pub fn reconcile(&mut self, existing: &HashSet<String>, default_id: Option<&str>) -> bool {
        let before = self.entries.clone();

        let mut seen = HashSet::new();
        self.entries
            .retain(|id| existing.contains(id) && seen.insert(id.clone()));

        if let Some(default_id) = default_id {
            if let Some(pos) = self.position_of(default_id) {
                if pos + 1 != self.entries.len() {
                    let id = self.entries.remove(pos);
                    self.entries.push(id);
                    warn!(policy_id = default_id, "Default policy was not last, repinned");
                }
            }
        }

        self.entries != before
    }
}
