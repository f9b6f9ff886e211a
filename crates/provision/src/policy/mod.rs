//! Policies: validation, ordering and bind accounting.

mod matcher;
mod table;

use std::collections::HashSet;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::{ActiveModel, MatchMode, Node, Policy};
use crate::store::Documents;
use crate::templates::Model;

pub use matcher::{default_policy, matches, tags_match};
pub use table::{PolicyTable, POLICY_TABLE_ID};

/// In-place changes to an existing policy. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdate {
    /// New label.
    pub label: Option<String>,
    /// New enabled flag.
    pub enabled: Option<bool>,
    /// New maximum.
    pub maximum: Option<u32>,
    /// New tags and match mode.
    pub tags: Option<(Vec<String>, MatchMode)>,
}

/// Owns the policy collection and the singleton policy table.
pub struct PolicyService {
    docs: Documents,
    table_lock: Mutex<()>,
    bind_lock: Mutex<()>,
}

impl PolicyService {
    /// Create a service over `docs`.
    #[must_use]
    pub fn new(docs: Documents) -> Self {
        Self {
            docs,
            table_lock: Mutex::new(()),
            bind_lock: Mutex::new(()),
        }
    }

    async fn load_table(&self) -> EngineResult<PolicyTable> {
        if let Some(table) = self.docs.get::<PolicyTable>(POLICY_TABLE_ID).await? {
            return Ok(table);
        }
        info!("Creating policy table");
        Ok(self.docs.persist(&PolicyTable::default()).await?)
    }

    /// Reconcile and persist `table`. Caller holds `table_lock`.
    async fn save_table(&self, mut table: PolicyTable) -> EngineResult<PolicyTable> {
        let policies = self.docs.all::<Policy>().await?;
        let existing: HashSet<String> = policies.iter().map(|p| p.uuid.clone()).collect();
        let default_id = policies.iter().find(|p| p.is_default).map(|p| p.uuid.as_str());
        table.reconcile(&existing, default_id);
        Ok(self.docs.persist(&table).await?)
    }

    /// Current table, reconciled against the stored policies.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn table(&self) -> EngineResult<PolicyTable> {
        let _guard = self.table_lock.lock().await;
        let mut table = self.load_table().await?;
        let policies = self.docs.all::<Policy>().await?;
        let existing: HashSet<String> = policies.iter().map(|p| p.uuid.clone()).collect();
        let default_id = policies.iter().find(|p| p.is_default).map(|p| p.uuid.as_str());
        if table.reconcile(&existing, default_id) {
            table = self.docs.persist(&table).await?;
        }
        Ok(table)
    }

    /// Policies in table order with `line_number` filled in.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn list(&self) -> EngineResult<Vec<Policy>> {
        let table = self.table().await?;
        let mut policies = self.docs.all::<Policy>().await?;
        let mut ordered = Vec::with_capacity(table.len());
        for (line, id) in table.entries.iter().enumerate() {
            if let Some(pos) = policies.iter().position(|p| &p.uuid == id) {
                let mut policy = policies.swap_remove(pos);
                policy.line_number = line;
                ordered.push(policy);
            }
        }
        Ok(ordered)
    }

    /// A policy by id.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn get(&self, policy_id: &str) -> EngineResult<Option<Policy>> {
        Ok(self.docs.get::<Policy>(policy_id).await?)
    }

    /// The default policy, if one exists.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn default_policy(&self) -> EngineResult<Option<Policy>> {
        let ordered = self.list().await?;
        Ok(default_policy(&ordered).cloned())
    }

    /// Table position of `policy_id`.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when it is not in the table.
    pub async fn position_of(&self, policy_id: &str) -> EngineResult<usize> {
        self.table()
            .await?
            .position_of(policy_id)
            .ok_or_else(|| EngineError::NotFound(format!("policy {policy_id}")))
    }

    /// Validate, store and place a new policy.
    ///
    /// Without `index` the policy is appended, or placed just before the
    /// default policy when one exists.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for a missing model,
    /// [`EngineError::Input`] for an invalid policy or index and
    /// [`EngineError::Conflict`] for a second default policy.
    pub async fn add(&self, policy: Policy, index: Option<usize>) -> EngineResult<Policy> {
        let _guard = self.table_lock.lock().await;

        let model = self
            .docs
            .get::<Model>(&policy.model_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("model {}", policy.model_id)))?;
        let current_default = self
            .docs
            .all::<Policy>()
            .await?
            .into_iter()
            .find(|p| p.is_default && p.uuid != policy.uuid);
        validate_policy(&policy, &model, index, current_default.as_ref())?;

        let mut table = self.load_table().await?;
        let index = match (index, &current_default) {
            (None, Some(_)) if !table.contains(&policy.uuid) => {
                Some(table.len().saturating_sub(1))
            }
            _ => index,
        };

        let stored = self.docs.persist(&policy).await?;
        if let Err(e) = table.add_or_move(&stored.uuid, index, current_default.is_some()) {
            if !table.contains(&stored.uuid) {
                self.docs.delete(&stored).await?;
            }
            return Err(e);
        }
        let table = self.save_table(table).await?;

        let mut stored = stored;
        stored.line_number = table.position_of(&stored.uuid).unwrap_or_default();
        info!(
            policy_id = %stored.uuid,
            label = %stored.label,
            line = stored.line_number,
            is_default = stored.is_default,
            "Added policy"
        );
        Ok(stored)
    }

    /// Change an existing policy in place.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown policy and
    /// [`EngineError::Input`] when the result would be invalid.
    pub async fn update(&self, policy_id: &str, update: PolicyUpdate) -> EngineResult<Policy> {
        let _guard = self.bind_lock.lock().await;
        let mut policy = self
            .docs
            .get::<Policy>(policy_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("policy {policy_id}")))?;

        if let Some(label) = update.label {
            policy.label = label;
        }
        if let Some(enabled) = update.enabled {
            if policy.is_default && !enabled {
                return Err(EngineError::Input("the default policy cannot be disabled".into()));
            }
            policy.enabled = enabled;
        }
        if let Some(maximum) = update.maximum {
            if policy.is_default && maximum != 0 {
                return Err(EngineError::Input(
                    "the default policy cannot have a maximum".into(),
                ));
            }
            policy.maximum = maximum;
        }
        if let Some((tags, mode)) = update.tags {
            if policy.is_default && !tags.is_empty() {
                return Err(EngineError::Input("the default policy cannot have tags".into()));
            }
            if !policy.is_default && tags.is_empty() {
                return Err(EngineError::Input("a policy requires at least one tag".into()));
            }
            policy.tags = tags;
            policy.match_using = mode;
        }

        let stored = self.docs.persist(&policy).await?;
        info!(policy_id = %stored.uuid, "Updated policy");
        Ok(stored)
    }

    /// Delete a policy that no binding references.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown policy and
    /// [`EngineError::Conflict`] while an [`ActiveModel`] references it.
    pub async fn remove(&self, policy_id: &str) -> EngineResult<Policy> {
        let _table = self.table_lock.lock().await;
        let _bind = self.bind_lock.lock().await;
        let policy = self
            .docs
            .get::<Policy>(policy_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("policy {policy_id}")))?;

        let bound = self
            .docs
            .all::<ActiveModel>()
            .await?
            .iter()
            .filter(|am| am.policy_uuid == policy.uuid)
            .count();
        if bound > 0 {
            warn!(policy_id, bound, "Refusing to remove policy with active bindings");
            return Err(EngineError::Conflict(format!(
                "policy {policy_id} is referenced by {bound} active model(s)"
            )));
        }

        self.docs.delete(&policy).await?;
        let table = self.load_table().await?;
        self.save_table(table).await?;
        info!(policy_id, "Removed policy");
        Ok(policy)
    }

    /// Move a policy within the table.
    ///
    /// # Errors
    /// Returns [`EngineError::Input`] for an out-of-range index or an attempt
    /// to move the default policy, [`EngineError::NotFound`] for an unknown
    /// policy.
    pub async fn move_to(&self, policy_id: &str, new_index: usize) -> EngineResult<bool> {
        let _guard = self.table_lock.lock().await;
        let policies = self.docs.all::<Policy>().await?;
        let policy = policies
            .iter()
            .find(|p| p.uuid == policy_id)
            .ok_or_else(|| EngineError::NotFound(format!("policy {policy_id}")))?;
        if policy.is_default {
            return Err(EngineError::Input("the default policy cannot be moved".into()));
        }
        let has_default = policies.iter().any(|p| p.is_default);

        let mut table = self.load_table().await?;
        let moved = table.move_to(policy_id, new_index, has_default)?;
        if moved {
            self.save_table(table).await?;
        }
        Ok(moved)
    }

    /// Bind `node` to `policy_id` using `model`.
    ///
    /// The slot is reserved and the [`ActiveModel`] written under the bind
    /// lock, so a concurrent [`PolicyService::remove`] either sees the
    /// binding or wins before it exists. Returns `None` when the policy is
    /// gone or at its maximum.
    ///
    /// # Errors
    /// Returns a store error; a failed binding write gives the slot back.
    pub async fn bind(
        &self,
        node: &Node,
        policy_id: &str,
        model: Model,
    ) -> EngineResult<Option<ActiveModel>> {
        let _guard = self.bind_lock.lock().await;
        let Some(mut policy) = self.docs.get::<Policy>(policy_id).await? else {
            return Ok(None);
        };
        if !policy.is_under_maximum() {
            return Ok(None);
        }
        policy.bind_count += 1;
        policy.bind_sequence += 1;
        let counter = policy.bind_sequence;
        let policy = self.docs.persist(&policy).await?;

        let active = ActiveModel::bind(node, &policy, model, counter);
        match self.docs.persist(&active).await {
            Ok(stored) => Ok(Some(stored)),
            Err(e) => {
                let mut policy = policy;
                policy.bind_count = policy.bind_count.saturating_sub(1);
                if let Err(rollback) = self.docs.persist(&policy).await {
                    warn!(policy_id, error = %rollback, "Could not give back binding slot");
                }
                Err(e.into())
            }
        }
    }

    /// Give back a binding slot.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn release_bind(&self, policy_id: &str) -> EngineResult<()> {
        let _guard = self.bind_lock.lock().await;
        if let Some(mut policy) = self.docs.get::<Policy>(policy_id).await? {
            policy.bind_count = policy.bind_count.saturating_sub(1);
            self.docs.persist(&policy).await?;
        }
        Ok(())
    }
}

fn validate_policy(
    policy: &Policy,
    model: &Model,
    index: Option<usize>,
    current_default: Option<&Policy>,
) -> EngineResult<()> {
    let no_op = model.template.is_no_op();

    if policy.is_default {
        if let Some(existing) = current_default {
            return Err(EngineError::Conflict(format!(
                "a default policy already exists ({})",
                existing.uuid
            )));
        }
        let problem = if !no_op {
            Some("the default policy must use a no-op model")
        } else if !policy.tags.is_empty() {
            Some("the default policy cannot have tags")
        } else if policy.broker.is_some() {
            Some("the default policy cannot have a broker")
        } else if index.is_some() {
            Some("the default policy is always last; no line number may be given")
        } else if !policy.enabled {
            Some("the default policy must be enabled")
        } else if policy.maximum != 0 {
            Some("the default policy cannot have a maximum")
        } else {
            None
        };
        if let Some(problem) = problem {
            return Err(EngineError::Input(problem.into()));
        }
    } else if policy.tags.is_empty() {
        return Err(EngineError::Input("a policy requires at least one tag".into()));
    }

    if no_op && policy.broker.is_some() {
        return Err(EngineError::Input(format!(
            "a broker cannot be attached to a {} model",
            model.template
        )));
    }

    model.validate()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use crate::templates::TemplateKind;

    struct Fixture {
        service: PolicyService,
        docs: Documents,
        local: Model,
        coreos: Model,
    }

    async fn fixture() -> Fixture {
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        let local = docs
            .persist(&Model::new("local", TemplateKind::BootLocal))
            .await
            .unwrap();
        let coreos = docs
            .persist(&Model::new("coreos", TemplateKind::CoreosInMemory).with_image("img"))
            .await
            .unwrap();
        Fixture {
            service: PolicyService::new(docs.clone()),
            docs,
            local,
            coreos,
        }
    }

    fn tagged(label: &str, model: &Model) -> Policy {
        Policy::new(label, &model.uuid)
            .with_tags([label], MatchMode::And)
            .enabled(true)
    }

    #[tokio::test]
    async fn test_table_created_lazily() {
        let f = fixture().await;
        assert!(f.docs.get::<PolicyTable>(POLICY_TABLE_ID).await.unwrap().is_none());
        assert!(f.service.table().await.unwrap().is_empty());
        assert!(f.docs.get::<PolicyTable>(POLICY_TABLE_ID).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_new_policies_go_before_default() {
        let f = fixture().await;
        let a = f.service.add(tagged("a", &f.coreos), None).await.unwrap();
        let d = f
            .service
            .add(Policy::new("catch-all", &f.local.uuid).as_default(), None)
            .await
            .unwrap();
        let b = f.service.add(tagged("b", &f.coreos), None).await.unwrap();

        let ids: Vec<String> = f
            .service
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.uuid)
            .collect();
        assert_eq!(ids, vec![a.uuid, b.uuid.clone(), d.uuid.clone()]);
        assert_eq!(b.line_number, 1);
        assert_eq!(f.service.position_of(&d.uuid).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_at_index() {
        let f = fixture().await;
        f.service.add(tagged("a", &f.coreos), None).await.unwrap();
        f.service.add(tagged("b", &f.coreos), None).await.unwrap();
        let c = f.service.add(tagged("c", &f.coreos), Some(0)).await.unwrap();
        assert_eq!(f.service.position_of(&c.uuid).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bad_index_leaves_no_policy_behind() {
        let f = fixture().await;
        let err = f.service.add(tagged("a", &f.coreos), Some(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(f.docs.all::<Policy>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_policy_validation() {
        let f = fixture().await;
        let err = f
            .service
            .add(Policy::new("d", &f.coreos.uuid).as_default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);

        let err = f
            .service
            .add(Policy::new("d", &f.local.uuid).as_default().with_broker("puppet"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);

        f.service
            .add(Policy::new("d", &f.local.uuid).as_default(), None)
            .await
            .unwrap();
        let err = f
            .service
            .add(Policy::new("d2", &f.local.uuid).as_default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_untagged_and_missing_model() {
        let f = fixture().await;
        let err = f
            .service
            .add(Policy::new("x", &f.coreos.uuid).enabled(true), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);

        let err = f
            .service
            .add(Policy::new("x", "missing").with_tags(["t"], MatchMode::And), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_remove_rejected_while_bound() {
        let f = fixture().await;
        let policy = f.service.add(tagged("a", &f.coreos), None).await.unwrap();
        let node = Node::new(vec!["HW".into()]);
        let active = f
            .docs
            .persist(&ActiveModel::bind(&node, &policy, f.coreos.clone(), 1))
            .await
            .unwrap();

        let err = f.service.remove(&policy.uuid).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        f.docs.delete(&active).await.unwrap();
        f.service.remove(&policy.uuid).await.unwrap();
        assert!(f.service.table().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_move_default_rejected() {
        let f = fixture().await;
        f.service.add(tagged("a", &f.coreos), None).await.unwrap();
        let d = f
            .service
            .add(Policy::new("d", &f.local.uuid).as_default(), None)
            .await
            .unwrap();
        assert!(f.service.move_to(&d.uuid, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_respects_maximum() {
        let f = fixture().await;
        let policy = f
            .service
            .add(tagged("a", &f.coreos).with_maximum(1), None)
            .await
            .unwrap();
        let node = Node::new(vec!["HW1".into()]);
        let first = f
            .service
            .bind(&node, &policy.uuid, f.coreos.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.counter, 1);
        assert!(f
            .service
            .bind(&node, &policy.uuid, f.coreos.clone())
            .await
            .unwrap()
            .is_none());

        f.docs.delete(&first).await.unwrap();
        f.service.release_bind(&policy.uuid).await.unwrap();
        let second = f
            .service
            .bind(&node, &policy.uuid, f.coreos.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.counter, 2);
        let stored = f.service.get(&policy.uuid).await.unwrap().unwrap();
        assert_eq!(stored.bind_count, 1);
    }

    #[tokio::test]
    async fn test_removed_policy_cannot_bind_or_update() {
        let f = fixture().await;
        let policy = f.service.add(tagged("a", &f.coreos), None).await.unwrap();
        f.service.remove(&policy.uuid).await.unwrap();

        let node = Node::new(vec!["HW2".into()]);
        assert!(f
            .service
            .bind(&node, &policy.uuid, f.coreos.clone())
            .await
            .unwrap()
            .is_none());
        let err = f
            .service
            .update(&policy.uuid, PolicyUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(f.docs.get::<Policy>(&policy.uuid).await.unwrap().is_none());
        assert!(f.docs.all::<ActiveModel>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_in_place() {
        let f = fixture().await;
        let policy = f.service.add(tagged("a", &f.coreos), None).await.unwrap();
        let updated = f
            .service
            .update(
                &policy.uuid,
                PolicyUpdate {
                    enabled: Some(false),
                    tags: Some((vec!["x".into(), "y".into()], MatchMode::Or)),
                    ..PolicyUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.match_using, MatchMode::Or);

        let err = f
            .service
            .update(
                &policy.uuid,
                PolicyUpdate {
                    tags: Some((vec![], MatchMode::And)),
                    ..PolicyUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }
}
