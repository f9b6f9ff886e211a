//! Node registry and hardware-id collision repair.
//!
//! Registrations are not transactional across documents, so two nodes can
//! briefly claim the same hardware id. Lookups detect this and run a
//! repair pass; the repair itself is serialized behind one lock and is
//! idempotent.

use std::collections::{BTreeMap, HashSet};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::{HardwareIdentity, Node};
use crate::store::Documents;

/// Stores and resolves [`Node`] records by hardware identity.
pub struct NodeRegistry {
    docs: Documents,
    repair_lock: Mutex<()>,
}

impl NodeRegistry {
    /// Create a registry over `docs`.
    #[must_use]
    pub fn new(docs: Documents) -> Self {
        Self {
            docs,
            repair_lock: Mutex::new(()),
        }
    }

    /// Find the node presenting `identity`.
    ///
    /// A node whose hardware ids are exactly `[uuid]` wins; otherwise any
    /// node owning one of the supplied ids matches. More than one match
    /// triggers a repair pass and a single retry.
    ///
    /// # Errors
    /// Returns [`EngineError::Input`] if the identity is still ambiguous
    /// after repair, or a store error.
    pub async fn lookup_by_hardware_id(
        &self,
        identity: &HardwareIdentity,
    ) -> EngineResult<Option<Node>> {
        if identity.is_empty() {
            return Ok(None);
        }

        let mut matches = find_matches(self.docs.all::<Node>().await?, identity);
        if matches.len() > 1 {
            warn!(
                uuid = ?identity.uuid,
                mac_ids = ?identity.mac_ids,
                count = matches.len(),
                "Hardware identity matches several nodes, repairing"
            );
            self.repair_collisions().await?;
            matches = find_matches(self.docs.all::<Node>().await?, identity);
        }

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => Err(EngineError::Input(format!(
                "hardware identity is ambiguous: matches {n} nodes after repair"
            ))),
        }
    }

    /// Persist a new node.
    ///
    /// # Errors
    /// Returns [`EngineError::Input`] when the node has no hardware ids,
    /// [`EngineError::Conflict`] when one of them already belongs to a
    /// node, or a store error.
    pub async fn register_node(&self, node: Node) -> EngineResult<Node> {
        if node.hw_ids.is_empty() {
            return Err(EngineError::Input(
                "cannot register a node without hardware ids".into(),
            ));
        }

        let existing = self.docs.all::<Node>().await?;
        let wanted: HashSet<&str> = node.hw_ids.iter().map(String::as_str).collect();
        if let Some(owner) = existing
            .iter()
            .find(|n| n.uuid != node.uuid && n.hw_ids.iter().any(|id| wanted.contains(id.as_str())))
        {
            let shared: Vec<&String> = owner
                .hw_ids
                .iter()
                .filter(|id| wanted.contains(id.as_str()))
                .collect();
            return Err(EngineError::Conflict(format!(
                "hardware ids {shared:?} already belong to node {}",
                owner.uuid
            )));
        }

        let stored = self.docs.persist(&node).await?;
        info!(node_id = %stored.uuid, hw_ids = ?stored.hw_ids, "Registered node");

        self.repair_collisions().await?;
        Ok(self.docs.get::<Node>(&stored.uuid).await?.unwrap_or(stored))
    }

    /// Make hardware ids disjoint again.
    ///
    /// For every id owned by more than one node the node with the oldest
    /// `last_checkin` keeps it and every other owner loses it. Among nodes
    /// with equal timestamps the survivor is whichever sorts first; that
    /// order is not defined.
    ///
    /// Returns the number of nodes changed.
    ///
    /// # Errors
    /// Returns a store error; nodes persisted before the failure stay fixed
    /// and a later pass finishes the job.
    pub async fn repair_collisions(&self) -> EngineResult<usize> {
        let _guard = self.repair_lock.lock().await;

        let mut nodes = self.docs.all::<Node>().await?;
        let mut owners: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            for id in &node.hw_ids {
                owners.entry(id.clone()).or_default().push(idx);
            }
        }

        let mut changed: HashSet<usize> = HashSet::new();
        for (hw_id, mut holders) in owners {
            if holders.len() < 2 {
                continue;
            }
            holders.sort_by_key(|&idx| nodes[idx].last_checkin);
            let keeper = holders[0];
            for &idx in &holders[1..] {
                nodes[idx].hw_ids.retain(|id| id != &hw_id);
                changed.insert(idx);
                warn!(
                    hw_id = %hw_id,
                    kept_by = %nodes[keeper].uuid,
                    removed_from = %nodes[idx].uuid,
                    "Resolved hardware id collision"
                );
            }
        }

        for &idx in &changed {
            self.docs.persist(&nodes[idx]).await?;
        }
        if !changed.is_empty() {
            debug!(count = changed.len(), "Collision repair updated nodes");
        }
        Ok(changed.len())
    }
}

fn find_matches(nodes: Vec<Node>, identity: &HardwareIdentity) -> Vec<Node> {
    if let Some(uuid) = &identity.uuid {
        let exact: Vec<Node> = nodes
            .iter()
            .filter(|n| n.hw_ids.len() == 1 && &n.hw_ids[0] == uuid)
            .cloned()
            .collect();
        if !exact.is_empty() {
            return exact;
        }
    }

    let wanted: HashSet<&str> = identity
        .uuid
        .iter()
        .chain(identity.mac_ids.iter())
        .map(String::as_str)
        .collect();
    nodes
        .into_iter()
        .filter(|n| n.hw_ids.iter().any(|id| wanted.contains(id.as_str())))
        .collect()
}
