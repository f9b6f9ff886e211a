//! Orchestration engine.
//!
//! The one service object transport layers talk to. It ties identity
//! resolution, tag evaluation, policy matching and the model FSMs into the
//! checkin, boot, callback, rebind and expiry protocols.
//!
//! Work on one node is serialized by a per-node async mutex; unrelated
//! nodes never wait on each other.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::boot::{ArtifactKind, BootArtifact, BootContext, BootTemplates};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::models::{
    ActiveModel, Command, HardwareIdentity, Image, Node, NodeStatus, Policy, RebindRequest,
};
use crate::policy::{self, PolicyService};
use crate::registry::NodeRegistry;
use crate::store::{Documents, Store};
use crate::tags::{self, TagRule};
use crate::templates::{CallbackReply, Model};

/// Result of an installer callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResponse {
    /// Acknowledged; nothing to send back.
    Ack,
    /// A rendered file for the installer.
    Artifact(BootArtifact),
}

/// A node together with its derived status.
#[derive(Debug, Clone)]
pub struct NodeView {
    /// The node.
    pub node: Node,
    /// Derived status.
    pub status: NodeStatus,
}

/// The binding/orchestration engine.
pub struct Engine {
    docs: Documents,
    config: EngineConfig,
    registry: NodeRegistry,
    policies: PolicyService,
    templates: BootTemplates,
    node_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Engine {
    /// Build an engine over `store`.
    ///
    /// # Errors
    /// Returns [`EngineError::Render`] if the boot templates fail to load.
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> EngineResult<Self> {
        let templates = match &config.template_dir {
            Some(dir) => BootTemplates::from_dir(dir)?,
            None => BootTemplates::new()?,
        };
        let docs = Documents::new(store);
        Ok(Self {
            registry: NodeRegistry::new(docs.clone()),
            policies: PolicyService::new(docs.clone()),
            docs,
            config,
            templates,
            node_locks: DashMap::new(),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Typed document access.
    #[must_use]
    pub fn documents(&self) -> &Documents {
        &self.docs
    }

    /// Node registry.
    #[must_use]
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Policy service.
    #[must_use]
    pub fn policies(&self) -> &PolicyService {
        &self.policies
    }

    fn node_lock(&self, node_id: &str) -> Arc<Mutex<()>> {
        self.node_locks.entry(node_id.to_string()).or_default().clone()
    }

    /// Lock a node that exists. Unknown ids never get a lock entry.
    async fn lock_known_node(
        &self,
        node_id: &str,
    ) -> EngineResult<(Node, OwnedMutexGuard<()>)> {
        self.get_node(node_id).await?;
        let guard = self.node_lock(node_id).lock_owned().await;
        let node = self.get_node(node_id).await?;
        Ok((node, guard))
    }

    // ------------------------------------------------------------------
    // Checkin
    // ------------------------------------------------------------------

    /// Handle a checkin from the booted agent.
    ///
    /// Unknown or stale nodes are told to register; bound nodes get their
    /// model's command; anything else is evaluated against the policy
    /// table and acknowledged.
    ///
    /// # Errors
    /// Returns [`EngineError::Input`] for an identity with no ids and a
    /// store error if persistence fails.
    pub async fn checkin(
        &self,
        identity: &HardwareIdentity,
        last_state: Option<&str>,
    ) -> EngineResult<Command> {
        if identity.is_empty() {
            return Err(EngineError::Input("checkin requires a uuid or mac id".into()));
        }

        let Some(found) = self.resolve(identity).await? else {
            debug!(
                uuid = ?identity.uuid,
                mac_ids = ?identity.mac_ids,
                "Unknown node, asking to register"
            );
            return Ok(Command::register());
        };

        let lock = self.node_lock(&found.uuid);
        let _guard = lock.lock().await;

        let Some(mut node) = self.docs.get::<Node>(&found.uuid).await? else {
            return Ok(Command::register());
        };

        let now = Utc::now();
        let elapsed = node.seconds_since_checkin(now);
        node.last_checkin = now;
        node.last_state = last_state.map(str::to_string);
        let node = self.docs.persist(&node).await?;
        debug!(node_id = %node.uuid, "Checkin accepted");

        if let Some(forced) = self.config.checkin_overrides.get(&node.uuid) {
            info!(node_id = %node.uuid, command = %forced, "Returning forced checkin command");
            return Ok(Command::new(*forced));
        }

        if u64::try_from(elapsed).unwrap_or(0) > self.config.register_timeout_secs {
            debug!(node_id = %node.uuid, elapsed, "Node silent too long, asking to re-register");
            return Ok(Command::register());
        }

        if let Some(mut active) = self.find_active_model(&node.uuid).await? {
            let command = active.on_checkin();
            self.docs.persist(&active).await?;
            debug!(
                node_id = %node.uuid,
                state = %active.current_state(),
                command = %command.command_name,
                "Bound node checkin"
            );
            return Ok(command);
        }

        self.evaluate_locked(&node).await;
        Ok(Command::acknowledge())
    }

    /// Resolve an identity, treating leftover ambiguity as unknown.
    async fn resolve(&self, identity: &HardwareIdentity) -> EngineResult<Option<Node>> {
        match self.registry.lookup_by_hardware_id(identity).await {
            Ok(node) => Ok(node),
            Err(e) if e.kind() == ErrorKind::Input => {
                error!(
                    uuid = ?identity.uuid,
                    mac_ids = ?identity.mac_ids,
                    error = %e,
                    "Unresolvable hardware identity"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Registration and tags
    // ------------------------------------------------------------------

    /// Register a node's facts, creating the node if needed.
    ///
    /// An existing node takes `[uuid]` as its hardware ids when a uuid is
    /// supplied, otherwise gains the supplied mac ids.
    ///
    /// # Errors
    /// Returns [`EngineError::Input`] for an empty identity or empty
    /// attributes and [`EngineError::Conflict`] when a new node's ids are
    /// already taken.
    pub async fn register(
        &self,
        identity: &HardwareIdentity,
        last_state: Option<&str>,
        attributes: BTreeMap<String, String>,
    ) -> EngineResult<Node> {
        if identity.is_empty() {
            return Err(EngineError::Input("register requires a uuid or mac id".into()));
        }
        if attributes.is_empty() {
            return Err(EngineError::Input("register requires node attributes".into()));
        }

        match self.registry.lookup_by_hardware_id(identity).await? {
            Some(found) => {
                let lock = self.node_lock(&found.uuid);
                let _guard = lock.lock().await;
                let mut node = self.docs.get::<Node>(&found.uuid).await?.unwrap_or(found);

                let before = node.hw_ids.clone();
                match &identity.uuid {
                    Some(uuid) => node.hw_ids = vec![uuid.clone()],
                    None => {
                        for mac in &identity.mac_ids {
                            if !node.hw_ids.contains(mac) {
                                node.hw_ids.push(mac.clone());
                            }
                        }
                    }
                }
                node.attributes = attributes;
                node.last_state = last_state.map(str::to_string);
                node.last_checkin = Utc::now();
                let node = self.docs.persist(&node).await?;

                if node.hw_ids != before {
                    self.registry.repair_collisions().await?;
                }
                info!(node_id = %node.uuid, "Node re-registered");
                Ok(node)
            }
            None => {
                let mut node = Node::new(identity.hw_ids());
                node.attributes = attributes;
                node.last_state = last_state.map(str::to_string);
                self.registry.register_node(node).await
            }
        }
    }

    /// Tags of `node`.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn node_tags(&self, node: &Node) -> EngineResult<BTreeSet<String>> {
        let rules = self.docs.all::<TagRule>().await?;
        Ok(tags::node_tags(node, &rules, &self.config.system_tag_rules))
    }

    /// Store a tag rule.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn add_tag_rule(&self, rule: TagRule) -> EngineResult<TagRule> {
        Ok(self.docs.persist(&rule).await?)
    }

    /// Every stored tag rule.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn tag_rules(&self) -> EngineResult<Vec<TagRule>> {
        Ok(self.docs.all::<TagRule>().await?)
    }

    /// Delete a tag rule.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown rule.
    pub async fn remove_tag_rule(&self, rule_id: &str) -> EngineResult<TagRule> {
        let rule = self
            .docs
            .get::<TagRule>(rule_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tag rule {rule_id}")))?;
        self.docs.delete(&rule).await?;
        Ok(rule)
    }

    // ------------------------------------------------------------------
    // Policy evaluation and binding
    // ------------------------------------------------------------------

    /// Evaluate a node against the policy table and bind the first match.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown node.
    pub async fn evaluate(&self, node_id: &str) -> EngineResult<Option<ActiveModel>> {
        let (node, _guard) = self.lock_known_node(node_id).await?;
        if self.find_active_model(node_id).await?.is_some() {
            return Ok(None);
        }
        Ok(self.evaluate_locked(&node).await)
    }

    /// Walk the table and bind. Failures are logged and mean "no match this
    /// cycle". Caller holds the node lock.
    async fn evaluate_locked(&self, node: &Node) -> Option<ActiveModel> {
        let node_tags = match self.node_tags(node).await {
            Ok(tags) => tags,
            Err(e) => {
                error!(node_id = %node.uuid, error = %e, "Failed to compute node tags");
                return None;
            }
        };
        let ordered = match self.policies.list().await {
            Ok(list) => list,
            Err(e) => {
                error!(node_id = %node.uuid, error = %e, "Failed to load policies");
                return None;
            }
        };
        let default_id = policy::default_policy(&ordered).map(|p| p.uuid.clone());

        for candidate in &ordered {
            if !policy::matches(candidate, &node_tags, default_id.as_deref()) {
                continue;
            }
            match self.bind(node, candidate).await {
                Ok(Some(active)) => return Some(active),
                Ok(None) => {}
                Err(e) => error!(
                    node_id = %node.uuid,
                    policy_id = %candidate.uuid,
                    error = %e,
                    "Binding failed, trying next policy"
                ),
            }
        }
        debug!(node_id = %node.uuid, "No matching policy");
        None
    }

    /// Bind `node` to `candidate`. `None` when the policy filled up or its
    /// model is missing or unreadable.
    async fn bind(&self, node: &Node, candidate: &Policy) -> EngineResult<Option<ActiveModel>> {
        let Some(model) = self.model_for(candidate).await else {
            return Ok(None);
        };
        let Some(active) = self.policies.bind(node, &candidate.uuid, model).await? else {
            debug!(policy_id = %candidate.uuid, "Policy gone or at its maximum");
            return Ok(None);
        };
        info!(
            node_id = %node.uuid,
            policy_id = %candidate.uuid,
            label = %candidate.label,
            active_model_id = %active.uuid,
            counter = active.counter,
            "Bound node to policy"
        );
        Ok(Some(active))
    }

    /// Model of `candidate`; a missing or unreadable one is logged.
    async fn model_for(&self, candidate: &Policy) -> Option<Model> {
        match self.docs.get::<Model>(&candidate.model_id).await {
            Ok(Some(model)) => Some(model),
            Ok(None) => {
                error!(
                    policy_id = %candidate.uuid,
                    model_id = %candidate.model_id,
                    "Policy references a missing model"
                );
                None
            }
            Err(e) => {
                error!(
                    policy_id = %candidate.uuid,
                    model_id = %candidate.model_id,
                    error = %e,
                    "Policy model is unreadable"
                );
                None
            }
        }
    }

    /// The binding for `node_id`, if any.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn find_active_model(&self, node_id: &str) -> EngineResult<Option<ActiveModel>> {
        Ok(self
            .docs
            .all::<ActiveModel>()
            .await?
            .into_iter()
            .find(|am| am.node_uuid == node_id))
    }

    /// Every binding.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn active_models(&self) -> EngineResult<Vec<ActiveModel>> {
        Ok(self.docs.all::<ActiveModel>().await?)
    }

    /// A binding by id.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown binding.
    pub async fn active_model(&self, active_model_id: &str) -> EngineResult<ActiveModel> {
        self.docs
            .get::<ActiveModel>(active_model_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("active model {active_model_id}")))
    }

    /// Remove a binding and free its policy slot.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown binding.
    pub async fn remove_active_model(&self, active_model_id: &str) -> EngineResult<ActiveModel> {
        let found = self.active_model(active_model_id).await?;
        let lock = self.node_lock(&found.node_uuid);
        let _guard = lock.lock().await;

        let active = self.active_model(active_model_id).await?;
        self.docs.delete(&active).await?;
        self.policies.release_bind(&active.policy_uuid).await?;
        info!(active_model_id, node_id = %active.node_uuid, "Removed active model");
        Ok(active)
    }

    // ------------------------------------------------------------------
    // Boot
    // ------------------------------------------------------------------

    /// Produce the boot artifact for a booting node.
    ///
    /// Never fails: store or decode errors degrade to the microkernel or
    /// the error script and are logged.
    pub async fn boot_request(
        &self,
        identity: &HardwareIdentity,
        dhcp_mac: Option<&str>,
    ) -> BootArtifact {
        info!(uuid = ?identity.uuid, mac_ids = ?identity.mac_ids, "Boot request");

        match self.boot_node(identity, dhcp_mac).await {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(
                    uuid = ?identity.uuid,
                    mac_ids = ?identity.mac_ids,
                    error = %e,
                    "Boot request failed"
                );
                self.templates
                    .error_script(&self.config, "Boot request could not be processed")
            }
        }
    }

    async fn boot_node(
        &self,
        identity: &HardwareIdentity,
        dhcp_mac: Option<&str>,
    ) -> EngineResult<BootArtifact> {
        let Some(found) = self.resolve(identity).await? else {
            return match identity.boot_key() {
                Some(key) => {
                    info!(hw_id = %key, "Unknown node, booting microkernel");
                    Ok(self.microkernel_boot(&key).await)
                }
                None => Ok(self
                    .templates
                    .error_script(&self.config, "Neither node uuid nor mac id was supplied")),
            };
        };

        let lock = self.node_lock(&found.uuid);
        let _guard = lock.lock().await;
        let Some(mut node) = self.docs.get::<Node>(&found.uuid).await? else {
            return Ok(self.microkernel_boot(&found.hw_id_key()).await);
        };

        if let Some(artifact) = self.consume_rebind(&node).await {
            return Ok(artifact);
        }

        if let Some(mac) = dhcp_mac.map(str::trim).filter(|m| !m.is_empty()) {
            let mac = mac.to_uppercase();
            if node.dhcp_mac.as_deref() != Some(mac.as_str()) {
                node.dhcp_mac = Some(mac);
                node = self.docs.persist(&node).await?;
            }
        }

        if let Some(mut active) = self.find_active_model(&node.uuid).await? {
            let kind = active.on_boot_request();
            self.docs.persist(&active).await?;
            info!(
                node_id = %node.uuid,
                label = %active.label,
                state = %active.current_state(),
                artifact = %kind,
                "Bound node boot"
            );
            return Ok(self.render_for_binding(kind, &active, &node).await);
        }

        info!(node_id = %node.uuid, "No binding, booting microkernel");
        Ok(self.microkernel_boot(&node.hw_id_key()).await)
    }

    /// Rebind step of the boot protocol. Caller holds the node lock.
    ///
    /// Failures are logged and leave the request pending.
    async fn consume_rebind(&self, node: &Node) -> Option<BootArtifact> {
        let request = match self.find_rebind_request(&node.uuid).await {
            Ok(request) => request?,
            Err(e) => {
                error!(node_id = %node.uuid, error = %e, "Could not load rebind request");
                return None;
            }
        };
        let (node_tags, candidates) =
            match tokio::try_join!(self.node_tags(node), self.policies.list()) {
                Ok(found) => found,
                Err(e) => {
                    error!(node_id = %node.uuid, error = %e, "Could not evaluate rebind");
                    return None;
                }
            };

        for candidate in candidates {
            if !policy::matches(&candidate, &node_tags, None) {
                continue;
            }
            let Some(model) = self.model_for(&candidate).await else {
                continue;
            };
            if !model.template.is_in_memory() {
                continue;
            }

            if let Err(e) = self.docs.delete(&request).await {
                error!(node_id = %node.uuid, error = %e, "Could not consume rebind request");
                return None;
            }
            info!(node_id = %node.uuid, policy_id = %candidate.uuid, "Rebind request consumed");

            let counter = candidate.bind_sequence;
            let mut transient = ActiveModel::bind(node, &candidate, model, counter);
            let kind = transient.on_boot_request();
            return Some(self.render_for_binding(kind, &transient, node).await);
        }
        debug!(node_id = %node.uuid, "Rebind pending but no in-memory policy matches");
        None
    }

    async fn render_for_binding(
        &self,
        kind: ArtifactKind,
        active: &ActiveModel,
        node: &Node,
    ) -> BootArtifact {
        if kind == ArtifactKind::Microkernel {
            return self.microkernel_boot(&node.hw_id_key()).await;
        }

        let image = match &active.model.image_id {
            Some(id) => match self.docs.get::<Image>(id).await {
                Ok(image) => image,
                Err(e) => {
                    error!(
                        active_model_id = %active.uuid,
                        image_id = %id,
                        error = %e,
                        "Image is unreadable"
                    );
                    return self
                        .templates
                        .error_script(&self.config, "Image for bound model is unreadable");
                }
            },
            None => None,
        };
        let needs_image = matches!(kind, ArtifactKind::InstallBoot | ArtifactKind::InMemoryBoot);
        if image.is_none() && needs_image {
            warn!(active_model_id = %active.uuid, "Bound model has no usable image");
            return self
                .templates
                .error_script(&self.config, "Image for bound model not found");
        }

        let ctx = BootContext::binding(&self.config, active, node, image.as_ref());
        match self.templates.render(kind, Some(active.model.template), &ctx) {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(active_model_id = %active.uuid, error = %e, "Boot template failed");
                self.templates
                    .error_script(&self.config, "Boot script generation failed")
            }
        }
    }

    /// Microkernel with the highest version weight among verified images.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn default_microkernel(&self) -> EngineResult<Option<Image>> {
        Ok(self
            .docs
            .all::<Image>()
            .await?
            .into_iter()
            .filter(Image::is_usable_microkernel)
            .max_by_key(Image::version_weight))
    }

    async fn microkernel_boot(&self, hw_id: &str) -> BootArtifact {
        let image = match self.default_microkernel().await {
            Ok(Some(image)) => image,
            Ok(None) => {
                error!("Microkernel image does not exist");
                return self
                    .templates
                    .error_script(&self.config, "Microkernel image not found");
            }
            Err(e) => {
                error!(error = %e, "Could not load microkernel images");
                return self
                    .templates
                    .error_script(&self.config, "Microkernel image could not be loaded");
            }
        };
        let ctx = BootContext::microkernel(&self.config, &image, hw_id);
        match self.templates.render(ArtifactKind::Microkernel, None, &ctx) {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(error = %e, "Microkernel template failed");
                self.templates
                    .error_script(&self.config, "Boot script generation failed")
            }
        }
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Route an installer progress report to a binding.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown binding or
    /// namespace, [`EngineError::Input`] for unknown arguments and
    /// [`EngineError::Render`] when a requested file cannot be rendered.
    pub async fn callback(
        &self,
        active_model_id: &str,
        namespace: &str,
        args: &[String],
    ) -> EngineResult<CallbackResponse> {
        let found = self.active_model(active_model_id).await?;
        let lock = self.node_lock(&found.node_uuid);
        let _guard = lock.lock().await;

        let mut active = self.active_model(active_model_id).await?;
        let reply = active.callback(namespace, args)?;
        let active = self.docs.persist(&active).await?;
        debug!(
            active_model_id,
            namespace,
            state = %active.current_state(),
            "Callback handled"
        );

        match reply {
            CallbackReply::Ok | CallbackReply::RecordIp(_) => Ok(CallbackResponse::Ack),
            CallbackReply::Artifact(kind) => {
                let node = self
                    .docs
                    .get::<Node>(&active.node_uuid)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("node {}", active.node_uuid)))?;
                let image = match &active.model.image_id {
                    Some(id) => self.docs.get::<Image>(id).await?,
                    None => None,
                };
                let ctx = BootContext::binding(&self.config, &active, &node, image.as_ref());
                let artifact = self.templates.render(kind, Some(active.model.template), &ctx)?;
                Ok(CallbackResponse::Artifact(artifact))
            }
        }
    }

    // ------------------------------------------------------------------
    // Rebind administration
    // ------------------------------------------------------------------

    async fn find_rebind_request(&self, node_id: &str) -> EngineResult<Option<RebindRequest>> {
        Ok(self
            .docs
            .all::<RebindRequest>()
            .await?
            .into_iter()
            .find(|r| r.node_uuid == node_id))
    }

    /// Ask for `node_id` to be re-evaluated against in-memory policies on
    /// its next boot.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown node and
    /// [`EngineError::Conflict`] when a request is already pending.
    pub async fn request_rebind(&self, node_id: &str) -> EngineResult<RebindRequest> {
        let (_node, _guard) = self.lock_known_node(node_id).await?;

        if self.find_rebind_request(node_id).await?.is_some() {
            warn!(node_id, "Rebind already requested");
            return Err(EngineError::Conflict(format!(
                "a rebind request already exists for node {node_id}"
            )));
        }
        let request = self.docs.persist(&RebindRequest::new(node_id)).await?;
        info!(node_id, "Rebind requested");
        Ok(request)
    }

    /// Withdraw a pending rebind request.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown node or when no
    /// request is pending.
    pub async fn cancel_rebind(&self, node_id: &str) -> EngineResult<RebindRequest> {
        let (_node, _guard) = self.lock_known_node(node_id).await?;

        let request = self.find_rebind_request(node_id).await?.ok_or_else(|| {
            EngineError::NotFound(format!("no rebind request exists for node {node_id}"))
        })?;
        self.docs.delete(&request).await?;
        info!(node_id, "Rebind request cancelled");
        Ok(request)
    }

    /// Pending rebind request for `node_id`.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn rebind_request(&self, node_id: &str) -> EngineResult<Option<RebindRequest>> {
        self.find_rebind_request(node_id).await
    }

    /// Every pending rebind request.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn rebind_requests(&self) -> EngineResult<Vec<RebindRequest>> {
        Ok(self.docs.all::<RebindRequest>().await?)
    }

    // ------------------------------------------------------------------
    // Nodes and status
    // ------------------------------------------------------------------

    /// A node by id.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown node.
    pub async fn get_node(&self, node_id: &str) -> EngineResult<Node> {
        self.docs
            .get::<Node>(node_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("node {node_id}")))
    }

    /// Derived status of `node`.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn node_status(&self, node: &Node) -> EngineResult<NodeStatus> {
        let rebinds = self.docs.all::<RebindRequest>().await?;
        let actives = self.docs.all::<ActiveModel>().await?;
        Ok(self.status_of(node, &rebinds, &actives))
    }

    fn status_of(
        &self,
        node: &Node,
        rebinds: &[RebindRequest],
        actives: &[ActiveModel],
    ) -> NodeStatus {
        if rebinds.iter().any(|r| r.node_uuid == node.uuid) {
            NodeStatus::Rebind
        } else if actives.iter().any(|a| a.node_uuid == node.uuid) {
            NodeStatus::Bound
        } else if u64::try_from(node.seconds_since_checkin(Utc::now())).unwrap_or(0)
            > self.config.register_timeout_secs
        {
            NodeStatus::Inactive
        } else {
            NodeStatus::Active
        }
    }

    /// Every node with its status.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn list_nodes(&self) -> EngineResult<Vec<NodeView>> {
        let rebinds = self.docs.all::<RebindRequest>().await?;
        let actives = self.docs.all::<ActiveModel>().await?;
        let mut nodes = self.docs.all::<Node>().await?;
        nodes.sort_by_key(|n| n.last_checkin);
        Ok(nodes
            .into_iter()
            .map(|node| {
                let status = self.status_of(&node, &rebinds, &actives);
                NodeView { node, status }
            })
            .collect())
    }

    /// Remove unbound nodes silent for longer than the expiry timeout.
    ///
    /// Each node is re-checked under its lock, so a node that checks in or
    /// gets bound mid-sweep survives. Returns the removed node ids.
    ///
    /// # Errors
    /// Returns a store error from listing; per-node failures are logged.
    pub async fn expire_nodes(&self) -> EngineResult<Vec<String>> {
        let threshold = self.config.node_expire_timeout_secs;
        let mut removed = Vec::new();

        for candidate in self.docs.all::<Node>().await? {
            let lock = self.node_lock(&candidate.uuid);
            let _guard = lock.lock().await;

            match self.expire_one(&candidate.uuid, threshold).await {
                Ok(true) => {
                    info!(node_id = %candidate.uuid, "Expired node removed");
                    removed.push(candidate.uuid.clone());
                }
                Ok(false) => {}
                Err(e) => warn!(node_id = %candidate.uuid, error = %e, "Could not expire node"),
            }
        }

        for id in &removed {
            self.node_locks.remove(id);
        }
        Ok(removed)
    }

    async fn expire_one(&self, node_id: &str, threshold: u64) -> EngineResult<bool> {
        let Some(node) = self.docs.get::<Node>(node_id).await? else {
            return Ok(false);
        };
        if self.node_status(&node).await?.is_protected() {
            return Ok(false);
        }
        let elapsed = u64::try_from(node.seconds_since_checkin(Utc::now())).unwrap_or(0);
        if elapsed <= threshold {
            return Ok(false);
        }
        Ok(self.docs.delete(&node).await?)
    }

    // ------------------------------------------------------------------
    // Models and images
    // ------------------------------------------------------------------

    /// Every stored model.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn models(&self) -> EngineResult<Vec<Model>> {
        Ok(self.docs.all::<Model>().await?)
    }

    /// Every stored image.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn images(&self) -> EngineResult<Vec<Image>> {
        Ok(self.docs.all::<Image>().await?)
    }

    /// Store a model after validating it and its image.
    ///
    /// # Errors
    /// Returns [`EngineError::Input`] for an invalid model and
    /// [`EngineError::NotFound`] for a missing image.
    pub async fn add_model(&self, model: Model) -> EngineResult<Model> {
        model.validate()?;
        if let Some(image_id) = &model.image_id {
            if self.docs.get::<Image>(image_id).await?.is_none() {
                return Err(EngineError::NotFound(format!("image {image_id}")));
            }
        }
        let stored = self.docs.persist(&model).await?;
        info!(model_id = %stored.uuid, template = %stored.template, "Added model");
        Ok(stored)
    }

    /// Delete a model no policy references.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown model and
    /// [`EngineError::Conflict`] while a policy uses it.
    pub async fn remove_model(&self, model_id: &str) -> EngineResult<Model> {
        let model = self
            .docs
            .get::<Model>(model_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("model {model_id}")))?;
        let users: Vec<String> = self
            .docs
            .all::<Policy>()
            .await?
            .into_iter()
            .filter(|p| p.model_id == model_id)
            .map(|p| p.uuid)
            .collect();
        if !users.is_empty() {
            return Err(EngineError::Conflict(format!(
                "model {model_id} is used by policies {users:?}"
            )));
        }
        self.docs.delete(&model).await?;
        Ok(model)
    }

    /// Store an image record.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn add_image(&self, image: Image) -> EngineResult<Image> {
        Ok(self.docs.persist(&image).await?)
    }

    /// Delete an image no model references.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown image and
    /// [`EngineError::Conflict`] while a model uses it.
    pub async fn remove_image(&self, image_id: &str) -> EngineResult<Image> {
        let image = self
            .docs
            .get::<Image>(image_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("image {image_id}")))?;
        let users: Vec<String> = self
            .docs
            .all::<Model>()
            .await?
            .into_iter()
            .filter(|m| m.image_id.as_deref() == Some(image_id))
            .map(|m| m.uuid)
            .collect();
        if !users.is_empty() {
            return Err(EngineError::Conflict(format!(
                "image {image_id} is used by models {users:?}"
            )));
        }
        self.docs.delete(&image).await?;
        Ok(image)
    }
}
