//! End-to-end checkin, boot, callback and rebind flows.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;

use provision::fsm::State;
use provision::store::{Kind, StoreError, StoreResult};
use provision::tags::TagMatcher;
use provision::{
    ArtifactKind, CallbackResponse, CommandName, Engine, EngineConfig, ErrorKind,
    HardwareIdentity, Image, ImageKind, JsonFileStore, MatchMode, MemoryStore, Model, Node,
    NodeStatus, Policy, Store, TagRule, TemplateKind,
};

fn engine() -> Engine {
    Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default()).unwrap()
}

fn facts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

async fn with_microkernel(engine: &Engine) -> Image {
    engine
        .add_image(Image::new(ImageKind::Microkernel, "v0.10.0", "vmlinuz", "core.gz"))
        .await
        .unwrap()
}

async fn model(engine: &Engine, template: TemplateKind) -> Model {
    let image = engine
        .add_image(Image::new(ImageKind::Os, "1.0", "linux", "initrd.gz"))
        .await
        .unwrap();
    engine
        .add_model(Model::new(template.to_string(), template).with_image(&image.uuid))
        .await
        .unwrap()
}

async fn tag_rule(engine: &Engine, key: &str, value: &str, tag: &str) {
    engine
        .add_tag_rule(TagRule::new(tag, tag, vec![TagMatcher::equal(key, value)]))
        .await
        .unwrap();
}

/// Memory store that can slow down binding writes and reject writes to
/// chosen documents.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    bind_delay: Option<std::time::Duration>,
    bind_started: Notify,
    rejected: Mutex<Vec<String>>,
}

impl FaultyStore {
    fn slow_binds(delay: std::time::Duration) -> Self {
        Self {
            bind_delay: Some(delay),
            ..Self::default()
        }
    }

    fn reject_writes_to(&self, uuid: &str) {
        self.rejected.lock().unwrap().push(uuid.to_string());
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn fetch_all(&self, kind: Kind) -> StoreResult<Vec<Value>> {
        self.inner.fetch_all(kind).await
    }

    async fn fetch_by_uuid(&self, kind: Kind, uuid: &str) -> StoreResult<Option<Value>> {
        self.inner.fetch_by_uuid(kind, uuid).await
    }

    async fn persist(&self, kind: Kind, uuid: &str, doc: Value) -> StoreResult<Value> {
        if self.rejected.lock().unwrap().iter().any(|r| r == uuid) {
            return Err(StoreError::Corrupt(format!("write to {uuid} rejected")));
        }
        if kind == Kind::ActiveModel {
            if let Some(delay) = self.bind_delay {
                self.bind_started.notify_one();
                tokio::time::sleep(delay).await;
            }
        }
        self.inner.persist(kind, uuid, doc).await
    }

    async fn delete(&self, kind: Kind, uuid: &str) -> StoreResult<bool> {
        self.inner.delete(kind, uuid).await
    }
}

/// Overwrite a stored document with one that no longer decodes.
async fn corrupt(engine: &Engine, kind: Kind, uuid: &str) {
    engine
        .documents()
        .store()
        .persist(kind, uuid, json!({ "uuid": uuid }))
        .await
        .unwrap();
}

async fn tagged_policy(engine: &Engine, name: &str, model: &Model, tag: &str) -> Policy {
    engine
        .policies()
        .add(
            Policy::new(name, &model.uuid)
                .with_tags([tag], MatchMode::And)
                .enabled(true),
            None,
        )
        .await
        .unwrap()
}

async fn age(engine: &Engine, node: &Node, secs: i64) {
    let mut node = engine.get_node(&node.uuid).await.unwrap();
    node.last_checkin = Utc::now() - Duration::seconds(secs);
    engine.documents().persist(&node).await.unwrap();
}

#[tokio::test]
async fn unknown_node_is_asked_to_register() {
    let engine = engine();
    let command = engine
        .checkin(&HardwareIdentity::from_uuid("NEVER-SEEN"), Some("idle"))
        .await
        .unwrap();
    assert_eq!(command.command_name, CommandName::Register);
}

#[tokio::test]
async fn stale_node_is_asked_to_register_again() {
    let engine = engine();
    let id = HardwareIdentity::from_uuid("STALE");
    let node = engine.register(&id, None, facts(&[("cpus", "4")])).await.unwrap();
    age(&engine, &node, 1000).await;

    let command = engine.checkin(&id, Some("idle")).await.unwrap();
    assert_eq!(command.command_name, CommandName::Register);

    // the checkin itself refreshed the timestamp
    let command = engine.checkin(&id, Some("idle")).await.unwrap();
    assert_eq!(command.command_name, CommandName::Acknowledge);
}

#[tokio::test]
async fn matching_policy_binds_and_acknowledges() {
    let engine = engine();
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    tag_rule(&engine, "vendor", "acme", "acme").await;
    let policy = engine
        .policies()
        .add(
            Policy::new("acme nodes", &coreos.uuid)
                .with_tags(["acme"], MatchMode::And)
                .enabled(true),
            None,
        )
        .await
        .unwrap();

    let id = HardwareIdentity::from_macs(&["52:54:00:00:00:01"]);
    let node = engine
        .register(&id, Some("idle"), facts(&[("vendor", "acme")]))
        .await
        .unwrap();

    let command = engine.checkin(&id, Some("idle")).await.unwrap();
    assert_eq!(command.command_name, CommandName::Acknowledge);

    let active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    assert_eq!(active.policy_uuid, policy.uuid);
    assert_eq!(active.counter, 1);
    assert_eq!(engine.node_status(&node).await.unwrap(), NodeStatus::Bound);

    let stored = engine.policies().get(&policy.uuid).await.unwrap().unwrap();
    assert_eq!(stored.bind_count, 1);
}

#[tokio::test]
async fn no_matching_policy_creates_no_binding() {
    let engine = engine();
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    engine
        .policies()
        .add(
            Policy::new("gpu", &coreos.uuid)
                .with_tags(["gpu"], MatchMode::And)
                .enabled(true),
            None,
        )
        .await
        .unwrap();

    let id = HardwareIdentity::from_uuid("PLAIN");
    let node = engine.register(&id, None, facts(&[("cpus", "2")])).await.unwrap();

    let command = engine.checkin(&id, None).await.unwrap();
    assert_eq!(command.command_name, CommandName::Acknowledge);
    assert!(engine.find_active_model(&node.uuid).await.unwrap().is_none());
}

#[tokio::test]
async fn first_match_in_table_order_wins() {
    let engine = engine();
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    let ubuntu = model(&engine, TemplateKind::UbuntuXenial).await;
    tag_rule(&engine, "rack", "r1", "r1").await;

    let broad = engine
        .policies()
        .add(
            Policy::new("broad", &coreos.uuid)
                .with_tags(["r1"], MatchMode::Or)
                .enabled(true),
            None,
        )
        .await
        .unwrap();
    let narrow = engine
        .policies()
        .add(
            Policy::new("narrow", &ubuntu.uuid)
                .with_tags(["r1"], MatchMode::And)
                .enabled(true),
            Some(0),
        )
        .await
        .unwrap();
    assert_eq!(engine.policies().position_of(&narrow.uuid).await.unwrap(), 0);
    assert_eq!(engine.policies().position_of(&broad.uuid).await.unwrap(), 1);

    let id = HardwareIdentity::from_uuid("RACKED");
    let node = engine.register(&id, None, facts(&[("rack", "r1")])).await.unwrap();
    engine.checkin(&id, None).await.unwrap();

    let active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    assert_eq!(active.policy_uuid, narrow.uuid);
}

#[tokio::test]
async fn default_policy_catches_everything_else() {
    let engine = engine();
    let local = engine
        .add_model(Model::new("local", TemplateKind::BootLocal))
        .await
        .unwrap();
    let dflt = engine
        .policies()
        .add(Policy::new("catch-all", &local.uuid).as_default(), None)
        .await
        .unwrap();

    let id = HardwareIdentity::from_uuid("ANY");
    let node = engine.register(&id, None, facts(&[("x", "y")])).await.unwrap();
    engine.checkin(&id, None).await.unwrap();

    let active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    assert_eq!(active.policy_uuid, dflt.uuid);

    let artifact = engine.boot_request(&id, None).await;
    assert_eq!(artifact.kind, ArtifactKind::LocalBoot);
}

#[tokio::test]
async fn maximum_limits_bindings() {
    let engine = engine();
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    tag_rule(&engine, "role", "worker", "worker").await;
    engine
        .policies()
        .add(
            Policy::new("one worker", &coreos.uuid)
                .with_tags(["worker"], MatchMode::And)
                .enabled(true)
                .with_maximum(1),
            None,
        )
        .await
        .unwrap();

    let mut bound = 0;
    for hw in ["W1", "W2", "W3"] {
        let id = HardwareIdentity::from_uuid(hw);
        let node = engine.register(&id, None, facts(&[("role", "worker")])).await.unwrap();
        engine.checkin(&id, None).await.unwrap();
        if engine.find_active_model(&node.uuid).await.unwrap().is_some() {
            bound += 1;
        }
    }
    assert_eq!(bound, 1);
}

#[tokio::test]
async fn concurrent_checkins_bind_once() {
    let engine = Arc::new(engine());
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    tag_rule(&engine, "role", "db", "db").await;
    engine
        .policies()
        .add(
            Policy::new("db", &coreos.uuid)
                .with_tags(["db"], MatchMode::And)
                .enabled(true),
            None,
        )
        .await
        .unwrap();
    let id = HardwareIdentity::from_uuid("RACE");
    let node = engine.register(&id, None, facts(&[("role", "db")])).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            tokio::spawn(async move { engine.checkin(&id, None).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let bindings: Vec<_> = engine
        .active_models()
        .await
        .unwrap()
        .into_iter()
        .filter(|am| am.node_uuid == node.uuid)
        .collect();
    assert_eq!(bindings.len(), 1);
}

#[tokio::test]
async fn install_walks_to_completion_through_callbacks() {
    let engine = engine();
    with_microkernel(&engine).await;
    let ubuntu = model(&engine, TemplateKind::UbuntuXenial).await;
    tag_rule(&engine, "os", "ubuntu", "ubuntu").await;
    engine
        .policies()
        .add(
            Policy::new("ubuntu", &ubuntu.uuid)
                .with_tags(["ubuntu"], MatchMode::And)
                .enabled(true),
            None,
        )
        .await
        .unwrap();

    let id = HardwareIdentity::from_uuid("INSTALL");
    let node = engine.register(&id, None, facts(&[("os", "ubuntu")])).await.unwrap();
    engine.checkin(&id, None).await.unwrap();
    assert_eq!(
        engine.checkin(&id, None).await.unwrap().command_name,
        CommandName::Reboot
    );

    let artifact = engine.boot_request(&id, Some("52:54:00:aa:bb:cc")).await;
    assert_eq!(artifact.kind, ArtifactKind::InstallBoot);
    assert!(artifact.body.contains("hostname=node1"));

    let active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    let args = |a: &[&str]| a.iter().map(ToString::to_string).collect::<Vec<_>>();

    let reply = engine
        .callback(&active.uuid, "preseed", &args(&["file"]))
        .await
        .unwrap();
    match reply {
        CallbackResponse::Artifact(file) => {
            assert_eq!(file.kind, ArtifactKind::AnswerFile);
            assert!(file.body.contains("get_hostname string node1"));
        }
        CallbackResponse::Ack => panic!("expected answer file"),
    }
    engine.callback(&active.uuid, "preseed", &args(&["end"])).await.unwrap();
    engine
        .callback(&active.uuid, "postinstall", &args(&["send_ips", "10.1.2.3"]))
        .await
        .unwrap();
    engine
        .callback(&active.uuid, "postinstall", &args(&["complete"]))
        .await
        .unwrap();

    let active = engine.active_model(&active.uuid).await.unwrap();
    assert_eq!(active.current_state(), State::OsComplete);
    assert!(active.is_complete());
    assert_eq!(active.node_ip.as_deref(), Some("10.1.2.3"));
    assert!(active.machine.log.iter().any(|e| e.method == "callback:postinstall"));

    assert_eq!(
        engine.boot_request(&id, None).await.kind,
        ArtifactKind::LocalBoot
    );

    let err = engine
        .callback(&active.uuid, "kickstart", &args(&["start"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine.callback("missing", "postinstall", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn timeout_sends_bound_node_back_to_microkernel() {
    let engine = engine();
    let mk = with_microkernel(&engine).await;
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    tag_rule(&engine, "pool", "a", "pool_a").await;
    engine
        .policies()
        .add(
            Policy::new("pool a", &coreos.uuid)
                .with_tags(["pool_a"], MatchMode::And)
                .enabled(true),
            None,
        )
        .await
        .unwrap();

    let id = HardwareIdentity::from_uuid("TIMEOUT");
    let node = engine.register(&id, None, facts(&[("pool", "a")])).await.unwrap();
    engine.checkin(&id, None).await.unwrap();

    let mut active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    let table = active.model.template.driver().transitions();
    active.machine.fire(table, provision::fsm::Action::Timeout, "test");
    engine.documents().persist(&active).await.unwrap();

    let artifact = engine.boot_request(&id, None).await;
    assert_eq!(artifact.kind, ArtifactKind::Microkernel);
    assert!(artifact.body.contains(&mk.uuid));
    let active = engine.active_model(&active.uuid).await.unwrap();
    assert_eq!(active.current_state(), State::TimeoutError);
}

#[tokio::test]
async fn rebind_request_is_consumed_by_in_memory_policy() {
    let engine = engine();
    with_microkernel(&engine).await;
    let rancher = model(&engine, TemplateKind::RancherosInMemory).await;
    tag_rule(&engine, "fleet", "edge", "edge").await;

    let id = HardwareIdentity::from_uuid("EDGE");
    let node = engine.register(&id, None, facts(&[("fleet", "edge")])).await.unwrap();
    engine.request_rebind(&node.uuid).await.unwrap();
    assert_eq!(engine.node_status(&node).await.unwrap(), NodeStatus::Rebind);

    // nothing matches yet: the request stays pending
    let artifact = engine.boot_request(&id, None).await;
    assert_eq!(artifact.kind, ArtifactKind::Microkernel);
    assert!(engine.rebind_request(&node.uuid).await.unwrap().is_some());

    engine
        .policies()
        .add(
            Policy::new("edge", &rancher.uuid)
                .with_tags(["edge"], MatchMode::And)
                .enabled(true),
            None,
        )
        .await
        .unwrap();

    let artifact = engine.boot_request(&id, None).await;
    assert_eq!(artifact.kind, ArtifactKind::InMemoryBoot);
    assert!(engine.rebind_request(&node.uuid).await.unwrap().is_none());
}

#[tokio::test]
async fn removing_binding_frees_policy_slot() {
    let engine = engine();
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    tag_rule(&engine, "role", "solo", "solo").await;
    let policy = engine
        .policies()
        .add(
            Policy::new("solo", &coreos.uuid)
                .with_tags(["solo"], MatchMode::And)
                .enabled(true)
                .with_maximum(1),
            None,
        )
        .await
        .unwrap();

    let id = HardwareIdentity::from_uuid("SOLO");
    let node = engine.register(&id, None, facts(&[("role", "solo")])).await.unwrap();
    engine.checkin(&id, None).await.unwrap();
    let active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();

    let err = engine.policies().remove(&policy.uuid).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    engine.remove_active_model(&active.uuid).await.unwrap();
    let stored = engine.policies().get(&policy.uuid).await.unwrap().unwrap();
    assert_eq!(stored.bind_count, 0);

    // rebinds with the next sequence number
    engine.checkin(&id, None).await.unwrap();
    let again = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    assert_eq!(again.counter, 2);
}

#[tokio::test]
async fn collision_keeps_id_on_earliest_node() {
    let engine = engine();
    let docs = engine.documents();

    let mut older = Node::new(vec!["AA".into(), "BB".into()]);
    older.last_checkin = Utc::now() - Duration::seconds(500);
    let mut newer = Node::new(vec!["BB".into(), "CC".into()]);
    newer.last_checkin = Utc::now() - Duration::seconds(5);
    let older = docs.persist(&older).await.unwrap();
    let newer = docs.persist(&newer).await.unwrap();

    let found = engine
        .registry()
        .lookup_by_hardware_id(&HardwareIdentity::from_macs(&["BB"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.uuid, older.uuid);

    let newer = engine.get_node(&newer.uuid).await.unwrap();
    assert_eq!(newer.hw_ids, vec!["CC"]);
}

#[tokio::test]
async fn json_file_store_round_trips_engine_state() {
    let dir = tempfile::tempdir().unwrap();
    let id = HardwareIdentity::from_uuid("DISK");

    let node_id = {
        let engine = Engine::new(
            Arc::new(JsonFileStore::new(dir.path())),
            EngineConfig::default(),
        )
        .unwrap();
        let node = engine.register(&id, None, facts(&[("k", "v")])).await.unwrap();
        engine.request_rebind(&node.uuid).await.unwrap();
        node.uuid
    };

    let engine = Engine::new(
        Arc::new(JsonFileStore::new(dir.path())),
        EngineConfig::default(),
    )
    .unwrap();
    let node = engine.get_node(&node_id).await.unwrap();
    assert_eq!(node.hw_ids, vec!["DISK"]);
    assert_eq!(engine.node_status(&node).await.unwrap(), NodeStatus::Rebind);
    assert!(dir.path().join("node").join(format!("{node_id}.json")).exists());
}

#[tokio::test]
async fn policy_removal_waits_for_in_flight_binding() {
    let store = Arc::new(FaultyStore::slow_binds(std::time::Duration::from_millis(200)));
    let engine = Arc::new(Engine::new(store.clone(), EngineConfig::default()).unwrap());
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    tag_rule(&engine, "role", "web", "web").await;
    let policy = tagged_policy(&engine, "web", &coreos, "web").await;

    let id = HardwareIdentity::from_uuid("INFLIGHT");
    let node = engine.register(&id, None, facts(&[("role", "web")])).await.unwrap();

    let checkin = {
        let engine = Arc::clone(&engine);
        let id = id.clone();
        tokio::spawn(async move { engine.checkin(&id, None).await })
    };
    store.bind_started.notified().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let err = engine.policies().remove(&policy.uuid).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    checkin.await.unwrap().unwrap();

    let active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    assert_eq!(active.policy_uuid, policy.uuid);
    let stored = engine.policies().get(&policy.uuid).await.unwrap().unwrap();
    assert_eq!(stored.bind_count, 1);
}

#[tokio::test]
async fn unreadable_model_falls_through_to_next_policy() {
    let engine = engine();
    let broken = model(&engine, TemplateKind::CoreosInMemory).await;
    let healthy = model(&engine, TemplateKind::RancherosInMemory).await;
    tag_rule(&engine, "zone", "z1", "z1").await;
    let first = tagged_policy(&engine, "first", &broken, "z1").await;
    let second = tagged_policy(&engine, "second", &healthy, "z1").await;
    corrupt(&engine, Kind::Model, &broken.uuid).await;

    let id = HardwareIdentity::from_uuid("FALLTHROUGH");
    let node = engine.register(&id, None, facts(&[("zone", "z1")])).await.unwrap();
    let command = engine.checkin(&id, None).await.unwrap();
    assert_eq!(command.command_name, CommandName::Acknowledge);

    let active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    assert_eq!(active.policy_uuid, second.uuid);
    let first = engine.policies().get(&first.uuid).await.unwrap().unwrap();
    assert_eq!(first.bind_count, 0);
}

#[tokio::test]
async fn failed_policy_write_falls_through_to_next_policy() {
    let store = Arc::new(FaultyStore::default());
    let engine = Engine::new(store.clone(), EngineConfig::default()).unwrap();
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    tag_rule(&engine, "zone", "z2", "z2").await;
    let first = tagged_policy(&engine, "first", &coreos, "z2").await;
    let second = tagged_policy(&engine, "second", &coreos, "z2").await;
    store.reject_writes_to(&first.uuid);

    let id = HardwareIdentity::from_uuid("WRITEFAIL");
    let node = engine.register(&id, None, facts(&[("zone", "z2")])).await.unwrap();
    engine.checkin(&id, None).await.unwrap();

    let active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    assert_eq!(active.policy_uuid, second.uuid);
}

#[tokio::test]
async fn broken_tag_rule_does_not_block_binding() {
    let engine = engine();
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    engine
        .add_tag_rule(TagRule::new(
            "broken",
            "never",
            vec![TagMatcher::like("vendor", "(")],
        ))
        .await
        .unwrap();
    tag_rule(&engine, "vendor", "acme", "acme").await;
    let policy = tagged_policy(&engine, "acme", &coreos, "acme").await;

    let id = HardwareIdentity::from_uuid("BROKENRULE");
    let node = engine.register(&id, None, facts(&[("vendor", "acme")])).await.unwrap();
    engine.checkin(&id, None).await.unwrap();

    let active = engine.find_active_model(&node.uuid).await.unwrap().unwrap();
    assert_eq!(active.policy_uuid, policy.uuid);
}

#[tokio::test]
async fn rebind_skips_unreadable_in_memory_model() {
    let engine = engine();
    with_microkernel(&engine).await;
    let rancher = model(&engine, TemplateKind::RancherosInMemory).await;
    tag_rule(&engine, "fleet", "zzz", "zzz").await;
    tagged_policy(&engine, "zzz only", &rancher, "zzz").await;
    corrupt(&engine, Kind::Model, &rancher.uuid).await;

    // the node does not carry the policy's tag
    let id = HardwareIdentity::from_uuid("OTHER-FLEET");
    let node = engine.register(&id, None, facts(&[("fleet", "aaa")])).await.unwrap();
    engine.request_rebind(&node.uuid).await.unwrap();
    let artifact = engine.boot_request(&id, None).await;
    assert_eq!(artifact.kind, ArtifactKind::Microkernel);
    assert!(engine.rebind_request(&node.uuid).await.unwrap().is_some());

    // the node matches but the model cannot be read
    let id = HardwareIdentity::from_uuid("ZZZ-FLEET");
    let node = engine.register(&id, None, facts(&[("fleet", "zzz")])).await.unwrap();
    engine.request_rebind(&node.uuid).await.unwrap();
    let artifact = engine.boot_request(&id, None).await;
    assert_eq!(artifact.kind, ArtifactKind::Microkernel);
    assert!(engine.rebind_request(&node.uuid).await.unwrap().is_some());
}

#[tokio::test]
async fn unreadable_image_boots_error_script() {
    let engine = engine();
    with_microkernel(&engine).await;
    let coreos = model(&engine, TemplateKind::CoreosInMemory).await;
    tag_rule(&engine, "pool", "img", "img").await;
    tagged_policy(&engine, "img", &coreos, "img").await;

    let id = HardwareIdentity::from_uuid("BADIMAGE");
    let node = engine.register(&id, None, facts(&[("pool", "img")])).await.unwrap();
    engine.checkin(&id, None).await.unwrap();
    assert!(engine.find_active_model(&node.uuid).await.unwrap().is_some());

    let image_id = coreos.image_id.clone().unwrap();
    corrupt(&engine, Kind::Image, &image_id).await;

    let artifact = engine.boot_request(&id, None).await;
    assert_eq!(artifact.kind, ArtifactKind::ErrorScript);
}

#[tokio::test]
async fn unreadable_node_is_treated_as_unknown() {
    let engine = engine();
    with_microkernel(&engine).await;
    let id = HardwareIdentity::from_uuid("GARBLED");
    let node = engine.register(&id, None, facts(&[("cpus", "2")])).await.unwrap();
    corrupt(&engine, Kind::Node, &node.uuid).await;

    let command = engine.checkin(&id, None).await.unwrap();
    assert_eq!(command.command_name, CommandName::Register);

    let artifact = engine.boot_request(&id, None).await;
    assert_eq!(artifact.kind, ArtifactKind::Microkernel);
}
