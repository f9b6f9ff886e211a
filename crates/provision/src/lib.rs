//! Node binding and provisioning engine.
//!
//! A booting node checks in, gets identified by its hardware ids, is
//! matched against an ordered table of tag-based policies and is then
//! driven by the bound model's state machine until its OS is installed.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use provision::{Engine, EngineConfig, HardwareIdentity, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default())?;
//!
//!     // An unknown node is asked to register
//!     let id = HardwareIdentity::from_macs(&["52:54:00:12:34:56"]);
//!     let command = engine.checkin(&id, None).await?;
//!
//!     // Boot requests always get a script back
//!     let artifact = engine.boot_request(&id, None).await;
//!     println!("{}", artifact.body);
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod boot;
pub mod config;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod fsm;
pub mod models;
pub mod policy;
pub mod registry;
pub mod store;
pub mod tags;
pub mod templates;

pub use boot::{ArtifactKind, BootArtifact, BootTemplates};
pub use config::{ConfigError, EngineConfig};
pub use engine::{CallbackResponse, Engine, NodeView};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use expiry::ExpirySweeper;
pub use models::{
    ActiveModel, Command, CommandName, HardwareIdentity, Image, ImageKind, MatchMode, Node,
    NodeStatus, Policy, RebindRequest,
};
pub use policy::{PolicyService, PolicyTable, PolicyUpdate};
pub use registry::NodeRegistry;
pub use store::{Documents, JsonFileStore, MemoryStore, Store};
pub use tags::{TagMatcher, TagRule};
pub use templates::{Model, TemplateKind};
