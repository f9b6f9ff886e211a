//! provisiond - node binding engine daemon and admin tool.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use provision::models::parse_tag_expression;
use provision::{
    Engine, EngineConfig, ExpirySweeper, HardwareIdentity, Image, ImageKind, JsonFileStore, Model,
    Policy, PolicyUpdate, TagMatcher, TagRule, TemplateKind,
};

/// provisiond - node binding and provisioning engine.
#[derive(Parser)]
#[command(name = "provisiond")]
#[command(about = "Bind booting nodes to provisioning policies")]
struct Cli {
    /// Engine config file (or set `PROVISION_CONFIG` env var).
    #[arg(long, env = "PROVISION_CONFIG", default_value = "provision.yaml")]
    config: PathBuf,

    /// Override the document store directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one expiry sweep and exit.
    Sweep,

    /// Run the expiry sweep until interrupted.
    Serve,

    /// List nodes with their status.
    Nodes,

    /// Show the tags a node currently carries.
    Tags {
        /// Node ID.
        #[arg(long)]
        node: String,
    },

    /// List active bindings.
    Active,

    /// Drop an active binding, freeing its policy slot.
    Unbind {
        /// Active model ID.
        #[arg(long)]
        id: String,
    },

    /// Request a rebind for a node on its next boot.
    Rebind {
        /// Node ID.
        #[arg(long)]
        node: String,
    },

    /// Cancel a pending rebind request.
    CancelRebind {
        /// Node ID.
        #[arg(long)]
        node: String,
    },

    /// Print the boot script a node would receive.
    Boot {
        /// SMBIOS uuid.
        #[arg(long)]
        uuid: Option<String>,

        /// MAC addresses (comma-separated).
        #[arg(long, value_delimiter = ',')]
        mac: Vec<String>,

        /// Legacy `_`-joined hardware id (used when neither uuid nor mac is given).
        #[arg(long)]
        hw_id: Option<String>,
    },

    /// Manage the policy table.
    Policy {
        #[command(subcommand)]
        action: PolicyCommands,
    },

    /// Manage models.
    Model {
        #[command(subcommand)]
        action: ModelCommands,
    },

    /// Manage boot images.
    Image {
        #[command(subcommand)]
        action: ImageCommands,
    },

    /// Manage tag rules.
    Tag {
        #[command(subcommand)]
        action: TagCommands,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// List policies in match order.
    List,

    /// Add a policy.
    Add {
        /// Policy label.
        #[arg(long)]
        label: String,

        /// Model ID.
        #[arg(long)]
        model: String,

        /// Tags, `a,b` (all) or `a|b` (any).
        #[arg(long)]
        tags: Option<String>,

        /// Maximum concurrent bindings (0 = unlimited).
        #[arg(long, default_value = "0")]
        maximum: u32,

        /// Table position (default: end, before the default policy).
        #[arg(long)]
        index: Option<usize>,

        /// Start enabled.
        #[arg(long)]
        enabled: bool,

        /// Make this the catch-all default policy.
        #[arg(long = "default")]
        is_default: bool,

        /// Broker handoff target.
        #[arg(long)]
        broker: Option<String>,
    },

    /// Change a policy in place.
    Update {
        /// Policy ID.
        #[arg(long)]
        id: String,

        /// New label.
        #[arg(long)]
        label: Option<String>,

        /// New tags, `a,b` (all) or `a|b` (any).
        #[arg(long)]
        tags: Option<String>,

        /// New maximum.
        #[arg(long)]
        maximum: Option<u32>,

        /// Enable or disable.
        #[arg(long)]
        enabled: Option<bool>,
    },

    /// Move a policy to a new table position.
    Move {
        /// Policy ID.
        #[arg(long)]
        id: String,

        /// New position.
        #[arg(long)]
        index: usize,
    },

    /// Remove a policy with no active bindings.
    Remove {
        /// Policy ID.
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// List models.
    List,

    /// Add a model.
    Add {
        /// Model label.
        #[arg(long)]
        label: String,

        /// Template (boot_local, discover_only, coreos_in_memory, ...).
        #[arg(long)]
        template: TemplateKind,

        /// Image ID.
        #[arg(long)]
        image: Option<String>,

        /// Hostname prefix.
        #[arg(long, default_value = "node")]
        hostname_prefix: String,

        /// Domain name.
        #[arg(long, default_value = "localdomain")]
        domainname: String,
    },

    /// Remove a model no policy uses.
    Remove {
        /// Model ID.
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum ImageCommands {
    /// List images.
    List,

    /// Register an unpacked image.
    Add {
        /// Image kind (microkernel, os, esxi).
        #[arg(long)]
        kind: ImageKind,

        /// Display name.
        #[arg(long, default_value = "")]
        name: String,

        /// Version string.
        #[arg(long)]
        os_version: String,

        /// Kernel path.
        #[arg(long)]
        kernel: String,

        /// Initrd path.
        #[arg(long)]
        initrd: String,
    },

    /// Remove an image no model uses.
    Remove {
        /// Image ID.
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum TagCommands {
    /// List tag rules.
    List,

    /// Add a tag rule; every matcher must hold.
    Add {
        /// Rule name.
        #[arg(long)]
        name: String,

        /// Tag to apply (`%key%` is replaced with the attribute value).
        #[arg(long)]
        tag: String,

        /// `key=value` equality matcher (repeatable).
        #[arg(long)]
        equal: Vec<String>,

        /// `key=pattern` regex matcher (repeatable).
        #[arg(long)]
        like: Vec<String>,
    },

    /// Remove a tag rule.
    Remove {
        /// Rule ID.
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = EngineConfig::load(&cli.config)
        .await
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(dir) = cli.data_dir {
        config.persist_path = dir;
    }

    let store = JsonFileStore::new(&config.persist_path);
    let engine =
        Arc::new(Engine::new(Arc::new(store), config).context("Failed to create engine")?);

    match cli.command {
        Commands::Sweep => {
            let removed = engine.expire_nodes().await?;
            println!("\nExpired {} node(s)", removed.len());
            for id in removed {
                println!("  {id}");
            }
        }

        Commands::Serve => {
            let sweeper = ExpirySweeper::spawn(Arc::clone(&engine));
            info!("provisiond running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
            sweeper.shutdown().await;
        }

        Commands::Nodes => {
            let nodes = engine.list_nodes().await?;
            println!(
                "\n{:<34} {:<10} {:<26} {:<20}",
                "ID", "STATUS", "LAST CHECKIN", "HW IDS"
            );
            println!("{}", "-".repeat(92));
            for view in nodes {
                println!(
                    "{:<34} {:<10} {:<26} {:<20}",
                    view.node.uuid,
                    view.status,
                    view.node.last_checkin.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    view.node.hw_ids.join(",")
                );
            }
        }

        Commands::Tags { node } => {
            let node = engine.get_node(&node).await?;
            let tags = engine.node_tags(&node).await?;
            println!("\nTags for node {}:", node.uuid);
            for tag in tags {
                println!("  {tag}");
            }
        }

        Commands::Active => {
            let active = engine.active_models().await?;
            println!(
                "\n{:<20} {:<14} {:<34} {:<8} {:<34}",
                "LABEL", "STATE", "NODE", "BIND #", "ID"
            );
            println!("{}", "-".repeat(112));
            for am in active {
                println!(
                    "{:<20} {:<14} {:<34} {:<8} {:<34}",
                    am.label,
                    am.current_state().to_string(),
                    am.node_uuid,
                    am.counter,
                    am.uuid
                );
            }
        }

        Commands::Unbind { id } => {
            let removed = engine.remove_active_model(&id).await?;
            println!("\n✅ Removed binding {} of node {}", removed.uuid, removed.node_uuid);
        }

        Commands::Rebind { node } => {
            let request = engine.request_rebind(&node).await?;
            println!("\n✅ Rebind requested for node {}", request.node_uuid);
        }

        Commands::CancelRebind { node } => {
            let request = engine.cancel_rebind(&node).await?;
            println!("\n✅ Rebind request cancelled for node {}", request.node_uuid);
        }

        Commands::Boot { uuid, mac, hw_id } => {
            let identity = match hw_id {
                Some(joined) if uuid.is_none() && mac.is_empty() => {
                    HardwareIdentity::from_joined(&joined)
                }
                _ => {
                    let macs: Vec<&str> = mac.iter().map(String::as_str).collect();
                    HardwareIdentity::new(uuid.as_deref(), &macs)
                }
            };
            let artifact = engine.boot_request(&identity, None).await;
            println!("{}", artifact.body);
        }

        Commands::Policy { action } => handle_policy_command(&engine, action).await?,
        Commands::Model { action } => handle_model_command(&engine, action).await?,
        Commands::Image { action } => handle_image_command(&engine, action).await?,
        Commands::Tag { action } => handle_tag_command(&engine, action).await?,
    }

    Ok(())
}

async fn handle_policy_command(engine: &Engine, action: PolicyCommands) -> Result<()> {
    match action {
        PolicyCommands::List => {
            let policies = engine.policies().list().await?;
            println!(
                "\n{:<4} {:<8} {:<20} {:<30} {:<8} {:<34}",
                "#", "ENABLED", "LABEL", "TAGS", "#/MAX", "ID"
            );
            println!("{}", "-".repeat(108));
            for policy in policies {
                let tags = if policy.is_default {
                    "**default**".to_string()
                } else {
                    format!("[{}] ({})", policy.tags.join(","), policy.match_using)
                };
                let max = if policy.maximum == 0 {
                    "-".to_string()
                } else {
                    policy.maximum.to_string()
                };
                println!(
                    "{:<4} {:<8} {:<20} {:<30} {:<8} {:<34}",
                    policy.line_number,
                    policy.enabled,
                    policy.label,
                    tags,
                    format!("{}/{max}", policy.bind_count),
                    policy.uuid
                );
            }
        }

        PolicyCommands::Add {
            label,
            model,
            tags,
            maximum,
            index,
            enabled,
            is_default,
            broker,
        } => {
            let mut policy = if is_default {
                Policy::new(label, model).as_default()
            } else {
                Policy::new(label, model).enabled(enabled)
            };
            if let Some(expr) = tags {
                let (tags, mode) = parse_tag_expression(&expr)?;
                policy = policy.with_tags(tags, mode);
            }
            if maximum > 0 {
                policy = policy.with_maximum(maximum);
            }
            if let Some(broker) = broker {
                policy = policy.with_broker(broker);
            }
            let added = engine.policies().add(policy, index).await?;
            let position = engine.policies().position_of(&added.uuid).await?;
            println!("\n✅ Added policy {} at position {position}", added.uuid);
        }

        PolicyCommands::Update {
            id,
            label,
            tags,
            maximum,
            enabled,
        } => {
            let tags = tags.map(|expr| parse_tag_expression(&expr)).transpose()?;
            let update = PolicyUpdate {
                label,
                enabled,
                maximum,
                tags,
            };
            let updated = engine.policies().update(&id, update).await?;
            println!("\n✅ Updated policy {}", updated.uuid);
        }

        PolicyCommands::Move { id, index } => {
            if engine.policies().move_to(&id, index).await? {
                println!("\n✅ Moved policy {id} to position {index}");
            } else {
                println!("\nPolicy {id} is already at position {index}");
            }
        }

        PolicyCommands::Remove { id } => {
            let removed = engine.policies().remove(&id).await?;
            println!("\n✅ Removed policy {} ({})", removed.uuid, removed.label);
        }
    }
    Ok(())
}

async fn handle_model_command(engine: &Engine, action: ModelCommands) -> Result<()> {
    match action {
        ModelCommands::List => {
            let models = engine.models().await?;
            println!(
                "\n{:<20} {:<20} {:<34} {:<34}",
                "LABEL", "TEMPLATE", "IMAGE", "ID"
            );
            println!("{}", "-".repeat(110));
            for model in models {
                println!(
                    "{:<20} {:<20} {:<34} {:<34}",
                    model.label,
                    model.template.to_string(),
                    model.image_id.as_deref().unwrap_or("-"),
                    model.uuid
                );
            }
        }

        ModelCommands::Add {
            label,
            template,
            image,
            hostname_prefix,
            domainname,
        } => {
            let mut model = Model::new(label, template);
            model.image_id = image;
            model.hostname_prefix = hostname_prefix;
            model.domainname = domainname;
            let added = engine.add_model(model).await?;
            println!("\n✅ Added model {} ({})", added.uuid, added.template);
        }

        ModelCommands::Remove { id } => {
            let removed = engine.remove_model(&id).await?;
            println!("\n✅ Removed model {} ({})", removed.uuid, removed.label);
        }
    }
    Ok(())
}

async fn handle_image_command(engine: &Engine, action: ImageCommands) -> Result<()> {
    match action {
        ImageCommands::List => {
            let images = engine.images().await?;
            println!(
                "\n{:<12} {:<20} {:<24} {:<9} {:<34}",
                "KIND", "NAME", "VERSION", "VERIFIED", "ID"
            );
            println!("{}", "-".repeat(103));
            for image in images {
                println!(
                    "{:<12} {:<20} {:<24} {:<9} {:<34}",
                    image.kind, image.name, image.os_version, image.verified, image.uuid
                );
            }
        }

        ImageCommands::Add {
            kind,
            name,
            os_version,
            kernel,
            initrd,
        } => {
            let mut image = Image::new(kind, os_version, kernel, initrd);
            image.name = name;
            let added = engine.add_image(image).await?;
            println!("\n✅ Added {} image {}", added.kind, added.uuid);
        }

        ImageCommands::Remove { id } => {
            let removed = engine.remove_image(&id).await?;
            println!("\n✅ Removed image {}", removed.uuid);
        }
    }
    Ok(())
}

async fn handle_tag_command(engine: &Engine, action: TagCommands) -> Result<()> {
    match action {
        TagCommands::List => {
            let rules = engine.tag_rules().await?;
            println!("\n{:<20} {:<24} {:<10} {:<34}", "NAME", "TAG", "MATCHERS", "ID");
            println!("{}", "-".repeat(91));
            for rule in rules {
                println!(
                    "{:<20} {:<24} {:<10} {:<34}",
                    rule.name,
                    rule.tag,
                    rule.matchers.len(),
                    rule.uuid
                );
            }
        }

        TagCommands::Add {
            name,
            tag,
            equal,
            like,
        } => {
            let mut matchers = Vec::with_capacity(equal.len() + like.len());
            for pair in &equal {
                let (key, value) = split_pair(pair)?;
                matchers.push(TagMatcher::equal(key, value));
            }
            for pair in &like {
                let (key, pattern) = split_pair(pair)?;
                matchers.push(TagMatcher::like(key, pattern));
            }
            let added = engine.add_tag_rule(TagRule::new(name, tag, matchers)).await?;
            println!("\n✅ Added tag rule {} ({})", added.uuid, added.tag);
        }

        TagCommands::Remove { id } => {
            let removed = engine.remove_tag_rule(&id).await?;
            println!("\n✅ Removed tag rule {}", removed.uuid);
        }
    }
    Ok(())
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim(), value.trim()))
        .ok_or_else(|| anyhow!("Expected key=value, got '{pair}'"))
}
