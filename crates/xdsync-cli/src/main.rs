//! xdsync - fetch or watch resources from a static discovery snapshot

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xdsync_core::{XdsConfig, LDS_TYPE_URL};
use xdsync_protocol::{JsonDecoder, XdsEngine};
use xdsync_static::{Snapshot, StaticDiscoveryServer};

#[derive(Parser)]
#[command(name = "xdsync")]
#[command(about = "Discovery protocol client")]
struct Args {
    /// Snapshot file served to the client
    #[arg(long)]
    snapshot: PathBuf,

    /// Client configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resource type to fetch
    #[arg(long, default_value = LDS_TYPE_URL)]
    type_url: String,

    /// Resource name to subscribe to (repeatable, all when omitted)
    #[arg(long = "resource")]
    resources: Vec<String>,

    /// Keep the subscription open and print every update
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => XdsConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => XdsConfig::default(),
    };
    let snapshot = Snapshot::load(&args.snapshot)
        .with_context(|| format!("loading snapshot {}", args.snapshot.display()))?;

    tracing::info!(
        snapshot = %args.snapshot.display(),
        version = %snapshot.version,
        type_url = %args.type_url,
        watch = args.watch,
        "Starting xdsync"
    );

    let server = StaticDiscoveryServer::new(snapshot);
    let engine = XdsEngine::builder(
        config,
        JsonDecoder::<Value>::new(args.type_url.clone()),
        Arc::new(server),
    )
    .build()?;

    let names: BTreeSet<String> = args.resources.into_iter().collect();

    if !args.watch {
        for resource in engine.get_resource(names).await? {
            println!("{}", serde_json::to_string(&resource)?);
        }
        return Ok(());
    }

    let id = engine
        .observe_resource(names, |resources| {
            for resource in &resources {
                match serde_json::to_string(resource) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "Failed to print resource"),
                }
            }
        })
        .await;
    tracing::info!(subscription = %id, "Watching, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    engine.shutdown();

    Ok(())
}
