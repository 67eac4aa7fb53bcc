// ABOUTME: `scamp` command-line entry point
// ABOUTME: Inspect, create and delete resources, wait on jobs, and browse the catalog

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use scamp_reconciler::catalog::{self, CatalogEntry};
use scamp_reconciler::reconcile::{
    InstanceReconciler, NetworkReconciler, NetworkSpec, RouterReconciler, RouterSpec,
    SshKeyReconciler, VmReconciler, VolumeReconciler,
};
use scamp_reconciler::remote::models::{NetworkClass, StorageClass, VmClass, VmTemplate};
use scamp_reconciler::{ClientConfig, JobHandle, Reconciler, RemoteClient, ResourceId};

#[derive(Parser)]
#[command(name = "scamp", author, version, about, long_about = None)]
struct Args {
    /// Optional TOML config file (api_url, token, timeouts)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// SSH keys
    SshKey {
        #[command(subcommand)]
        action: IdAction,
    },
    /// Private and public networks
    Network {
        #[command(subcommand)]
        action: NetworkAction,
    },
    /// Routers
    Router {
        #[command(subcommand)]
        action: RouterAction,
    },
    /// Virtual machines
    Vm {
        #[command(subcommand)]
        action: IdAction,
    },
    /// Block volumes
    Volume {
        #[command(subcommand)]
        action: IdAction,
    },
    /// Legacy job-based instances
    Instance {
        #[command(subcommand)]
        action: IdAction,
    },
    /// Asynchronous jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// VM classes, storage classes, network classes and templates
    Catalog {
        kind: CatalogKind,
        /// Show only the active entry with this name (os_type for templates)
        #[arg(long, value_name = "KEY")]
        key: Option<String>,
    },
}

#[derive(Subcommand)]
enum IdAction {
    /// Print the current state
    Get { id: String },
    /// Delete; succeeds if already gone
    Delete {
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum NetworkAction {
    #[command(flatten)]
    Common(IdAction),
    /// Create a network and wait until it is active
    Create {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        cidr: Option<String>,
        /// Make the network public and attach it to this router
        #[arg(long, value_name = "ROUTER_UUID")]
        router: Option<String>,
    },
}

#[derive(Subcommand)]
enum RouterAction {
    #[command(flatten)]
    Common(IdAction),
    /// Create a router and wait until it is active
    Create {
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Wait for a job given its status URL or id
    Wait {
        job: String,
        /// Give up after this many seconds (default: configured job wait)
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CatalogKind {
    VmClasses,
    StorageClasses,
    NetworkClasses,
    VmTemplates,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ClientConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let client = RemoteClient::new(Arc::new(config)).context("Failed to build API client")?;

    let token = client.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            token.cancel();
        }
    });

    match args.command {
        Command::SshKey { action } => {
            let r = SshKeyReconciler::new(client);
            match action {
                IdAction::Get { id } => print_json(&get(&r, &numeric_id(&id)?).await?.key),
                IdAction::Delete { id, yes } => delete(&r, &numeric_id(&id)?, "ssh key", yes).await,
            }
        }
        Command::Network { action } => {
            let r = NetworkReconciler::new(client);
            match action {
                NetworkAction::Common(IdAction::Get { id }) => print_json(&get(&r, &id).await?.network),
                NetworkAction::Common(IdAction::Delete { id, yes }) => {
                    delete(&r, &id, "network", yes).await
                }
                NetworkAction::Create { name, cidr, router } => {
                    let mut spec = match router {
                        Some(router) => NetworkSpec::public(router),
                        None => NetworkSpec::private(),
                    };
                    spec.name = name;
                    spec.cidr = cidr;
                    let state = r.create(&spec).await.context("Failed to create network")?;
                    print_json(&state.network)
                }
            }
        }
        Command::Router { action } => {
            let r = RouterReconciler::new(client);
            match action {
                RouterAction::Common(IdAction::Get { id }) => print_json(&get(&r, &id).await?.router),
                RouterAction::Common(IdAction::Delete { id, yes }) => {
                    delete(&r, &id, "router", yes).await
                }
                RouterAction::Create { name } => {
                    let spec = RouterSpec {
                        name,
                        ..Default::default()
                    };
                    let state = r.create(&spec).await.context("Failed to create router")?;
                    print_json(&state.router)
                }
            }
        }
        Command::Vm { action } => {
            let r = VmReconciler::new(client);
            match action {
                IdAction::Get { id } => print_json(&get(&r, &id).await?.vm),
                IdAction::Delete { id, yes } => delete(&r, &id, "vm", yes).await,
            }
        }
        Command::Volume { action } => {
            let r = VolumeReconciler::new(client);
            match action {
                IdAction::Get { id } => print_json(&get(&r, &id).await?),
                IdAction::Delete { id, yes } => delete(&r, &id, "volume", yes).await,
            }
        }
        Command::Instance { action } => {
            let r = InstanceReconciler::new(client);
            match action {
                IdAction::Get { id } => print_json(&get(&r, &numeric_id(&id)?).await?.instance),
                IdAction::Delete { id, yes } => delete(&r, &numeric_id(&id)?, "instance", yes).await,
            }
        }
        Command::Job {
            action: JobAction::Wait { job, timeout },
        } => wait_job(&client, &job, timeout).await,
        Command::Catalog { kind, key } => match kind {
            CatalogKind::VmClasses => show_catalog::<VmClass>(&client, key).await,
            CatalogKind::StorageClasses => show_catalog::<StorageClass>(&client, key).await,
            CatalogKind::NetworkClasses => show_catalog::<NetworkClass>(&client, key).await,
            CatalogKind::VmTemplates => show_catalog::<VmTemplate>(&client, key).await,
        },
    }
}

fn numeric_id(raw: &str) -> Result<ResourceId> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(ResourceId(id)),
        _ => bail!("Expected a positive numeric id, got {:?}", raw),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn get<R: Reconciler>(reconciler: &R, id: &R::Id) -> Result<R::Observed> {
    reconciler
        .read(id)
        .await
        .with_context(|| format!("Failed to read {}", id))?
        .ok_or_else(|| anyhow!("{} does not exist", id))
}

async fn delete<R: Reconciler>(reconciler: &R, id: &R::Id, kind: &str, yes: bool) -> Result<()> {
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete {} {}?", kind, id))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }
    reconciler
        .delete(id)
        .await
        .with_context(|| format!("Failed to delete {} {}", kind, id))?;
    println!("Deleted {} {}", kind, id);
    Ok(())
}

fn job_handle(raw: &str) -> Result<JobHandle> {
    let raw = raw.trim();
    let handle = if raw.contains('/') {
        JobHandle::new(Some(raw.to_string()), None)
    } else {
        JobHandle::new(None, Some(raw.to_string()))
    };
    handle.ok_or_else(|| anyhow!("Job status URL or id must not be empty"))
}

async fn wait_job(client: &RemoteClient, raw: &str, timeout: Option<u64>) -> Result<()> {
    let handle = job_handle(raw)?;
    let timeouts = &client.config().timeouts;
    let timeout = timeout.map(Duration::from_secs).unwrap_or(timeouts.job_wait);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(format!("Waiting for {}", handle.label()));

    let polled = tokio::time::timeout(
        timeout,
        client.poll_until_complete(&handle, timeouts.job_poll_interval, |s| {
            spinner.set_message(format!("{}: {} ({}%)", handle.label(), s.status, s.progress));
        }),
    )
    .await;

    let status = match polled {
        Ok(result) => result.with_context(|| format!("Failed to poll {}", handle.label()))?,
        Err(_) => {
            spinner.abandon_with_message("timed out");
            bail!("Timed out after {:?} waiting for {}", timeout, handle.label());
        }
    };

    let status = match status.into_result(handle.address()) {
        Ok(status) => status,
        Err(e) => {
            spinner.abandon_with_message("failed");
            return Err(e.into());
        }
    };
    spinner.finish_with_message(format!("{} finished", handle.label()));

    if let Some(id) = &status.resource_id {
        println!("resource_id: {}", id.as_text());
    }
    Ok(())
}

async fn show_catalog<T: CatalogEntry + Serialize>(
    client: &RemoteClient,
    key: Option<String>,
) -> Result<()> {
    match key {
        Some(key) => print_json(&catalog::find_active::<T>(client, &key).await?),
        None => print_json(&catalog::list::<T>(client).await?),
    }
}
