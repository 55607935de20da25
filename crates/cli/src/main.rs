use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rsecret_apply::{describe_action, plan};
use rsecret_classify::{classify_remote_secret, TargetClassification};
use rsecret_core::{RemoteSecret, TargetIdentity};
use rsecret_kubehub::{
    field_manager_from_env, get_kube_client, parse_cluster_mapping, ClusterClients, ControllerContext, DataStore,
    KubeDeployer,
};
use rsecret_store::{queue_cap_from_env, workers_from_env};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rsecretctl", version, about = "Remote secret controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify the targets of a RemoteSecret manifest (YAML or JSON)
    Classify {
        file: PathBuf,
    },
    /// Show the actions one sync pass would take for a RemoteSecret manifest
    Plan {
        file: PathBuf,
    },
    /// Run the controller against the current cluster
    Run {
        /// Only watch this namespace
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Parallel reconcile workers
        #[arg(long, env = "RSECRET_WORKERS")]
        workers: Option<usize>,
        /// Reconcile queue capacity
        #[arg(long = "queue-cap", env = "RSECRET_QUEUE_CAP")]
        queue_cap: Option<usize>,
        /// Target cluster client, as <apiUrl>=<kubeconfig context>; repeatable
        #[arg(long = "cluster", value_parser = parse_cluster_mapping)]
        clusters: Vec<(String, String)>,
    },
}

fn init_tracing() {
    let env = std::env::var("RSECRET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RSECRET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RSECRET_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_remote_secret(text: &str) -> Result<RemoteSecret> {
    // YAML is a superset of JSON
    let value: serde_json::Value = serde_yaml::from_str(text).context("parsing manifest")?;
    Ok(RemoteSecret::from_value(value)?)
}

fn load_remote_secret(path: &Path) -> Result<RemoteSecret> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_remote_secret(&text).with_context(|| format!("loading {}", path.display()))
}

fn render_classification(rs: &RemoteSecret, c: &TargetClassification) -> Vec<String> {
    let spec = &rs.spec.targets;
    let status = &rs.status.targets;
    let mut lines = Vec::new();
    for (s, st) in &c.sync {
        match st {
            Some(st) => lines.push(format!("sync      spec[{}] {} <- status[{}]", s, spec[s.0].key(), st)),
            None => lines.push(format!("sync      spec[{}] {} (new)", s, spec[s.0].key())),
        }
    }
    for (primary, dup, matched) in c.duplicates() {
        let m = matched.map(|m| format!("status[{}]", m)).unwrap_or_else(|| "-".to_string());
        lines.push(format!("duplicate spec[{}] {} of spec[{}] ({})", dup, spec[dup.0].key(), primary, m));
    }
    for st in &c.remove {
        lines.push(format!("remove    status[{}] {}", st, status[st.0].key()));
    }
    for st in &c.orphan_duplicate_statuses {
        lines.push(format!("orphan    status[{}] {}", st, status[st.0].key()));
    }
    let s = c.summary();
    lines.push(format!(
        "create={} update={} duplicates={} remove={} orphaned={}",
        s.to_create, s.to_update, s.duplicates, s.to_remove, s.orphaned
    ));
    lines
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Classify { file } => {
            let rs = load_remote_secret(&file)?;
            let c = classify_remote_secret(&rs);
            match cli.output {
                Output::Human => {
                    for line in render_classification(&rs, &c) {
                        println!("{}", line);
                    }
                }
                Output::Json => {
                    let out = serde_json::json!({ "classification": c, "summary": c.summary() });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Plan { file } => {
            let rs = load_remote_secret(&file)?;
            let p = plan(&rs);
            match cli.output {
                Output::Human => {
                    for a in &p.actions {
                        println!("{}", describe_action(&rs, a));
                    }
                    for d in &p.duplicates {
                        println!("duplicate target {} of {} ({})", d.duplicate, d.primary, d.location);
                    }
                    if p.actions.is_empty() {
                        println!("nothing to do");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&p)?),
            }
        }
        Commands::Run { namespace, workers, queue_cap, clusters } => {
            let workers = workers.unwrap_or_else(workers_from_env);
            let queue_cap = queue_cap.unwrap_or_else(queue_cap_from_env);
            let field_manager = field_manager_from_env();
            let client = get_kube_client().await?;
            let clients = ClusterClients::from_contexts(client.clone(), &clusters).await?;
            let ctx = Arc::new(ControllerContext {
                client: client.clone(),
                deployer: KubeDeployer::new(clients, field_manager.clone()),
                data: DataStore::new(client, field_manager.clone()),
                field_manager,
                namespace,
            });
            info!(workers, queue_cap, clusters = clusters.len(), "starting controller");
            let shutdown = async {
                if let Err(e) = signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for ctrl-c");
                }
            };
            rsecret_kubehub::run(ctx, workers, queue_cap, shutdown).await?;
        }
    }
    Ok(())
}
