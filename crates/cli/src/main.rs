use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{Parser, Subcommand, ValueEnum};
use kato_core::{tokens::EnvTokenIssuer, Provider};
use kato_kubehub::KubeConnector;
use kato_ops::{parse_operations, Collaborators, KatoOps, Ops};
use kato_persist::SqliteStore;
use serde_json::Value as Json;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "katoctl", version, about = "Kato: Spinnaker-style manifest operations against Kubernetes accounts")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database holding accounts and task records
    #[arg(long = "db", env = "KATO_DB_PATH", global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage account providers
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// List the kinds an account's cluster serves
    Discover {
        account: String,
    },
    /// Run an operations document (JSON or YAML array) as one task
    Run {
        file: PathBuf,
    },
    /// Replay a task and report the rollout status of what it touched
    Task {
        id: String,
    },
    /// Show one live manifest and its rollout status
    Manifest {
        #[arg(long)]
        account: String,
        /// Namespace
        #[arg(long)]
        location: String,
        /// "<kind> <name>", e.g. "deployment web"
        name: String,
    },
    /// Server groups of an application across its accounts
    ServerGroups {
        app: String,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCommands {
    /// Add or replace an account
    Add {
        name: String,
        #[arg(long)]
        host: String,
        /// PEM CA bundle file
        #[arg(long = "ca-file")]
        ca_file: Option<PathBuf>,
        /// Static bearer token; when absent a token is issued per call
        #[arg(long)]
        token: Option<String>,
        /// Token provider reference passed to the token issuer
        #[arg(long = "token-provider")]
        token_provider: Option<String>,
    },
    /// List accounts
    Ls,
    /// Remove an account
    Rm {
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KATO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KATO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KATO_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_store(path: Option<&str>) -> Result<Arc<SqliteStore>> {
    let store = match path {
        Some(p) => SqliteStore::open(p)?,
        None => SqliteStore::open_default()?,
    };
    Ok(Arc::new(store))
}

/// Operations documents are JSON arrays; `.yaml`/`.yml` files are read as YAML.
fn read_operations(path: &Path) -> Result<Json> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
    if yaml {
        Ok(serde_yaml::from_str(&raw)?)
    } else {
        Ok(serde_json::from_str(&raw)?)
    }
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn condition(state: bool, message: &str) -> String {
    if message.is_empty() { state.to_string() } else { format!("{} ({})", state, message) }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = open_store(cli.db.as_deref())?;

    if let Commands::Account { command } = &cli.command {
        return account(&store, command, cli.output);
    }

    let deps = Collaborators {
        accounts: store.clone(),
        records: store.clone(),
        tokens: Arc::new(EnvTokenIssuer),
        connector: Arc::new(KubeConnector::from_env()),
    };
    let ops = Ops::new(deps.clone());

    match cli.command {
        Commands::Account { .. } => {}
        Commands::Discover { account } => {
            info!(account = %account, "discover invoked");
            let client = deps.connect(&account).await?;
            let resources = client.discovered().await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {} • {}", gv, r.kind, r.resource, scope);
                    }
                }
                Output::Json => print_json(&resources)?,
            }
        }
        Commands::Run { file } => {
            let body = read_operations(&file)?;
            let operations = parse_operations(&body)?;
            info!(file = %file.display(), operations = operations.len(), "run invoked");
            let task = ops.run_operations(operations).await?;
            match cli.output {
                Output::Human => println!("task {} ({})", task.id, task.resource_uri),
                Output::Json => print_json(&task)?,
            }
        }
        Commands::Task { id } => {
            let status = ops.task_status(&id).await?;
            match cli.output {
                Output::Human => {
                    println!("ACCOUNT      TYPE            NAMESPACE    MANIFEST                         STABLE");
                    for r in &status.resources {
                        let stable = match (&r.status, r.deleted) {
                            (_, true) => "deleted".to_string(),
                            (Some(s), _) => condition(s.stable.state, &s.stable.message),
                            (None, _) => "-".to_string(),
                        };
                        println!("{:<12} {:<15} {:<12} {:<32} {}", r.account, r.task_type.as_str(), r.namespace, r.manifest_name, stable);
                    }
                    println!("stable: {}", status.stable);
                }
                Output::Json => print_json(&status)?,
            }
        }
        Commands::Manifest { account, location, name } => {
            let view = ops.get_manifest(&account, &location, &name).await?;
            match cli.output {
                Output::Human => {
                    println!("{} {} in {} ({})", view.kind, view.name, view.location, view.account);
                    println!("  stable:    {}", condition(view.status.stable.state, &view.status.stable.message));
                    println!("  available: {}", condition(view.status.available.state, &view.status.available.message));
                    println!("  paused:    {}", view.status.paused.state);
                    println!("  failed:    {}", condition(view.status.failed.state, &view.status.failed.message));
                }
                Output::Json => print_json(&view)?,
            }
        }
        Commands::ServerGroups { app } => {
            let groups = ops.list_server_groups(&app).await?;
            match cli.output {
                Output::Human => {
                    println!("ACCOUNT      NAMESPACE    NAME                             CLUSTER                  CREATED");
                    for g in &groups {
                        println!(
                            "{:<12} {:<12} {:<32} {:<24} {}",
                            g.account,
                            g.namespace,
                            g.manifest_name,
                            g.cluster.as_deref().unwrap_or("-"),
                            g.created_at
                        );
                    }
                }
                Output::Json => print_json(&groups)?,
            }
        }
    }
    Ok(())
}

fn account(store: &SqliteStore, command: &AccountCommands, output: Output) -> Result<()> {
    match command {
        AccountCommands::Add { name, host, ca_file, token, token_provider } => {
            let ca_data = match ca_file {
                Some(path) => {
                    let pem = std::fs::read(path).with_context(|| format!("reading CA bundle {}", path.display()))?;
                    BASE64.encode(pem)
                }
                None => String::new(),
            };
            let provider = Provider {
                name: name.clone(),
                host: host.clone(),
                ca_data,
                bearer_token: token.clone(),
                token_provider: token_provider.clone(),
            };
            // Validate before storing; a bad CA bundle should fail here, not on first use.
            kato_kubehub::ClusterConfig::from_provider(&provider, String::new())?;
            store.put_provider(&provider)?;
            info!(account = %name, host = %host, "account stored");
            println!("account {} stored", name);
        }
        AccountCommands::Ls => {
            let providers = store.list_providers()?;
            match output {
                Output::Human => {
                    println!("NAME         HOST                                     AUTH");
                    for p in &providers {
                        let auth = match (&p.bearer_token, &p.token_provider) {
                            (Some(t), _) if !t.is_empty() => "static token".to_string(),
                            (_, Some(r)) => format!("issuer:{}", r),
                            _ => "issuer:default".to_string(),
                        };
                        println!("{:<12} {:<40} {}", p.name, p.host, auth);
                    }
                }
                Output::Json => {
                    let redacted: Vec<Json> = providers
                        .iter()
                        .map(|p| serde_json::json!({ "name": p.name, "host": p.host, "tokenProvider": p.token_provider }))
                        .collect();
                    print_json(&redacted)?;
                }
            }
        }
        AccountCommands::Rm { name } => {
            if !store.delete_provider(name)? {
                bail!("account {} not found", name);
            }
            println!("account {} removed", name);
        }
    }
    Ok(())
}
