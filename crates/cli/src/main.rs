use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kube::ResourceExt;
use rudder_apply::KubeResourceKeeper;
use rudder_core::{audit_handle, ApplicationRevision, ApplicationRevisionSpec, AuditStore, PolicyDefinition, Settings};
use rudder_dispatch::{generate_dispatchers, run_dispatchers, ComponentManifests, DispatchEnv, ReconcileState};
use rudder_kubehub::memory::{MemoryResourceKeeper, StaticHealthEvaluator};
use rudder_kubehub::{
    get_kube_client, ConfigMapAuditStore, DefinitionSource, KubeClusterClient, LiteralRenderer, ResourceKeeper,
};
use rudder_persist::SqliteAuditStore;
use rudder_policy::{simulate, validate_policy_definition, DryRunMode, DryRunOptions, PolicyContext, PolicyPipeline};
use rudder_revision::{gather_revision_spec, RenderedArtifacts};
use tracing::{info, warn};

mod loader;

#[derive(Parser, Debug)]
#[command(name = "rudderctl", version, about = "Rudder application reconcile tooling")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace holding global policies and shared definitions
    #[arg(long = "system-namespace", global = true, env = "RUDDER_SYSTEM_NAMESPACE")]
    system_namespace: Option<String>,

    /// SQLite audit database
    #[arg(long = "db", global = true, env = "RUDDER_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a PolicyDefinition file without a cluster
    ValidatePolicy {
        file: PathBuf,
    },
    /// Preview policy effects on an application; nothing is cached or audited
    DryRun {
        #[arg(long)]
        app: PathBuf,
        /// Definition file or directory
        #[arg(long)]
        defs: PathBuf,
        #[arg(long, default_value = "full", value_parser = DryRunMode::from_str)]
        mode: DryRunMode,
        /// Extra policy to include (repeatable)
        #[arg(long = "policy")]
        policies: Vec<String>,
        /// In full mode, also run the application's own policies
        #[arg(long = "include-app-policies", action = ArgAction::SetTrue)]
        include_app_policies: bool,
    },
    /// Run the policy pipeline and record audit entries
    Apply {
        #[arg(long)]
        app: PathBuf,
        /// Definition file or directory; audit goes to the SQLite store
        #[arg(long, required_unless_present = "cluster")]
        defs: Option<PathBuf>,
        /// Read definitions from the current kube context and audit into a ConfigMap
        #[arg(long = "cluster", action = ArgAction::SetTrue, conflicts_with = "defs")]
        cluster: bool,
    },
    /// Print the revision hash an application would get
    Revision {
        #[arg(long)]
        app: PathBuf,
        #[arg(long)]
        defs: PathBuf,
    },
    /// Show dispatch stages for rendered component manifests
    Stages {
        /// YAML documents of {component, namespace, workload, traits}
        #[arg(long)]
        manifests: PathBuf,
        #[arg(long)]
        defs: PathBuf,
        /// Simulate dispatch with every resource reporting healthy
        #[arg(long = "run", action = ArgAction::SetTrue)]
        run: bool,
        /// With --run, server-side apply to the current kube context
        #[arg(long = "cluster", action = ArgAction::SetTrue, requires = "run")]
        cluster: bool,
    },
    /// List stored audit records for ns/name
    Audit {
        #[arg(long)]
        app: String,
    },
}

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RUDDER_METRICS_ADDR; expected host:port");
        }
    }
}

fn settings(cli: &Cli) -> Settings {
    let mut s = Settings::from_env();
    if let Some(ns) = &cli.system_namespace {
        s.system_namespace = ns.clone();
    }
    if cli.db.is_some() {
        s.db_path = cli.db.clone();
    }
    s
}

fn open_audit(settings: &Settings) -> Result<SqliteAuditStore> {
    SqliteAuditStore::open(settings.audit_db_path())
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = settings(&cli);

    match &cli.command {
        Commands::ValidatePolicy { file } => {
            let pd: PolicyDefinition = loader::read_one(file)?;
            let report = validate_policy_definition(&pd, &LiteralRenderer, &settings);
            match cli.output {
                Output::Json => print_json(&report)?,
                Output::Human => {
                    for e in &report.errors {
                        println!("error: {e}");
                    }
                    for w in &report.warnings {
                        println!("warning: {w}");
                    }
                    if report.is_ok() {
                        println!("{} is valid", pd.name_any());
                    }
                }
            }
            if !report.is_ok() {
                bail!("{} error(s) in {}", report.errors.len(), file.display());
            }
        }
        Commands::DryRun { app, defs, mode, policies, include_app_policies } => {
            let app = loader::read_application(app)?;
            let cluster = loader::load_definitions(defs, &settings.system_namespace)?;
            let opts = DryRunOptions { mode: *mode, policies: policies.clone(), include_app_policies: *include_app_policies };
            info!(app = %app.app_key(), mode = %mode, "dry run");
            let res = simulate(&cluster, &LiteralRenderer, &settings, &app, &opts).await.context("dry run")?;
            match cli.output {
                Output::Json => print_json(&res)?,
                Output::Human => {
                    println!("mode: {}", res.mode);
                    println!("SEQ  PRIORITY  SOURCE     POLICY");
                    for s in &res.execution_plan {
                        println!("{:<4} {:<9} {:<10} {}/{}", s.sequence, s.priority, s.source, s.policy_namespace, s.policy_name);
                    }
                    for o in &res.policy_results {
                        let state = if o.applied { "applied" } else if o.enabled { "no-op" } else { "skipped" };
                        println!("{:>3}. {} {state} {}", o.sequence, o.policy_name, o.skip_reason);
                        for (k, v) in &o.labels_added {
                            println!("       + label {k}={v}");
                        }
                        for (k, v) in &o.annotations_added {
                            println!("       + annotation {k}={v}");
                        }
                        if o.spec_modified {
                            println!("       ~ spec modified");
                        }
                    }
                    for w in &res.warnings {
                        println!("warning: {w}");
                    }
                    for e in &res.errors {
                        println!("error: {e}");
                    }
                }
            }
        }
        Commands::Apply { app, defs, cluster } => {
            let mut app = loader::read_application(app)?;
            let (source, audit): (Arc<dyn DefinitionSource>, Arc<dyn AuditStore>) = match defs {
                Some(d) if !*cluster => (
                    Arc::new(loader::load_definitions(d, &settings.system_namespace)?),
                    Arc::new(open_audit(&settings)?),
                ),
                _ => {
                    let client = get_kube_client().await.context("connecting to cluster")?;
                    let ns = app.namespace().unwrap_or_default();
                    (
                        Arc::new(KubeClusterClient::new(client.clone(), settings.system_namespace.clone())),
                        Arc::new(ConfigMapAuditStore::new(client, ns)),
                    )
                }
            };
            let pipeline = PolicyPipeline::new(source, Arc::new(LiteralRenderer), audit, settings.clone());
            let ctx = pipeline.apply_scope_transforms(PolicyContext::default(), &mut app).await.context("applying policies")?;
            match cli.output {
                Output::Json => print_json(&app)?,
                Output::Human => {
                    println!("discovered: {}", ctx.discovered.join(", "));
                    println!("applied:    {}", ctx.applied.join(", "));
                    if let Some(st) = &app.status {
                        for p in &st.applied_application_policies {
                            let mark = if p.applied { "✓" } else { "-" };
                            println!("{mark} {}/{} {}", p.namespace, p.name, p.reason);
                        }
                        if let Some(cm) = &st.application_policies_config_map {
                            println!("audit: {cm}");
                        }
                    }
                }
            }
        }
        Commands::Revision { app, defs } => {
            let app = loader::read_application(app)?;
            let cluster = loader::load_definitions(defs, &settings.system_namespace)?;
            let mut artifacts = RenderedArtifacts::default();
            let ns = app.namespace().unwrap_or_default();
            for c in &app.spec.components {
                for t in &c.traits {
                    match cluster.trait_definition(&t.trait_type, &ns).await {
                        Ok(td) => {
                            artifacts.trait_definitions.insert(t.trait_type.clone(), td);
                        }
                        Err(e) => warn!(trait_type = %t.trait_type, error = %e, "trait definition not loaded"),
                    }
                }
            }
            let (_, hash) = gather_revision_spec(&app, &artifacts)?;
            match cli.output {
                Output::Json => print_json(&serde_json::json!({ "application": app.app_key().to_string(), "hash": hash }))?,
                Output::Human => println!("{hash}"),
            }
        }
        Commands::Stages { manifests, defs, run, cluster: live } => {
            let cluster = loader::load_definitions(defs, &settings.system_namespace)?;
            let keeper: Arc<dyn ResourceKeeper> = if *live {
                let client = get_kube_client().await.context("connecting to cluster")?;
                Arc::new(KubeResourceKeeper::new(client))
            } else {
                Arc::new(MemoryResourceKeeper::new())
            };
            let env = DispatchEnv {
                keeper,
                health: Arc::new(StaticHealthEvaluator::new()),
                state: Arc::new(ReconcileState::new()),
            };
            let revision = ApplicationRevision::new("", ApplicationRevisionSpec::default());
            let mut plans = Vec::new();
            for c in loader::read_components(manifests)? {
                let ns = if c.namespace.is_empty() { "default".to_string() } else { c.namespace.clone() };
                let comp = ComponentManifests {
                    component: c.component,
                    namespace: c.namespace,
                    workload: c.workload,
                    traits: c.traits,
                    skip_apply_workload: c.skip_apply_workload,
                };
                let ds = generate_dispatchers(&env, &comp, &revision, &cluster, &ns, false).await?;
                let stages: Vec<serde_json::Value> = ds
                    .iter()
                    .map(|d| {
                        let keys: Vec<String> = d.manifests().iter().map(rudder_core::manifest::manifest_key).collect();
                        serde_json::json!({ "stage": d.stage().as_str(), "manifests": keys })
                    })
                    .collect();
                let healthy = if *run { Some(run_dispatchers(&ds).await?) } else { None };
                plans.push(serde_json::json!({ "component": comp.component, "stages": stages, "healthy": healthy }));
            }
            match cli.output {
                Output::Json => print_json(&serde_json::json!({ "components": plans, "services": env.state.services() }))?,
                Output::Human => {
                    for p in &plans {
                        println!("{}", p["component"].as_str().unwrap_or_default());
                        for s in p["stages"].as_array().into_iter().flatten() {
                            println!("  {}", s["stage"].as_str().unwrap_or_default());
                            for k in s["manifests"].as_array().into_iter().flatten() {
                                println!("    {}", k.as_str().unwrap_or_default());
                            }
                        }
                        if let Some(h) = p["healthy"].as_bool() {
                            println!("  healthy: {h}");
                        }
                    }
                }
            }
        }
        Commands::Audit { app } => {
            let Some((ns, name)) = app.split_once('/') else {
                bail!("expected ns/name, got {app}");
            };
            let store = open_audit(&settings)?;
            let records = store.records(&audit_handle(ns, name))?;
            match cli.output {
                Output::Json => {
                    let items: Vec<_> = records.iter().map(|r| serde_json::json!({ "key": r.key, "written_at": r.written_at.to_rfc3339(), "body": r.body })).collect();
                    print_json(&items)?
                }
                Output::Human => {
                    if records.is_empty() {
                        println!("no audit records for {ns}/{name}");
                    }
                    for r in &records {
                        let summary = &r.body["summary"];
                        println!(
                            "{:<28} labels+{} annotations+{} spec={}",
                            r.key,
                            summary["labelsAdded"].as_u64().unwrap_or(0),
                            summary["annotationsAdded"].as_u64().unwrap_or(0),
                            summary["specModified"].as_bool().unwrap_or(false),
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
