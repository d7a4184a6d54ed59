use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use helmsman::entity::EntitySpec;
use helmsman::persistence::{
    BrooklynObjectType, CompoundTransformerLoader, FileMementoStore, MementoStore, Persister,
    open_store,
};
use helmsman::runtime::effector::Effector;
use helmsman::workflow::loader::load_workflow_from_yaml;
use helmsman::{EngineConfig, ManagementContext};

const DEMO_ENTITY_TYPE: &str = "helmsman.DemoEntity";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration (YAML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow against a demo entity
    Run {
        /// Path to the workflow YAML file
        file: PathBuf,

        /// Workflow input (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,
    },

    /// Apply migration rules to a persisted memento directory
    Transform {
        #[arg(long)]
        store: PathBuf,

        /// Rules file (YAML)
        #[arg(long)]
        rules: PathBuf,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// List persisted objects by type
    Inspect {
        #[arg(long)]
        store: PathBuf,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // JSON if it parses, otherwise a plain string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn init_tracing(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn register_demo_types(mgmt: &ManagementContext) {
    mgmt.entity_types().register(DEMO_ENTITY_TYPE, |_, entity| {
        entity.add_effector(
            Effector::from_fn("echo", |inv| async move { Ok(Value::Object(inv.params)) })
                .description("Returns its arguments"),
        );
        entity.add_effector(
            Effector::from_fn("restart", |inv| async move {
                info!(entity_id = %inv.entity.id(), "Demo restart");
                inv.entity.set_sensor("service.up", Value::Bool(true));
                Ok(Value::Null)
            })
            .description("Marks the demo service up"),
        );
        Ok(())
    });
}

async fn run_workflow(config: EngineConfig, file: PathBuf, vars: Vec<(String, Value)>) -> Result<()> {
    let mgmt = ManagementContext::new(config)?;
    register_demo_types(&mgmt);

    let persister = match open_store(&mgmt.config().persistence)? {
        Some(store) => {
            let persister = Persister::new(mgmt.clone(), store);
            persister.start();
            Some(persister)
        }
        None => None,
    };

    let loaded = load_workflow_from_yaml(mgmt.steps(), &file)?;
    let entity = mgmt.create_entity(EntitySpec::of_type(DEMO_ENTITY_TYPE).display_name("demo"))?;
    mgmt.manage(&entity)?;

    let mut input: Map<String, Value> = loaded.input;
    input.extend(vars);

    info!(workflow = %loaded.definition.name, entity_id = %entity.id(), "Running workflow");
    let executor = mgmt.workflow_executor();
    let run = executor.start(&entity, &loaded.definition, input).await?;
    let outcome = run.get().await;
    let ctx = mgmt.workflows().require(&run.workflow_id)?;

    if let Some(persister) = &persister {
        persister.stop().await?;
    }
    mgmt.shutdown();

    match outcome {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            info!(workflow_id = %ctx.id, steps = ctx.records.len(), "Workflow completed");
            Ok(())
        }
        Err(e) => {
            error!(workflow_id = %ctx.id, status = ?ctx.status, "Workflow failed: {}", e);
            Err(e.into())
        }
    }
}

async fn transform(store: PathBuf, rules: PathBuf, dry_run: bool) -> Result<()> {
    let transformer = CompoundTransformerLoader::load(&rules)?;
    let store = FileMementoStore::new(store);
    let delta = transformer.apply_to_store(&store, dry_run).await?;
    for (kind, id, _) in &delta.writes {
        println!("changed  {:<15} {}", kind.to_string(), id);
    }
    for (kind, id) in &delta.deletes {
        println!("deleted  {:<15} {}", kind.to_string(), id);
    }
    for id in &delta.jar_deletes {
        println!("deleted  {:<15} {}.jar", BrooklynObjectType::ManagedBundle.to_string(), id);
    }
    if dry_run {
        println!("(dry run; nothing written)");
    }
    Ok(())
}

async fn inspect(store: PathBuf) -> Result<()> {
    let store: Arc<dyn MementoStore> = Arc::new(FileMementoStore::new(store.clone()));
    let raw = store
        .load_raw_data()
        .await
        .context("Failed to load mementos")?;
    println!("plane id: {}", raw.plane_id.as_deref().unwrap_or("-"));
    for kind in BrooklynObjectType::ALL {
        let ids = raw.ids(kind);
        if ids.is_empty() {
            continue;
        }
        println!("{} ({}):", kind, ids.len());
        for id in ids {
            println!("  {}", id);
        }
    }
    if !raw.bundle_jars.is_empty() {
        println!("bundle archives ({}):", raw.bundle_jars.len());
        for (id, bytes) in &raw.bundle_jars {
            println!("  {} ({} bytes)", id, bytes.len());
        }
    }
    for (group, ids) in &raw.unknown {
        println!("unknown group {} ({})", group, ids.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    init_tracing(&config);

    match cli.command {
        Commands::Run { file, vars } => run_workflow(config, file, vars).await,
        Commands::Transform {
            store,
            rules,
            dry_run,
        } => transform(store, rules, dry_run).await,
        Commands::Inspect { store } => inspect(store).await,
    }
}
