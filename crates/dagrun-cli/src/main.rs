// Dagrun CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: `start` runs the workflow in-process under its own
// agent; `stop`, `restart`, and `retry` are requests against the server's
// control-plane API.

mod server;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dagrun_core::{Config, Dag, ParamSet};
use dagrun_engine::{install_signal_handler, Agent, EngineContext};
use dagrun_storage::FileRunStore;

#[derive(Parser)]
#[command(name = "dagrun")]
#[command(about = "Dagrun - DAG-based workflow orchestrator")]
#[command(version)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(long, env = "DAGRUN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition to completion
    Start {
        /// Workflow definition path
        file: PathBuf,

        /// Positional parameter list as a single quoted string
        #[arg(long)]
        params: Option<String>,
    },

    /// Stop the active run of a workflow
    Stop {
        /// Workflow definition path
        file: PathBuf,
    },

    /// Stop the active run and start again with the previous parameters
    Restart {
        /// Workflow definition path
        file: PathBuf,
    },

    /// Re-run a past run with its original parameters
    Retry {
        /// Workflow definition path
        file: PathBuf,

        /// Run id to retry
        #[arg(long)]
        run_id: Uuid,
    },

    /// Run the control-plane server, scheduler, and coordinator
    Server,

    /// Run a worker that polls the coordinator for tasks
    Worker,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(load_config(cli.config.as_deref())?);

    match cli.command {
        Commands::Start { file, params } => start(config, &file, params.as_deref()).await,
        Commands::Stop { file } => {
            let dag = load_dag(&file)?;
            let response = api_client(&config)?
                .post(api_url(&config, &format!("dags/{}/stop", dag.name)))
                .send()
                .await
                .context("cannot reach the dagrun server")?;
            expect_success(response).await?;
            println!("stop requested for {}", dag.name);
            Ok(())
        }
        Commands::Restart { file } => {
            let dag = load_dag(&file)?;
            let response = api_client(&config)?
                .post(api_url(&config, &format!("dags/{}/restart", dag.name)))
                .send()
                .await
                .context("cannot reach the dagrun server")?;
            let body: serde_json::Value = expect_success(response).await?.json().await?;
            println!(
                "restarted {} as run {}",
                dag.name,
                body["workflow_id"].as_str().unwrap_or("?")
            );
            Ok(())
        }
        Commands::Retry { file, run_id } => {
            let dag = load_dag(&file)?;
            let response = api_client(&config)?
                .post(api_url(&config, &format!("dags/{}/retry", dag.name)))
                .json(&serde_json::json!({ "run_id": run_id }))
                .send()
                .await
                .context("cannot reach the dagrun server")?;
            let body: serde_json::Value = expect_success(response).await?.json().await?;
            println!(
                "retried {} as run {}",
                dag.name,
                body["workflow_id"].as_str().unwrap_or("?")
            );
            Ok(())
        }
        Commands::Server => server::serve(config).await,
        Commands::Worker => worker::run(config).await,
    }
}

/// Run one workflow in-process: the agent owns the run, OS signals become
/// cooperative cancellation, status persists into the data directory.
async fn start(config: Arc<Config>, file: &Path, params: Option<&str>) -> anyhow::Result<()> {
    let dag = Arc::new(load_dag(file)?);
    let dag_dir = file
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let store = Arc::new(FileRunStore::new(&config.data_dir));
    let engine = EngineContext::new(store, Arc::clone(&config)).with_dag_dir(dag_dir);

    let params = ParamSet::resolve(&dag.params, params);
    let agent = Agent::new(Arc::clone(&dag), params, engine);
    let workflow_id = agent.workflow_id();
    install_signal_handler(agent.handle());

    let status = agent
        .run()
        .await
        .with_context(|| format!("run {workflow_id} failed fatally"))?;
    println!("run {workflow_id} finished: {status}");
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => Config::from_env()?,
    };
    Ok(config)
}

fn load_dag(file: &Path) -> anyhow::Result<Dag> {
    Dag::load(file).with_context(|| format!("cannot load workflow {}", file.display()))
}

fn api_client(_config: &Config) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()?)
}

fn api_url(config: &Config, path: &str) -> String {
    format!("http://{}/api/v1/{path}", config.bind_addr())
}

async fn expect_success(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("server answered {status}: {body}")
}
