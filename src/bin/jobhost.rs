//! jobhost CLI: runs the worker supervisor.

use clap::{Parser, Subcommand};
use jobhost::broker::Broker;
use jobhost::config::secrets::redact_url;
use jobhost::config::{Config, load_definitions};
use jobhost::context::AppContext;
use jobhost::datastore::Datastore;
use jobhost::db::{Db, PgmqBroker};
use jobhost::engine::{ControlFacade, Supervisor, SupervisorConfig, run_console};
use jobhost::notify::{LogNotifier, Notifier, QueueNotifier};
use jobhost::telemetry::{TelemetryConfig, init_telemetry};
use jobhost::worker::JobFactory;
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info, warn};

/// Queue that carries operator alerts to the mail relay.
const ALERT_QUEUE: &str = "jobhost_alerts";

#[derive(Parser)]
#[command(name = "jobhost", about = "Supervisor for long-running queue workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor daemon
    Serve {
        /// Read control commands from stdin
        #[arg(long)]
        console: bool,
    },
    /// Parse a worker definitions file and list what it declares
    Check {
        /// Path to the definitions file
        definitions: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { console } => cmd_serve(console).await,
        Command::Check { definitions } => cmd_check(definitions).await,
    }
}

async fn cmd_serve(console: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "jobhost".to_string(),
        log_level: config.log_level.clone(),
    })?;

    info!(
        database = %redact_url(&config.database_url),
        config_dir = %config.config_dir.display(),
        "starting jobhost"
    );
    let db = match connect(&config).await {
        Ok(db) => db,
        Err(e) => {
            LogNotifier
                .send(
                    &config.alert_recipients,
                    "jobhost failed to start",
                    &format!("Could not reach the datastore: {e}"),
                )
                .await
                .ok();
            return Err(e);
        }
    };

    let broker_db = if config.broker_url.expose_secret() == config.database_url.expose_secret() {
        db.clone()
    } else {
        Db::connect(config.broker_url.expose_secret()).await?
    };
    let broker: Arc<dyn Broker> = Arc::new(PgmqBroker::new(broker_db));
    let notifier = Arc::new(QueueNotifier::new(Arc::clone(&broker), ALERT_QUEUE));
    let app = AppContext::new(
        Arc::new(db),
        broker,
        notifier,
        config.alert_recipients.clone(),
    );

    let supervisor = Supervisor::new(app, JobFactory::with_builtin(), SupervisorConfig::from(&config));
    match supervisor.load_definitions_file().await {
        Ok(report) => info!(?report, "initial worker load"),
        Err(e) => warn!(error = %e, "no worker definitions loaded, waiting for the file to appear"),
    }

    let poller = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            if let Err(e) = supervisor.run().await {
                error!(error = %e, "config poll loop failed");
            }
        })
    };

    if console {
        let facade = ControlFacade::new(Arc::clone(&supervisor));
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = run_console(&facade, stdin, tokio::io::stdout()).await {
                warn!(error = %e, "console closed");
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("interrupt received");
    supervisor.shutdown().await;
    poller.await.ok();
    Ok(())
}

/// Connect and migrate. Failing here is fatal for the process.
async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.health_check().await?;
    Ok(db)
}

async fn cmd_check(path: PathBuf) -> anyhow::Result<()> {
    let factory = JobFactory::with_builtin();
    let defs = load_definitions(&path).await?;
    println!("{} worker(s) in {}", defs.len(), path.display());
    for def in &defs {
        let known = if factory.contains(&def.implementation) {
            ""
        } else {
            "  (unknown implementation)"
        };
        println!(
            "{:<24} {:<18} auto_start={:<5} properties={}{known}",
            def.name,
            def.implementation,
            def.auto_start,
            def.properties.len()
        );
    }
    Ok(())
}
