//! FreemKit webhook server
//!
//! Receives Freemius webhooks over HTTP (or CGI) and subscribes customers to Kit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use freemkit::config::Settings;
use freemkit::handlers::{app_router, AppState};
use freemkit::kit::{KitClient, SubscriptionClient};
use freemkit::store::Stores;
use freemkit::webhook::scheduler::ScheduledReceiver;
use freemkit::webhook::{
    handle_cgi, CgiRequest, DisabledScheduler, QueueWorker, Scheduler, TokioScheduler,
    WebhookState,
};

/// Due keys buffered between the scheduler and the queue worker
const SCHEDULER_CAPACITY: usize = 1024;

/// FreemKit webhook server
#[derive(Parser, Debug)]
#[command(name = "freemkit")]
#[command(version)]
#[command(about = "Freemius webhook receiver that subscribes customers to Kit")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FREEMKIT_CONFIG", default_value = "freemkit.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve {
        /// Host to bind to (overrides [server].host)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to listen on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Handle a single request as a CGI program
    Cgi,
    /// Validate the configuration and print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing; stdout is reserved for CGI responses
    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => serve(settings, host, port).await,
        Command::Cgi => cgi(settings).await,
        Command::CheckConfig => check_config(&settings),
    }
}

async fn serve(settings: Settings, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    freemkit::metrics::init();

    let stores = Stores::open(&settings.storage)
        .await
        .context("opening stores")?;
    let client = KitClient::new(&settings.kit)?;
    let kit_connected = client.is_connected();
    if !kit_connected {
        warn!("No Kit access token configured; deliveries will fail and be retried");
    }
    let client: Arc<dyn SubscriptionClient> = Arc::new(client);

    let (scheduler, receiver): (Arc<dyn Scheduler>, Option<ScheduledReceiver>) =
        if settings.webhook.async_processing {
            let (scheduler, receiver) = TokioScheduler::new(SCHEDULER_CAPACITY);
            (Arc::new(scheduler), Some(receiver))
        } else {
            info!("Asynchronous processing disabled; webhooks are processed inline");
            (Arc::new(DisabledScheduler), None)
        };

    let webhook = Arc::new(WebhookState::new(
        &settings,
        &stores,
        client,
        scheduler,
    ));

    if let Some(receiver) = receiver {
        let queue = webhook.queue();
        tokio::spawn(QueueWorker::new(queue.clone(), receiver).run());
        let resumed = queue.reschedule_pending().await?;
        if resumed > 0 {
            info!(resumed, "Rescheduled queued webhooks from a previous run");
        }
    }

    let status = Arc::new(
        AppState::new()
            .with_subscribers(stores.subscribers.clone())
            .with_readiness(kit_connected, settings.plugins.len()),
    );
    let app = app_router(webhook, status);

    let host = host.unwrap_or_else(|| settings.server.host.clone());
    let port = port.unwrap_or(settings.server.port);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(
        address = %addr,
        endpoint = %settings.webhook.endpoint,
        plugins = settings.plugins.len(),
        "FreemKit listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("FreemKit stopped");
    Ok(())
}

async fn cgi(settings: Settings) -> anyhow::Result<()> {
    let stores = Stores::open(&settings.storage).await?;
    let client: Arc<dyn SubscriptionClient> = Arc::new(KitClient::new(&settings.kit)?);
    // The process exits after one response, so nothing can be deferred
    let state = WebhookState::new(&settings, &stores, client, Arc::new(DisabledScheduler));

    let request = CgiRequest::from_process().await?;
    let response = handle_cgi(&state, &request).await;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(response.render().as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

fn check_config(settings: &Settings) -> anyhow::Result<()> {
    let client = KitClient::new(&settings.kit)?;
    println!("endpoint:       {}", settings.webhook.endpoint);
    println!("listen:         {}:{}", settings.server.host, settings.server.port);
    println!("kit connected:  {}", client.is_connected());
    println!(
        "data dir:       {}",
        settings
            .storage
            .data_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| "(memory only)".to_string())
    );
    println!("plugins:        {}", settings.plugins.len());
    for plugin in &settings.plugins {
        println!(
            "  - {} ({}) free forms {:?}, paid forms {:?}",
            plugin.id, plugin.name, plugin.free_form_ids, plugin.paid_form_ids
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
