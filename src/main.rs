use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::Instant;

use sso_bridge::{
    api,
    config::Config,
    controller::{Engine, EngineOptions, Lifecycle},
    events::{init_logging, EventEmitter},
    graph::PhotoClient,
    host::TracingHost,
    inject::{HeaderInjector, UrlPattern},
    link::BrokerProcess,
};

const BROKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "entra-sso-bridge")]
#[command(about = "Injects Entra ID PRT SSO cookies obtained from a local identity broker")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the broker and serve the interception API until interrupted.
    Serve,
    /// Print the accounts registered with the broker.
    Accounts {
        /// Seconds to wait for the broker to report online.
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Acquire a PRT SSO cookie for URL with the first registered account.
    Prt {
        url: String,

        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.config)?;

    match cli.command {
        Commands::Serve => run_serve(cli.config).await,
        Commands::Accounts { wait_secs } => run_accounts(cli.config, wait_secs).await,
        Commands::Prt { url, wait_secs } => run_prt(cli.config, url, wait_secs).await,
    }
}

fn engine_options(cfg: &Config, with_avatar: bool) -> Result<EngineOptions> {
    let events = EventEmitter::new(cfg.json_events);
    let pattern = UrlPattern::parse(&cfg.url_pattern)?;
    Ok(EngineOptions {
        injector: HeaderInjector::new(pattern, events.clone()),
        request_timeout: cfg.request_timeout(),
        photo: (with_avatar && !cfg.no_avatar)
            .then(|| PhotoClient::new(cfg.graph_photo_url.clone())),
        events,
    })
}

fn start_engine(
    cfg: &Config,
    lifecycle: &Lifecycle,
    with_avatar: bool,
) -> Result<(Engine, Option<BrokerProcess>)> {
    let launch = cfg.broker_launch()?;
    let mut process = None;
    let startup = lifecycle.start(
        || {
            let (child, link, events) = BrokerProcess::spawn(&launch, cfg.max_frame_bytes)?;
            process = Some(child);
            Ok((link, events))
        },
        Arc::new(TracingHost),
        engine_options(cfg, with_avatar)?,
    )?;
    Ok((startup.engine().clone(), process))
}

async fn run_serve(cfg: Config) -> Result<()> {
    let lifecycle = Lifecycle::new();
    let (engine, process) = start_engine(&cfg, &lifecycle, true)?;

    let addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind interception API on {addr}"))?;
    tracing::info!(
        target = "sso_bridge::api",
        addr = %listener.local_addr()?,
        url_pattern = %cfg.url_pattern,
        "interception API listening"
    );

    axum::serve(listener, api::router(engine, cfg.api_key.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(target = "sso_bridge::api", "shutting down");
        })
        .await
        .context("interception API failed")?;

    if let Some(process) = process {
        process.terminate(BROKER_SHUTDOWN_GRACE).await?;
    }
    Ok(())
}

async fn run_accounts(cfg: Config, wait_secs: u64) -> Result<()> {
    let lifecycle = Lifecycle::new();
    let (engine, process) = start_engine(&cfg, &lifecycle, false)?;

    wait_for_broker(&engine, Duration::from_secs(wait_secs)).await?;
    let outcome = engine.reload_accounts().await?;
    tracing::debug!(?outcome, "accounts reloaded");
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "accounts": engine.accounts(),
            "active": engine.active_account(),
        }))?
    );

    if let Some(process) = process {
        process.terminate(BROKER_SHUTDOWN_GRACE).await?;
    }
    Ok(())
}

async fn run_prt(cfg: Config, url: String, wait_secs: u64) -> Result<()> {
    let lifecycle = Lifecycle::new();
    let (engine, process) = start_engine(&cfg, &lifecycle, false)?;

    wait_for_broker(&engine, Duration::from_secs(wait_secs)).await?;
    engine.reload_accounts().await?;
    let account = engine
        .active_account()
        .context("broker has no registered accounts")?;

    let result = engine.request_prt_cookie(account, &url).await;
    if let Some(process) = process {
        process.terminate(BROKER_SHUTDOWN_GRACE).await?;
    }

    let cookie = result.context("broker did not issue a PRT SSO cookie")?;
    println!("{}", serde_json::to_string_pretty(&cookie)?);
    Ok(())
}

async fn wait_for_broker(engine: &Engine, limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;
    loop {
        let status = engine.status();
        if status.broker_online {
            return Ok(());
        }
        if !status.link_open {
            anyhow::bail!("broker connection closed before it came online");
        }
        if Instant::now() >= deadline {
            anyhow::bail!("broker did not come online within {limit:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
