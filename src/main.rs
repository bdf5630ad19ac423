mod app;
mod cache;
mod config;
mod connectivity;
mod db;
mod error;
mod event;
mod net;
mod queue;
mod router;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tokio::sync::oneshot;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::{App, Gateway, Stores};
use crate::config::Config;
use crate::event::{EventHandler, GatewayEvent};
use crate::net::{HttpUpstream, Upstream};
use crate::server::ServerState;

#[derive(Parser, Debug)]
#[command(name = "formgate")]
#[command(about = "Offline submission and cache gateway for form-based web apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./formgate.yaml, then $XDG_CONFIG_HOME/formgate/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the gateway (default)
  Serve {
    /// Address to listen on
    #[arg(short, long)]
    listen: Option<String>,

    /// Origin server to forward to
    #[arg(short, long)]
    upstream: Option<String>,

    /// Keep the cache and the queue in memory only
    #[arg(long)]
    ephemeral: bool,
  },
  /// Pre-cache the manifest into a generation and activate it.
  ///
  /// When a gateway is already listening, the work is handed to it so the
  /// generation it serves from is never deleted underneath it.
  Install {
    /// Generation to install (default: cache.version from the config)
    #[arg(long)]
    cache_version: Option<String>,
  },
  /// Resubmit everything in the submission queue once
  Sync,
  /// List queued submissions
  Queue {
    /// Drop the submission with this id instead of listing
    #[arg(long)]
    remove: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let mut config = Config::load(args.config.as_deref())?;

  let command = args.command.unwrap_or(Command::Serve {
    listen: None,
    upstream: None,
    ephemeral: false,
  });

  // Command line flags win over the config file and the environment
  if let Command::Serve {
    listen, upstream, ..
  } = &command
  {
    if let Some(listen) = listen {
      config.listen = listen.clone();
    }
    if let Some(upstream) = upstream {
      config.upstream = upstream.clone();
    }
    config.validate()?;
  }

  let _guard = init_tracing(config.data_dir().ok().map(|dir| dir.join("logs")));

  match command {
    Command::Serve { ephemeral, .. } => serve(config, ephemeral).await,
    Command::Install { cache_version } => {
      let version = cache_version.unwrap_or_else(|| config.cache.version.clone());
      let events = [
        serde_json::json!({ "kind": "install", "version": version }),
        serde_json::json!({ "kind": "activate" }),
      ];
      if server::forward_events(&config.listen, &events).await? {
        info!(listen = %config.listen, version = %version, "install handed to running gateway");
        let report = serde_json::json!({
          "status": "scheduled",
          "version": version,
          "gateway": config.listen,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
      }

      let gateway = offline_gateway(config)?;
      let (installed, activated) = gateway.lifecycle.install_and_activate(&version).await?;
      let report = serde_json::json!({ "install": installed, "activate": activated });
      println!("{}", serde_json::to_string_pretty(&report)?);
      Ok(())
    }
    Command::Sync => {
      let gateway = offline_gateway(config)?;
      if gateway.queue.is_empty()? {
        info!("submission queue is empty");
      }
      let report = gateway.retry.drain().await;
      println!("{}", serde_json::to_string_pretty(&report)?);
      Ok(())
    }
    Command::Queue { remove } => {
      let gateway = offline_gateway(config)?;
      if let Some(id) = remove {
        let removed = gateway.queue.remove(&id)?;
        println!("{}", serde_json::json!({ "id": id, "removed": removed }));
        return Ok(());
      }
      let records = gateway.queue.list_all().collect::<Result<Vec<_>, _>>()?;
      println!("{}", serde_json::to_string_pretty(&records)?);
      Ok(())
    }
  }
}

/// Log to stderr and to a daily file under `log_dir`.
///
/// The filter comes from `FORMGATE_LOG` and defaults to `formgate=info`.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
  let filter =
    EnvFilter::try_from_env("FORMGATE_LOG").unwrap_or_else(|_| EnvFilter::new("formgate=info"));

  let appender = log_dir.map(|dir| {
    RollingFileAppender::builder()
      .rotation(Rotation::DAILY)
      .filename_prefix("formgate")
      .filename_suffix("log")
      .build(dir)
  });

  let (file_layer, guard) = match appender {
    Some(Ok(appender)) => {
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    Some(Err(e)) => {
      eprintln!("file logging disabled: {}", e);
      (None, None)
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .init();

  guard
}

/// A gateway over the persistent stores with no listener attached.
fn offline_gateway(config: Config) -> Result<Gateway> {
  let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(&config)?);
  let stores = Stores::open(&config, false);
  Ok(Gateway::new(config, stores, upstream, None))
}

async fn serve(config: Config, ephemeral: bool) -> Result<()> {
  let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(&config)?);
  let stores = Stores::open(&config, ephemeral);

  let events = EventHandler::new();
  let tx = events.sender();
  let gateway = Arc::new(Gateway::new(config, stores, upstream, Some(tx.clone())));

  let listen = gateway.config.listen.clone();
  let listener = tokio::net::TcpListener::bind(&listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(listen = %listen, upstream = %gateway.config.upstream, "gateway listening");

  let (stop_tx, stop_rx) = oneshot::channel::<()>();
  let state = ServerState {
    events: tx.clone(),
    gateway: gateway.clone(),
  };
  let server = tokio::spawn(async move {
    axum::serve(listener, server::routes(state))
      .with_graceful_shutdown(async {
        let _ = stop_rx.await;
      })
      .await
  });

  let _ = tx.send(GatewayEvent::Install { version: None });
  let _ = tx.send(GatewayEvent::Activate);
  // Records left over from an earlier run
  gateway.connectivity.register_sync();
  drop(tx);

  App::new(gateway).run(events).await?;

  let _ = stop_tx.send(());
  server.await??;
  Ok(())
}
