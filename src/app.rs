use std::sync::Arc;

use color_eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLayer, CacheStorage, Lifecycle, MemoryStorage, SqliteStorage};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::db::{Database, Unavailable};
use crate::event::{EventHandler, GatewayEvent, SYNC_TAG};
use crate::net::Upstream;
use crate::queue::{
  InFlight, MemoryQueueStorage, QueueStorage, RetryCoordinator, SqliteQueueStorage,
  SubmissionQueue,
};
use crate::router::Router;

/// Storage backends for the asset cache and the submission queue
pub struct Stores {
  pub cache: Arc<dyn CacheStorage>,
  pub queue: Arc<dyn QueueStorage>,
}

impl Stores {
  /// Open the persistent stores, or in-memory ones when `ephemeral`.
  ///
  /// A database that cannot be opened does not stop the gateway: both stores
  /// are replaced by ones that fail every operation, so requests still reach
  /// the upstream and only offline features are lost.
  pub fn open(config: &Config, ephemeral: bool) -> Self {
    if ephemeral {
      info!("using in-memory stores, nothing survives a restart");
      return Self::in_memory();
    }

    match config.data_dir().and_then(|dir| Database::open(&dir)) {
      Ok(db) => {
        let db = Arc::new(db);
        Self {
          cache: Arc::new(SqliteStorage::new(db.clone())),
          queue: Arc::new(SqliteQueueStorage::new(db)),
        }
      }
      Err(e) => {
        error!(error = %e, "gateway database unavailable, running without offline support");
        let reason = e.to_string();
        Self {
          cache: Arc::new(Unavailable::new(reason.clone())),
          queue: Arc::new(Unavailable::new(reason)),
        }
      }
    }
  }

  pub fn in_memory() -> Self {
    Self {
      cache: Arc::new(MemoryStorage::new()),
      queue: Arc::new(MemoryQueueStorage::new()),
    }
  }
}

/// The wired-up gateway components
pub struct Gateway {
  pub config: Config,
  pub cache: Arc<CacheLayer>,
  pub lifecycle: Lifecycle,
  pub router: Router,
  pub queue: SubmissionQueue,
  pub retry: RetryCoordinator,
  pub connectivity: Arc<Connectivity>,
}

impl Gateway {
  /// Assemble the gateway. Connectivity signals go to `signals` when given.
  pub fn new(
    config: Config,
    stores: Stores,
    upstream: Arc<dyn Upstream>,
    signals: Option<mpsc::UnboundedSender<GatewayEvent>>,
  ) -> Self {
    let cache = Arc::new(CacheLayer::new(stores.cache));
    let queue = SubmissionQueue::new(stores.queue);
    let connectivity = Arc::new(Connectivity::new(signals));
    let inflight = Arc::new(InFlight::new());

    let lifecycle = Lifecycle::new(
      cache.clone(),
      upstream.clone(),
      config.cache.manifest.clone(),
    );
    let router = Router::new(
      config.routes.clone(),
      cache.clone(),
      queue.clone(),
      upstream.clone(),
      connectivity.clone(),
      inflight.clone(),
    );
    let retry = RetryCoordinator::new(
      queue.clone(),
      upstream,
      inflight,
      connectivity.clone(),
      config.default_submit_path(),
      config.retry.concurrency,
    );

    Self {
      config,
      cache,
      lifecycle,
      router,
      queue,
      retry,
      connectivity,
    }
  }
}

/// Event loop driving the gateway
pub struct App {
  gateway: Arc<Gateway>,
}

impl App {
  pub fn new(gateway: Arc<Gateway>) -> Self {
    Self { gateway }
  }

  /// Process events until `Shutdown` arrives or every sender is gone.
  pub async fn run(&self, mut events: EventHandler) -> Result<()> {
    while let Some(event) = events.next().await {
      if !self.handle_event(event).await {
        break;
      }
    }
    info!("event loop stopped");
    Ok(())
  }

  /// Handle one event. Returns `false` once the loop should stop.
  ///
  /// Lifecycle events are awaited in place so install and activate never
  /// interleave. Fetches and drains run on their own tasks.
  pub async fn handle_event(&self, event: GatewayEvent) -> bool {
    match event {
      GatewayEvent::Install { version } => {
        let version = version.unwrap_or_else(|| self.gateway.config.cache.version.clone());
        if let Err(e) = self.gateway.lifecycle.install(&version).await {
          error!(version = %version, error = %e, "cache install failed");
        }
      }
      GatewayEvent::Activate => {
        if let Err(e) = self.gateway.lifecycle.activate().await {
          error!(error = %e, "cache activation failed");
        }
      }
      GatewayEvent::Fetch { request, reply } => {
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
          let result = gateway.router.handle(request).await;
          if reply.send(result).is_err() {
            debug!("client went away before the response was ready");
          }
        });
      }
      GatewayEvent::Sync { tag } if tag == SYNC_TAG => {
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
          gateway.retry.drain().await;
        });
      }
      GatewayEvent::Sync { tag } => {
        debug!(tag = %tag, "ignoring sync with unknown tag");
      }
      GatewayEvent::Other { kind } => {
        warn!(kind = %kind, "no handler for event, ignoring");
      }
      GatewayEvent::Shutdown => return false,
    }
    true
  }
}
