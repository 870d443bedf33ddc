use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use serde::Deserialize;
use tarry_common::{Signal, TransactionMode, internal, logging, tracing};
use tarry_delivery::{
    CriticalErrorHandler, DelayedDeliveryPump, DelayedDeliverySettings, InMemoryTransport,
    PumpSettings,
};
use tarry_store::StoreConfig;
use tokio::{sync::broadcast, task::JoinSet};

fn default_endpoint_name() -> String {
    String::from("tarry")
}

fn default_error_queue() -> String {
    String::from("error")
}

/// The logical endpoint this process hosts
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    /// Input queue name; the timeouts queue is derived from it
    #[serde(default = "default_endpoint_name")]
    pub name: String,
    #[serde(default = "default_error_queue")]
    pub error_queue: String,
    #[serde(default)]
    pub transaction_mode: TransactionMode,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            name: default_endpoint_name(),
            error_queue: default_error_queue(),
            transaction_mode: TransactionMode::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Tarry {
    #[serde(default)]
    pub endpoint: Endpoint,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(alias = "delivery", default)]
    pub delayed_delivery: DelayedDeliverySettings,
    /// Additional destination queues to create and consume
    #[serde(alias = "queue", default)]
    pub queues: Vec<String>,
}

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "TARRY_CONFIG";

/// Configuration files tried, in order, when [`CONFIG_ENV`] is unset
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./tarry.config.ron", "/etc/tarry/tarry.config.ron"];

/// Pick the configuration file to load
///
/// An explicit path always wins and must exist. Otherwise the first existing
/// entry of `defaults` is used.
///
/// # Errors
///
/// If the explicit path does not exist, or none of `defaults` do.
pub fn locate_config(explicit: Option<PathBuf>, defaults: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| anyhow::anyhow!("Failed to broadcast shutdown: {e}"))?;

    Ok(())
}

/// Log everything arriving on `queue` until shutdown is broadcast
async fn consume(
    transport: InMemoryTransport,
    queue: String,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    loop {
        tokio::select! {
            received = transport.receive(&queue) => match received {
                Ok(message) => tracing::info!(
                    queue = %queue,
                    message_id = %message.message_id,
                    headers = ?message.headers,
                    bytes = message.body.len(),
                    "Received message"
                ),
                Err(e) => {
                    tracing::error!(queue = %queue, error = %e, "Failed to receive");
                    break;
                }
            },
            sig = shutdown.recv() => match sig {
                Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(s) => tracing::debug!("Received {s:?}"),
                Err(e) => tracing::debug!("Received: {e:?}"),
            },
        }
    }
}

fn critical_error_handler() -> CriticalErrorHandler {
    Arc::new(|critical| {
        tracing::error!(
            breaker = %critical.breaker,
            cause = ?critical.error,
            "Critical error: {}",
            critical.message
        );
    })
}

impl Tarry {
    /// Load the configuration named by [`CONFIG_ENV`], or the first of
    /// [`DEFAULT_CONFIG_PATHS`] that exists
    ///
    /// # Errors
    ///
    /// If no configuration file can be found, read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let defaults = DEFAULT_CONFIG_PATHS.map(PathBuf::from);
        let path = locate_config(std::env::var_os(CONFIG_ENV).map(PathBuf::from), &defaults)?;
        Self::from_file(&path)
    }

    /// Parse a RON configuration file
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not a valid configuration.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;
        ron::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))
    }

    /// Queues consumed by this process: the endpoint input queue, the error
    /// queue and every configured destination, without duplicates
    #[must_use]
    pub fn consumed_queues(&self) -> Vec<String> {
        let mut queues = vec![self.endpoint.name.clone(), self.endpoint.error_queue.clone()];
        for queue in &self.queues {
            if !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        queues
    }

    /// Run the delayed delivery endpoint until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// This function will return an error if the delayed delivery pipeline
    /// fails to initialise or start, or the signal handlers cannot be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!("Controller running");

        let transport = InMemoryTransport::new();
        let queues = self.consumed_queues();
        for queue in &queues {
            transport.create_queue(queue.clone());
        }
        transport.create_queue(self.delayed_delivery.timeouts_queue(&self.endpoint.name));

        let mut pump = DelayedDeliveryPump::new(
            Box::new(transport.pump()),
            self.store.into_store(),
            Arc::new(transport.clone()),
            self.delayed_delivery,
        );
        pump.init(
            critical_error_handler(),
            PumpSettings {
                input_queue: self.endpoint.name,
                error_queue: self.endpoint.error_queue,
                transaction_mode: self.endpoint.transaction_mode,
            },
        )
        .await?;
        pump.start()?;

        tracing::info!(
            timeouts_queue = pump.timeouts_queue().unwrap_or_default(),
            "Delayed delivery started"
        );

        let mut consumers = JoinSet::new();
        for queue in queues {
            consumers.spawn(consume(
                transport.clone(),
                queue,
                SHUTDOWN_BROADCAST.subscribe(),
            ));
        }

        let ret = shutdown().await;

        internal!("Shutting down...");

        tokio::select! {
            () = async {
                pump.stop().await;
                while consumers.join_next().await.is_some() {}
            } => {}
            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forced shutdown");
            }
        }

        ret
    }
}
