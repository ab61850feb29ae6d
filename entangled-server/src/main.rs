//! Entangled sync server binary.
//!
//! Serves the registered topic bases over WebSocket. With `--stdin`, lines of
//! the form `<topic> <json>` are published as new topic values.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use entangled_core::Value;
use entangled_sync::registry::TopicRegistry;
use entangled_sync::server::{ServerConfig, SyncServer};
use entangled_sync::storage::{Datastore, MemoryDatastore, RocksDatastore, StoreConfig};
use entangled_sync::topic::TopicConfig;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "entangled-server")]
#[command(about = "Real-time topic sync server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "ENTANGLED_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory (topics are kept in memory when omitted)
    #[arg(long, env = "ENTANGLED_STORAGE")]
    storage: Option<PathBuf>,

    /// Delta history entries kept per topic
    #[arg(long, env = "ENTANGLED_HISTORY_DEPTH", default_value_t = 5)]
    history_depth: usize,

    /// Resend to unacknowledged subscribers after this many milliseconds
    #[arg(long, env = "ENTANGLED_RESEND_TIMEOUT_MS", default_value_t = 3000)]
    resend_timeout_ms: u64,

    /// Registered topic base names
    #[arg(long = "topic", env = "ENTANGLED_TOPICS", value_delimiter = ',')]
    topics: Vec<String>,

    /// Publish `<topic> <json>` lines read from stdin
    #[arg(long)]
    stdin: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            topic: TopicConfig {
                history_depth: self.history_depth,
                resend_timeout: Duration::from_millis(self.resend_timeout_ms),
                ..TopicConfig::default()
            },
            ..ServerConfig::default()
        }
    }

    fn datastore(&self) -> Result<Arc<dyn Datastore>, BoxError> {
        match &self.storage {
            Some(path) => {
                let config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Ok(Arc::new(RocksDatastore::open(config)?))
            }
            None => {
                warn!("No storage directory given, topic state will not survive a restart");
                Ok(Arc::new(MemoryDatastore::new()))
            }
        }
    }
}

/// Split a `<topic> <json>` line. `None` for blank lines.
fn parse_line(line: &str) -> Result<Option<(&str, Value)>, BoxError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (topic, json) = line
        .split_once(char::is_whitespace)
        .ok_or("expected `<topic> <json>`")?;
    let value: serde_json::Value = serde_json::from_str(json.trim_start())?;
    Ok(Some((topic, Value::from(value))))
}

async fn feed_stdin(registry: Arc<TopicRegistry>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Ok(Some((topic, value))) => {
                    if let Err(e) = registry.send(topic, value).await {
                        warn!("Failed to publish on {topic}: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Ignoring input line: {e}"),
            },
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                error!("Failed to read stdin: {e}");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting Entangled sync server...");
    let server = SyncServer::new(args.server_config(), args.datastore()?);
    if args.topics.is_empty() {
        warn!("No topics registered, every sync request will be ignored");
    }
    for base in &args.topics {
        server.registry().register(base.as_str()).await;
    }
    if args.stdin {
        tokio::spawn(feed_stdin(server.registry().clone()));
    }

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
