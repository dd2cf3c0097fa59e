use std::ffi::OsString;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;

use super::BulkWrite;
use super::items::Item;
use super::worker::{StoreProtocol, StoreRequest, StoreResponse, StoreWorker};
use crate::Error;
use crate::channel::{MessageChannel, spawn_local, spawn_process};
use crate::config::{AppConfig, CONFIG_FILE_VAR};

fn unexpected(response: StoreResponse) -> Error {
    Error::Protocol(format!("unexpected record store reply: {response:?}"))
}

/// How the record store's background process is started.
#[derive(Debug, Clone)]
struct WorkerCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(&'static str, OsString)>,
}

impl WorkerCommand {
    fn parse(command_line: &str) -> Result<Self, Error> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::InvalidInput("worker command must not be empty".into()))?;
        Ok(Self { program, args: parts.collect(), env: Vec::new() })
    }

    /// The configured command, with the settings the child must share with `config`.
    fn from_config(config: &AppConfig) -> Result<Self, Error> {
        let mut command = Self::parse(&config.worker_command)?;
        command.env = config.worker_env();
        Ok(command)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if !self.env.is_empty() {
            // the overrides carry everything the child needs from a config file
            command.env_remove(CONFIG_FILE_VAR);
        }
        command.envs(self.env.iter().map(|(key, value)| (*key, value)));
        command
    }
}

/// Caller-side handle to the record store's background context.
#[derive(Debug)]
pub struct StoreClient {
    channel: MessageChannel<StoreProtocol>,
}

impl StoreClient {
    pub fn new(channel: MessageChannel<StoreProtocol>) -> Self {
        Self { channel }
    }

    /// Host `worker` on a tokio task of this process.
    pub fn local(worker: StoreWorker, timeout: Duration) -> Self {
        let slot = Mutex::new(Some(worker));
        let channel = MessageChannel::new(
            move || {
                let worker = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                worker
                    .map(spawn_local)
                    .ok_or_else(|| Error::WorkerFatal("record store worker was already started".into()))
            },
            timeout,
        );
        Self::new(channel)
    }

    /// Run the record store in a child process started from `command_line`.
    pub fn process(command_line: &str, timeout: Duration) -> Result<Self, Error> {
        Ok(Self::spawning(WorkerCommand::parse(command_line)?, timeout))
    }

    /// Child-process client using the configured worker command and call timeout.
    ///
    /// The child resolves the same data directory and store settings as `config`,
    /// whichever file or environment `config` was loaded from.
    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        Ok(Self::spawning(WorkerCommand::from_config(config)?, config.call_timeout()))
    }

    fn spawning(worker: WorkerCommand, timeout: Duration) -> Self {
        Self::new(MessageChannel::new(move || spawn_process(worker.command()), timeout))
    }

    /// Start the background context and wait for its handshake.
    pub async fn ready(&self) -> Result<(), Error> {
        self.channel.ready().await
    }

    /// Upsert one key/value pair. Returns whether it was mirrored to local storage.
    pub async fn persist(&self, key: &str, value: Value) -> Result<bool, Error> {
        match self.channel.call(StoreRequest::Persist { key: key.to_string(), value }).await? {
            StoreResponse::Persisted { mirrored, .. } => Ok(mirrored),
            other => Err(unexpected(other)),
        }
    }

    pub async fn bulk_put_items(&self, items: Vec<Value>) -> Result<BulkWrite, Error> {
        match self.channel.call(StoreRequest::BulkPutItems { items }).await? {
            StoreResponse::ItemsSaved(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub async fn bulk_put_prices(&self, price_list: &str, items: Vec<Value>) -> Result<BulkWrite, Error> {
        let request = StoreRequest::BulkPutPrices { price_list: price_list.to_string(), items };
        match self.channel.call(request).await? {
            StoreResponse::PricesSaved(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub async fn bulk_put_customers(&self, customers: Vec<Value>) -> Result<BulkWrite, Error> {
        match self.channel.call(StoreRequest::BulkPutCustomers { customers }).await? {
            StoreResponse::CustomersSaved(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Cache a raw catalog payload and get back the trimmed items.
    pub async fn parse_and_cache(&self, json: String, price_list: Option<String>) -> Result<Vec<Item>, Error> {
        match self.channel.call(StoreRequest::ParseAndCache { json, price_list }).await? {
            StoreResponse::Parsed { items } => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    /// Trim every offline queue to `limit` entries, or the default cap.
    pub async fn trim_queues(&self, limit: Option<usize>) -> Result<usize, Error> {
        match self.channel.call(StoreRequest::TrimQueues { limit }).await? {
            StoreResponse::QueuesTrimmed { removed } => Ok(removed),
            other => Err(unexpected(other)),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.channel.pending_count()
    }

    pub async fn destroy(&self) {
        self.channel.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KeyValueStore, MemoryKv};
    use crate::store::RecordStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::path::PathBuf;
    use std::sync::Arc;

    async fn local_client() -> (StoreClient, Arc<MemoryKv>) {
        let store = RecordStore::open_in_memory().await.unwrap().with_chunk_size(2);
        let mirror = Arc::new(MemoryKv::new());
        let worker = StoreWorker::new(store).with_mirror(mirror.clone(), 1024);
        (StoreClient::local(worker, Duration::from_secs(5)), mirror)
    }

    #[tokio::test]
    async fn test_persist_through_channel() {
        let (client, mirror) = local_client().await;
        assert!(client.persist("pos_profile", json!({"name": "Main"})).await.unwrap());
        assert!(mirror.get("posa_pos_profile").await.unwrap().is_some());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_bulk_items_through_channel() {
        let (client, _) = local_client().await;
        let items = (0..5).map(|i| json!({"item_code": format!("I{i}")})).collect();
        let outcome = client.bulk_put_items(items).await.unwrap();
        assert_eq!(outcome, BulkWrite { records: 5, transactions: 3 });
    }

    #[tokio::test]
    async fn test_worker_error_becomes_rejection() {
        let (client, _) = local_client().await;
        let err = client.parse_and_cache("{".into(), None).await.unwrap_err();
        assert_eq!(err.code(), "WORKER_ERROR");
        assert!(err.to_string().contains("INVALID_INPUT"));
    }

    #[tokio::test]
    async fn test_destroyed_client_rejects_calls() {
        let (client, _) = local_client().await;
        client.ready().await.unwrap();
        client.destroy().await;
        let err = client.persist("k", json!(1)).await.unwrap_err();
        assert_eq!(err.code(), "WORKER_DESTROYED");
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(StoreClient::process("   ", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_worker_command_carries_config() {
        let config = AppConfig {
            data_dir: PathBuf::from("/srv/till/configured"),
            chunk_size: 250,
            worker_command: "posa-worker --quiet".into(),
            ..Default::default()
        };
        let command = WorkerCommand::from_config(&config).unwrap().command();
        let command = command.as_std();

        assert_eq!(command.get_program(), OsStr::new("posa-worker"));
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec![OsStr::new("--quiet")]);
        let env: HashMap<&OsStr, Option<&OsStr>> = command.get_envs().collect();
        assert_eq!(env[OsStr::new("POSA_DATA_DIR")], Some(OsStr::new("/srv/till/configured")));
        assert_eq!(env[OsStr::new("POSA_CHUNK_SIZE")], Some(OsStr::new("250")));
        assert_eq!(env[OsStr::new(CONFIG_FILE_VAR)], None);
    }

    #[test]
    fn test_plain_command_inherits_environment() {
        let command = WorkerCommand::parse("posa-worker").unwrap().command();
        assert_eq!(command.as_std().get_envs().count(), 0);
    }
}
