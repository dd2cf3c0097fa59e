//! Versioned cache controller.
//!
//! Sits between the page and the network. Each controller owns exactly one
//! cache namespace, named after the build generation it resolved at install
//! time, and deletes every other namespace when it activates.
//!
//! ### Lifecycle
//! `new -> installing -> installed -> activating -> activated`. A failed
//! install or activation leaves the controller `redundant`. Only an
//! activated controller intercepts requests.
//!
//! ### Routing
//! - Navigations: network first, then any cached copy ignoring the query
//!   string, then the app shell, then the offline page.
//! - Assets (script, style, worker, font, image, or anything under the static
//!   prefix): network first, storing cacheable responses; offline, an exact
//!   match, then a query-insensitive match.
//! - Everything else passes through untouched.

pub mod clients;
pub mod generation;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use posa_core::{AppConfig, CacheStorage, Error, ResponseSnapshot};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use url::Url;

pub use clients::ClientRegistry;
pub use generation::{CacheGeneration, ClientMessage, parse_descriptor};

use crate::fetch::resolve;
use crate::network::Network;
use crate::request::{CacheMode, Request};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Route constants of one deployment, resolved against its origin.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub origin: Url,
    pub version_url: Url,
    pub cache_prefix: String,
    pub default_generation: String,
    pub precache: Vec<Url>,
    pub app_shell: Url,
    pub offline_page: Url,
    pub static_prefix: String,
    pub max_entries: usize,
}

impl ControllerConfig {
    pub fn from_app(config: &AppConfig) -> Result<Self, Error> {
        let origin = Url::parse(&config.origin).map_err(|e| Error::InvalidUrl(format!("{}: {e}", config.origin)))?;
        let at = |path: &str| resolve(path, &origin).map_err(|e| Error::InvalidUrl(format!("{path}: {e}")));

        Ok(Self {
            version_url: at(&config.version_path)?,
            cache_prefix: config.cache_prefix.clone(),
            default_generation: config.default_generation.clone(),
            precache: config.precache_urls.iter().map(|path| at(path)).collect::<Result<_, _>>()?,
            app_shell: at(&config.app_shell_path)?,
            offline_page: at(&config.offline_path)?,
            static_prefix: config.static_prefix.clone(),
            max_entries: config.max_cache_entries,
            origin,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    New,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::New => "new",
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Activating => "activating",
            LifecycleState::Activated => "activated",
            LifecycleState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Control signals sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
    #[serde(rename = "CHECK_VERSION")]
    CheckVersion,
}

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    Cache,
    AppShell,
    OfflinePage,
}

impl ResponseSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseSource::Network => "network",
            ResponseSource::Cache => "cache",
            ResponseSource::AppShell => "app_shell",
            ResponseSource::OfflinePage => "offline_page",
        }
    }
}

/// Outcome of offering one request to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    /// Not handled; the request goes to the network as if no controller existed.
    Passthrough,
    Responded { response: ResponseSnapshot, source: ResponseSource },
    /// Offline with nothing usable cached.
    NetworkError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub generation: CacheGeneration,
    pub namespace: String,
    pub cached: Vec<String>,
    /// Precache URLs that could not be stored, with the reason.
    pub skipped: Vec<(String, String)>,
    pub evicted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
    pub namespace: String,
    pub deleted: Vec<String>,
    pub evicted: u64,
    /// Clients that received the version broadcast.
    pub notified: usize,
}

enum Route {
    Navigation,
    Asset,
}

pub struct CacheController {
    config: ControllerConfig,
    network: Arc<dyn Network>,
    storage: CacheStorage,
    state: Mutex<LifecycleState>,
    resolved: Mutex<Option<CacheGeneration>>,
    resolving: tokio::sync::Mutex<()>,
    clients: ClientRegistry,
}

impl CacheController {
    pub fn new(config: ControllerConfig, network: Arc<dyn Network>, storage: CacheStorage) -> Self {
        Self {
            config,
            network,
            storage,
            state: Mutex::new(LifecycleState::New),
            resolved: Mutex::new(None),
            resolving: tokio::sync::Mutex::new(()),
            clients: ClientRegistry::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Connect a client that receives version broadcasts.
    pub fn connect_client(&self) -> broadcast::Receiver<ClientMessage> {
        self.clients.connect()
    }

    fn advance(&self, from: LifecycleState, to: LifecycleState) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(Error::InvalidInput(format!("cannot move to {to} from {}", *state)));
        }
        tracing::info!("controller {} -> {}", from, to);
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: LifecycleState) {
        *lock(&self.state) = to;
    }

    /// The generation memoised by an earlier resolution, if any.
    pub fn current_generation(&self) -> Option<CacheGeneration> {
        lock(&self.resolved).clone()
    }

    /// Resolve the cache generation.
    ///
    /// A resolved generation is memoised for the controller's lifetime. The
    /// fallback is not, so a later call retries the descriptor.
    pub async fn generation(&self) -> CacheGeneration {
        if let Some(generation) = self.current_generation() {
            return generation;
        }

        let _resolving = self.resolving.lock().await;
        if let Some(generation) = self.current_generation() {
            return generation;
        }

        let generation = self.fetch_generation().await;
        if !generation.is_default() {
            *lock(&self.resolved) = Some(generation.clone());
        }
        generation
    }

    async fn fetch_generation(&self) -> CacheGeneration {
        let request = Request::get(self.config.version_url.clone()).with_cache(CacheMode::NoStore);
        match self.network.fetch(&request).await {
            Ok(response) if response.is_ok() => match parse_descriptor(&response.body) {
                Some(version) => {
                    tracing::info!("resolved cache generation {}", version);
                    return CacheGeneration::resolved(version);
                }
                None => tracing::warn!("version descriptor at {} has no version", self.config.version_url),
            },
            Ok(response) => {
                tracing::warn!("version descriptor at {} returned {}", self.config.version_url, response.status)
            }
            Err(e) => tracing::warn!("failed to fetch build version: {}", e),
        }
        CacheGeneration::fallback(self.config.default_generation.clone())
    }

    /// Active namespace name for the current generation.
    pub async fn namespace(&self) -> String {
        self.generation().await.namespace(&self.config.cache_prefix)
    }

    /// Resolve the generation and fill its namespace with the precache list.
    ///
    /// Individual precache failures are logged and skipped.
    pub async fn install(&self) -> Result<InstallReport, Error> {
        self.advance(LifecycleState::New, LifecycleState::Installing)?;
        match self.precache().await {
            Ok(report) => {
                self.advance(LifecycleState::Installing, LifecycleState::Installed)?;
                Ok(report)
            }
            Err(e) => {
                self.set_state(LifecycleState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<InstallReport, Error> {
        let generation = self.generation().await;
        let namespace = generation.namespace(&self.config.cache_prefix);
        self.storage.open_namespace(&namespace).await?;

        let outcomes = join_all(self.config.precache.iter().map(|url| self.precache_one(&namespace, url))).await;

        let mut cached = Vec::new();
        let mut skipped = Vec::new();
        for (url, outcome) in self.config.precache.iter().zip(outcomes) {
            match outcome {
                Ok(()) => cached.push(url.to_string()),
                Err(reason) => {
                    tracing::warn!("install failed to fetch {}: {}", url, reason);
                    skipped.push((url.to_string(), reason));
                }
            }
        }

        let evicted = self.storage.enforce_limit(&namespace, self.config.max_entries).await?;
        tracing::info!("precached {} of {} urls into {}", cached.len(), self.config.precache.len(), namespace);

        Ok(InstallReport { generation, namespace, cached, skipped, evicted })
    }

    async fn precache_one(&self, namespace: &str, url: &Url) -> Result<(), String> {
        let response = self.network.fetch(&Request::get(url.clone())).await.map_err(|e| e.to_string())?;
        if !response.is_ok() {
            return Err(format!("status {}", response.status));
        }
        self.storage.put(namespace, url.as_str(), &response).await.map_err(|e| e.to_string())
    }

    /// Delete superseded namespaces, claim clients and announce the generation.
    pub async fn activate(&self) -> Result<ActivateReport, Error> {
        self.advance(LifecycleState::Installed, LifecycleState::Activating)?;
        match self.take_over().await {
            Ok(report) => {
                self.advance(LifecycleState::Activating, LifecycleState::Activated)?;
                Ok(report)
            }
            Err(e) => {
                self.set_state(LifecycleState::Redundant);
                Err(e)
            }
        }
    }

    async fn take_over(&self) -> Result<ActivateReport, Error> {
        let generation = self.generation().await;
        let namespace = generation.namespace(&self.config.cache_prefix);

        let mut deleted = Vec::new();
        for name in self.storage.namespaces().await? {
            if name != namespace && self.storage.delete_namespace(&name).await? {
                deleted.push(name);
            }
        }
        if !deleted.is_empty() {
            tracing::info!("deleted superseded caches: {}", deleted.join(", "));
        }

        self.storage.open_namespace(&namespace).await?;
        let evicted = self.storage.enforce_limit(&namespace, self.config.max_entries).await?;

        self.clients.claim();
        let notified = generation.version_info().map_or(0, |info| self.clients.broadcast(info));

        Ok(ActivateReport { namespace, deleted, evicted, notified })
    }

    /// Handle a control signal from a client.
    ///
    /// `CHECK_VERSION` is answered from the memoised generation without
    /// resolving it again; `None` when no real generation is known.
    pub async fn handle_message(&self, message: ControlMessage) -> Result<Option<ClientMessage>, Error> {
        match message {
            ControlMessage::SkipWaiting => {
                if self.state() == LifecycleState::Installed {
                    self.activate().await?;
                }
                Ok(None)
            }
            ControlMessage::CheckVersion => {
                Ok(self.current_generation().and_then(|generation| generation.version_info()))
            }
        }
    }

    fn route(&self, request: &Request) -> Option<Route> {
        if self.state() != LifecycleState::Activated || !request.is_get() {
            return None;
        }
        let url = &request.url;
        if !matches!(url.scheme(), "http" | "https") || url.origin() != self.config.origin.origin() {
            return None;
        }
        if url.as_str().contains("socket.io") {
            return None;
        }

        if request.is_navigation() {
            Some(Route::Navigation)
        } else if request.destination.is_asset() || url.path().starts_with(&self.config.static_prefix) {
            Some(Route::Asset)
        } else {
            None
        }
    }

    /// Offer one outgoing request to the controller.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Interception, Error> {
        match self.route(request) {
            None => Ok(Interception::Passthrough),
            Some(Route::Navigation) => self.navigate(request).await,
            Some(Route::Asset) => self.asset(request).await,
        }
    }

    async fn navigate(&self, request: &Request) -> Result<Interception, Error> {
        let network_error = match self.network.fetch(request).await {
            Ok(response) => return Ok(Interception::Responded { response, source: ResponseSource::Network }),
            Err(e) => e.to_string(),
        };
        tracing::debug!("navigation to {} offline: {}", request.url, network_error);

        if let Some(response) = self.storage.match_any(request.url.as_str(), true).await? {
            return Ok(Interception::Responded { response, source: ResponseSource::Cache });
        }
        if let Some(response) = self.storage.match_any(self.config.app_shell.as_str(), false).await? {
            return Ok(Interception::Responded { response, source: ResponseSource::AppShell });
        }
        if let Some(response) = self.storage.match_any(self.config.offline_page.as_str(), false).await? {
            return Ok(Interception::Responded { response, source: ResponseSource::OfflinePage });
        }
        Ok(Interception::NetworkError(network_error))
    }

    async fn asset(&self, request: &Request) -> Result<Interception, Error> {
        let url = request.url.as_str();
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    let namespace = self.namespace().await;
                    if let Err(e) = self.store(&namespace, url, &response).await {
                        tracing::warn!("cache put failed for {}: {}", url, e);
                    }
                }
                Ok(Interception::Responded { response, source: ResponseSource::Network })
            }
            Err(e) => {
                tracing::debug!("asset {} offline: {}", url, e);
                if let Some(response) = self.storage.match_any(url, false).await? {
                    return Ok(Interception::Responded { response, source: ResponseSource::Cache });
                }
                if let Some(response) = self.storage.match_any(url, true).await? {
                    return Ok(Interception::Responded { response, source: ResponseSource::Cache });
                }
                Ok(Interception::NetworkError(e.to_string()))
            }
        }
    }

    async fn store(&self, namespace: &str, url: &str, response: &ResponseSnapshot) -> Result<(), Error> {
        self.storage.put(namespace, url, response).await?;
        let evicted = self.storage.enforce_limit(namespace, self.config.max_entries).await?;
        if evicted > 0 {
            tracing::debug!("evicted {} entries from {}", evicted, namespace);
        }
        Ok(())
    }
}
