//! Command implementations

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use posa_client::fetch::resolve;
use posa_client::{CacheController, ControllerConfig, FetchClient, FetchConfig, Interception, Network, Request};
use posa_core::purge::DatabaseDir;
use posa_core::store::{RecordStore, StoreClient, TokenKind};
use posa_core::{AppConfig, CachePurge, CacheStorage, MemoryKv, PurgeOptions, PurgeReport, SqliteKv};
use serde_json::Value;

use crate::args::{FetchArgs, LookupArgs, LookupBy, PersistArgs, PurgeArgs, QueuesArgs, SyncArgs};
use crate::prompt::TerminalConfirm;

async fn ensure_dirs(config: &AppConfig) -> Result<()> {
    tokio::fs::create_dir_all(config.databases_dir())
        .await
        .with_context(|| format!("creating {}", config.databases_dir().display()))
}

/// Start the worker process and wait for its handshake.
async fn start_worker(config: &AppConfig) -> Result<StoreClient> {
    ensure_dirs(config).await?;
    let client = StoreClient::from_config(config)?;
    if let Err(e) = client.ready().await {
        client.destroy().await;
        return Err(e.into());
    }
    Ok(client)
}

pub async fn sync(args: SyncArgs, config: &AppConfig) -> Result<()> {
    let json = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let client = start_worker(config).await?;
    let outcome = client.parse_and_cache(json, args.price_list.clone()).await;
    client.destroy().await;
    let items = outcome?;

    println!("{} {} items stored", style("✓").green(), items.len());
    if let Some(price_list) = args.price_list {
        println!("  prices derived for {}", style(price_list).cyan());
    }
    Ok(())
}

pub async fn persist(args: PersistArgs, config: &AppConfig) -> Result<()> {
    let value = serde_json::from_str(&args.value).unwrap_or_else(|_| Value::String(args.value.clone()));
    let client = start_worker(config).await?;
    let outcome = client.persist(&args.key, value).await;
    client.destroy().await;
    let mirrored = outcome?;

    println!("{} {} persisted{}", style("✓").green(), args.key, if mirrored { " (mirrored)" } else { "" });
    Ok(())
}

pub async fn lookup(args: LookupArgs, config: &AppConfig) -> Result<()> {
    let path = config.record_db_path();
    if !path.exists() {
        bail!("no record store at {} (run `posa sync` first)", path.display());
    }
    let store = RecordStore::open(&path).await?;

    let found = match args.by {
        LookupBy::Code => match store.get_item(&args.value).await? {
            Some(item) => {
                let prices = store.prices_for_item(&item.item_code).await?;
                serde_json::json!({ "item": item, "prices": prices })
            }
            None => Value::Null,
        },
        LookupBy::Barcode => serde_json::to_value(store.find_items(TokenKind::Barcode, &args.value).await?)?,
        LookupBy::Keyword => serde_json::to_value(store.find_items(TokenKind::Keyword, &args.value).await?)?,
        LookupBy::Serial => serde_json::to_value(store.find_items(TokenKind::Serial, &args.value).await?)?,
        LookupBy::Batch => serde_json::to_value(store.find_items(TokenKind::Batch, &args.value).await?)?,
        LookupBy::Customer => serde_json::to_value(store.search_customers(&args.value, args.limit).await?)?,
    };

    if found.is_null() || found.as_array().is_some_and(Vec::is_empty) {
        println!("No records found.");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&found)?);
    Ok(())
}

pub async fn queues(args: QueuesArgs, config: &AppConfig) -> Result<()> {
    if args.trim {
        let client = start_worker(config).await?;
        let outcome = client.trim_queues(Some(args.limit)).await;
        client.destroy().await;
        let removed = outcome?;
        println!("{} {} old queue entries removed", style("✓").green(), removed);
        return Ok(());
    }

    let path = config.record_db_path();
    if !path.exists() {
        bail!("no record store at {} (run `posa sync` first)", path.display());
    }
    let store = RecordStore::open(&path).await?;
    if store.queue_health_check(args.limit).await? {
        println!(
            "{} an offline queue holds more than {} entries (run with --trim)",
            style("!").yellow(),
            args.limit
        );
    } else {
        println!("{} offline queues are within {} entries", style("✓").green(), args.limit);
    }
    Ok(())
}

async fn controller(config: &AppConfig) -> Result<(CacheController, Arc<dyn Network>)> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let network: Arc<dyn Network> = Arc::new(FetchClient::new(FetchConfig::from_app(config))?);
    let storage = CacheStorage::open(config.cache_storage_path()).await?;
    let controller = CacheController::new(ControllerConfig::from_app(config)?, network.clone(), storage);
    Ok((controller, network))
}

pub async fn fetch(args: FetchArgs, config: &AppConfig) -> Result<()> {
    let (controller, network) = controller(config).await?;

    let install = controller.install().await?;
    for (url, reason) in &install.skipped {
        println!("{} precache skipped {}: {}", style("!").yellow(), url, reason);
    }
    let activate = controller.activate().await?;
    println!(
        "{} controller active on {} ({} cached, {} old caches deleted)",
        style("✓").green(),
        style(&activate.namespace).cyan(),
        install.cached.len(),
        activate.deleted.len()
    );

    let url = resolve(&args.url, &controller.config().origin)?;
    let request = if args.navigate { Request::navigate(url) } else { Request::resource(url, args.destination) };

    let (response, source) = match controller.handle_fetch(&request).await? {
        Interception::Responded { response, source } => (response, source.as_str()),
        Interception::Passthrough => (network.fetch(&request).await?, "passthrough"),
        Interception::NetworkError(reason) => bail!("network error: {reason}"),
    };

    println!(
        "{} {} {} from {} ({} bytes)",
        response.status,
        response.response_type.as_str(),
        request.url,
        style(source).bold(),
        response.body.len()
    );
    if args.body {
        println!("{}", String::from_utf8_lossy(&response.body));
    }
    Ok(())
}

pub async fn version(config: &AppConfig) -> Result<()> {
    let (controller, _) = controller(config).await?;
    let generation = controller.generation().await;

    println!("generation: {}", style(generation.id()).cyan());
    println!("namespace:  {}", generation.namespace(&controller.config().cache_prefix));
    match generation.timestamp() {
        Some(ts) => println!("timestamp:  {ts}"),
        None => println!("timestamp:  -"),
    }
    if generation.is_default() {
        println!("{} version descriptor unavailable, using the default generation", style("!").yellow());
    }
    Ok(())
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() { None } else { Some(values) }
}

fn print_report(report: &PurgeReport) {
    if report.declined {
        println!("Purge cancelled, nothing was cleared.");
        return;
    }
    for class in &report.cleared {
        println!("{} {}", style("cleared").green(), class);
    }
    for class in &report.skipped {
        println!("{} {}", style("skipped").dim(), class);
    }
    for (class, reason) in &report.failed {
        println!("{} {}: {}", style("failed").red(), class, reason);
    }
}

pub async fn purge(args: PurgeArgs, config: &AppConfig) -> Result<()> {
    ensure_dirs(config).await?;
    let local = SqliteKv::open(config.local_storage_path()).await?;
    let caches = CacheStorage::open(config.cache_storage_path()).await?;
    let purge = CachePurge::new(
        Arc::new(local),
        Arc::new(MemoryKv::new()),
        DatabaseDir::new(config.databases_dir()),
        caches,
    );

    let options = PurgeOptions {
        confirm: !args.yes,
        skip: args.skip,
        specific_keys: non_empty(args.keys),
        specific_databases: non_empty(args.databases),
        specific_caches: non_empty(args.caches),
    };

    let report = purge.run(&options, Some(&TerminalConfirm)).await;
    print_report(&report);
    report.into_result()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Vec::new()), None);
        assert_eq!(non_empty(vec!["a".into()]), Some(vec!["a".to_string()]));
    }
}
