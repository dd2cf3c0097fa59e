//! CLI argument definitions using clap derive

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use posa_client::Destination;
use posa_core::StorageClass;
use posa_core::store::MAX_QUEUE_ITEMS;

/// posa - offline data tools for the POS front end
///
/// Drives the background record store, the response cache controller and
/// the bulk purge against the configured data directory.
#[derive(Parser, Debug)]
#[command(name = "posa")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "POSA_CONFIG_FILE")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a catalog JSON file and store it through the worker
    Sync(SyncArgs),

    /// Store one key/value pair through the worker
    Persist(PersistArgs),

    /// Read records straight from the record store
    Lookup(LookupArgs),

    /// Route one request through the cache controller
    Fetch(FetchArgs),

    /// Check the offline queues against their size cap
    Queues(QueuesArgs),

    /// Resolve and print the cache generation
    Version,

    /// Clear local offline data
    Purge(PurgeArgs),
}

#[derive(Parser, Debug)]
pub struct SyncArgs {
    /// Catalog JSON (an item array, or an object with a `message` array)
    pub file: PathBuf,

    /// Also derive prices for this price list
    #[arg(long)]
    pub price_list: Option<String>,
}

#[derive(Parser, Debug)]
pub struct PersistArgs {
    pub key: String,

    /// JSON value; anything that is not valid JSON is stored as a string
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LookupBy {
    /// Exact item code
    Code,
    Barcode,
    /// Word of the item name
    Keyword,
    Serial,
    Batch,
    /// Customer name or contact details
    Customer,
}

#[derive(Parser, Debug)]
pub struct LookupArgs {
    #[arg(value_enum)]
    pub by: LookupBy,

    pub value: String,

    /// Maximum customers returned
    #[arg(long, default_value = "20")]
    pub limit: usize,
}

#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Absolute URL or path on the configured origin
    pub url: String,

    /// Treat the request as a page navigation
    #[arg(long, conflicts_with = "destination")]
    pub navigate: bool,

    /// Request destination (script, style, worker, font, image, document, manifest, empty)
    #[arg(long, default_value = "empty")]
    pub destination: Destination,

    /// Print the response body
    #[arg(long)]
    pub body: bool,
}

#[derive(Parser, Debug)]
pub struct QueuesArgs {
    /// Entries allowed per queue
    #[arg(long, default_value_t = MAX_QUEUE_ITEMS)]
    pub limit: usize,

    /// Drop the oldest entries of queues over the limit
    #[arg(long)]
    pub trim: bool,
}

#[derive(Parser, Debug)]
pub struct PurgeArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Storage class to leave alone (local_storage, session_storage, databases, caches)
    #[arg(long = "skip")]
    pub skip: Vec<StorageClass>,

    /// Only remove these key/value keys
    #[arg(long = "key")]
    pub keys: Vec<String>,

    /// Only delete these databases
    #[arg(long = "database")]
    pub databases: Vec<String>,

    /// Only delete these cache namespaces
    #[arg(long = "cache")]
    pub caches: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_purge() {
        let cli = Cli::try_parse_from([
            "posa",
            "purge",
            "--yes",
            "--skip",
            "caches",
            "--key",
            "offline_invoices",
            "--database",
            "posawesome_offline",
        ])
        .unwrap();
        let Commands::Purge(args) = cli.command else { panic!("expected purge") };
        assert!(args.yes);
        assert_eq!(args.skip, vec![StorageClass::Caches]);
        assert_eq!(args.keys, vec!["offline_invoices"]);
        assert_eq!(args.databases, vec!["posawesome_offline"]);
        assert!(args.caches.is_empty());
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from(["posa", "-vv", "fetch", "/assets/posawesome/a.js", "--destination", "script"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Fetch(args) = cli.command else { panic!("expected fetch") };
        assert_eq!(args.destination, Destination::Script);
        assert!(!args.navigate);
    }

    #[test]
    fn test_parse_lookup() {
        let cli = Cli::try_parse_from(["posa", "lookup", "barcode", "8901234"]).unwrap();
        let Commands::Lookup(args) = cli.command else { panic!("expected lookup") };
        assert_eq!(args.by, LookupBy::Barcode);
        assert_eq!(args.value, "8901234");
    }

    #[test]
    fn test_parse_queues() {
        let cli = Cli::try_parse_from(["posa", "queues"]).unwrap();
        let Commands::Queues(args) = cli.command else { panic!("expected queues") };
        assert_eq!(args.limit, MAX_QUEUE_ITEMS);
        assert!(!args.trim);

        let cli = Cli::try_parse_from(["posa", "queues", "--trim", "--limit", "50"]).unwrap();
        let Commands::Queues(args) = cli.command else { panic!("expected queues") };
        assert_eq!(args.limit, 50);
        assert!(args.trim);
    }

    #[test]
    fn test_rejects_unknown_storage_class() {
        assert!(Cli::try_parse_from(["posa", "purge", "--skip", "cookies"]).is_err());
    }
}
