//! Maintenance tool for an on-disk Canopy cache.
//!
//! Usage:
//!   canopy-cache-admin [--config <path>] stats
//!   canopy-cache-admin [--config <path>] prune
//!   canopy-cache-admin [--config <path>] clear
//!   canopy-cache-admin [--config <path>] purge-owner <owner-id>
//!   canopy-cache-admin [--config <path>] top <n>
//!
//! The config path may also come from `CANOPY_CACHE_CONFIG`; without either
//! the defaults are used. Set `RUST_LOG` to control log output and
//! `CANOPY_LOG_FORMAT=json` for JSON logs.

use canopy_cache::ResponseCache;
use canopy_core::{CacheResult, CacheSettings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "usage: canopy-cache-admin [--config <path>] <stats|prune|clear|purge-owner <id>|top <n>>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Stats,
    Prune,
    Clear,
    PurgeOwner(String),
    Top(usize),
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            // Consumed by CacheSettings::load.
            iter.next();
        } else {
            positional.push(arg.as_str());
        }
    }

    match positional.as_slice() {
        ["stats"] => Ok(Command::Stats),
        ["prune"] => Ok(Command::Prune),
        ["clear"] => Ok(Command::Clear),
        ["purge-owner", owner] => Ok(Command::PurgeOwner((*owner).to_string())),
        ["top", n] => n
            .parse()
            .map(Command::Top)
            .map_err(|_| format!("top: expected a count, got {n:?}")),
        [] => Err("missing command".to_string()),
        other => Err(format!("unrecognized arguments: {}", other.join(" "))),
    }
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("canopy_cache=info,warn"));
    let json = std::env::var("CANOPY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Logs go to stderr; stdout carries command output.
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to init logging: {}", e);
    }
}

async fn run(command: Command) -> CacheResult<()> {
    let settings = CacheSettings::load_or_default()?;

    // Maintenance never needs a warm fast tier.
    let cache = ResponseCache::from_settings(&settings.clone().with_warm_up_count(0));
    cache.initialize().await?;

    match command {
        Command::Stats => {
            println!("path: {}", settings.store.path.display());
            println!("rows: {}", cache.durable_count().await?);
        }
        Command::Prune => {
            let report = cache.prune_expired().await?;
            println!("removed {} expired rows", report.durable_removed);
        }
        Command::Clear => {
            cache.clear().await?;
            println!("cache cleared");
        }
        Command::PurgeOwner(owner) => {
            let removed = cache.delete_for_owner(&owner).await?;
            println!("removed {} rows for owner {}", removed, owner);
        }
        Command::Top(n) => {
            for row in cache.most_frequently_used(n).await? {
                println!("{:>8}  {}", row.hit_count, row.key);
            }
        }
    }

    cache.shutdown().await
}

#[tokio::main]
async fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(command).await {
        tracing::error!(error = %e, "canopy-cache-admin failed");
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
