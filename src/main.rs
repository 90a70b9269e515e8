//! schema-cache CLI
//!
//! Inspects and maintains the persisted schema document cache.
//!
//! ```text
//! schema-cache stats
//! schema-cache lookup --project 7 --name "get user"
//! schema-cache clear --project 7
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use schema_cache::cache::{CacheHit, FetchRequest, StaticOrigin};
use schema_cache::{CacheConfig, HybridCache};

// =============================================================================
// CLI Arguments
// =============================================================================

/// schema-cache - Hybrid memory/disk cache for API schema documents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "SCHEMA_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Location of the cache document
    #[arg(long, env = "SCHEMA_CACHE_PATH")]
    disk_path: Option<PathBuf>,

    /// Entry time-to-live in milliseconds
    #[arg(long, env = "SCHEMA_CACHE_TTL_MS")]
    ttl_ms: Option<u64>,

    /// Memory tier capacity in entries
    #[arg(long, env = "SCHEMA_CACHE_MEMORY_MAX")]
    memory_max_entries: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print tier statistics
    Stats,

    /// Look up a document by project and id
    Get {
        #[arg(long)]
        project: String,
        #[arg(long)]
        id: u64,
    },

    /// Look up a document by url, name or endpoint
    #[command(group(ArgGroup::new("by").required(true).args(["url", "name", "path"])))]
    Lookup {
        /// Project scope (required for --name and --path)
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        path: Option<String>,
        /// HTTP method for --path
        #[arg(long, default_value = "GET")]
        method: String,
    },

    /// Cache a document read from a JSON file
    Import {
        #[arg(long)]
        project: String,
        #[arg(long)]
        id: u64,
        /// JSON document to cache
        #[arg(long)]
        file: PathBuf,
        /// Source URL to index the document under
        #[arg(long)]
        url: Option<String>,
        /// Endpoint name; inferred from the document when omitted
        #[arg(long)]
        name: Option<String>,
    },

    /// Remove cached documents
    #[command(group(ArgGroup::new("scope").required(true).args(["project", "key", "all"])))]
    Clear {
        #[arg(long)]
        project: Option<String>,
        /// Primary key, e.g. doc:7:42
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        all: bool,
    },

    /// Print where the cache document lives
    Location,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;

    if let Command::Location = args.command {
        let path = config.resolve_disk_path()?;
        println!("{}", path.display());
        return Ok(());
    }

    let cache = HybridCache::new(config)?;
    info!(persistent = cache.is_persistent(), "Cache opened");

    let output = run(&cache, args.command).await;

    let report = cache.shutdown().await;
    if report.timed_out {
        eprintln!("warning: {} entries were not written to disk", report.pending);
    }

    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

async fn run(cache: &HybridCache, command: Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::Stats => serde_json::to_value(cache.stats())?,

        Command::Get { project, id } => hit_json(cache.get_by_primary(&project, id)),

        Command::Lookup {
            project,
            url,
            name,
            path,
            method,
        } => {
            let hit = match (url, name, path) {
                (Some(url), _, _) => cache.get_by_url(&url),
                (_, Some(name), _) => {
                    let project = project.context("--name requires --project")?;
                    cache.get_by_name(&project, &name)
                }
                (_, _, Some(path)) => {
                    let project = project.context("--path requires --project")?;
                    cache.get_by_path(&project, &method, &path)
                }
                _ => bail!("one of --url, --name or --path is required"),
            };
            hit_json(hit)
        }

        Command::Import {
            project,
            id,
            file,
            url,
            name,
        } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let document: Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;

            let origin = StaticOrigin::new();
            origin.insert(project.clone(), document);

            let mut request = FetchRequest::new(project, id, Value::Null);
            if let Some(url) = url {
                request = request.with_source_url(url);
            }
            if let Some(name) = name {
                request = request.with_name(name);
            }
            let entry = cache.refresh(request, &origin).await?;
            cache.flush().await?;
            json!({ "cached": entry.primary_key(), "metadata": entry.metadata })
        }

        Command::Clear { project, key, all } => {
            if all {
                cache.clear_all().await;
                json!({ "cleared": "all" })
            } else if let Some(key) = key {
                json!({ "cleared": key, "removed": cache.clear_one(&key).await })
            } else if let Some(project) = project {
                json!({ "project": project, "removed": cache.clear_project(&project).await })
            } else {
                bail!("one of --project, --key or --all is required")
            }
        }

        Command::Location => json!(cache.disk_location()),
    };
    Ok(output)
}

fn hit_json(hit: Option<CacheHit>) -> Value {
    match hit {
        Some(hit) => json!({
            "tier": hit.tier,
            "metadata": hit.entry.metadata,
            "document": hit.entry.document,
        }),
        None => Value::Null,
    }
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if let Some(path) = &args.disk_path {
        config.disk_path = Some(path.clone());
    }
    if let Some(ttl_ms) = args.ttl_ms {
        config.ttl_ms = ttl_ms;
    }
    if let Some(max) = args.memory_max_entries {
        config.memory_max_entries = max;
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
