use clap::{Args, Parser, Subcommand};

use crate::retry::RetryConfig;
use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "gallery-sync", about = "Sync a local image manifest to a hosted gallery CMS")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Push manifest changes to the CMS (delete, upload, update)
    Sync(SyncArgs),
    /// Show what sync would change, without touching anything
    Diff(DiffArgs),
    /// Rebuild the local manifest from the CMS
    Pull(PullArgs),
    /// List, create, or delete categories
    Categories(CategoriesArgs),
}

/// Connection settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Base URL of the content API, e.g. https://abc123.api.sanity.io/v2024-01-01
    #[arg(long, env = "GALLERY_CMS_URL", value_name = "URL")]
    pub api_url: String,

    /// Dataset to read and write
    #[arg(long, env = "GALLERY_CMS_DATASET", default_value = "production")]
    pub dataset: String,

    /// API token with write access (if not provided, will prompt).
    /// WARNING: passing via --token is visible in process listings.
    /// Prefer the GALLERY_CMS_TOKEN environment variable instead.
    #[arg(long, env = "GALLERY_CMS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

/// Retry and timeout knobs for binary uploads. Values outside the
/// supported ranges are clamped, not rejected.
#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    /// Retries per upload after the first attempt (0-10)
    #[arg(long, env = "GALLERY_SYNC_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// First backoff delay in milliseconds (100-5000)
    #[arg(long, env = "GALLERY_SYNC_RETRY_INITIAL_DELAY_MS", default_value_t = 1000)]
    pub initial_delay_ms: u64,

    /// Backoff ceiling in milliseconds (1000-30000)
    #[arg(long, env = "GALLERY_SYNC_RETRY_MAX_DELAY_MS", default_value_t = 8000)]
    pub max_delay_ms: u64,

    /// Per-attempt upload timeout in milliseconds (5000-300000)
    #[arg(long, env = "GALLERY_SYNC_UPLOAD_TIMEOUT_MS", default_value_t = 60000)]
    pub upload_timeout_ms: u64,

    /// Retry uploads that fail with network-looking errors
    #[arg(
        long,
        env = "GALLERY_SYNC_RETRY_ON_NETWORK_ERRORS",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_name = "BOOL"
    )]
    pub retry_network_errors: bool,
}

impl RetryArgs {
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig::clamped(
            self.max_retries,
            self.initial_delay_ms,
            self.max_delay_ms,
            self.upload_timeout_ms,
            self.retry_network_errors,
        )
    }
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[command(flatten)]
    pub retry: RetryArgs,

    /// Path to the gallery manifest
    #[arg(long, default_value = "gallery.json")]
    pub manifest: String,

    /// Only sync the category with this slug
    #[arg(long)]
    pub category: Option<String>,

    /// Compute and print changes without applying them
    #[arg(long)]
    pub dry_run: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Do not write the reconciled state back to the manifest
    #[arg(long)]
    pub keep_manifest: bool,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Path to the gallery manifest
    #[arg(long, default_value = "gallery.json")]
    pub manifest: String,

    /// Only diff the category with this slug
    #[arg(long)]
    pub category: Option<String>,
}

#[derive(Args, Debug)]
pub struct PullArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Path to the gallery manifest
    #[arg(long, default_value = "gallery.json")]
    pub manifest: String,

    /// Overwrite an existing manifest without asking
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args, Debug)]
pub struct CategoriesArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Create a category with this title
    #[arg(long, value_name = "TITLE", conflicts_with = "delete")]
    pub create: Option<String>,

    /// Slug for --create (default: derived from the title)
    #[arg(long, requires = "create")]
    pub slug: Option<String>,

    /// Delete the category with this document id
    #[arg(long, value_name = "ID")]
    pub delete: Option<String>,
}
