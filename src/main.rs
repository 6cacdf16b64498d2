//! gallery-sync: keep a hosted gallery in step with a local JSON manifest.
//!
//! Diffs the manifest against the documents in a headless CMS and applies
//! the difference in phases (deletions, then binary uploads with
//! exponential-backoff retries, then metadata patches). Ctrl+C stops the
//! run at the next image boundary instead of mid-upload.

#![warn(clippy::all)]

mod cli;
mod config;
mod manifest;
mod progress;
mod retry;
mod shutdown;
mod store;
mod sync;
mod types;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::stream::{self, StreamExt};
use tracing_subscriber::EnvFilter;

use cli::{Command, ConnectArgs};
use config::{expand_tilde, StoreSettings};
use manifest::{slugify, CategoryEntry, Manifest};
use progress::{ConsoleProgress, ProgressSink};
use retry::RetryConfig;
use store::{ContentStore, HttpContentStore, ImageRecord};
use sync::{compute_change_set, SyncEngine};

/// Remote fetches to keep in flight when reading several categories.
const FETCH_CONCURRENCY: usize = 4;

fn build_store(
    connect: &ConnectArgs,
    upload_timeout: Duration,
) -> anyhow::Result<Arc<dyn ContentStore>> {
    let settings = StoreSettings::resolve(connect)?;
    let store = HttpContentStore::new(
        &settings.base_url,
        &settings.dataset,
        &settings.token,
        upload_timeout,
    )?;
    Ok(Arc::new(store))
}

fn in_scope(category: &CategoryEntry, only: Option<&str>) -> bool {
    only.is_none_or(|slug| category.slug == slug)
}

/// Ask a y/N question on stdout; anything but "y" declines.
fn confirm(prompt: &str) -> anyhow::Result<bool> {
    use std::io::Write;
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Give every in-scope manifest category a remote document id, adopting a
/// same-slug remote category when one exists and creating one otherwise.
/// Images inherit the id so later phases can reference their category.
async fn ensure_categories(
    store: &dyn ContentStore,
    manifest: &mut Manifest,
    only: Option<&str>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let all_resolved = manifest
        .categories
        .iter()
        .filter(|c| in_scope(c, only))
        .all(|c| c.id.is_some());
    if all_resolved {
        return Ok(());
    }

    let remote = store.list_categories().await?;
    for category in manifest.categories.iter_mut() {
        if !in_scope(category, only) {
            continue;
        }
        if category.id.is_none() {
            if let Some(existing) = remote.iter().find(|r| r.slug == category.slug) {
                tracing::debug!(
                    slug = %category.slug,
                    id = %existing.id,
                    "Category already exists remotely"
                );
                category.id = Some(existing.id.clone());
            } else if dry_run {
                tracing::info!(
                    "[DRY RUN] Would create category '{}' ({})",
                    category.title,
                    category.slug
                );
                continue;
            } else {
                let created = store
                    .create_category(&category.title, &category.slug)
                    .await?;
                tracing::info!("Created category '{}' with id {}", category.title, created.id);
                category.id = Some(created.id);
            }
        }
        if let Some(id) = category.id.clone() {
            for image in &mut category.images {
                image.category_id = id.clone();
            }
        }
    }
    Ok(())
}

/// Run the sync command.
async fn run_sync(args: cli::SyncArgs) -> anyhow::Result<()> {
    let manifest_path = expand_tilde(&args.manifest);
    let mut manifest = Manifest::load(&manifest_path).await?;

    if let Some(slug) = &args.category {
        if manifest.category(slug).is_none() {
            anyhow::bail!("No category '{}' in manifest {}", slug, manifest_path.display());
        }
    }

    let retry_config = args.retry.to_config();
    let store = build_store(&args.connect, retry_config.timeout())?;

    ensure_categories(
        store.as_ref(),
        &mut manifest,
        args.category.as_deref(),
        args.dry_run,
    )
    .await?;

    let scope: Vec<usize> = manifest
        .categories
        .iter()
        .enumerate()
        .filter(|(_, c)| in_scope(c, args.category.as_deref()))
        .map(|(index, _)| index)
        .collect();

    if args.dry_run {
        let mut total = 0usize;
        for &index in &scope {
            let category = &manifest.categories[index];
            let original = match &category.id {
                Some(id) => store.list_images(id).await?,
                None => Vec::new(),
            };
            let changes = compute_change_set(&category.images, &original);
            for image in &changes.to_remove {
                tracing::info!("[DRY RUN] Would delete {}", image.label());
            }
            for image in &changes.to_add {
                tracing::info!("[DRY RUN] Would upload {}", image.label());
            }
            for image in &changes.to_update {
                tracing::info!("[DRY RUN] Would update {}", image.label());
            }
            total += changes.len();
        }
        tracing::info!("[DRY RUN] {} change(s) across {} categories", total, scope.len());
        return Ok(());
    }

    let shutdown_token = shutdown::install();
    let sink: Arc<dyn ProgressSink> = Arc::new(ConsoleProgress::new(args.no_progress_bar));
    let engine = SyncEngine::new(
        store.clone(),
        sink,
        retry_config,
        shutdown_token.clone(),
    );

    let mut failed_total = 0usize;
    let mut synced_total = 0usize;
    let mut canceled = false;
    let mut dirty = false;

    for &index in &scope {
        if shutdown_token.is_cancelled() {
            canceled = true;
            break;
        }

        let category = &manifest.categories[index];
        // ensure_categories has already created any missing ids.
        let Some(category_id) = category.id.clone() else {
            continue;
        };
        let slug = category.slug.clone();
        tracing::info!(
            "Syncing category '{}' ({} local image(s))",
            slug,
            category.images.len()
        );

        let original = match store.list_images(&category_id).await {
            Ok(images) => images,
            Err(e) => {
                tracing::error!("Skipping category '{}': {}", slug, e);
                failed_total += 1;
                continue;
            }
        };

        let report = engine.reconcile(&category.images, &original).await?;

        failed_total += report.failed.len();
        synced_total += report.new_images.len();
        if !args.keep_manifest {
            manifest.categories[index].images = report.working_set;
            dirty = true;
        }
        if report.canceled {
            canceled = true;
            break;
        }
    }

    if dirty {
        manifest.save(&manifest_path).await?;
        tracing::info!("Manifest updated: {}", manifest_path.display());
    }

    if canceled {
        tracing::warn!("Sync canceled; completed work has been kept");
        return Ok(());
    }
    if failed_total > 0 {
        anyhow::bail!("{} image(s) failed to sync", failed_total);
    }
    tracing::info!("Sync complete: {} image(s) created or updated", synced_total);
    Ok(())
}

/// Run the diff command.
async fn run_diff(args: cli::DiffArgs) -> anyhow::Result<()> {
    let manifest_path = expand_tilde(&args.manifest);
    let manifest = Manifest::load(&manifest_path).await?;

    if let Some(slug) = &args.category {
        if manifest.category(slug).is_none() {
            anyhow::bail!("No category '{}' in manifest {}", slug, manifest_path.display());
        }
    }

    let store = build_store(&args.connect, RetryConfig::default().timeout())?;

    let scope: Vec<&CategoryEntry> = manifest
        .categories
        .iter()
        .filter(|c| in_scope(c, args.category.as_deref()))
        .collect();

    // Fetch remote sets a few categories at a time; output order follows
    // the manifest.
    let originals: Vec<Vec<ImageRecord>> = stream::iter(scope.iter().map(|category| {
        let store = store.clone();
        async move {
            match &category.id {
                Some(id) => store.list_images(id).await,
                None => Ok(Vec::new()),
            }
        }
    }))
    .buffered(FETCH_CONCURRENCY)
    .collect::<Vec<_>>()
    .await
    .into_iter()
    .collect::<Result<_, _>>()?;

    let mut total = 0usize;
    for (category, original) in scope.iter().zip(&originals) {
        let changes = compute_change_set(&category.images, original);
        println!("{} ({})", category.title, category.slug);
        if category.id.is_none() {
            println!("  (not created remotely yet)");
        }
        if changes.is_empty() {
            println!("  no changes");
            continue;
        }
        for image in &changes.to_remove {
            println!("  - {}", image.label());
        }
        for image in &changes.to_add {
            println!("  + {}", image.label());
        }
        for image in &changes.to_update {
            println!("  ~ {}", image.label());
        }
        total += changes.len();
    }
    println!();
    println!("{} change(s) pending", total);
    Ok(())
}

/// Run the pull command.
async fn run_pull(args: cli::PullArgs) -> anyhow::Result<()> {
    let manifest_path = expand_tilde(&args.manifest);

    if manifest_path.exists() && !args.yes {
        println!("This will overwrite the manifest at:");
        println!("  {}", manifest_path.display());
        println!();
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let store = build_store(&args.connect, RetryConfig::default().timeout())?;

    let categories = store.list_categories().await?;
    let image_sets: Vec<Vec<ImageRecord>> = stream::iter(categories.iter().map(|category| {
        let store = store.clone();
        let id = category.id.clone();
        async move { store.list_images(&id).await }
    }))
    .buffered(FETCH_CONCURRENCY)
    .collect::<Vec<_>>()
    .await
    .into_iter()
    .collect::<Result<_, _>>()?;

    let mut entries = Vec::with_capacity(categories.len());
    let mut image_total = 0usize;
    for (category, images) in categories.into_iter().zip(image_sets) {
        image_total += images.len();
        entries.push(CategoryEntry {
            id: Some(category.id),
            slug: category.slug,
            title: category.title,
            images,
        });
    }

    let manifest = Manifest {
        categories: entries,
    };
    manifest.save(&manifest_path).await?;
    println!(
        "Pulled {} categories ({} images) into {}",
        manifest.categories.len(),
        image_total,
        manifest_path.display()
    );
    Ok(())
}

/// Run the categories command.
async fn run_categories(args: cli::CategoriesArgs) -> anyhow::Result<()> {
    let store = build_store(&args.connect, RetryConfig::default().timeout())?;

    if let Some(title) = &args.create {
        let slug = match &args.slug {
            Some(slug) => slug.clone(),
            None => slugify(title),
        };
        if slug.is_empty() {
            anyhow::bail!("Cannot derive a slug from '{}'; pass --slug", title);
        }
        let category = store.create_category(title, &slug).await?;
        println!(
            "Created category '{}' ({}) with id {}",
            category.title, category.slug, category.id
        );
        return Ok(());
    }

    if let Some(id) = &args.delete {
        if !confirm(&format!("Delete category {}?", id))? {
            println!("Cancelled.");
            return Ok(());
        }
        store.delete_category(id).await?;
        println!("Deleted category {}", id);
        return Ok(());
    }

    let categories = store.list_categories().await?;
    if categories.is_empty() {
        println!("No categories.");
        return Ok(());
    }
    println!("Categories:");
    for category in categories {
        match category.updated_at {
            Some(ts) => println!(
                "  {}  {} ({})  updated {}",
                category.id,
                category.title,
                category.slug,
                ts.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => println!("  {}  {} ({})", category.id, category.title, category.slug),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Sync(args) => run_sync(args).await,
        Command::Diff(args) => run_diff(args).await,
        Command::Pull(args) => run_pull(args).await,
        Command::Categories(args) => run_categories(args).await,
    }
}
