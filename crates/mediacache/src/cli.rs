use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::future;
use mediacache_service::caching::CacheRegistry;
use mediacache_service::config::Config;
use mediacache_service::fetch::FetchError;
use mediacache_service::metrics;
use mediacache_service::types::ResourceKey;
use mediacache_service::vfile::DirectoryContentAccess;
use tokio::runtime::Handle;
use tracing::level_filters::LevelFilter;

use crate::logging;

/// Resolves media locators into local files, fetching each resource at most once.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the log level from the configuration file.
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch media and copy it into the output directory.
    Fetch(FetchArgs),

    /// Remove temporary files older than `stale_file_age` from the work directory.
    Cleanup,
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// HTTP URLs, file paths or content locators of the media to fetch.
    #[arg(required = true, value_name = "LOCATOR")]
    locators: Vec<String>,

    /// Distinguishes variants of the same media, e.g. different renditions.
    #[arg(long, short)]
    discriminator: Option<String>,

    /// Directory the fetched files are copied into.
    #[arg(long, short, default_value = ".", value_name = "DIR")]
    output: PathBuf,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No threads have been spawned yet, the runtime is created below.
    unsafe { logging::init_logging(&config) };

    metrics::configure_statsd(&config.metrics).context("failed to configure statsd")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("mediacache")
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    match cli.command {
        Command::Fetch(args) => {
            let registry = create_registry(&config, runtime.handle().clone())?;
            let result = runtime.block_on(fetch(&registry, &args));
            registry.shutdown();
            result
        }
        Command::Cleanup => {
            // Creating the registry sweeps the work directory.
            let registry = create_registry(&config, runtime.handle().clone())?;
            println!("cleaned up {}", registry.work_dir().display());
            Ok(())
        }
    }
}

fn create_registry(config: &Config, runtime: Handle) -> Result<CacheRegistry> {
    let mut registry = CacheRegistry::new(config, runtime).with_context(|| {
        format!(
            "failed to set up media cache in {}",
            config.work_dir.display()
        )
    })?;

    if let Some(ref root) = config.content_root {
        registry = registry.with_content_access(Arc::new(DirectoryContentAccess::new(root)));
    }

    Ok(registry.with_progress(Arc::new(
        |key: &ResourceKey, received: u64, total: Option<u64>| {
            tracing::trace!(%key, received, ?total, "download progress");
        },
    )))
}

async fn fetch(registry: &CacheRegistry, args: &FetchArgs) -> Result<()> {
    tokio::fs::create_dir_all(&args.output)
        .await
        .with_context(|| format!("failed to create {}", args.output.display()))?;

    let results = fetch_all(registry, args).await;

    let mut failed = 0;
    for (locator, result) in &results {
        match result {
            Ok(path) => println!("{locator} -> {}", path.display()),
            Err(error) => {
                failed += 1;
                tracing::error!(locator = %locator, "failed to fetch media: {error:#}");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} locators could not be fetched", results.len());
    }
    Ok(())
}

/// Fetches all locators concurrently and copies the results into the output directory.
async fn fetch_all(
    registry: &CacheRegistry,
    args: &FetchArgs,
) -> Vec<(String, Result<PathBuf>)> {
    let discriminator = args.discriminator.as_deref();
    let keys: Vec<_> = args
        .locators
        .iter()
        .map(|locator| ResourceKey::new(locator.as_str(), discriminator))
        .collect();
    let names = output_names(&keys);

    let tasks = args.locators.iter().zip(names).map(|(locator, name)| async move {
        let entry = registry.get_cache(locator, discriminator);
        let result = match entry.get_file_async().await {
            Ok(cached) => copy_to_output(&cached, &args.output.join(name)).await,
            Err(error) => Err(fetch_error(error)),
        };
        entry.release();
        (locator.clone(), result)
    });

    future::join_all(tasks).await
}

fn fetch_error(error: FetchError) -> anyhow::Error {
    anyhow::Error::new(error).context("fetch failed")
}

async fn copy_to_output(cached: &Path, target: &Path) -> Result<PathBuf> {
    tokio::fs::copy(cached, target)
        .await
        .with_context(|| format!("failed to copy into {}", target.display()))?;
    Ok(target.to_owned())
}

/// Picks the file names for all `keys`, see [`output_name`].
///
/// Different resources that would end up under the same name get their cache id appended.
fn output_names(keys: &[ResourceKey]) -> Vec<String> {
    let names: Vec<_> = keys.iter().map(output_name).collect();

    let mut owners: HashMap<&str, HashSet<&ResourceKey>> = HashMap::new();
    for (name, key) in names.iter().zip(keys) {
        owners.entry(name.as_str()).or_default().insert(key);
    }

    names
        .iter()
        .zip(keys)
        .map(|(name, key)| match owners[name.as_str()].len() {
            1 => name.clone(),
            _ => with_cache_id(name, key),
        })
        .collect()
}

/// Inserts the short cache id of `key` in front of the extension of `name`.
fn with_cache_id(name: &str, key: &ResourceKey) -> String {
    let id = &key.cache_id()[..12];
    match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => format!("{stem}-{id}.{extension}"),
        _ => format!("{name}-{id}"),
    }
}

/// Picks the file name for a fetched resource.
///
/// This is the last segment of the locator, without query or fragment. Discriminated variants
/// are prefixed with their discriminator. Locators without a usable name fall back to the
/// cache id.
fn output_name(key: &ResourceKey) -> String {
    let locator = key.locator();
    let locator = locator.split(['?', '#']).next().unwrap_or(locator);
    let name = locator
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_owned)
        .unwrap_or_else(|| key.cache_id());

    match key.discriminator() {
        Some(discriminator) => format!("{discriminator}-{name}"),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "mediacache",
            "--log-level",
            "debug",
            "fetch",
            "-d",
            "720p",
            "--output",
            "/tmp/out",
            "https://example.com/a.mp4",
            "media/b.mp4",
        ])
        .unwrap();

        assert_eq!(cli.log_level, Some(LevelFilter::DEBUG));
        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch command");
        };
        assert_eq!(args.locators, ["https://example.com/a.mp4", "media/b.mp4"]);
        assert_eq!(args.discriminator.as_deref(), Some("720p"));
        assert_eq!(args.output, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn test_parse_fetch_requires_locator() {
        assert!(Cli::try_parse_from(["mediacache", "fetch"]).is_err());
    }

    #[test]
    fn test_parse_cleanup() {
        let cli = Cli::try_parse_from(["mediacache", "cleanup", "-c", "mediacache.yml"]).unwrap();
        assert!(matches!(cli.command, Command::Cleanup));
        assert_eq!(cli.config, Some(PathBuf::from("mediacache.yml")));
    }

    #[test]
    fn test_output_name() {
        let key = ResourceKey::new("https://cdn.example.com/v/clip.mp4?token=abc", None);
        assert_eq!(output_name(&key), "clip.mp4");

        let key = ResourceKey::new("/srv/media/clip.mp4", Some("thumb"));
        assert_eq!(output_name(&key), "thumb-clip.mp4");

        let key = ResourceKey::new("https://cdn.example.com/", None);
        assert_eq!(output_name(&key), key.cache_id());
    }

    #[test]
    fn test_output_names_disambiguate() {
        let first = ResourceKey::new("https://a.example.com/clip.mp4", None);
        let second = ResourceKey::new("https://b.example.com/v/clip.mp4?t=1", None);
        let other = ResourceKey::new("https://a.example.com/other.mp4", None);
        let keys = [first.clone(), second.clone(), other, first.clone()];

        let names = output_names(&keys);

        assert_eq!(names[0], format!("clip-{}.mp4", &first.cache_id()[..12]));
        assert_eq!(names[1], format!("clip-{}.mp4", &second.cache_id()[..12]));
        assert_eq!(names[2], "other.mp4");
        // the same resource twice keeps one name
        assert_eq!(names[3], names[0]);

        let key = ResourceKey::new("/srv/media/README", None);
        assert_eq!(
            with_cache_id("README", &key),
            format!("README-{}", &key.cache_id()[..12])
        );
    }

    #[tokio::test]
    async fn test_fetch_all() {
        mediacache_test::setup();
        let server = mediacache_test::Server::new();
        let work_dir = mediacache_test::tempdir();
        let output = mediacache_test::tempdir();

        let config = Config {
            work_dir: work_dir.path().to_owned(),
            ..Default::default()
        };
        let registry = create_registry(&config, Handle::current()).unwrap();

        let args = FetchArgs {
            locators: vec![
                server.url("/media/clip.mp4").to_string(),
                server.url("/respond_statuscode/404/gone.mp4").to_string(),
            ],
            discriminator: None,
            output: output.path().to_owned(),
        };
        let results = fetch_all(&registry, &args).await;

        let target = results[0].1.as_ref().unwrap();
        assert_eq!(target, &output.path().join("clip.mp4"));
        assert_eq!(
            std::fs::read_to_string(target).unwrap(),
            mediacache_test::media_body("clip.mp4")
        );
        assert!(results[1].1.is_err());

        // Both entries were released and stay resident.
        assert_eq!(registry.cache_count(), 2);
        for (locator, _) in &results {
            let entry = registry.peek_cache(&ResourceKey::new(locator.as_str(), None));
            let entry = entry.unwrap();
            assert_eq!(entry.ref_count(), 1);
            entry.release();
        }
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_fetch_all_same_file_names() {
        mediacache_test::setup();
        let server = mediacache_test::Server::new();
        let work_dir = mediacache_test::tempdir();
        let output = mediacache_test::tempdir();

        let config = Config {
            work_dir: work_dir.path().to_owned(),
            ..Default::default()
        };
        let registry = create_registry(&config, Handle::current()).unwrap();

        let args = FetchArgs {
            locators: vec![
                server.url("/media/a/clip.mp4").to_string(),
                server.url("/media/b/clip.mp4").to_string(),
            ],
            discriminator: None,
            output: output.path().to_owned(),
        };
        let results = fetch_all(&registry, &args).await;

        let first = results[0].1.as_ref().unwrap();
        let second = results[1].1.as_ref().unwrap();
        assert_ne!(first, second);
        assert_eq!(
            std::fs::read_to_string(first).unwrap(),
            mediacache_test::media_body("a/clip.mp4")
        );
        assert_eq!(
            std::fs::read_to_string(second).unwrap(),
            mediacache_test::media_body("b/clip.mp4")
        );
        assert_eq!(std::fs::read_dir(output.path()).unwrap().count(), 2);
        registry.shutdown();
    }
}
