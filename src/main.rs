use asset_variants::cache::VariantCache;
use asset_variants::codec::{Codec, RustCodec};
use asset_variants::config::{self, PipelineConfig};
use asset_variants::derive::{self, DeriveEvent, DeriveOptions};
use asset_variants::options::ProfileKind;
use asset_variants::output;
use asset_variants::pipeline::AssetPipeline;
use asset_variants::store::FsStore;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config file read when `--config` is not given. Missing is fine.
const DEFAULT_CONFIG: &str = "asset-variants.toml";

/// Shared flags for commands that derive variants.
#[derive(clap::Args, Clone)]
struct CacheArgs {
    /// Disable the variant cache: re-derive every asset
    #[arg(long)]
    no_cache: bool,
}

#[derive(Parser)]
#[command(name = "asset-variants")]
#[command(about = "Derive preview, medium and profile variants from images")]
#[command(long_about = "\
Derive preview, medium and profile variants from images

Every input image becomes one asset with a fixed family of variants:

  preview        tiny lossy thumbnail (inlined as base64 when < 2 KiB)
  medium         ~1448px rendition, at most 310 KiB
  smallProfile   280px square, only with --self-profile

Decodes are gated by a shared memory budget so large images queue instead
of piling up. Results are written to <store>/manifest.json; variant files
live under <store>/cache/<asset>/<tag>/.

Run 'asset-variants gen-config' to generate a documented config file.")]
#[command(version)]
struct Cli {
    /// Config file [default: asset-variants.toml if present]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Derive variants for image files or directories
    Derive {
        /// Image files or directories (searched recursively)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Use the profile-picture profile (smallProfile + medium)
        #[arg(long)]
        self_profile: bool,

        /// Namespace recorded on every asset
        #[arg(long, default_value = "default")]
        namespace: String,

        /// Store directory for variants, manifest and cache
        #[arg(long, default_value = "variants")]
        store: PathBuf,

        /// Show pipeline stages as they happen
        #[arg(long, short)]
        verbose: bool,

        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Show an image's metadata and the planned variant sizes
    Inspect {
        file: PathBuf,

        /// Plan the profile-picture profile
        #[arg(long)]
        self_profile: bool,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Derive {
            inputs,
            self_profile,
            namespace,
            store,
            verbose,
            cache,
        } => {
            let config = load_config(cli.config.as_deref())?;
            init_thread_pool(&config.processing);
            let options = DeriveOptions {
                profile: ProfileKind::from_self_flag(self_profile),
                namespace_id: namespace,
                concurrency: config::effective_concurrency(&config.processing),
            };
            build_runtime()?.block_on(run_derive(
                config,
                &inputs,
                &store,
                options,
                !cache.no_cache,
                verbose,
            ))?;
        }
        Command::Inspect { file, self_profile } => {
            let config = load_config(cli.config.as_deref())?;
            let bytes = std::fs::read(&file)?;
            let codec = RustCodec::new();
            let metadata = build_runtime()?.block_on(codec.identify(&bytes))?;
            let profile = ProfileKind::from_self_flag(self_profile);
            output::print_inspect(
                &file.display().to_string(),
                &metadata,
                config.profiles.options_for(profile),
                codec.native_subsample(metadata.mime),
            );
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

async fn run_derive(
    config: PipelineConfig,
    inputs: &[PathBuf],
    store_root: &Path,
    options: DeriveOptions,
    use_cache: bool,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let files = derive::collect_inputs(inputs)?;
    let store = FsStore::new(store_root);
    let pipeline = AssetPipeline::new(
        RustCodec::new(),
        store.clone(),
        Arc::new(config.memory_budget()),
    )
    .with_settings(config.encoder_settings())
    .with_profiles(config.profiles.clone());

    let mut cache = if use_cache {
        VariantCache::load(store_root)
    } else {
        VariantCache::empty()
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let lines = match &event {
                DeriveEvent::Pipeline(e) if verbose => output::format_pipeline_event(e),
                other => output::format_derive_event(other),
            };
            for line in lines {
                println!("{}", line);
            }
        }
    });

    println!(
        "==> Deriving {} image{} ({} profile) into {}",
        files.len(),
        if files.len() == 1 { "" } else { "s" },
        options.profile.as_str(),
        store_root.display()
    );

    let result = {
        let run = derive::derive(
            &pipeline,
            &files,
            &options,
            &mut cache,
            |handle| store.contains(handle),
            Some(&tx),
        );
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result?,
            _ = tokio::signal::ctrl_c() => {
                return Err("interrupted, no manifest written".into());
            }
        }
    };
    drop(tx);
    printer.await?;

    let manifest_path = derive::write_manifest(store_root, &result.manifest)?;
    cache.save(store_root)?;
    println!("Cache: {}", result.cache_stats);
    println!("==> Manifest: {}", manifest_path.display());

    let failed = result.manifest.failures.len();
    if failed > 0 {
        return Err(format!("{failed} of {} assets failed", files.len()).into());
    }
    Ok(())
}

/// Load the explicit config file (must exist) or the optional default one.
fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(p) if !p.exists() => Err(format!("config file not found: {}", p.display()).into()),
        Some(p) => Ok(config::load_config(p)?),
        None => Ok(config::load_config(Path::new(DEFAULT_CONFIG))?),
    }
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores: user can constrain down, not up.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}
