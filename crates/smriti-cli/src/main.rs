use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use smriti_core::{MatchResult, PhotoId, Tenant};
use smriti_pipeline::{Collaborators, Pipeline, PipelineConfig};
use smriti_services::{FsStorage, MemoryRecognition, SqliteStore, TracingMailer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "smriti", about = "Smriti event photo operator CLI")]
struct Cli {
    /// TOML config file; SMRITI_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a guest passkey to its tenant
    Resolve {
        passkey: String,
    },
    /// Deactivate a tenant; its passkeys stop resolving
    Deactivate {
        tenant: i64,
    },
    /// List a tenant's photos and their index status
    Photos {
        #[arg(short, long)]
        tenant: i64,
    },
    /// Toggle the highlight flag of a photo
    Highlight {
        #[arg(short, long)]
        tenant: i64,
        /// Full storage key of the photo
        key: String,
    },
    /// Issue signed URLs for photos (all of the tenant's photos if none given)
    Grant {
        #[arg(short, long)]
        tenant: i64,
        #[arg(short, long = "photo")]
        photos: Vec<PhotoId>,
        /// Lifetime of the URLs; defaults to url_ttl_secs from the config
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Write photos into a zip archive (all of the tenant's photos if none given)
    Archive {
        #[arg(short, long)]
        tenant: i64,
        #[arg(short, long = "photo")]
        photos: Vec<PhotoId>,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::from_env(),
    };

    if let Commands::Config = cli.command {
        print!("{}", render_config(&config)?);
        return Ok(());
    }

    let pipeline = open_pipeline(config).await?;
    run(&pipeline, cli.command).await
}

async fn open_pipeline(config: PipelineConfig) -> Result<Pipeline> {
    if config.recognition_endpoint != "memory://" {
        bail!(
            "unsupported recognition endpoint {:?}; only memory:// is built in",
            config.recognition_endpoint
        );
    }
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = SqliteStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    tracing::debug!(db = %config.database_path.display(), storage = %config.storage_root.display(), "collaborators opened");

    let collab = Collaborators {
        storage: Arc::new(FsStorage::new(&config.storage_root, &config.signing_key)),
        recognition: Arc::new(MemoryRecognition::default()),
        store: Arc::new(store),
        mailer: Arc::new(TracingMailer),
    };
    Ok(Pipeline::new(collab, config))
}

async fn run(pipeline: &Pipeline, command: Commands) -> Result<()> {
    match command {
        Commands::Resolve { passkey } => {
            let tenant = pipeline.registry.resolve(&passkey).await?;
            println!("{}", serde_json::to_string_pretty(&redacted(tenant))?);
        }
        Commands::Deactivate { tenant } => {
            pipeline.registry.deactivate(tenant).await?;
            println!("tenant {tenant} deactivated");
        }
        Commands::Photos { tenant } => {
            let tenant = pipeline.registry.tenant(tenant).await?;
            for photo in pipeline.indexer.photos(&tenant).await? {
                let mark = if photo.is_highlight { "*" } else { " " };
                println!(
                    "{:>6} {mark} {:<8} {}",
                    photo.id,
                    photo.status.as_str(),
                    photo.storage_key
                );
            }
        }
        Commands::Highlight { tenant, key } => {
            let tenant = pipeline.registry.tenant(tenant).await?;
            let photo = pipeline.indexer.toggle_highlight(&tenant, &key).await?;
            let state = if photo.is_highlight { "on" } else { "off" };
            println!("highlight {state}: {}", photo.storage_key);
        }
        Commands::Grant {
            tenant,
            photos,
            ttl_secs,
        } => {
            let tenant = pipeline.registry.tenant(tenant).await?;
            let ttl = ttl_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| pipeline.config().url_ttl());
            let matches = selection(pipeline, &tenant, &photos).await?;
            let handles = pipeline.access.grant_access(&tenant, &matches, ttl).await?;
            println!("{}", serde_json::to_string_pretty(&handles)?);
        }
        Commands::Archive {
            tenant,
            photos,
            out,
        } => {
            let tenant = pipeline.registry.tenant(tenant).await?;
            write_archive(pipeline, &tenant, &photos, &out).await?;
        }
        Commands::Config => {
            print!("{}", render_config(pipeline.config())?);
        }
    }
    Ok(())
}

/// Rank the requested photos in the given order, or every photo of the
/// tenant in catalogue order.
async fn selection(
    pipeline: &Pipeline,
    tenant: &Tenant,
    photos: &[PhotoId],
) -> Result<Vec<MatchResult>> {
    let ids: Vec<PhotoId> = if photos.is_empty() {
        pipeline
            .indexer
            .photos(tenant)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect()
    } else {
        photos.to_vec()
    };
    let session = uuid::Uuid::new_v4();
    Ok(ids
        .into_iter()
        .enumerate()
        .map(|(i, photo_asset_id)| MatchResult {
            search_session_id: session,
            photo_asset_id,
            confidence: 100.0,
            rank: i + 1,
        })
        .collect())
}

async fn write_archive(
    pipeline: &Pipeline,
    tenant: &Tenant,
    photos: &[PhotoId],
    out: &Path,
) -> Result<()> {
    let matches = selection(pipeline, tenant, photos).await?;
    let handles = pipeline
        .access
        .grant_access(tenant, &matches, pipeline.config().url_ttl())
        .await?;
    let file = std::fs::File::create(out).with_context(|| format!("creating {}", out.display()))?;
    let (_, manifest) = pipeline.archive.build_archive(&handles, file).await?;

    println!(
        "{}: {} photos, {} failed",
        out.display(),
        manifest.entries.len(),
        manifest.failures.len()
    );
    for failure in &manifest.failures {
        println!("  failed {} ({}): {}", failure.photo_asset_id, failure.storage_key, failure.reason);
    }
    Ok(())
}

fn redacted(mut tenant: Tenant) -> Tenant {
    tenant.client_passkey = "<redacted>".to_string();
    tenant
}

fn render_config(config: &PipelineConfig) -> Result<String> {
    let mut shown = config.clone();
    shown.signing_key = "<redacted>".to_string();
    Ok(toml::to_string_pretty(&shown)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use smriti_services::{NewTenant, RelationalStore};

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_archive() {
        let cli = Cli::try_parse_from([
            "smriti", "archive", "-t", "3", "-p", "7", "-p", "9", "-o", "out.zip",
        ])
        .unwrap();
        match cli.command {
            Commands::Archive { tenant, photos, out } => {
                assert_eq!(tenant, 3);
                assert_eq!(photos, vec![7, 9]);
                assert_eq!(out, PathBuf::from("out.zip"));
            }
            _ => panic!("expected archive command"),
        }
    }

    #[test]
    fn test_config_output_hides_signing_key() {
        let config = PipelineConfig {
            signing_key: "super-secret".to_string(),
            ..PipelineConfig::default()
        };
        let text = render_config(&config).unwrap();
        assert!(!text.contains("super-secret"));
        assert!(text.contains("batch_size = 25"));
    }

    #[tokio::test]
    async fn test_unknown_recognition_backend_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            storage_root: dir.path().join("objects"),
            database_path: dir.path().join("smriti.db"),
            recognition_endpoint: "https://rekognition.example.com".to_string(),
            ..PipelineConfig::default()
        };
        let err = open_pipeline(config).await.err().unwrap();
        assert!(err.to_string().contains("unsupported recognition endpoint"));
        assert!(!dir.path().join("smriti.db").exists());
    }

    #[tokio::test]
    async fn test_archive_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            storage_root: dir.path().join("objects"),
            database_path: dir.path().join("db/smriti.db"),
            signing_key: "cli-test".to_string(),
            ..PipelineConfig::default()
        };
        let pipeline = open_pipeline(config.clone()).await.unwrap();
        let seed = SqliteStore::open(&config.database_path).await.unwrap();
        let tenant = seed
            .insert_tenant(NewTenant {
                email: "host@example.com".into(),
                passkey: "smriti_user_0a1b2c3d".into(),
                client_passkey: "smriti_client_0a1b2c3d".into(),
                storage_prefix: "Wedding_images/cli".into(),
                collection_id: "smriti-collection-cli".into(),
            })
            .await
            .unwrap();

        pipeline.indexer.upload(&tenant, "one.jpg", b"1".to_vec()).await.unwrap();
        pipeline.indexer.upload(&tenant, "two.png", b"22".to_vec()).await.unwrap();

        let out = dir.path().join("photos.zip");
        write_archive(&pipeline, &tenant, &[], &out).await.unwrap();

        let file = std::fs::File::open(&out).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<_> = archive.file_names().collect();
        names.sort_unstable();
        assert_eq!(names, ["manifest.json", "one.jpg", "two.png"]);
    }
}
