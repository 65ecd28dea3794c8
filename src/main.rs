use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use aether_sync::config::{RemoteConfig, WorkerConfig};
use aether_sync::crypto::PasswordSecret;
use aether_sync::identity::{IdentityContext, IdentityFile};
use aether_sync::remote::{BlobStore, DirectoryStore, S3Store, Session};
use aether_sync::worker::{Worker, WorkerContext, WorkerResponse};

const ENV_PASSPHRASE: &str = "AETHER_SYNC_PASSPHRASE";

#[derive(Parser)]
#[command(name = "aether-sync-worker")]
#[command(about = "Background worker keeping the encrypted index cache in sync (JSON lines on stdin/stdout)")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Create a new identity for this user name before starting
    #[arg(long, value_name = "USER_NAME")]
    create_identity: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout porte le protocole ; les logs partent sur stderr.
    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config = WorkerConfig::load(cli.config.as_deref()).context("loading config")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let identity = open_identity(&config, cli.create_identity.as_deref())?;

    match &config.remote {
        RemoteConfig::Directory { root } => {
            info!("Using directory hub at {}", root.display());
            run_worker(DirectoryStore::new(root), identity, &config).await
        }
        RemoteConfig::S3(s3) => {
            info!("Using S3 hub {} ({})", s3.bucket_name, s3.endpoint);
            let store = S3Store::new(s3.clone()).await.context("connecting to S3 hub")?;
            run_worker(store, identity, &config).await
        }
    }
}

/// Identité déverrouillée, ou `None` si aucune phrase de passe n'est fournie.
fn open_identity(config: &WorkerConfig, create_for: Option<&str>) -> Result<Option<IdentityContext>> {
    let Ok(passphrase) = std::env::var(ENV_PASSPHRASE) else {
        warn!("{} not set, starting without a signed-in session", ENV_PASSPHRASE);
        return Ok(None);
    };
    let password = PasswordSecret::new(passphrase);

    if let Some(user_name) = create_for {
        let (identity, file) = IdentityContext::create(user_name, &password)?;
        file.save(&config.identity_file)
            .with_context(|| format!("writing {}", config.identity_file.display()))?;
        info!("Created identity {} ({})", user_name, identity.public_key());
        return Ok(Some(identity));
    }

    if !config.identity_file.exists() {
        warn!(
            "No identity at {}, starting without a signed-in session",
            config.identity_file.display()
        );
        return Ok(None);
    }
    let file = IdentityFile::load(&config.identity_file)
        .with_context(|| format!("reading {}", config.identity_file.display()))?;
    let identity = IdentityContext::unlock(&file, &password).context("unlocking identity")?;
    info!("Signed in as {}", identity.user_name());
    Ok(Some(identity))
}

async fn run_worker<S: BlobStore + 'static>(
    store: S,
    identity: Option<IdentityContext>,
    config: &WorkerConfig,
) -> Result<()> {
    let session = identity.map(|identity| Session::new(store, identity));
    if let Some(session) = &session {
        if let Err(e) = session.publish_profile().await {
            warn!("Unable to publish profile: {}", e);
        }
    }

    let worker = Worker::new(WorkerContext::new(
        session,
        config.db_path(),
        config.file_types.clone(),
    ));

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<Value>();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<WorkerResponse>();

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    // Une ligne illisible reçoit la réponse `unknown`.
                    let message = serde_json::from_str(&line).unwrap_or_else(|e| {
                        warn!("Ignoring malformed message: {}", e);
                        Value::Null
                    });
                    if inbox_tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read error: {}", e);
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = outbox_rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    worker.run(inbox_rx, outbox_tx).await;
    reader.abort();
    writer.await.context("stdout writer task")??;
    info!("Worker stopped");
    Ok(())
}
