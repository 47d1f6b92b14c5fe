//! Uploads one local file to a chunkup server.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use chunkup_uploader::{
    ChunkedUploader, DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, UploadError, UploadEvent,
    UploadOptions, WsClient,
};

#[derive(Parser)]
#[command(name = "chunkup-upload", version, about = "Upload a file in chunks")]
struct Cli {
    /// Server URL, e.g. ws://127.0.0.1:8081
    url: String,

    /// File to upload.
    file: PathBuf,

    /// Bytes per chunk.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Chunks in flight at once.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Destination path on the server, relative to its storage root.
    #[arg(long)]
    target: Option<String>,

    /// Do not declare the size; append chunks in order instead.
    #[arg(long)]
    no_size: bool,

    /// Ask the server to hash each chunk and compare.
    #[arg(long)]
    chunk_hash: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let file = tokio::fs::File::open(&cli.file).await?;
    let total_size = file.metadata().await?.len();

    let client = WsClient::connect(&cli.url).await?;
    let mut uploader = ChunkedUploader::new(Arc::new(client));

    // Progress reporting.
    if let Some(mut events) = uploader.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    UploadEvent::Created { upload_id, total_bytes } => {
                        tracing::info!(%upload_id, total_bytes, "upload started");
                    }
                    UploadEvent::ChunkSent { range, sent_bytes, total_bytes, .. } => {
                        tracing::debug!(%range, sent_bytes, total_bytes, "chunk sent");
                    }
                    UploadEvent::Finishing { upload_id } => {
                        tracing::info!(%upload_id, "verifying");
                    }
                    UploadEvent::Completed { .. } | UploadEvent::Failed { .. } => break,
                }
            }
        });
    }

    let cancel = uploader.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let options = UploadOptions {
        chunk_size: cli.chunk_size,
        concurrency: cli.concurrency,
        declare_size: !cli.no_size,
        target_path: cli.target,
        compute_chunk_hash: cli.chunk_hash,
    };

    let reader = tokio::io::BufReader::new(file);
    match uploader.upload(reader, total_size, &options).await {
        Ok(outcome) => {
            tracing::info!(
                upload_id = %outcome.upload_id,
                path = %outcome.path,
                checksum = %outcome.checksum,
                bytes = outcome.bytes,
                "upload complete"
            );
            println!("{}", outcome.path);
            Ok(())
        }
        Err(UploadError::ChunkFailed { upload_id, range, source }) => {
            anyhow::bail!("upload {upload_id} failed at bytes {range}: {source}")
        }
        Err(e) => Err(e.into()),
    }
}
