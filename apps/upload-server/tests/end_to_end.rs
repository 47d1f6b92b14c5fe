use std::path::Path;
use std::sync::Arc;

use chunkup_protocol::constants::MessageType;
use chunkup_protocol::messages::{GetUploadRequest, RenameUploadRequest};
use chunkup_protocol::types::{UploadInfo, UploadState};
use chunkup_server_app::{Config, Running, start};
use chunkup_uploader::{ChunkedUploader, UploadError, UploadOptions, WsClient};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const MIB: usize = 1024 * 1024;

fn source(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(131) >> 3) as u8).collect()
}

async fn start_server(root: &Path) -> Running {
    let config = Config {
        port: 0,
        storage_root: root.to_path_buf(),
        ..Config::default()
    };
    start(&config).await.unwrap()
}

async fn connect(running: &Running) -> Arc<WsClient> {
    let url = format!("ws://127.0.0.1:{}", running.port);
    Arc::new(WsClient::connect(&url).await.unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_mebibytes_in_one_mebibyte_chunks() {
    let dir = TempDir::new().unwrap();
    let running = start_server(dir.path()).await;
    let client = connect(&running).await;
    let uploader = ChunkedUploader::new(client);

    let data = source(10 * MIB);
    let opts = UploadOptions {
        chunk_size: MIB,
        concurrency: 4,
        target_path: Some("media/big.bin".into()),
        ..UploadOptions::default()
    };
    let outcome = uploader.upload(&data[..], data.len() as u64, &opts).await.unwrap();

    assert_eq!(outcome.path, "media/big.bin");
    assert_eq!(outcome.checksum, hex::encode(Sha256::digest(&data)));
    let stored = std::fs::read(dir.path().join("media/big.bin")).unwrap();
    assert_eq!(stored.len(), 10 * MIB);
    assert!(stored == data);
    assert!(!dir.path().join(".pending").join(&outcome.upload_id).exists());

    running.shutdown().await;
}

#[tokio::test]
async fn append_mode_upload() {
    let dir = TempDir::new().unwrap();
    let running = start_server(dir.path()).await;
    let uploader = ChunkedUploader::new(connect(&running).await);

    let data = source(300_000);
    let opts = UploadOptions {
        chunk_size: 64 * 1024,
        declare_size: false,
        target_path: Some("streamed.bin".into()),
        ..UploadOptions::default()
    };
    uploader.upload(&data[..], data.len() as u64, &opts).await.unwrap();
    assert_eq!(std::fs::read(dir.path().join("streamed.bin")).unwrap(), data);

    running.shutdown().await;
}

#[tokio::test]
async fn finish_without_target_then_rename() {
    let dir = TempDir::new().unwrap();
    let running = start_server(dir.path()).await;
    let client = connect(&running).await;
    let uploader = ChunkedUploader::new(client.clone());

    let data = source(100_000);
    let outcome = uploader
        .upload(&data[..], data.len() as u64, &UploadOptions::default())
        .await
        .unwrap();
    assert!(outcome.path.starts_with(".pending"));
    assert_eq!(std::fs::read(dir.path().join(&outcome.path)).unwrap(), data);

    let info = client
        .send_request(
            MessageType::GetUpload,
            Some(&GetUploadRequest {
                upload_id: outcome.upload_id.clone(),
            }),
        )
        .await
        .unwrap();
    let info: UploadInfo = info.parse_payload().unwrap().unwrap();
    assert_eq!(info.state, UploadState::Completed);
    assert_eq!(info.current_size, 100_000);

    client
        .send_request(
            MessageType::RenameUpload,
            Some(&RenameUploadRequest {
                upload_id: outcome.upload_id.clone(),
                path: "docs/final.bin".into(),
            }),
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(dir.path().join("docs/final.bin")).unwrap(), data);
    assert!(!dir.path().join(&outcome.path).exists());

    running.shutdown().await;
}

#[tokio::test]
async fn wrong_checksum_is_rejected_and_discarded() {
    let dir = TempDir::new().unwrap();
    let running = start_server(dir.path()).await;
    let uploader = ChunkedUploader::new(connect(&running).await);

    let upload_id = uploader.create(4, true).await.unwrap();
    uploader
        .retry_range(
            &upload_id,
            chunkup_uploader::ChunkRange { offset: 0, len: 4 },
            b"abcd",
        )
        .await
        .unwrap();

    let wrong = hex::encode(Sha256::digest(b"abce"));
    let err = uploader
        .finish(&upload_id, &wrong, Some("x.bin".into()))
        .await
        .unwrap_err();
    assert_eq!(err.server_code(), Some(422));
    assert!(!dir.path().join("x.bin").exists());
    assert!(!dir.path().join(".pending").join(&upload_id).exists());

    running.shutdown().await;
}

#[tokio::test]
async fn write_past_declared_size_fails_with_range() {
    let dir = TempDir::new().unwrap();
    let running = start_server(dir.path()).await;
    let uploader = ChunkedUploader::new(connect(&running).await);

    let upload_id = uploader.create(10, true).await.unwrap();
    let err = uploader
        .retry_range(
            &upload_id,
            chunkup_uploader::ChunkRange { offset: 8, len: 4 },
            b"wxyz",
        )
        .await
        .unwrap_err();
    assert_eq!(err.server_code(), Some(416));

    running.shutdown().await;
}

#[tokio::test]
async fn unknown_upload_is_not_found() {
    let dir = TempDir::new().unwrap();
    let running = start_server(dir.path()).await;
    let uploader = ChunkedUploader::new(connect(&running).await);

    let err = uploader
        .finish("no-such-upload", &hex::encode(Sha256::digest(b"")), None)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Server { code: 404, .. }));

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_clients_upload_at_once() {
    let dir = TempDir::new().unwrap();
    let running = start_server(dir.path()).await;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..4 {
        let client = connect(&running).await;
        tasks.spawn(async move {
            let data = source(200_000 + i * 1_000);
            let opts = UploadOptions {
                chunk_size: 16 * 1024,
                target_path: Some(format!("client-{i}.bin")),
                ..UploadOptions::default()
            };
            let outcome = ChunkedUploader::new(client)
                .upload(&data[..], data.len() as u64, &opts)
                .await
                .unwrap();
            (outcome.path, data)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (path, data) = joined.unwrap();
        assert_eq!(std::fs::read(dir.path().join(path)).unwrap(), data);
    }

    running.shutdown().await;
}

#[tokio::test]
async fn sessions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let data = source(50_000);

    let running = start_server(dir.path()).await;
    let uploader = ChunkedUploader::new(connect(&running).await);
    let upload_id = uploader.create(data.len() as u64, true).await.unwrap();
    uploader
        .retry_range(
            &upload_id,
            chunkup_uploader::ChunkRange { offset: 0, len: 25_000 },
            &data[..25_000],
        )
        .await
        .unwrap();
    drop(uploader);
    running.shutdown().await;

    let running = start_server(dir.path()).await;
    let uploader = ChunkedUploader::new(connect(&running).await);
    uploader
        .retry_range(
            &upload_id,
            chunkup_uploader::ChunkRange { offset: 25_000, len: 25_000 },
            &data[25_000..],
        )
        .await
        .unwrap();
    let path = uploader
        .finish(&upload_id, &hex::encode(Sha256::digest(&data)), Some("resumed.bin".into()))
        .await
        .unwrap();
    assert_eq!(std::fs::read(dir.path().join(path)).unwrap(), data);

    running.shutdown().await;
}

#[tokio::test]
async fn negative_offset_is_a_bad_request() {
    let dir = TempDir::new().unwrap();
    let running = start_server(dir.path()).await;
    let client = connect(&running).await;
    let upload_id = ChunkedUploader::new(client.clone())
        .create(16, true)
        .await
        .unwrap();

    let header = chunkup_protocol::ChunkHeader {
        id: String::new(),
        upload_id,
        offset: Some(-5),
        compute_hash: false,
    };
    let err = client.send_binary(header, b"data").await.unwrap_err();
    assert!(matches!(err, chunkup_uploader::WsError::Server { code: 400, .. }));

    running.shutdown().await;
}
