//! End-to-end transfers over loopback UDP: a real sender task feeding a
//! real receiver loop, asserting the materialized tree.

use std::path::Path;
use std::time::Duration;

use godiode::auth::AuthKey;
use godiode::transfer::{Receiver, ReceiverOptions, Sender, SenderOptions};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::net::UdpSocket;

const SECRET: &str = "k";

fn sender_opts(max_packet_size: usize, resend_count: u32) -> SenderOptions {
    SenderOptions {
        max_packet_size,
        bw: 0,
        resend_count,
        resend_manifest: false,
        chunk_delay: Duration::from_millis(1),
        file_delay: Duration::from_millis(1),
    }
}

fn receiver_opts(root: &Path, delete: bool, max_packet_size: usize) -> ReceiverOptions {
    ReceiverOptions {
        root: root.to_path_buf(),
        tmp_dir: root.join(".tmp"),
        delete,
        file_permission: 0o600,
        folder_permission: 0o700,
        max_packet_size,
    }
}

async fn wait_for(path: &Path) {
    for _ in 0..250 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never appeared", path.display());
}

fn mtime_secs(path: &Path) -> i64 {
    let meta = std::fs::metadata(path).unwrap();
    filetime::FileTime::from_last_modification_time(&meta).unix_seconds()
}

#[tokio::test]
async fn tree_transfer_with_delete_mode() {
    let src = TempDir::new().unwrap();
    std::fs::create_dir_all(src.path().join("a/b")).unwrap();
    std::fs::write(src.path().join("a/b/empty"), b"").unwrap();
    std::fs::write(src.path().join("a/b/hello.txt"), b"hello\nworld").unwrap();
    let blob: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
    std::fs::write(src.path().join("top.bin"), &blob).unwrap();

    let dst = TempDir::new().unwrap();
    std::fs::write(dst.path().join("x.old"), b"stale").unwrap();
    std::fs::create_dir(dst.path().join("stale-dir")).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = socket.local_addr().unwrap().to_string();
    let key = AuthKey::derive(SECRET);

    let opts = receiver_opts(dst.path(), true, 512);
    let recv_key = key.clone();
    let receive_task = tokio::spawn(async move { Receiver::serve(socket, opts, recv_key).await });

    let mut sender = Sender::connect(&target, "", sender_opts(512, 1), key)
        .await
        .unwrap();
    sender.run(src.path()).await.unwrap();

    let hello = dst.path().join("a/b/hello.txt");
    let empty = dst.path().join("a/b/empty");
    let top = dst.path().join("top.bin");
    wait_for(&hello).await;
    wait_for(&empty).await;
    wait_for(&top).await;

    assert_eq!(std::fs::read(&hello).unwrap(), b"hello\nworld");
    assert_eq!(std::fs::metadata(&empty).unwrap().len(), 0);
    assert_eq!(std::fs::read(&top).unwrap(), blob);

    // known digest of the 11-byte payload
    let digest: [u8; 32] = Sha256::digest(b"hello\nworld").into();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    assert_eq!(
        hex,
        "185f8db32271fe25f561a6fc938b2e264306ec304eda518007d1764826381969"
    );

    // mtimes restored from the manifest
    assert_eq!(mtime_secs(&hello), mtime_secs(&src.path().join("a/b/hello.txt")));
    assert_eq!(mtime_secs(&top), mtime_secs(&src.path().join("top.bin")));

    // delete mode removed everything the manifest does not name
    assert!(!dst.path().join("x.old").exists());
    assert!(!dst.path().join("stale-dir").exists());
    assert!(dst.path().join(".tmp").is_dir());

    // directories exist with their recorded mtimes
    assert!(dst.path().join("a/b").is_dir());

    receive_task.abort();
}

#[tokio::test]
async fn resend_rounds_are_idempotent() {
    let src = TempDir::new().unwrap();
    std::fs::write(src.path().join("only.txt"), b"same content every round").unwrap();

    let dst = TempDir::new().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = socket.local_addr().unwrap().to_string();
    let key = AuthKey::derive(SECRET);

    let opts = receiver_opts(dst.path(), false, 1472);
    let recv_key = key.clone();
    let receive_task = tokio::spawn(async move { Receiver::serve(socket, opts, recv_key).await });

    let mut sender = Sender::connect(&target, "", sender_opts(1472, 2), key)
        .await
        .unwrap();
    sender.run(src.path()).await.unwrap();

    let out = dst.path().join("only.txt");
    wait_for(&out).await;
    // give the second round's promotion time to land as well
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(std::fs::read(&out).unwrap(), b"same content every round");

    receive_task.abort();
}

#[tokio::test]
async fn single_file_source() {
    let src = TempDir::new().unwrap();
    let file = src.path().join("solo.dat");
    std::fs::write(&file, b"just one file").unwrap();

    let dst = TempDir::new().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = socket.local_addr().unwrap().to_string();
    let key = AuthKey::derive(SECRET);

    let opts = receiver_opts(dst.path(), false, 1472);
    let recv_key = key.clone();
    let receive_task = tokio::spawn(async move { Receiver::serve(socket, opts, recv_key).await });

    let mut sender = Sender::connect(&target, "", sender_opts(1472, 1), key)
        .await
        .unwrap();
    sender.run(&file).await.unwrap();

    let out = dst.path().join("solo.dat");
    wait_for(&out).await;
    assert_eq!(std::fs::read(&out).unwrap(), b"just one file");

    receive_task.abort();
}
