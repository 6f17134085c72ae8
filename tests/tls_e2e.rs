use anyhow::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ark::audit::{AuditSink, Decision, MemorySink};
use ark::config::ArkConfig;
use ark::net_async::{client, server, RemoteError};
use ark::tar_stream::TarConfig;
use ark::tls::{self, AuthorizedClients};
use ark::ErrorClass;

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

struct Server {
    _dir: tempfile::TempDir,
    root: PathBuf,
    sink: Arc<MemorySink>,
    port: u16,
    task: tokio::task::JoinHandle<()>,
}

/// Start arkd on an ephemeral port. `authorized` lines map client
/// certificate fingerprints to identities.
async fn start_server(authorized: &str) -> Result<Server> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("archive");
    std::fs::create_dir(&root)?;
    let manifest = dir.path().join("clients.toml");
    std::fs::write(
        &manifest,
        "[[client]]\nidentity = \"dobby\"\ndestination = \"hosts/dobby\"\n\n\
         [[client]]\nidentity = \"hokey\"\ndestination = \"hosts/hokey\"\nenabled = false\n",
    )?;
    let auth_path = dir.path().join("authorized_clients");
    std::fs::write(&auth_path, authorized)?;

    let cfg = ArkConfig::default().with_archive_root(&root).with_manifest(&manifest);
    let sink = Arc::new(MemorySink::default());
    let dispatcher = cfg.build_dispatcher(sink.clone() as Arc<dyn AuditSink>)?;
    let tls_config = tls::load_or_generate_server_config(
        &dir.path().join("server-cert.pem"),
        &dir.path().join("server-key.pem"),
    )?;
    let ctx = Arc::new(server::ServerContext::new(
        dispatcher,
        AuthorizedClients::load(&auth_path)?,
        Some(auth_path),
        cfg.stream_limits(),
        TarConfig::default(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let task = tokio::spawn(async move {
        let _ = server::serve_listener(listener, ctx, tls_config).await;
    });
    Ok(Server {
        root: root.canonicalize()?,
        _dir: dir,
        sink,
        port,
        task,
    })
}

/// Generate a client identity; returns (cert, key, fingerprint).
fn client_identity(dir: &Path, name: &str) -> Result<(PathBuf, PathBuf, String)> {
    let cert = dir.join(format!("{}-cert.pem", name));
    let key = dir.join(format!("{}-key.pem", name));
    tls::generate_if_missing(&cert, &key, name)?;
    let fp = tls::fingerprint_file(&cert)?;
    Ok((cert, key, fp))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_push_lands_in_registry_destination() -> Result<()> {
    let cli = tempfile::tempdir()?;
    let (cert, key, fp) = client_identity(cli.path(), "dobby")?;
    let srv = start_server(&format!("# fleet\n{}=dobby\n", fp)).await?;

    let etc = cli.path().join("etc");
    write_file(&etc.join("a.txt"), 8 * 1024)?;
    write_file(&etc.join("dir1/b.bin"), 256 * 1024)?;
    write_file(&etc.join("dir1/dir2/c.dat"), 1_100_000)?; // crosses a 1 MiB chunk

    let known = cli.path().join("known_hosts");
    let config = tls::build_client_config("127.0.0.1", srv.port, &cert, &key, &known)?;
    let outcome = client::push("127.0.0.1", srv.port, &[etc], config, &TarConfig::default()).await?;
    assert_eq!(outcome.files, 3);
    assert_eq!(outcome.bytes, 8 * 1024 + 256 * 1024 + 1_100_000);

    let dest = srv.root.join("hosts/dobby/etc");
    assert_eq!(std::fs::metadata(dest.join("a.txt"))?.len(), 8 * 1024);
    assert!(dest.join("dir1/b.bin").exists());
    assert_eq!(std::fs::metadata(dest.join("dir1/dir2/c.dat"))?.len(), 1_100_000);
    // The server was pinned on first use
    assert!(std::fs::read_to_string(&known)?.contains(&format!("127.0.0.1:{}=sha256:", srv.port)));

    let records = srv.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision, Decision::Accepted);

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_unmapped_certificate_is_rejected() -> Result<()> {
    let cli = tempfile::tempdir()?;
    let (cert, key, fp) = client_identity(cli.path(), "stranger")?;
    let srv = start_server("").await?;

    let src = cli.path().join("etc");
    write_file(&src.join("hosts"), 100)?;
    let config = tls::build_client_config("127.0.0.1", srv.port, &cert, &key, &cli.path().join("known_hosts"))?;
    let err = client::push("127.0.0.1", srv.port, &[src], config, &TarConfig::default())
        .await
        .unwrap_err();
    let remote = err.downcast_ref::<RemoteError>().expect("server answered with ERROR");
    assert_eq!(remote.class, ErrorClass::Rejected);
    assert_eq!(remote.message, "push rejected");

    assert!(!srv.root.join("hosts").exists());
    let records = srv.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identity, fp);
    assert_eq!(records[0].decision, Decision::Rejected);

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_disabled_client_gets_same_answer_as_unknown() -> Result<()> {
    let cli = tempfile::tempdir()?;
    let (cert, key, fp) = client_identity(cli.path(), "hokey")?;
    let srv = start_server(&format!("{}=hokey\n", fp)).await?;

    let src = cli.path().join("etc");
    write_file(&src.join("hosts"), 100)?;
    let config = tls::build_client_config("127.0.0.1", srv.port, &cert, &key, &cli.path().join("known_hosts"))?;
    let err = client::push("127.0.0.1", srv.port, &[src], config, &TarConfig::default())
        .await
        .unwrap_err();
    let remote = err.downcast_ref::<RemoteError>().expect("server answered with ERROR");
    assert_eq!(remote.class, ErrorClass::Rejected);
    assert_eq!(remote.message, "push rejected");
    assert!(!srv.root.join("hosts").exists());

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_changed_server_certificate_is_refused() -> Result<()> {
    let cli = tempfile::tempdir()?;
    let (cert, key, fp) = client_identity(cli.path(), "dobby")?;
    let srv = start_server(&format!("{}=dobby\n", fp)).await?;

    let src = cli.path().join("etc");
    write_file(&src.join("hosts"), 100)?;
    let known = cli.path().join("known_hosts");
    std::fs::write(
        &known,
        format!("127.0.0.1:{}=sha256:{}\n", srv.port, "0".repeat(64)),
    )?;
    let config = tls::build_client_config("127.0.0.1", srv.port, &cert, &key, &known)?;
    assert!(client::push("127.0.0.1", srv.port, &[src], config, &TarConfig::default())
        .await
        .is_err());
    assert!(srv.sink.records().is_empty());

    srv.task.abort();
    Ok(())
}
