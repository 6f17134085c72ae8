use anyhow::Result;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use ark::audit::{AuditSink, Decision, MemorySink};
use ark::config::{ArkConfig, BackpressureMode};
use ark::dispatch::Dispatcher;
use ark::ssh::run_forced_command;
use ark::tar_stream::StreamLimits;
use ark::ErrorClass;

const MANIFEST: &str = r#"
[[client]]
identity = "dobby"
destination = "hosts/dobby"

[[client]]
identity = "hokey"
destination = "hosts/hokey"
enabled = false

[[client]]
identity = "kreacher"
destination = "hosts/kreacher"
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    cfg: ArkConfig,
    root: PathBuf,
    sink: Arc<MemorySink>,
    dispatcher: Arc<Dispatcher>,
    limits: StreamLimits,
}

impl Fixture {
    /// Another dispatcher over the same root and manifest, as a second
    /// `arkd forced-command` process would build it.
    fn second_process(&self) -> Result<Arc<Dispatcher>> {
        self.cfg.build_dispatcher(self.sink.clone() as Arc<dyn AuditSink>)
    }
}

fn fixture(mode: BackpressureMode) -> Result<Fixture> {
    fixture_with(mode, Duration::from_secs(5))
}

fn fixture_with(mode: BackpressureMode, idle: Duration) -> Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("archive");
    std::fs::create_dir(&root)?;
    let manifest = dir.path().join("clients.toml");
    std::fs::write(&manifest, MANIFEST)?;

    let cfg = ArkConfig::default()
        .with_archive_root(&root)
        .with_manifest(&manifest)
        .with_backpressure(mode, 2)
        .with_lock_wait(Duration::from_secs(10))
        .with_idle_timeout(idle);
    let sink = Arc::new(MemorySink::default());
    let dispatcher = cfg.build_dispatcher(sink.clone() as Arc<dyn AuditSink>)?;
    Ok(Fixture {
        root: root.canonicalize()?,
        limits: cfg.stream_limits(),
        cfg,
        _dir: dir,
        sink,
        dispatcher,
    })
}

fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn tree(dir: &Path) -> Vec<String> {
    let mut out: Vec<String> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .map(|e| {
            e.unwrap()
                .path()
                .strip_prefix(dir)
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    out.sort();
    out
}

/// Payload that only advances when the test feeds it; closing the sender
/// ends the stream.
struct GatedReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

fn gated() -> (mpsc::Sender<Vec<u8>>, GatedReader) {
    let (tx, rx) = mpsc::channel();
    (
        tx,
        GatedReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

impl Read for GatedReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

async fn wait_until_held(fx: &Fixture, dest: &Path) {
    for _ in 0..200u32 {
        if fx.dispatcher.executor().locks().is_held(dest) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("lock on {} never taken", dest.display());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dobby_ten_mib_push_is_accepted() -> Result<()> {
    let fx = fixture(BackpressureMode::Reject)?;
    let blob = vec![0xABu8; 10 * 1024 * 1024];
    let payload = tar_of(&[("data/blob.bin", blob.as_slice())]);

    let mut out = Vec::new();
    let outcome = run_forced_command(
        &fx.dispatcher,
        "dobby",
        Some("push-archive data"),
        Cursor::new(payload),
        fx.limits,
        &mut out,
    )
    .await?;
    assert_eq!(outcome, Ok(10_485_760));
    assert_eq!(String::from_utf8(out)?, "OK bytes=10485760\n");

    let dest = fx.root.join("hosts/dobby");
    assert_eq!(tree(&dest), vec!["data", "data/blob.bin"]);
    assert_eq!(std::fs::read(dest.join("data/blob.bin"))?, blob);
    // No staging leftovers next to the destination
    assert_eq!(tree(&fx.root.join("hosts")).iter().filter(|n| n.contains(".ark-")).count(), 0);

    let records = fx.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identity, "dobby");
    assert_eq!(records[0].decision, Decision::Accepted);
    assert_eq!(records[0].bytes, 10_485_760);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hokey_disabled_writes_nothing() -> Result<()> {
    let fx = fixture(BackpressureMode::Reject)?;
    let mut out = Vec::new();
    let outcome = run_forced_command(
        &fx.dispatcher,
        "hokey",
        Some("push-archive"),
        Cursor::new(tar_of(&[("etc/hosts", b"x")])),
        fx.limits,
        &mut out,
    )
    .await?;
    assert_eq!(outcome, Err(ErrorClass::Rejected));
    assert_eq!(String::from_utf8(out)?, "REJECTED push rejected\n");
    assert!(tree(&fx.root).is_empty());

    let records = fx.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision, Decision::Rejected);
    assert!(records[0].reason.contains("disabled"));
    assert_eq!(records[0].bytes, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_identity_is_rejected_like_disabled() -> Result<()> {
    let fx = fixture(BackpressureMode::Reject)?;
    let mut out = Vec::new();
    let outcome = run_forced_command(
        &fx.dispatcher,
        "ghost",
        Some("push-archive"),
        Cursor::new(tar_of(&[("etc/hosts", b"x")])),
        fx.limits,
        &mut out,
    )
    .await?;
    assert_eq!(outcome, Err(ErrorClass::Rejected));
    assert_eq!(String::from_utf8(out)?, "REJECTED push rejected\n");
    assert!(tree(&fx.root).is_empty());

    let records = fx.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identity, "ghost");
    assert!(records[0].reason.contains("unknown client"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_command_never_runs_other_commands() -> Result<()> {
    let fx = fixture(BackpressureMode::Reject)?;
    for requested in [None, Some("/bin/sh"), Some("push-archive; touch /tmp/pwned"), Some("scp -t /")] {
        let mut out = Vec::new();
        let outcome = run_forced_command(&fx.dispatcher, "dobby", requested, Cursor::new(Vec::new()), fx.limits, &mut out).await?;
        assert_eq!(outcome, Err(ErrorClass::Rejected), "{:?}", requested);
    }
    assert!(tree(&fx.root).is_empty());
    assert_eq!(fx.sink.records().len(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kreacher_race_second_push_is_busy() -> Result<()> {
    let fx = fixture(BackpressureMode::Reject)?;
    let dest = fx.root.join("hosts/kreacher");
    let payload = tar_of(&[("data/a", b"first")]);

    let (tx, reader) = gated();
    tx.send(payload[..512].to_vec())?;
    let d = fx.dispatcher.clone();
    let limits = fx.limits;
    let first = tokio::spawn(async move {
        let mut out = Vec::new();
        run_forced_command(&d, "kreacher", Some("push-archive data"), reader, limits, &mut out).await
    });
    wait_until_held(&fx, &dest).await;

    let mut out = Vec::new();
    let second = run_forced_command(
        &fx.dispatcher,
        "kreacher",
        Some("push-archive data"),
        Cursor::new(tar_of(&[("data/a", b"second")])),
        fx.limits,
        &mut out,
    )
    .await?;
    assert_eq!(second, Err(ErrorClass::Retryable));
    assert!(String::from_utf8(out)?.starts_with("RETRY "));

    tx.send(payload[512..].to_vec())?;
    drop(tx);
    assert_eq!(first.await??, Ok(5));
    assert_eq!(std::fs::read(dest.join("data/a"))?, b"first");

    let decisions: Vec<Decision> = fx.sink.records().iter().map(|r| r.decision).collect();
    assert_eq!(decisions, vec![Decision::Rejected, Decision::Accepted]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kreacher_race_is_serialized_in_queue_mode() -> Result<()> {
    let fx = fixture(BackpressureMode::Queue)?;
    let dest = fx.root.join("hosts/kreacher");
    let payload = tar_of(&[("data/a", b"one")]);

    let (tx, reader) = gated();
    tx.send(payload[..512].to_vec())?;
    let d1 = fx.dispatcher.clone();
    let limits = fx.limits;
    let first = tokio::spawn(async move {
        let mut out = Vec::new();
        run_forced_command(&d1, "kreacher", Some("push-archive data"), reader, limits, &mut out).await
    });
    wait_until_held(&fx, &dest).await;

    let d2 = fx.dispatcher.clone();
    let second = tokio::spawn(async move {
        let mut out = Vec::new();
        run_forced_command(
            &d2,
            "kreacher",
            Some("push-archive data"),
            Cursor::new(tar_of(&[("data/a", b"two")])),
            limits,
            &mut out,
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_finished());

    tx.send(payload[512..].to_vec())?;
    drop(tx);
    assert_eq!(first.await??, Ok(3));
    assert_eq!(second.await??, Ok(3));
    // The queued push ran after the first one was promoted
    assert_eq!(std::fs::read(dest.join("data/a"))?, b"two");
    assert!(fx
        .sink
        .records()
        .iter()
        .all(|r| r.decision == Decision::Accepted));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_push_leaves_previous_generation() -> Result<()> {
    let fx = fixture(BackpressureMode::Reject)?;
    let dest = fx.root.join("hosts/dobby");

    let mut out = Vec::new();
    let first = run_forced_command(
        &fx.dispatcher,
        "dobby",
        Some("push-archive etc"),
        Cursor::new(tar_of(&[("etc/hosts", b"generation one")])),
        fx.limits,
        &mut out,
    )
    .await?;
    assert!(first.is_ok());

    // Cut the second payload mid-file: the sender goes away without a trailer
    let payload = tar_of(&[("etc/hosts", &[7u8; 8192][..])]);
    let (tx, reader) = gated();
    tx.send(payload[..2048].to_vec())?;
    drop(tx);
    let mut out = Vec::new();
    let second = run_forced_command(&fx.dispatcher, "dobby", Some("push-archive etc"), reader, fx.limits, &mut out).await?;
    assert_eq!(second, Err(ErrorClass::Failed));
    assert!(String::from_utf8(out)?.starts_with("FAILED "));

    assert_eq!(std::fs::read(dest.join("etc/hosts"))?, b"generation one");
    let hosts = tree(&fx.root.join("hosts"));
    assert!(hosts.iter().any(|n| n.starts_with(".ark-quarantine-dobby-")));
    assert!(!hosts.iter().any(|n| n.starts_with(".ark-staging-")));
    assert!(!fx.dispatcher.executor().locks().is_held(&dest));

    let records = fx.sink.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].decision, Decision::Failed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_push_times_out_and_releases_lock() -> Result<()> {
    let fx = fixture_with(BackpressureMode::Reject, Duration::from_millis(100))?;
    let dest = fx.root.join("hosts/dobby");

    // The client keeps its session open but never sends a byte
    let (tx, reader) = gated();
    let mut out = Vec::new();
    let outcome = run_forced_command(&fx.dispatcher, "dobby", Some("push-archive"), reader, fx.limits, &mut out).await?;
    assert_eq!(outcome, Err(ErrorClass::Retryable));
    assert!(String::from_utf8(out)?.starts_with("RETRY "));
    drop(tx);

    assert!(!dest.exists());
    assert!(!fx.dispatcher.executor().locks().is_held(&dest));
    let records = fx.sink.records();
    assert_eq!(records[0].decision, Decision::Failed);
    assert!(records[0].reason.starts_with("timeout: "));

    // Nothing, not even another process, is left waiting on the stalled push
    let other = fx.second_process()?;
    let mut out = Vec::new();
    let retry = run_forced_command(
        &other,
        "dobby",
        Some("push-archive etc"),
        Cursor::new(tar_of(&[("etc/hosts", b"ok")])),
        fx.limits,
        &mut out,
    )
    .await?;
    assert_eq!(retry, Ok(2));
    Ok(())
}

/// Wait until a push for `name` is writing its staging directory, which
/// happens only after every lock on the destination is held.
async fn wait_for_staging(fx: &Fixture, name: &str) {
    let prefix = format!(".ark-staging-{}-", name);
    for _ in 0..200u32 {
        if let Ok(entries) = std::fs::read_dir(fx.root.join("hosts")) {
            if entries
                .flatten()
                .any(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no staging directory for {}", name);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kreacher_race_across_processes_second_push_is_busy() -> Result<()> {
    let fx = fixture(BackpressureMode::Reject)?;
    let other = fx.second_process()?;
    let dest = fx.root.join("hosts/kreacher");
    let payload = tar_of(&[("data/a", b"first")]);

    let (tx, reader) = gated();
    tx.send(payload[..512].to_vec())?;
    let d = fx.dispatcher.clone();
    let limits = fx.limits;
    let first = tokio::spawn(async move {
        let mut out = Vec::new();
        run_forced_command(&d, "kreacher", Some("push-archive data"), reader, limits, &mut out).await
    });
    wait_for_staging(&fx, "kreacher").await;

    let mut out = Vec::new();
    let second = run_forced_command(
        &other,
        "kreacher",
        Some("push-archive data"),
        Cursor::new(tar_of(&[("data/a", b"second")])),
        fx.limits,
        &mut out,
    )
    .await?;
    assert_eq!(second, Err(ErrorClass::Retryable));
    assert!(String::from_utf8(out)?.starts_with("RETRY "));

    tx.send(payload[512..].to_vec())?;
    drop(tx);
    assert_eq!(first.await??, Ok(5));
    assert_eq!(std::fs::read(dest.join("data/a"))?, b"first");

    let decisions: Vec<Decision> = fx.sink.records().iter().map(|r| r.decision).collect();
    assert_eq!(decisions, vec![Decision::Rejected, Decision::Accepted]);
    assert!(fx.sink.records()[0].reason.starts_with("busy: "));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kreacher_race_across_processes_is_serialized_in_queue_mode() -> Result<()> {
    let fx = fixture(BackpressureMode::Queue)?;
    let other = fx.second_process()?;
    let dest = fx.root.join("hosts/kreacher");
    let payload = tar_of(&[("data/a", b"one")]);

    let (tx, reader) = gated();
    tx.send(payload[..512].to_vec())?;
    let d = fx.dispatcher.clone();
    let limits = fx.limits;
    let first = tokio::spawn(async move {
        let mut out = Vec::new();
        run_forced_command(&d, "kreacher", Some("push-archive data"), reader, limits, &mut out).await
    });
    wait_for_staging(&fx, "kreacher").await;

    let second = tokio::spawn(async move {
        let mut out = Vec::new();
        run_forced_command(
            &other,
            "kreacher",
            Some("push-archive data"),
            Cursor::new(tar_of(&[("data/a", b"two")])),
            limits,
            &mut out,
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!second.is_finished());

    tx.send(payload[512..].to_vec())?;
    drop(tx);
    assert_eq!(first.await??, Ok(3));
    assert_eq!(second.await??, Ok(3));
    assert_eq!(std::fs::read(dest.join("data/a"))?, b"two");
    Ok(())
}
