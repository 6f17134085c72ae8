//! Tar payload streaming between async transports and blocking tar I/O
//!
//! The server side turns received TAR_DATA frames into a blocking `Read`
//! for the executor; the client side packs sources on a blocking thread and
//! hands chunks to the async sender.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tar::Builder;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Configuration for tar streaming
#[derive(Debug, Clone)]
pub struct TarConfig {
    /// Buffer size for channel (number of chunks)
    pub channel_buffer: usize,
    /// Size of each chunk in bytes
    pub chunk_size: usize,
}

impl Default for TarConfig {
    fn default() -> Self {
        TarConfig {
            channel_buffer: 16,      // 16 chunks in flight
            chunk_size: 1024 * 1024, // 1MB chunks
        }
    }
}

/// One unit on the payload channel. `End` is the only clean terminator:
/// a channel that closes without it means the connection went away.
#[derive(Debug)]
pub enum Chunk {
    Data(Vec<u8>),
    End,
}

/// Bounds applied while the executor waits for payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    /// Longest gap between two chunks.
    pub idle: Duration,
    /// Bound on the whole transfer.
    pub total: Duration,
}

/// Create the async-to-blocking payload bridge. Must be called inside a
/// Tokio runtime.
pub fn payload_channel(config: &TarConfig, limits: StreamLimits) -> (mpsc::Sender<Chunk>, ChannelReader) {
    let (tx, rx) = mpsc::channel(config.channel_buffer);
    (tx, ChannelReader::new(rx, Handle::current(), limits))
}

/// Blocking reader over the payload channel. Use only from a blocking
/// thread (`spawn_blocking`), never from inside an async task.
pub struct ChannelReader {
    rx: mpsc::Receiver<Chunk>,
    handle: Handle,
    buffer: Vec<u8>,
    buffer_pos: usize,
    idle: Duration,
    deadline: Instant,
    done: bool,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Chunk>, handle: Handle, limits: StreamLimits) -> Self {
        Self {
            rx,
            handle,
            buffer: Vec::new(),
            buffer_pos: 0,
            idle: limits.idle,
            deadline: Instant::now() + limits.total,
            done: false,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // If we have data in our buffer, use it first
            if self.buffer_pos < self.buffer.len() {
                let available = self.buffer.len() - self.buffer_pos;
                let to_copy = available.min(buf.len());
                buf[..to_copy].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + to_copy]);
                self.buffer_pos += to_copy;
                return Ok(to_copy);
            }
            if self.done {
                return Ok(0);
            }

            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "transfer deadline exceeded"));
            }
            let wait = self.idle.min(remaining);
            let rx = &mut self.rx;
            let next = self
                .handle
                .block_on(async move { tokio::time::timeout(wait, rx.recv()).await });
            match next {
                Ok(Some(Chunk::Data(chunk))) => {
                    self.buffer = chunk;
                    self.buffer_pos = 0;
                }
                Ok(Some(Chunk::End)) => {
                    self.done = true;
                }
                Ok(None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "payload stream closed before end of transfer",
                    ));
                }
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no payload data for {:?}", wait),
                    ));
                }
            }
        }
    }
}

/// Channel writer that sends fixed-size chunks through an mpsc channel
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
    buffer: Vec<u8>,
    chunk_size: usize,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<Vec<u8>>, chunk_size: usize) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
            self.tx
                .blocking_send(chunk)
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
        }
        Ok(())
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut remaining = buf;

        while !remaining.is_empty() {
            let available = self.chunk_size - self.buffer.len();
            let to_write = remaining.len().min(available);

            self.buffer.extend_from_slice(&remaining[..to_write]);
            written += to_write;
            remaining = &remaining[to_write..];

            if self.buffer.len() >= self.chunk_size {
                self.flush_buffer()?;
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

/// Top-level names a push announces as its source set.
pub fn source_names(sources: &[PathBuf]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(sources.len());
    for src in sources {
        let name = src
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("source {} has no usable file name", src.display()))?;
        if !seen.insert(name.to_string()) {
            bail!("two sources share the name {:?}", name);
        }
        names.push(name.to_string());
    }
    Ok(names)
}

/// Pack `sources` into a tar stream on a blocking thread. Each source lands
/// under its own file name. Returns the chunk receiver and a join handle
/// yielding `(file_count, total_bytes)`.
pub fn spawn_packer(
    sources: Vec<PathBuf>,
    config: &TarConfig,
) -> (mpsc::Receiver<Vec<u8>>, tokio::task::JoinHandle<Result<(u64, u64)>>) {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(config.channel_buffer);
    let chunk_size = config.chunk_size;
    let packer = tokio::task::spawn_blocking(move || -> Result<(u64, u64)> {
        let mut writer = ChannelWriter::new(tx, chunk_size);
        let counts = pack_sources(&sources, &mut writer)?;
        writer.flush()?;
        Ok(counts)
    });
    (rx, packer)
}

/// Write a tar archive of `sources` to `out`. Symlinks are archived as
/// links, never followed.
pub fn pack_sources<W: Write>(sources: &[PathBuf], out: W) -> Result<(u64, u64)> {
    let names = source_names(sources)?;
    let mut builder = Builder::new(out);
    builder.follow_symlinks(false);
    let mut file_count = 0u64;
    let mut total_bytes = 0u64;

    for (source, name) in sources.iter().zip(names.iter()) {
        for entry in WalkDir::new(source).follow_links(false) {
            let entry = entry.with_context(|| format!("walk {}", source.display()))?;
            let path = entry.path();
            let tar_path = match path.strip_prefix(source) {
                Ok(rel) if !rel.as_os_str().is_empty() => Path::new(name).join(rel),
                _ => PathBuf::from(name),
            };
            let ft = entry.file_type();
            if ft.is_dir() {
                builder.append_dir(&tar_path, path)?;
            } else if ft.is_file() || ft.is_symlink() {
                if ft.is_file() {
                    total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                    file_count += 1;
                }
                builder.append_path_with_name(path, &tar_path)?;
            }
            // Sockets, devices and FIFOs are not archived
        }
    }
    builder.finish()?;
    Ok((file_count, total_bytes))
}
