//! Shared protocol logic for the framed transport and path confinement
//!
//! Frame I/O is generic over any `AsyncRead`/`AsyncWrite` so the same code
//! serves both the TLS server and the client.

use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::protocol::{HEADER_LEN, MAGIC, MAX_FRAME_SIZE, VERSION};

/// Reduce `p` to a relative path made only of normal components.
///
/// Rejects:
/// 1. NUL bytes
/// 2. Parent (`..`), root, and prefix components
/// 3. Empty results (the path named nothing below the base)
/// 4. On Windows, ':' in components (ADS defense)
pub fn safe_relative(p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("path {:?} does not name anything below the base", p);
    }
    Ok(safe)
}

/// Join a safe relative path under `root` and verify the result is a strict
/// descendant of `root`, resolving symlinks on whatever prefix already
/// exists. `root` must already be canonical.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    let safe = safe_relative(p)?;
    let joined = root.join(&safe);

    // Canonicalize the longest existing ancestor, then re-append the rest
    let mut existing = joined.as_path();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = existing
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("failed to canonicalize {:?}: {}", existing, e))?;
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }

    if !is_strict_descendant(root, &resolved) {
        bail!("path {:?} escapes root {:?}", p, root);
    }
    Ok(resolved)
}

/// `child` is below `root` and not equal to it.
pub fn is_strict_descendant(root: &Path, child: &Path) -> bool {
    child != root && child.starts_with(root)
}

/// Validate frame payload size against MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!("frame payload too large: {} bytes (max: {})", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        bail!("invalid magic in frame header");
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        bail!("protocol version mismatch: got {}, expected {}", version, VERSION);
    }
    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    Ok((frame_type, payload_len))
}

pub async fn read_frame<S>(stream: &mut S) -> Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    stream.read_exact(&mut hdr).await?;
    let (typ, len) = parse_frame_header(&hdr)?;
    let len = len as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    Ok((typ, payload))
}

pub async fn read_frame_timed<S>(stream: &mut S, ms: u64) -> Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    match timeout(Duration::from_millis(ms), read_frame(stream)).await {
        Ok(res) => res,
        Err(_) => bail!("frame read timeout ({} ms)", ms),
    }
}

pub async fn write_frame<S>(stream: &mut S, t: u8, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    validate_frame_size(payload.len())?;
    let ms = crate::protocol::timeouts::write_deadline_ms(payload.len());
    let write = async {
        let hdr = build_frame_header(t, payload.len() as u32);
        stream.write_all(&hdr).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        stream.flush().await?;
        Ok::<(), std::io::Error>(())
    };
    match timeout(Duration::from_millis(ms), write).await {
        Ok(result) => Ok(result?),
        Err(_) => bail!("frame write timeout ({} ms)", ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_safe_relative_strips_cur_dir() {
        let p = safe_relative(Path::new("./hosts/./dobby")).unwrap();
        assert_eq!(p, PathBuf::from("hosts/dobby"));
    }

    #[test]
    fn test_safe_relative_rejects_escapes() {
        assert!(safe_relative(Path::new("../etc/passwd")).is_err());
        assert!(safe_relative(Path::new("hosts/../../etc")).is_err());
        assert!(safe_relative(Path::new("/etc/passwd")).is_err());
        assert!(safe_relative(Path::new("file\0.txt")).is_err());
        assert!(safe_relative(Path::new(".")).is_err());
        assert!(safe_relative(Path::new("")).is_err());
    }

    #[test]
    fn test_normalize_under_root_new_path() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();

        let result = normalize_under_root(&root, Path::new("hosts/dobby")).unwrap();
        assert_eq!(result, root.join("hosts/dobby"));
    }

    #[test]
    fn test_normalize_under_root_rejects_root_itself() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        assert!(normalize_under_root(&root, Path::new("./")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_normalize_under_root_symlink_escape() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();

        std::os::unix::fs::symlink(outside.path(), root.join("hosts")).unwrap();
        assert!(normalize_under_root(&root, Path::new("hosts/dobby")).is_err());
    }

    #[test]
    fn test_normalize_existing_is_canonical() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("hosts/dobby")).unwrap();

        let result = normalize_under_root(&root, Path::new("hosts//dobby")).unwrap();
        assert_eq!(result, root.join("hosts/dobby").canonicalize().unwrap());
    }

    #[test]
    fn test_strict_descendant() {
        let root = Path::new("/opt/archive");
        assert!(is_strict_descendant(root, Path::new("/opt/archive/hosts")));
        assert!(!is_strict_descendant(root, Path::new("/opt/archive")));
        assert!(!is_strict_descendant(root, Path::new("/opt")));
        assert!(!is_strict_descendant(root, Path::new("/opt/archive2")));
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(b"WRNG");
        header[4..6].copy_from_slice(&VERSION.to_le_bytes());
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_parse_frame_header_wrong_version() {
        let mut header = build_frame_header(1, 100);
        header[4..6].copy_from_slice(&999u16.to_le_bytes());
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_validate_frame_size_edge_cases() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        write_frame(&mut a, crate::protocol::frame::PUSH_REQ, b"push-archive")
            .await
            .unwrap();
        let (t, pl) = read_frame(&mut b).await.unwrap();
        assert_eq!(t, crate::protocol::frame::PUSH_REQ);
        assert_eq!(pl, b"push-archive");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        use tokio::io::AsyncWriteExt;
        let (mut a, mut b) = tokio::io::duplex(64);
        let hdr = build_frame_header(crate::protocol::frame::TAR_DATA, (MAX_FRAME_SIZE + 1) as u32);
        a.write_all(&hdr).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
