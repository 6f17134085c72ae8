use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};

pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("ark");
    }
    PathBuf::from(".ark")
}

pub fn default_client_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("client-cert.pem"), dir.join("client-key.pem"))
}

pub fn known_hosts_path() -> PathBuf {
    config_dir().join("known_hosts")
}

/// Create a self-signed certificate at `cert_path`/`key_path` unless both
/// already exist. The key file is written 0600.
pub fn generate_if_missing(cert_path: &Path, key_path: &Path, subject: &str) -> Result<bool> {
    if cert_path.exists() && key_path.exists() {
        return Ok(false);
    }
    for p in [cert_path, key_path] {
        if let Some(dir) = p.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
    }
    let cert = rcgen::generate_simple_self_signed(vec![subject.to_string()]).context("generate self-signed cert")?;
    fs::write(cert_path, cert.serialize_pem().context("serialize cert")?).context("write cert pem")?;
    write_private(key_path, cert.serialize_private_key_pem().as_bytes()).context("write key pem")?;
    Ok(true)
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = fs::File::create(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        f.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    f.write_all(data)?;
    f.sync_all()?;
    Ok(())
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(fs::File::open(path).with_context(|| format!("open {}", path.display()))?);
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.context("read cert")?);
    }
    if out.is_empty() {
        bail!("no certificate in {}", path.display());
    }
    Ok(out)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(fs::File::open(path).with_context(|| format!("open {}", path.display()))?);
    rustls_pemfile::private_key(&mut rd)
        .context("read key")?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}

/// `sha256:<hex>` of a DER certificate.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}

pub fn fingerprint_file(cert_path: &Path) -> Result<String> {
    let certs = load_certs(cert_path)?;
    Ok(fingerprint(&certs[0]))
}

fn signature_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

/// Requires a client certificate and checks its handshake signature, but
/// does not judge who it belongs to: the fingerprint is mapped to an
/// identity after the handshake and the registry decides.
#[derive(Debug)]
struct FingerprintClientVerifier {
    algs: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for FingerprintClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

/// Server config with mandatory client certificates. A missing server
/// certificate is generated and persisted so clients can pin it.
pub fn load_or_generate_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    if generate_if_missing(cert_path, key_path, "arkd.local")? {
        tracing::info!(cert = %cert_path.display(), "generated self-signed server certificate");
    }
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let verifier = Arc::new(FingerprintClientVerifier {
        algs: signature_algorithms(),
    });
    let cfg = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(Arc::new(cfg))
}

/// Fingerprint to identity table, one `sha256:<hex>=<identity>` per line.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedClients {
    by_fingerprint: HashMap<String, String>,
}

impl AuthorizedClients {
    pub fn parse(text: &str) -> Result<Self> {
        let mut by_fingerprint = HashMap::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (fp, identity) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected sha256:<hex>=<identity>", n + 1))?;
            let fp = fp.trim().to_ascii_lowercase();
            let identity = identity.trim();
            if !fp.starts_with("sha256:") || identity.is_empty() {
                bail!("line {}: expected sha256:<hex>=<identity>", n + 1);
            }
            if by_fingerprint.insert(fp.clone(), identity.to_string()).is_some() {
                bail!("line {}: duplicate fingerprint {}", n + 1, fp);
            }
        }
        Ok(Self { by_fingerprint })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse {}", path.display()))
    }

    /// The mapped identity, or the fingerprint itself when unmapped. An
    /// unmapped fingerprint never matches a registry identity.
    pub fn identity_for(&self, fingerprint: &str) -> String {
        self.by_fingerprint
            .get(fingerprint)
            .cloned()
            .unwrap_or_else(|| fingerprint.to_string())
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}

fn read_known_hosts(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(f) = fs::File::open(path) {
        for line in BufReader::new(f).lines().map_while(|l| l.ok()) {
            if line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    map
}

fn write_known_hosts(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    if let Some(p) = path.parent() {
        fs::create_dir_all(p).context("create known_hosts parent dir")?;
    }
    // Write-then-rename so a crash never leaves a torn file
    let temp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&temp_path).context("create temp known_hosts")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            f.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        writeln!(f, "# ark TOFU known_hosts - format version 1")?;
        let mut entries: Vec<_> = map.iter().collect();
        entries.sort();
        for (k, v) in entries {
            writeln!(f, "{}={}", k, v)?;
        }
        f.sync_all()?;
    }
    fs::rename(&temp_path, path).context("atomic replace known_hosts")?;
    Ok(())
}

#[derive(Debug)]
struct TofuVerifier {
    hostport: String,
    known_path: PathBuf,
    algs: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = fingerprint(end_entity);
        let mut map = read_known_hosts(&self.known_path);
        match map.get(&self.hostport) {
            Some(saved) if saved == &fp => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::General(format!(
                "server certificate for {} changed; refusing connection (TOFU)",
                self.hostport
            ))),
            None => {
                map.insert(self.hostport.clone(), fp);
                if let Err(e) = write_known_hosts(&self.known_path, &map) {
                    tracing::warn!(path = %self.known_path.display(), error = %e, "failed to pin server certificate");
                }
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

/// Client config presenting `cert`/`key` and pinning the server on first
/// use in `known_hosts`.
pub fn build_client_config(
    host: &str,
    port: u16,
    cert_path: &Path,
    key_path: &Path,
    known_hosts: &Path,
) -> Result<Arc<rustls::ClientConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let verifier = TofuVerifier {
        hostport: format!("{}:{}", host, port),
        known_path: known_hosts.to_path_buf(),
        algs: signature_algorithms(),
    };
    let cfg = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(certs, key)
        .context("build client tls config")?;
    Ok(Arc::new(cfg))
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name {:?}: {}", host, e))
}
