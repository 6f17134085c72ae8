//! Framed TLS transport for pushes.
//!
//! One Tokio task per connection. The server maps the client certificate
//! fingerprint to an identity, hands the session to the dispatcher, and pumps
//! TAR_DATA frames into the executor's blocking reader. The client packs its
//! sources on a blocking thread and streams them as frames.

use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{ArkError, ErrorClass};
use crate::protocol::frame;
use crate::protocol_core::{read_frame_timed, write_frame};

/// Failure reported by the server in an ERROR frame.
#[derive(Debug, thiserror::Error)]
#[error("{}: {}", .class.as_str(), .message)]
pub struct RemoteError {
    pub class: ErrorClass,
    pub message: String,
}

fn encode_error(e: &ArkError) -> Vec<u8> {
    let msg = e.public_message();
    let mut out = Vec::with_capacity(1 + msg.len());
    out.push(e.class().to_wire());
    out.extend_from_slice(msg.as_bytes());
    out
}

fn decode_error(payload: &[u8]) -> RemoteError {
    let class = payload
        .first()
        .and_then(|b| ErrorClass::from_wire(*b))
        .unwrap_or(ErrorClass::Failed);
    let message = payload
        .get(1..)
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .unwrap_or_default();
    RemoteError { class, message }
}

pub mod server {
    use super::*;
    use parking_lot::RwLock;
    use std::net::SocketAddr;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};
    use tokio_rustls::TlsAcceptor;

    use crate::dispatch::Dispatcher;
    use crate::executor::PushRequest;
    use crate::lock_table::ClientLock;
    use crate::protocol::timeouts::{HANDSHAKE_MS, REQUEST_MS};
    use crate::session::{Session, TransportKind, VerifiedIdentity};
    use crate::tar_stream::{payload_channel, Chunk, StreamLimits, TarConfig};
    use crate::tls::{self, AuthorizedClients};

    /// Everything a connection task needs, shared across tasks.
    pub struct ServerContext {
        dispatcher: Arc<Dispatcher>,
        authorized: RwLock<Arc<AuthorizedClients>>,
        authorized_path: Option<PathBuf>,
        limits: StreamLimits,
        tar: TarConfig,
    }

    impl ServerContext {
        pub fn new(
            dispatcher: Arc<Dispatcher>,
            authorized: AuthorizedClients,
            authorized_path: Option<PathBuf>,
            limits: StreamLimits,
            tar: TarConfig,
        ) -> Self {
            Self {
                dispatcher,
                authorized: RwLock::new(Arc::new(authorized)),
                authorized_path,
                limits,
                tar,
            }
        }

        pub fn dispatcher(&self) -> &Arc<Dispatcher> {
            &self.dispatcher
        }

        fn authorized(&self) -> Arc<AuthorizedClients> {
            self.authorized.read().clone()
        }

        /// Re-read the manifest and the authorized clients file. Either
        /// failing leaves its previous table in place.
        pub fn reload(&self) -> Result<()> {
            let clients = self.dispatcher.registry().reload().context("reload manifest")?;
            if let Some(path) = &self.authorized_path {
                let fresh = AuthorizedClients::load(path)?;
                let keys = fresh.len();
                *self.authorized.write() = Arc::new(fresh);
                tracing::info!(clients, keys, "configuration reloaded");
            } else {
                tracing::info!(clients, "manifest reloaded");
            }
            Ok(())
        }
    }

    pub async fn serve_with_tls(bind: &str, ctx: Arc<ServerContext>, tls_config: Arc<rustls::ServerConfig>) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        serve_listener(listener, ctx, tls_config).await
    }

    pub async fn serve_listener(
        listener: TcpListener,
        ctx: Arc<ServerContext>,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> Result<()> {
        tracing::info!(
            addr = %listener.local_addr()?,
            clients = ctx.dispatcher.registry().snapshot().len(),
            "arkd listening"
        );
        let acceptor = TlsAcceptor::from(tls_config);
        loop {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            let acceptor = acceptor.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, acceptor, ctx).await {
                    tracing::warn!(%peer, error = %format!("{:#}", e), "connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: TlsAcceptor,
        ctx: Arc<ServerContext>,
    ) -> Result<()> {
        let mut stream = timeout(Duration::from_millis(HANDSHAKE_MS), acceptor.accept(stream))
            .await
            .map_err(|_| anyhow!("tls handshake timeout ({} ms)", HANDSHAKE_MS))?
            .context("tls handshake")?;

        let fingerprint = {
            let (_, conn) = stream.get_ref();
            let cert = conn
                .peer_certificates()
                .and_then(|certs| certs.first())
                .context("client presented no certificate")?;
            tls::fingerprint(cert)
        };
        let identity = ctx.authorized().identity_for(&fingerprint);

        let (typ, payload) = read_frame_timed(&mut stream, REQUEST_MS).await?;
        if typ != frame::PUSH_REQ {
            bail!("expected PUSH_REQ, got frame {}", typ);
        }
        let requested = String::from_utf8_lossy(&payload).into_owned();
        let session = Session::from_transport(
            VerifiedIdentity::new(identity),
            requested,
            TransportKind::Tls,
            Some(peer.to_string()),
        );
        tracing::debug!(session = session.id(), %peer, %fingerprint, "session opened");

        let (request, lock) = match ctx.dispatcher.admit(&session).await {
            Ok(admitted) => admitted,
            Err(e) => {
                write_frame(&mut stream, frame::ERROR, &encode_error(&e)).await?;
                return Ok(());
            }
        };
        serve_admitted(&mut stream, &ctx, &session, request, lock).await
    }

    /// Acknowledge an admitted push, pump its payload into the executor and
    /// report the outcome. Every path out of here leaves one audit record.
    async fn serve_admitted<S>(
        stream: &mut S,
        ctx: &ServerContext,
        session: &Session,
        request: PushRequest,
        lock: ClientLock,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = write_frame(stream, frame::OK, &[]).await {
            ctx.dispatcher.abandon(
                request,
                lock,
                ArkError::PartialTransfer("peer gone before stream".into()),
            );
            return Err(e.context("send OK"));
        }

        let (tx, reader) = payload_channel(&ctx.tar, ctx.limits);
        let dispatcher = ctx.dispatcher.clone();
        let transfer = tokio::spawn(async move { dispatcher.complete(request, lock, reader).await });

        let pumped = pump_payload(stream, tx, ctx.limits).await;
        let outcome = match transfer.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ArkError::StorageFailure(format!("transfer task: {}", e))),
        };
        if let Err(e) = &pumped {
            tracing::debug!(session = session.id(), error = %e, "payload pump stopped");
        }

        match outcome {
            Ok(result) => write_frame(stream, frame::DONE, &result.bytes.to_le_bytes()).await?,
            // The peer may already be gone
            Err(e) => {
                let _ = write_frame(stream, frame::ERROR, &encode_error(&e)).await;
            }
        }
        Ok(())
    }

    /// Forward TAR_DATA frames into the payload channel until TAR_END.
    /// Returning early drops `tx`, which the executor sees as a truncated
    /// stream.
    async fn pump_payload<S>(stream: &mut S, tx: mpsc::Sender<Chunk>, limits: StreamLimits) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let idle_ms = limits.idle.as_millis().min(u64::MAX as u128) as u64;
        let mut received = 0u64;
        loop {
            let (typ, payload) = read_frame_timed(stream, idle_ms).await?;
            match typ {
                frame::TAR_DATA => {
                    received += payload.len() as u64;
                    if tx.send(Chunk::Data(payload)).await.is_err() {
                        bail!("receiver stopped after {} bytes", received);
                    }
                }
                frame::TAR_END => {
                    let _ = tx.send(Chunk::End).await;
                    return Ok(received);
                }
                other => bail!("unexpected frame {} during payload", other),
            }
        }
    }

}

pub mod client {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::{timeout, Duration};
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;

    use crate::protocol::timeouts::{ADMIT_MS, CONNECT_MS, FINISH_MS, HANDSHAKE_MS, REQUEST_MS};
    use crate::protocol::PUSH_OPERATION;
    use crate::tar_stream::{source_names, spawn_packer, TarConfig};
    use crate::tls::server_name_for;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PushOutcome {
        /// Regular file bytes the server accepted.
        pub bytes: u64,
        /// Regular files packed locally.
        pub files: u64,
    }

    pub async fn connect(host: &str, port: u16, tls_config: Arc<rustls::ClientConfig>) -> Result<TlsStream<TcpStream>> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("connect {} timed out", addr))?
            .with_context(|| format!("connect {}", addr))?;
        let _ = tcp.set_nodelay(true);
        let connector = TlsConnector::from(tls_config);
        let stream = timeout(
            Duration::from_millis(HANDSHAKE_MS),
            connector.connect(server_name_for(host)?, tcp),
        )
        .await
        .map_err(|_| anyhow!("tls handshake with {} timed out", addr))?
        .with_context(|| format!("tls handshake with {}", addr))?;
        Ok(stream)
    }

    /// The request line sent in PUSH_REQ.
    pub fn push_request_line(names: &[String]) -> String {
        let mut line = String::from(PUSH_OPERATION);
        for name in names {
            line.push(' ');
            line.push_str(name);
        }
        line
    }

    /// Pack `sources` and push them. The server decides where they land.
    pub async fn push(
        host: &str,
        port: u16,
        sources: &[PathBuf],
        tls_config: Arc<rustls::ClientConfig>,
        tar: &TarConfig,
    ) -> Result<PushOutcome> {
        let names = source_names(sources)?;
        let mut stream = connect(host, port, tls_config).await?;

        write_frame(&mut stream, frame::PUSH_REQ, push_request_line(&names).as_bytes()).await?;
        let (typ, payload) = read_frame_timed(&mut stream, ADMIT_MS).await?;
        match typ {
            frame::OK => {}
            frame::ERROR => return Err(decode_error(&payload).into()),
            other => bail!("unexpected frame {} in reply to PUSH_REQ", other),
        }

        let (mut rx, packer) = spawn_packer(sources.to_vec(), tar);
        let mut sent = 0u64;
        let streamed: Result<()> = async {
            while let Some(chunk) = rx.recv().await {
                write_frame(&mut stream, frame::TAR_DATA, &chunk).await?;
                sent += chunk.len() as u64;
            }
            Ok(())
        }
        .await;
        if let Err(e) = streamed {
            drop(rx);
            // The server may have refused the payload mid-stream
            if let Ok((frame::ERROR, payload)) = read_frame_timed(&mut stream, REQUEST_MS).await {
                return Err(decode_error(&payload).into());
            }
            return Err(e.context(format!("stream payload after {} bytes", sent)));
        }

        // Without TAR_END the server discards the transfer
        let (files, _) = packer.await.context("packer task")??;
        write_frame(&mut stream, frame::TAR_END, &[]).await?;

        let (typ, payload) = read_frame_timed(&mut stream, FINISH_MS).await?;
        let outcome = match typ {
            frame::DONE => {
                let raw: [u8; 8] = payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("bad DONE payload ({} bytes)", payload.len()))?;
                PushOutcome {
                    bytes: u64::from_le_bytes(raw),
                    files,
                }
            }
            frame::ERROR => return Err(decode_error(&payload).into()),
            other => bail!("unexpected frame {} after TAR_END", other),
        };
        let _ = stream.shutdown().await;
        tracing::debug!(host, port, sent, bytes = outcome.bytes, "push complete");
        Ok(outcome)
    }
}
