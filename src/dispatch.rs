//! Command dispatcher: the single entry point for every inbound session
//!
//! Parses the requested operation, resolves the identity against the
//! registry snapshot, and either hands a [`PushRequest`] to the executor or
//! rejects. Rejections are audited here and never touch the filesystem.

use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;

use crate::audit::{AuditLog, AuditRecord, Decision};
use crate::error::{ArkError, ArkResult};
use crate::executor::{PushRequest, TransferExecutor, TransferResult};
use crate::lock_table::ClientLock;
use crate::protocol::{MAX_REQUEST_LEN, PUSH_OPERATION};
use crate::registry::{RegistryHandle, RESERVED_PREFIX};
use crate::session::Session;

/// A parsed `push-archive [source...]` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedOperation {
    pub sources: Vec<String>,
}

/// Parse the raw operation string a remote party asked to run. Only
/// `push-archive` followed by plain source names is accepted; every other
/// shape is `ForbiddenOperation`.
pub fn parse_operation(raw: &str) -> ArkResult<RequestedOperation> {
    let forbid = |why: &str| Err(ArkError::ForbiddenOperation(why.to_string()));

    if raw.len() > MAX_REQUEST_LEN {
        return forbid("request too long");
    }
    if let Some(c) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ' | '\t')))
    {
        return Err(ArkError::ForbiddenOperation(format!("character {:?} not permitted", c)));
    }

    let mut tokens = raw.split_whitespace();
    match tokens.next() {
        Some(op) if op == PUSH_OPERATION => {}
        Some(op) => return Err(ArkError::ForbiddenOperation(format!("operation {:?} not permitted", op))),
        None => return forbid("empty request"),
    }

    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for token in tokens {
        if token == "." || token == ".." {
            return Err(ArkError::ForbiddenOperation(format!("source {:?} not permitted", token)));
        }
        if token.starts_with('-') {
            return Err(ArkError::ForbiddenOperation(format!("option-like source {:?}", token)));
        }
        if token.starts_with(RESERVED_PREFIX) {
            return Err(ArkError::ForbiddenOperation(format!("reserved source name {:?}", token)));
        }
        if !seen.insert(token) {
            return Err(ArkError::ForbiddenOperation(format!("duplicate source {:?}", token)));
        }
        sources.push(token.to_string());
    }
    Ok(RequestedOperation { sources })
}

/// Outcome of dispatching one session.
#[derive(Debug)]
pub enum DispatchDecision {
    Proceed(PushRequest),
    Reject(ArkError),
}

pub struct Dispatcher {
    registry: Arc<RegistryHandle>,
    executor: Arc<TransferExecutor>,
    audit: AuditLog,
}

impl Dispatcher {
    pub fn new(registry: Arc<RegistryHandle>, executor: Arc<TransferExecutor>, audit: AuditLog) -> Self {
        Self {
            registry,
            executor,
            audit,
        }
    }

    pub fn registry(&self) -> &Arc<RegistryHandle> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<TransferExecutor> {
        &self.executor
    }

    /// Validate a session. A rejection has already been audited when this
    /// returns.
    pub fn dispatch(&self, session: &Session) -> DispatchDecision {
        match self.validate(session) {
            Ok(request) => {
                tracing::info!(
                    session = session.id(),
                    identity = %session.identity(),
                    transport = session.transport().as_str(),
                    peer = session.peer().unwrap_or("-"),
                    destination = %request.destination().display(),
                    sources = request.sources().len(),
                    "push dispatched"
                );
                DispatchDecision::Proceed(request)
            }
            Err(e) => {
                tracing::info!(
                    session = session.id(),
                    identity = %session.identity(),
                    transport = session.transport().as_str(),
                    peer = session.peer().unwrap_or("-"),
                    error = %e,
                    "push rejected"
                );
                self.audit.record(AuditRecord::new(
                    session.id(),
                    session.identity().as_str(),
                    Decision::Rejected,
                    e.audit_reason(),
                    0,
                ));
                DispatchDecision::Reject(e)
            }
        }
    }

    fn validate(&self, session: &Session) -> ArkResult<PushRequest> {
        let op = parse_operation(session.requested())?;
        let registry = self.registry.snapshot();
        let entry = registry.resolve(session.identity().as_str())?;
        Ok(PushRequest::new(session, entry, op.sources))
    }

    /// Dispatch and lock. Transports that must answer before streaming
    /// call this, then [`Dispatcher::complete`].
    pub async fn admit(&self, session: &Session) -> ArkResult<(PushRequest, ClientLock)> {
        let request = match self.dispatch(session) {
            DispatchDecision::Proceed(request) => request,
            DispatchDecision::Reject(e) => return Err(e),
        };
        let lock = self.executor.reserve(&request).await?;
        Ok((request, lock))
    }

    pub async fn complete<R>(&self, request: PushRequest, lock: ClientLock, payload: R) -> ArkResult<TransferResult>
    where
        R: Read + Send + 'static,
    {
        self.executor.execute_locked(request, lock, payload).await
    }

    /// Release an admitted push whose transport failed before streaming.
    pub fn abandon(&self, request: PushRequest, lock: ClientLock, error: ArkError) -> ArkError {
        self.executor.abandon(request, lock, error)
    }

    /// Dispatch, lock, and run the transfer in one call.
    pub async fn handle<R>(&self, session: &Session, payload: R) -> ArkResult<TransferResult>
    where
        R: Read + Send + 'static,
    {
        let (request, lock) = self.admit(session).await?;
        self.complete(request, lock, payload).await
    }
}
