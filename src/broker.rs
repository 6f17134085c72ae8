//! Privilege broker: the only path to administrative filesystem actions
//!
//! The allow-list below is the trust boundary. Extending it is a code change
//! and bumps `ALLOW_LIST_VERSION`; nothing here is driven by configuration
//! and nothing is executed through a shell.

use std::path::{Component, Path, PathBuf};

use crate::error::{ArkError, ArkResult};
use crate::protocol_core::is_strict_descendant;

pub const ALLOW_LIST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// `create_dir_all` of a directory strictly inside the archive root.
    CreateDirectory,
    /// Recursive `lchown` to the configured backup owner.
    NormalizeOwnership,
}

impl ActionKind {
    pub fn verb(self) -> &'static str {
        match self {
            ActionKind::CreateDirectory => "create-directory",
            ActionKind::NormalizeOwnership => "normalize-ownership",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Strictly below the archive root.
    ArchiveTree,
}

struct Permit {
    kind: ActionKind,
    scope: Scope,
}

const ALLOW_LIST: &[Permit] = &[
    Permit {
        kind: ActionKind::CreateDirectory,
        scope: Scope::ArchiveTree,
    },
    Permit {
        kind: ActionKind::NormalizeOwnership,
        scope: Scope::ArchiveTree,
    },
];

/// An action the broker agreed to describe. Construct through
/// [`PrivilegeBroker::action`] or [`PrivilegeBroker::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalatedAction {
    kind: ActionKind,
    target: PathBuf,
}

impl EscalatedAction {
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

pub struct PrivilegeBroker {
    archive_root: PathBuf,
    owner: Option<Owner>,
}

impl PrivilegeBroker {
    /// `archive_root` must be canonical.
    pub fn new(archive_root: PathBuf, owner: Option<Owner>) -> Self {
        Self { archive_root, owner }
    }

    pub fn action(&self, kind: ActionKind, target: &Path) -> EscalatedAction {
        EscalatedAction {
            kind,
            target: target.to_path_buf(),
        }
    }

    /// Build an action from a textual request (`<verb> <absolute path>`).
    /// Unknown verbs never produce an action.
    pub fn parse(&self, request: &str) -> ArkResult<EscalatedAction> {
        let mut parts = request.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let target = parts.next();
        if parts.next().is_some() {
            return Err(ArkError::ForbiddenAction(format!("unexpected arguments in {:?}", request)));
        }
        let kind = ALLOW_LIST
            .iter()
            .map(|p| p.kind)
            .find(|k| k.verb() == verb)
            .ok_or_else(|| ArkError::ForbiddenAction(format!("verb {:?} is not allow-listed", verb)))?;
        let target = target
            .ok_or_else(|| ArkError::ForbiddenAction(format!("{} requires a target", verb)))?;
        Ok(self.action(kind, Path::new(target)))
    }

    /// Check an action against the allow-list and perform it.
    pub fn escalate(&self, action: &EscalatedAction) -> ArkResult<()> {
        let permit = ALLOW_LIST
            .iter()
            .find(|p| p.kind == action.kind)
            .ok_or_else(|| ArkError::ForbiddenAction(format!("{} is not allow-listed", action.kind.verb())))?;
        self.check_scope(permit.scope, &action.target)
            .map_err(|reason| {
                tracing::warn!(
                    action = action.kind.verb(),
                    path = %action.target.display(),
                    %reason,
                    "escalation denied"
                );
                ArkError::ForbiddenAction(format!("{} {}: {}", action.kind.verb(), action.target.display(), reason))
            })?;

        tracing::debug!(
            action = action.kind.verb(),
            path = %action.target.display(),
            allow_list = ALLOW_LIST_VERSION,
            "escalation granted"
        );
        match action.kind {
            ActionKind::CreateDirectory => self.create_directory(&action.target),
            ActionKind::NormalizeOwnership => self.normalize_ownership(&action.target),
        }
    }

    fn check_scope(&self, scope: Scope, target: &Path) -> Result<(), String> {
        match scope {
            Scope::ArchiveTree => {
                if !target.is_absolute() {
                    return Err("target must be absolute".into());
                }
                if target
                    .components()
                    .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
                {
                    return Err("target must be normalized".into());
                }
                if !is_strict_descendant(&self.archive_root, target) {
                    return Err("target is outside the archive tree".into());
                }
                // Resolve whatever already exists to catch symlinked escapes
                let mut probe = target;
                while !probe.exists() {
                    match probe.parent() {
                        Some(p) => probe = p,
                        None => return Err("no existing ancestor".into()),
                    }
                }
                let resolved = probe.canonicalize().map_err(|e| e.to_string())?;
                if resolved != self.archive_root && !resolved.starts_with(&self.archive_root) {
                    return Err("target resolves outside the archive tree".into());
                }
                Ok(())
            }
        }
    }

    fn create_directory(&self, target: &Path) -> ArkResult<()> {
        // Remember the first ancestor that must be created so only new
        // directories get their ownership fixed
        let mut first_new = None;
        let mut probe = target;
        while !probe.exists() {
            first_new = Some(probe.to_path_buf());
            match probe.parent() {
                Some(p) => probe = p,
                None => break,
            }
        }
        std::fs::create_dir_all(target)
            .map_err(|e| ArkError::StorageFailure(format!("create {}: {}", target.display(), e)))?;
        if let Some(top) = first_new {
            if self.owner.is_some() {
                self.normalize_ownership(&top)?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn normalize_ownership(&self, target: &Path) -> ArkResult<()> {
        use walkdir::WalkDir;

        let Some(owner) = self.owner else {
            return Ok(());
        };
        for entry in WalkDir::new(target).follow_links(false) {
            let entry = entry.map_err(|e| ArkError::StorageFailure(format!("walk {}: {}", target.display(), e)))?;
            std::os::unix::fs::lchown(entry.path(), Some(owner.uid), Some(owner.gid)).map_err(|e| {
                ArkError::StorageFailure(format!("chown {}: {}", entry.path().display(), e))
            })?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn normalize_ownership(&self, target: &Path) -> ArkResult<()> {
        if self.owner.is_some() {
            tracing::warn!(path = %target.display(), "ownership normalization unsupported on this platform");
        }
        Ok(())
    }
}
