//! Speculative editing: fork the main document, edit in isolation, then
//! merge everything back as one change or throw it away.
//!
//! [`Branch`] encodes the single-outcome rule in its signature: `merge` and
//! `discard` take `self`. [`BranchSession`] wraps the same lifecycle in a
//! runtime state machine for holders that keep the branch in a field.

use crate::document::Document;
use crate::error::{DocumentError, Result};
use crate::model::{ChangeOrigin, ChangeSet};
use crate::Transaction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeOptions {
    /// When false the merge is applied but never offered to undo.
    pub revertible: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self { revertible: true }
    }
}

impl Document {
    /// Fork this document into a private [`Branch`]. Branches cannot be
    /// forked again.
    pub fn fork(&self) -> Result<Branch> {
        let doc = self.fork_document()?;
        Ok(Branch { doc })
    }
}

/// An isolated copy of a main document.
///
/// Edits made here are invisible to the main document and to every other
/// participant until [`Branch::merge`]. Dropping a branch discards it.
#[derive(Debug)]
pub struct Branch {
    doc: Document,
}

impl Branch {
    /// The branch's own document. Handles cloned from it stop working once
    /// the branch is merged or discarded.
    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn transaction<F>(&self, f: F) -> Result<ChangeSet>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()>,
    {
        self.doc.transaction(f)
    }

    /// Apply every edit made on this branch to `into` as one change, then
    /// dispose the branch.
    ///
    /// `into` receives a single change event with origin
    /// [`ChangeOrigin::Merge`] and emits one replication update. Merging a
    /// branch that made no edits changes nothing and emits nothing.
    pub fn merge(self, into: &Document, options: MergeOptions) -> Result<ChangeSet> {
        self.doc.ensure_live()?;
        into.ensure_live()?;
        if into.is_branch() {
            return Err(DocumentError::InvalidSessionState(
                "a branch can only merge into a main document".to_string(),
            ));
        }
        if into.in_transaction() {
            return Err(DocumentError::NestedTransaction);
        }

        let diff = self.doc.encode_diff(&into.state_vector())?;
        let changes = into.integrate(
            &diff,
            ChangeOrigin::Merge {
                revertible: options.revertible,
            },
        )?;
        if !changes.is_empty() {
            into.broadcast_update(&diff);
        }

        log::info!(
            "Merged branch {} into {} ({} item change(s))",
            self.doc.id(),
            into.id(),
            changes.len()
        );
        self.doc.dispose();
        Ok(changes)
    }

    /// Dispose the branch without touching the main document.
    pub fn discard(self) {
        log::info!("Discarded branch {}", self.doc.id());
        self.doc.dispose();
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        if !self.doc.is_disposed() {
            log::debug!("Branch {} dropped without merge, discarding", self.doc.id());
            self.doc.dispose();
        }
    }
}

// ─── Session ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No branch open; edits go straight to main.
    Idle,
    Forked,
    Merged,
    Discarded,
}

/// Runtime-checked branch lifecycle over one main document.
///
/// ```text
/// Idle ──fork──► Forked ──commit──► Merged
///                   └────discard──► Discarded
/// ```
///
/// `Merged` and `Discarded` may fork again. Any other transition returns
/// [`DocumentError::InvalidSessionState`].
#[derive(Debug)]
pub struct BranchSession {
    main: Document,
    branch: Option<Branch>,
    state: SessionState,
}

impl BranchSession {
    pub fn new(main: &Document) -> Self {
        Self {
            main: main.clone(),
            branch: None,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn main(&self) -> &Document {
        &self.main
    }

    /// Open a branch. Fails while one is already open.
    pub fn fork(&mut self) -> Result<&Document> {
        if self.state == SessionState::Forked {
            return Err(DocumentError::InvalidSessionState(
                "a branch is already open".to_string(),
            ));
        }
        let branch = self.main.fork()?;
        self.state = SessionState::Forked;
        Ok(self.branch.insert(branch).document())
    }

    /// The open branch's document.
    pub fn view(&self) -> Result<&Document> {
        self.open_branch().map(Branch::document)
    }

    pub fn transaction<F>(&self, f: F) -> Result<ChangeSet>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()>,
    {
        self.open_branch()?.transaction(f)
    }

    /// Merge the open branch into main. If the merge itself fails the branch
    /// is discarded and the error returned.
    pub fn commit(&mut self, options: MergeOptions) -> Result<ChangeSet> {
        let branch = self.take_branch("commit")?;
        match branch.merge(&self.main, options) {
            Ok(changes) => {
                self.state = SessionState::Merged;
                Ok(changes)
            }
            Err(e) => {
                log::warn!("Branch merge failed, branch discarded: {}", e);
                self.state = SessionState::Discarded;
                Err(e)
            }
        }
    }

    pub fn discard(&mut self) -> Result<()> {
        let branch = self.take_branch("discard")?;
        branch.discard();
        self.state = SessionState::Discarded;
        Ok(())
    }

    fn open_branch(&self) -> Result<&Branch> {
        match (&self.branch, self.state) {
            (Some(branch), SessionState::Forked) => Ok(branch),
            (_, state) => Err(DocumentError::InvalidSessionState(format!(
                "no open branch (session is {:?})",
                state
            ))),
        }
    }

    fn take_branch(&mut self, action: &str) -> Result<Branch> {
        if self.state != SessionState::Forked {
            return Err(DocumentError::InvalidSessionState(format!(
                "cannot {} from state {:?}",
                action, self.state
            )));
        }
        self.branch.take().ok_or_else(|| {
            DocumentError::InvalidSessionState(format!("cannot {}: no branch", action))
        })
    }
}
