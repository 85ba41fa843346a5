//! The contract every backend (local btrfs, S3, remote SSH) must satisfy.
//!
//! Modeled the same way the teacher's `blockdev` module models
//! `trait BlockDevice`: a small trait with dynamic dispatch across a
//! handful of concrete backends, plus a free dispatch function keyed on the
//! identifier's scheme.

pub mod local;
pub mod s3;
pub mod ssh;

use std::io::{Read, Write};

use thiserror::Error;
use uuid::Uuid;

use crate::model::Diff;
use crate::progress::ShowProgress;

/// Access level a store session was opened with. Ordered `Read < Append <
/// Write`; the peer server enforces this ordering before dispatching any
/// mutating command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    Read,
    Append,
    Write,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Read => "r",
            Mode::Append => "a",
            Mode::Write => "w",
        }
    }

    pub fn parse(s: &str) -> Option<Mode> {
        match s {
            "r" => Some(Mode::Read),
            "a" => Some(Mode::Append),
            "w" => Some(Mode::Write),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("authentication missing: {0}")]
    AuthenticationMissing(String),
    #[error("path is not normalized: {0}")]
    PathNotNormalized(String),
    #[error("child process failed: {0}")]
    ChildProcessFailed(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A human-readable line describing a volume or diff, for `list_contents`.
pub type ContentLine = String;

/// Every backend (local btrfs, S3, remote SSH) implements this trait.
/// Dynamic dispatch only: a handful of concrete backends, never open
/// extension at runtime.
pub trait Store {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    fn list_volumes(&self) -> Result<Vec<crate::model::Volume>>;
    fn list_contents(&self) -> Result<Vec<ContentLine>>;

    /// Ordered list of locators for `vol`; first is the preferred send
    /// path. Order matters (see [`select_receive_path`]) and must never be
    /// collapsed into an unordered set.
    fn get_paths(&self, vol: Uuid) -> Result<Vec<String>>;

    fn get_edges(&self, from_vol: Option<Uuid>) -> Result<Vec<Diff>>;
    fn has_edge(&self, diff: &Diff) -> Result<bool>;
    fn measure_size(&self, diff: &mut Diff, chunk_size: usize) -> Result<()>;

    /// `None` in dry-run mode; logs `WOULD: send <diff>` and does nothing.
    fn send(&mut self, diff: &Diff) -> Result<Option<Box<dyn Read>>>;
    /// `None` in dry-run mode; logs `WOULD: receive <diff>` and does
    /// nothing.
    fn receive(&mut self, diff: &Diff, paths: &[String]) -> Result<Option<Box<dyn Write>>>;
    fn receive_volume_info(&mut self, paths: &[String]) -> Result<Option<Box<dyn Write>>>;

    fn keep(&mut self, diff: &Diff) -> Result<()>;
    fn delete_unused(&mut self, dry_run: bool) -> Result<()>;
    fn delete_partials(&mut self, dry_run: bool) -> Result<()>;

    fn show_progress(&self) -> ShowProgress;
    fn is_remote(&self) -> bool;

    /// A skip-by-checksum handle paired with the writer most recently
    /// returned by `receive`, if this backend can tell the transfer engine
    /// a chunk is already present at the destination (S3's resumed
    /// multipart upload). Most backends have nothing to offer here.
    fn chunk_skip(&mut self) -> Option<Box<dyn crate::transfer::ChunkSkip>> {
        None
    }
}

/// Path-selection rule used identically by every store: prefer the first
/// candidate that is relative (and therefore inside this store's own
/// scope); otherwise fall back to the basename of the first absolute
/// candidate. An empty list synthesizes an "Anon" path.
pub fn select_receive_path(candidates: &[String]) -> String {
    if let Some(relative) = candidates.iter().find(|c| !std::path::Path::new(c).is_absolute()) {
        return relative.clone();
    }
    match candidates.first() {
        Some(first) => std::path::Path::new(first)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Anon".to_string()),
        None => "Anon".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_ordering_is_r_lt_a_lt_w() {
        assert!(Mode::Read < Mode::Append);
        assert!(Mode::Append < Mode::Write);
    }

    #[test]
    fn mode_parses_single_letters() {
        assert_eq!(Mode::parse("r"), Some(Mode::Read));
        assert_eq!(Mode::parse("a"), Some(Mode::Append));
        assert_eq!(Mode::parse("w"), Some(Mode::Write));
        assert_eq!(Mode::parse("x"), None);
    }

    #[test]
    fn select_receive_path_prefers_relative() {
        let candidates = vec!["/abs/one".to_string(), "rel/two".to_string()];
        assert_eq!(select_receive_path(&candidates), "rel/two");
    }

    #[test]
    fn select_receive_path_falls_back_to_basename() {
        let candidates = vec!["/abs/one/snap".to_string()];
        assert_eq!(select_receive_path(&candidates), "snap");
    }

    #[test]
    fn select_receive_path_synthesizes_anon_when_empty() {
        let candidates: Vec<String> = vec![];
        assert_eq!(select_receive_path(&candidates), "Anon");
    }
}
