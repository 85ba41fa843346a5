//! subvolsync
//!
//! Synchronizes read-only copy-on-write btrfs snapshots between local
//! btrfs, S3, and SSH-tunneled remote-btrfs stores by computing and
//! transferring incremental `btrfs send`/`receive` diffs.
//!
//! # Architecture
//!
//! - [`model`]: shared types (`Volume`, `Diff`, `KnownSizes`) used by every
//!   other module.
//! - [`store`]: the `Store` trait and its three backends (`local`, `s3`,
//!   `ssh`).
//! - [`planner`]: computes the cheapest set of diffs that makes a set of
//!   required volumes reachable at the destination.
//! - [`transfer`]: chunked pump loop moving bytes from a `Store::send`
//!   reader into a `Store::receive` writer.
//! - [`peer`]: wire protocol and server-side dispatch for `--server` mode,
//!   the far end of an `ssh://` store.
//! - [`stream_rewrite`]: patches UUIDs embedded in a raw btrfs send stream.
//! - [`uri`], [`config`], [`progress`], [`humanize`], [`logging`]: smaller
//!   supporting pieces shared across the above.

pub mod config;
pub mod humanize;
pub mod model;
pub mod peer;
pub mod planner;
pub mod progress;
pub mod store;
pub mod stream_rewrite;
pub mod transfer;
pub mod uri;

pub mod logging;

pub use config::SyncOptions;
pub use model::{Diff, KnownSizes, SinkId, Volume};
pub use planner::{plan, plan_with_measurement, Plan, PlannerError};
pub use progress::{ProgressReporter, ShowProgress};
pub use store::{Mode, Store, StoreError};
pub use uri::{StoreUri, UriError};

/// Library version, also reported by the `version` peer-protocol command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
