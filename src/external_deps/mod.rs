//! Integrations that rely on services outside the process.
//!
//! This module groups the thin adapters the orchestrator talks to: the
//! upstream status api, operator notifications, and raw payload archival.

pub mod archive;
pub mod notify;
pub mod upstream;

pub use archive::{ArchiveError, Archiver, FileArchiver, fingerprint};
pub use notify::{LogNotifier, Notifier, NotifyError};
pub use upstream::{HttpStatusApi, PushError, StatusApi, StatusUpdate};
