//! 📂 Previously, on "Things That Could Go Wrong With A File"...
//!
//! The disk was quiet. Too quiet. A record had been written to a spool
//! directory. Then a batch was appended to an NDJSON file. Then, on a bad day,
//! a compressed backup object landed in a directory tree, via a temp file and
//! a rename, because half-written backups are worse than no backups.
//!
//! This module holds every backend whose durability story is "the filesystem":
//!
//! - [`SpoolQueue`]: one file per record, ack deletes the file, leases expire.
//! - [`FileSink`]: appends each delivered batch as NDJSON. For local runs.
//! - [`DirectoryBackupStore`]: keys become relative paths under a root directory.
//!
//! 💀 Disk full → your problem now
//! 🦆 (mandatory, no notes)

mod directory_backup;
mod file_sink;
mod spool_queue;

pub use directory_backup::DirectoryBackupConfig;
pub(crate) use directory_backup::DirectoryBackupStore;
pub use file_sink::FileSinkConfig;
pub(crate) use file_sink::FileSink;
pub use spool_queue::SpoolQueueConfig;
pub(crate) use spool_queue::SpoolQueue;
