pub mod archive; // tar.gz bundles of directory trees
pub mod db_dump; // pg_dump / psql wrappers
mod logic;

pub use archive::{ArchiveLayout, ArchiveManifest, FileBackupHandler};
pub use db_dump::DatabaseBackupHandler;
pub use logic::{BackupOptions, BackupService, CleanupReport};
