mod lock; // "restore in progress" lock file
mod logic;
pub mod maintenance;
pub(crate) mod verification; // checks run before a restore touches anything

pub use lock::RestoreLock;
pub use logic::{RestoreContext, RestoreService};
pub use maintenance::{FileMaintenanceController, MaintenanceController, MaintenanceGuard};
