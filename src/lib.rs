//! Device-to-device account migration.
//!
//! Two peers exchange media files, settings, the account database and the
//! secure account blobs over a resumable, windowed transfer protocol, then
//! each installs what it received with a crash-safe commit.

pub mod cli;
pub mod commit;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transfer;
pub mod transport;

pub use commit::{recover, MigrationEnv, Recovery};
pub use config::MigrationConfig;
pub use error::{MigrationError, Result};
pub use session::{Role, SessionHandle, State, Status};
