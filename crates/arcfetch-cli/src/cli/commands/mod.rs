//! CLI command handlers, one file per command.

mod add;
mod checksum;
mod get;
mod pause;
mod remove;
mod resume;
mod run;
mod status;

pub use add::run_add;
pub use checksum::run_checksum;
pub use get::run_get;
pub use pause::run_pause;
pub use remove::run_remove;
pub use resume::run_resume;
pub use run::run_downloads;
pub use status::run_status;
