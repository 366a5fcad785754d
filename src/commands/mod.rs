//! CLI commands implementation

pub mod extract;
pub mod init;
pub mod query;
pub mod run;
pub mod sources;
pub mod status;

pub use extract::*;
pub use init::*;
pub use query::*;
pub use run::*;
pub use sources::*;
pub use status::*;
