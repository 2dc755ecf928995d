//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `migrate` | `Migrate`        |
//! | `setup`   | `Setup`          |

pub mod migrate;
pub mod serve;
pub mod setup;

pub use migrate::cmd_migrate;
pub use serve::cmd_serve;
pub use setup::cmd_setup;
