pub mod bootstrap;
pub mod config;
pub mod cron;
pub mod errors;
pub mod infra;
pub mod logging;
pub mod migration;
pub mod notify;
pub mod platform;
pub mod queue;
pub mod server;
pub mod worker;
pub mod ws;
