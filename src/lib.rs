pub mod api;
pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod error;
pub mod execution;
pub mod fees;
pub mod jobs;
pub mod middleware;
pub mod oracle;
pub mod recurrence;
pub mod server;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
