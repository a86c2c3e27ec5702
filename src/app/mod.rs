pub mod cancel;
pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod models;
pub mod process;
pub mod report;
pub mod sequence;
pub mod sinks;
