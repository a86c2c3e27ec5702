pub mod handle;
pub mod locator;
pub mod runner;
