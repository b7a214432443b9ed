#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod monitor;
pub mod report;
pub mod utils;
pub mod vm;

pub use config::Config;
pub use monitor::{run_and_monitor, ExecutionRequest, Monitor, Verdict};
