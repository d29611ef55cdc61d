#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod fetch;
pub mod types;
pub mod utils;
pub mod vfile;
