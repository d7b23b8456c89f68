#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod notify;
pub mod process;
pub mod requests;
pub mod utils;

#[cfg(test)]
use aki_launcher_test as test;
