// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

#[cfg(unix)]
pub mod client;
pub mod requests;
#[cfg(unix)]
pub mod server;
pub mod utils;

pub use utils::*;
