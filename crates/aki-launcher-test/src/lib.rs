//! Helpers for testing the launcher services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Dropping it deletes the directory, including any dummy
//!    executables a running process was started from.
//!
//!  - When using [`ping_server`], hold the returned [`Server`] until all requests have been
//!    made. Dropping it stops serving.

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logs: the logger only captures logs from the launcher crates and mutes all other
/// logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("aki_launcher_service=trace,aki_launcher=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes an executable shell script called `name` into `dir` and returns its path.
///
/// `body` is run by `/bin/sh`. Use `exec` for the final command so that the process ID of the
/// script is the one of the command, e.g. `exec sleep 30`.
pub fn dummy_executable(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{body}").unwrap();
    file.sync_all().unwrap();
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    path
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Serves `router` on a random local port.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.addr(), path).parse().unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// How the stub game server answers `/launcher/ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResponse {
    /// A zlib compressed `"pong!"`, like the real server.
    Pong,
    /// An uncompressed `pong!`.
    PlainPong,
    /// Something that is not a pong.
    Garbage,
    /// An internal server error.
    Error,
}

/// Compresses `body` the way the game server compresses its responses.
pub fn zlib(body: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).unwrap();
    encoder.finish().unwrap()
}

/// Spawns a stub game server answering pings with `response`.
pub fn ping_server(response: PingResponse) -> Server {
    let router = Router::new().route(
        "/launcher/ping",
        get(move || async move {
            match response {
                PingResponse::Pong => zlib(b"\"pong!\"").into_response(),
                PingResponse::PlainPong => "pong!".into_response(),
                PingResponse::Garbage => "<html>maintenance</html>".into_response(),
                PingResponse::Error => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }),
    );
    Server::with_router(router)
}
