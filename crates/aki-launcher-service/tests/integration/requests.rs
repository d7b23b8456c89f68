use std::net::SocketAddr;
use std::time::{Duration, Instant};

use aki_launcher_service::requests::{HttpServerRequester, RequestError, ServerRequester};
use aki_launcher_test as test;

use crate::{ping_server, PingResponse};

fn requester() -> HttpServerRequester {
    HttpServerRequester::new(Duration::ZERO).unwrap()
}

#[tokio::test]
async fn test_ping_compressed_pong() {
    test::setup();
    let server = ping_server(PingResponse::Pong);

    let ping = requester().ping(server.addr()).await.unwrap();
    assert!(ping.is_some());
}

#[tokio::test]
async fn test_ping_plain_pong() {
    test::setup();
    let server = ping_server(PingResponse::PlainPong);

    let ping = requester().ping(server.addr()).await.unwrap();
    assert!(ping.is_some());
}

#[tokio::test]
async fn test_ping_unexpected_answer() {
    test::setup();
    let server = ping_server(PingResponse::Garbage);

    let ping = requester().ping(server.addr()).await.unwrap();
    assert_eq!(ping, None);
}

#[tokio::test]
async fn test_ping_error_status() {
    test::setup();
    let server = ping_server(PingResponse::Error);

    let result = requester().ping(server.addr()).await;
    assert!(matches!(
        result,
        Err(RequestError::Status(status)) if status.as_u16() == 500
    ));
}

/// Returns an address nothing listens on.
fn closed_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_ping_refused() {
    test::setup();
    let address = closed_address();

    let result = requester().ping(address).await;
    assert!(matches!(result, Err(RequestError::Transport(_))));
}

#[tokio::test]
async fn test_ping_retries_within_connect_window() {
    test::setup();
    let address = closed_address();
    let requester = HttpServerRequester::new(Duration::from_millis(300))
        .unwrap()
        .with_retry_interval(Duration::from_millis(50));

    let started = Instant::now();
    let result = requester.ping(address).await;

    assert!(matches!(result, Err(RequestError::Transport(_))));
    assert!(started.elapsed() >= Duration::from_millis(300));
}
