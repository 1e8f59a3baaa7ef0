//! End-to-end tests of the WebSocket transport against an in-process
//! Socket.IO server.


use std::time::Duration;

use serde_json::{json, Value};
use slurm_dash::config::ClientConfig;
use slurm_dash::connection::transport::run_transport;
use slurm_dash::events;
use slurm_dash::pages::{Page, PageKind, PageOutcome};
use slurm_dash::requests;
use slurm_dash::{Connection, ConnectionState, Session, Visibility};
use test_harness::{assert_eventually, count, counter, test_client_config, FakeServer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Running {
    conn: Connection,
    shutdown: CancellationToken,
    transport: JoinHandle<()>,
}

impl Running {
    fn start(config: ClientConfig) -> Self {
        let (conn, outbound_rx) = Connection::new();
        let shutdown = CancellationToken::new();
        let transport = tokio::spawn(run_transport(
            conn.clone(),
            outbound_rx,
            config,
            shutdown.clone(),
        ));
        Self {
            conn,
            shutdown,
            transport,
        }
    }

    async fn wait_connected(&self) {
        let conn = self.conn.clone();
        assert_eventually(
            move || {
                let conn = conn.clone();
                async move { conn.is_connected() }
            },
            WAIT,
            "transport never connected",
        )
        .await;
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.transport)
            .await
            .expect("transport did not stop")
            .expect("transport task panicked");
    }
}

#[tokio::test]
async fn test_connects_and_receives_server_greeting() {
    let server = FakeServer::start().await;
    let running = Running::start(test_client_config(server.addr));

    let session = Session::new("greeting", running.conn.clone(), Visibility::default());
    let (greetings, bump) = counter();
    session.on(events::CONNECTED, move |_: &Value| bump());

    running.wait_connected().await;
    assert_eq!(server.connections(), 1);

    let greetings_seen = greetings.clone();
    assert_eventually(
        move || {
            let greetings = greetings_seen.clone();
            async move { count(&greetings) == 1 }
        },
        WAIT,
        "server greeting not dispatched",
    )
    .await;

    drop(session);
    running.stop().await;
}

#[tokio::test]
async fn test_request_round_trip() {
    let server = FakeServer::start().await;
    let running = Running::start(test_client_config(server.addr));
    let session = Session::new("cli", running.conn.clone(), Visibility::default());

    // Sent as soon as the handshake completes.
    let response = session
        .request(
            events::GET_JOB,
            requests::job_id("5"),
            events::JOB_DETAILS,
            WAIT,
        )
        .await
        .unwrap();

    assert_eq!(response, json!({"success": true, "echo": {"job_id": "5"}}));
    assert_eq!(
        server.received(),
        vec![(events::GET_JOB.to_string(), json!({"job_id": "5"}))]
    );

    drop(session);
    running.stop().await;
}

#[tokio::test]
async fn test_page_refreshes_after_server_drop() {
    let server = FakeServer::start().await;
    let config = test_client_config(server.addr);
    let running = Running::start(config.clone());

    let (_page, mut updates) = Page::activate(
        PageKind::Jobs,
        running.conn.clone(),
        Visibility::default(),
        &config,
    )
    .unwrap();

    let first = tokio::time::timeout(WAIT, updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.event, events::JOBS_LIST);
    assert!(matches!(first.outcome, PageOutcome::Data(_)));
    assert_eq!(server.received_count(events::JOIN_SLURM_ROOM), 1);
    assert_eq!(server.received_count(events::GET_JOBS), 1);

    server.kick_all();

    let lost = tokio::time::timeout(WAIT, updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lost.event, events::DISCONNECT);
    assert!(matches!(lost.outcome, PageOutcome::ConnectionLost(_)));

    let refreshed = tokio::time::timeout(WAIT, updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.event, events::JOBS_LIST);
    assert_eq!(server.connections(), 2);
    assert_eq!(server.received_count(events::JOIN_SLURM_ROOM), 2);
    assert_eq!(server.received_count(events::GET_JOBS), 2);

    running.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_connection() {
    let server = FakeServer::start().await;
    let running = Running::start(test_client_config(server.addr));
    running.wait_connected().await;

    let conn = running.conn.clone();
    running.stop().await;

    assert!(conn.is_closed());
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let session = Session::new("late", conn.clone(), Visibility::default());
    session.on(events::JOBS_LIST, |_: &Value| {});
    assert_eq!(session.binding_count(), 0);
}

#[tokio::test]
async fn test_unreachable_server_reports_connect_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let running = Running::start(test_client_config(addr));
    let session = Session::new("probe", running.conn.clone(), Visibility::default());
    let (errors, bump) = counter();
    session.on(events::CONNECT_ERROR, move |_: &Value| bump());

    // Each failed attempt reports once; backoff keeps retrying.
    let errors_seen = errors.clone();
    assert_eventually(
        move || {
            let errors = errors_seen.clone();
            async move { count(&errors) >= 2 }
        },
        WAIT,
        "connect errors not reported",
    )
    .await;
    assert!(!running.conn.is_connected());

    drop(session);
    running.stop().await;
}

#[tokio::test]
async fn test_invalid_url_closes_connection() {
    let running = Running::start(ClientConfig::new("ftp://cluster.example"));
    let conn = running.conn.clone();
    running.stop().await;
    assert!(conn.is_closed());
}
