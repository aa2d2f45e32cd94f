//! Connector-level integration tests against the in-process mock backend.

mod support;

use std::sync::Arc;

use opengauss_driver::cancellation::CancelToken;
use opengauss_driver::config::Options;
use opengauss_driver::connector::{Connector, ConnectorState};
use opengauss_driver::errors::Error;
use opengauss_driver::messages::TransactionStatus;

use support::{AuthMode, MockConfig, MockServer};

async fn open(server: &MockServer, extra: &str) -> Connector {
    let options = Options::parse(&server.connection_string(extra)).unwrap();
    let host = options.hosts[0].clone();
    Connector::open(Arc::new(options), host, &CancelToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn open_handshake_reaches_ready() {
    let server = MockServer::start(MockConfig::default()).await;
    let conn = open(&server, "Timeout=5").await;

    assert_eq!(conn.state(), ConnectorState::Ready);
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    let (pid, secret) = conn.backend_key();
    assert!(pid >= 1000);
    assert_eq!(secret, 42);
    assert_eq!(
        conn.server_parameters().server_version(),
        Some("9.2.4 openGauss")
    );
}

#[tokio::test]
async fn simple_select_returns_one_row() {
    let server = MockServer::start(MockConfig::default()).await;
    let mut conn = open(&server, "").await;

    let cancel = CancelToken::new();
    let result = conn
        .execute_collect("SELECT 1", &[], &cancel)
        .await
        .unwrap();

    assert_eq!(result.command_tag.as_deref(), Some("SELECT 1"));
    assert_eq!(result.rows.len(), 1);
    let row = &result.rows[0];
    assert_eq!(row.columns().unwrap(), vec![Some(&b"1"[..])]);
    let description = result.row_description.unwrap();
    assert_eq!(description.fields[0].name, "?column?");
    assert_eq!(conn.state(), ConnectorState::Ready);
}

#[tokio::test]
async fn md5_authentication_succeeds_with_correct_password() {
    let server = MockServer::start(MockConfig {
        auth: AuthMode::Md5 {
            salt: [0x01, 0x02, 0x03, 0x04],
            user: "mock".into(),
            password: "mock".into(),
        },
        ..MockConfig::default()
    })
    .await;

    let conn = open(&server, "").await;
    assert_eq!(conn.state(), ConnectorState::Ready);
}

#[tokio::test]
async fn wrong_password_is_authentication_failed() {
    let server = MockServer::start(MockConfig {
        auth: AuthMode::Md5 {
            salt: [9, 9, 9, 9],
            user: "mock".into(),
            password: "other-password".into(),
        },
        ..MockConfig::default()
    })
    .await;

    let options = Options::parse(&server.connection_string("")).unwrap();
    let host = options.hosts[0].clone();
    let err = Connector::open(Arc::new(options), host, &CancelToken::new())
        .await
        .unwrap_err();
    match err {
        Error::AuthenticationFailed { reason, .. } => {
            assert!(reason.contains("password authentication failed"))
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn tls_refusal_fails_when_ssl_is_required() {
    // The mock always answers the SSLRequest with 'N'.
    let server = MockServer::start(MockConfig::default()).await;
    let options = Options::parse(
        &server.connection_string("SslMode=Require;TrustServerCertificate=true"),
    )
    .unwrap();
    let host = options.hosts[0].clone();
    let err = Connector::open(Arc::new(options), host, &CancelToken::new())
        .await
        .unwrap_err();
    match err {
        Error::ConnectionFailed { reason, .. } => assert!(reason.contains("refused TLS")),
        other => panic!("unexpected {other:?}"),
    }

    // Prefer downgrades to plaintext against the same server.
    let conn = open(&server, "SslMode=Prefer").await;
    assert_eq!(conn.state(), ConnectorState::Ready);
}

#[tokio::test]
async fn server_error_surfaces_and_connector_recovers() {
    let server = MockServer::start(MockConfig::default()).await;
    let mut conn = open(&server, "").await;
    let cancel = CancelToken::new();

    let err = conn
        .execute_collect("BOOM", &[], &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), Some("42601"));
    assert_eq!(conn.state(), ConnectorState::Ready);

    // The error drained to ReadyForQuery; the next command works.
    let result = conn
        .execute_collect("SELECT 7", &[], &cancel)
        .await
        .unwrap();
    assert_eq!(result.rows[0].columns().unwrap(), vec![Some(&b"7"[..])]);
}

#[tokio::test]
async fn auto_prepare_promotes_and_closes_the_lru_victim() {
    let server = MockServer::start(MockConfig::default()).await;
    let mut conn = open(&server, "MaxAutoPrepare=2;AutoPrepareMinUsages=2").await;
    let cancel = CancelToken::new();

    for sql in ["SELECT 1", "SELECT 2", "SELECT 3"] {
        for _ in 0..3 {
            let result = conn.execute_collect(sql, &[], &cancel).await.unwrap();
            assert_eq!(result.rows.len(), 1);
        }
    }

    let state = server.state.lock();
    // Promotions happened in order: _p1 for SELECT 1, _p2, _p3.
    let named: Vec<&str> = state
        .parses
        .iter()
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(named, vec!["_p1", "_p2", "_p3"]);
    // The victim was closed on the wire exactly once, and it was the LRU.
    assert_eq!(state.closes, vec!["_p1".to_string()]);
}

#[tokio::test]
async fn prepared_statements_skip_reparsing() {
    let server = MockServer::start(MockConfig::default()).await;
    let mut conn = open(&server, "MaxAutoPrepare=4;AutoPrepareMinUsages=1").await;
    let cancel = CancelToken::new();

    for _ in 0..5 {
        conn.execute_collect("SELECT 5", &[], &cancel).await.unwrap();
    }

    let state = server.state.lock();
    let parses = state
        .parses
        .iter()
        .filter(|(_, sql)| sql == "SELECT 5")
        .count();
    assert_eq!(parses, 1, "first use prepares, later uses only bind");
}

#[tokio::test]
async fn cancellation_while_blocked_on_rows() {
    let server = MockServer::start(MockConfig::default()).await;
    let mut conn = open(&server, "CancellationTimeout=2000").await;
    let cancel = CancelToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = conn
        .execute_collect("SLEEP 30000", &[], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled), "got {err:?}");
    // Canceled and drained: the connector survived.
    assert_eq!(conn.state(), ConnectorState::Ready);

    let result = conn
        .execute_collect("SELECT 2", &[], &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(result.rows[0].columns().unwrap(), vec![Some(&b"2"[..])]);
}

#[tokio::test]
async fn cancellation_timeout_minus_one_breaks_the_connector() {
    let server = MockServer::start(MockConfig::default()).await;
    let mut conn = open(&server, "CancellationTimeout=-1").await;
    let cancel = CancelToken::new();
    cancel.cancel();

    // Already canceled before submission: rejected outright.
    let err = conn.execute_collect("SELECT 1", &[], &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Canceled));

    // Canceled mid-flight: the connector is sacrificed without waiting.
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = conn
        .execute_collect("SLEEP 30000", &[], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled));
    assert_eq!(conn.state(), ConnectorState::Broken);
}

#[tokio::test]
async fn command_timeout_applies() {
    let server = MockServer::start(MockConfig::default()).await;
    let mut conn = open(&server, "CommandTimeout=1;CancellationTimeout=2000").await;

    let err = conn
        .execute_collect("SLEEP 30000", &[], &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn notices_reach_the_hook_not_the_caller() {
    let server = MockServer::start(MockConfig::default()).await;
    let mut conn = open(&server, "").await;

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    conn.set_notice_hook(move |fields| sink.lock().push(fields.message.clone()));

    let result = conn
        .execute_collect("NOTICE", &[], &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(result.command_tag.as_deref(), Some("SELECT 0"));
    assert_eq!(seen.lock().as_slice(), ["you asked for a notice"]);
}

#[tokio::test]
async fn reset_rolls_back_and_discards() {
    let server = MockServer::start(MockConfig::default()).await;
    let mut conn = open(&server, "").await;

    conn.reset().await.unwrap();
    assert_eq!(conn.state(), ConnectorState::Ready);

    conn.terminate().await;
    assert_eq!(conn.state(), ConnectorState::Closed);
}
