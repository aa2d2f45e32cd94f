//! Multiplexed scheduling tests: batching, ordering, isolation.

mod support;

use std::sync::Arc;

use opengauss_driver::cancellation::CancelToken;
use opengauss_driver::config::Options;
use opengauss_driver::pool::Pool;
use serial_test::serial;

use support::{MockConfig, MockServer};

fn pool_for(server: &MockServer, extra: &str) -> Pool {
    let options = Options::parse(&server.connection_string(extra)).unwrap();
    Pool::new(Arc::new(options))
}

#[tokio::test]
#[serial]
async fn hundred_commands_over_four_connectors() {
    let server = MockServer::start(MockConfig::default()).await;
    let pool = pool_for(&server, "Multiplexing=true;MaxPoolSize=4;Timeout=10");
    let baseline = opengauss_driver::stats::global().snapshot();

    let mut tasks = Vec::new();
    for i in 0..100u32 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let result = pool
                .execute(&format!("SELECT {i}"), &[], &CancelToken::new())
                .await
                .unwrap();
            (i, result)
        }));
    }

    for task in tasks {
        let (i, result) = task.await.unwrap();
        // Each command's result routed back to its own handle.
        assert_eq!(
            result.rows[0].columns().unwrap(),
            vec![Some(i.to_string().as_bytes())]
        );
    }

    // All connectors drained back to idle.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let status = pool.status();
    assert_eq!(status.busy, 0);
    assert!(status.total <= 4);
    assert!(server.state.lock().sessions <= 4);

    let snapshot = opengauss_driver::stats::global().snapshot();
    let batches = snapshot.multiplexing_batches_sent - baseline.multiplexing_batches_sent;
    assert!(batches >= 1);
    // 100 commands cannot all have traveled alone.
    assert!(batches < 100, "write coalescing must batch commands");
}

#[tokio::test]
#[serial]
async fn results_route_to_their_handles_on_one_connector() {
    let server = MockServer::start(MockConfig::default()).await;
    let pool = pool_for(&server, "Multiplexing=true;MaxPoolSize=1;Timeout=10");

    let mut tasks = Vec::new();
    for i in 0..20u32 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.execute(&format!("SELECT {i}"), &[], &CancelToken::new())
                .await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let result = task.await.unwrap().unwrap();
        assert_eq!(
            result.rows[0].columns().unwrap(),
            vec![Some(i.to_string().as_bytes())]
        );
    }

    // One connector serviced everything, FIFO.
    assert_eq!(server.state.lock().sessions, 1);
}

#[tokio::test]
#[serial]
async fn command_error_is_isolated_to_its_handle() {
    let server = MockServer::start(MockConfig::default()).await;
    let pool = pool_for(
        &server,
        "Multiplexing=true;MaxPoolSize=2;Timeout=10;MaxAutoPrepare=8;AutoPrepareMinUsages=1",
    );

    let good_token = CancelToken::new();
    let bad_token = CancelToken::new();
    let also_good_token = CancelToken::new();
    let good = pool.execute("SELECT 11", &[], &good_token);
    let bad = pool.execute("BOOM", &[], &bad_token);
    let also_good = pool.execute("SELECT 12", &[], &also_good_token);

    let (good, bad, also_good) = tokio::join!(good, bad, also_good);
    assert_eq!(
        good.unwrap().rows[0].columns().unwrap(),
        vec![Some(&b"11"[..])]
    );
    assert_eq!(bad.unwrap_err().sqlstate(), Some("42601"));
    assert_eq!(
        also_good.unwrap().rows[0].columns().unwrap(),
        vec![Some(&b"12"[..])]
    );
}

#[tokio::test]
#[serial]
async fn canceled_before_write_never_reaches_the_server() {
    let server = MockServer::start(MockConfig::default()).await;
    let pool = pool_for(&server, "Multiplexing=true;MaxPoolSize=1;Timeout=10");

    // Occupy the only connector so the canceled command stays queued.
    let slow = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute("SLEEP 300", &[], &CancelToken::new()).await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = pool
        .execute("SELECT 999", &[], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, opengauss_driver::Error::Canceled));

    slow.await.unwrap().unwrap();
    // The canceled command never hit the wire.
    assert!(!server
        .state
        .lock()
        .queries
        .iter()
        .any(|sql| sql.contains("999")));
}
