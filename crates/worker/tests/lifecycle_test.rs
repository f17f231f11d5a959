use std::sync::Arc;
use std::time::Duration;

use scheduler_core::SchedulerError;
use scheduler_domain::{WorkerActivity, WorkerKind};
use scheduler_testing_utils::{fast_worker_config, MockChannel};
use scheduler_worker::{HeartbeatManager, WorkerLifecycle};
use tokio::sync::broadcast;

fn lifecycle(channel: &Arc<MockChannel>, tries: u32) -> WorkerLifecycle {
    let mut config = fast_worker_config("main");
    config.registration_tries = tries;
    WorkerLifecycle::new(&config, channel.clone())
}

#[tokio::test]
async fn test_registration_succeeds_first_time() {
    let channel = Arc::new(MockChannel::new());
    let lifecycle = lifecycle(&channel, 3);

    let worker = lifecycle.connect().await.unwrap();
    assert_eq!(worker.name, "test-worker");
    assert_eq!(worker.kind, WorkerKind::Replica);
    assert_eq!(worker.last_activity, WorkerActivity::Register);
    assert_eq!(channel.registration_attempts(), 1);
    assert!(lifecycle.is_registered().await);

    let join = &channel.joins()[0];
    assert_eq!(join.cluster, "main");
    assert_eq!(join.session, lifecycle.session());
}

#[tokio::test]
async fn test_registration_retries_until_success() {
    let channel = Arc::new(MockChannel::new());
    channel.fail_registrations(2);
    let lifecycle = lifecycle(&channel, 5);

    lifecycle.connect().await.unwrap();
    assert_eq!(channel.registration_attempts(), 3);

    // 同一个会话标识贯穿所有重试
    let sessions: Vec<_> = channel.joins().into_iter().map(|j| j.session).collect();
    assert!(sessions.iter().all(|s| s == lifecycle.session()));
}

#[tokio::test]
async fn test_registration_exhaustion_is_terminal() {
    let channel = Arc::new(MockChannel::new());
    channel.always_fail_registration();
    let lifecycle = lifecycle(&channel, 4);

    let err = lifecycle.connect().await.unwrap_err();
    match err {
        SchedulerError::ConnectionExhausted { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(last.contains("registration refused"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(channel.registration_attempts(), 4);
    assert!(!lifecycle.is_registered().await);
}

#[tokio::test]
async fn test_heartbeat_requires_registration() {
    let channel = Arc::new(MockChannel::new());
    let lifecycle = lifecycle(&channel, 1);

    assert!(lifecycle.heartbeat(WorkerActivity::Heartbeat).await.is_err());
    assert!(channel.heartbeats().is_empty());

    lifecycle.connect().await.unwrap();
    let worker = lifecycle.heartbeat(WorkerActivity::Heartbeat).await.unwrap();
    assert_eq!(worker.last_activity, WorkerActivity::Heartbeat);
    assert_eq!(
        channel.heartbeats(),
        vec![("worker-1".to_string(), WorkerActivity::Heartbeat)]
    );
}

#[tokio::test]
async fn test_heartbeat_failures_are_not_fatal() {
    let channel = Arc::new(MockChannel::new());
    let lifecycle = Arc::new(lifecycle(&channel, 1));
    lifecycle.connect().await.unwrap();
    channel.fail_heartbeat(SchedulerError::connection("controller unavailable"));

    let manager = HeartbeatManager::new(lifecycle.clone(), Duration::from_millis(20));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = manager.start_heartbeat_task(shutdown_rx);

    tokio::time::sleep(Duration::from_millis(90)).await;
    let failed = channel.heartbeats().len();
    assert!(failed >= 2, "expected repeated attempts, got {failed}");

    channel.clear_heartbeat_failure();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!handle.is_finished());
    assert_eq!(
        lifecycle.worker().await.map(|w| w.last_activity),
        Some(WorkerActivity::Heartbeat)
    );

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
