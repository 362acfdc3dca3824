use std::sync::Arc;

use stage_bus::StageState;

use super::Supervisor;
use crate::{config::RelayConfig, params::ParameterUpdate, transform::Passthrough};

fn config() -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".into(),
        websocket_port: 0,
        settings_port: 0,
        server_password: "pw".into(),
        close_timeout_secs: 2,
        warmup_batches: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_build_requires_password() {
    let config = RelayConfig {
        server_password: String::new(),
        ..config()
    };
    assert!(Supervisor::build(config, Arc::new(Passthrough)).await.is_err());
}

#[tokio::test]
async fn test_start_and_shutdown_once() {
    let supervisor = Supervisor::build(config(), Arc::new(Passthrough))
        .await
        .unwrap();
    assert_ne!(supervisor.websocket_addr().port(), 0);
    assert_ne!(supervisor.control_addr().port(), 0);
    assert!(
        supervisor
            .states()
            .iter()
            .all(|(_, s)| *s == StageState::Created)
    );

    supervisor.start().unwrap();
    assert!(supervisor.start().is_err());
    let names: Vec<_> = supervisor.states().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["receiver", "transformer", "broadcaster"]);

    supervisor
        .handle()
        .apply(ParameterUpdate::Seed(9))
        .await
        .unwrap();
    assert_eq!(supervisor.store().snapshot().seed, 9);

    assert!(supervisor.shutdown().await);
    assert!(!supervisor.shutdown().await);
    assert!(
        supervisor
            .states()
            .iter()
            .all(|(_, s)| *s == StageState::Stopped)
    );
    assert!(
        supervisor
            .handle()
            .apply(ParameterUpdate::Seed(10))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_run_returns_after_request() {
    let supervisor = Arc::new(
        Supervisor::build(config(), Arc::new(Passthrough))
            .await
            .unwrap(),
    );
    let runner = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    supervisor.request_shutdown();

    tokio::time::timeout(std::time::Duration::from_secs(10), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!supervisor.shutdown().await);
}
