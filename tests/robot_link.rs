//! End-to-end tests: discovery, connection and execution against the
//! virtual robot through the public API.

use botlink_core::core::transport::{
    EndpointScanner, VirtualFactory, VirtualLog, VirtualScanner, WireEvent,
};
use botlink_core::{
    AppConfig, Command, CommandSequence, ConnectionManager, ConnectionStatus, DeviceRegistry,
    DiscoveryOptions, Endpoint, EndpointKind, ExecutionPhase, LineEnding, SequenceExecutor,
};
use std::sync::Arc;
use std::time::Duration;

fn registry() -> DeviceRegistry {
    let serial: Arc<dyn EndpointScanner> = Arc::new(VirtualScanner::new(
        EndpointKind::Serial,
        vec![Endpoint::serial("/dev/rfcomm0", "HC-05")],
    ));
    let ble: Arc<dyn EndpointScanner> = Arc::new(VirtualScanner::new(
        EndpointKind::Ble,
        vec![Endpoint::ble("C8:FD:19:0A:11:22", "LMB-Robot")],
    ));
    DeviceRegistry::new(vec![serial, ble])
}

#[tokio::test(start_paused = true)]
async fn discover_connect_and_run() {
    let registry = registry();
    let endpoints = registry.discover(DiscoveryOptions::default()).await;
    assert_eq!(endpoints.len(), 2);

    let ble = endpoints
        .iter()
        .position(|e| e.kind == EndpointKind::Ble)
        .and_then(|i| registry.select_index(i))
        .unwrap();

    let log = VirtualLog::new();
    let connection = Arc::new(ConnectionManager::new(Arc::new(VirtualFactory::new(log.clone()))));
    connection.select_endpoint(ble.clone());
    connection.connect().await.unwrap();
    assert_eq!(connection.status(), ConnectionStatus::Connected);

    let mut sequence = CommandSequence::new();
    for step in ["forward:2", "speed:9", "left:45", "wait:1", "backward:1"] {
        sequence.push(step.parse().unwrap());
    }

    let executor = SequenceExecutor::new(Arc::clone(&connection));
    let started = tokio::time::Instant::now();
    let outcome = executor.run(sequence.snapshot()).unwrap().wait().await;

    assert_eq!(outcome.phase, ExecutionPhase::Completed);
    assert_eq!(log.frame_symbols(), vec!["F142", "L255", "B255", "S"]);
    assert_eq!(
        started.elapsed(),
        executor.encoder().estimated_duration(sequence.commands())
    );

    // The write target is resolved once, at connect time.
    let prepared = log
        .events()
        .iter()
        .filter(|e| matches!(e, WireEvent::Prepared(_)))
        .count();
    assert_eq!(prepared, 1);
}

#[tokio::test]
async fn switching_endpoints_closes_the_old_link_first() {
    let log = VirtualLog::new();
    let connection = ConnectionManager::new(Arc::new(VirtualFactory::new(log.clone())));
    let serial = Endpoint::serial("/dev/rfcomm0", "HC-05");
    let ble = Endpoint::ble("C8:FD:19:0A:11:22", "LMB-Robot");

    connection.select_endpoint(serial.clone());
    connection.connect().await.unwrap();
    connection.select_endpoint(ble.clone());
    connection.connect().await.unwrap();

    let lifecycle: Vec<WireEvent> = log
        .events()
        .into_iter()
        .filter(|e| !matches!(e, WireEvent::Prepared(_)))
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            WireEvent::Connected(serial.clone()),
            WireEvent::Disconnected(serial),
            WireEvent::Connected(ble.clone()),
        ]
    );
    assert_eq!(connection.connected_endpoint().await, Some(ble));
}

#[tokio::test(start_paused = true)]
async fn configured_line_ending_applies_to_every_frame() {
    let config: AppConfig = toml::from_str(
        r#"
        [execution]
        line_ending = "CrLf"
        default_speed = 1
        "#,
    )
    .unwrap();
    assert_eq!(config.execution.line_ending, LineEnding::CrLf);

    let log = VirtualLog::new();
    let connection = Arc::new(ConnectionManager::new(Arc::new(VirtualFactory::new(log.clone()))));
    connection.select_endpoint(Endpoint::serial("/dev/rfcomm0", "HC-05"));
    connection.connect().await.unwrap();

    let executor = SequenceExecutor::with_settings(connection, &config.execution);
    executor.run(vec![Command::turn_right(90)]).unwrap().wait().await;

    assert_eq!(log.frames(), vec![b"R28\r\n".to_vec(), b"S\r\n".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_sends_only_the_safety_stop() {
    let log = VirtualLog::new();
    let connection = Arc::new(ConnectionManager::new(Arc::new(VirtualFactory::new(log.clone()))));
    connection.select_endpoint(Endpoint::ble("C8:FD:19:0A:11:22", "LMB-Robot"));
    connection.connect().await.unwrap();

    let executor = SequenceExecutor::new(connection);
    let mut events = executor.subscribe();
    let handle = executor
        .run(vec![Command::wait(5), Command::forward(3), Command::stop()])
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.cancel();
    let outcome = handle.wait().await;

    assert_eq!(outcome.phase, ExecutionPhase::Cancelled);
    assert_eq!(log.frame_symbols(), vec!["S"]);

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.phase, ExecutionPhase::Cancelled);
    assert_eq!(last.message.as_deref(), Some("Cancelled after 1 of 3 steps"));
}
