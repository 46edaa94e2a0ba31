//! End-to-end scenarios driving the full [`Protocol`] against the
//! in-process [`virtual_printer`] simulator.


use std::sync::Arc;
use std::time::Duration;

use reprap_proto::job::LinesJob;
use reprap_proto::state::ProtocolState;
use reprap_proto::{Protocol, ProtocolConfig};
use virtual_printer::{connected_pair, RecordingListener};

/// Polls `condition` until it's true or `timeout` elapses, the way a test
/// against concurrently-running tasks has to since there's no single future
/// to simply `.await`.
async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn s1_connect_reaches_connected_and_grants_credit() {
    let (engine_transport, printer_transport) = connected_pair();
    let listener = RecordingListener::default();
    let protocol = Protocol::new(ProtocolConfig::default(), Arc::new(listener.clone()));

    tokio::spawn(virtual_printer::run_scripted(printer_transport, vec!["start"], |line| {
        if line.body.starts_with("M110") {
            vec!["ok".to_string()]
        } else {
            vec![]
        }
    }));

    protocol.connect(engine_transport).await;

    wait_until(Duration::from_secs(2), || protocol.state() == ProtocolState::Connected).await;

    let events = listener.events();
    assert!(events.contains(&"state:Disconnected->Connecting".to_string()));
    assert!(events.contains(&"state:Connecting->Connected".to_string()));

    protocol.disconnect().await;
}

#[tokio::test]
async fn s2_prints_a_two_line_file_in_order() {
    let (engine_transport, printer_transport) = connected_pair();
    let listener = RecordingListener::default();
    let protocol = Protocol::new(ProtocolConfig::default(), Arc::new(listener));

    let received: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let received_for_script = received.clone();
    tokio::spawn(virtual_printer::run_scripted(printer_transport, vec!["start"], move |line| {
        if !line.body.is_empty() {
            received_for_script.lock().push(line.body.clone());
        }
        vec!["ok".to_string()]
    }));

    protocol.connect(engine_transport).await;
    wait_until(Duration::from_secs(2), || protocol.state() == ProtocolState::Connected).await;

    protocol.process(Box::new(LinesJob::from_lines(vec!["G28".into(), "G1 X10".into()]))).await;

    wait_until(Duration::from_secs(2), || protocol.state() == ProtocolState::Connected).await;

    let bodies = received.lock().clone();
    // First received non-gcode body is the M110 handshake; the job's two
    // lines follow it in order.
    assert!(bodies.iter().any(|b| b == "G28"));
    assert!(bodies.iter().any(|b| b == "G1 X10"));
    let g28_pos = bodies.iter().position(|b| b == "G28").unwrap();
    let g1_pos = bodies.iter().position(|b| b == "G1 X10").unwrap();
    assert!(g28_pos < g1_pos);

    protocol.disconnect().await;
}

#[tokio::test]
async fn s3_resend_mid_print_replays_in_order() {
    let (engine_transport, printer_transport) = connected_pair();
    let listener = RecordingListener::default();
    let protocol = Protocol::new(ProtocolConfig::default(), Arc::new(listener));

    let received: Arc<parking_lot::Mutex<Vec<(Option<u64>, String)>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let received_for_script = received.clone();
    let resend_sent = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let resend_sent_for_script = resend_sent.clone();

    tokio::spawn(virtual_printer::run_scripted(printer_transport, vec!["start"], move |line| {
        if line.body.is_empty() {
            return vec![];
        }
        received_for_script.lock().push((line.line_number, line.body.clone()));
        // Once the third numbered line goes out, ask the engine to replay
        // starting from the second one before acking it.
        if line.line_number == Some(3)
            && !resend_sent_for_script.swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            vec!["Resend: 2".to_string(), "ok".to_string()]
        } else {
            vec!["ok".to_string()]
        }
    }));

    protocol.connect(engine_transport).await;
    wait_until(Duration::from_secs(2), || protocol.state() == ProtocolState::Connected).await;

    protocol
        .process(Box::new(LinesJob::from_lines(vec!["G28".into(), "G1 X10".into(), "G1 X20".into()])))
        .await;

    wait_until(Duration::from_secs(2), || protocol.state() == ProtocolState::Connected).await;
    // Give the resend replay a moment to land after the job itself drains.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = received.lock().clone();
    let line_twos: Vec<_> = seen.iter().filter(|(n, _)| *n == Some(2)).collect();
    assert!(line_twos.len() >= 2, "line 2 should have been resent: {seen:?}");
    let line_threes: Vec<_> = seen.iter().filter(|(n, _)| *n == Some(3)).collect();
    assert!(line_threes.len() >= 2, "line 3 should have been resent after line 2: {seen:?}");

    // The resent body must be byte-identical to the original transmission
    // (P3/S3), not just carry the same line number: a reframed/double-
    // checksummed resend would still satisfy the count assertions above
    // while corrupting the body the firmware actually receives.
    for (_, body) in &line_twos {
        assert_eq!(body.as_str(), "G1 X10", "resent line 2 body must match the original: {seen:?}");
    }
    for (_, body) in &line_threes {
        assert_eq!(body.as_str(), "G1 X20", "resent line 3 body must match the original: {seen:?}");
    }

    protocol.disconnect().await;
}

#[tokio::test]
async fn s5_emergency_stop_writes_twice_then_tears_down() {
    let (engine_transport, printer_transport) = connected_pair();
    let listener = RecordingListener::default();
    let protocol = Protocol::new(ProtocolConfig::default(), Arc::new(listener));

    let received: Arc<parking_lot::Mutex<Vec<(Option<u64>, String)>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let received_for_script = received.clone();
    tokio::spawn(virtual_printer::run_scripted(printer_transport, vec!["start"], move |line| {
        if !line.body.is_empty() {
            received_for_script.lock().push((line.line_number, line.body.clone()));
        }
        vec!["ok".to_string()]
    }));

    protocol.connect(engine_transport).await;
    wait_until(Duration::from_secs(2), || protocol.state() == ProtocolState::Connected).await;

    protocol.emergency_stop().await;

    wait_until(Duration::from_secs(2), || {
        received.lock().iter().filter(|(_, body)| body == "M112").count() >= 2
    })
    .await;

    let stops: Vec<_> = received.lock().iter().filter(|(_, body)| body == "M112").cloned().collect();
    assert_eq!(stops.len(), 2);
    let (n1, _) = stops[0];
    let (n2, _) = stops[1];
    assert_eq!(n2, n1.map(|n| n + 1));

    wait_until(Duration::from_secs(2), || protocol.state() == ProtocolState::DisconnectedWithError).await;
}

#[tokio::test]
async fn s6_firmware_identification_switches_flavor_and_requests_autoreport() {
    let (engine_transport, printer_transport) = connected_pair();
    let listener = RecordingListener::default();
    let protocol = Protocol::new(ProtocolConfig::default(), Arc::new(listener.clone()));

    let received: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let received_for_script = received.clone();
    tokio::spawn(virtual_printer::run_scripted(
        printer_transport,
        vec!["start", "FIRMWARE_NAME:Marlin PROTOCOL_VERSION:1.0", "Cap:AUTOREPORT_TEMP:1"],
        move |line| {
            if !line.body.is_empty() {
                received_for_script.lock().push(line.body.clone());
            }
            if line.body.starts_with("M110") {
                vec!["ok".to_string()]
            } else {
                vec![]
            }
        },
    ));

    protocol.connect(engine_transport).await;
    wait_until(Duration::from_secs(2), || protocol.state() == ProtocolState::Connected).await;

    wait_until(Duration::from_secs(2), || {
        listener.events().iter().any(|e| e.starts_with("firmware:Marlin"))
    })
    .await;

    wait_until(Duration::from_secs(2), || received.lock().iter().any(|b| b.starts_with("M155"))).await;

    protocol.disconnect().await;
}
