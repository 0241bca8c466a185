//! # Launch Sequence Integration Tests
//!
//! Verifies the order in which services are spawned and resolved, and what
//! happens to the rest of the stack when one of them never becomes ready.

use labstack::launcher::{
    LaunchEvent, LaunchOutcome, ProcessState, ReadinessProbe, ServiceSpec,
};
use labstack::test_harness::{free_port, pid_exists, sh, sleeper, TestStack};
use std::net::TcpListener;
use std::time::Duration;

fn open_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn ready_of(service: &'static str) -> impl Fn(&LaunchEvent) -> bool {
    move |event| matches!(event, LaunchEvent::Ready { service: s, .. } if s == service)
}

fn spawning_of(service: &'static str) -> impl Fn(&LaunchEvent) -> bool {
    move |event| matches!(event, LaunchEvent::Spawning { service: s } if s == service)
}

/// **Test: Full Lab Stack Comes Up In Order**
///
/// Instrument server and data server gate on open ports, the GUI on a zero
/// delay. Every service must be spawned only after its predecessor is ready,
/// and the report must list all three as ready in stack order.
#[tokio::test]
async fn test_full_stack_comes_up_in_order() {
    let (_instruments, instrument_port) = open_port();
    let (_data, data_port) = open_port();
    let env = TestStack::new();

    let mut session = env
        .launch(vec![
            sleeper("instrument-server", 30)
                .with_readiness(ReadinessProbe::port_open("127.0.0.1", instrument_port)),
            sleeper("data-server", 30)
                .with_readiness(ReadinessProbe::port_open("127.0.0.1", data_port)),
            sleeper("gui", 30).with_readiness(ReadinessProbe::fixed_delay(Duration::ZERO)),
        ])
        .await
        .unwrap();

    let report = session.report();
    assert!(report.succeeded(), "{}", report.summary());
    assert_eq!(session.exit_code(), 0);
    assert!(report.summary().contains("3/3 services ready"));

    let order: Vec<&str> = report.entries().iter().map(|e| e.service.as_str()).collect();
    assert_eq!(order, vec!["instrument-server", "data-server", "gui"]);

    let recorder = &env.recorder;
    assert!(
        recorder.position(ready_of("instrument-server")).unwrap()
            < recorder.position(spawning_of("data-server")).unwrap()
    );
    assert!(
        recorder.position(ready_of("data-server")).unwrap()
            < recorder.position(spawning_of("gui")).unwrap()
    );

    assert!(session
        .handles()
        .iter()
        .all(|handle| handle.state() == ProcessState::Running));

    let summary = session.teardown().await;
    assert!(summary.is_clean());
    assert_eq!(
        recorder.stop_order(),
        vec!["gui", "data-server", "instrument-server"]
    );
}

/// **Test: First Service Fails To Spawn**
///
/// A missing executable is a spawn error: nothing after it is attempted and
/// there is nothing to tear down.
#[tokio::test]
async fn test_spawn_failure_aborts_stack() {
    let env = TestStack::new();

    let session = env
        .launch(vec![
            ServiceSpec::new("instrument-server", ["/nonexistent/labstack/nspyre-inserv"])
                .with_readiness(ReadinessProbe::port_open("127.0.0.1", 5556)),
            sleeper("data-server", 30),
            sleeper("gui", 30),
        ])
        .await
        .unwrap();

    let report = session.report();
    assert!(matches!(
        report.outcome("instrument-server"),
        Some(LaunchOutcome::Failed(_))
    ));
    assert_eq!(
        report.outcome("data-server"),
        Some(&LaunchOutcome::NotAttempted)
    );
    assert_eq!(report.outcome("gui"), Some(&LaunchOutcome::NotAttempted));
    assert!(!report.succeeded());
    assert_eq!(session.exit_code(), 1);

    assert!(session.handles().is_empty());
    assert!(env.recorder.stop_order().is_empty());
    assert!(env.recorder.position(spawning_of("data-server")).is_none());

    let summary = report.summary();
    assert!(summary.contains("instrument-server"));
    assert!(summary.contains("not attempted"));
    assert!(summary.ends_with("Result: launch FAILED"));
}

/// **Test: Middle Service Times Out**
///
/// The data server never opens its port. The GUI must never be spawned, and
/// the services that did start are stopped in reverse order.
#[tokio::test]
async fn test_timeout_stops_started_services_in_reverse() {
    let (_instruments, instrument_port) = open_port();
    let closed_port = free_port().unwrap();
    let env = TestStack::new();

    let session = env
        .launch(vec![
            sleeper("instrument-server", 30)
                .with_readiness(ReadinessProbe::port_open("127.0.0.1", instrument_port)),
            sleeper("data-server", 30)
                .with_readiness(ReadinessProbe::port_open("127.0.0.1", closed_port))
                .with_startup_timeout(Duration::from_millis(600)),
            sleeper("gui", 30).with_readiness(ReadinessProbe::fixed_delay(Duration::ZERO)),
        ])
        .await
        .unwrap();

    let report = session.report();
    assert_eq!(
        report.outcome("instrument-server"),
        Some(&LaunchOutcome::Ready)
    );
    assert_eq!(report.outcome("data-server"), Some(&LaunchOutcome::TimedOut));
    assert_eq!(report.outcome("gui"), Some(&LaunchOutcome::NotAttempted));
    assert_eq!(session.exit_code(), 1);

    assert!(env.recorder.position(spawning_of("gui")).is_none());
    assert_eq!(
        env.recorder.stop_order(),
        vec!["data-server", "instrument-server"]
    );

    for handle in session.handles() {
        assert_eq!(handle.state(), ProcessState::Stopped);
        assert!(!pid_exists(handle.pid().unwrap()));
    }
}

/// **Test: Timeout Fires Close To The Configured Budget**
#[tokio::test]
async fn test_port_probe_times_out_within_one_poll_interval() {
    let closed_port = free_port().unwrap();
    let env = TestStack::new();
    let timeout = Duration::from_millis(500);

    let session = env
        .launch(vec![sleeper("data-server", 30)
            .with_readiness(ReadinessProbe::port_open("127.0.0.1", closed_port))
            .with_startup_timeout(timeout)])
        .await
        .unwrap();

    let entry = session.report().entry("data-server").unwrap();
    assert_eq!(entry.outcome, LaunchOutcome::TimedOut);
    assert!(entry.elapsed >= timeout, "elapsed {:?}", entry.elapsed);
    // One 20ms poll interval plus scheduling slack.
    assert!(
        entry.elapsed < timeout + Duration::from_millis(300),
        "elapsed {:?}",
        entry.elapsed
    );
}

/// **Test: Independent Services Start Together**
///
/// A service with `depends_on_previous = false` is spawned right after its
/// predecessor, before either is ready. The next dependent service waits for
/// both.
#[tokio::test]
async fn test_independent_services_share_a_batch() {
    let env = TestStack::new();

    let session = env
        .launch(vec![
            sleeper("instrument-server", 30)
                .with_readiness(ReadinessProbe::fixed_delay(Duration::from_millis(300))),
            sleeper("data-server", 30)
                .with_readiness(ReadinessProbe::fixed_delay(Duration::from_millis(100)))
                .without_dependency(),
            sleeper("gui", 30).with_readiness(ReadinessProbe::fixed_delay(Duration::ZERO)),
        ])
        .await
        .unwrap();

    assert!(session.report().succeeded(), "{}", session.report().summary());

    let recorder = &env.recorder;
    let data_spawn = recorder.position(spawning_of("data-server")).unwrap();
    let instruments_ready = recorder.position(ready_of("instrument-server")).unwrap();
    let data_ready = recorder.position(ready_of("data-server")).unwrap();
    let gui_spawn = recorder.position(spawning_of("gui")).unwrap();

    assert!(data_spawn < instruments_ready);
    assert!(data_ready < instruments_ready);
    assert!(instruments_ready < gui_spawn);

    // Report order follows the stack, not the order services became ready.
    let order: Vec<&str> = session
        .report()
        .entries()
        .iter()
        .map(|e| e.service.as_str())
        .collect();
    assert_eq!(order, vec!["instrument-server", "data-server", "gui"]);
}

/// **Test: Failure Inside A Batch Cancels Its Siblings**
#[tokio::test]
async fn test_batch_failure_cancels_pending_siblings() {
    let closed_port = free_port().unwrap();
    let env = TestStack::new();

    let session = env
        .launch(vec![
            sh("instrument-server", "exit 3")
                .with_readiness(ReadinessProbe::port_open("127.0.0.1", closed_port)),
            sleeper("data-server", 30)
                .with_readiness(ReadinessProbe::port_open("127.0.0.1", closed_port))
                .without_dependency(),
            sleeper("gui", 30),
        ])
        .await
        .unwrap();

    let report = session.report();
    assert!(matches!(
        report.outcome("instrument-server"),
        Some(LaunchOutcome::Failed(_))
    ));
    assert_eq!(report.outcome("data-server"), Some(&LaunchOutcome::Cancelled));
    assert_eq!(report.outcome("gui"), Some(&LaunchOutcome::NotAttempted));
    assert_eq!(env.recorder.stop_order(), vec!["data-server"]);
}

/// **Test: Non-Critical Timeout Does Not Block The Stack**
///
/// The launch keeps going past a non-critical service, the stack stays up,
/// but the report still does not count as a full success.
#[tokio::test]
async fn test_non_critical_timeout_continues() {
    let closed_port = free_port().unwrap();
    let env = TestStack::new();

    let mut session = env
        .launch(vec![
            sleeper("instrument-server", 30)
                .with_readiness(ReadinessProbe::fixed_delay(Duration::ZERO)),
            sleeper("camera-relay", 30)
                .with_readiness(ReadinessProbe::port_open("127.0.0.1", closed_port))
                .with_startup_timeout(Duration::from_millis(200))
                .non_critical(),
            sleeper("gui", 30).with_readiness(ReadinessProbe::fixed_delay(Duration::ZERO)),
        ])
        .await
        .unwrap();

    let report = session.report();
    assert_eq!(report.outcome("camera-relay"), Some(&LaunchOutcome::TimedOut));
    assert_eq!(report.outcome("gui"), Some(&LaunchOutcome::Ready));
    assert!(!report.succeeded());
    assert!(report.stack_usable());
    assert_eq!(session.exit_code(), 1);
    assert!(report.summary().contains("[non-critical]"));

    // Nothing was torn down at launch time.
    assert!(env.recorder.stop_order().is_empty());
    assert_eq!(
        session.handle("gui").map(|h| h.state()),
        Some(ProcessState::Running)
    );

    session.teardown().await;
    assert_eq!(
        env.recorder.stop_order(),
        vec!["gui", "camera-relay", "instrument-server"]
    );
}
