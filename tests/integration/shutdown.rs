//! # Shutdown Integration Tests
//!
//! Teardown order, grace periods, forced kills and operator interrupts.

use labstack::launcher::output::OutputOptions;
use labstack::launcher::{
    LaunchEvent, LaunchOutcome, ProcessHandle, ProcessState, ReadinessProbe, ShutdownCoordinator,
    StopOutcome,
};
use labstack::test_harness::{
    free_port, pid_exists, poll_until, sh, sleeper, RecordingListener, TestStack, TestStackConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ignores SIGTERM and announces that the trap is in place.
const STUBBORN: &str = r#"trap "" TERM; echo armed; while true; do sleep 1; done"#;

/// **Test: Operator Interrupt While The GUI Is Pending**
///
/// The interrupt arrives while the last service is still polling. Teardown
/// must begin promptly, stop all three services in reverse order, and the
/// report must mark the pending service as interrupted.
#[tokio::test]
async fn test_interrupt_during_launch() {
    let closed_port = free_port().unwrap();
    let env = TestStack::new();
    let recorder = env.recorder.clone();
    let trigger = env.trigger.clone();

    let launch = env.launch(vec![
        sleeper("instrument-server", 30)
            .with_readiness(ReadinessProbe::fixed_delay(Duration::ZERO)),
        sleeper("data-server", 30).with_readiness(ReadinessProbe::fixed_delay(Duration::ZERO)),
        sleeper("gui", 30)
            .with_readiness(ReadinessProbe::port_open("127.0.0.1", closed_port))
            .with_startup_timeout(Duration::from_secs(20)),
    ]);

    let interrupt = async {
        let gui_spawned = poll_until(Duration::from_secs(5), Duration::from_millis(10), || {
            let recorder = recorder.clone();
            async move {
                recorder
                    .position(|e| matches!(e, LaunchEvent::Spawned { service, .. } if service == "gui"))
            }
        })
        .await;
        assert!(gui_spawned.is_some(), "gui was never spawned");
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.fire();
        Instant::now()
    };

    let (session, fired_at) = tokio::join!(launch, interrupt);
    let session = session.unwrap();
    let teardown_took = fired_at.elapsed();

    let report = session.report();
    assert!(report.interrupted());
    assert_eq!(report.outcome("instrument-server"), Some(&LaunchOutcome::Ready));
    assert_eq!(report.outcome("data-server"), Some(&LaunchOutcome::Ready));
    assert_eq!(report.outcome("gui"), Some(&LaunchOutcome::Interrupted));
    assert_eq!(session.exit_code(), 130);
    assert!(report.summary().ends_with("Result: launch interrupted"));

    assert_eq!(
        env.recorder.stop_order(),
        vec!["gui", "data-server", "instrument-server"]
    );
    // Far below the 20s startup timeout: the launch did not wait it out.
    assert!(teardown_took < Duration::from_secs(3), "{teardown_took:?}");
}

/// **Test: Interrupt Before Anything Starts**
#[tokio::test]
async fn test_interrupt_before_launch_spawns_nothing() {
    let env = TestStack::new();
    env.trigger.fire();

    let session = env
        .launch(vec![sleeper("instrument-server", 30), sleeper("gui", 30)])
        .await
        .unwrap();

    assert!(session.handles().is_empty());
    assert_eq!(
        session.report().outcome("instrument-server"),
        Some(&LaunchOutcome::NotAttempted)
    );
    assert_eq!(session.exit_code(), 130);
}

/// **Test: Stubborn Process Is Killed After The Grace Period**
#[tokio::test]
async fn test_stubborn_service_is_killed_after_grace() {
    let env = TestStack::with_config(TestStackConfig {
        grace_ms: 300,
        ..Default::default()
    });

    let mut session = env
        .launch(vec![
            sh("instrument-server", STUBBORN).with_readiness(ReadinessProbe::log_match("^armed$"))
        ])
        .await
        .unwrap();
    assert!(session.report().succeeded(), "{}", session.report().summary());
    let pid = session.handles()[0].pid().unwrap();

    let started = Instant::now();
    let summary = session.teardown().await;
    let took = started.elapsed();

    assert!(summary.is_clean());
    assert_eq!(summary.forced, vec!["instrument-server"]);
    assert!(took >= Duration::from_millis(300), "{took:?}");
    assert!(took < Duration::from_secs(3), "{took:?}");
    assert!(!pid_exists(pid));
    assert_eq!(
        env.recorder
            .count(|e| matches!(e, LaunchEvent::Stopped { forced: true, .. })),
        1
    );
}

/// **Test: Background Children Of A Wrapper Script Are Stopped**
///
/// The service is a shell that backgrounds the real server and waits on it.
/// Teardown must take the backgrounded process down with the shell.
#[tokio::test]
async fn test_teardown_stops_background_children() {
    let env = TestStack::new();

    let mut session = env
        .launch(vec![sh("instrument-server", "sleep 300 & echo $!; wait")
            .with_readiness(ReadinessProbe::log_match(r"^\d+$"))])
        .await
        .unwrap();
    assert!(session.report().succeeded(), "{}", session.report().summary());

    let server_pid: u32 = session.handles()[0]
        .last_output_line()
        .unwrap()
        .parse()
        .unwrap();
    assert!(pid_exists(server_pid));

    let summary = session.teardown().await;
    assert!(summary.is_clean());
    assert!(summary.forced.is_empty());
    assert!(
        gone_within(server_pid, Duration::from_secs(2)).await,
        "background server {server_pid} outlived teardown"
    );
}

/// A backgrounded child that ignores SIGTERM outlives the shell that started
/// it and is killed once the shell has exited.
#[tokio::test]
async fn test_teardown_kills_children_ignoring_term() {
    let env = TestStack::new();

    let mut session = env
        .launch(vec![sh(
            "data-server",
            r#"(trap "" TERM; while true; do sleep 1; done) & echo $!; wait"#,
        )
        .with_readiness(ReadinessProbe::log_match(r"^\d+$"))])
        .await
        .unwrap();
    assert!(session.report().succeeded(), "{}", session.report().summary());

    let server_pid: u32 = session.handles()[0]
        .last_output_line()
        .unwrap()
        .parse()
        .unwrap();

    let started = Instant::now();
    let summary = session.teardown().await;
    assert!(summary.is_clean());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(
        gone_within(server_pid, Duration::from_secs(2)).await,
        "background server {server_pid} outlived teardown"
    );
}

async fn gone_within(pid: u32, timeout: Duration) -> bool {
    poll_until(timeout, Duration::from_millis(20), || {
        let alive = pid_exists(pid);
        async move { (!alive).then_some(()) }
    })
    .await
    .is_some()
}

/// **Test: A Second Interrupt Skips The Grace Period**
#[tokio::test]
async fn test_second_interrupt_escalates_to_kill() {
    let env = TestStack::with_config(TestStackConfig {
        grace_ms: 10_000,
        ..Default::default()
    });

    let mut session = env
        .launch(vec![
            sh("instrument-server", STUBBORN).with_readiness(ReadinessProbe::log_match("^armed$"))
        ])
        .await
        .unwrap();
    assert!(session.report().succeeded(), "{}", session.report().summary());

    env.trigger.fire();
    let trigger = env.trigger.clone();
    let escalate = async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.fire();
    };

    let started = Instant::now();
    let (summary, _) = tokio::join!(session.teardown(), escalate);

    assert_eq!(summary.forced, vec!["instrument-server"]);
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// **Test: Shutdown Twice Is A No-Op**
#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let recorder = Arc::new(RecordingListener::default());
    let coordinator = ShutdownCoordinator::new(recorder.clone());
    let options = OutputOptions::default();

    let mut handles = vec![
        ProcessHandle::spawn(Arc::new(sleeper("instrument-server", 30)), &options).unwrap(),
        ProcessHandle::spawn(Arc::new(sleeper("data-server", 30)), &options).unwrap(),
    ];

    let first = coordinator
        .shutdown(&mut handles, Duration::from_secs(2))
        .await;
    assert!(first.is_clean());
    assert_eq!(first.stopped, vec!["data-server", "instrument-server"]);
    assert!(handles
        .iter()
        .all(|handle| handle.state() == ProcessState::Stopped));

    let events_after_first = recorder.events().len();
    let second = coordinator
        .shutdown(&mut handles, Duration::from_secs(2))
        .await;
    assert!(second.is_clean());
    assert!(second.stopped.is_empty());
    assert_eq!(recorder.events().len(), events_after_first);
}

/// **Test: Already Exited Processes Are Skipped**
#[tokio::test]
async fn test_exited_handle_is_not_signalled() {
    let options = OutputOptions::default();
    let mut handle = ProcessHandle::spawn(Arc::new(sh("oneshot", "exit 0")), &options).unwrap();

    let exited = poll_until(Duration::from_secs(5), Duration::from_millis(10), || {
        let alive = handle.is_alive();
        async move { (!alive).then_some(()) }
    })
    .await;
    assert!(exited.is_some());

    let outcome = handle.stop(Duration::from_millis(100)).await.unwrap();
    assert_eq!(outcome, StopOutcome::AlreadyExited);
}
