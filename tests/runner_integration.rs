//! Runner integration tests.
//!
//! These tests drive `CommandRunner` end to end through the in-memory
//! transport: dispatch, bounded waits, output capture, live logging and
//! cleanup.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ssh_runner::transport::fake::{FakeCommand, FakeTransport};
use ssh_runner::{
    CommandRunner, LogContext, OutputSource, PortForward, RunOptions, RunnerError, SessionState,
    Severity,
};

fn setup() -> (Arc<FakeTransport>, Arc<CommandRunner>) {
    let transport = Arc::new(FakeTransport::new("test-host").with_user("tester"));
    let runner = Arc::new(CommandRunner::new(transport.clone()));
    (transport, runner)
}

fn five_seconds() -> RunOptions {
    RunOptions::new().timeout(Duration::from_secs(5))
}

// ============================================================================
// Basic Execution
// ============================================================================

#[test]
fn test_echo_hello() {
    let (_, runner) = setup();
    let result = runner.run_and_wait("echo hello", &five_seconds()).unwrap();

    assert_eq!(result.exit_code(), Some(0));
    assert_eq!(result.stdout(), "hello\n");
    assert_eq!(result.stderr(), "");
    assert!(result.success());
}

#[test]
fn test_nonzero_exit_with_stderr() {
    let (transport, runner) = setup();
    transport.script(
        "ls /missing",
        FakeCommand::exits(2).stderr("ls: cannot access '/missing'\n"),
    );

    let result = runner.run_and_wait("ls /missing", &five_seconds()).unwrap();
    assert_eq!(result.exit_code(), Some(2));
    assert!(result.failed());
    assert_eq!(result.stdout(), "");
    assert!(result.stderr().contains("/missing"));
}

#[test]
fn test_output_without_trailing_newline_is_terminated() {
    let (transport, runner) = setup();
    transport.script("printf", FakeCommand::exits(0).stdout("a\r\nb"));

    let result = runner.run_and_wait("printf", &five_seconds()).unwrap();
    assert_eq!(result.stdout(), "a\nb\n");
}

#[test]
fn test_runner_is_reusable() {
    let (transport, runner) = setup();
    for i in 0..3 {
        let result = runner
            .run_and_wait(&format!("echo run {}", i), &five_seconds())
            .unwrap();
        assert_eq!(result.stdout(), format!("run {}\n", i));
    }
    assert_eq!(transport.executed().len(), 3);
    assert_eq!(transport.open_sessions(), 0);
}

#[test]
fn test_stdout_twice_is_identical() {
    let (_, runner) = setup();
    runner
        .run_command("echo once", &LogContext::default())
        .unwrap();
    runner.wait_for_completion(Some(Duration::from_secs(5)));

    assert_eq!(runner.stdout().unwrap(), "once\n");
    assert_eq!(runner.stdout().unwrap(), "once\n");
}

// ============================================================================
// Timeouts
// ============================================================================

#[test]
fn test_wait_timeout_is_not_an_error() {
    let (transport, runner) = setup();
    let started = Instant::now();
    let result = runner
        .run_and_wait(
            "sleep 10",
            &RunOptions::new().timeout(Duration::from_millis(200)),
        )
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.exit_code(), None);
    assert!(!result.completed());
    assert_eq!(result.stdout(), "");
    assert_eq!(result.stderr(), "");
    assert_eq!(runner.state(), SessionState::Finalized);
    assert_eq!(transport.open_sessions(), 0);

    // Usable afterwards.
    let next = runner.run_and_wait("echo next", &five_seconds()).unwrap();
    assert_eq!(next.exit_code(), Some(0));
}

#[test]
fn test_emergency_timeout_breach_fails_start() {
    let transport =
        Arc::new(FakeTransport::new("slow-host").with_ack_delay(Duration::from_millis(500)));
    let runner = CommandRunner::new(transport.clone())
        .with_emergency_timeout(Some(Duration::from_millis(50)));

    let result = runner.run_and_wait("true", &five_seconds());
    assert!(matches!(result, Err(RunnerError::Transport(_))));
    assert_eq!(runner.state(), SessionState::Idle);
    assert_eq!(transport.open_sessions(), 0);
}

#[test]
fn test_disconnect_gives_unknown_outcome() {
    let (transport, runner) = setup();
    transport.script(
        "tail -f app.log",
        FakeCommand::exits(0).stdout("line 1\n").disconnect(),
    );

    let result = runner
        .run_and_wait("tail -f app.log", &five_seconds())
        .unwrap();
    assert_eq!(result.exit_code(), None);
    assert_eq!(transport.open_sessions(), 0);
}

#[test]
fn test_large_output_does_not_stall_completion() {
    let transport = Arc::new(FakeTransport::new("narrow").with_window(1024));
    let line = format!("{}\n", "log line ".repeat(10));
    let script = (0..500).fold(FakeCommand::exits(0), |cmd, _| cmd.stdout(line.clone()));
    transport.script("verbose-build", script);
    let runner = CommandRunner::new(transport.clone());

    let result = runner
        .run_and_wait("verbose-build", &five_seconds())
        .unwrap();
    assert_eq!(result.exit_code(), Some(0));
    assert_eq!(result.stdout_lines().count(), 500);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_start_without_command() {
    let (_, runner) = setup();
    let result = runner.start(&LogContext::default());
    assert!(matches!(result, Err(RunnerError::NoCommand)));
}

#[test]
fn test_double_start_is_invalid_state() {
    let (_, runner) = setup();
    runner
        .run_command("sleep 5", &LogContext::default())
        .unwrap();
    let result = runner.start(&LogContext::default());
    assert!(matches!(
        result,
        Err(RunnerError::InvalidState {
            state: SessionState::Started,
            ..
        })
    ));
    runner.reset();
}

#[test]
fn test_nul_in_command_is_encoding_error() {
    let (transport, runner) = setup();
    let result = runner.run_and_wait("echo \0", &five_seconds());
    assert!(matches!(result, Err(RunnerError::Encoding { position: 5 })));
    assert_eq!(runner.state(), SessionState::Idle);
    assert!(transport.executed().is_empty());
}

#[test]
fn test_dropped_connection_leaves_runner_idle() {
    let (transport, runner) = setup();
    transport.set_refuse_sessions(true);

    let result = runner.run_and_wait("echo hi", &five_seconds());
    assert!(matches!(result, Err(RunnerError::Transport(_))));
    assert_eq!(runner.state(), SessionState::Idle);
    assert_eq!(runner.command().as_deref(), Some("echo hi"));
}

// ============================================================================
// Concurrency: kill and reset
// ============================================================================

#[test]
fn test_kill_unblocks_waiter() {
    let (_, runner) = setup();
    runner
        .run_command("sleep 30", &LogContext::default())
        .unwrap();

    let waiter = {
        let runner = Arc::clone(&runner);
        thread::spawn(move || runner.wait_for_completion(None))
    };
    thread::sleep(Duration::from_millis(100));
    runner.kill();

    assert_eq!(waiter.join().unwrap(), None);
    assert!(!runner.is_done());
}

#[test]
fn test_reset_during_wait_closes_session() {
    let (transport, runner) = setup();
    runner
        .run_command("sleep 30", &LogContext::default())
        .unwrap();

    let waiter = {
        let runner = Arc::clone(&runner);
        thread::spawn(move || runner.wait_for_completion(None))
    };
    thread::sleep(Duration::from_millis(100));
    runner.reset();

    assert_eq!(waiter.join().unwrap(), None);
    assert_eq!(runner.state(), SessionState::Idle);
    assert_eq!(transport.open_sessions(), 0);
}

#[test]
fn test_reader_and_waiter_on_different_threads() {
    let (transport, runner) = setup();
    transport.script(
        "build",
        FakeCommand::exits(0)
            .stdout("compiling\n")
            .stdout("linking\n")
            .stdout("done\n")
            .chunk_delay(Duration::from_millis(30)),
    );
    runner.run_command("build", &LogContext::default()).unwrap();

    let reader = {
        let runner = Arc::clone(&runner);
        thread::spawn(move || runner.stdout().unwrap())
    };
    let code = runner.wait_for_completion(Some(Duration::from_secs(5)));

    assert_eq!(code, Some(0));
    assert_eq!(reader.join().unwrap(), "compiling\nlinking\ndone\n");
}

// ============================================================================
// Live Logging
// ============================================================================

#[test]
fn test_live_log_matches_direct_capture() {
    let (transport, runner) = setup();
    let script = FakeCommand::exits(0)
        .stdout("one\n")
        .stdout("two\r\n")
        .stdout("three")
        .stderr("warn\n");
    transport.script("report", script);

    let direct = runner.run_and_wait("report", &five_seconds()).unwrap();
    let live = runner
        .run_and_wait("report", &five_seconds().live_log(true))
        .unwrap();

    assert_eq!(direct, live);
    assert_eq!(live.stdout_lines().count(), 3);
}

#[test]
fn test_live_logger_line_counts() {
    let (transport, runner) = setup();
    transport.script(
        "noisy",
        FakeCommand::exits(1)
            .stdout("a\nb\nc\n")
            .stderr("x\n"),
    );
    runner.run_command("noisy", &LogContext::default()).unwrap();
    let logger = runner
        .attach_live_logger(LogContext::new(Severity::Debug, "noisy"))
        .unwrap();

    assert_eq!(runner.wait_for_completion(Some(Duration::from_secs(5))), Some(1));
    assert!(logger.wait_timeout(Duration::from_secs(5)));
    assert_eq!(logger.line_count(OutputSource::Stdout), 3);
    assert_eq!(logger.line_count(OutputSource::Stderr), 1);
    assert_eq!(runner.stdout().unwrap(), "a\nb\nc\n");
}

#[test]
fn test_no_capture_reports_exit_code_only() {
    let (transport, runner) = setup();
    let result = runner
        .run_and_wait("echo secret", &five_seconds().capture_output(false))
        .unwrap();

    assert_eq!(result.exit_code(), Some(0));
    assert_eq!(result.stdout(), "");
    assert_eq!(transport.open_sessions(), 0);
}

// ============================================================================
// Async
// ============================================================================

#[tokio::test]
async fn test_run_and_wait_async() {
    let (_, runner) = setup();
    let result = Arc::clone(&runner)
        .run_and_wait_async("echo async".to_string(), five_seconds())
        .await
        .unwrap();

    assert_eq!(result.stdout(), "async\n");
    assert!(runner.is_done());
}

#[tokio::test]
async fn test_parallel_runners_share_transport() {
    let transport = Arc::new(FakeTransport::new("shared"));
    let mut tasks = Vec::new();
    for i in 0..4 {
        let runner = Arc::new(CommandRunner::new(transport.clone()));
        tasks.push(tokio::spawn(
            runner.run_and_wait_async(format!("echo {}", i), five_seconds()),
        ));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.stdout(), format!("{}\n", i));
    }
    assert_eq!(transport.open_sessions(), 0);
}

#[test]
fn test_async_from_sync_context() {
    let (_, runner) = setup();
    let result = tokio_test::block_on(
        Arc::clone(&runner).run_and_wait_async("exit 7".to_string(), five_seconds()),
    )
    .unwrap();
    assert_eq!(result.exit_code(), Some(7));
}

// ============================================================================
// Port Forwarding
// ============================================================================

#[test]
fn test_forward_held_while_command_runs() {
    let (transport, runner) = setup();
    let forward = PortForward::open(&*transport, "10.0.0.5", 22, 0).unwrap();
    assert_eq!(transport.open_tunnels(), 1);

    let result = runner.run_and_wait("true", &five_seconds()).unwrap();
    assert!(result.success());

    forward.close();
    forward.close();
    assert_eq!(transport.open_tunnels(), 0);
}
