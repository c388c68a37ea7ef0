use rootgate_bootstrap::*;
use rootgate_core::Error;
use rootgate_core::state::CHILD_PID_FILE;
use rootgate_port::PortDriverKind;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const READY: &str = r#"printf '%s\n' '{"type":"namespaces_ready"}' >&3"#;

/// A shell standing in for the child role
fn fake_child(script: &str, state_dir: &Path) -> ParentOptions {
    ParentOptions::new(
        SessionOptions::new(vec!["true".into()]),
        ChildCommand::new("sh", ["-c", script]),
    )
    .with_state_dir(Some(state_dir.to_path_buf()))
}

async fn run(options: ParentOptions) -> rootgate_core::Result<i32> {
    tokio::time::timeout(
        Duration::from_secs(10),
        Coordinator::run(options, CancellationToken::new()),
    )
    .await
    .expect("session did not finish")
}

#[tokio::test]
async fn test_exit_code_is_propagated() {
    let dir = tempfile::tempdir().unwrap();
    let script = format!("{READY}; read -r configure <&3; exit 3");
    assert_eq!(run(fake_child(&script, dir.path())).await.unwrap(), 3);
}

#[tokio::test]
async fn test_child_sees_session_environment() {
    let dir = tempfile::tempdir().unwrap();
    let script = format!(
        r#"[ "$_ROOTGATE_CONTROL_FD" = 3 ] || exit 9
[ "$ROOTGATE_STATE_DIR" = "{}" ] || exit 10
{READY}
read -r configure <&3
case "$configure" in *'"type":"configure"'*) exit 0 ;; esac
exit 11"#,
        dir.path().display()
    );
    assert_eq!(run(fake_child(&script, dir.path())).await.unwrap(), 0);
}

#[tokio::test]
async fn test_silent_exit_is_desync() {
    let dir = tempfile::tempdir().unwrap();
    let err = run(fake_child("exit 0", dir.path())).await.unwrap_err();
    assert!(matches!(err, Error::Desync { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_reported_failure() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"printf '%s\n' '{"type":"failure","message":"cannot unshare"}' >&3; exit 125"#;
    match run(fake_child(script, dir.path())).await {
        Err(Error::ChildSetupFailed { message }) => assert_eq!(message, "cannot unshare"),
        other => panic!("expected child setup failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_exec_failure_code() {
    let dir = tempfile::tempdir().unwrap();
    let script = format!(
        r#"{READY}; read -r configure <&3
printf '%s\n' '{{"type":"exec_failed","message":"cannot execute nope","code":127}}' >&3
exit 127"#
    );
    assert_eq!(run(fake_child(&script, dir.path())).await.unwrap(), 127);
}

#[tokio::test]
async fn test_state_dir_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let script = format!("{READY}; read -r configure <&3; exit 0");
    run(fake_child(&script, dir.path())).await.unwrap();

    assert!(dir.path().is_dir());
    assert!(!dir.path().join(CHILD_PID_FILE).exists());
    // A second session can take the lock
    run(fake_child(&script, dir.path())).await.unwrap();
}

#[tokio::test]
async fn test_cancel_kills_child() {
    let dir = tempfile::tempdir().unwrap();
    let script = format!("{READY}; read -r configure <&3; exec sleep 30");
    let cancel = CancellationToken::new();
    let session = tokio::spawn(Coordinator::run(
        fake_child(&script, dir.path()),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_invalid_options_launch_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("launched");
    let mut options = fake_child(&format!("touch {}", marker.display()), dir.path());
    options.session = options.session.with_port_driver(PortDriverKind::Builtin);

    let err = run(options).await.unwrap_err();
    assert_eq!(err.kind(), "invalid");
    assert_eq!(err.exit_code(), 125);
    assert!(!marker.exists());
}
