//! End-to-end tests against the real `graft` binary

use std::process::Command;
use std::time::{Duration, Instant};

use graft_config::SessionConfig;
use graft_core::{DType, Matrix, MessageFormat, SparseMatrix, Value};
use graft_master::{GraftError, Invocable, MasterValue, OutputEcho, ProxyObject, Session};

const GRAFT: &str = env!("CARGO_BIN_EXE_graft");

fn config(format: MessageFormat) -> SessionConfig {
    SessionConfig {
        executable: GRAFT.to_string(),
        message_format: format,
        echo_output: false,
        poll_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(30),
        ..Default::default()
    }
}

async fn session(format: MessageFormat) -> Session {
    Session::launch(config(format)).await.expect("remote should start")
}

fn object(value: MasterValue) -> ProxyObject {
    match value {
        Value::Object(object) => object,
        other => panic!("expected an object, got {:?}", other),
    }
}

#[tokio::test]
async fn test_globals_round_trip_in_both_formats() {
    for format in [MessageFormat::Json, MessageFormat::Cbor] {
        let session = session(format).await;
        let m = Matrix::from_elements(vec![2, 3], &[1i32, 2, 3, 4, 5, 6]).unwrap();
        session.set_global("m", &Value::Matrix(m.clone())).await.unwrap();
        session.set_global("s", &Value::from("text")).await.unwrap();

        assert_eq!(session.get_global("m").await.unwrap(), Value::Matrix(m));
        assert_eq!(session.get_global("s").await.unwrap(), Value::from("text"));
        session.close().await;
    }
}

#[tokio::test]
async fn test_sum_of_zeros_dense_and_sparse() {
    let session = session(MessageFormat::Cbor).await;
    let dense = Matrix::zeros(DType::Float64, vec![1, 256]).unwrap();
    let sparse = SparseMatrix::from_dense(&dense).unwrap();
    assert_eq!(sparse.nnz(), 0);

    let total = session.call("sum", vec![Value::Matrix(dense)]).await.unwrap();
    assert_eq!(total, Value::Float(0.0));
    let total = session.call("sum", vec![Value::Sparse(sparse)]).await.unwrap();
    assert_eq!(total, Value::Float(0.0));
    session.close().await;
}

#[tokio::test]
async fn test_remote_error_carries_identifier_and_stack() {
    let session = session(MessageFormat::Json).await;
    let err = session
        .call(
            "error",
            vec![Value::from("X:undefinedVariable"), Value::from("Undefined x")],
        )
        .await
        .unwrap_err();

    match err {
        GraftError::Remote(remote) => {
            assert_eq!(remote.identifier, "X:undefinedVariable");
            assert_eq!(remote.message, "Undefined x");
            assert!(!remote.stack.is_empty());
            assert!(remote.trace.starts_with("Remote traceback"));
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    // The channel is back in step after the failure
    assert_eq!(session.call("identity", vec![Value::Int(7)]).await.unwrap(), Value::Int(7));
    session.close().await;
}

#[tokio::test]
async fn test_counter_proxies_are_released() {
    let session = session(MessageFormat::Cbor).await;
    let counter = object(session.call("Counter", vec![Value::Int(3)]).await.unwrap());
    assert_eq!(counter.class_name().await.unwrap(), "Counter");

    counter.invoke("increment", vec![]).await.unwrap();
    assert_eq!(counter.get_field("count").await.unwrap(), Value::Float(3.0));

    session.set_global("c", &Value::Object(counter.clone())).await.unwrap();
    let again = object(session.get_global("c").await.unwrap());
    assert_eq!(again, counter);
    assert_eq!(session.live_references(), 1);

    drop(again);
    counter.close().await.unwrap();
    assert_eq!(session.live_references(), 0);
    assert_eq!(session.pending_releases(), 0);
    session.close().await;
}

#[tokio::test]
async fn test_interrupting_a_long_call() {
    let session = session(MessageFormat::Json).await;
    let handle = session.interrupt_handle();
    let interrupter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.interrupt();
    });

    let started = Instant::now();
    let err = session.call("pause", vec![Value::Float(30.0)]).await.unwrap_err();
    assert!(matches!(err, GraftError::Interrupted), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(20));
    interrupter.await.unwrap();

    let total = session
        .call("sum", vec![Value::Matrix(Matrix::row(&[1.0f64, 2.0]))])
        .await
        .unwrap();
    assert_eq!(total, Value::Float(3.0));
    session.close().await;
}

#[tokio::test]
async fn test_remote_output_is_echoed() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let session = Session::launch_with_echo(config(MessageFormat::Cbor), OutputEcho::Channel(tx))
        .await
        .unwrap();
    session.call("disp", vec![Value::Float(42.0)]).await.unwrap();
    let line = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
    assert_eq!(line.as_deref(), Some("42"));
    session.close().await;
}

#[tokio::test]
async fn test_functions_and_namespaces() {
    let session = session(MessageFormat::Cbor).await;
    let numel = session.function("numel");
    let n = numel
        .call(vec![Value::Matrix(Matrix::zeros(DType::Float64, vec![2, 5]).unwrap())])
        .await
        .unwrap();
    assert_eq!(n, Value::Float(10.0));
    assert!(numel.help().await.unwrap().starts_with("numel(x)"));

    let stats = match session.get_or_namespace("stats").await.unwrap() {
        graft_master::Global::Namespace(ns) => ns,
        other => panic!("expected a namespace, got {:?}", other),
    };
    let mean = stats
        .call("mean", vec![Value::Matrix(Matrix::row(&[1.0f64, 2.0, 6.0]))])
        .await
        .unwrap();
    assert_eq!(mean, Value::Float(3.0));
    session.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let session = session(MessageFormat::Json).await;
    session.close().await;
    session.close().await;
    assert!(session.is_closed());
    assert!(matches!(session.get_global("x").await, Err(GraftError::Closed)));
}

fn graft() -> Command {
    let mut command = Command::new(GRAFT);
    command
        .env("GRAFT_EXECUTABLE", GRAFT)
        .env("GRAFT_ECHO_OUTPUT", "false")
        .env("GRAFT_LOG_LEVEL", "warn");
    command
}

#[test]
fn test_cli_call_prints_result() {
    let output = graft().args(["call", "sum", "[1, 2, 3]"]).output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "6");
}

#[test]
fn test_cli_get_after_eval() {
    let output = graft()
        .args(["get", "answer", "--eval", "answer = 42;", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "42");
}

#[test]
fn test_cli_reports_remote_errors() {
    let output = graft()
        .args(["call", "error", "X:undefinedVariable", "Undefined x"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("X:undefinedVariable"), "{}", stderr);
    assert!(stderr.contains("Undefined x"), "{}", stderr);
}

#[test]
fn test_cli_config_generate_and_validate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graft.yaml");
    let path_arg = path.to_str().unwrap();

    let output = graft()
        .args(["config", "generate", "--output", path_arg])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(path.exists());

    let again = graft()
        .args(["config", "generate", "--output", path_arg])
        .output()
        .unwrap();
    assert!(!again.status.success());

    let output = graft()
        .args(["config", "validate", "--config-file", path_arg])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("valid"));
}
