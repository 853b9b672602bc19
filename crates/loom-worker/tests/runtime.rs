//! Process-level tests against the real `loom-worker` binary.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use loom_core::{JobId, JobRecord, JobSpec, JobStatus, ProtocolError, Request, RuntimeSpec};
use loom_services::{
    JobOrchestrator, JobOutcome, LaunchCommand, NoopHooks, OrchestratorSettings, ProcessLauncher,
    RequestError, TrainingSupervisor, WorkerClient, WorkerLauncher, WorkerOptions, WorkerState,
};

const WORKER: &str = env!("CARGO_BIN_EXE_loom-worker");

fn options(name: &str) -> WorkerOptions {
    let mut o = WorkerOptions::new(name);
    o.handshake_timeout = Duration::from_secs(10);
    o.exit_grace = Duration::from_secs(2);
    o
}

/// Feed raw stdin to the worker and return its exit code.
async fn exit_code_for(input: &[u8]) -> Option<i32> {
    let mut child = tokio::process::Command::new(WORKER)
        .arg("train")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(input).await.unwrap();
    drop(stdin);
    tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("worker did not exit")
        .unwrap()
        .code()
}

#[tokio::test]
async fn malformed_json_exits_with_code_1() {
    assert_eq!(exit_code_for(b"{\"type\":\"handshake\"}\nnot json\n").await, Some(1));
}

#[tokio::test]
async fn unknown_type_exits_with_code_2() {
    assert_eq!(exit_code_for(b"{\"type\":\"teleport\",\"id\":\"x\"}\n").await, Some(2));
}

#[tokio::test]
async fn closed_stdin_is_a_clean_exit() {
    assert_eq!(exit_code_for(b"").await, Some(0));
}

#[tokio::test]
async fn handshake_load_train_process_save() {
    let dir = tempfile::tempdir().unwrap();
    let arch = dir.path().join("arch.json");
    std::fs::write(&arch, r#"{"learning_rate": 0.5}"#).unwrap();

    let client = ProcessLauncher
        .launch(
            LaunchCommand::new(WORKER).args(["train", arch.to_str().unwrap()]),
            options("rt"),
        )
        .await
        .unwrap();
    assert_eq!(client.handshake().unwrap().name, "loom-worker");
    assert!(client.pid().is_some());

    let data = [("lo", 0.0, 0), ("hi", 1.0, 1), ("lo2", 0.2, 0), ("hi2", 0.8, 1)];
    let mut pending = Vec::new();
    for (id, x, y) in data {
        let reply = client
            .dispatch(
                id,
                Request::Load {
                    input: json!([x, 1.0]),
                    output: json!(y),
                },
            )
            .await
            .unwrap();
        pending.push(reply);
    }
    for reply in pending {
        reply.await.unwrap();
    }

    let ids: Vec<String> = data.iter().map(|(id, _, _)| id.to_string()).collect();
    let mut accuracy = 0.0;
    for i in 0..100 {
        let metrics = client
            .send(
                client.next_request_id("train"),
                Request::Train {
                    ids: ids.clone(),
                    iteration: i,
                },
            )
            .await
            .unwrap();
        accuracy = metrics["accuracy"].as_f64().unwrap();
        if accuracy == 1.0 {
            break;
        }
    }
    assert_eq!(accuracy, 1.0);

    let out = client
        .send("p", Request::Process { ids: vec!["hi".into(), "lo".into()] })
        .await
        .unwrap();
    assert_eq!(out, json!([1, 0]));

    // A failed request leaves the connection usable.
    let err = client
        .send("p2", Request::Process { ids: vec!["nope".into()] })
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Worker(_)));

    let state = dir.path().join("model.json");
    client
        .send(
            "s",
            Request::Save {
                path: state.display().to_string(),
            },
        )
        .await
        .unwrap();
    assert!(state.exists());

    client.kill().await;
    assert_eq!(client.state(), WorkerState::Terminated);
}

#[tokio::test]
async fn unexpected_exit_fails_every_pending_request() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("flaky.sh");
    std::fs::write(
        &script,
        "read hs\n\
         echo '{\"type\":\"handshake\",\"name\":\"flaky\",\"version\":\"0\"}'\n\
         read a\nread b\nread c\n\
         exit 3\n",
    )
    .unwrap();

    let mut client = WorkerClient::new(
        LaunchCommand::new("sh").args([script.to_str().unwrap()]),
        options("flaky"),
    );
    client.start().await.unwrap();

    let mut pending = Vec::new();
    for n in 0..3 {
        pending.push(
            client
                .dispatch(format!("r{n}"), Request::Save { path: "x".into() })
                .await
                .unwrap(),
        );
    }
    for reply in pending {
        let err = reply.await.unwrap_err();
        assert!(
            matches!(
                err,
                RequestError::Protocol(ProtocolError::UnexpectedExit { code: Some(3) })
            ),
            "{err:?}"
        );
    }
    assert_eq!(client.state(), WorkerState::Crashed);
    assert!(matches!(
        client.dispatch("late", Request::Save { path: "x".into() }).await,
        Err(RequestError::NotReady(_) | RequestError::Protocol(_))
    ));
    client.kill().await;
}

#[tokio::test]
async fn supervisor_lifecycle_over_the_real_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let mut sup = TrainingSupervisor::new(
        JobId::from("sup"),
        dir.path().join("sup"),
        RuntimeSpec {
            program: WORKER.into(),
            args: vec!["train".into(), "{artifact}".into()],
            ..Default::default()
        },
        options("sup-train"),
        Arc::new(ProcessLauncher),
    );
    let artifact = sup
        .generate_artifact(&json!({"classes": 2}))
        .await
        .unwrap();
    assert!(artifact.ends_with("architecture.json"));
    sup.start_process().await.unwrap();

    let mut loads = Vec::new();
    for (id, x) in [("a", 0.0), ("b", 1.0)] {
        loads.push(
            sup.load_object(id, json!([x, 1.0]), json!(x as u64))
                .await
                .unwrap(),
        );
    }
    for l in loads {
        l.await.unwrap();
    }
    let ids = vec!["a".to_string(), "b".to_string()];
    let metrics = sup.train_iteration(&ids, 0).await.unwrap();
    assert!(metrics.contains_key("accuracy"));
    assert!(metrics.contains_key("loss"));
    assert_eq!(sup.process_objects(&ids).await.unwrap().len(), 2);
    sup.save_model_state(&dir.path().join("state/model.json"))
        .await
        .unwrap();

    sup.terminate().await;
    sup.terminate().await;
    assert!(sup.check_alive().is_ok());
}

fn write_dataset(path: &Path, n: usize) {
    let text: String = (0..n)
        .map(|i| {
            let x = (i % 10) as f64 / 10.0;
            let label = u8::from(x >= 0.5);
            format!("{{\"id\":\"o{i}\",\"input\":[{x}, 1.0],\"output\":{label}}}\n")
        })
        .collect();
    std::fs::write(path, text).unwrap();
}

#[tokio::test]
async fn full_job_with_transform_and_real_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = dir.path().join("data.jsonl");
    write_dataset(&dataset, 40);

    let spec: JobSpec = serde_json::from_value(json!({
        "name": "e2e",
        "dataset": dataset,
        "architecture": {"learning_rate": 0.5},
        "transform": {"program": WORKER, "args": ["transform", "--scale", "2"]},
        "iterations": 30,
        "test_fraction": 0.25,
    }))
    .unwrap();
    let settings = OrchestratorSettings {
        work_dir: dir.path().join("work"),
        runtime_program: WORKER.into(),
        runtime_args: vec!["train".into(), "{artifact}".into()],
        rolling_window: 5,
        log_tail: 50,
        supervisor: Default::default(),
    };

    let record = JobRecord::new(JobId::from("e2e"), "e2e");
    let (outcome, record) = JobOrchestrator::new(
        record,
        spec,
        settings,
        Arc::new(ProcessLauncher),
        Arc::new(NoopHooks),
        CancellationToken::new(),
    )
    .run()
    .await;

    assert_eq!(outcome, JobOutcome::Complete, "logs: {:?}", record.logs);
    assert_eq!(record.status, JobStatus::Complete);
    assert_eq!(record.iterations.len(), 30);
    assert_eq!(record.results["total"], 10.0);
    assert_eq!(record.results["accuracy"], 1.0);
    assert!(dir.path().join("work/e2e/model.state").exists());
}
