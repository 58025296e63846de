use super::*;
use crate::attempt::VariantOutcome;
use crate::capabilities::Candidate;
use crate::config::KilnConfig;
use crate::engine::Engine;
use crate::errors::CapabilityError;
use crate::progress::ProgressEvent;
use crate::test_utils::{
    MockBackend, MockCapabilities, MockGenerator, MockInvocation, MockRanker, MockReporter,
    MockRun,
};
use futures_util::StreamExt;
use std::time::Duration;

fn engine<F>(responder: F, caps: &MockCapabilities, variants: usize) -> Engine
where
    F: Fn(&MockInvocation) -> MockRun + Send + Sync + 'static,
{
    let backend = Arc::new(MockBackend::new(responder));
    backend.add_image("kiln_executor:latest");

    let mut config = KilnConfig::default();
    config.jobs.variants = variants;
    config.retry.max_attempts = 3;
    Engine::with_backend(config, backend, caps.bundle())
}

async fn wait_for_terminal(engine: &Engine, id: JobId) -> Vec<ProgressEvent> {
    let stream = engine.progress().subscribe(&id).unwrap();
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("job did not finish in time")
}

fn succeeding(inv: &MockInvocation) -> MockRun {
    MockRun::exit(0)
        .stdout(&format!("ran {} bytes\n", inv.code.len()))
        .file("result.csv", b"x,y\n1,2\n")
}

fn failing(_: &MockInvocation) -> MockRun {
    MockRun::exit(1).error_file("Traceback\nValueError: always broken\n")
}

fn inputs() -> FileMap {
    let mut files = FileMap::new();
    files.insert("data.csv".to_string(), b"a,b\n1,2\n".to_vec());
    files
}

#[tokio::test]
async fn test_submit_runs_variants_ranks_and_reports() {
    let caps = MockCapabilities::new(MockGenerator::new("print('hi')"))
        .with_ranker(MockRanker::new(Ok(1)));
    let engine = engine(succeeding, &caps, 3);

    let id = engine
        .orchestrator()
        .submit("plot the data".to_string(), inputs())
        .await
        .unwrap();

    let events = wait_for_terminal(&engine, id).await;
    assert_eq!(events.last().unwrap().kind, EventKind::Completed);
    assert!(events.iter().any(|e| e.kind == EventKind::Summary));

    let job = engine.orchestrator().status(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.variants.len(), 3);
    assert!(job.finished_at.is_some());

    let result = job.result.unwrap();
    assert_eq!(result.best_variant, 1);
    assert_eq!(result.code, "print('hi')");
    assert_eq!(result.report, "# Report");
    assert_eq!(
        result.aggregate_files.keys().cloned().collect::<Vec<_>>(),
        vec!["data.csv", "result.csv", "script.py"]
    );
    assert_eq!(result.aggregate_files["script.py"], b"print('hi')".to_vec());

    assert_eq!(caps.generator.calls().generate, 3);
    assert_eq!(caps.ranker.seen(), vec![vec![0, 1, 2]]);
    assert_eq!(caps.reporter.seen().len(), 1);

    let summaries = &caps.generator.calls().file_summaries[0];
    assert_eq!(summaries[0].name, "data.csv");
    assert_eq!(summaries[0].preview.as_deref(), Some("a,b\n1,2\n"));
}

#[tokio::test]
async fn test_no_success_fails_without_ranking() {
    let caps = MockCapabilities::new(MockGenerator::new("broken()"));
    let engine = engine(failing, &caps, 2);

    let id = engine
        .orchestrator()
        .submit("anything".to_string(), FileMap::new())
        .await
        .unwrap();
    let events = wait_for_terminal(&engine, id).await;

    let terminal = events.last().unwrap();
    assert_eq!(terminal.kind, EventKind::Failed);
    assert_eq!(terminal.status, NO_SUCCESS);

    let job = engine.orchestrator().status(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(NO_SUCCESS));
    assert!(job.result.is_none());
    assert!(job.variants.iter().all(|v| matches!(
        v.outcome,
        Some(VariantOutcome::Exhausted { .. })
    )));

    assert!(caps.ranker.seen().is_empty());
    assert!(caps.reporter.seen().is_empty());
}

#[tokio::test]
async fn test_single_success_is_still_ranked() {
    let working = Candidate {
        code: "print('ok')".to_string(),
        dependencies: vec!["Requests".to_string()],
    };
    let generator = MockGenerator::new("broken()").with_candidates(vec![
        Ok(Candidate {
            code: "broken()".to_string(),
            dependencies: vec![],
        }),
        Ok(Candidate {
            code: "broken()".to_string(),
            dependencies: vec![],
        }),
        Ok(working),
    ]);
    let caps = MockCapabilities::new(generator);
    let engine = engine(
        |inv| {
            if inv.code == "print('ok')" {
                MockRun::exit(0)
                    .stdout("ok\n")
                    .error_file("DeprecationWarning: old api\n")
                    .file("plot.png", b"\x89PNG")
            } else {
                failing(inv)
            }
        },
        &caps,
        3,
    );

    let id = engine
        .orchestrator()
        .submit("one works".to_string(), FileMap::new())
        .await
        .unwrap();
    wait_for_terminal(&engine, id).await;

    // Variant tasks generate in spawn order, so the last one got the working code
    assert_eq!(caps.ranker.seen(), vec![vec![2]]);
    let job = engine.orchestrator().status(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_ref().unwrap().best_variant, 2);

    let offered = &caps.ranker.candidates()[0][0];
    assert_eq!(offered.code, "print('ok')");
    assert_eq!(offered.dependencies, vec!["requests"]);
    assert_eq!(offered.outputs.stdout, "ok\n");
    assert_eq!(offered.outputs.stderr, "DeprecationWarning: old api\n");
    assert_eq!(offered.produced_files["plot.png"], b"\x89PNG".to_vec());
}

#[tokio::test]
async fn test_submit_rejects_unplaceable_input_names() {
    let caps = MockCapabilities::new(MockGenerator::new("print(1)"));
    let engine = engine(succeeding, &caps, 3);

    for name in ["../evil.csv", "/etc/passwd", "script.py", "./.kiln_stderr.log"] {
        let mut files = inputs();
        files.insert(name.to_string(), b"x".to_vec());

        let err = engine
            .orchestrator()
            .submit("read it".to_string(), files)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::InvalidInput(_)), "{}: {:?}", name, err);
        assert!(err.to_string().contains(name.trim_start_matches("./")));
    }

    assert!(engine.orchestrator().jobs().await.is_empty());
    assert_eq!(caps.generator.calls().generate, 0);
}

#[tokio::test]
async fn test_ranker_failure_falls_back_to_first_success() {
    for ranker in [
        MockRanker::new(Err(CapabilityError::Parse("no index".to_string()))),
        MockRanker::new(Ok(17)),
    ] {
        let caps = MockCapabilities::new(MockGenerator::new("print(1)")).with_ranker(ranker);
        let engine = engine(succeeding, &caps, 3);

        let id = engine
            .orchestrator()
            .submit("rank me".to_string(), FileMap::new())
            .await
            .unwrap();
        wait_for_terminal(&engine, id).await;

        let job = engine.orchestrator().status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap().best_variant, 0);
    }
}

#[tokio::test]
async fn test_report_failure_fails_the_job() {
    let caps = MockCapabilities::new(MockGenerator::new("print(1)")).with_reporter(
        MockReporter::new(Err(CapabilityError::Service {
            status: 500,
            message: "overloaded".to_string(),
        })),
    );
    let engine = engine(succeeding, &caps, 2);

    let id = engine
        .orchestrator()
        .submit("report".to_string(), FileMap::new())
        .await
        .unwrap();
    let events = wait_for_terminal(&engine, id).await;

    assert_eq!(events.last().unwrap().kind, EventKind::Failed);
    let job = engine.orchestrator().status(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().starts_with("report generation failed"));
}

#[tokio::test]
async fn test_generation_failure_exhausts_only_that_variant() {
    let generator = MockGenerator::new("print(1)").with_candidates(vec![
        Err(CapabilityError::Request("timeout".to_string())),
        Ok(Candidate {
            code: "   ".to_string(),
            dependencies: vec![],
        }),
    ]);
    let caps = MockCapabilities::new(generator);
    let engine = engine(succeeding, &caps, 3);

    let id = engine
        .orchestrator()
        .submit("partial".to_string(), FileMap::new())
        .await
        .unwrap();
    wait_for_terminal(&engine, id).await;

    let job = engine.orchestrator().status(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let summaries = job.summaries();
    assert_eq!(summaries.iter().filter(|s| s.succeeded).count(), 1);
    let failures: Vec<&String> = summaries.iter().filter_map(|s| s.message.as_ref()).collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|m| m.contains("code generation failed")));
    assert!(failures.iter().any(|m| m.contains("empty code")));
    assert!(summaries.iter().filter(|s| !s.succeeded).all(|s| s.attempts == 0));
}

#[tokio::test]
async fn test_generated_dependencies_select_cached_environment() {
    let generator = MockGenerator::new("import requests").with_candidates(vec![Ok(Candidate {
        code: "import requests".to_string(),
        dependencies: vec!["Requests".to_string()],
    })]);
    let caps = MockCapabilities::new(generator);
    let engine = engine(succeeding, &caps, 1);

    let id = engine
        .orchestrator()
        .submit("fetch".to_string(), FileMap::new())
        .await
        .unwrap();
    wait_for_terminal(&engine, id).await;

    let job = engine.orchestrator().status(id).await.unwrap();
    assert_eq!(job.result.unwrap().dependencies, vec!["requests"]);
    assert_eq!(engine.cache().entries().await.len(), 1);
}

#[tokio::test]
async fn test_improve_runs_single_variant_from_winning_code() {
    let generator = MockGenerator::new("print('v1')").with_improvement(Ok("print('v2')".to_string()));
    let caps = MockCapabilities::new(generator);
    let engine = engine(succeeding, &caps, 2);
    let orchestrator = engine.orchestrator();

    let first = orchestrator.submit("task".to_string(), inputs()).await.unwrap();
    wait_for_terminal(&engine, first).await;

    let second = orchestrator
        .improve(first, "add a title".to_string())
        .await
        .unwrap();
    assert_ne!(first, second);
    wait_for_terminal(&engine, second).await;

    let job = orchestrator.status(second).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.parent, Some(first));
    assert_eq!(job.instructions.as_deref(), Some("add a title"));
    assert_eq!(job.variants.len(), 1);
    assert_eq!(job.input_files, inputs());
    assert_eq!(job.result.unwrap().code, "print('v2')");

    let calls = caps.generator.calls();
    assert_eq!(calls.generate, 2);
    assert_eq!(calls.improve, 1);
    assert_eq!(orchestrator.jobs().await.len(), 2);
}

#[tokio::test]
async fn test_improve_rejects_unknown_and_failed_jobs() {
    let caps = MockCapabilities::new(MockGenerator::new("broken()"));
    let engine = engine(failing, &caps, 1);
    let orchestrator = engine.orchestrator();

    let missing = orchestrator
        .improve(Uuid::new_v4(), "anything".to_string())
        .await;
    assert!(matches!(missing, Err(KilnError::JobNotFound(_))));

    let failed = orchestrator.submit("task".to_string(), FileMap::new()).await.unwrap();
    wait_for_terminal(&engine, failed).await;

    let result = orchestrator.improve(failed, "anything".to_string()).await;
    assert!(matches!(result, Err(KilnError::InvalidJobState { .. })));
}

#[tokio::test]
async fn test_status_of_unknown_job() {
    let caps = MockCapabilities::new(MockGenerator::new("print(1)"));
    let engine = engine(succeeding, &caps, 1);

    let result = engine.orchestrator().status(Uuid::new_v4()).await;
    assert!(matches!(result, Err(KilnError::JobNotFound(_))));
}

#[tokio::test]
async fn test_job_level_steps_have_no_variant() {
    let caps = MockCapabilities::new(MockGenerator::new("print(1)"));
    let engine = engine(succeeding, &caps, 1);

    let id = engine
        .orchestrator()
        .submit("steps".to_string(), FileMap::new())
        .await
        .unwrap();
    let events = wait_for_terminal(&engine, id).await;

    for step in [STEP_RANK, STEP_REPORT] {
        let event = events.iter().rev().find(|e| e.step == step).unwrap();
        assert_eq!(event.variant, None);
    }
    let generate = events.iter().find(|e| e.step == STEP_GENERATE).unwrap();
    assert_eq!(generate.variant, Some(0));
}
