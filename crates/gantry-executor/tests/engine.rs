//! End-to-end engine tests against the scripted runtime and recording
//! client.

use std::sync::Arc;
use std::time::Duration;

use gantry_client::MockClient;
use gantry_core::{
    BuildPackage, BuildRecord, Container, Error, Network, Pipeline, Repo, Rules, Ruleset, Secret,
    SecretRef, SecretSpec, Stage, Status, Volume,
};
use gantry_executor::{Engine, EngineConfig};
use gantry_runtime::MockRuntime;

fn init_step() -> Container {
    Container {
        id: "step_1_init".to_string(),
        name: "init".to_string(),
        number: 1,
        image: "#init".to_string(),
        ..Default::default()
    }
}

fn step(number: i64, name: &str) -> Container {
    Container {
        id: format!("step_{number}_{name}"),
        name: name.to_string(),
        number,
        image: "alpine:latest".to_string(),
        commands: vec!["echo hello".to_string()],
        ..Default::default()
    }
}

fn service(number: i64, name: &str) -> Container {
    Container {
        id: format!("service_{number}_{name}"),
        name: name.to_string(),
        number,
        image: "postgres:16".to_string(),
        detach: true,
        ..Default::default()
    }
}

fn pipeline(stages: Vec<Stage>, services: Vec<Container>) -> Pipeline {
    Pipeline {
        id: "octocat_1".to_string(),
        version: "1".to_string(),
        stages,
        services,
        volume: Volume {
            name: "vol_octocat_1".to_string(),
            ..Default::default()
        },
        network: Network {
            name: "net_octocat_1".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn one_stage(steps: Vec<Container>) -> Pipeline {
    pipeline(
        vec![Stage {
            name: "build".to_string(),
            steps,
            ..Default::default()
        }],
        Vec::new(),
    )
}

fn package(pipeline: Pipeline) -> BuildPackage {
    BuildPackage {
        build: BuildRecord {
            number: 1,
            event: "push".to_string(),
            branch: "main".to_string(),
            ..Default::default()
        },
        repo: Repo {
            org: "octocat".to_string(),
            name: "hello".to_string(),
            full_name: "octocat/hello".to_string(),
            branch: "main".to_string(),
            ..Default::default()
        },
        pipeline,
        ..Default::default()
    }
}

fn engine(package: BuildPackage) -> (Arc<Engine>, Arc<MockRuntime>, Arc<MockClient>) {
    let runtime = Arc::new(MockRuntime::new());
    let client = Arc::new(MockClient::new());
    let engine = Engine::new(
        EngineConfig {
            hostname: "worker-1".to_string(),
            server: "https://ci.example.com".to_string(),
            threads: 2,
            ..Default::default()
        },
        runtime.clone(),
        client.clone(),
        package,
    );
    (Arc::new(engine), runtime, client)
}

fn assert_uploads_grow(uploads: &[Vec<u8>]) {
    for pair in uploads.windows(2) {
        assert!(
            pair[1].starts_with(&pair[0]),
            "each log upload must extend the previous one"
        );
    }
}

#[tokio::test]
async fn happy_path_reports_success() {
    let (engine, runtime, client) = engine(package(one_stage(vec![
        init_step(),
        step(2, "one"),
        step(3, "two"),
    ])));
    runtime.script_tail("step_2_one", &[b"hello\n".to_vec()]);
    runtime.script_tail("step_3_two", &[b"world\n".to_vec()]);

    engine.run().await.unwrap();

    let build = client.last_build().unwrap();
    assert_eq!(build.status, Status::Success);
    assert!(build.finished >= build.started);

    for number in [2, 3] {
        let record = client.last_step(number).unwrap();
        assert_eq!(record.status, Status::Success);
        assert_eq!(record.exit_code, 0);
        assert!(record.started > 0);
        assert!(record.finished >= record.started);
    }

    // The init marker is reported but never gets a container.
    assert_eq!(client.last_step(1).unwrap().status, Status::Success);
    assert_eq!(runtime.setups(), vec!["step_2_one", "step_3_two"]);
    assert_eq!(runtime.removes(), runtime.setups());

    assert_uploads_grow(&client.step_log_uploads(2));
    assert_eq!(client.step_log_uploads(2).last().unwrap().as_slice(), b"hello\n");
}

#[tokio::test]
async fn failing_step_skips_the_rest() {
    let (engine, runtime, client) = engine(package(one_stage(vec![
        init_step(),
        step(2, "one"),
        step(3, "two"),
    ])));
    runtime.script_exit("step_2_one", 7);

    // A non-zero exit is a step outcome, not an engine error.
    engine.run().await.unwrap();

    let failed = client.last_step(2).unwrap();
    assert_eq!(failed.status, Status::Failure);
    assert_eq!(failed.exit_code, 7);

    assert_eq!(client.last_step(3).unwrap().status, Status::Skipped);
    assert_eq!(client.last_build().unwrap().status, Status::Failure);

    // Both containers were set up at assemble and both were removed.
    assert_eq!(runtime.setups().len(), 2);
    assert_eq!(runtime.removes(), runtime.setups());
}

#[tokio::test]
async fn continue_on_error_does_not_poison_later_steps() {
    let mut flaky = step(2, "one");
    flaky.ruleset = Ruleset {
        continue_on_error: true,
        ..Default::default()
    };
    let (engine, runtime, client) =
        engine(package(one_stage(vec![init_step(), flaky, step(3, "two")])));
    runtime.script_exit("step_2_one", 7);

    engine.run().await.unwrap();

    assert_eq!(client.last_step(2).unwrap().status, Status::Failure);
    assert_eq!(client.last_step(3).unwrap().status, Status::Success);
    // The build still aggregates the most severe non-skipped outcome.
    assert_eq!(client.last_build().unwrap().status, Status::Failure);
}

#[tokio::test(start_paused = true)]
async fn cancellation_kills_the_running_step() {
    let (engine, runtime, client) = engine(package(one_stage(vec![
        init_step(),
        step(2, "one"),
        step(3, "two"),
    ])));
    runtime.hold_container("step_2_one");

    let token = engine.cancellation_token();
    let running: tokio::task::JoinHandle<Result<(), Error>> = tokio::spawn(Box::pin({
        let engine = engine.clone();
        async move { engine.run().await }
    }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = running.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    assert_eq!(client.last_step(2).unwrap().status, Status::Killed);
    assert_eq!(client.last_step(3).unwrap().status, Status::Skipped);
    assert_eq!(client.last_build().unwrap().status, Status::Killed);

    // Everything that entered setup was removed despite cancellation.
    assert_eq!(runtime.setups().len(), 2);
    assert_eq!(runtime.removes(), runtime.setups());
}

#[tokio::test]
async fn log_flushes_honor_the_threshold() {
    let (engine, runtime, client) =
        engine(package(one_stage(vec![init_step(), step(2, "one")])));

    let mut burst = vec![b'x'; 1199];
    burst.push(b'\n');
    runtime.script_tail("step_2_one", &[burst.clone(), burst.clone(), burst]);

    engine.run().await.unwrap();

    let uploads = client.step_log_uploads(2);
    assert!(uploads.len() >= 3, "expected one flush per burst");
    assert_uploads_grow(&uploads);
    assert_eq!(uploads.last().unwrap().len(), 3600);
}

#[tokio::test(start_paused = true)]
async fn detached_service_outlives_steps() {
    let stages = vec![Stage {
        name: "build".to_string(),
        steps: vec![init_step(), step(2, "one")],
        ..Default::default()
    }];
    let (engine, runtime, client) =
        engine(package(pipeline(stages, vec![service(1, "db")])));
    runtime.script_tail("service_1_db", &[b"ready\n".to_vec()]);
    runtime.hold_container("service_1_db");

    engine.run().await.unwrap();

    // The service is never waited on and is removed only at teardown,
    // after the step containers.
    assert_eq!(runtime.setups(), vec!["service_1_db", "step_2_one"]);
    assert_eq!(
        runtime.removes(),
        vec!["step_2_one".to_string(), "service_1_db".to_string()]
    );

    let db = client.last_service(1).unwrap();
    assert_eq!(db.status, Status::Success);
    assert!(db.started > 0);

    // Its tail streamed until the build-scope token ended it.
    assert_eq!(client.service_log_uploads(1).last().unwrap().as_slice(), b"ready\n");
    assert_eq!(client.last_build().unwrap().status, Status::Success);
}

#[tokio::test(start_paused = true)]
async fn transient_setup_errors_retry_with_backoff() {
    let (engine, runtime, client) =
        engine(package(one_stage(vec![init_step(), step(2, "one")])));
    runtime.fail_setup("step_2_one", 2);

    let began = tokio::time::Instant::now();
    engine.run().await.unwrap();

    // Two transient failures cost at least the first two backoff delays.
    assert!(began.elapsed() >= Duration::from_millis(300));
    assert_eq!(client.last_step(2).unwrap().status, Status::Success);
    assert_eq!(runtime.setups(), vec!["step_2_one"]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_setup_aborts_but_still_cleans_up() {
    let (engine, runtime, client) = engine(package(one_stage(vec![
        init_step(),
        step(2, "one"),
        step(3, "two"),
    ])));
    runtime.fail_setup("step_3_two", 99);

    let result = engine.run().await;
    assert!(matches!(result, Err(Error::RuntimeUnavailable(_))));

    // Only the first step entered setup, and exactly that set was removed.
    assert_eq!(runtime.setups(), vec!["step_2_one"]);
    assert_eq!(runtime.removes(), runtime.setups());

    // Execution never began, so both steps close out as skipped.
    assert_eq!(client.last_step(2).unwrap().status, Status::Skipped);
    assert_eq!(client.last_step(3).unwrap().status, Status::Skipped);
    assert_eq!(client.last_build().unwrap().status, Status::Failure);

    let (created, removed) = runtime.networks();
    assert_eq!((created, removed), (1, 1));
}

#[tokio::test]
async fn needs_cycles_are_caught_at_plan_time() {
    let stages = vec![
        Stage {
            name: "a".to_string(),
            needs: vec!["b".to_string()],
            steps: vec![step(1, "one")],
        },
        Stage {
            name: "b".to_string(),
            needs: vec!["a".to_string()],
            steps: vec![step(2, "two")],
        },
    ];
    let (engine, runtime, _client) = engine(package(pipeline(stages, Vec::new())));

    let result = engine.run().await;
    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

    // Detection precedes any runtime resource creation.
    assert!(runtime.setups().is_empty());
    assert_eq!(runtime.volumes().0, 0);
}

#[tokio::test]
async fn stages_run_in_dependency_order() {
    let stages = vec![
        Stage {
            name: "deploy".to_string(),
            needs: vec!["build".to_string(), "lint".to_string()],
            steps: vec![step(4, "ship")],
        },
        Stage {
            name: "build".to_string(),
            steps: vec![init_step(), step(2, "compile")],
            ..Default::default()
        },
        Stage {
            name: "lint".to_string(),
            steps: vec![step(3, "check")],
            ..Default::default()
        },
    ];
    let (engine, runtime, client) = engine(package(pipeline(stages, Vec::new())));

    engine.run().await.unwrap();

    assert_eq!(client.last_build().unwrap().status, Status::Success);
    for number in [2, 3, 4] {
        assert_eq!(client.last_step(number).unwrap().status, Status::Success);
    }
    assert_eq!(
        runtime.runs().last().map(String::as_str),
        Some("step_4_ship")
    );
}

#[tokio::test]
async fn secrets_inject_into_permitted_containers() {
    let mut target = step(2, "one");
    target.secrets = vec![SecretRef {
        source: "token".to_string(),
        target: "API_TOKEN".to_string(),
    }];
    let mut pipeline = one_stage(vec![init_step(), target]);
    pipeline.secrets = vec![SecretSpec {
        name: "token".to_string(),
        key: "octocat/token".to_string(),
        engine: "native".to_string(),
        ..Default::default()
    }];

    let (engine, runtime, client) = engine(package(pipeline));
    client.seed_secret(
        "native",
        "octocat/token",
        Secret {
            name: "token".to_string(),
            value: "s3cr3t".to_string(),
            ..Default::default()
        },
    );

    engine.run().await.unwrap();

    let created = runtime.setup_containers();
    let env = &created[0].environment;
    assert_eq!(env["API_TOKEN"], "s3cr3t");
    assert_eq!(env["BUILD_HOST"], "worker-1");
    assert_eq!(env["VELA_HOST"], "https://ci.example.com");
    assert_eq!(env["VELA_RUNTIME"], "mock");
    assert_eq!(env["VELA_DISTRIBUTION"], std::env::consts::OS);
}

#[tokio::test]
async fn restricted_secret_refuses_foreign_container() {
    let mut target = step(2, "one");
    target.secrets = vec![SecretRef {
        source: "deploy_key".to_string(),
        target: "KEY".to_string(),
    }];
    let mut pipeline = one_stage(vec![init_step(), target]);
    pipeline.secrets = vec![SecretSpec {
        name: "deploy_key".to_string(),
        key: "octocat/deploy_key".to_string(),
        engine: "native".to_string(),
        ..Default::default()
    }];

    let (engine, runtime, client) = engine(package(pipeline));
    client.seed_secret(
        "native",
        "octocat/deploy_key",
        Secret {
            name: "deploy_key".to_string(),
            value: "s3cr3t".to_string(),
            origin: Some("deploy".to_string()),
            ..Default::default()
        },
    );

    let result = engine.run().await;
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
    assert!(runtime.setups().is_empty());
    assert_eq!(client.last_build().unwrap().status, Status::Failure);
}

#[tokio::test]
async fn step_updates_for_one_step_are_totally_ordered() {
    let (engine, _runtime, client) =
        engine(package(one_stage(vec![init_step(), step(2, "one")])));

    engine.run().await.unwrap();

    let statuses: Vec<Status> = client
        .step_updates()
        .into_iter()
        .filter(|record| record.number == 2)
        .map(|record| record.status)
        .collect();
    assert_eq!(statuses, vec![Status::Pending, Status::Running, Status::Success]);
}

#[tokio::test]
async fn rejected_initial_update_fails_create() {
    let (engine, runtime, client) =
        engine(package(one_stage(vec![init_step(), step(2, "one")])));
    client.fail_build_updates();

    let result = engine.run().await;
    assert!(matches!(result, Err(Error::Api(_))));

    // The build never progressed past create.
    assert!(runtime.setups().is_empty());
    assert_eq!(runtime.volumes().0, 0);
}

#[tokio::test(start_paused = true)]
async fn detached_step_does_not_wait() {
    let mut background = step(2, "watcher");
    background.detach = true;
    let (engine, runtime, client) = engine(package(one_stage(vec![
        init_step(),
        background,
        step(3, "two"),
    ])));
    // Waiting on the held container would hang this test forever.
    runtime.hold_container("step_2_watcher");

    engine.run().await.unwrap();

    assert_eq!(client.last_step(2).unwrap().status, Status::Success);
    assert_eq!(client.last_step(3).unwrap().status, Status::Success);
    assert_eq!(runtime.removes(), runtime.setups());
}

#[tokio::test]
async fn failed_log_upload_rides_along_with_the_next_flush() {
    let (engine, runtime, client) =
        engine(package(one_stage(vec![init_step(), step(2, "one")])));

    let mut burst = vec![b'y'; 1199];
    burst.push(b'\n');
    runtime.script_tail("step_2_one", &[burst.clone(), burst]);
    client.fail_log_updates(1);

    engine.run().await.unwrap();

    // The first flush was rejected; its bytes still reached the server in
    // the next cumulative upload.
    let uploads = client.step_log_uploads(2);
    assert_eq!(uploads.last().unwrap().len(), 2400);
}

#[tokio::test]
async fn ruleset_gates_on_branch() {
    let mut gated = step(2, "one");
    gated.ruleset = Ruleset {
        rules: Rules {
            branch: vec!["release".to_string()],
            ..Default::default()
        },
        ..Default::default()
    };
    let (engine, runtime, client) =
        engine(package(one_stage(vec![init_step(), gated, step(3, "two")])));

    engine.run().await.unwrap();

    assert_eq!(client.last_step(2).unwrap().status, Status::Skipped);
    assert_eq!(client.last_step(3).unwrap().status, Status::Success);
    assert_eq!(client.last_build().unwrap().status, Status::Success);
    // The skipped step's container was still created and still removed.
    assert_eq!(runtime.setups().len(), 2);
    assert_eq!(runtime.removes(), runtime.setups());
}
