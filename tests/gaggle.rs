mod common;

use httpmock::MockServer;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use skein::gaggle::supervisor::SupervisorConfig;
use skein::gaggle::worker::WorkerRunner;
use skein::prelude::*;
use skein::runner::MasterRunner;
use skein::util::CancelHandle;

const MANAGER_PORT: &str = "5116";

/// Run a Manager and two Workers from the command line options, all in one process.
#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_gaggle() {
    let server = MockServer::start();
    let (index, about) = common::setup_mock_server_endpoints(&server);

    let manager_configuration = common::build_configuration(vec![
        "--manager",
        "--expect-workers",
        "2",
        "--manager-bind-port",
        MANAGER_PORT,
        "--plan",
        "4,0s,40r",
        "--plan-name",
        "gaggle",
    ]);
    let manager = tokio::spawn(
        SkeinAttack::initialize_with_config(manager_configuration)
            .unwrap()
            .execute(),
    );
    // Give the manager time to bind before workers connect.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut workers = Vec::new();
    for worker_id in &["w-1", "w-2"] {
        let configuration = common::build_configuration(vec![
            "--worker",
            "--worker-id",
            worker_id,
            "--manager-port",
            MANAGER_PORT,
        ]);
        workers.push(tokio::spawn(common::build_load_test(&server, configuration).execute()));
    }

    let report = manager.await.unwrap().unwrap();
    assert!(report.full_history);
    assert!(report.total_results() >= 40);
    assert_eq!(report.total_failures, 0);
    assert_eq!(report.extras.get("plan").map(String::as_str), Some("gaggle"));

    let mut worker_results = 0;
    for worker in workers {
        let worker_report = worker.await.unwrap().unwrap();
        // Each worker got half the users.
        assert!(worker_report.total_results() > 0);
        worker_results += worker_report.total_results();
    }
    assert!(worker_results >= report.total_results());
    assert!(index.hits() + about.hits() >= 40);
}

/// Drive a two stage plan through a MasterRunner, then interrupt a second plan.
#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_master_runner() {
    let server = MockServer::start();
    let (index, _about) = common::setup_mock_server_endpoints(&server);

    let master = MasterRunner::new(SupervisorConfig::default(), Duration::from_secs(1));
    let reports = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&reports);
    master
        .subscribe_report(Arc::new(move |report: &SummaryReport| {
            collected.lock().unwrap().push(report.clone());
        }))
        .await;
    let address = master.launch("127.0.0.1:0").await.unwrap();
    assert!(master.launch("127.0.0.1:0").await.is_err());

    let manager_url = Url::parse(&format!("ws://{}/", address)).unwrap();
    let worker_shutdown = CancelHandle::new();
    let mut workers = Vec::new();
    for _ in 0..2 {
        let task = Task::new()
            .with_attacker(
                Arc::new(HttpAttacker::new("index", &server.url(common::INDEX_PATH)).unwrap()),
                1,
            )
            .unwrap();
        let worker = WorkerRunner::new(manager_url.clone(), Arc::new(task));
        workers.push(tokio::spawn(worker.run(worker_shutdown.clone())));
    }
    assert!(master.wait_for_workers(2, &CancelHandle::new()).await);
    assert_eq!(master.supervisor().workers().await.len(), 2);

    let plan = Plan::new("two-stages")
        .with_stage(
            Stage::new(FixedConcurrentUsers::new(2, 0))
                .with_timer(Timer::UniformRandom(
                    UniformRandomTimer::new(Duration::from_millis(1), Duration::from_millis(5)).unwrap(),
                ))
                .with_exit_conditions(ExitConditions::after_requests(10)),
        )
        .unwrap()
        .with_stage(Stage::new(FixedConcurrentUsers::new(4, 0)).with_exit_conditions(ExitConditions::after_requests(20)))
        .unwrap();
    master.start_plan(plan).await.unwrap();
    master.wait_plan().await.unwrap();
    assert_eq!(master.plan_status().await, Some(PlanStatus::Finished));
    {
        let reports = reports.lock().unwrap();
        let last = reports.last().unwrap();
        assert!(last.full_history);
        assert!(last.total_results() >= 30);
    }

    // A plan without exit conditions runs until it is stopped.
    let endless = Plan::new("endless")
        .with_stage(Stage::new(FixedConcurrentUsers::new(2, 0)))
        .unwrap();
    master.start_plan(endless).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    master.stop_plan().await.unwrap();
    master.wait_plan().await.unwrap();
    assert_eq!(master.plan_status().await, Some(PlanStatus::Interrupted));
    assert!(master.stop_plan().await.is_ok());

    master.shutdown().await;
    for worker in workers {
        // Shutting the manager down disconnects every worker.
        worker.await.unwrap().unwrap();
    }
    assert!(index.hits() >= 30);
}
