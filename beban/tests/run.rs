mod support;

use std::{sync::Arc, sync::atomic::Ordering, time::Duration};

use beban::{
    Outcome, Overrides, Runner, Scenario, ScenarioFile,
    report::{JsonReporter, MetricSummary, Reporter, Summary},
};

const WAREHOUSE: &str = r#"
name: warehouse-endurance
stages:
  - { duration: 10m, target: 3 }
think_time: 100ms
thresholds:
  http_req_duration: ["p(95)<1000"]
  checks: ["rate>0.95"]
  http_req_failed: ["rate<0.05"]
steps:
  - name: login
    method: POST
    path: /login
    once: true
    require_checks: true
    form: { username: superadmin, password: admin123 }
    checks:
      - { name: "Login berhasil", body_contains: "Login berhasil" }
  - name: items
    path: /items
    checks:
      - { name: "Status is 200", status: 200 }
      - { name: "Not redirected to login", url_not_contains: /login }
  - name: add item
    method: POST
    path: /items/add
    json:
      name: "Item Load Test ${vu}-${iter}-${now_ms}"
      price: "${rand:10000..110000}"
      category_id: ""
      supplier_id: ""
    checks:
      - { name: "Item added", all_of: [{ body_contains: success }, { body_contains: "Item added" }] }
      - { name: "Has item id", body_contains: item_id }
  - name: api items
    path: /api/items
    checks:
      - { name: "Valid JSON", json_body: true }
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn yaml_scenario_against_a_live_server() {
    let server = support::spawn().await;
    let file = ScenarioFile::from_yaml(WAREHOUSE).unwrap();
    let compiled = file
        .compile(&Overrides {
            vus: Some(2),
            duration: Some(Duration::from_secs(2)),
            base_url: Some(server.url("/")),
            seed: Some(11),
        })
        .unwrap();

    let scenario = Scenario::builder()
        .name(compiled.name)
        .action(Arc::new(compiled.plan).action())
        .thresholds(compiled.thresholds)
        .build();
    let runner = Runner::builder()
        .executor(compiled.executor)
        .client(compiled.client)
        .base_url(compiled.base_url)
        .seed(compiled.seed)
        .build();

    let result = runner.run(&scenario).await.unwrap();
    assert_eq!(result.outcome, Outcome::Passed, "{:?}", result.evaluation);
    assert_eq!(result.seed, 11);
    assert_eq!(result.stats.vus_spawned, 2);

    // Each VU logs in once and keeps its session.
    assert_eq!(server.state.logins.load(Ordering::SeqCst), 2);
    assert!(server.state.items_added.load(Ordering::SeqCst) >= 2);

    let summary = Summary::from(&result);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("summary.json");
    JsonReporter { path: path.clone() }
        .report(&summary)
        .await
        .unwrap();

    let written: Summary = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(written.outcome, Outcome::Passed);
    match written.metrics.get("checks") {
        Some(MetricSummary::Rate { rate, fails, .. }) => {
            assert_eq!(*fails, 0);
            assert_eq!(*rate, 1.0);
        }
        other => panic!("unexpected checks summary: {other:?}"),
    }
    assert!(written.metrics.contains_key("http_req_duration{name:add item}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_login_fails_the_thresholds() {
    let server = support::spawn().await;
    let yaml = WAREHOUSE.replace("password: admin123", "password: wrong");
    let compiled = ScenarioFile::from_yaml(&yaml)
        .unwrap()
        .compile(&Overrides {
            vus: Some(1),
            duration: Some(Duration::from_secs(1)),
            base_url: Some(server.url("/")),
            seed: None,
        })
        .unwrap();

    let scenario = Scenario::builder()
        .name(compiled.name)
        .action(Arc::new(compiled.plan).action())
        .thresholds(compiled.thresholds)
        .build();
    let result = Runner::builder()
        .executor(compiled.executor)
        .client(compiled.client)
        .base_url(compiled.base_url)
        .build()
        .run(&scenario)
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::ThresholdsFailed);
    assert_eq!(result.outcome.exit_code(), 99);
    assert_eq!(server.state.items_added.load(Ordering::SeqCst), 0);
}
