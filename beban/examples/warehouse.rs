//! The add-item peak test written in Rust instead of YAML.
//!
//! Expects the warehouse app on `http://localhost:8080`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use beban::{
    IterationError, RampingVuExecutor, Runner, Scenario, Schedule, Stage, Threshold, Vu,
    executor::RampPolicy,
    http::Request,
    pacing::ThinkTime,
    report::{ConsoleReporter, Reporter, Summary},
};
use rand::Rng;
use serde_json::json;
use url::Url;

async fn add_item(mut vu: Vu) -> Result<(), IterationError> {
    // Cookies live in the VU's own client, so the session carries over
    let login = vu
        .request(
            Request::post(vu.url("/login")?)
                .name("login")
                .form([("username", "superadmin"), ("password", "admin123")]),
        )
        .await?;
    let ok = vu.check_that("Login Status 200/302", matches!(login.status, 200 | 302))
        & vu.check_that("Login tidak gagal", !login.body.contains("salah"));
    if !ok {
        return Err(IterationError::ChecksFailed {
            step: "login".into(),
        });
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let price = vu.rng().random_range(10_000..110_000);
    let item = json!({
        "name": format!("Item Load Test {}-{}-{now}", vu.id(), vu.iteration()),
        "price": price,
        "category_id": "",
        "supplier_id": "",
    });

    let res = vu
        .request(Request::post(vu.url("/items/add")?).name("add item").json(item))
        .await?;
    vu.check_that("Status 200 (Item added)", res.status == 200);
    vu.check_that(
        "Response contains success",
        res.body.contains("success") && res.body.contains("Item added"),
    );
    vu.check_that("Mendapatkan item_id", res.body.contains("item_id"));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let scenario = Scenario::builder()
        .name("Warehouse add item peak")
        .action(add_item)
        .thresholds(
            [
                Threshold::parse("http_req_duration", "p(95)<1500")?,
                Threshold::parse("checks", "rate>0.90")?,
            ]
            .into_iter()
            .collect(),
        )
        .build();

    let executor = RampingVuExecutor::builder()
        .schedule(Schedule::new(
            0,
            vec![
                Stage::new(Duration::from_secs(20), 5),
                Stage::new(Duration::from_secs(90), 5),
                Stage::new(Duration::from_secs(10), 0),
            ],
            RampPolicy::Linear,
        )?)
        // Odd VUs rest 2s, even VUs 3s
        .think_time(ThinkTime::cycle([
            Duration::from_secs(3),
            Duration::from_secs(2),
        ]))
        .build();

    let result = Runner::builder()
        .executor(executor)
        .base_url(Some(Url::parse("http://localhost:8080")?))
        .build()
        .run(&scenario)
        .await?;

    ConsoleReporter::default()
        .report(&Summary::from(&result))
        .await?;
    std::process::exit(result.outcome.exit_code());
}
