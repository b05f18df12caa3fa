mod support;

use std::{sync::Arc, time::Duration};

use beban::{
    Registry,
    aggregate::Aggregation,
    check::{Check, Predicate},
    error::{NetworkErrorKind, RequestError},
    http::{ClientConfig, Request},
    vu::VuSlot,
};
use tokio_util::sync::CancellationToken;
use url::Url;

fn slot(id: u64, config: &ClientConfig, registry: &Registry, base: &str) -> VuSlot {
    VuSlot::new(
        id,
        7,
        config.build().unwrap(),
        registry.recorder(),
        Some(Arc::new(Url::parse(base).unwrap())),
        CancellationToken::new(),
    )
}

fn login() -> [(&'static str, &'static str); 2] {
    [("username", "superadmin"), ("password", "admin123")]
}

#[tokio::test]
async fn cookies_stay_with_their_vu() {
    let server = support::spawn().await;
    let registry = Registry::new();
    let config = ClientConfig::default();
    let alice = slot(1, &config, &registry, &server.url("/")).vu();
    let bob = slot(2, &config, &registry, &server.url("/")).vu();

    let res = alice
        .request(Request::post(alice.url("/login").unwrap()).form(login()))
        .await
        .unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.url.path(), "/dashboard");
    assert!(res.body.contains("Login berhasil"));

    let mine = alice.get("/whoami").await.unwrap();
    assert_eq!(mine.body, "s1");
    let theirs = bob.get("/whoami").await.unwrap();
    assert_eq!(theirs.body, "anonymous");

    let items = bob.get("/items").await.unwrap();
    assert_eq!(items.url.path(), "/login");
}

#[tokio::test]
async fn session_survives_across_iterations() {
    let server = support::spawn().await;
    let registry = Registry::new();
    let slot = slot(1, &ClientConfig::default(), &registry, &server.url("/"));

    let first = slot.vu();
    first
        .request(Request::post(first.url("/login").unwrap()).form(login()))
        .await
        .unwrap();

    let later = slot.vu();
    let items = later.get("/items").await.unwrap();
    let checks = [
        Check::new("Status is 200", Predicate::Status(200)),
        Check::new(
            "Contains items",
            Predicate::BodyContainsAny(vec!["items.html".into(), "Barang".into()]),
        ),
        Check::new("Not redirected to login", Predicate::UrlNotContains("/login".into())),
    ];
    assert!(later.check(&items, &checks));
}

#[tokio::test]
async fn redirects_can_be_inspected_when_not_followed() {
    let server = support::spawn().await;
    let registry = Registry::new();
    let config = ClientConfig {
        max_redirects: 0,
        ..ClientConfig::default()
    };
    let vu = slot(1, &config, &registry, &server.url("/")).vu();

    let res = vu
        .request(Request::post(vu.url("/login").unwrap()).form(login()))
        .await
        .unwrap();
    assert!((300..400).contains(&res.status));
    let check = Check::new(
        "Redirect to dashboard",
        Predicate::HeaderContains {
            name: "location".into(),
            value: "/dashboard".into(),
        },
    );
    assert!(check.evaluate(&res));
}

#[tokio::test]
async fn wrong_password_is_a_failed_check_not_an_error() {
    let server = support::spawn().await;
    let registry = Registry::new();
    let vu = slot(1, &ClientConfig::default(), &registry, &server.url("/")).vu();

    let res = vu
        .request(
            Request::post(vu.url("/login").unwrap())
                .form([("username", "superadmin"), ("password", "nope")]),
        )
        .await
        .unwrap();
    let check = Check::new("No error message", Predicate::BodyNotContains("salah".into()));
    assert!(!vu.check(&res, &[check]));

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.value("checks", Aggregation::Rate), Some(0.0));
    assert_eq!(snapshot.value("http_req_failed", Aggregation::Rate), Some(0.0));
}

#[tokio::test]
async fn refused_connections_are_network_errors() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let registry = Registry::new();
    let vu = slot(1, &ClientConfig::default(), &registry, &format!("http://{addr}/")).vu();
    let err = vu.get("/login").await.unwrap_err();
    assert!(
        matches!(
            err,
            RequestError::Network {
                kind: NetworkErrorKind::Connect,
                ..
            }
        ),
        "{err:?}"
    );

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.value("http_req_errors", Aggregation::Count), Some(1.0));
    assert_eq!(snapshot.value("http_req_failed", Aggregation::Rate), Some(1.0));
}

#[tokio::test]
async fn slow_responses_time_out() {
    let server = support::spawn().await;
    let registry = Registry::new();
    let vu = slot(1, &ClientConfig::default(), &registry, &server.url("/")).vu();

    let err = vu
        .request(Request::get(vu.url("/slow").unwrap()).timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            RequestError::Network {
                kind: NetworkErrorKind::Timeout,
                ..
            }
        ),
        "{err:?}"
    );
}
