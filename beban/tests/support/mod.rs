//! A tiny stand-in for the warehouse application, served on a random port.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

#[derive(Debug, Default)]
pub struct Warehouse {
    pub logins: AtomicUsize,
    pub items_added: AtomicUsize,
}

pub struct Server {
    pub addr: SocketAddr,
    pub state: Arc<Warehouse>,
}

impl Server {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

pub async fn spawn() -> Server {
    let state = Arc::new(Warehouse::default());
    let app = Router::new()
        .route("/login", get(login_page).post(login))
        .route("/dashboard", get(dashboard))
        .route("/items", get(items))
        .route("/items/add", post(add_item))
        .route("/api/items", get(api_items))
        .route("/whoami", get(whoami))
        .route("/slow", get(slow))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Server { addr, state }
}

fn session(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .find_map(|c| c.trim().strip_prefix("session="))
        .map(str::to_owned)
}

async fn login_page() -> &'static str {
    "<h1>Login</h1>"
}

async fn login(
    State(state): State<Arc<Warehouse>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let ok = form.get("username").map(String::as_str) == Some("superadmin")
        && form.get("password").map(String::as_str) == Some("admin123");
    if !ok {
        return (StatusCode::OK, "Username atau password salah").into_response();
    }
    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    (
        [(header::SET_COOKIE, format!("session=s{n}; Path=/"))],
        Redirect::to("/dashboard"),
    )
        .into_response()
}

async fn dashboard(headers: HeaderMap) -> Response {
    match session(&headers) {
        Some(_) => "<h1>Dashboard</h1> Login berhasil".into_response(),
        None => Redirect::to("/login").into_response(),
    }
}

async fn items(headers: HeaderMap) -> Response {
    match session(&headers) {
        Some(_) => "<title>items.html</title><h1>Daftar Barang</h1>".into_response(),
        None => Redirect::to("/login").into_response(),
    }
}

async fn add_item(
    State(state): State<Arc<Warehouse>>,
    headers: HeaderMap,
    Json(item): Json<Value>,
) -> Response {
    if session(&headers).is_none() {
        return (StatusCode::UNAUTHORIZED, "login required").into_response();
    }
    if !item["name"].is_string() || !item["price"].is_number() {
        return (StatusCode::BAD_REQUEST, "bad item").into_response();
    }
    let id = state.items_added.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "status": "success",
        "message": "Item added successfully",
        "item_id": id,
    }))
    .into_response()
}

async fn api_items(headers: HeaderMap) -> Response {
    match session(&headers) {
        Some(_) => Json(json!([{ "id": 1, "name": "Pallet" }])).into_response(),
        None => (StatusCode::UNAUTHORIZED, "login required").into_response(),
    }
}

async fn whoami(headers: HeaderMap) -> String {
    session(&headers).unwrap_or_else(|| "anonymous".into())
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "finally"
}
