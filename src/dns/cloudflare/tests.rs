//! Tests for the Cloudflare client against a local fake of its API.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use rstest::rstest;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::*;

/// Page size the real API falls back to when no filter is given.
const UNFILTERED_PAGE: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq)]
struct StoredRecord {
    id: String,
    zone_id: String,
    record_type: String,
    name: String,
    content: String,
}

#[derive(Default)]
struct FakeCloudflare {
    zones: Vec<Zone>,
    records: Mutex<Vec<StoredRecord>>,
    calls: Mutex<Vec<String>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeCloudflare {
    fn with_zones<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            zones: names
                .into_iter()
                .enumerate()
                .map(|(idx, name)| Zone {
                    id: format!("z{idx}"),
                    name: name.to_owned(),
                })
                .collect(),
            ..Self::default()
        }
    }

    fn zone_id(&self, name: &str) -> String {
        self.zones
            .iter()
            .find(|zone| zone.name == name)
            .map(|zone| zone.id.clone())
            .unwrap_or_else(|| panic!("no fake zone {name}"))
    }

    fn seed(&self, record: StoredRecord) {
        locked(&self.records).push(record);
    }

    fn records(&self) -> Vec<StoredRecord> {
        locked(&self.records).clone()
    }

    fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    fn record_call(&self, call: String) {
        locked(&self.calls).push(call);
    }
}

fn envelope(result: Value) -> Json<Value> {
    Json(json!({"success": true, "errors": [], "result": result}))
}

fn text(body: &Value, field: &str) -> String {
    body.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

async fn list_zones(
    State(cf): State<Arc<FakeCloudflare>>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Json<Value> {
    let name = query.get("name").cloned().unwrap_or_default();
    cf.record_call(format!("GET /zones?name={name}"));
    let zones: Vec<Value> = cf
        .zones
        .iter()
        .filter(|zone| name.is_empty() || zone.name == name)
        .take(UNFILTERED_PAGE)
        .map(|zone| json!({"id": zone.id, "name": zone.name, "status": "active"}))
        .collect();
    envelope(Value::Array(zones))
}

async fn list_records(
    State(cf): State<Arc<FakeCloudflare>>,
    Path(zone_id): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Json<Value> {
    let kind = query.get("type").cloned().unwrap_or_default();
    let name = query.get("name").cloned().unwrap_or_default();
    cf.record_call(format!("GET /zones/{zone_id}/dns_records?type={kind}&name={name}"));
    let found: Vec<Value> = cf
        .records()
        .into_iter()
        .filter(|record| record.zone_id == zone_id && record.record_type == kind && record.name == name)
        .map(|record| json!({"id": record.id, "type": record.record_type, "name": record.name}))
        .collect();
    envelope(Value::Array(found))
}

async fn create_record(
    State(cf): State<Arc<FakeCloudflare>>,
    Path(zone_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    cf.record_call(format!("POST /zones/{zone_id}/dns_records"));
    let mut records = locked(&cf.records);
    let id = format!("rec-{}", records.len() + 1);
    records.push(StoredRecord {
        id: id.clone(),
        zone_id,
        record_type: text(&body, "type"),
        name: text(&body, "name"),
        content: text(&body, "content"),
    });
    envelope(json!({"id": id}))
}

async fn update_record(
    State(cf): State<Arc<FakeCloudflare>>,
    Path((zone_id, record_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    cf.record_call(format!("PUT /zones/{zone_id}/dns_records/{record_id}"));
    let mut records = locked(&cf.records);
    if let Some(record) = records.iter_mut().find(|record| record.id == record_id) {
        record.content = text(&body, "content");
    }
    envelope(json!({"id": record_id}))
}

/// The fake API served on an ephemeral port; stops when dropped.
struct FakeServer {
    cf: Arc<FakeCloudflare>,
    client: CloudflareClient,
    task: JoinHandle<()>,
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(fake: FakeCloudflare) -> FakeServer {
    let cf = Arc::new(fake);
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    let app = Router::new()
        .route("/zones", get(list_zones))
        .route(
            "/zones/{zone_id}/dns_records",
            get(list_records).post(create_record),
        )
        .route("/zones/{zone_id}/dns_records/{record_id}", put(update_record))
        .with_state(Arc::clone(&cf));
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .unwrap_or_else(|err| panic!("fake Cloudflare stopped: {err}"));
    });
    FakeServer {
        cf,
        client: CloudflareClient::with_api_base(String::from("cf-token"), format!("http://{addr}")),
        task,
    }
}

fn a_record(name: &str, content: &str) -> DnsRecord {
    DnsRecord {
        record_type: String::from("A"),
        name: name.to_owned(),
        content: content.to_owned(),
        ttl: 0,
        proxied: Some(false),
    }
}

#[rstest]
#[case("app.example.com", &["example.com", "app.example.com"])]
#[case("blog.sub.example.org", &["example.org", "blog.sub.example.org", "sub.example.org"])]
#[case("Example.COM.", &["example.com"])]
fn zone_candidates_start_at_the_root(#[case] domain: &str, #[case] expected: &[&str]) {
    assert_eq!(zone_candidates(domain), expected);
}

#[tokio::test]
async fn finds_zones_beyond_the_first_page() {
    let names: Vec<String> = (0..60).map(|idx| format!("site{idx}.net")).collect();
    let server = serve(FakeCloudflare::with_zones(
        names.iter().map(String::as_str).chain(["example.com"]),
    ))
    .await;

    server
        .client
        .upsert_record("app.example.com", &a_record("app.example.com", "192.0.2.10"))
        .await
        .unwrap_or_else(|err| panic!("upsert: {err}"));

    let zone_id = server.cf.zone_id("example.com");
    assert_eq!(
        server.cf.records(),
        [StoredRecord {
            id: String::from("rec-1"),
            zone_id: zone_id.clone(),
            record_type: String::from("A"),
            name: String::from("app.example.com"),
            content: String::from("192.0.2.10"),
        }]
    );
    assert_eq!(
        server.cf.calls(),
        [
            String::from("GET /zones?name=example.com"),
            format!("GET /zones/{zone_id}/dns_records?type=A&name=app.example.com"),
            format!("POST /zones/{zone_id}/dns_records"),
        ]
    );
}

#[tokio::test]
async fn existing_records_are_repointed() {
    let fake = FakeCloudflare::with_zones(["example.com"]);
    let zone_id = fake.zone_id("example.com");
    fake.seed(StoredRecord {
        id: String::from("rec-old"),
        zone_id: zone_id.clone(),
        record_type: String::from("A"),
        name: String::from("app.example.com"),
        content: String::from("198.51.100.1"),
    });
    let server = serve(fake).await;

    server
        .client
        .create_record("app.example.com", &a_record("app.example.com", "192.0.2.20"))
        .await
        .unwrap_or_else(|err| panic!("upsert: {err}"));

    let records = server.cf.records();
    assert_eq!(records.len(), 1, "{records:?}");
    assert!(
        records
            .first()
            .is_some_and(|record| record.id == "rec-old" && record.content == "192.0.2.20"),
        "{records:?}"
    );
    let calls = server.cf.calls();
    assert!(calls.contains(&format!("PUT /zones/{zone_id}/dns_records/rec-old")), "{calls:?}");
    assert!(calls.iter().all(|call| !call.starts_with("POST")), "{calls:?}");
}

#[tokio::test]
async fn delegated_subzones_are_found_after_the_root() {
    let server = serve(FakeCloudflare::with_zones(["sub.example.org"])).await;

    let zone = server
        .client
        .find_zone("blog.sub.example.org")
        .await
        .unwrap_or_else(|err| panic!("zone: {err}"));

    assert_eq!(zone.name, "sub.example.org");
    assert_eq!(
        server.cf.calls(),
        [
            "GET /zones?name=example.org",
            "GET /zones?name=blog.sub.example.org",
            "GET /zones?name=sub.example.org",
        ]
    );
}

#[tokio::test]
async fn missing_zones_are_reported() {
    let server = serve(FakeCloudflare::with_zones(["example.net"])).await;

    let err = server
        .client
        .upsert_record("app.example.com", &a_record("app.example.com", "192.0.2.30"))
        .await
        .expect_err("no zone covers the domain");

    assert!(
        matches!(&err, DnsError::ZoneNotFound { domain, .. } if domain == "app.example.com"),
        "{err}"
    );
    assert!(server.cf.records().is_empty());
}

#[test]
fn zero_ttl_becomes_automatic() {
    let record = a_record("app.example.com", "192.0.2.1");
    let json = serde_json::to_value(RecordBody::from(&record))
        .unwrap_or_else(|err| panic!("serialise: {err}"));
    assert_eq!(
        json,
        json!({
            "type": "A", "name": "app.example.com", "content": "192.0.2.1",
            "ttl": 1, "proxied": false
        })
    );
}

#[test]
fn api_errors_surface_messages() {
    let body = br#"{"success": false, "errors": [{"code": 9109, "message": "Invalid access token"}], "result": null}"#;
    let err = unwrap_envelope::<Vec<Zone>>(body).expect_err("failure envelope");
    assert_eq!(err, "Invalid access token");
}

#[test]
fn unsupported_registrars_are_rejected() {
    let credentials = RegistrarCredentials {
        registrar: String::from("route53"),
        token: String::from("t"),
    };
    assert!(matches!(
        registrar_for(&credentials),
        Err(DnsError::UnsupportedRegistrar(name)) if name == "route53"
    ));
}
