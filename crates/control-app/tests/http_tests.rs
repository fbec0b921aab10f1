use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use control_app::{install_metrics, router, AppState, ControlConfig, ControlService};
use journal::JournalStore;
use modbus_client::ModbusClient;
use types::DeviceIdentity;

const BATTERY: &str = "SP00012345";

struct TestServer {
    port: u16,
    service: Arc<ControlService>,
    client: reqwest::Client,
    db_path: PathBuf,
}

impl TestServer {
    async fn start(name: &str) -> Self {
        let config = ControlConfig {
            batteries: vec![DeviceIdentity {
                isn: BATTERY.to_string(),
                device_address: 2,
            }],
            ..ControlConfig::default()
        };
        let db_path = temp_db_path(name);
        let journal = JournalStore::new(db_path.to_str().expect("path"))
            .await
            .expect("journal");
        let client = ModbusClient::new_mock(config.modbus.clone());
        let service = Arc::new(ControlService::new(client, Some(journal), &config).expect("service"));

        let app = router(AppState {
            service: Arc::clone(&service),
            metrics: Some(install_metrics().expect("metrics")),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });

        Self {
            port,
            service,
            client: reqwest::Client::new(),
            db_path,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    async fn post(&self, action: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/services/{action}")))
            .json(body)
            .send()
            .await
            .expect("send request")
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("send request")
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path.display()));
    }
}

#[tokio::test]
async fn dry_run_write_returns_frame() {
    let server = TestServer::start("http_dry_run").await;

    let response = server
        .post(
            "modbus_write_single_holding_register",
            &json!({
                "device_address": 3,
                "register_address": 41001,
                "data_type": "U16",
                "value": 1234,
                "dry_run": true
            }),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json body");
    assert_eq!(body["frame"], "030603e804d28ac5");
    assert_eq!(body["dry_run"], true);
    assert!(server.service.client().mock_writes().await.is_empty());

    let journal: Value = server.get("/journal?limit=5").await.json().await.expect("json");
    assert_eq!(journal[0]["outcome"], "dry_run");
    assert_eq!(journal[0]["action"], "modbus_write_single_holding_register");

    let metrics = server.get("/metrics").await.text().await.expect("text");
    assert!(metrics.contains("solplanet_commands_total"));

    server.cleanup();
}

#[tokio::test]
async fn invalid_payloads_are_bad_requests() {
    let server = TestServer::start("http_invalid").await;

    let out_of_range = server
        .post(
            "modbus_write_single_holding_register",
            &json!({
                "device_address": 0,
                "register_address": 41001,
                "data_type": "U16",
                "value": 1
            }),
        )
        .await;
    assert_eq!(out_of_range.status(), 400);
    let body: Value = out_of_range.json().await.expect("json body");
    assert!(body["error"]
        .as_str()
        .expect("error text")
        .contains("device_address"));

    let bad_type = server
        .post(
            "modbus_write_single_holding_register",
            &json!({
                "device_address": 1,
                "register_address": 41001,
                "data_type": "F32",
                "value": 1
            }),
        )
        .await;
    assert_eq!(bad_type.status(), 400);

    let bad_minute = server
        .post(
            "set_schedule_slot",
            &json!({
                "battery": BATTERY,
                "day": "Mon",
                "start_hour": 8,
                "start_minute": 45,
                "duration": 2,
                "mode": "charge"
            }),
        )
        .await;
    assert_eq!(bad_minute.status(), 400);

    let unknown_day = server
        .post(
            "clear_schedule",
            &json!({ "battery": BATTERY, "day": "Someday" }),
        )
        .await;
    assert_eq!(unknown_day.status(), 400);

    server.cleanup();
}

#[tokio::test]
async fn schedule_round_trip_over_http() {
    let server = TestServer::start("http_schedule").await;

    let response = server
        .post(
            "set_schedule_slot",
            &json!({
                "battery": BATTERY,
                "day": "Tue",
                "start_hour": 13,
                "start_minute": 30,
                "duration": 3,
                "mode": "discharge"
            }),
        )
        .await;
    assert_eq!(response.status(), 200);

    let shown: Value = server
        .get(&format!("/batteries/{BATTERY}/schedule"))
        .await
        .json()
        .await
        .expect("json body");
    assert_eq!(shown["configured"], true);
    assert_eq!(shown["formatted"]["Tus"][0], "13:30-16:30 discharge");

    let cleared = server
        .post("clear_schedule", &json!({ "battery": BATTERY, "day": "all" }))
        .await;
    assert_eq!(cleared.status(), 200);
    let cleared: Value = cleared.json().await.expect("json body");
    assert_eq!(cleared["configured"], false);

    let missing = server.get("/batteries/UNKNOWN/schedule").await;
    assert_eq!(missing.status(), 404);

    server.cleanup();
}

#[tokio::test]
async fn health_endpoint_answers() {
    let server = TestServer::start("http_health").await;
    let body: Value = server.get("/healthz").await.json().await.expect("json body");
    assert_eq!(body["status"], "ok");
    server.cleanup();
}

fn temp_db_path(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    path.push(format!("{prefix}-{pid}-{ts}.sqlite"));
    path
}
