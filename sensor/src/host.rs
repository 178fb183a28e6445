use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use axum::{extract::State, response::Html, routing::get, Json, Router};
use chrono::Utc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use tempmon_common::{
    onewire::OneWireBus,
    push::check_status,
    render,
    sim::{SimDevice, SimulatedLine},
    ApiConfig, Clock, ClockSync, DeviceAddress, Error, MonotonicClock, NetworkJoin,
    PollScheduler, PushRequest, Pusher, ReadingsPayload, ReadingsTable, ReadingsView,
    RuntimeConfig, SensorSet, Snapshot, ROUTE_INDEX, ROUTE_READINGS, ROUTE_SENSORS,
};

const DEFAULT_HTTP_PORT: u16 = 8080;

#[derive(Clone)]
struct AppState {
    view: ReadingsView,
    clock: MonotonicClock,
}

struct ConfigStore {
    runtime_path: PathBuf,
}

/// The desktop is already on a network; joining is a formality.
#[derive(Debug, Clone, Copy, Default)]
struct HostNetwork;

/// The OS keeps the wall clock in sync.
struct HostClockSync;

struct HttpPusher {
    api: ApiConfig,
    network: HostNetwork,
    client: Option<reqwest::blocking::Client>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.sanitize();

    let mut network = HostNetwork;
    let ip = network
        .connect(
            &runtime.network.wifi_ssid,
            &runtime.network.wifi_pass,
            runtime.network.connect_timeout_secs,
        )
        .context("network join failed")?;

    let table = ReadingsTable::new();
    let view = table.view();
    let scheduler = PollScheduler::new(
        SensorSet::new(OneWireBus::new(simulated_line())),
        table,
        runtime.poll.clone(),
        Box::new(HttpPusher::new(runtime.api.clone(), network)),
        Box::new(HostClockSync),
    );

    let clock = MonotonicClock::new();
    let shutdown = Arc::new(AtomicBool::new(false));
    let poll = spawn_poll_thread(scheduler, clock, shutdown.clone())?;

    let app = router(AppState { view, clock });

    let port = runtime.http.port_or(DEFAULT_HTTP_PORT);
    let addr: SocketAddr = format!("{}:{port}", runtime.http.host)
        .parse()
        .with_context(|| format!("invalid listen address {}:{port}", runtime.http.host))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind sensor server at {addr}"))?;

    info!("sensor node {ip} listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.store(true, Ordering::Relaxed);
    tokio::task::spawn_blocking(move || poll.join())
        .await?
        .map_err(|_| anyhow!("poll thread panicked"))?;
    info!("sensor node stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(ROUTE_INDEX, get(handle_index))
        .route(ROUTE_SENSORS, get(handle_sensors))
        .route(ROUTE_READINGS, get(handle_readings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_index(State(state): State<AppState>) -> Html<String> {
    let snapshot = state.view.snapshot();
    Html(render::index_page(&snapshot, state.clock.now_ms(), Utc::now()))
}

async fn handle_sensors(State(state): State<AppState>) -> Json<BTreeMap<String, f32>> {
    Json(tempmon_common::sensors_payload(&state.view.snapshot()))
}

async fn handle_readings(State(state): State<AppState>) -> Json<ReadingsPayload> {
    let snapshot = state.view.snapshot();
    Json(ReadingsPayload::new(
        &snapshot,
        state.clock.now_ms(),
        Utc::now().timestamp(),
    ))
}

fn spawn_poll_thread(
    mut scheduler: PollScheduler<SimulatedLine>,
    mut clock: MonotonicClock,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("sensor-poll".to_string())
        .spawn(move || scheduler.run(&mut clock, &shutdown))
        .context("failed to spawn poll thread")
}

async fn shutdown_signal(shutdown: Arc<AtomicBool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, finishing current poll tick");
    shutdown.store(true, Ordering::Relaxed);
}

/// A few wired sensors for running without hardware.
fn simulated_line() -> SimulatedLine {
    let freezer = DeviceAddress::from_parts(0x22, [0x3E, 0x91, 0x5A, 0x00, 0x00, 0x00]);
    SimulatedLine::new(vec![
        SimDevice::ds18b20([0xFF, 0x64, 0x1E, 0x0F, 0x3C, 0x02], 21.5).with_wobble(0.25),
        SimDevice::ds18b20([0xFF, 0x0A, 0x77, 0x81, 0x14, 0x03], 4.0).with_wobble(0.5),
        SimDevice::with_rom(*freezer.as_bytes(), -18.0).with_wobble(0.125),
    ])
}

fn apply_env_overrides(runtime: &mut RuntimeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("TEMPMON_API_URL") {
        runtime.api.url = url;
    }
    if let Some(token) = var("TEMPMON_API_TOKEN") {
        runtime.api.token = token;
    }
    if let Some(port) = var("TEMPMON_HTTP_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.http.port = port;
    }
    if let Some(interval) =
        var("TEMPMON_READ_INTERVAL_MS").and_then(|value| value.parse::<u64>().ok())
    {
        runtime.poll.read_interval_ms = interval;
    }
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("TEMPMON_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.tempmon"));

        Self::at(data_dir)
    }

    fn at(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display()))?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

impl NetworkJoin for HostNetwork {
    fn connect(
        &mut self,
        _ssid: &str,
        _password: &str,
        _timeout_secs: u32,
    ) -> tempmon_common::Result<Ipv4Addr> {
        info!("host build: using the existing network connection");
        Ok(Ipv4Addr::LOCALHOST)
    }

    fn is_connected(&self) -> bool {
        true
    }
}

impl ClockSync for HostClockSync {
    fn resync(&mut self) -> tempmon_common::Result<()> {
        debug!("host clock is kept by the operating system");
        Ok(())
    }
}

impl HttpPusher {
    fn new(api: ApiConfig, network: HostNetwork) -> Self {
        Self {
            api,
            network,
            client: None,
        }
    }

    // Built on first use so it is created and dropped on the poll thread,
    // outside the async runtime.
    fn client(&mut self) -> tempmon_common::Result<&reqwest::blocking::Client> {
        let client = match self.client.take() {
            Some(client) => client,
            None => reqwest::blocking::Client::builder()
                .timeout(Duration::from_millis(self.api.timeout_ms))
                .danger_accept_invalid_certs(self.api.accept_invalid_certs)
                .build()
                .map_err(|err| Error::NetworkFailure(format!("http client setup: {err}")))?,
        };
        Ok(self.client.insert(client))
    }
}

impl Pusher for HttpPusher {
    fn push(&mut self, snapshot: &Snapshot) -> tempmon_common::Result<()> {
        let Some(request) = PushRequest::from_snapshot(&self.api, snapshot) else {
            info!("no fresh readings to push");
            return Ok(());
        };
        if !self.network.is_connected() {
            return Err(Error::NetworkFailure("network not connected".to_string()));
        }
        if !self.api.is_configured() {
            return Err(Error::NetworkFailure(format!(
                "collector url `{}` is not http(s)",
                self.api.url
            )));
        }

        let url = request.to_url();
        let response = self
            .client()?
            .get(url)
            .send()
            .map_err(|err| Error::NetworkFailure(err.without_url().to_string()))?;
        check_status(response.status().as_u16())?;

        info!("pushed {} reading(s) to collector", request.sensors());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use tempmon_common::Reading;

    use super::*;

    fn sample_table() -> (ReadingsTable, DeviceAddress) {
        let address = DeviceAddress::from_parts(0x28, [0xFF, 0x64, 0x1E, 0x0F, 0x3C, 0x02]);
        let mut table = ReadingsTable::new();
        table.update(Reading {
            address,
            temperature_c: 20.5,
            observed_at_ms: 0,
            stale: false,
        });
        (table, address)
    }

    async fn fetch(app: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|value| value.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, body.to_vec())
    }

    #[tokio::test]
    async fn sensors_endpoint_maps_hex_address_to_temperature() {
        let (table, address) = sample_table();
        let app = router(AppState {
            view: table.view(),
            clock: MonotonicClock::new(),
        });

        let (status, _, body) = fetch(app, ROUTE_SENSORS).await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ (address.to_string()): 20.5 }));
    }

    #[tokio::test]
    async fn readings_endpoint_includes_age_and_stale_flag() {
        let (table, address) = sample_table();
        let app = router(AppState {
            view: table.view(),
            clock: MonotonicClock::new(),
        });

        let (status, _, body) = fetch(app, ROUTE_READINGS).await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["readings"][0]["address"], json!(address.to_string()));
        assert_eq!(body["readings"][0]["temperatureC"], json!(20.5));
        assert_eq!(body["readings"][0]["stale"], json!(false));
        assert!(body["generatedAt"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn index_page_is_html_and_reflects_later_updates() {
        let mut table = ReadingsTable::new();
        let app = router(AppState {
            view: table.view(),
            clock: MonotonicClock::new(),
        });

        let (status, content_type, body) = fetch(app.clone(), ROUTE_INDEX).await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/html"));
        assert!(String::from_utf8(body).unwrap().contains("No sensors found"));

        let address = DeviceAddress::from_parts(0x28, [7, 0, 0, 0, 0, 0]);
        table.update(Reading {
            address,
            temperature_c: -5.0,
            observed_at_ms: 0,
            stale: false,
        });
        let (_, _, body) = fetch(app, ROUTE_INDEX).await;
        let page = String::from_utf8(body).unwrap();
        assert!(page.contains(&address.to_string()));
        assert!(page.contains("-5.00°C"));
    }

    #[tokio::test]
    async fn missing_config_file_yields_defaults() {
        let store = ConfigStore::at(std::env::temp_dir().join("tempmon-missing-config-dir"));

        let runtime = store.load_runtime_config().await.unwrap();

        assert_eq!(runtime.poll.read_interval_ms, 5_000);
        assert_eq!(runtime.http.port_or(DEFAULT_HTTP_PORT), 8080);
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut runtime = RuntimeConfig::default();
        let vars = [
            ("TEMPMON_API_URL", "http://10.0.0.2/push"),
            ("TEMPMON_API_TOKEN", "tok"),
            ("TEMPMON_HTTP_PORT", "9090"),
            ("TEMPMON_READ_INTERVAL_MS", "not-a-number"),
        ];

        apply_env_overrides(&mut runtime, |key| {
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        });

        assert_eq!(runtime.api.url, "http://10.0.0.2/push");
        assert_eq!(runtime.api.token, "tok");
        assert_eq!(runtime.http.port_or(DEFAULT_HTTP_PORT), 9090);
        assert_eq!(runtime.poll.read_interval_ms, 5_000);
    }

    #[test]
    fn pusher_without_fresh_readings_sends_nothing() {
        let mut pusher = HttpPusher::new(ApiConfig::default(), HostNetwork);
        let mut table = ReadingsTable::new();
        table.update(Reading {
            address: DeviceAddress::from_parts(0x28, [1, 0, 0, 0, 0, 0]),
            temperature_c: 85.0,
            observed_at_ms: 0,
            stale: true,
        });

        assert_eq!(pusher.push(&table.snapshot()), Ok(()));
        assert!(pusher.client.is_none());
    }

    #[test]
    fn pusher_rejects_non_http_collector_url() {
        let api = ApiConfig {
            url: "ftp://collector".to_string(),
            ..ApiConfig::default()
        };
        let mut pusher = HttpPusher::new(api, HostNetwork);
        let (table, _) = sample_table();

        assert!(matches!(
            pusher.push(&table.snapshot()),
            Err(Error::NetworkFailure(_))
        ));
    }

    #[test]
    fn simulated_line_carries_three_known_sensors() {
        let mut sensors = SensorSet::new(OneWireBus::new(simulated_line()));
        assert_eq!(sensors.rescan().unwrap().len(), 3);
    }
}
