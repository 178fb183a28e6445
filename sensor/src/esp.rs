use std::{
    net::Ipv4Addr,
    sync::{atomic::AtomicBool, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Write,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{Gpio12, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use tempmon_common::{
    gpio::GpioLine,
    onewire::OneWireBus,
    push::check_status,
    render, sensors_payload, ApiConfig, Clock, ClockSync, Error, MonotonicClock, NetworkJoin,
    PollScheduler, PushRequest, Pusher, ReadingsPayload, ReadingsTable, ReadingsView,
    RuntimeConfig, SensorSet, Snapshot, ROUTE_INDEX, ROUTE_READINGS, ROUTE_SENSORS,
};

const NVS_NAMESPACE: &str = "tempmon";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const DEFAULT_HTTP_PORT: u16 = 80;
const POLL_STACK_SIZE: usize = 12 * 1024;
const SNTP_WAIT_MS: u64 = 3_000;
const WIFI_CHECK_INTERVAL_SECS: u64 = 30;

type OneWirePin = PinDriver<'static, Gpio12, InputOutput>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct EspNetwork {
    wifi: BlockingWifi<EspWifi<'static>>,
}

struct EspClockSync {
    sntp: Option<EspSntp<'static>>,
}

struct EspPusher {
    api: ApiConfig,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut network = EspNetwork {
        wifi: BlockingWifi::wrap(
            EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?,
            sys_loop,
        )?,
    };
    let ip = network
        .connect(
            &runtime.network.wifi_ssid,
            &runtime.network.wifi_pass,
            runtime.network.connect_timeout_secs,
        )
        .context("wifi startup failed")?;
    info!("wifi connected, ip {ip}");

    let mut pin: OneWirePin =
        PinDriver::input_output_od(pins.gpio12).context("failed to claim one-wire pin")?;
    pin.set_pull(Pull::Up)?;
    let bus = OneWireBus::new(GpioLine::new(pin, Ets));

    let table = ReadingsTable::new();
    let view = table.view();
    let mut scheduler = PollScheduler::new(
        SensorSet::new(bus),
        table,
        runtime.poll.clone(),
        Box::new(EspPusher {
            api: runtime.api.clone(),
        }),
        Box::new(EspClockSync { sntp: None }),
    );

    let clock = MonotonicClock::new();
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let mut clock = clock;
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("sensor-poll".to_string())
            .stack_size(POLL_STACK_SIZE)
            .spawn(move || scheduler.run(&mut clock, &shutdown))
            .context("failed to spawn poll thread")?;
    }

    let server = create_http_server(&runtime, view, clock)?;
    info!(
        "serving readings on http://{ip}:{}",
        runtime.http.port_or(DEFAULT_HTTP_PORT)
    );

    // Keep services alive for the program lifetime.
    let _server = server;
    let mut disconnected_since: Option<Instant> = None;
    loop {
        thread::sleep(Duration::from_secs(WIFI_CHECK_INTERVAL_SECS));
        maintain_wifi(&mut network, &runtime, &mut disconnected_since);
    }
}

fn create_http_server(
    runtime: &RuntimeConfig,
    view: ReadingsView,
    clock: MonotonicClock,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: runtime.http.port_or(DEFAULT_HTTP_PORT),
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let view = view.clone();
        server.fn_handler::<anyhow::Error, _>(ROUTE_INDEX, Method::Get, move |req| {
            let page = render::index_page(&view.snapshot(), clock.now_ms(), Utc::now());
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(page.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let view = view.clone();
        server.fn_handler(ROUTE_SENSORS, Method::Get, move |req| {
            write_json(req, &sensors_payload(&view.snapshot()))
        })?;
    }

    server.fn_handler(ROUTE_READINGS, Method::Get, move |req| {
        let payload =
            ReadingsPayload::new(&view.snapshot(), clock.now_ms(), Utc::now().timestamp());
        write_json(req, &payload)
    })?;

    Ok(server)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or_default().to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
}

fn maintain_wifi(
    network: &mut EspNetwork,
    runtime: &RuntimeConfig,
    disconnected_since: &mut Option<Instant>,
) {
    if network.is_connected() {
        *disconnected_since = None;
        return;
    }

    let since = disconnected_since.get_or_insert_with(Instant::now);
    warn!("wifi down for {}s, reconnecting", since.elapsed().as_secs());
    match network.connect(
        &runtime.network.wifi_ssid,
        &runtime.network.wifi_pass,
        runtime.network.connect_timeout_secs,
    ) {
        Ok(ip) => {
            info!("wifi reconnected, ip {ip}");
            *disconnected_since = None;
        }
        Err(err) => warn!("wifi reconnect failed: {err}"),
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn network_error(context: &str, err: impl core::fmt::Debug) -> Error {
    Error::NetworkFailure(format!("{context}: {err:?}"))
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl NetworkJoin for EspNetwork {
    fn connect(
        &mut self,
        ssid: &str,
        password: &str,
        timeout_secs: u32,
    ) -> tempmon_common::Result<Ipv4Addr> {
        if ssid.is_empty() {
            return Err(Error::NetworkFailure("wifi ssid not configured".to_string()));
        }

        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let configuration = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| Error::NetworkFailure("wifi ssid too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| Error::NetworkFailure("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        if self.wifi.is_started().unwrap_or(false) {
            if let Err(err) = self.wifi.disconnect() {
                warn!("wifi disconnect before reconfigure failed: {err}");
            }
        }
        self.wifi
            .set_configuration(&configuration)
            .map_err(|err| network_error("wifi configuration", err))?;
        self.wifi
            .start()
            .map_err(|err| network_error("wifi start", err))?;
        info!("wifi started, connecting to `{ssid}`");

        let timeout = Some(Duration::from_secs(u64::from(timeout_secs)));
        self.wifi
            .wifi_mut()
            .connect()
            .map_err(|err| network_error("wifi connect", err))?;
        self.wifi
            .wifi_wait_while(|| self.wifi.is_connected().map(|up| !up), timeout)
            .map_err(|err| network_error("wifi association timed out", err))?;
        self.wifi
            .ip_wait_while(|| self.wifi.is_up().map(|up| !up), timeout)
            .map_err(|err| network_error("dhcp timed out", err))?;

        let ip_info = self
            .wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map_err(|err| network_error("reading ip info", err))?;
        Ok(ip_info.ip)
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }
}

impl ClockSync for EspClockSync {
    fn resync(&mut self) -> tempmon_common::Result<()> {
        // Restarting the service forces an immediate poll of the server.
        self.sntp = None;
        let sntp = EspSntp::new_default().map_err(|err| network_error("sntp start", err))?;

        let started = Instant::now();
        while sntp.get_sync_status() != SyncStatus::Completed {
            if started.elapsed() >= Duration::from_millis(SNTP_WAIT_MS) {
                self.sntp = Some(sntp);
                return Err(Error::NetworkFailure("sntp sync timed out".to_string()));
            }
            thread::sleep(Duration::from_millis(200));
        }

        info!("clock synchronized: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
        self.sntp = Some(sntp);
        Ok(())
    }
}

impl Pusher for EspPusher {
    fn push(&mut self, snapshot: &Snapshot) -> tempmon_common::Result<()> {
        let Some(request) = PushRequest::from_snapshot(&self.api, snapshot) else {
            info!("no fresh readings to push");
            return Ok(());
        };
        if !is_wifi_station_connected() {
            return Err(Error::NetworkFailure("wifi not connected".to_string()));
        }
        if !self.api.is_configured() {
            return Err(Error::NetworkFailure(format!(
                "collector url `{}` is not http(s)",
                self.api.url
            )));
        }

        // Dropping the bundle only skips verification when sdkconfig sets
        // CONFIG_ESP_TLS_SKIP_SERVER_CERT_VERIFY.
        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_millis(self.api.timeout_ms)),
            crt_bundle_attach: if self.api.accept_invalid_certs {
                None
            } else {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            },
            ..Default::default()
        };
        let connection =
            EspHttpConnection::new(&http_conf).map_err(|err| network_error("http client", err))?;
        let mut client = HttpClient::wrap(connection);

        let url = request.to_url();
        let response = client
            .request(Method::Get, &url, &[])
            .map_err(|err| network_error("http request", err))?
            .submit()
            .map_err(|err| network_error("http submit", err))?;
        check_status(response.status())?;

        info!("pushed {} reading(s) to collector", request.sensors());
        Ok(())
    }
}
