use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info, warn};

use stairlight_common::{
    config::TimingConfig, ranging::US_PER_CM, resolve, telemetry::USER_AGENT, ControllerState,
    FormSession, FormTarget, HttpTransport, Indicators, KasaClient, LinkError, Millis,
    NetworkLinks, Ping, RangeSampler, RangingSensor, RequestMethod, RuntimeConfig, SensorReading,
    StairHardware, StairStatus, TickPacer, WifiLink,
};

const DEFAULT_PULSE_MS: u32 = 400;
const DEFAULT_PULSE_CM: u32 = 60;

#[derive(Clone)]
struct AppState {
    status: watch::Receiver<StairStatus>,
    sim: Arc<SimInputs>,
}

/// Inputs the HTTP API can poke into the simulated board.
#[derive(Default)]
struct SimInputs {
    lower_until_ms: AtomicU64,
    upper_until_ms: AtomicU64,
    lower_cm: AtomicU32,
    upper_cm: AtomicU32,
    wifi_down: AtomicBool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct PulseParams {
    #[serde(default)]
    ms: Option<u32>,
    #[serde(default)]
    cm: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WifiParams {
    up: bool,
}

#[derive(Debug, Serialize)]
struct PulseResponse {
    sensor: String,
    #[serde(rename = "untilMs")]
    until_ms: u64,
    #[serde(rename = "distanceCm")]
    distance_cm: u32,
}

#[derive(Clone)]
struct ConfigStore {
    runtime_path: Arc<PathBuf>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::from_env();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from {}: {err:#}", store.runtime_path.display());
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.repair();

    let timezone = resolve_timezone(&runtime.site.timezone);
    let sim = Arc::new(SimInputs::default());
    let state = ControllerState::new(runtime.clone(), Millis::from_u64(monotonic_ms()));
    let (status_tx, status_rx) = watch::channel(state.status(Millis::from_u64(monotonic_ms())));
    let stop = Arc::new(AtomicBool::new(false));

    let control = spawn_control_loop(state, runtime.clone(), timezone, sim.clone(), status_tx, stop.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/sim/wifi", post(handle_sim_wifi))
        .route("/api/sim/{sensor}", post(handle_sim_pulse))
        .with_state(AppState {
            status: status_rx,
            sim,
        });

    let port = std::env::var("STATUS_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("stairlight listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stop.store(true, Ordering::Relaxed);
    control.await.context("control loop panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn spawn_control_loop(
    mut state: ControllerState,
    runtime: RuntimeConfig,
    timezone: Tz,
    sim: Arc<SimInputs>,
    status_tx: watch::Sender<StairStatus>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let timing = &runtime.timing;
        let network = &runtime.network;
        let mut board = SimBoard {
            sampler: RangeSampler::new(
                SimRanger::lower(sim.clone()),
                SimRanger::upper(sim.clone()),
                timing.detect_threshold_us,
                timing.echo_timeout_ms,
            ),
            stair_light: false,
            indicators: Indicators::default(),
        };
        let mut links = NetworkLinks {
            wifi: SimWifi {
                sim: sim.clone(),
                connected: false,
            },
            switch: KasaClient::new(
                network.kasa_host.clone(),
                network.kasa_port,
                timing.kasa_connect_timeout_ms,
                timing.kasa_io_timeout_ms,
            )
            .with_lookup_timeout(timing.dns_timeout_ms),
            telemetry: FormSession::new(
                ReqwestTransport::new(timing),
                FormTarget::from_config(network),
            ),
        };
        let pacer = TickPacer::new(timing.tick_interval_ms);

        info!(
            "control loop running every {} ms (worst case {} ms)",
            timing.tick_interval_ms,
            timing.worst_case_tick_ms()
        );
        while !stop.load(Ordering::Relaxed) {
            let tick_start = Millis::from_u64(monotonic_ms());
            let report = state.tick(&mut board, &mut links, tick_start, now_in(timezone));
            if !report.actions.is_empty() || report.porch.is_some() {
                debug!(actions = ?report.actions, porch = ?report.porch, "tick");
            }

            let now = Millis::from_u64(monotonic_ms());
            status_tx.send_replace(state.status(now));
            std::thread::sleep(pacer.remaining(tick_start, now));
        }
    })
}

/// Telemetry over a pooled blocking client. The host name is resolved once
/// under the lookup deadline and pinned into the client.
struct ReqwestTransport {
    connect_timeout: Duration,
    request_timeout: Duration,
    lookup_timeout: Duration,
    client: Option<reqwest::blocking::Client>,
}

impl ReqwestTransport {
    fn new(timing: &TimingConfig) -> Self {
        let connect_ms = u64::from(timing.telemetry_connect_timeout_ms);
        let io_ms = u64::from(timing.telemetry_io_timeout_ms);
        Self {
            connect_timeout: Duration::from_millis(connect_ms),
            request_timeout: Duration::from_millis(connect_ms + 2 * io_ms),
            lookup_timeout: Duration::from_millis(u64::from(timing.dns_timeout_ms)),
            client: None,
        }
    }

    fn link_error(&self, err: reqwest::Error) -> LinkError {
        if err.is_timeout() {
            LinkError::Timeout(self.request_timeout.as_millis() as u32)
        } else {
            LinkError::protocol(err.to_string())
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn connect(&mut self, target: &FormTarget) -> Result<(), LinkError> {
        let addr = resolve::lookup(&target.host, target.port, self.lookup_timeout)?;
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .resolve(&target.host, addr)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| LinkError::protocol(format!("http client: {err}")))?;
        self.client = Some(client);
        Ok(())
    }

    fn request(&mut self, method: RequestMethod, url: &str) -> Result<u16, LinkError> {
        let client = self.client.as_ref().ok_or(LinkError::NotConnected)?;
        let builder = match method {
            RequestMethod::Get => client.get(url),
            RequestMethod::Head => client.head(url),
        };
        let response = builder.send().map_err(|err| self.link_error(err))?;
        let status = response.status().as_u16();
        response.bytes().map_err(|err| self.link_error(err))?;
        Ok(status)
    }

    fn disconnect(&mut self) {
        self.client = None;
    }
}

struct SimBoard {
    sampler: RangeSampler<SimRanger, SimRanger>,
    stair_light: bool,
    indicators: Indicators,
}

impl StairHardware for SimBoard {
    fn sample(&mut self) -> SensorReading {
        self.sampler.sample()
    }

    fn set_stair_light(&mut self, on: bool) {
        if self.stair_light != on {
            info!("stair light relay -> {}", if on { "ON" } else { "OFF" });
        }
        self.stair_light = on;
    }

    fn show_status(&mut self, indicators: Indicators) {
        if indicators.wifi_connected != self.indicators.wifi_connected {
            info!("wifi led -> {}", if indicators.wifi_connected { "solid" } else { "blinking" });
        }
        self.indicators = indicators;
    }
}

/// A sensor that "sees" somebody while its pulse window is open.
struct SimRanger {
    sim: Arc<SimInputs>,
    upper: bool,
}

impl SimRanger {
    fn lower(sim: Arc<SimInputs>) -> Self {
        Self { sim, upper: false }
    }

    fn upper(sim: Arc<SimInputs>) -> Self {
        Self { sim, upper: true }
    }
}

impl RangingSensor for SimRanger {
    fn ping(&mut self, _timeout_us: u32) -> Ping {
        let (until, cm) = if self.upper {
            (&self.sim.upper_until_ms, &self.sim.upper_cm)
        } else {
            (&self.sim.lower_until_ms, &self.sim.lower_cm)
        };
        if monotonic_ms() < until.load(Ordering::Relaxed) {
            Ping::Echo(cm.load(Ordering::Relaxed).saturating_mul(US_PER_CM))
        } else {
            Ping::Timeout
        }
    }
}

struct SimWifi {
    sim: Arc<SimInputs>,
    connected: bool,
}

impl WifiLink for SimWifi {
    fn is_connected(&mut self) -> bool {
        if self.sim.wifi_down.load(Ordering::Relaxed) {
            self.connected = false;
        }
        self.connected
    }

    fn connect(&mut self, timeout_ms: u32) -> Result<(), LinkError> {
        if self.sim.wifi_down.load(Ordering::Relaxed) {
            return Err(LinkError::Timeout(timeout_ms));
        }
        self.connected = true;
        Ok(())
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    Json(status)
}

async fn handle_sim_pulse(
    State(state): State<AppState>,
    Path(sensor): Path<String>,
    Query(params): Query<PulseParams>,
) -> axum::response::Response {
    let (until, cm) = match sensor.as_str() {
        "lower" => (&state.sim.lower_until_ms, &state.sim.lower_cm),
        "upper" => (&state.sim.upper_until_ms, &state.sim.upper_cm),
        _ => return error_response(StatusCode::NOT_FOUND, "sensor must be `lower` or `upper`"),
    };

    let distance_cm = params.cm.unwrap_or(DEFAULT_PULSE_CM);
    if distance_cm == 0 {
        return error_response(StatusCode::BAD_REQUEST, "cm must be > 0");
    }
    let until_ms = monotonic_ms() + u64::from(params.ms.unwrap_or(DEFAULT_PULSE_MS));
    cm.store(distance_cm, Ordering::Relaxed);
    until.store(until_ms, Ordering::Relaxed);

    Json(PulseResponse {
        sensor,
        until_ms,
        distance_cm,
    })
    .into_response()
}

async fn handle_sim_wifi(
    State(state): State<AppState>,
    Query(params): Query<WifiParams>,
) -> impl IntoResponse {
    state.sim.wifi_down.store(!params.up, Ordering::Relaxed);
    info!("simulated wifi {}", if params.up { "available" } else { "unavailable" });
    StatusCode::NO_CONTENT
}

impl ConfigStore {
    fn from_env() -> Self {
        let path = std::env::var("STAIRLIGHT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/runtime.json"));
        Self {
            runtime_path: Arc::new(path),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid json in {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    let network = &mut runtime.network;
    if let Some(host) = lookup("KASA_HOST") {
        network.kasa_host = host;
    }
    if let Some(port) = lookup("KASA_PORT").and_then(|value| value.parse::<u16>().ok()) {
        network.kasa_port = port;
    }
    if let Some(host) = lookup("TELEMETRY_HOST") {
        // An overridden collector is a local plain-HTTP endpoint.
        network.telemetry_host = host;
        network.telemetry_tls = false;
        network.telemetry_port = 80;
    }
    if let Some(port) = lookup("TELEMETRY_PORT").and_then(|value| value.parse::<u16>().ok()) {
        network.telemetry_port = port;
    }
}

fn resolve_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!("unknown timezone `{name}`; using UTC");
        Tz::UTC
    })
}

fn now_in(timezone: Tz) -> DateTime<FixedOffset> {
    let local = Utc::now().with_timezone(&timezone);
    local.with_timezone(&local.offset().fix())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io::{BufRead, BufReader, Write},
        net::TcpListener as StdListener,
        sync::mpsc,
        thread,
    };

    use stairlight_common::TelemetryLink;

    use super::*;

    /// Accepts any number of connections and answers every request with
    /// `response`, reporting request lines back to the test.
    fn collector(response: &'static str) -> (u16, mpsc::Receiver<String>) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let tx = tx.clone();
                thread::spawn(move || {
                    let mut writer = stream.try_clone().unwrap();
                    let mut reader = BufReader::new(stream);
                    loop {
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
                            return;
                        }
                        loop {
                            let mut header = String::new();
                            if reader.read_line(&mut header).unwrap_or(0) == 0 {
                                return;
                            }
                            if header.trim().is_empty() {
                                break;
                            }
                        }
                        let _ = tx.send(request_line.trim_end().to_string());
                        if writer.write_all(response.as_bytes()).is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (port, rx)
    }

    fn timing(connect_ms: u32, io_ms: u32) -> TimingConfig {
        TimingConfig {
            telemetry_connect_timeout_ms: connect_ms,
            telemetry_io_timeout_ms: io_ms,
            ..TimingConfig::default()
        }
    }

    #[test]
    fn form_session_submits_and_pings_over_http() {
        let (port, requests) = collector("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        let target = FormTarget::new("127.0.0.1", port, false, "/log", "entry.1");
        let mut session = FormSession::new(ReqwestTransport::new(&timing(1_000, 1_000)), target);

        session.open().unwrap();
        assert_eq!(session.submit("boot (0s ago)").unwrap(), 200);
        assert_eq!(session.keep_alive().unwrap(), 200);

        let wait = Duration::from_secs(2);
        assert_eq!(
            requests.recv_timeout(wait).unwrap(),
            "GET /log?entry.1=boot%20%280s%20ago%29 HTTP/1.1"
        );
        assert_eq!(requests.recv_timeout(wait).unwrap(), "HEAD /log HTTP/1.1");
    }

    #[test]
    fn silent_collector_times_out_and_closes_the_session() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let held: Vec<_> = listener.incoming().take(1).collect();
            thread::sleep(Duration::from_secs(3));
            drop(held);
        });
        let target = FormTarget::new("127.0.0.1", port, false, "/log", "entry.1");
        let mut session = FormSession::new(ReqwestTransport::new(&timing(500, 200)), target);

        session.open().unwrap();
        let started = Instant::now();
        assert!(matches!(session.submit("boot"), Err(LinkError::Timeout(900))));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!session.is_open());
    }

    #[test]
    fn env_overrides_replace_network_targets() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KASA_HOST", "10.0.0.9"),
            ("KASA_PORT", "10999"),
            ("TELEMETRY_HOST", "127.0.0.1"),
            ("TELEMETRY_PORT", "8081"),
        ]);
        let mut runtime = RuntimeConfig::default();

        apply_env_overrides(&mut runtime, |key| env.get(key).map(|value| value.to_string()));

        assert_eq!(runtime.network.kasa_host, "10.0.0.9");
        assert_eq!(runtime.network.kasa_port, 10999);
        assert_eq!(runtime.network.telemetry_host, "127.0.0.1");
        assert_eq!(runtime.network.telemetry_port, 8081);
        assert!(!runtime.network.telemetry_tls);
    }

    #[test]
    fn unparsable_ports_are_ignored() {
        let mut runtime = RuntimeConfig::default();

        apply_env_overrides(&mut runtime, |key| (key == "KASA_PORT").then(|| "plug".to_string()));

        assert_eq!(runtime.network.kasa_port, 9999);
        assert!(runtime.network.telemetry_tls);
    }

    #[test]
    fn simulated_ranger_reports_the_pulse_distance() {
        let sim = Arc::new(SimInputs::default());
        let mut sampler = RangeSampler::new(
            SimRanger::lower(sim.clone()),
            SimRanger::upper(sim.clone()),
            5_800,
            25,
        );
        assert_eq!(sampler.sample(), SensorReading::default());

        sim.lower_cm.store(60, Ordering::Relaxed);
        sim.lower_until_ms.store(monotonic_ms() + 60_000, Ordering::Relaxed);
        sim.upper_cm.store(200, Ordering::Relaxed);
        sim.upper_until_ms.store(monotonic_ms() + 60_000, Ordering::Relaxed);

        assert_eq!(
            sampler.sample(),
            SensorReading {
                lower_detected: true,
                upper_detected: false,
            }
        );
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(resolve_timezone("Mars/Olympus"), Tz::UTC);
        assert_eq!(resolve_timezone("America/Los_Angeles"), Tz::America__Los_Angeles);
    }
}
