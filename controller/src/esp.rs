use std::{
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Read,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::EspWifi,
};
use log::{debug, info, warn};

use stairlight_common::{
    config::{HardwareConfig, NetworkConfig, TimingConfig},
    resolve,
    telemetry::USER_AGENT,
    ControllerState, FormSession, FormTarget, HttpTransport, Indicators, KasaClient, LinkError,
    MicrosClock, Millis, NetworkLinks, RangeSampler, RequestMethod, RuntimeConfig, SensorReading,
    StairHardware, TickPacer, Ultrasonic, WifiLink,
};

const NVS_NAMESPACE: &str = "stairlight";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const CONTROL_STACK_SIZE: usize = 16 * 1024;
const WIFI_POLL_MS: u64 = 100;
const LED_FAST_BLINK_MS: u64 = 200;
const LED_SLOW_BLINK_MS: u64 = 900;
const MAX_RESPONSE_BODY: usize = 16 * 1024;

type Trigger = PinDriver<'static, AnyOutputPin, Output>;
type Echo = PinDriver<'static, AnyInputPin, Input>;
type Sensor = Ultrasonic<Trigger, Echo, Ets, EspMicros>;

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.repair();

    info!(
        "NVS config loaded: ssid=`{}`, switch=`{}:{}`, telemetry=`{}:{}` (tls={}, enabled={})",
        runtime.network.wifi_ssid,
        runtime.network.kasa_host,
        runtime.network.kasa_port,
        runtime.network.telemetry_host,
        runtime.network.telemetry_port,
        runtime.network.telemetry_tls,
        runtime.network.telemetry_enabled(),
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let board = init_board(&runtime.hardware, &runtime.timing)
        .context("failed to set up stair hardware")?;
    let wifi = StationWifi::new(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let control = thread::Builder::new()
        .name("control-loop".into())
        .stack_size(CONTROL_STACK_SIZE)
        .spawn(move || control_loop(runtime, board, wifi))
        .context("failed to spawn control loop")?;

    control
        .join()
        .map_err(|_| anyhow!("control loop panicked"))?
}

fn control_loop(
    runtime: RuntimeConfig,
    mut board: EspBoard,
    wifi: StationWifi,
) -> anyhow::Result<()> {
    let timing = runtime.timing.clone();
    init_watchdog(timing.watchdog_timeout_ms)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    // SNTP runs in the background; the daylight gate copes with an unsynced
    // clock until the first update lands.
    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let network = &runtime.network;
    let mut links = NetworkLinks {
        wifi,
        switch: KasaClient::new(
            network.kasa_host.clone(),
            network.kasa_port,
            timing.kasa_connect_timeout_ms,
            timing.kasa_io_timeout_ms,
        )
        .with_lookup_timeout(timing.dns_timeout_ms),
        telemetry: FormSession::new(EspHttpTransport::new(&timing), FormTarget::from_config(network)),
    };

    let timezone = resolve_timezone(&runtime.site.timezone);
    let pacer = TickPacer::new(timing.tick_interval_ms);
    let mut state = ControllerState::new(runtime.clone(), Millis::from_u64(monotonic_ms()));
    info!(
        "control loop running every {} ms (worst case {} ms, watchdog {} ms)",
        timing.tick_interval_ms,
        timing.worst_case_tick_ms(),
        timing.watchdog_timeout_ms
    );

    loop {
        feed_watchdog();
        let tick_start = Millis::from_u64(monotonic_ms());
        let report = state.tick(&mut board, &mut links, tick_start, now_in(timezone));
        if let Some((command, outcome)) = report.porch {
            info!("porch {} -> {outcome:?}", command.as_str());
        }

        let now = Millis::from_u64(monotonic_ms());
        thread::sleep(pacer.remaining(tick_start, now));
    }
}

fn init_board(hardware: &HardwareConfig, timing: &TimingConfig) -> anyhow::Result<EspBoard> {
    let lower = init_sensor(hardware.lower_trigger_pin, hardware.lower_echo_pin)
        .context("lower sensor")?;
    let upper = init_sensor(hardware.upper_trigger_pin, hardware.upper_echo_pin)
        .context("upper sensor")?;
    let mut relay = unsafe { PinDriver::output(AnyOutputPin::new(hardware.relay_pin)) }
        .with_context(|| format!("relay on GPIO{}", hardware.relay_pin))?;
    set_level(&mut relay, !hardware.relay_active_high)?;
    info!(
        "sensors on GPIO{}/{} and GPIO{}/{}, relay on GPIO{}",
        hardware.lower_trigger_pin,
        hardware.lower_echo_pin,
        hardware.upper_trigger_pin,
        hardware.upper_echo_pin,
        hardware.relay_pin
    );

    Ok(EspBoard {
        sampler: RangeSampler::new(
            lower,
            upper,
            timing.detect_threshold_us,
            timing.echo_timeout_ms,
        ),
        relay,
        relay_active_high: hardware.relay_active_high,
        wifi_led: init_status_led(hardware.wifi_led_pin),
        porch_led: init_status_led(hardware.porch_led_pin),
    })
}

fn init_sensor(trigger_pin: i32, echo_pin: i32) -> anyhow::Result<Sensor> {
    let trigger = unsafe { PinDriver::output(AnyOutputPin::new(trigger_pin)) }
        .with_context(|| format!("trigger on GPIO{trigger_pin}"))?;
    let echo = unsafe { PinDriver::input(AnyInputPin::new(echo_pin)) }
        .with_context(|| format!("echo on GPIO{echo_pin}"))?;
    Ok(Ultrasonic::new(trigger, echo, Ets, EspMicros))
}

fn set_level(pin: &mut PinDriver<'static, AnyOutputPin, Output>, high: bool) -> anyhow::Result<()> {
    if high {
        pin.set_high()?;
    } else {
        pin.set_low()?;
    }
    Ok(())
}

/// Microseconds since boot from the high-resolution ESP timer.
struct EspMicros;

impl MicrosClock for EspMicros {
    fn now_us(&mut self) -> u64 {
        let now = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        u64::try_from(now).unwrap_or_default()
    }
}

struct EspBoard {
    sampler: RangeSampler<Sensor, Sensor>,
    relay: PinDriver<'static, AnyOutputPin, Output>,
    relay_active_high: bool,
    wifi_led: Option<StatusLed>,
    porch_led: Option<StatusLed>,
}

impl StairHardware for EspBoard {
    fn sample(&mut self) -> SensorReading {
        self.sampler.sample()
    }

    fn set_stair_light(&mut self, on: bool) {
        if let Err(err) = set_level(&mut self.relay, on == self.relay_active_high) {
            warn!("failed to drive stair relay: {err:#}");
        }
    }

    fn show_status(&mut self, indicators: Indicators) {
        let now_ms = monotonic_ms();
        update_status_led(&mut self.wifi_led, wifi_led_on(indicators, now_ms));
        update_status_led(&mut self.porch_led, indicators.porch_armed);
    }
}

/// Fast blink without Wi-Fi, slow blink while the telemetry session is
/// down, solid when everything is connected.
fn wifi_led_on(indicators: Indicators, now_ms: u64) -> bool {
    if !indicators.wifi_connected {
        (now_ms / LED_FAST_BLINK_MS) % 2 == 0
    } else if !indicators.telemetry_open {
        (now_ms / LED_SLOW_BLINK_MS) % 2 == 0
    } else {
        true
    }
}

struct StationWifi {
    wifi: EspWifi<'static>,
    configured: bool,
}

impl StationWifi {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

        if network.wifi_ssid.is_empty() {
            warn!("wifi credentials missing; running offline");
            return Ok(Self {
                wifi,
                configured: false,
            });
        }

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;
        wifi.start()?;
        disable_wifi_power_save();
        info!("wifi started, station `{}`", network.wifi_ssid);

        Ok(Self {
            wifi,
            configured: true,
        })
    }
}

impl WifiLink for StationWifi {
    fn is_connected(&mut self) -> bool {
        self.configured && is_wifi_station_connected() && self.wifi.is_up().unwrap_or(false)
    }

    fn connect(&mut self, timeout_ms: u32) -> Result<(), LinkError> {
        if !self.configured {
            return Err(LinkError::NotConnected);
        }

        let _ = self.wifi.disconnect();
        self.wifi
            .connect()
            .map_err(|err| LinkError::protocol(format!("wifi connect: {err}")))?;

        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        while Instant::now() < deadline {
            feed_watchdog();
            if self.wifi.is_up().unwrap_or(false) {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(WIFI_POLL_MS));
        }

        let _ = self.wifi.disconnect();
        Err(LinkError::Timeout(timeout_ms))
    }
}

/// Telemetry over the ESP-IDF HTTP client, which keeps its connection
/// alive between requests.
struct EspHttpTransport {
    timeout: Duration,
    lookup_timeout: Duration,
    client: Option<HttpClient<EspHttpConnection>>,
}

impl EspHttpTransport {
    fn new(timing: &TimingConfig) -> Self {
        // esp_http_client applies one timeout to every socket operation,
        // connect and handshake included.
        let timeout_ms = timing
            .telemetry_io_timeout_ms
            .min(timing.telemetry_connect_timeout_ms);
        Self {
            timeout: Duration::from_millis(u64::from(timeout_ms)),
            lookup_timeout: Duration::from_millis(u64::from(timing.dns_timeout_ms)),
            client: None,
        }
    }
}

fn http_error(err: impl core::fmt::Debug) -> LinkError {
    LinkError::protocol(format!("{err:?}"))
}

impl HttpTransport for EspHttpTransport {
    fn connect(&mut self, target: &FormTarget) -> Result<(), LinkError> {
        // Warms the lwIP resolver cache under our deadline; the client's own
        // lookup is then answered locally.
        let addr = resolve::lookup(&target.host, target.port, self.lookup_timeout)?;
        debug!("telemetry host {} at {addr}", target.host);

        let config = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: if target.tls {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            } else {
                None
            },
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&config).map_err(http_error)?;
        self.client = Some(HttpClient::wrap(connection));
        Ok(())
    }

    fn request(&mut self, method: RequestMethod, url: &str) -> Result<u16, LinkError> {
        let client = self.client.as_mut().ok_or(LinkError::NotConnected)?;
        let method = match method {
            RequestMethod::Get => Method::Get,
            RequestMethod::Head => Method::Head,
        };
        let headers = [("User-Agent", USER_AGENT), ("Connection", "keep-alive")];
        let request = client.request(method, url, &headers).map_err(http_error)?;
        let mut response = request.submit().map_err(http_error)?;
        let status = response.status();

        let mut chunk = [0_u8; 256];
        let mut drained = 0_usize;
        loop {
            let read = response.read(&mut chunk).map_err(http_error)?;
            if read == 0 {
                break;
            }
            drained += read;
            if drained > MAX_RESPONSE_BODY {
                return Err(LinkError::protocol(format!(
                    "response body over {MAX_RESPONSE_BODY} bytes"
                )));
            }
        }
        Ok(status)
    }

    fn disconnect(&mut self) {
        self.client = None;
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn init_watchdog(timeout_ms: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms,
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    if pin < 0 {
        return None;
    }
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn update_status_led(status_led: &mut Option<StatusLed>, desired_on: bool) {
    let Some(led) = status_led.as_mut() else {
        return;
    };

    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
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

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
