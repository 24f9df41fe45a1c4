//! Device listener: subscribes to a per-device channel and answers commands.
//!
//! Commands handled:
//! - `health.ping`: confirm the device is online
//! - `vitals.request`: report system metrics
//! - `capture.request`: run the capture script and report the result
//!
//! Configured via environment (a `.env` file is loaded first): the usual
//! `REVERB_*` variables plus `DEVICE_ID`, `API_BASE_URL`, `API_TOKEN`,
//! `CAPTURE_SCRIPT`, and `IMAGE_BASE_PATH`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reverb_client::{handler, Event, ReverbClient, ReverbError, Result};

/// Minimum spacing between capture requests.
const CAPTURE_COOLDOWN: Duration = Duration::from_secs(15);
const RETRY_DELAY: Duration = Duration::from_secs(5);

struct ListenerSettings {
    device_id: String,
    api_base_url: String,
    api_token: String,
    capture_script: PathBuf,
    image_base_path: String,
}

impl ListenerSettings {
    fn from_env() -> Result<Self> {
        let device_id = std::env::var("DEVICE_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ReverbError::Configuration("DEVICE_ID is not set".into()))?;
        let api_base_url = std::env::var("API_BASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| v.trim_end_matches('/').to_string())
            .ok_or_else(|| ReverbError::Configuration("API_BASE_URL is not set".into()))?;

        Ok(Self {
            device_id,
            api_base_url,
            api_token: std::env::var("API_TOKEN").unwrap_or_default(),
            capture_script: std::env::var("CAPTURE_SCRIPT")
                .unwrap_or_else(|_| "/opt/scripts/capture.sh".into())
                .into(),
            image_base_path: std::env::var("IMAGE_BASE_PATH")
                .unwrap_or_else(|_| "/var/www/html/images".into()),
        })
    }
}

struct DeviceListener {
    settings: ListenerSettings,
    http: reqwest::Client,
    last_capture: StdMutex<Option<Instant>>,
    capture_in_progress: AtomicBool,
}

impl DeviceListener {
    fn new(settings: ListenerSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            http: reqwest::Client::new(),
            last_capture: StdMutex::new(None),
            capture_in_progress: AtomicBool::new(false),
        })
    }

    /// One connection lifetime: connect, subscribe, serve until the
    /// connection reaches its terminal state.
    async fn run(self: Arc<Self>) -> Result<()> {
        let client = ReverbClient::from_env()?;
        client.connect().await?;
        info!("connected socket_id={:?}", client.socket_id());

        let channel_name = format!("device.{}", self.settings.device_id);
        let channel = client.subscribe(&channel_name).await?;
        info!("listening on channel {channel_name}");

        let listener = Arc::clone(&self);
        channel
            .bind(
                "health.ping",
                handler(move |event| {
                    let listener = Arc::clone(&listener);
                    async move { listener.on_health_ping(event).await }
                }),
            )
            .await;

        let listener = Arc::clone(&self);
        channel
            .bind(
                "vitals.request",
                handler(move |event| {
                    let listener = Arc::clone(&listener);
                    async move { listener.on_vitals_request(event).await }
                }),
            )
            .await;

        let listener = Arc::clone(&self);
        channel
            .bind(
                "capture.request",
                handler(move |event| {
                    let listener = Arc::clone(&listener);
                    async move { listener.on_capture_request(event).await }
                }),
            )
            .await;

        channel
            .bind(
                "*",
                handler(|event: Event| async move {
                    debug!("channel event {} data={}", event.name, event.data);
                    Ok(())
                }),
            )
            .await;

        client.listen().await;
        Ok(())
    }

    async fn on_health_ping(&self, event: Event) -> Result<()> {
        let request_id = request_id_of(&event.data);
        info!("health.ping request_id={request_id}");

        self.api_post(
            "/api/device/pong",
            json!({
                "device_id": self.settings.device_id,
                "request_id": request_id,
                "status": "online",
            }),
        )
        .await
    }

    async fn on_vitals_request(&self, event: Event) -> Result<()> {
        let request_id = request_id_of(&event.data);
        info!("vitals.request request_id={request_id}");

        self.api_post(
            "/api/device/vitals",
            json!({
                "device_id": self.settings.device_id,
                "request_id": request_id,
                "vitals": collect_vitals(),
            }),
        )
        .await
    }

    async fn on_capture_request(&self, event: Event) -> Result<()> {
        let request_id = request_id_of(&event.data);
        let params = event.data.get("params").cloned().unwrap_or(json!({}));
        info!("capture.request request_id={request_id} params={params}");

        if self.capture_in_progress.swap(true, Ordering::SeqCst) {
            warn!("capture.request ignored, capture already in progress");
            return Ok(());
        }

        let cooled_down = {
            let last = self.last_capture.lock().unwrap();
            last.map(|t| t.elapsed() >= CAPTURE_COOLDOWN).unwrap_or(true)
        };
        if !cooled_down {
            warn!("capture.request ignored, cooldown active request_id={request_id}");
            self.capture_in_progress.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let script = self.settings.capture_script.clone();
        if !script.exists() {
            error!("capture script not found: {}", script.display());
            self.capture_in_progress.store(false, Ordering::SeqCst);
            return self
                .capture_complete(&request_id, false, Some("capture script not found"), None)
                .await;
        }

        *self.last_capture.lock().unwrap() = Some(Instant::now());
        let result = self.run_capture_script(&script, &request_id, &params).await;
        self.capture_in_progress.store(false, Ordering::SeqCst);

        match result {
            Ok(output) => {
                let image_path = (!output.is_empty()).then_some(output.as_str());
                self.capture_complete(&request_id, true, None, image_path)
                    .await
            }
            Err(e) => {
                error!("capture failed: {e}");
                self.capture_complete(&request_id, false, Some(&e.to_string()), None)
                    .await
            }
        }
    }

    async fn run_capture_script(
        &self,
        script: &Path,
        request_id: &str,
        params: &Value,
    ) -> std::result::Result<String, String> {
        info!("running capture script {}", script.display());

        let mut command = tokio::process::Command::new(script);
        command
            .env("REQUEST_ID", request_id)
            .env("DEVICE_ID", &self.settings.device_id)
            .env("API_BASE_URL", &self.settings.api_base_url)
            .env("API_TOKEN", &self.settings.api_token)
            .env("IMAGE_BASE_PATH", &self.settings.image_base_path);

        if let Some(params) = params.as_object() {
            for (key, value) in params {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                command.env(format!("CAPTURE_{}", key.to_uppercase()), value);
            }
        }

        let output = command
            .output()
            .await
            .map_err(|e| format!("capture script failed to start: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            info!("capture script succeeded: {stdout}");
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                Err(format!("exit code {:?}", output.status.code()))
            } else {
                Err(stderr)
            }
        }
    }

    async fn capture_complete(
        &self,
        request_id: &str,
        success: bool,
        error_text: Option<&str>,
        image_path: Option<&str>,
    ) -> Result<()> {
        self.api_post(
            "/api/device/capture/complete",
            json!({
                "device_id": self.settings.device_id,
                "request_id": request_id,
                "success": success,
                "error": error_text,
                "image_path": image_path,
            }),
        )
        .await
    }

    async fn api_post(&self, endpoint: &str, payload: Value) -> Result<()> {
        let url = format!("{}{endpoint}", self.settings.api_base_url);

        let mut request = self.http.post(&url).json(&payload);
        if !self.settings.api_token.is_empty() {
            request = request.bearer_auth(&self.settings.api_token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReverbError::Connection(format!("POST {endpoint} failed: {e}")))?;

        if response.status().is_success() {
            info!("POST {endpoint} ok");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ReverbError::Connection(format!(
                "POST {endpoint} failed: status {status}: {body}"
            )))
        }
    }
}

fn request_id_of(data: &Value) -> String {
    data.get("request_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

/// Best-effort system metrics from procfs; missing sources are skipped.
fn collect_vitals() -> Value {
    let mut vitals = serde_json::Map::new();
    vitals.insert("platform".into(), json!(std::env::consts::OS));
    vitals.insert("machine".into(), json!(std::env::consts::ARCH));

    if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
        vitals.insert("hostname".into(), json!(hostname.trim()));
    }

    if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
        let mut fields = loadavg.split_whitespace();
        for key in ["load_1m", "load_5m", "load_15m"] {
            if let Some(value) = fields.next().and_then(|f| f.parse::<f64>().ok()) {
                vitals.insert(key.into(), json!(value));
            }
        }
    }

    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let field = |name: &str| {
            meminfo
                .lines()
                .find(|line| line.starts_with(name))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok())
        };
        if let (Some(total), Some(available)) = (field("MemTotal:"), field("MemAvailable:")) {
            vitals.insert("mem_total_mb".into(), json!((total / 1024.0).round()));
            vitals.insert("mem_available_mb".into(), json!((available / 1024.0).round()));
            vitals.insert(
                "mem_used_percent".into(),
                json!(((1.0 - available / total) * 1000.0).round() / 10.0),
            );
        }
    }

    if let Ok(temp) = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp") {
        if let Ok(millis) = temp.trim().parse::<f64>() {
            vitals.insert("cpu_temp_c".into(), json!((millis / 100.0).round() / 10.0));
        }
    }

    if let Ok(uptime) = std::fs::read_to_string("/proc/uptime") {
        if let Some(seconds) = uptime
            .split_whitespace()
            .next()
            .and_then(|f| f.parse::<f64>().ok())
        {
            vitals.insert("uptime_seconds".into(), json!(seconds.round()));
            vitals.insert(
                "uptime_hours".into(),
                json!((seconds / 360.0).round() / 10.0),
            );
        }
    }

    Value::Object(vitals)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .try_init();
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let settings = match ListenerSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let level = std::env::var("REVERB_LOG_LEVEL").unwrap_or_else(|_| "info".into());
    init_logging(&level);

    info!(
        "starting device_id={} api_base_url={}",
        settings.device_id, settings.api_base_url
    );
    let listener = DeviceListener::new(settings);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            result = Arc::clone(&listener).run() => {
                match result {
                    Ok(()) => {
                        info!("connection closed, exiting");
                        break;
                    }
                    Err(e) => {
                        error!("connection error: {e}");
                        info!("reconnecting in {}s", RETRY_DELAY.as_secs());
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}
