//! Background liveness probes of the remote services with a three-strike
//! circuit breaker. Purely observational: the stages keep their own retry
//! and failover logic regardless of the reported state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;

const DEGRADED_AFTER: u32 = 1;
const FAILED_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub url: String,
    pub state: ServiceState,
    pub failure_count: u32,
    pub last_check: f64,
    pub last_success: f64,
    pub last_error: Option<String>,
    pub latency_ms: f64,
}

impl ServiceHealth {
    fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            state: ServiceState::Healthy,
            failure_count: 0,
            last_check: 0.0,
            last_success: 0.0,
            last_error: None,
            latency_ms: 0.0,
        }
    }

    fn record_success(&mut self, latency_ms: f64) {
        self.state = ServiceState::Healthy;
        self.failure_count = 0;
        self.last_success = unix_now();
        self.latency_ms = latency_ms;
        self.last_error = None;
    }

    fn record_failure(&mut self, error: String) {
        self.failure_count += 1;
        self.last_error = Some(error);

        if self.failure_count >= FAILED_AFTER {
            if self.state != ServiceState::Failed {
                log::error!(
                    "[HEALTH] {} marked FAILED after {} failures",
                    self.name,
                    self.failure_count
                );
            }
            self.state = ServiceState::Failed;
        } else if self.failure_count >= DEGRADED_AFTER {
            if self.state != ServiceState::Degraded {
                log::warn!(
                    "[HEALTH] {} marked DEGRADED ({} failures)",
                    self.name,
                    self.failure_count
                );
            }
            self.state = ServiceState::Degraded;
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Probes each remote service on an interval and tracks circuit-breaker
/// state for the `/health` surface.
pub struct HealthMonitor {
    client: reqwest::Client,
    interval: Duration,
    services: Mutex<HashMap<String, ServiceHealth>>,
}

impl HealthMonitor {
    pub fn new(settings: &Settings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.probe_timeout())
            .build()
            .expect("Failed to create HTTP client");

        let mut services = HashMap::new();
        services.insert(
            "asr_primary".to_string(),
            ServiceHealth::new("ASR (Whisper)", &settings.whisper_base_url),
        );
        services.insert(
            "llm_primary".to_string(),
            ServiceHealth::new("LLM", &settings.llm_base_url),
        );
        services.insert(
            "tts_primary".to_string(),
            ServiceHealth::new("TTS (primary)", &settings.parler_tts_base_url),
        );
        if let Some(fallback) = &settings.xtts_tts_base_url {
            services.insert(
                "tts_fallback".to_string(),
                ServiceHealth::new("TTS (fallback)", fallback),
            );
        }

        log::info!(
            "[HEALTH-MONITOR] tracking {} services (interval={}s)",
            services.len(),
            settings.health_check_interval
        );

        Self {
            client,
            interval: settings.health_interval(),
            services: Mutex::new(services),
        }
    }

    /// Probe loop; runs until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_all().await,
            }
        }
        log::info!("[HEALTH-MONITOR] stopped");
    }

    pub async fn check_all(&self) {
        let targets: Vec<(String, String)> = {
            let services = self.services.lock().unwrap();
            services
                .iter()
                .map(|(id, h)| (id.clone(), h.url.clone()))
                .collect()
        };

        for (service_id, url) in targets {
            let outcome = self.probe(&url).await;
            let mut services = self.services.lock().unwrap();
            if let Some(health) = services.get_mut(&service_id) {
                health.last_check = unix_now();
                match outcome {
                    Ok(latency_ms) => {
                        log::debug!("[HEALTH-CHECK] {} OK ({:.0}ms)", health.name, latency_ms);
                        health.record_success(latency_ms);
                    }
                    Err(error) => {
                        log::warn!("[HEALTH-CHECK] {} failed: {}", health.name, error);
                        health.record_failure(error);
                    }
                }
            }
        }
    }

    async fn probe(&self, base_url: &str) -> Result<f64, String> {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let started = std::time::Instant::now();
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                Ok(started.elapsed().as_secs_f64() * 1000.0)
            }
            Ok(response) => Err(format!("HTTP {}", response.status().as_u16())),
            Err(e) if e.is_timeout() => Err("Timeout".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Admin reset: force a service back to healthy and zero its counters.
    pub fn reset(&self, service_id: &str) -> bool {
        let mut services = self.services.lock().unwrap();
        match services.get_mut(service_id) {
            Some(health) => {
                health.state = ServiceState::Healthy;
                health.failure_count = 0;
                health.last_error = None;
                log::info!("[HEALTH] {} reset to healthy", health.name);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> HashMap<String, ServiceHealth> {
        self.services.lock().unwrap().clone()
    }

    /// True when no tracked service has tripped the breaker.
    pub fn all_available(&self) -> bool {
        self.services
            .lock()
            .unwrap()
            .values()
            .all(|h| h.state != ServiceState::Failed)
    }

    #[cfg(test)]
    fn force_failures(&self, service_id: &str, count: u32) {
        let mut services = self.services.lock().unwrap();
        if let Some(health) = services.get_mut(service_id) {
            for _ in 0..count {
                health.record_failure("injected".to_string());
            }
        }
    }
}
