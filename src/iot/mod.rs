//! IoT publication sink.
//!
//! One [`Publisher`] value is owned by the top-level service and shared with
//! the workers. Two modes:
//!
//! - `log`: append-only JSON-Lines records in `iot_log.jsonl`;
//! - `mqtt`: MQTT v3.1.1 publish with optional TLS 1.2 mutual auth.
//!
//! Stream topics (`<display>/stream/...`) are gated by a pair of atomic
//! flags: a local toggle and a remote one driven by a control-topic
//! subscriber thread. Publish failures never propagate into the pipeline;
//! they degrade to an `{error, payload}` record in the local JSONL sink.

use crate::config::{IotConfig, IotKind};
use chrono::Local;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

mod control;

pub use control::parse_stream_control;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("log sink error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("tls material missing: {0}")]
    TlsMaterial(String),
}

/// Marker substring of gated live-stream topics.
const STREAM_TOPIC_MARKER: &str = "/stream/";

/// How long a one-shot MQTT publish may wait for its ack.
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Stream Gate
// ============================================================================

/// Shared enable state for live-stream topics. Local and remote sources are
/// tracked separately so a remote disable does not clobber a local enable.
#[derive(Debug, Default)]
pub struct StreamGate {
    local: AtomicBool,
    remote: AtomicBool,
}

impl StreamGate {
    pub fn set_local(&self, enabled: bool) {
        self.local.store(enabled, Ordering::Relaxed);
    }

    pub fn set_remote(&self, enabled: bool) {
        self.remote.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.local.load(Ordering::Relaxed) || self.remote.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Publication sink shared across device workers and services.
pub struct Publisher {
    cfg: IotConfig,
    /// Directory holding `iot_log.jsonl`.
    data_dir: PathBuf,
    gate: Arc<StreamGate>,
    log_lock: Mutex<()>,
    control: Mutex<Option<control::ControlSubscriber>>,
}

impl Publisher {
    pub fn new(cfg: IotConfig, data_dir: &Path) -> Arc<Self> {
        let publisher = Arc::new(Self {
            cfg,
            data_dir: data_dir.to_path_buf(),
            gate: Arc::new(StreamGate::default()),
            log_lock: Mutex::new(()),
            control: Mutex::new(None),
        });
        if publisher.cfg.kind == IotKind::Mqtt {
            publisher.start_control_subscriber(Vec::new());
        }
        publisher
    }

    pub fn gate(&self) -> Arc<StreamGate> {
        Arc::clone(&self.gate)
    }

    /// (Re)start the control-topic subscriber with the display names that may
    /// toggle remote streaming. No-op in log mode.
    pub fn start_control_subscriber(&self, allowed_names: Vec<String>) {
        if self.cfg.kind != IotKind::Mqtt {
            return;
        }
        let mut slot = self.control.lock();
        if let Some(old) = slot.take() {
            old.stop();
        }
        *slot = Some(control::ControlSubscriber::spawn(
            &self.cfg,
            Arc::clone(&self.gate),
            allowed_names,
        ));
    }

    /// Stop the control subscriber thread, if any.
    pub fn shutdown(&self) {
        if let Some(ctrl) = self.control.lock().take() {
            ctrl.stop();
        }
    }

    /// Publish to the default topic.
    pub fn publish(&self, payload: &Value) {
        self.publish_to(payload, None);
    }

    /// Publish to an explicit topic. Stream topics are dropped while the
    /// gate is closed. Failures are logged and recorded locally; the caller
    /// never sees an error.
    pub fn publish_to(&self, payload: &Value, topic: Option<&str>) {
        if let Some(t) = topic {
            if t.contains(STREAM_TOPIC_MARKER) && !self.gate.is_enabled() {
                return;
            }
        }
        let result = match self.cfg.kind {
            IotKind::Log => self.write_record(payload, topic, None),
            IotKind::Mqtt => self.publish_mqtt(payload, topic),
        };
        if let Err(e) = result {
            warn!(error = %e, topic = topic.unwrap_or(&self.cfg.topic), "iot publish failed");
            let record = json!({ "error": e.to_string(), "payload": payload });
            if let Err(e2) = self.write_record(&record, topic, None) {
                warn!(error = %e2, "iot fallback record failed");
            }
        }
    }

    /// Append one record to `iot_log.jsonl`.
    fn write_record(
        &self,
        payload: &Value,
        topic: Option<&str>,
        note: Option<&str>,
    ) -> Result<(), PublishError> {
        let record = json!({
            "ts": Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            "payload": payload,
            "topic": topic.unwrap_or(&self.cfg.topic),
            "type": self.cfg.kind,
            "host": self.cfg.host,
            "note": note,
        });
        let line = serde_json::to_string(&record)?;

        let _guard = self.log_lock.lock();
        std::fs::create_dir_all(&self.data_dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join("iot_log.jsonl"))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// One-shot MQTT publish: connect, send with QoS 1, wait for the ack,
    /// disconnect.
    fn publish_mqtt(&self, payload: &Value, topic: Option<&str>) -> Result<(), PublishError> {
        use rumqttc::{Client, Event, MqttOptions, Packet, QoS};

        let topic = topic.unwrap_or(&self.cfg.topic);
        let body = serde_json::to_vec(payload)?;

        let mut opts = MqttOptions::new(self.cfg.client_id.clone(), &self.cfg.host, self.cfg.port);
        opts.set_keep_alive(Duration::from_secs(60));
        if !self.cfg.username.is_empty() {
            opts.set_credentials(self.cfg.username.clone(), self.cfg.password.clone());
        }
        if let Some(tls) = control::tls_transport(&self.cfg)? {
            opts.set_transport(tls);
        }

        let (client, mut connection) = Client::new(opts, 10);
        client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .map_err(|e| PublishError::Mqtt(e.to_string()))?;

        // Drive the event loop until the broker acks (or the deadline hits).
        let deadline = std::time::Instant::now() + PUBLISH_ACK_TIMEOUT;
        let mut acked = false;
        for notification in connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::PubAck(_))) => {
                    acked = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(PublishError::Mqtt(e.to_string())),
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
        }
        let _ = client.disconnect();
        if acked {
            debug!(topic, "mqtt publish acked");
            self.write_record(payload, Some(topic), Some("mqtt publish ok"))?;
            Ok(())
        } else {
            Err(PublishError::Mqtt(format!("no ack from broker for {topic}")))
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Some(ctrl) = self.control.lock().take() {
            ctrl.stop();
        }
    }
}

/// Startup connectivity probe sent whenever the service (re)starts.
pub fn publish_startup_test(publisher: &Publisher, device_names: &[String]) {
    let payload = json!({
        "type": "startup_test",
        "ts": Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        "message": "iot connectivity test",
        "devices": device_names,
    });
    publisher.publish(&payload);
    info!(devices = ?device_names, "startup iot test published");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IotConfig;

    fn log_publisher(dir: &Path) -> Arc<Publisher> {
        Publisher::new(IotConfig::default(), dir)
    }

    #[test]
    fn log_mode_appends_jsonl_records() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = log_publisher(dir.path());
        publisher.publish(&json!({"hello": 1}));
        publisher.publish_to(&json!({"hello": 2}), Some("tower/data/vib"));

        let text = std::fs::read_to_string(dir.path().join("iot_log.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["payload"]["hello"], 1);
        assert_eq!(first["topic"], "towerguard/data");

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["topic"], "tower/data/vib");
    }

    #[test]
    fn stream_topics_are_dropped_while_gate_closed() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = log_publisher(dir.path());

        publisher.publish_to(&json!({"v": 1}), Some("tower/stream/vib"));
        assert!(!dir.path().join("iot_log.jsonl").exists());

        publisher.gate().set_local(true);
        publisher.publish_to(&json!({"v": 2}), Some("tower/stream/vib"));
        let text = std::fs::read_to_string(dir.path().join("iot_log.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn remote_and_local_gate_sources_are_independent() {
        let gate = StreamGate::default();
        assert!(!gate.is_enabled());
        gate.set_remote(true);
        assert!(gate.is_enabled());
        gate.set_local(true);
        gate.set_remote(false);
        assert!(gate.is_enabled());
        gate.set_local(false);
        assert!(!gate.is_enabled());
    }

    #[test]
    fn data_topics_are_not_gated() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = log_publisher(dir.path());
        publisher.publish_to(&json!({"v": 1}), Some("tower/data/fatigue"));
        assert!(dir.path().join("iot_log.jsonl").exists());
    }
}
