//! Remote stream-control subscriber.
//!
//! Listens on the configured control topic (`+/control/stream`) and toggles
//! the remote half of the [`StreamGate`](super::StreamGate). A message is
//! honored only when its payload names a `display_name` and `timestamp`, the
//! topic prefix equals that display name, and the name is on the configured
//! allow-list.

use crate::config::IotConfig;
use crate::iot::{PublishError, StreamGate};
use rumqttc::{Client, Event, MqttOptions, Packet, Transport};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parsed control message: desired state plus its addressing fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamControl {
    pub enabled: bool,
    pub display_name: Option<String>,
    pub timestamp: Option<String>,
}

/// Parse a control payload. Accepts `{"enabled": true, "display_name": ..,
/// "timestamp": ..}` with bool/number/string coercions for the flag, plus
/// `stream` / `stream_enabled` aliases. Returns `None` when no usable flag
/// is present.
pub fn parse_stream_control(raw: &[u8]) -> Option<StreamControl> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        match value {
            Value::Object(map) => {
                let display_name = map
                    .get("display_name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let timestamp = map
                    .get("timestamp")
                    .or_else(|| map.get("ts"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                for key in ["enabled", "stream", "stream_enabled"] {
                    if let Some(flag) = map.get(key).and_then(coerce_flag) {
                        return Some(StreamControl {
                            enabled: flag,
                            display_name,
                            timestamp,
                        });
                    }
                }
                None
            }
            other => coerce_flag(&other).map(|enabled| StreamControl {
                enabled,
                display_name: None,
                timestamp: None,
            }),
        }
    } else {
        flag_from_text(text).map(|enabled| StreamControl {
            enabled,
            display_name: None,
            timestamp: None,
        })
    }
}

fn coerce_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => flag_from_text(s),
        _ => None,
    }
}

fn flag_from_text(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" | "enable" | "enabled" | "start" => Some(true),
        "0" | "false" | "off" | "no" | "disable" | "disabled" | "stop" => Some(false),
        _ => None,
    }
}

/// Decide whether a control message toggles the gate.
///
/// The topic must look like `<name>/control/stream`, the payload must carry a
/// matching `display_name` and a `timestamp`, and `<name>` must be allowed.
pub fn control_applies(topic: &str, ctrl: &StreamControl, allowed: &[String]) -> bool {
    let (Some(display_name), Some(_)) = (&ctrl.display_name, &ctrl.timestamp) else {
        return false;
    };
    let Some(prefix) = topic.strip_suffix("/control/stream") else {
        return false;
    };
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    if !allowed.iter().any(|n| n == prefix) {
        return false;
    }
    display_name.trim() == prefix
}

/// Build the TLS transport when certificate material is configured.
pub fn tls_transport(cfg: &IotConfig) -> Result<Option<Transport>, PublishError> {
    if cfg.ca_cert.is_empty() && cfg.certfile.is_empty() && cfg.keyfile.is_empty() {
        return Ok(None);
    }
    let read = |label: &str, path: &str| -> Result<Vec<u8>, PublishError> {
        if path.is_empty() {
            return Err(PublishError::TlsMaterial(format!("{label} not configured")));
        }
        std::fs::read(path)
            .map_err(|e| PublishError::TlsMaterial(format!("{label} {path}: {e}")))
    };
    let ca = read("ca_cert", &cfg.ca_cert)?;
    let client_auth = if cfg.certfile.is_empty() && cfg.keyfile.is_empty() {
        None
    } else {
        Some((read("certfile", &cfg.certfile)?, read("keyfile", &cfg.keyfile)?))
    };
    Ok(Some(Transport::Tls(rumqttc::TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })))
}

// ============================================================================
// Subscriber Thread
// ============================================================================

/// Background subscription driving the remote stream gate.
pub struct ControlSubscriber {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlSubscriber {
    pub fn spawn(cfg: &IotConfig, gate: Arc<StreamGate>, allowed: Vec<String>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let cfg = cfg.clone();
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("iot-control".to_string())
            .spawn(move || run_subscriber(&cfg, &gate, &allowed, &stop_flag))
            .ok();
        if handle.is_none() {
            warn!("failed to spawn iot control subscriber thread");
        }
        Self { stop, handle }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // The connection iterator wakes on its own keep-alive cadence;
            // give it a bounded grace period, then let the thread leak.
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(25));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("iot control subscriber did not stop in time; leaking thread");
            }
        }
    }
}

fn run_subscriber(
    cfg: &IotConfig,
    gate: &Arc<StreamGate>,
    allowed: &[String],
    stop: &Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = subscribe_once(cfg, gate, allowed, stop) {
            warn!(error = %e, "control subscription lost; retrying");
        }
        // Back off before reconnecting.
        for _ in 0..20 {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

fn subscribe_once(
    cfg: &IotConfig,
    gate: &Arc<StreamGate>,
    allowed: &[String],
    stop: &Arc<AtomicBool>,
) -> Result<(), PublishError> {
    let sub_id = format!("{}-sub", cfg.client_id);
    let mut opts = MqttOptions::new(sub_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(60));
    if !cfg.username.is_empty() {
        opts.set_credentials(cfg.username.clone(), cfg.password.clone());
    }
    if let Some(tls) = tls_transport(cfg)? {
        opts.set_transport(tls);
    }

    let (client, mut connection) = Client::new(opts, 10);
    client
        .subscribe(&cfg.control_topic, rumqttc::QoS::AtLeastOnce)
        .map_err(|e| PublishError::Mqtt(e.to_string()))?;
    info!(topic = %cfg.control_topic, "subscribed to stream control");

    for notification in connection.iter() {
        if stop.load(Ordering::Relaxed) {
            let _ = client.disconnect();
            return Ok(());
        }
        match notification {
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                let Some(ctrl) = parse_stream_control(&msg.payload) else {
                    continue;
                };
                if control_applies(&msg.topic, &ctrl, allowed) {
                    info!(topic = %msg.topic, enabled = ctrl.enabled, "remote stream toggle");
                    gate.set_remote(ctrl.enabled);
                } else {
                    debug!(topic = %msg.topic, "ignored stream control message");
                }
            }
            Ok(_) => {}
            Err(e) => return Err(PublishError::Mqtt(e.to_string())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_control_payload() {
        let raw = br#"{"enabled": true, "display_name": "tower-a", "timestamp": "2025-01-01T00:00:00"}"#;
        let ctrl = parse_stream_control(raw).unwrap();
        assert!(ctrl.enabled);
        assert_eq!(ctrl.display_name.as_deref(), Some("tower-a"));
        assert!(ctrl.timestamp.is_some());
    }

    #[test]
    fn coerces_flag_spellings() {
        let cases: [(&[u8], bool); 5] = [
            (b"true", true),
            (b"0", false),
            (b"\"on\"", true),
            (b"{\"stream\": 1}", true),
            (b"{\"stream_enabled\": \"off\"}", false),
        ];
        for (raw, expected) in cases {
            let ctrl = parse_stream_control(raw).unwrap();
            assert_eq!(ctrl.enabled, expected, "payload {:?}", raw);
        }
        assert!(parse_stream_control(b"maybe").is_none());
        assert!(parse_stream_control(b"").is_none());
    }

    #[test]
    fn control_requires_matching_topic_and_allow_list() {
        let allowed = vec!["tower-a".to_string()];
        let ctrl = StreamControl {
            enabled: true,
            display_name: Some("tower-a".to_string()),
            timestamp: Some("2025-01-01T00:00:00".to_string()),
        };

        assert!(control_applies("tower-a/control/stream", &ctrl, &allowed));
        // Name not allowed.
        assert!(!control_applies("tower-b/control/stream", &ctrl, &allowed));
        // Payload name disagrees with the topic.
        let mismatched = StreamControl {
            display_name: Some("tower-b".to_string()),
            ..ctrl.clone()
        };
        assert!(!control_applies("tower-a/control/stream", &mismatched, &allowed));
        // Missing timestamp.
        let no_ts = StreamControl {
            timestamp: None,
            ..ctrl.clone()
        };
        assert!(!control_applies("tower-a/control/stream", &no_ts, &allowed));
        // Wrong topic shape.
        assert!(!control_applies("tower-a/data/vib", &ctrl, &allowed));
    }
}
