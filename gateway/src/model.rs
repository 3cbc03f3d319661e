use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_TURNED_ON: bool = true;
pub const DEFAULT_COLLECT_FREQ: i32 = 1;
pub const DEFAULT_SEND_FREQ: i32 = 5;

/// Identity block a device sends in its handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    pub mac: String,
    #[serde(default)]
    pub ip: String,
}

/// First message on every device connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub time: i64,
    pub meta: Metadata,
    /// Opaque device payload, carried but never interpreted by the gateway.
    #[serde(default)]
    pub data: Value,
}

/// Operating configuration pushed to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub turned_on: bool,
    #[serde(default)]
    pub stream_on: bool,
    pub collect_freq: i32,
    pub send_freq: i32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            turned_on: DEFAULT_TURNED_ON,
            stream_on: false,
            collect_freq: DEFAULT_COLLECT_FREQ,
            send_freq: DEFAULT_SEND_FREQ,
        }
    }
}

/// Device acknowledgement of a configuration push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: i32,
    #[serde(default)]
    pub descr: String,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Payload published on the change-notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub mac: String,
    pub config: DeviceConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_wire_format() {
        let encoded = serde_json::to_value(DeviceConfig::default()).unwrap();

        assert_eq!(
            encoded,
            json!({"turnedOn": true, "streamOn": false, "collectFreq": 1, "sendFreq": 5})
        );
    }

    #[test]
    fn test_config_wire_round_trip() {
        let config = DeviceConfig {
            turned_on: false,
            stream_on: true,
            collect_freq: 10,
            send_freq: 20,
        };

        let bytes = serde_json::to_vec(&config).unwrap();
        let decoded: DeviceConfig = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded, config);
    }

    #[test]
    fn test_config_without_stream_flag() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{"turnedOn":false,"collectFreq":10,"sendFreq":20}"#).unwrap();

        assert!(!config.stream_on);
        assert_eq!(config.collect_freq, 10);
    }

    #[test]
    fn test_handshake_with_opaque_data() {
        let raw = r#"{
            "action": "register",
            "time": 1700000000000,
            "meta": {"type": "fridge", "name": "kitchen", "mac": "AA:BB:CC:DD:EE:FF", "ip": "10.0.0.7"},
            "data": {"tempCam1": {"1700000000000": 4.5}}
        }"#;

        let request: HandshakeRequest = serde_json::from_str(raw).unwrap();

        assert_eq!(request.meta.kind, "fridge");
        assert_eq!(request.meta.mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(request.data["tempCam1"]["1700000000000"], json!(4.5));
    }

    #[test]
    fn test_handshake_requires_meta() {
        let result = serde_json::from_str::<HandshakeRequest>(r#"{"action":"register"}"#);

        assert!(result.is_err());
    }

    #[test]
    fn test_change_payload() {
        let change: ConfigChange = serde_json::from_value(json!({
            "mac": "AA:BB:CC:DD:EE:FF",
            "config": {"turnedOn": false, "collectFreq": 10, "sendFreq": 20}
        }))
        .unwrap();

        assert_eq!(change.config.send_freq, 20);
    }
}
