use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque name of the robot a control channel targets.
///
/// Always non-empty; the stored value is the trimmed operator input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RobotId(String);

impl RobotId {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Linear {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub x: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Angular {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub z: f64,
}

/// Planar velocity: forward speed in m/s and yaw rate in rad/s.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Twist {
    #[serde(default)]
    pub linear: Linear,
    #[serde(default)]
    pub angular: Angular,
}

impl Twist {
    pub fn new(linear_x: f64, angular_z: f64) -> Self {
        Self {
            linear: Linear { x: linear_x },
            angular: Angular { z: angular_z },
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.linear.x == 0.0 && self.angular.z == 0.0
    }
}

/// One telemetry update: the robot's current twist and the keys the
/// operator is holding, in press order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedbackSample {
    pub twist: Twist,
    #[serde(default)]
    pub pressed_keys: Vec<String>,
}

impl FeedbackSample {
    pub fn linear_display(&self) -> String {
        format!("{:.2}", self.twist.linear.x)
    }

    pub fn angular_display(&self) -> String {
        format!("{:.2}", self.twist.angular.z)
    }

    pub fn keys_display(&self) -> String {
        self.pressed_keys.join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyAction {
    #[default]
    #[serde(rename = "keydown")]
    Down,
    #[serde(rename = "keyup")]
    Up,
}

/// Command frame sent from the operator side to the control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub key: String,
    #[serde(default)]
    pub action: KeyAction,
}

impl KeyEvent {
    pub fn down(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            action: KeyAction::Down,
        }
    }

    pub fn up(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            action: KeyAction::Up,
        }
    }
}

/// Reply frame sent by the control endpoint for every command it handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ControlReply {
    Ok {
        twist: Twist,
        #[serde(default)]
        pressed_keys: Vec<String>,
        #[serde(default)]
        timestamp: u64,
    },
    Error {
        message: String,
    },
}

impl ControlReply {
    pub fn feedback(twist: Twist, pressed_keys: Vec<String>) -> Self {
        Self::Ok {
            twist,
            pressed_keys,
            timestamp: now_unix_ms(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// rosbridge publishes numeric message fields as decimal strings.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(value) => Ok(value),
        NumberOrString::String(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|err| serde::de::Error::custom(format!("invalid number {raw:?}: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robot_id_rejects_blank_input_and_trims() {
        assert!(RobotId::parse("").is_none());
        assert!(RobotId::parse("   \t").is_none());
        assert_eq!(RobotId::parse("  tb3-01 ").unwrap().as_str(), "tb3-01");
    }

    #[test]
    fn feedback_values_render_with_two_decimals() {
        let sample = FeedbackSample {
            twist: Twist::new(1.0, -0.333333),
            pressed_keys: vec!["ArrowUp".to_string(), "ArrowLeft".to_string()],
        };
        assert_eq!(sample.linear_display(), "1.00");
        assert_eq!(sample.angular_display(), "-0.33");
        assert_eq!(sample.keys_display(), "ArrowUp, ArrowLeft");
        assert_eq!(sample.twist.angular.z, -0.333333);
    }

    #[test]
    fn feedback_accepts_string_encoded_numbers() {
        let raw = r#"{"twist":{"linear":{"x":"0.26","y":"0.0"},"angular":{"z":"-1.82"}},"pressed_keys":["ArrowUp"]}"#;
        let sample: FeedbackSample = serde_json::from_str(raw).unwrap();
        assert_eq!(sample.twist, Twist::new(0.26, -1.82));
        assert_eq!(sample.pressed_keys, vec!["ArrowUp"]);
    }

    #[test]
    fn key_event_action_defaults_to_keydown() {
        let event: KeyEvent = serde_json::from_str(r#"{"key":"ArrowLeft"}"#).unwrap();
        assert_eq!(event, KeyEvent::down("ArrowLeft"));
        let event: KeyEvent =
            serde_json::from_str(r#"{"key":"ArrowLeft","action":"keyup"}"#).unwrap();
        assert_eq!(event.action, KeyAction::Up);
    }

    #[test]
    fn control_reply_is_tagged_by_status() {
        let reply = ControlReply::Ok {
            twist: Twist::new(0.26, 0.0),
            pressed_keys: vec!["ArrowUp".to_string()],
            timestamp: 42,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["twist"]["linear"]["x"], 0.26);
        assert_eq!(json["pressed_keys"][0], "ArrowUp");

        let err: ControlReply =
            serde_json::from_str(r#"{"status":"error","message":"boom"}"#).unwrap();
        assert_eq!(err, ControlReply::error("boom"));
    }
}
