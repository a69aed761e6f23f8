//! Outbound side: publishes velocity commands to each robot's rosbridge.

use crate::config::BridgeConfig;
use crate::model::{RobotId, Twist};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Where mixed twists go. Publishing never fails a control session; callers
/// log errors and carry on.
pub trait CommandSink: Send + Sync + 'static {
    fn publish_twist<'a>(
        &'a self,
        robot_id: &'a RobotId,
        twist: Twist,
    ) -> BoxFuture<'a, Result<(), BridgeError>>;
}

#[derive(Debug)]
pub enum BridgeError {
    UnknownRobot(String),
    Connect { robot_id: String, reason: String },
    Send { robot_id: String, reason: String },
    Unavailable { robot_id: String, retry_in_ms: u64 },
    Encode(serde_json::Error),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRobot(id) => write!(f, "no rosbridge configured for robot {id}"),
            Self::Connect { robot_id, reason } => {
                write!(f, "rosbridge connect failed for robot {robot_id}: {reason}")
            }
            Self::Send { robot_id, reason } => {
                write!(f, "rosbridge publish failed for robot {robot_id}: {reason}")
            }
            Self::Unavailable {
                robot_id,
                retry_in_ms,
            } => write!(
                f,
                "rosbridge for robot {robot_id} unreachable, next attempt in {retry_in_ms} ms"
            ),
            Self::Encode(err) => write!(f, "json error: {err}"),
        }
    }
}

impl std::error::Error for BridgeError {}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Vector3 {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct TwistMsg {
    linear: Vector3,
    angular: Vector3,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct PublishOp<'a, T> {
    op: &'static str,
    topic: &'a str,
    #[serde(rename = "type")]
    msg_type: &'a str,
    msg: T,
}

fn publish_message<'a>(topic: &'a str, msg_type: &'a str, twist: Twist) -> PublishOp<'a, TwistMsg> {
    PublishOp {
        op: "publish",
        topic,
        msg_type,
        msg: TwistMsg {
            linear: Vector3 {
                x: twist.linear.x,
                y: 0.0,
                z: 0.0,
            },
            angular: Vector3 {
                x: 0.0,
                y: 0.0,
                z: twist.angular.z,
            },
        },
    }
}

type BridgeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Slot {
    stream: Option<BridgeStream>,
    failed_at: Option<Instant>,
}

/// Keeps one rosbridge websocket per robot, opened on first publish and
/// dropped after a failed send so the next publish reconnects.
///
/// Each robot has its own slot; dialing or writing to one robot never holds
/// up another. A robot whose bridge could not be reached is not dialed again
/// until `reconnect_backoff` has passed.
pub struct RosBridge {
    robots: HashMap<String, String>,
    topic: String,
    msg_type: String,
    connect_timeout: Duration,
    reconnect_backoff: Duration,
    slots: StdMutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl RosBridge {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            robots: config.robots.clone(),
            topic: config.cmd_vel_topic.clone(),
            msg_type: config.twist_type.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
            slots: StdMutex::new(HashMap::new()),
        }
    }

    pub fn robot_count(&self) -> usize {
        self.robots.len()
    }

    fn slot(&self, robot_id: &RobotId) -> Arc<Mutex<Slot>> {
        self.slots
            .lock()
            .unwrap()
            .entry(robot_id.to_string())
            .or_default()
            .clone()
    }

    async fn publish(&self, robot_id: &RobotId, twist: Twist) -> Result<(), BridgeError> {
        let url = self
            .robots
            .get(robot_id.as_str())
            .ok_or_else(|| BridgeError::UnknownRobot(robot_id.to_string()))?;
        let payload = serde_json::to_string(&publish_message(&self.topic, &self.msg_type, twist))
            .map_err(BridgeError::Encode)?;

        let slot = self.slot(robot_id);
        let mut entry = slot.lock().await;
        if entry.stream.is_none() {
            if let Some(failed_at) = entry.failed_at {
                let elapsed = failed_at.elapsed();
                if elapsed < self.reconnect_backoff {
                    return Err(BridgeError::Unavailable {
                        robot_id: robot_id.to_string(),
                        retry_in_ms: (self.reconnect_backoff - elapsed).as_millis() as u64,
                    });
                }
            }
            match self.open(robot_id, url).await {
                Ok(stream) => {
                    tracing::info!(robot_id = %robot_id, url = %url, "rosbridge connected");
                    entry.stream = Some(stream);
                    entry.failed_at = None;
                }
                Err(err) => {
                    entry.failed_at = Some(Instant::now());
                    return Err(err);
                }
            }
        }

        let sent = match entry.stream.as_mut() {
            Some(stream) => {
                tokio::time::timeout(self.connect_timeout, stream.send(Message::Text(payload)))
                    .await
                    .map_err(|_| "timed out".to_string())
                    .and_then(|res| res.map_err(|err| err.to_string()))
            }
            None => Err("no connection".to_string()),
        };
        if let Err(reason) = sent {
            entry.stream = None;
            return Err(BridgeError::Send {
                robot_id: robot_id.to_string(),
                reason,
            });
        }
        if twist.is_zero() {
            tracing::debug!(robot_id = %robot_id, "published stop");
        } else {
            tracing::debug!(
                robot_id = %robot_id,
                linear_x = twist.linear.x,
                angular_z = twist.angular.z,
                "published twist"
            );
        }
        Ok(())
    }

    async fn open(&self, robot_id: &RobotId, url: &str) -> Result<BridgeStream, BridgeError> {
        let connect_err = |reason: String| BridgeError::Connect {
            robot_id: robot_id.to_string(),
            reason,
        };
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| connect_err("timed out".to_string()))?
            .map_err(|err| connect_err(err.to_string()))?;
        Ok(stream)
    }

    /// Closes every open rosbridge connection.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self.slots.lock().unwrap().drain().collect();
        for (robot_id, slot) in slots {
            let Some(mut stream) = slot.lock().await.stream.take() else {
                continue;
            };
            if let Err(err) = stream.close(None).await {
                tracing::debug!(robot_id = %robot_id, error = %err, "rosbridge close failed");
            }
        }
    }
}

impl CommandSink for RosBridge {
    fn publish_twist<'a>(
        &'a self,
        robot_id: &'a RobotId,
        twist: Twist,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        self.publish(robot_id, twist).boxed()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    #[test]
    fn publish_message_matches_rosbridge_shape() {
        let msg = publish_message("/cmd_vel", "geometry_msgs/msg/Twist", Twist::new(0.26, -1.82));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "publish");
        assert_eq!(json["topic"], "/cmd_vel");
        assert_eq!(json["type"], "geometry_msgs/msg/Twist");
        assert_eq!(json["msg"]["linear"]["x"], 0.26);
        assert_eq!(json["msg"]["linear"]["y"], 0.0);
        assert_eq!(json["msg"]["angular"]["z"], -1.82);
    }

    #[tokio::test]
    async fn unknown_robot_is_reported() {
        let bridge = RosBridge::new(&BridgeConfig::default());
        let robot = RobotId::parse("ghost").unwrap();
        assert_eq!(bridge.robot_count(), 0);
        let err = bridge.publish_twist(&robot, Twist::zero()).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownRobot(_)));
    }

    #[tokio::test]
    async fn publishes_over_a_reused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut received = Vec::new();
            while received.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => received.push(text),
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
            received
        });

        let mut config = BridgeConfig::default();
        config
            .robots
            .insert("tb3-01".to_string(), format!("ws://{addr}"));
        let bridge = RosBridge::new(&config);
        let robot = RobotId::parse("tb3-01").unwrap();

        bridge.publish_twist(&robot, Twist::new(0.26, 0.0)).await.unwrap();
        bridge.publish_twist(&robot, Twist::zero()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&received[0]).unwrap();
        assert_eq!(first["msg"]["linear"]["x"], 0.26);
        let second: serde_json::Value = serde_json::from_str(&received[1]).unwrap();
        assert_eq!(second["msg"]["linear"]["x"], 0.0);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_bridge_is_not_redialed_during_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = BridgeConfig::default();
        config.reconnect_backoff_ms = 60_000;
        config
            .robots
            .insert("tb3-01".to_string(), format!("ws://{addr}"));
        let bridge = RosBridge::new(&config);
        let robot = RobotId::parse("tb3-01").unwrap();
        let err = bridge.publish_twist(&robot, Twist::zero()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connect { .. }));

        let err = bridge.publish_twist(&robot, Twist::zero()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { retry_in_ms, .. } if retry_in_ms > 0));
    }

    #[tokio::test]
    async fn stalled_bridge_does_not_block_other_robots() {
        // Accepts TCP through the backlog but never answers the handshake.
        let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stalled_addr = stalled.local_addr().unwrap();

        let healthy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let healthy_addr = healthy.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = healthy.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text,
                    Some(Ok(_)) => continue,
                    other => panic!("healthy bridge closed early: {other:?}"),
                }
            }
        });

        let mut config = BridgeConfig::default();
        config.connect_timeout_ms = 2000;
        config
            .robots
            .insert("stalled".to_string(), format!("ws://{stalled_addr}"));
        config
            .robots
            .insert("healthy".to_string(), format!("ws://{healthy_addr}"));
        let bridge = Arc::new(RosBridge::new(&config));

        let stalled_publish = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let robot = RobotId::parse("stalled").unwrap();
                bridge.publish_twist(&robot, Twist::new(0.26, 0.0)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let robot = RobotId::parse("healthy").unwrap();
        let started = Instant::now();
        bridge.publish_twist(&robot, Twist::new(0.26, 0.0)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));

        let received = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        let msg: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(msg["msg"]["linear"]["x"], 0.26);

        let err = stalled_publish.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Connect { .. }));
        let stalled_robot = RobotId::parse("stalled").unwrap();
        let started = Instant::now();
        let err = bridge
            .publish_twist(&stalled_robot, Twist::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));

        drop(stalled);
        bridge.shutdown().await;
    }
}
