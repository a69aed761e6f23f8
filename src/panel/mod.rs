//! Operator test panel: owns one control channel at a time and keeps the
//! state a front end renders.

use crate::channel::{ChannelEvent, ChannelOptions, Connector, ControlChannel, EventReceiver};
use crate::model::{FeedbackSample, KeyAction, RobotId};
use std::fmt;
use std::sync::Arc;

pub const EMPTY_ROBOT_ID: &str = "Please enter a robot ID";
pub const ALREADY_CONNECTED: &str = "Already connected";

const USAGE: [&str; 5] = [
    "↑: forward",
    "↓: reverse",
    "←: turn left",
    "→: turn right",
    "Arrow keys together: diagonal",
];

pub struct ControlPanel<C: Connector> {
    connector: Arc<C>,
    options: ChannelOptions,
    robot_input: String,
    connected: bool,
    channel: Option<ControlChannel<C>>,
    events: Option<EventReceiver>,
    last_feedback: Option<FeedbackSample>,
    error: Option<String>,
}

impl<C: Connector> ControlPanel<C> {
    pub fn new(connector: Arc<C>, options: ChannelOptions) -> Self {
        Self {
            connector,
            options,
            robot_input: String::new(),
            connected: false,
            channel: None,
            events: None,
            last_feedback: None,
            error: None,
        }
    }

    /// Edits the robot id field. Ignored while a channel is held (connecting
    /// or connected), where the field is disabled.
    pub fn set_robot_input(&mut self, input: impl Into<String>) -> bool {
        if self.channel.is_some() {
            return false;
        }
        self.robot_input = input.into();
        true
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[cfg(test)]
    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[cfg(test)]
    pub fn last_feedback(&self) -> Option<&FeedbackSample> {
        self.last_feedback.as_ref()
    }

    /// Creates and starts a channel for the entered robot id. Returns whether
    /// a channel was started.
    pub fn connect(&mut self) -> bool {
        if self.channel.is_some() {
            self.error = Some(ALREADY_CONNECTED.to_string());
            return false;
        }
        let Some(robot_id) = RobotId::parse(&self.robot_input) else {
            self.error = Some(EMPTY_ROBOT_ID.to_string());
            return false;
        };

        let (mut channel, events) =
            ControlChannel::new(robot_id, self.connector.clone(), self.options.clone());
        if let Err(err) = channel.connect() {
            self.error = Some(err.to_string());
            return false;
        }
        tracing::debug!(robot_id = %channel.robot_id(), "panel started control channel");
        self.channel = Some(channel);
        self.events = Some(events);
        true
    }

    /// Releases the current channel, if any. Events it produced but the
    /// panel has not applied yet are discarded.
    pub async fn disconnect(&mut self) {
        let Some(mut channel) = self.channel.take() else {
            return;
        };
        channel.disconnect().await;
        if let Some(mut events) = self.events.take() {
            let mut discarded = 0usize;
            while let Ok(event) = events.try_recv() {
                if event != ChannelEvent::Disconnected {
                    discarded += 1;
                }
            }
            if discarded > 0 {
                tracing::debug!(discarded, "dropped events from released channel");
            }
        }
        self.connected = false;
    }

    /// Waits for the next event of the current channel. Pends forever while
    /// the panel holds no channel.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => std::future::pending().await,
        }
    }

    pub fn apply(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                self.connected = true;
                self.error = None;
            }
            ChannelEvent::Disconnected => {
                self.connected = false;
                self.channel = None;
                self.events = None;
            }
            ChannelEvent::Error(message) => {
                self.error = Some(message);
            }
            ChannelEvent::Feedback(sample) => {
                self.last_feedback = Some(sample);
            }
        }
    }

    pub fn press(&mut self, key: &str) {
        self.send_key(key, KeyAction::Down);
    }

    pub fn release(&mut self, key: &str) {
        self.send_key(key, KeyAction::Up);
    }

    fn send_key(&mut self, key: &str, action: KeyAction) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        if let Err(err) = channel.send_key(key, action) {
            self.error = Some(err.to_string());
        }
    }

    pub fn view(&self) -> PanelView {
        PanelView {
            robot_input: self.robot_input.clone(),
            input_enabled: self.channel.is_none(),
            action: if self.channel.is_some() {
                PanelAction::Disconnect
            } else {
                PanelAction::Connect
            },
            connected: self.connected,
            connecting: self.channel.is_some() && !self.connected,
            error: self.error.clone(),
            guidance: if self.connected { USAGE.to_vec() } else { Vec::new() },
            feedback: self.last_feedback.as_ref().map(|sample| FeedbackView {
                linear: sample.linear_display(),
                angular: sample.angular_display(),
                keys: sample.keys_display(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelAction {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackView {
    pub linear: String,
    pub angular: String,
    pub keys: String,
}

/// Everything a front end needs to draw the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelView {
    pub robot_input: String,
    pub input_enabled: bool,
    pub action: PanelAction,
    pub connected: bool,
    pub connecting: bool,
    pub error: Option<String>,
    pub guidance: Vec<&'static str>,
    pub feedback: Option<FeedbackView>,
}

impl fmt::Display for PanelView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== Robot control test ==")?;
        let lock = if self.input_enabled { "" } else { " (locked)" };
        let action = match self.action {
            PanelAction::Connect => "connect",
            PanelAction::Disconnect => "disconnect",
        };
        writeln!(f, "Robot ID: [{}]{}  <{}>", self.robot_input, lock, action)?;
        let status = if self.connected {
            "connected"
        } else if self.connecting {
            "connecting"
        } else {
            "disconnected"
        };
        writeln!(f, "Status: {status}")?;
        if let Some(error) = &self.error {
            writeln!(f, "Error: {error}")?;
        }
        if !self.guidance.is_empty() {
            writeln!(f, "Controls:")?;
            for line in &self.guidance {
                writeln!(f, "  {line}")?;
            }
        }
        if let Some(feedback) = &self.feedback {
            writeln!(f, "Current command:")?;
            writeln!(f, "  Linear: {} m/s", feedback.linear)?;
            writeln!(f, "  Angular: {} rad/s", feedback.angular)?;
            writeln!(f, "  Keys: {}", feedback.keys)?;
        }
        Ok(())
    }
}
