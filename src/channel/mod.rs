//! Client side of the robot control channel.
//!
//! A [`ControlChannel`] is bound to one robot for its whole life and is
//! started at most once. Network work happens on a driver task; the handle
//! talks to it through a command queue and a shutdown signal, and the driver
//! reports back through [`ChannelEvent`]s. `Disconnected` is emitted exactly
//! once for every started channel, after `Connected` when that fired.

use crate::codec::{self, CodecError, Frame, WireFormat};
use crate::config::{ClientConfig, RetryConfig};
use crate::model::{ControlReply, FeedbackSample, KeyAction, KeyEvent, RobotId};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const COMMAND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Error(String),
    Feedback(FeedbackSample),
}

pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug)]
pub enum ChannelError {
    AlreadyStarted,
    NotConnected,
    Open(String),
    Transport(String),
    Codec(CodecError),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "channel was already started"),
            Self::NotConnected => write!(f, "channel is not connected"),
            Self::Open(err) => write!(f, "connection failed: {err}"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::Codec(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<CodecError> for ChannelError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

/// An open duplex link to one robot.
pub trait Link: Send + 'static {
    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Resolves to `None` once the remote side has closed the link.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Frame, ChannelError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens links; the transport behind a [`ControlChannel`].
pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    fn open(
        &self,
        robot_id: &RobotId,
    ) -> impl Future<Output = Result<Self::Link, ChannelError>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub format: WireFormat,
    pub retry: RetryConfig,
}

impl From<&ClientConfig> for ChannelOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            format: config.wire_format,
            retry: config.retry.clone(),
        }
    }
}

pub struct ControlChannel<C: Connector> {
    robot_id: RobotId,
    connector: Arc<C>,
    options: ChannelOptions,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    state_tx: Option<watch::Sender<ChannelState>>,
    state_rx: watch::Receiver<ChannelState>,
    shutdown_tx: watch::Sender<bool>,
    commands: Option<mpsc::Sender<KeyEvent>>,
    task: Option<JoinHandle<()>>,
}

impl<C: Connector> ControlChannel<C> {
    pub fn new(robot_id: RobotId, connector: Arc<C>, options: ChannelOptions) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Uninitialized);
        let (shutdown_tx, _) = watch::channel(false);
        let channel = Self {
            robot_id,
            connector,
            options,
            events_tx,
            state_tx: Some(state_tx),
            state_rx,
            shutdown_tx,
            commands: None,
            task: None,
        };
        (channel, events_rx)
    }

    pub fn robot_id(&self) -> &RobotId {
        &self.robot_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Starts the driver task. Must be called from within a tokio runtime.
    ///
    /// A channel starts at most once; later calls are rejected and also
    /// reported as an `Error` event.
    pub fn connect(&mut self) -> Result<(), ChannelError> {
        let Some(state_tx) = self.state_tx.take() else {
            let err = ChannelError::AlreadyStarted;
            tracing::warn!(robot_id = %self.robot_id, "rejected second connect on control channel");
            let _ = self.events_tx.send(ChannelEvent::Error(err.to_string()));
            return Err(err);
        };
        state_tx.send_replace(ChannelState::Connecting);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let driver = Driver {
            robot_id: self.robot_id.clone(),
            connector: self.connector.clone(),
            options: self.options.clone(),
            events: self.events_tx.clone(),
            state: state_tx,
            commands: cmd_rx,
            shutdown: self.shutdown_tx.subscribe(),
        };
        self.commands = Some(cmd_tx);
        self.task = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    pub fn send_key(&self, key: impl Into<String>, action: KeyAction) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Connected {
            return Err(ChannelError::NotConnected);
        }
        let commands = self.commands.as_ref().ok_or(ChannelError::NotConnected)?;
        let event = match action {
            KeyAction::Down => KeyEvent::down(key),
            KeyAction::Up => KeyEvent::up(key),
        };
        commands.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                ChannelError::Transport("command queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ChannelError::NotConnected,
        })
    }

    /// Releases the channel and waits for the driver to finish. A no-op
    /// when the channel was never started or is already released.
    pub async fn disconnect(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(robot_id = %self.robot_id, error = %err, "control channel driver ended abnormally");
            }
        }
    }
}

impl<C: Connector> Drop for ControlChannel<C> {
    fn drop(&mut self) {
        // The driver closes the link on its own once it sees the signal.
        self.shutdown_tx.send_replace(true);
    }
}

struct Driver<C: Connector> {
    robot_id: RobotId,
    connector: Arc<C>,
    options: ChannelOptions,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    commands: mpsc::Receiver<KeyEvent>,
    shutdown: watch::Receiver<bool>,
}

enum Exit {
    Operator,
    Remote,
    Failed,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        let Some(mut link) = self.open_link().await else {
            self.state.send_replace(ChannelState::Closed);
            self.emit(ChannelEvent::Disconnected);
            return;
        };

        self.state.send_replace(ChannelState::Connected);
        tracing::info!(robot_id = %self.robot_id, "control channel connected");
        self.emit(ChannelEvent::Connected);

        let exit = self.pump(&mut link).await;
        link.close().await;
        self.state.send_replace(ChannelState::Closed);
        match exit {
            Exit::Operator => tracing::info!(robot_id = %self.robot_id, "control channel released"),
            Exit::Remote => tracing::info!(robot_id = %self.robot_id, "control channel closed by remote"),
            Exit::Failed => tracing::warn!(robot_id = %self.robot_id, "control channel failed"),
        }
        self.emit(ChannelEvent::Disconnected);
    }

    async fn open_link(&mut self) -> Option<C::Link> {
        let retry = &self.options.retry;
        let attempts = if retry.enabled { retry.max_attempts.max(1) } else { 1 };
        let mut backoff = Duration::from_millis(retry.initial_backoff_ms);
        let max_backoff = Duration::from_millis(retry.max_backoff_ms);

        for attempt in 1..=attempts {
            if *self.shutdown.borrow() {
                return None;
            }
            let opened = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return None,
                res = self.connector.open(&self.robot_id) => res,
            };
            match opened {
                Ok(link) => return Some(link),
                Err(err) => {
                    tracing::warn!(
                        robot_id = %self.robot_id,
                        attempt,
                        attempts,
                        error = %err,
                        "control channel open failed"
                    );
                    let _ = self.events.send(ChannelEvent::Error(err.to_string()));
                }
            }
            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = self.shutdown.changed() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
            }
        }
        None
    }

    async fn pump(&mut self, link: &mut C::Link) -> Exit {
        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Exit::Operator;
                    }
                }
                cmd = self.commands.recv(), if commands_open => {
                    let Some(event) = cmd else {
                        commands_open = false;
                        continue;
                    };
                    let frame = match codec::encode(self.options.format, &event) {
                        Ok(frame) => frame,
                        Err(err) => {
                            let err = ChannelError::from(err);
                            tracing::warn!(robot_id = %self.robot_id, error = %err, "dropped key event");
                            let _ = self.events.send(ChannelEvent::Error(err.to_string()));
                            continue;
                        }
                    };
                    if let Err(err) = link.send(frame).await {
                        let _ = self.events.send(ChannelEvent::Error(err.to_string()));
                        return Exit::Failed;
                    }
                }
                incoming = link.recv() => match incoming {
                    Some(Ok(frame)) => {
                        let event = reply_event(&frame);
                        let _ = self.events.send(event);
                    }
                    Some(Err(err)) => {
                        let _ = self.events.send(ChannelEvent::Error(err.to_string()));
                        return Exit::Failed;
                    }
                    None => return Exit::Remote,
                },
            }
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

fn reply_event(frame: &Frame) -> ChannelEvent {
    match codec::decode::<ControlReply>(frame) {
        Ok(ControlReply::Ok {
            twist,
            pressed_keys,
            ..
        }) => ChannelEvent::Feedback(FeedbackSample {
            twist,
            pressed_keys,
        }),
        Ok(ControlReply::Error { message }) => ChannelEvent::Error(message),
        Err(err) => ChannelEvent::Error(format!("invalid feedback frame: {err}")),
    }
}

/// Websocket transport against the teleop server's control endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
    token: Option<String>,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>, token: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            connect_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            config.token.clone(),
            Duration::from_millis(config.connect_timeout_ms),
        )
    }

    pub fn endpoint(&self, robot_id: &RobotId) -> String {
        let mut url = format!(
            "{}/ws/control/{}",
            self.base_url.trim().trim_end_matches('/'),
            encode_component(robot_id.as_str())
        );
        if let Some(token) = self.token.as_deref() {
            url.push_str("?token=");
            url.push_str(&encode_component(token));
        }
        url
    }
}

impl Connector for WsConnector {
    type Link = WsLink;

    async fn open(&self, robot_id: &RobotId) -> Result<WsLink, ChannelError> {
        let url = self.endpoint(robot_id);
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                ChannelError::Open(format!("timed out after {} ms", self.connect_timeout.as_millis()))
            })?
            .map_err(|err| ChannelError::Open(err.to_string()))?;
        Ok(WsLink { stream })
    }
}

pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Link for WsLink {
    async fn send(&mut self, frame: Frame) -> Result<(), ChannelError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        self.stream
            .send(message)
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, ChannelError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(Frame::Binary(bytes))),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(ChannelError::Transport(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            tracing::debug!(error = %err, "websocket close handshake failed");
        }
    }
}

fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
