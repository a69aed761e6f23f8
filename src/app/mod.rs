use crate::bridge::{CommandSink, RosBridge};
use crate::channel::{ChannelEvent, ChannelOptions, WsConnector};
use crate::config::Config;
use crate::drive::DirectionKey;
use crate::panel::ControlPanel;
use crate::routes::{LoadMode, ROUTES};
use crate::server::ServerSettings;
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let mut args = std::env::args().skip(1);

    match args.next().as_deref() {
        None | Some("serve") => handle_serve(config).await,
        Some("config-init") => handle_config_init(),
        Some("routes") => {
            handle_routes();
            Ok(())
        }
        Some("panel") => handle_panel(&config, args.next()).await,
        Some(other) => Err(format!(
            "unknown command '{other}' (expected serve, panel <robot_id>, routes or config-init)"
        )
        .into()),
    }
}

async fn handle_serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let token = match config.server.token.clone() {
        Some(token) => token,
        None => {
            tracing::info!("no server token configured, generated one for this run");
            generate_token(32)
        }
    };
    println!("Control endpoint: ws://{addr}/ws/control/<robot_id>?token={token}");
    println!("Dashboard: http://{addr}/dashboard");

    let bridge = Arc::new(RosBridge::new(&config.bridge));
    if bridge.robot_count() == 0 {
        tracing::warn!("no rosbridge robots configured, twists will not reach any robot");
    } else {
        tracing::info!(robots = bridge.robot_count(), topic = %config.bridge.cmd_vel_topic, "rosbridge targets loaded");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let settings = ServerSettings {
        token,
        drive: config.drive.clone(),
    };
    let sink: Arc<dyn CommandSink> = bridge.clone();

    let result = tokio::select! {
        res = crate::server::start(addr, settings, sink, shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    };
    bridge.shutdown().await;
    result
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn handle_routes() {
    for route in ROUTES {
        let load = match route.load {
            LoadMode::Eager => "eager",
            LoadMode::Lazy => "lazy",
        };
        let indent = if route.parent.is_some() { "  " } else { "" };
        println!("{indent}{:<30} {:<18} {load}", route.path, route.name);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PanelCommand {
    Toggle(DirectionKey),
    Stop,
    Robot(String),
    Connect,
    Disconnect,
    Quit,
}

impl PanelCommand {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = words.next()?;
        let parsed = match command.to_ascii_lowercase().as_str() {
            "up" => Self::Toggle(DirectionKey::Up),
            "down" => Self::Toggle(DirectionKey::Down),
            "left" => Self::Toggle(DirectionKey::Left),
            "right" => Self::Toggle(DirectionKey::Right),
            "stop" => Self::Stop,
            "robot" => Self::Robot(words.collect::<Vec<_>>().join(" ")),
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "quit" | "exit" => Self::Quit,
            _ => Self::Toggle(DirectionKey::from_key_name(command)?),
        };
        Some(parsed)
    }
}

/// Arrow keys the terminal operator is holding. A terminal has no key-up
/// events, so each direction command flips the held state instead.
#[derive(Debug, Default)]
struct HeldKeys(Vec<DirectionKey>);

impl HeldKeys {
    /// Returns true when the key is now held.
    fn toggle(&mut self, key: DirectionKey) -> bool {
        if let Some(pos) = self.0.iter().position(|k| *k == key) {
            self.0.remove(pos);
            false
        } else {
            self.0.push(key);
            true
        }
    }

    fn release_all(&mut self) -> Vec<DirectionKey> {
        let released: Vec<_> = DirectionKey::ALL
            .into_iter()
            .filter(|key| self.0.contains(key))
            .collect();
        self.0.clear();
        released
    }
}

async fn handle_panel(
    config: &Config,
    robot_id: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let connector = Arc::new(WsConnector::from_config(&config.client));
    let mut panel = ControlPanel::new(connector, ChannelOptions::from(&config.client));
    let mut held = HeldKeys::default();

    if let Some(robot_id) = robot_id {
        panel.set_robot_input(robot_id);
        panel.connect();
    }
    println!("{}", panel.view());
    println!("commands: up | down | left | right | stop | robot <id> | connect | disconnect | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match PanelCommand::parse(&line) {
                    Some(PanelCommand::Toggle(key)) => {
                        if held.toggle(key) {
                            panel.press(key.key_name());
                        } else {
                            panel.release(key.key_name());
                        }
                    }
                    Some(PanelCommand::Stop) => {
                        for key in held.release_all() {
                            panel.release(key.key_name());
                        }
                    }
                    Some(PanelCommand::Robot(input)) => {
                        if !panel.set_robot_input(input) {
                            println!("disconnect before changing the robot id");
                            continue;
                        }
                    }
                    Some(PanelCommand::Connect) => {
                        panel.connect();
                    }
                    Some(PanelCommand::Disconnect) => {
                        panel.disconnect().await;
                        held = HeldKeys::default();
                    }
                    Some(PanelCommand::Quit) => break,
                    None => {
                        println!("unknown command: {}", line.trim());
                        continue;
                    }
                }
            }
            event = panel.next_event() => {
                let event = event.unwrap_or(ChannelEvent::Disconnected);
                if event == ChannelEvent::Disconnected {
                    held = HeldKeys::default();
                }
                panel.apply(event);
            }
        }
        println!("{}", panel.view());
    }

    panel.disconnect().await;
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_panel_commands() {
        assert_eq!(
            PanelCommand::parse("up"),
            Some(PanelCommand::Toggle(DirectionKey::Up))
        );
        assert_eq!(
            PanelCommand::parse("  LEFT "),
            Some(PanelCommand::Toggle(DirectionKey::Left))
        );
        assert_eq!(
            PanelCommand::parse("ArrowRight"),
            Some(PanelCommand::Toggle(DirectionKey::Right))
        );
        assert_eq!(
            PanelCommand::parse("robot tb3 01"),
            Some(PanelCommand::Robot("tb3 01".to_string()))
        );
        assert_eq!(PanelCommand::parse("stop"), Some(PanelCommand::Stop));
        assert_eq!(PanelCommand::parse("exit"), Some(PanelCommand::Quit));
        assert_eq!(PanelCommand::parse("jump"), None);
        assert_eq!(PanelCommand::parse(""), None);
    }

    #[test]
    fn direction_commands_toggle_held_keys() {
        let mut held = HeldKeys::default();
        assert!(held.toggle(DirectionKey::Up));
        assert!(held.toggle(DirectionKey::Left));
        assert!(!held.toggle(DirectionKey::Up));
        assert!(held.toggle(DirectionKey::Right));

        assert_eq!(
            held.release_all(),
            vec![DirectionKey::Left, DirectionKey::Right]
        );
        assert!(held.release_all().is_empty());
    }

    #[test]
    fn generated_tokens_are_alphanumeric() {
        let token = generate_token(32);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
