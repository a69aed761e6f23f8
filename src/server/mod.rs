use crate::bridge::CommandSink;
use crate::codec::{self, Frame};
use crate::config::DriveConfig;
use crate::drive::{self, KeyState};
use crate::model::{ControlReply, KeyEvent, RobotId, Twist};
use crate::routes::{self, Route, ViewResolver, ROUTES};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub token: String,
    pub drive: DriveConfig,
}

struct ServerState {
    token: String,
    drive: DriveConfig,
    sink: Arc<dyn CommandSink>,
    sessions: Mutex<HashMap<String, usize>>,
    views: Mutex<ViewResolver<String>>,
}

impl ServerState {
    fn open_session(&self, robot_id: &RobotId) {
        let mut sessions = self.sessions.lock().unwrap();
        *sessions.entry(robot_id.to_string()).or_insert(0) += 1;
    }

    fn close_session(&self, robot_id: &RobotId) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(count) = sessions.get_mut(robot_id.as_str()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                sessions.remove(robot_id.as_str());
            }
        }
    }
}

pub async fn start(
    addr: SocketAddr,
    settings: ServerSettings,
    sink: Arc<dyn CommandSink>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, settings, sink, shutdown_rx).await
}

pub async fn serve(
    listener: TcpListener,
    settings: ServerSettings,
    sink: Arc<dyn CommandSink>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(addr = %listener.local_addr()?, "teleop server listening");
    axum::serve(listener, router(settings, sink))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

fn router(settings: ServerSettings, sink: Arc<dyn CommandSink>) -> Router {
    let state = Arc::new(ServerState {
        token: settings.token,
        drive: settings.drive,
        sink,
        sessions: Mutex::new(HashMap::new()),
        views: Mutex::new(ViewResolver::new(render_view)),
    });

    let mut app: Router<Arc<ServerState>> = Router::new()
        .route("/health", get(health_check))
        .route("/connections", get(connections))
        .route("/ws/control/:robot_id", get(ws_control));
    for route in ROUTES {
        app = app.route(route.path, get(view_page));
    }
    app.with_state(state)
}

async fn ws_control(
    State(state): State<Arc<ServerState>>,
    Path(robot_id): Path<String>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(robot_id) = RobotId::parse(&robot_id) else {
        return (StatusCode::BAD_REQUEST, "robot id must not be empty").into_response();
    };

    ws.on_upgrade(move |socket| handle_control_socket(socket, robot_id, state))
}

async fn handle_control_socket(mut socket: WebSocket, robot_id: RobotId, state: Arc<ServerState>) {
    let session_id = Uuid::new_v4();
    state.open_session(&robot_id);
    tracing::info!(robot_id = %robot_id, session_id = %session_id, "control session opened");

    let mut keys = KeyState::default();
    loop {
        let message = match socket.recv().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                tracing::warn!(robot_id = %robot_id, error = %err, "control socket error");
                break;
            }
            None => break,
        };
        let frame = match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(bytes) => Frame::Binary(bytes),
            Message::Close(_) => break,
            _ => continue,
        };

        let reply = match codec::decode::<KeyEvent>(&frame) {
            Ok(event) => {
                keys.apply(&event);
                let twist = drive::mix(&state.drive, &keys);
                tracing::debug!(
                    robot_id = %robot_id,
                    key = %event.key,
                    linear_x = twist.linear.x,
                    angular_z = twist.angular.z,
                    "key event"
                );
                if let Err(err) = state.sink.publish_twist(&robot_id, twist).await {
                    tracing::warn!(robot_id = %robot_id, error = %err, "twist publish failed");
                }
                ControlReply::feedback(twist, keys.pressed().to_vec())
            }
            Err(err) => ControlReply::error(err.to_string()),
        };

        let outgoing = match codec::encode(frame.format(), &reply) {
            Ok(Frame::Text(text)) => Message::Text(text),
            Ok(Frame::Binary(bytes)) => Message::Binary(bytes),
            Err(err) => {
                tracing::warn!(robot_id = %robot_id, error = %err, "reply encode failed");
                continue;
            }
        };
        if socket.send(outgoing).await.is_err() {
            break;
        }
    }

    // The robot must not keep driving once its operator is gone.
    if let Err(err) = state.sink.publish_twist(&robot_id, Twist::zero()).await {
        tracing::warn!(robot_id = %robot_id, error = %err, "stop publish failed");
    }
    state.close_session(&robot_id);
    tracing::info!(robot_id = %robot_id, session_id = %session_id, "control session closed");
}

async fn connections(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let control: BTreeMap<String, usize> = state
        .sessions
        .lock()
        .unwrap()
        .iter()
        .map(|(robot, count)| (robot.clone(), *count))
        .collect();
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "control": control })),
    )
        .into_response()
}

async fn view_page(State(state): State<Arc<ServerState>>, uri: Uri) -> impl IntoResponse {
    let resolved = state.views.lock().unwrap().resolve(uri.path());
    match resolved {
        Some((_, page)) => Html(page.as_str().to_string()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn render_view(route: &Route) -> String {
    let nav_root = match route.parent {
        Some(parent) => parent,
        None => route.view,
    };
    let nav: String = routes::children(nav_root)
        .map(|child| {
            format!(
                r#"<li><a href="{}">{}</a></li>"#,
                child.path,
                html_escape(child.title)
            )
        })
        .collect();
    let parent = route
        .parent
        .map(|parent| {
            let parent = routes::route_for(parent);
            format!(
                r#"<a href="{}">{}</a> / "#,
                parent.path,
                html_escape(parent.title)
            )
        })
        .unwrap_or_default();

    format!(
        r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8" />
  <title>{title}</title>
</head>
<body data-view="{name}">
  <header>{parent}<strong>{title}</strong></header>
  <nav><ul>{nav}</ul></nav>
  <main id="view"></main>
</body>
</html>
"#,
        title = html_escape(route.title),
        name = route.name,
        parent = parent,
        nav = nav,
    )
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }

    query.get("token").map(|t| t == token).unwrap_or(false)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
