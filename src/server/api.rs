use crate::cli::Args;
use crate::history::{
    resolve_identity,
    ChatHistory,
    ExportFormat,
    HistoryError,
    RequestContext,
};
use crate::models::chat::Role;
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::{ get, post },
    Router,
    extract::{ ConnectInfo, FromRequestParts, Path, Query, State },
    response::{ IntoResponse, Response },
    http::{ header, request::Parts, StatusCode },
    Json,
};
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, error, warn };

#[derive(Deserialize)]
pub struct AppendRequest {
    pub content: String,
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct ExportRequest {
    pub format: Option<String>,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

#[derive(Clone)]
pub struct AppState {
    pub history: Arc<ChatHistory>,
    pub auth_user_header: String,
    pub cleanup_action: String,
}

impl AppState {
    pub fn new(history: Arc<ChatHistory>, args: &Args) -> Self {
        Self {
            history,
            auth_user_header: args.auth_user_header.to_lowercase(),
            cleanup_action: args.cleanup_action.clone(),
        }
    }
}

/// Request metadata the history store needs to tell callers apart.
pub struct Caller(pub RequestContext);

impl FromRequestParts<AppState> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState
    ) -> Result<Self, Self::Rejection> {
        let remote_addr = parts.extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let user_agent = parts.headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let authenticated_user_id = parts.headers
            .get(state.auth_user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        Ok(
            Caller(RequestContext {
                authenticated_user_id,
                remote_addr,
                user_agent,
            })
        )
    }
}

fn message_response(code: StatusCode, message: String) -> Response {
    (code, Json(ActionResponse { success: code.is_success(), message })).into_response()
}

fn error_response(err: HistoryError) -> Response {
    let code = match &err {
        e if e.is_invalid_input() => StatusCode::BAD_REQUEST,
        HistoryError::EmptyHistory => StatusCode::NOT_FOUND,
        _ => {
            error!("History backend failure: {}", err);
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    message_response(code, err.to_string())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/history", get(get_history_handler).delete(clear_history_handler))
        .route("/api/history/messages", post(append_handler))
        .route("/api/history/stats", get(stats_handler))
        .route("/api/history/export", get(export_handler))
        .route("/api/actions/{action}", post(action_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    addr: &str,
    history: Arc<ChatHistory>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = addr.parse::<SocketAddr>()?;
    let app = router(AppState::new(history, &args));

    if args.enable_tls {
        let (cert_path, key_path) = match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("TLS enabled without cert/key".into());
            }
        };
        info!("TLS enabled. Loading certificate from '{}' and key from '{}'", cert_path, key_path);
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;

        info!("Starting HTTPS API server on: https://{}", addr);
        axum_server
            ::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
            e
        })?;
        info!("Starting HTTP API server on: http://{}", addr);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    }

    Ok(())
}

async fn append_handler(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Json(req): Json<AppendRequest>
) -> Response {
    let identity = resolve_identity(None, &ctx);
    let role = Role::from(req.role.as_deref().unwrap_or("user"));
    match state.history.append(&identity, &req.content, role).await {
        Ok(message) => Json(message).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_history_handler(State(state): State<AppState>, Caller(ctx): Caller) -> Response {
    let identity = resolve_identity(None, &ctx);
    match state.history.get_history(&identity).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(e),
    }
}

async fn clear_history_handler(State(state): State<AppState>, Caller(ctx): Caller) -> Response {
    let identity = resolve_identity(None, &ctx);
    match state.history.clear_history(&identity).await {
        Ok(true) => message_response(StatusCode::OK, "History cleared".into()),
        Ok(false) => message_response(StatusCode::OK, "Nothing to clear".into()),
        Err(e) => error_response(e),
    }
}

async fn stats_handler(State(state): State<AppState>, Caller(ctx): Caller) -> Response {
    let identity = resolve_identity(None, &ctx);
    match state.history.get_stats(&identity).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

async fn export_handler(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Query(req): Query<ExportRequest>
) -> Response {
    let identity = resolve_identity(None, &ctx);
    let format = match req.format.as_deref().unwrap_or("json").parse::<ExportFormat>() {
        Ok(format) => format,
        Err(e) => {
            return error_response(e);
        }
    };
    match state.history.export_history(&identity, format).await {
        Ok(body) => ([(header::CONTENT_TYPE, format.content_type())], body).into_response(),
        Err(e) => error_response(e),
    }
}

async fn action_handler(State(state): State<AppState>, Path(action): Path<String>) -> Response {
    if action != state.cleanup_action {
        warn!("Unknown action requested: {}", action);
        return message_response(StatusCode::NOT_FOUND, format!("Unknown action: {}", action));
    }
    match state.history.cleanup_expired().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ HistoryConfig, ManualClock, MemoryHistoryBackend };
    use axum::body::{ to_bytes, Body };
    use axum::http::Request;
    use chrono::Duration;
    use clap::Parser;
    use serde_json::Value;
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        backend: Arc<MemoryHistoryBackend>,
        clock: Arc<ManualClock>,
    }

    fn test_app() -> TestApp {
        let clock = Arc::new(ManualClock::default());
        let backend = Arc::new(MemoryHistoryBackend::new(clock.clone()));
        let history = Arc::new(
            ChatHistory::new(backend.clone(), backend.clone(), clock.clone(), HistoryConfig::default())
        );
        let args = Args::parse_from(["chat-history", "--history-type", "memory"]);
        TestApp { app: router(AppState::new(history, &args)), backend, clock }
    }

    fn request(method: &str, uri: &str, addr: &str, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::USER_AGENT, "test-agent/1.0");
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let mut req = builder.body(body).unwrap();
        req.extensions_mut().insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
        req
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn append_then_read_as_guest() {
        let t = test_app();
        let body = serde_json::json!({ "content": "hello" });
        let (status, _) = send(&t.app, request("POST", "/api/history/messages", "10.0.0.1:5000", Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        let body = serde_json::json!({ "content": "hi there", "role": "assistant" });
        send(&t.app, request("POST", "/api/history/messages", "10.0.0.1:5001", Some(body))).await;

        let (status, text) = send(&t.app, request("GET", "/api/history", "10.0.0.1:6000", None)).await;
        assert_eq!(status, StatusCode::OK);
        let messages: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(messages.as_array().unwrap().len(), 2);
        assert_eq!(messages[0]["content"], "hello");
        assert_eq!(messages[1]["role"], "assistant");

        let (_, text) = send(&t.app, request("GET", "/api/history", "10.0.0.2:6000", None)).await;
        assert_eq!(text, "[]");
    }

    #[tokio::test]
    async fn authenticated_header_selects_registered_history() {
        let t = test_app();
        let mut req = request(
            "POST",
            "/api/history/messages",
            "10.0.0.1:5000",
            Some(serde_json::json!({ "content": "mine" }))
        );
        req.headers_mut().insert("x-user-id", "42".parse().unwrap());
        send(&t.app, req).await;

        let mut req = request("GET", "/api/history/stats", "192.168.1.1:1", None);
        req.headers_mut().insert("x-user-id", "42".parse().unwrap());
        let (_, text) = send(&t.app, req).await;
        let stats: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["user_count"], 1);

        let (_, text) = send(&t.app, request("GET", "/api/history", "10.0.0.1:5000", None)).await;
        assert_eq!(text, "[]");
    }

    #[tokio::test]
    async fn user_id_from_the_client_does_not_switch_identity() {
        let t = test_app();
        let mut req = request(
            "POST",
            "/api/history/messages",
            "10.0.0.1:5000",
            Some(serde_json::json!({ "content": "private" }))
        );
        req.headers_mut().insert("x-user-id", "42".parse().unwrap());
        send(&t.app, req).await;

        let (status, text) = send(&t.app, request("GET", "/api/history?user_id=42", "10.0.0.3:1", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "[]");

        let body = serde_json::json!({ "content": "guest note", "user_id": 42 });
        send(&t.app, request("POST", "/api/history/messages", "10.0.0.3:1", Some(body))).await;

        let (_, text) = send(&t.app, request("GET", "/api/history/stats?user_id=42", "10.0.0.3:1", None)).await;
        let stats: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(stats["total"], 1);

        let mut req = request("GET", "/api/history", "10.0.0.1:5000", None);
        req.headers_mut().insert("x-user-id", "42".parse().unwrap());
        let (_, text) = send(&t.app, req).await;
        let messages: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(messages.as_array().unwrap().len(), 1);
        assert_eq!(messages[0]["content"], "private");
    }

    #[tokio::test]
    async fn empty_content_is_bad_request() {
        let t = test_app();
        let body = serde_json::json!({ "content": "  " });
        let (status, text) = send(&t.app, request("POST", "/api/history/messages", "10.0.0.1:1", Some(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.contains("\"success\":false"));
        assert!(t.backend.is_empty().await);
    }

    #[tokio::test]
    async fn export_sets_content_type_and_reports_failures() {
        let t = test_app();
        let (status, _) = send(&t.app, request("GET", "/api/history/export?format=csv", "10.0.0.1:1", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let body = serde_json::json!({ "content": "a \"quoted\" word" });
        send(&t.app, request("POST", "/api/history/messages", "10.0.0.1:1", Some(body))).await;

        let resp = t.app
            .clone()
            .oneshot(request("GET", "/api/history/export?format=csv", "10.0.0.1:1", None)).await
            .unwrap();
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/csv; charset=utf-8");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let csv = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(csv.starts_with("timestamp,role,message\n"));
        assert!(csv.contains("\"a \"\"quoted\"\" word\""));

        let (status, _) = send(&t.app, request("GET", "/api/history/export?format=xml", "10.0.0.1:1", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn clear_deletes_guest_history() {
        let t = test_app();
        let body = serde_json::json!({ "content": "bye" });
        send(&t.app, request("POST", "/api/history/messages", "10.0.0.1:1", Some(body))).await;
        let (status, _) = send(&t.app, request("DELETE", "/api/history", "10.0.0.1:1", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(t.backend.is_empty().await);
    }

    #[tokio::test]
    async fn cleanup_action_is_open_to_anonymous_callers() {
        let t = test_app();
        let body = serde_json::json!({ "content": "stale" });
        send(&t.app, request("POST", "/api/history/messages", "10.0.0.1:1", Some(body))).await;
        t.clock.advance(Duration::seconds(4000));

        let (status, text) = send(&t.app, request("POST", "/api/actions/ai_chat_cleanup", "10.0.0.9:1", None)).await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(report["scanned"], 1);
        assert!(t.backend.is_empty().await);

        let (status, _) = send(&t.app, request("POST", "/api/actions/reboot", "10.0.0.9:1", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
