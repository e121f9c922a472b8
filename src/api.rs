use crate::errors::{ErrorBody, ShellResult};
use crate::models::{HealthResponse, SessionInfo, TeardownResponse, TerminalSize};
use crate::sandbox::DEFAULT_OWNER;
use crate::service::{AppState, TerminalRequest, TerminalService};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::OpenApi as UtoipaOpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Identity headers set by the authenticating proxy, in order of preference.
const OWNER_HEADERS: [&str; 2] = ["x-forwarded-user", "x-username"];

#[derive(Deserialize, Default)]
struct TerminalParams {
    session_id: Option<String>,
    #[serde(default)]
    reconnect: bool,
    cols: Option<u16>,
    rows: Option<u16>,
}

impl TerminalParams {
    fn size(&self) -> Option<TerminalSize> {
        match (self.cols, self.rows) {
            (Some(cols), Some(rows)) if cols > 0 && rows > 0 => Some(TerminalSize { cols, rows }),
            _ => None,
        }
    }
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(health, get_session, delete_session),
    components(schemas(HealthResponse, SessionInfo, TeardownResponse, ErrorBody)),
    tags((name = "sessions", description = "Terminal sessions backed by per-user sandbox pods"))
)]
pub struct ApiDoc;

pub fn build_router(service: Arc<dyn TerminalService>) -> Router {
    let state = AppState::new(service);
    let openapi = ApiDoc::openapi();
    let swagger_routes: Router<AppState> =
        SwaggerUi::new("/docs").url("/openapi.json", openapi).into();

    Router::new()
        .route("/healthz", get(health))
        .route("/ws/terminal", any(terminal))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .merge(swagger_routes)
        .with_state(state)
}

fn owner_from(headers: &HeaderMap) -> String {
    OWNER_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(DEFAULT_OWNER)
        .to_string()
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn terminal(
    state: State<AppState>,
    Query(params): Query<TerminalParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let request = TerminalRequest {
        session_id: params.session_id.clone().filter(|id| !id.is_empty()),
        reconnect: params.reconnect,
        owner: owner_from(&headers),
        size: params.size(),
    };
    tracing::info!(
        owner = %request.owner,
        session_id = ?request.session_id,
        reconnect = request.reconnect,
        "terminal connection requested"
    );

    let service = state.service.clone();
    ws.on_upgrade(move |socket| async move {
        service.attach(socket, request).await;
    })
}

#[utoipa::path(
    get,
    path = "/sessions/{id}",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session details", body = SessionInfo),
        (status = 404, description = "Session not found", body = ErrorBody)
    ),
    tag = "sessions"
)]
async fn get_session(
    state: State<AppState>,
    Path(id): Path<String>,
) -> ShellResult<Json<SessionInfo>> {
    Ok(Json(state.service.session(&id).await?))
}

#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Sandbox and session deleted", body = TeardownResponse),
        (status = 404, description = "Session not found", body = ErrorBody),
        (status = 502, description = "Sandbox deletion failed", body = ErrorBody)
    ),
    tag = "sessions"
)]
async fn delete_session(
    state: State<AppState>,
    Path(id): Path<String>,
) -> ShellResult<Json<TeardownResponse>> {
    state.service.teardown_session(&id).await?;
    Ok(Json(TeardownResponse {
        status: "deleted".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ShellError;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::ws::WebSocket;
    use axum::http::{HeaderValue, Request, StatusCode};
    use chrono::Utc;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct MockService {
        torn_down: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TerminalService for MockService {
        async fn attach(&self, _socket: WebSocket, _request: TerminalRequest) {}

        async fn session(&self, id: &str) -> ShellResult<SessionInfo> {
            if id != "known" {
                return Err(ShellError::SessionNotFound(id.to_string()));
            }
            Ok(SessionInfo {
                session_id: id.to_string(),
                sandbox: "kubeshell-alice".to_string(),
                owner: "alice".to_string(),
                created_at: Utc::now(),
                last_used_at: Utc::now(),
                active: false,
            })
        }

        async fn teardown_session(&self, id: &str) -> ShellResult<()> {
            if id != "known" {
                return Err(ShellError::SessionNotFound(id.to_string()));
            }
            self.torn_down.lock().await.push(id.to_string());
            Ok(())
        }
    }

    fn make_test_router(service: MockService) -> Router {
        build_router(Arc::new(service))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn serves_openapi_document() {
        let app = make_test_router(MockService::default());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = make_test_router(MockService::default());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let app = make_test_router(MockService::default());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "not_found");
    }

    #[tokio::test]
    async fn session_details_are_returned() {
        let app = make_test_router(MockService::default());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions/known")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["session_id"], "known");
        assert_eq!(body["sandbox"], "kubeshell-alice");
    }

    #[tokio::test]
    async fn delete_tears_down_session() {
        let service = MockService::default();
        let app = make_test_router(service.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/sessions/known")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "deleted");
        assert_eq!(*service.torn_down.lock().await, vec!["known".to_string()]);
    }

    #[tokio::test]
    async fn terminal_requires_websocket_upgrade() {
        let app = make_test_router(MockService::default());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws/terminal")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[test]
    fn owner_prefers_forwarded_user() {
        let mut headers = HeaderMap::new();
        assert_eq!(owner_from(&headers), DEFAULT_OWNER);

        headers.insert("x-username", HeaderValue::from_static("bob"));
        assert_eq!(owner_from(&headers), "bob");

        headers.insert("x-forwarded-user", HeaderValue::from_static("Alice Smith"));
        assert_eq!(owner_from(&headers), "Alice Smith");

        headers.insert("x-forwarded-user", HeaderValue::from_static("  "));
        assert_eq!(owner_from(&headers), "bob");
    }

    #[test]
    fn terminal_size_needs_both_dimensions() {
        let params = TerminalParams {
            cols: Some(120),
            rows: Some(40),
            ..TerminalParams::default()
        };
        assert_eq!(params.size(), Some(TerminalSize { cols: 120, rows: 40 }));

        let params = TerminalParams {
            cols: Some(120),
            ..TerminalParams::default()
        };
        assert_eq!(params.size(), None);
    }
}
