//! HTTP session API and route table.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::reply::{self, Reply};
use warp::{Filter, Rejection};

use crate::session::{CreateError, KeyFormat, NewSession, Session, SessionError};
use crate::{peer_control, State};

/// Create requests are tiny; anything bigger is rejected before parsing.
const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub expires_in_minutes: Option<i64>,
    #[serde(default)]
    pub one_time_session: Option<bool>,
    #[serde(default)]
    pub key_format: Option<KeyFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_key: String,
    pub session_name: String,
    pub server_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub session_url: String,
    pub relay_server: String,
    pub relay_server_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SessionStatus {
    fn from_result(result: &Result<Session, SessionError>) -> (StatusCode, Self) {
        match result {
            Ok(session) => (
                StatusCode::OK,
                Self {
                    valid: true,
                    session_name: Some(session.session_name.clone()),
                    server_id: Some(session.server_id.clone()),
                    relay_server: Some(session.assigned_relay.url.clone()),
                    reason: None,
                },
            ),
            Err(e) => (
                status_for(e),
                Self {
                    valid: false,
                    session_name: None,
                    server_id: None,
                    relay_server: None,
                    reason: Some(e.reason().to_string()),
                },
            ),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn status_for(err: &SessionError) -> StatusCode {
    match err {
        SessionError::Invalid => StatusCode::NOT_FOUND,
        SessionError::Expired | SessionError::AlreadyUsed => StatusCode::UNAUTHORIZED,
    }
}

fn with_state(
    state: Arc<State>,
) -> impl Filter<Extract = (Arc<State>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Every route the relay serves: the peer control socket plus the HTTP
/// session API, with CORS and request logging.
pub fn routes(
    state: Arc<State>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let hello = warp::path::end()
        .and(warp::get())
        .map(|| "Tether Relay is Active");
    let health = warp::path!("health").and(warp::get()).map(|| "ok");

    let ws_peer = warp::path!("ws" / "peer" / String)
        .and(warp::ws())
        .and(with_state(state.clone()))
        .map(|peer_id: String, ws: warp::ws::Ws, state: Arc<State>| {
            ws.on_upgrade(move |socket| peer_control(socket, peer_id, state))
        });

    let create = warp::path!("session" / "create")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(create_session);

    let validate = warp::path!("api" / "session" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(validate_session);

    let landing = warp::path!("client" / "connect")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state))
        .and_then(landing_page);

    hello
        .or(health)
        .or(ws_peer)
        .or(create)
        .or(validate)
        .or(landing)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "OPTIONS"])
                .allow_headers(vec!["content-type"]),
        )
        .with(warp::log("tether_relay"))
}

pub async fn create_session(
    body: CreateSessionRequest,
    state: Arc<State>,
) -> Result<reply::Response, Infallible> {
    let mut request = NewSession::new(body.server_id)
        .ttl_minutes(Some(
            body.expires_in_minutes
                .unwrap_or(state.config.session_ttl_minutes),
        ))
        .one_time(body.one_time_session.unwrap_or(true))
        .key_format(body.key_format.unwrap_or_default());
    if let Some(name) = body.session_name {
        request = request.named(name);
    }

    let session = match state.registry.create(request).await {
        Ok(s) => s,
        Err(e) => {
            let status = match e {
                CreateError::MissingServerId | CreateError::InvalidTtl(_) => {
                    StatusCode::BAD_REQUEST
                }
                CreateError::KeySpaceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            };
            return Ok(reply::with_status(
                reply::json(&ErrorBody {
                    error: e.to_string(),
                }),
                status,
            )
            .into_response());
        }
    };

    let response = CreateSessionResponse {
        session_url: format!(
            "{}/client/connect?sessionKey={}",
            state.config.public_url, session.session_key
        ),
        session_key: session.session_key,
        session_name: session.session_name,
        server_id: session.server_id,
        expires_at: session.expires_at,
        relay_server: session.assigned_relay.url,
        relay_server_name: session.assigned_relay.name,
    };
    Ok(reply::with_status(reply::json(&response), StatusCode::OK).into_response())
}

/// Redeems the session: a one-time session answers `valid: true` once.
pub async fn validate_session(
    key: String,
    state: Arc<State>,
) -> Result<reply::Response, Infallible> {
    let result = state.registry.validate(&key).await;
    let (status, body) = SessionStatus::from_result(&result);
    Ok(reply::with_status(reply::json(&body), status).into_response())
}

pub async fn landing_page(
    query: HashMap<String, String>,
    state: Arc<State>,
) -> Result<reply::Response, Infallible> {
    let Some(key) = query.get("sessionKey").filter(|k| !k.is_empty()) else {
        return Ok(reply::with_status(
            reply::html(page("Missing session key", "No sessionKey was supplied.")),
            StatusCode::BAD_REQUEST,
        )
        .into_response());
    };

    let (status, html) = match state.registry.peek(key).await {
        Ok(session) => (
            StatusCode::OK,
            page(
                &session.session_name,
                &format!(
                    "Session for <b>{}</b> via {}.",
                    escape_html(&session.server_id),
                    escape_html(&session.assigned_relay.name)
                ),
            ),
        ),
        Err(e) => (
            status_for(&e),
            page("Session unavailable", &format!("Reason: {}", e.reason())),
        ),
    };
    Ok(reply::with_status(reply::html(html), status).into_response())
}

fn page(title: &str, body_html: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{body_html}</p></body></html>",
        title = escape_html(title),
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;

    fn state() -> Arc<State> {
        Arc::new(State::default())
    }

    async fn create(state: &Arc<State>, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let res = warp::test::request()
            .method("POST")
            .path("/session/create")
            .json(&body)
            .reply(&routes(state.clone()))
            .await;
        let json = serde_json::from_slice(res.body()).unwrap_or(serde_json::Value::Null);
        (res.status(), json)
    }

    #[tokio::test]
    async fn create_then_redeem_once() {
        let state = state();
        let (status, created) = create(
            &state,
            serde_json::json!({"serverId": "srv1", "expiresInMinutes": 30, "oneTimeSession": true}),
        )
        .await;
        assert_equal!(status, StatusCode::OK);
        let key = created["sessionKey"].as_str().unwrap().to_string();
        assert_equal!(key.len(), 32);
        assert_eq!(created["sessionName"], "srv1 session");
        assert_equal!(
            created["sessionUrl"].as_str().unwrap().to_string(),
            format!("http://127.0.0.1:9090/client/connect?sessionKey={key}")
        );
        assert_eq!(created["relayServerName"], "local");

        let path = format!("/api/session/{key}");
        let filter = routes(state.clone());
        let first = warp::test::request().path(&path).reply(&filter).await;
        assert_equal!(first.status(), StatusCode::OK);
        let body: SessionStatus = serde_json::from_slice(first.body()).unwrap();
        assert!(body.valid);
        assert_equal!(body.server_id.as_deref(), Some("srv1"));

        let second = warp::test::request().path(&path).reply(&filter).await;
        assert_equal!(second.status(), StatusCode::UNAUTHORIZED);
        let body: SessionStatus = serde_json::from_slice(second.body()).unwrap();
        assert!(!body.valid);
        assert_equal!(body.reason.as_deref(), Some("AlreadyUsed"));
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let res = warp::test::request()
            .path("/api/session/deadbeef")
            .reply(&routes(state()))
            .await;
        assert_equal!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_server_id_is_bad_request() {
        let (status, _) = create(&state(), serde_json::json!({"sessionName": "x"})).await;
        assert_equal!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_ttl_is_bad_request() {
        let (status, body) = create(
            &state(),
            serde_json::json!({"serverId": "srv1", "expiresInMinutes": 9_000_000_000_000_000_000i64}),
        )
        .await;
        assert_equal!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("out of range"));
    }

    #[tokio::test]
    async fn non_positive_ttl_never_expires() {
        let (_, created) = create(
            &state(),
            serde_json::json!({"serverId": "srv1", "expiresInMinutes": 0, "keyFormat": "numeric"}),
        )
        .await;
        assert!(created["expiresAt"].is_null());
        assert_equal!(created["sessionKey"].as_str().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn landing_page_does_not_consume() {
        let state = state();
        let (_, created) = create(
            &state,
            serde_json::json!({"serverId": "srv1", "sessionName": "<script>"}),
        )
        .await;
        let key = created["sessionKey"].as_str().unwrap().to_string();
        let filter = routes(state.clone());

        let page = warp::test::request()
            .path(&format!("/client/connect?sessionKey={key}"))
            .reply(&filter)
            .await;
        assert_equal!(page.status(), StatusCode::OK);
        let html = String::from_utf8_lossy(page.body()).to_string();
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));

        let redeem = warp::test::request()
            .path(&format!("/api/session/{key}"))
            .reply(&filter)
            .await;
        assert_equal!(redeem.status(), StatusCode::OK);

        let page = warp::test::request()
            .path(&format!("/client/connect?sessionKey={key}"))
            .reply(&filter)
            .await;
        assert_equal!(page.status(), StatusCode::UNAUTHORIZED);

        let missing = warp::test::request()
            .path("/client/connect")
            .reply(&filter)
            .await;
        assert_equal!(missing.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let res = warp::test::request()
            .path("/health")
            .reply(&routes(state()))
            .await;
        assert_equal!(res.status(), StatusCode::OK);
        assert_equal!(res.body().as_ref(), b"ok".as_ref());
    }
}
