//! # Cloud Session Manager
//!
//! Owns the access/refresh token pair for one device link and wraps every
//! authenticated cloud call.
//!
//! ## Token Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  ensure_valid_token (under one lock)                    │
//! │                                                                         │
//! │   no token in memory? ──► load persisted record (once)                 │
//! │            │                                                            │
//! │            ▼                                                            │
//! │   token fresh? ───yes──► done                                          │
//! │            │ no / expiring within refresh buffer                        │
//! │            ▼                                                            │
//! │   token present? ─yes──► POST /auth/refresh-token ──ok──► done         │
//! │            │ no                       │ error                           │
//! │            ▼                          ▼                                 │
//! │   POST /auth/login?timestamp=..&signature=..  ──► done / AuthFailed    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Request Retry
//! ```text
//!   ensure ─► send ─► 401? ─► lock ─► refresh (login on failure) ─► send once
//!                        └─► 2xx: decode body     non-2xx: RequestFailed
//! ```
//!
//! `expiresIn` in auth responses is an absolute unix timestamp, not a
//! duration.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use inkposter_core::signature::signed_query;
use inkposter_core::{Credentials, DeviceIdentity, SessionRecord, TokenState};

use crate::config::CloudSettings;
use crate::error::{SyncError, SyncResult};
use crate::store::{load_versioned, save_versioned, session_key, StateStore};

/// Current unix time in seconds.
pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Requests
// =============================================================================

/// A file part of a multipart form.
#[derive(Clone)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// A multipart form kept as plain data so it can be rebuilt for the retry.
#[derive(Clone, Default)]
pub struct MultipartForm {
    pub text: Vec<(String, String)>,
    pub files: Vec<FilePart>,
}

impl MultipartForm {
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.text.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, part: FilePart) -> Self {
        self.files.push(part);
        self
    }

    fn build(&self) -> SyncResult<reqwest::multipart::Form> {
        let mut form = reqwest::multipart::Form::new();
        for (name, value) in &self.text {
            form = form.text(name.clone(), value.clone());
        }
        for file in &self.files {
            let part = reqwest::multipart::Part::bytes(file.bytes.clone())
                .file_name(file.filename.clone())
                .mime_str(&file.mime)
                .map_err(|e| SyncError::InvalidConfig(format!("invalid mime type: {}", e)))?;
            form = form.part(file.field.clone(), part);
        }
        Ok(form)
    }
}

impl std::fmt::Debug for MultipartForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartForm")
            .field("text", &self.text)
            .field(
                "files",
                &self
                    .files
                    .iter()
                    .map(|p| (&p.field, &p.filename, &p.mime, p.bytes.len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(MultipartForm),
}

/// One authenticated cloud call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        ApiRequest {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = RequestBody::Multipart(form);
        self
    }
}

/// Parses a login/refresh response body.
///
/// `expiresIn` may arrive as an integer, a float or a numeric string; it is
/// floored to whole seconds and kept as an absolute instant.
pub fn parse_auth_response(body: &Value) -> SyncResult<TokenState> {
    let field = |name: &str| {
        body.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::InvalidResponse(format!("auth response missing {}", name)))
    };

    let expires = body
        .get("expiresIn")
        .ok_or_else(|| SyncError::InvalidResponse("auth response missing expiresIn".into()))?;
    let expires_at = match expires {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f.floor() as i64)),
        _ => None,
    }
    .ok_or_else(|| SyncError::InvalidResponse(format!("unusable expiresIn: {}", expires)))?;

    Ok(TokenState {
        access_token: field("accessToken")?,
        refresh_token: field("refreshToken")?,
        expires_at,
    })
}

// =============================================================================
// Session Manager
// =============================================================================

#[derive(Default)]
struct SessionState {
    device_id: Option<DeviceIdentity>,
    token: Option<TokenState>,
    loaded: bool,
    /// Bumped on every token change; orders background saves.
    generation: u64,
}

/// Bearer token plus device id used for one request attempt.
#[derive(Clone)]
struct AuthContext {
    access_token: String,
    device_id: String,
}

/// Authenticated cloud session for one device link.
pub struct SessionManager {
    http: reqwest::Client,
    settings: CloudSettings,
    credentials: Credentials,
    link_id: String,
    store: Arc<dyn StateStore>,
    state: Mutex<SessionState>,
    /// Generation of the last record written.
    persisted: Arc<Mutex<u64>>,
}

impl SessionManager {
    pub fn new(
        settings: CloudSettings,
        credentials: Credentials,
        link_id: impl Into<String>,
        store: Arc<dyn StateStore>,
    ) -> SyncResult<Self> {
        url::Url::parse(&settings.base_url)?;

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()?;

        Ok(SessionManager {
            http,
            settings,
            credentials,
            link_id: link_id.into(),
            store,
            state: Mutex::new(SessionState::default()),
            persisted: Arc::new(Mutex::new(0)),
        })
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    /// Current device id, if one has been generated or loaded.
    pub async fn device_id(&self) -> Option<DeviceIdentity> {
        self.state.lock().await.device_id.clone()
    }

    /// Current token without triggering any network call.
    pub async fn current_token(&self) -> Option<TokenState> {
        self.state.lock().await.token.clone()
    }

    // =========================================================================
    // Token Management
    // =========================================================================

    /// Guarantees a token that is not expiring soon is held.
    pub async fn ensure_valid_token(&self) -> SyncResult<()> {
        self.authorize().await.map(|_| ())
    }

    /// Fresh login with the configured credentials.
    pub async fn login(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        self.login_locked(&mut state).await
    }

    /// Exchanges the current refresh token for a new pair.
    pub async fn refresh(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await
    }

    /// Applies a login/refresh response body and schedules persistence.
    pub async fn apply_auth_response(&self, body: &Value) -> SyncResult<()> {
        let token = parse_auth_response(body)?;
        let mut state = self.state.lock().await;
        self.apply_locked(&mut state, token);
        Ok(())
    }

    async fn authorize(&self) -> SyncResult<AuthContext> {
        let mut state = self.state.lock().await;
        self.ensure_locked(&mut state).await?;
        Self::auth_context(&state)
    }

    async fn ensure_locked(&self, state: &mut SessionState) -> SyncResult<()> {
        if state.token.is_none() && !state.loaded {
            self.load_persisted(state).await;
        }

        let now = now_unix();
        let remaining = match &state.token {
            Some(token) if !token.is_expiring_soon(now, self.settings.refresh_buffer_secs) => {
                return Ok(());
            }
            Some(token) => Some(token.remaining_secs(now)),
            None => None,
        };

        if let Some(remaining_secs) = remaining {
            debug!(
                link_id = %self.link_id,
                remaining_secs,
                "Access token expiring soon, refreshing"
            );
            match self.refresh_locked(state).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(link_id = %self.link_id, ?e, "Token refresh failed, falling back to login"),
            }
        }

        self.login_locked(state).await
    }

    async fn load_persisted(&self, state: &mut SessionState) {
        state.loaded = true;

        let key = session_key(&self.link_id);
        let record = match load_versioned::<SessionRecord>(
            self.store.as_ref(),
            &key,
            SessionRecord::SCHEMA_VERSION,
        )
        .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %key, ?e, "Failed to load persisted tokens");
                None
            }
        };

        let Some(record) = record else {
            return;
        };

        if let Some(device_id) = record.device_id {
            state.device_id = Some(device_id);
        }
        if let Some(token) = record.token {
            debug!(
                link_id = %self.link_id,
                expires_at = ?token.expires_at_utc(),
                "Loaded persisted token"
            );
            state.token = Some(token);
        }
    }

    async fn login_locked(&self, state: &mut SessionState) -> SyncResult<()> {
        let device_id = state
            .device_id
            .get_or_insert_with(DeviceIdentity::generate)
            .clone();

        let timestamp = chrono::Utc::now().timestamp_millis();
        let query = signed_query(
            &self.settings.client_id,
            timestamp,
            &self.settings.client_secret,
        )?;

        info!(link_id = %self.link_id, email = %self.credentials.email, "Logging in");

        let request = self
            .with_default_headers(self.http.post(self.url("/auth/login")))
            .query(&query[..])
            .header("x-header-deviceid", device_id.as_str())
            .json(&json!({
                "email": self.credentials.email,
                "password": self.credentials.password,
                "deviceId": device_id.as_str(),
            }));

        let token = self.send_auth(request, "login").await?;
        self.apply_locked(state, token);

        info!(link_id = %self.link_id, "Login successful");
        Ok(())
    }

    async fn refresh_locked(&self, state: &mut SessionState) -> SyncResult<()> {
        let ctx = Self::auth_context(state)
            .map_err(|_| SyncError::AuthenticationFailed("no token to refresh".into()))?;

        debug!(link_id = %self.link_id, "Refreshing access token");

        let request = self
            .with_auth_headers(self.http.post(self.url("/auth/refresh-token")), &ctx)
            .json(&json!({ "deviceId": ctx.device_id }));

        let token = self.send_auth(request, "refresh").await?;
        self.apply_locked(state, token);

        debug!(link_id = %self.link_id, "Token refreshed");
        Ok(())
    }

    async fn send_auth(&self, request: RequestBuilder, flow: &str) -> SyncResult<TokenState> {
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::AuthenticationFailed(format!("{} request failed: {}", flow, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::AuthenticationFailed(format!(
                "{} rejected with HTTP {}",
                flow,
                status.as_u16()
            )));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| SyncError::AuthenticationFailed(format!("{} response unreadable: {}", flow, e)))?;

        parse_auth_response(&body).map_err(|e| match e {
            SyncError::InvalidResponse(msg) => {
                SyncError::AuthenticationFailed(format!("{} response invalid: {}", flow, msg))
            }
            other => other,
        })
    }

    fn apply_locked(&self, state: &mut SessionState, token: TokenState) {
        state.token = Some(token);
        state.generation += 1;
        self.schedule_persist(state);
    }

    /// Fire-and-forget save of the token record.
    ///
    /// Saves run one at a time and a save older than the last written
    /// generation is dropped, so a stale pair never overwrites a newer one.
    fn schedule_persist(&self, state: &SessionState) {
        let record = SessionRecord {
            device_id: state.device_id.clone(),
            token: state.token.clone(),
        };
        let generation = state.generation;
        let persisted = Arc::clone(&self.persisted);
        let store = Arc::clone(&self.store);
        let key = session_key(&self.link_id);

        tokio::spawn(async move {
            let mut written = persisted.lock().await;
            if generation <= *written {
                debug!(key = %key, generation, "Skipping superseded token save");
                return;
            }
            if let Err(e) =
                save_versioned(store.as_ref(), &key, SessionRecord::SCHEMA_VERSION, &record).await
            {
                warn!(key = %key, ?e, "Failed to persist tokens");
            }
            *written = generation;
        });
    }

    fn auth_context(state: &SessionState) -> SyncResult<AuthContext> {
        match (&state.token, &state.device_id) {
            (Some(token), Some(device_id)) => Ok(AuthContext {
                access_token: token.access_token.clone(),
                device_id: device_id.as_str().to_string(),
            }),
            (Some(token), None) => Ok(AuthContext {
                access_token: token.access_token.clone(),
                device_id: String::new(),
            }),
            _ => Err(SyncError::AuthenticationFailed("no access token".into())),
        }
    }

    // =========================================================================
    // Authenticated Requests
    // =========================================================================

    /// Sends an authenticated request, retrying exactly once after a 401.
    ///
    /// JSON responses are decoded; other bodies come back as a string, and
    /// empty bodies as `null`.
    pub async fn request(&self, request: &ApiRequest) -> SyncResult<Value> {
        let ctx = self.authorize().await?;
        let response = self.send(request, &ctx).await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            debug!(path = %request.path, "Got 401, re-authenticating");
            let ctx = self.recover_from_unauthorized(&ctx).await?;
            self.send(request, &ctx).await?
        } else {
            response
        };

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::RequestFailed {
                method: request.method.to_string(),
                path: request.path.clone(),
                status: status.as_u16(),
            });
        }

        decode_body(response).await
    }

    async fn recover_from_unauthorized(&self, rejected: &AuthContext) -> SyncResult<AuthContext> {
        let mut state = self.state.lock().await;

        // Another caller already replaced the rejected token.
        let replaced = state
            .token
            .as_ref()
            .is_some_and(|t| t.access_token != rejected.access_token);

        if !replaced {
            if let Err(e) = self.refresh_locked(&mut state).await {
                warn!(?e, "Refresh after 401 failed, logging in");
                self.login_locked(&mut state).await?;
            }
        }

        Self::auth_context(&state)
    }

    async fn send(&self, request: &ApiRequest, ctx: &AuthContext) -> SyncResult<reqwest::Response> {
        let mut builder = self.with_auth_headers(
            self.http.request(request.method.clone(), self.url(&request.path)),
            ctx,
        );

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Multipart(form) => builder.multipart(form.build()?),
        };

        Ok(builder.send().await?)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-header-country", self.settings.country.as_str())
            .header("x-header-language", self.settings.language.as_str())
            .header("x-client-id", self.settings.client_id.as_str())
            .header("x-header-clientid", self.settings.client_id.as_str())
    }

    fn with_auth_headers(&self, builder: RequestBuilder, ctx: &AuthContext) -> RequestBuilder {
        self.with_default_headers(builder)
            .bearer_auth(&ctx.access_token)
            .header("x-header-deviceid", ctx.device_id.as_str())
    }
}

async fn decode_body(response: reqwest::Response) -> SyncResult<Value> {
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    if is_json {
        return serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::InvalidResponse(e.to_string()));
    }
    Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoredRecord};
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    /// Matches a login request whose signature is valid for its timestamp.
    struct ValidSignature;

    impl Match for ValidSignature {
        fn matches(&self, request: &Request) -> bool {
            let params: std::collections::HashMap<_, _> =
                request.url.query_pairs().into_owned().collect();
            let (Some(ts), Some(sig)) = (params.get("timestamp"), params.get("signature")) else {
                return false;
            };
            let Ok(ts) = ts.parse::<i64>() else {
                return false;
            };
            let defaults = CloudSettings::default();
            inkposter_core::compute_auth_signature(&defaults.client_id, ts, &defaults.client_secret)
                .is_ok_and(|expected| *sig == expected)
        }
    }

    fn auth_body(access: &str, expires_at: i64) -> Value {
        json!({
            "accessToken": access,
            "refreshToken": format!("{}-refresh", access),
            "expiresIn": expires_at,
        })
    }

    fn manager(server: &MockServer, store: Arc<MemoryStore>) -> SessionManager {
        let settings = CloudSettings {
            base_url: server.uri(),
            ..CloudSettings::default()
        };
        SessionManager::new(
            settings,
            Credentials::new("me@example.com", "pw"),
            "frameA",
            store,
        )
        .unwrap()
    }

    async fn seed_token(store: &MemoryStore, access: &str, expires_at: i64) {
        let record = SessionRecord {
            device_id: Some(DeviceIdentity::from("dev-1".to_string())),
            token: Some(TokenState {
                access_token: access.into(),
                refresh_token: format!("{}-refresh", access),
                expires_at,
            }),
        };
        save_versioned(store, &session_key("frameA"), 1, &record)
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_auth_response_absolute_expiry() {
        let token = parse_auth_response(&json!({
            "accessToken": "a",
            "refreshToken": "r",
            "expiresIn": 1_900_000_000.75,
        }))
        .unwrap();
        assert_eq!(token.expires_at, 1_900_000_000);

        let token = parse_auth_response(&json!({
            "accessToken": "a",
            "refreshToken": "r",
            "expiresIn": "1900000000",
        }))
        .unwrap();
        assert_eq!(token.expires_at, 1_900_000_000);

        assert!(parse_auth_response(&json!({"accessToken": "a"})).is_err());
    }

    #[tokio::test]
    async fn test_login_is_signed_and_persists_device_id() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());

        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(ValidSignature)
            .and(header("x-client-id", "android"))
            .and(header("x-header-country", "BE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("fresh", now_unix() + 86_400)))
            .expect(1)
            .mount(&server)
            .await;

        let session = manager(&server, store.clone());
        session.ensure_valid_token().await.unwrap();

        assert_eq!(session.current_token().await.unwrap().access_token, "fresh");
        let device_id = session.device_id().await.unwrap();

        // Persistence is fire-and-forget.
        let mut persisted = None;
        for _ in 0..50 {
            persisted = load_versioned::<SessionRecord>(store.as_ref(), &session_key("frameA"), 1)
                .await
                .unwrap();
            if persisted.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let persisted = persisted.unwrap();
        assert_eq!(persisted.device_id, Some(device_id));
        assert_eq!(persisted.token.unwrap().access_token, "fresh");
    }

    #[tokio::test]
    async fn test_token_expiring_in_30_minutes_is_refreshed() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, "old", now_unix() + 30 * 60).await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .and(header("authorization", "Bearer old"))
            .and(header("x-header-deviceid", "dev-1"))
            .and(body_json(json!({"deviceId": "dev-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("new", now_unix() + 86_400)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let session = manager(&server, store);
        session.ensure_valid_token().await.unwrap();
        assert_eq!(session.current_token().await.unwrap().access_token, "new");
    }

    #[tokio::test]
    async fn test_fresh_persisted_token_is_reused() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, "cached", now_unix() + 2 * 3600).await;

        let session = manager(&server, store);
        session.ensure_valid_token().await.unwrap();
        assert_eq!(session.current_token().await.unwrap().access_token, "cached");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_persisted_token_refreshes_then_logs_in() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, "stale", now_unix() - 60).await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(header("x-header-deviceid", "dev-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("relogged", now_unix() + 86_400)))
            .expect(1)
            .mount(&server)
            .await;

        let session = manager(&server, store);
        session.ensure_valid_token().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests[0].url.path(), "/auth/refresh-token");
        assert_eq!(requests[1].url.path(), "/auth/login");
        assert_eq!(session.current_token().await.unwrap().access_token, "relogged");
        // Existing device identity is kept.
        assert_eq!(session.device_id().await.unwrap().as_str(), "dev-1");
    }

    #[tokio::test]
    async fn test_login_failure_is_authentication_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let session = manager(&server, Arc::new(MemoryStore::new()));
        let err = session.ensure_valid_token().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_request_retries_once_after_401() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, "old", now_unix() + 86_400).await;

        Mock::given(method("GET"))
            .and(path("/frame/status"))
            .and(header("authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("new", now_unix() + 86_400)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/frame/status"))
            .and(header("authorization", "Bearer new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"frameA": {"batteryCapacity": 87}}])))
            .expect(1)
            .mount(&server)
            .await;

        let session = manager(&server, store);
        let body = session.request(&ApiRequest::get("/frame/status")).await.unwrap();
        assert_eq!(body[0]["frameA"]["batteryCapacity"], 87);
    }

    #[tokio::test]
    async fn test_401_with_failed_refresh_logs_in_and_retries() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, "old", now_unix() + 86_400).await;

        Mock::given(method("GET"))
            .and(path("/frame/status"))
            .and(header("authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(ValidSignature)
            .and(header("x-header-deviceid", "dev-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("relogged", now_unix() + 86_400)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/frame/status"))
            .and(header("authorization", "Bearer relogged"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"frameA": {"batteryCapacity": 64}}])))
            .expect(1)
            .mount(&server)
            .await;

        let session = manager(&server, store);
        let body = session.request(&ApiRequest::get("/frame/status")).await.unwrap();
        assert_eq!(body[0]["frameA"]["batteryCapacity"], 64);

        let paths: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(
            paths,
            vec!["/frame/status", "/auth/refresh-token", "/auth/login", "/frame/status"]
        );
        assert_eq!(session.current_token().await.unwrap().access_token, "relogged");
    }

    #[tokio::test]
    async fn test_malformed_login_body_is_authentication_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "a"})))
            .expect(1)
            .mount(&server)
            .await;

        let session = manager(&server, Arc::new(MemoryStore::new()));
        let err = session.ensure_valid_token().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(_)), "got {err:?}");
        assert!(session.current_token().await.is_none());
    }

    /// Store whose save of the `first` token is slow.
    struct SlowFirstSave {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl StateStore for SlowFirstSave {
        async fn load_record(&self, key: &str) -> SyncResult<Option<StoredRecord>> {
            self.inner.load_record(key).await
        }

        async fn save_record(&self, key: &str, record: StoredRecord) -> SyncResult<()> {
            if record.payload["token"]["access_token"] == "first" {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.inner.save_record(key, record).await
        }

        async fn delete_record(&self, key: &str) -> SyncResult<()> {
            self.inner.delete_record(key).await
        }
    }

    #[tokio::test]
    async fn test_slow_older_save_never_overwrites_newer_token() {
        let store = Arc::new(SlowFirstSave {
            inner: MemoryStore::new(),
        });
        let session = SessionManager::new(
            CloudSettings::default(),
            Credentials::new("me@example.com", "pw"),
            "frameA",
            store.clone(),
        )
        .unwrap();

        session
            .apply_auth_response(&auth_body("first", now_unix() + 3600))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        session
            .apply_auth_response(&auth_body("second", now_unix() + 7200))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let persisted = load_versioned::<SessionRecord>(&store.inner, &session_key("frameA"), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.token.unwrap().access_token, "second");
    }

    #[tokio::test]
    async fn test_second_401_surfaces_request_failed() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, "old", now_unix() + 86_400).await;

        Mock::given(method("GET"))
            .and(path("/frame/status"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("new", now_unix() + 86_400)))
            .expect(1)
            .mount(&server)
            .await;

        let session = manager(&server, store);
        let err = session.request(&ApiRequest::get("/frame/status")).await.unwrap_err();
        match err {
            SyncError::RequestFailed { method, path, status } => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/frame/status");
                assert_eq!(status, 401);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_json_and_query_parameters() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, "tok", now_unix() + 86_400).await;

        Mock::given(method("GET"))
            .and(path("/user/frames"))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
            .expect(1)
            .mount(&server)
            .await;

        let session = manager(&server, store);
        let body = session
            .request(&ApiRequest::get("/user/frames").query("limit", "100"))
            .await
            .unwrap();
        assert_eq!(body, Value::String("plain".into()));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(auth_body("shared", now_unix() + 86_400))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let session = manager(&server, Arc::new(MemoryStore::new()));
        let (a, b, c) = tokio::join!(
            session.ensure_valid_token(),
            session.ensure_valid_token(),
            session.ensure_valid_token()
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
    }
}
