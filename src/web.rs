//! HTTP surface: discovery and JWKS, the device authorization endpoint, the
//! verification pages, the token endpoint and userinfo.
use crate::device::{
    AuthorizationStateMachine, BruteForceGuard, BruteForcePolicy, ClientAuthMethod,
    ClientAuthentication, Clock, DeviceInfo, DeviceTokenEndpoint, PollOutcome, RecordId,
    SeaAttemptStore, SeaDeviceStore, StartRequest, TokenErrorCode, UserCodeLookup,
};
use crate::device::codes::join_user_code_parts;
use crate::device::record::parse_scopes;
use crate::errors::DeviceFlowError;
use crate::identity::{DbIdentityVerifier, IdentityVerifier};
use crate::jwks::JwksManager;
use crate::pages;
use crate::settings::Settings;
use crate::storage;
use crate::tokens::{userinfo_claims, JwtTokenIssuer, RefreshOutcome, TokenIssuer, TokenSet};
use axum::body::Body;
use axum::extract::{ConnectInfo, Form, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64ct::{Base64, Encoding};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const CONSENT_PATH: &str = "/device_authorization/consent";

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub jwks: JwksManager,
    pub machine: Arc<AuthorizationStateMachine>,
    pub endpoint: DeviceTokenEndpoint,
    pub issuer: Arc<dyn TokenIssuer>,
    pub identity: Arc<dyn IdentityVerifier>,
}

impl AppState {
    /// Wire the device flow onto the database-backed stores.
    pub fn new(
        settings: Settings,
        db: DatabaseConnection,
        jwks: JwksManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let issuer: Arc<dyn TokenIssuer> =
            Arc::new(JwtTokenIssuer::new(db.clone(), jwks.clone(), &settings));
        let guard = BruteForceGuard::new(
            BruteForcePolicy::from(&settings.brute_force),
            Arc::new(SeaAttemptStore::new(db.clone())),
        );
        let machine = Arc::new(AuthorizationStateMachine::new(
            &settings,
            Arc::new(SeaDeviceStore::new(db.clone())),
            guard,
            issuer.clone(),
            clock,
        ));

        Self {
            endpoint: DeviceTokenEndpoint::new(machine.clone()),
            identity: Arc::new(DbIdentityVerifier::new(db.clone())),
            settings: Arc::new(settings),
            db,
            jwks,
            machine,
            issuer,
        }
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    // Pages are inline-styled and script free
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static(
            "default-src 'self'; style-src 'self' 'unsafe-inline'; form-action 'self'; frame-ancestors 'none'",
        ),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    let verification_path = state.settings.device.verification_path.clone();

    Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route("/device_authorization", post(device_authorization))
        .route(
            &verification_path,
            get(verification_page).post(verification_submit),
        )
        .route(CONSENT_PATH, post(consent_submit))
        .route("/token", post(token))
        .route("/userinfo", get(userinfo))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let app = router(state);

    tracing::info!(%addr, "Public API listening");
    tracing::warn!("Rate limiting should be configured at the reverse proxy level for production");
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .into_diagnostic()?;
    Ok(())
}

async fn discovery(State(state): State<AppState>) -> impl IntoResponse {
    let issuer = state.settings.issuer();
    Json(json!({
        "issuer": issuer,
        "device_authorization_endpoint": format!("{}/device_authorization", issuer),
        "token_endpoint": format!("{}/token", issuer),
        "userinfo_endpoint": format!("{}/userinfo", issuer),
        "jwks_uri": format!("{}/.well-known/jwks.json", issuer),
        "grant_types_supported": [DEVICE_CODE_GRANT, "refresh_token"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post"],
        "scopes_supported": ["openid", "profile", "email"],
        "claims_supported": ["sub", "preferred_username", "name", "email", "email_verified"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": [state.settings.keys.alg],
    }))
}

async fn jwks_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.jwks.jwks_json())
}

fn json_with_headers(status: StatusCode, value: Value, headers: &[(&str, String)]) -> Response {
    let mut resp = (status, Json(value)).into_response();
    let h = resp.headers_mut();
    for (name, val) in headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(val),
        ) {
            h.insert(n, v);
        }
    }
    resp
}

fn no_store(status: StatusCode, value: Value) -> Response {
    json_with_headers(
        status,
        value,
        &[
            ("cache-control", "no-store".to_string()),
            ("pragma", "no-cache".to_string()),
        ],
    )
}

fn token_error(code: TokenErrorCode) -> Response {
    let body = json!({
        "error": code.as_str(),
        "error_description": code.description(),
    });
    if code == TokenErrorCode::InvalidClient {
        return json_with_headers(
            code.status(),
            body,
            &[
                (
                    "www-authenticate",
                    "Basic realm=\"token\", error=\"invalid_client\"".to_string(),
                ),
                ("cache-control", "no-store".to_string()),
                ("pragma", "no-cache".to_string()),
            ],
        );
    }
    no_store(code.status(), body)
}

fn server_error(e: impl Display) -> Response {
    tracing::error!(error = %e, "Request failed");
    no_store(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error":"server_error"}),
    )
}

fn html_server_error(e: impl Display) -> Response {
    tracing::error!(error = %e, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(pages::message(
            "Something went wrong",
            "Please try again later.",
        )),
    )
        .into_response()
}

/// Client credentials as presented: Basic header first, then form body.
fn client_credentials(
    headers: &HeaderMap,
    form_client_id: Option<&str>,
    form_client_secret: Option<&str>,
) -> Option<(ClientAuthentication, String)> {
    if let Some(auth_val) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(b64) = auth_val.strip_prefix("Basic ") {
            let decoded = Base64::decode_vec(b64.trim()).ok()?;
            let s = String::from_utf8(decoded).ok()?;
            let (id, sec) = s.split_once(':')?;
            let id = urlencoding::decode(id).ok()?.into_owned();
            let sec = urlencoding::decode(sec).ok()?.into_owned();
            return Some((
                ClientAuthentication {
                    client_id: id,
                    method: ClientAuthMethod::ClientSecretBasic,
                },
                sec,
            ));
        }
    }

    match (form_client_id, form_client_secret) {
        (Some(id), Some(sec)) if !id.is_empty() => Some((
            ClientAuthentication {
                client_id: id.to_string(),
                method: ClientAuthMethod::ClientSecretPost,
            },
            sec.to_string(),
        )),
        _ => None,
    }
}

/// Authenticate a confidential client. `Err` carries the response to send.
async fn authenticate_client(
    state: &AppState,
    headers: &HeaderMap,
    form_client_id: Option<&str>,
    form_client_secret: Option<&str>,
) -> Result<(ClientAuthentication, storage::Client), Response> {
    let Some((auth, secret)) = client_credentials(headers, form_client_id, form_client_secret)
    else {
        return Err(token_error(TokenErrorCode::InvalidClient));
    };

    match storage::get_client(&state.db, &auth.client_id).await {
        Ok(Some(client)) if client.client_secret == secret => Ok((auth, client)),
        Ok(_) => {
            tracing::warn!(client_id = %auth.client_id, "Client authentication failed");
            Err(token_error(TokenErrorCode::InvalidClient))
        }
        Err(e) => Err(server_error(e)),
    }
}

/// Address of the end user agent: the TCP peer, or the right-most
/// X-Forwarded-For entry not written by a trusted proxy.
fn client_address(headers: &HeaderMap, peer: IpAddr, trusted_hops: usize) -> IpAddr {
    if trusted_hops == 0 {
        return peer;
    }
    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .collect();
    let Some(entry) = hops.len().checked_sub(trusted_hops).map(|i| hops[i]) else {
        tracing::debug!(
            %peer,
            hops = hops.len(),
            "X-Forwarded-For shorter than trusted proxy chain"
        );
        return peer;
    };
    match entry
        .parse::<IpAddr>()
        .ok()
        .or_else(|| entry.parse::<SocketAddr>().ok().map(|a| a.ip()))
    {
        Some(ip) => ip,
        None => {
            tracing::debug!(%peer, entry, "Unparseable X-Forwarded-For entry");
            peer
        }
    }
}

/// Client address for brute-force accounting and device metadata.
pub struct ClientContext(pub IpAddr);

impl FromRequestParts<AppState> for ClientContext {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() else {
            return Err(html_server_error(
                "missing peer address; serve with into_make_service_with_connect_info",
            ));
        };
        Ok(ClientContext(client_address(
            &parts.headers,
            peer.ip(),
            state.settings.server.trusted_proxy_hops,
        )))
    }
}

impl ClientContext {
    fn key(&self) -> String {
        self.0.to_string()
    }
}

fn device_info(client: &ClientContext, headers: &HeaderMap) -> DeviceInfo {
    DeviceInfo {
        ip_address: Some(client.key()),
        user_agent: headers
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorizationRequest {
    client_id: Option<String>,
    client_secret: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    verification_uri_complete: String,
    expires_in: i64,
    interval: i64,
}

/// POST /device_authorization - RFC 8628 Device Authorization Endpoint
async fn device_authorization(
    State(state): State<AppState>,
    client_ctx: ClientContext,
    headers: HeaderMap,
    Form(req): Form<DeviceAuthorizationRequest>,
) -> Response {
    let (client_auth, client) = match authenticate_client(
        &state,
        &headers,
        req.client_id.as_deref(),
        req.client_secret.as_deref(),
    )
    .await
    {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let scopes = parse_scopes(req.scope.as_deref().unwrap_or("openid"));
    if !scopes.iter().any(|s| s == "openid") {
        return no_store(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "invalid_scope",
                "error_description": "Scope must include 'openid'"
            }),
        );
    }

    let request = StartRequest {
        client: client_auth,
        client_name: client.client_name,
        scopes,
        device_info: Some(device_info(&client_ctx, &headers)),
    };

    let record = match state.machine.start(request).await {
        Ok(record) => record,
        Err(DeviceFlowError::CodeSpaceExhausted { .. }) => {
            return no_store(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error":"temporarily_unavailable"}),
            )
        }
        Err(e) => return server_error(e),
    };

    let verification_uri = state.settings.verification_uri();
    let verification_uri_complete = format!(
        "{}?user_code={}",
        verification_uri,
        urlencoding::encode(&record.user_code)
    );
    let now = state.machine.now();

    let resp = DeviceAuthorizationResponse {
        expires_in: record.expires_in(now),
        interval: record.poll_interval,
        device_code: record.device_code,
        user_code: record.user_code,
        verification_uri,
        verification_uri_complete,
    };

    match serde_json::to_value(resp) {
        Ok(v) => no_store(StatusCode::OK, v),
        Err(e) => server_error(e),
    }
}

/// Page for a user_code lookup outcome.
fn render_lookup(state: &AppState, lookup: UserCodeLookup) -> Response {
    let entry_path = state.settings.device.verification_path.as_str();
    match lookup {
        UserCodeLookup::Found(record) => {
            Html(pages::consent(CONSENT_PATH, &record, None)).into_response()
        }
        UserCodeLookup::InvalidFormat => (
            StatusCode::BAD_REQUEST,
            Html(pages::user_code_entry(
                entry_path,
                Some("Invalid user code format. The code has 8 letters, like WDJB-MJHT."),
            )),
        )
            .into_response(),
        UserCodeLookup::NotFound => (
            StatusCode::BAD_REQUEST,
            Html(pages::user_code_entry(
                entry_path,
                Some("The code you entered is invalid or has expired."),
            )),
        )
            .into_response(),
        UserCodeLookup::TooManyAttempts { retry_after } => locked_page(entry_path, retry_after),
    }
}

fn locked_page(entry_path: &str, retry_after: i64) -> Response {
    let mut resp = (
        StatusCode::TOO_MANY_REQUESTS,
        Html(pages::user_code_entry(
            entry_path,
            Some(&pages::too_many_attempts_text(retry_after)),
        )),
    )
        .into_response();
    if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
        resp.headers_mut().insert(axum::http::header::RETRY_AFTER, v);
    }
    resp
}

#[derive(Debug, Deserialize)]
struct VerificationQuery {
    user_code: Option<String>,
}

/// GET verification page; `?user_code=` skips the entry form.
async fn verification_page(
    State(state): State<AppState>,
    client_ctx: ClientContext,
    Query(query): Query<VerificationQuery>,
) -> Response {
    let Some(user_code) = query.user_code.filter(|c| !c.trim().is_empty()) else {
        return Html(pages::user_code_entry(
            &state.settings.device.verification_path,
            None,
        ))
        .into_response();
    };

    match state
        .machine
        .resolve_user_code(&client_ctx.key(), &user_code)
        .await
    {
        Ok(lookup) => render_lookup(&state, lookup),
        Err(e) => html_server_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct VerificationForm {
    #[serde(rename = "userCodePart1", default)]
    user_code_part1: String,
    #[serde(rename = "userCodePart2", default)]
    user_code_part2: String,
}

/// POST verification page: the two code halves.
async fn verification_submit(
    State(state): State<AppState>,
    client_ctx: ClientContext,
    Form(form): Form<VerificationForm>,
) -> Response {
    let raw = join_user_code_parts(&form.user_code_part1, &form.user_code_part2);
    match state
        .machine
        .resolve_user_code(&client_ctx.key(), &raw)
        .await
    {
        Ok(lookup) => render_lookup(&state, lookup),
        Err(e) => html_server_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ConsentForm {
    record_id: i64,
    user_code: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    action: String,
}

/// POST consent: authenticate the user, then approve or deny.
async fn consent_submit(
    State(state): State<AppState>,
    client_ctx: ClientContext,
    Form(form): Form<ConsentForm>,
) -> Response {
    let approve = match form.action.as_str() {
        "approve" => true,
        "deny" => false,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Html(pages::message("Invalid request", "Unknown action.")),
            )
                .into_response()
        }
    };

    let id = RecordId(form.record_id);
    let record = match state
        .machine
        .resolve_reference(&client_ctx.key(), id, &form.user_code)
        .await
    {
        Ok(UserCodeLookup::Found(record)) => record,
        Ok(other) => return render_lookup(&state, other),
        Err(e) => return html_server_error(e),
    };

    let subject = match state
        .identity
        .authenticate(&form.username, &form.password)
        .await
    {
        Ok(Some(subject)) => subject,
        Ok(None) => {
            tracing::info!(record_id = %id, "Consent login failed");
            return (
                StatusCode::UNAUTHORIZED,
                Html(pages::consent(
                    CONSENT_PATH,
                    &record,
                    Some("Invalid username or password."),
                )),
            )
                .into_response();
        }
        Err(e) => return html_server_error(e),
    };

    let result = if approve {
        let auth_time = state.machine.now();
        state.machine.approve(id, &subject, auth_time).await
    } else {
        state.machine.deny(id).await
    };

    match result {
        Ok(()) if approve => Html(pages::approved()).into_response(),
        Ok(()) => Html(pages::denied()).into_response(),
        Err(DeviceFlowError::Conflict) => (
            StatusCode::CONFLICT,
            Html(pages::message(
                "Already decided",
                "This request was already answered with a different decision.",
            )),
        )
            .into_response(),
        Err(DeviceFlowError::NotPending) => (
            StatusCode::BAD_REQUEST,
            Html(pages::message(
                "Request expired",
                "This request has expired or was already used. Start again on your device.",
            )),
        )
            .into_response(),
        Err(e) => html_server_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    device_code: Option<String>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

fn token_set_response(tokens: TokenSet) -> Response {
    match serde_json::to_value(tokens) {
        Ok(v) => no_store(StatusCode::OK, v),
        Err(e) => server_error(e),
    }
}

async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(req): Form<TokenRequest>,
) -> Response {
    if req.grant_type != DEVICE_CODE_GRANT && req.grant_type != "refresh_token" {
        return token_error(TokenErrorCode::UnsupportedGrantType);
    }

    let (client_auth, _client) = match authenticate_client(
        &state,
        &headers,
        req.client_id.as_deref(),
        req.client_secret.as_deref(),
    )
    .await
    {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    if req.grant_type == DEVICE_CODE_GRANT {
        handle_device_code_grant(&state, &client_auth, req).await
    } else {
        handle_refresh_token_grant(&state, &client_auth, req).await
    }
}

async fn handle_device_code_grant(
    state: &AppState,
    client: &ClientAuthentication,
    req: TokenRequest,
) -> Response {
    let Some(device_code) = req.device_code.filter(|c| !c.is_empty()) else {
        return token_error(TokenErrorCode::InvalidRequest);
    };

    match state.endpoint.poll(&device_code, &client.client_id).await {
        Ok(PollOutcome::Tokens(tokens)) => token_set_response(tokens),
        Ok(PollOutcome::SlowDown { interval }) => no_store(
            StatusCode::BAD_REQUEST,
            json!({
                "error": TokenErrorCode::SlowDown.as_str(),
                "error_description": TokenErrorCode::SlowDown.description(),
                "interval": interval,
            }),
        ),
        Ok(outcome) => match outcome.error_code() {
            Some(code) => token_error(code),
            None => server_error("poll outcome without error code"),
        },
        Err(e) => server_error(e),
    }
}

async fn handle_refresh_token_grant(
    state: &AppState,
    client: &ClientAuthentication,
    req: TokenRequest,
) -> Response {
    let Some(refresh_token) = req.refresh_token.filter(|t| !t.is_empty()) else {
        return token_error(TokenErrorCode::InvalidRequest);
    };
    let requested = req.scope.as_deref().map(parse_scopes);

    match state
        .issuer
        .refresh(&refresh_token, &client.client_id, requested.as_deref())
        .await
    {
        Ok(RefreshOutcome::Issued(tokens)) => token_set_response(tokens),
        Ok(RefreshOutcome::InvalidGrant) => token_error(TokenErrorCode::InvalidGrant),
        Ok(RefreshOutcome::InvalidScope) => token_error(TokenErrorCode::InvalidScope),
        Err(e) => server_error(e),
    }
}

fn invalid_token() -> Response {
    json_with_headers(
        StatusCode::UNAUTHORIZED,
        json!({"error":"invalid_token"}),
        &[(
            "www-authenticate",
            "Bearer realm=\"userinfo\", error=\"invalid_token\"".to_string(),
        )],
    )
}

async fn userinfo(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
    else {
        return invalid_token();
    };

    let token_row = match storage::get_access_token(&state.db, token.trim()).await {
        Ok(Some(t)) => t,
        Ok(None) => return invalid_token(),
        Err(e) => return server_error(e),
    };

    let claims = match storage::get_user_by_subject(&state.db, &token_row.subject).await {
        Ok(Some(user)) => userinfo_claims(&user, &token_row.scope),
        Ok(None) => {
            let mut claims = serde_json::Map::new();
            claims.insert("sub".to_string(), Value::String(token_row.subject));
            claims
        }
        Err(e) => return server_error(e),
    };

    (StatusCode::OK, Json(Value::Object(claims))).into_response()
}
