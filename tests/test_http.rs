mod helpers;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use base64ct::{Base64, Encoding};
use fulcrum::device::{DeviceAuthorizationRecord, ManualClock};
use fulcrum::jwks::JwksManager;
use fulcrum::settings::Settings;
use fulcrum::storage::Client;
use fulcrum::web::{self, AppState, DEVICE_CODE_GRANT};
use helpers::{ClientBuilder, TestDb, UserBuilder, T0};
use http_body_util::BodyExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const DEFAULT_PEER: &str = "192.0.2.10:40000";

struct TestApp {
    state: AppState,
    clock: Arc<ManualClock>,
    client: Client,
    _db: TestDb,
    _keys: TempDir,
}

struct TestResponse {
    status: StatusCode,
    headers: axum::http::HeaderMap,
    body: String,
}

impl TestResponse {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("response is not JSON")
    }
}

impl TestApp {
    async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    async fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        let db = TestDb::new().await;
        let keys = TempDir::new().expect("Failed to create temp dir");

        let mut settings = Settings::default();
        settings.server.public_base_url = Some("https://idp.example.com".to_string());
        settings.keys.jwks_path = keys.path().join("jwks.json");
        settings.keys.private_key_path = keys.path().join("private_key.json");
        configure(&mut settings);

        let jwks = JwksManager::new(settings.keys.clone())
            .await
            .expect("Failed to create signing key");
        let clock = Arc::new(ManualClock::new(T0));
        let state = AppState::new(settings, db.connection().clone(), jwks, clock.clone());
        let client = ClientBuilder::new()
            .with_name("Living Room TV")
            .create(db.connection())
            .await;

        Self {
            state,
            clock,
            client,
            _db: db,
            _keys: keys,
        }
    }

    fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.client.client_id, self.client.client_secret);
        format!("Basic {}", Base64::encode_string(raw.as_bytes()))
    }

    async fn send(&self, mut request: Request<Body>) -> TestResponse {
        if request.extensions().get::<ConnectInfo<SocketAddr>>().is_none() {
            let peer: SocketAddr = DEFAULT_PEER.parse().unwrap();
            request.extensions_mut().insert(ConnectInfo(peer));
        }
        let response = web::router(self.state.clone())
            .oneshot(request)
            .await
            .expect("request failed");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        TestResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    async fn post_form(&self, uri: &str, body: &str, auth: Option<&str>) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::USER_AGENT, "tv/1.0");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Form POST from a given TCP peer carrying a given X-Forwarded-For.
    async fn post_form_from(
        &self,
        uri: &str,
        body: &str,
        peer: &str,
        forwarded_for: &str,
    ) -> TestResponse {
        let peer: SocketAddr = peer.parse().unwrap();
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("x-forwarded-for", forwarded_for)
            .body(Body::from(body.to_string()))
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        self.send(request).await
    }

    async fn get(&self, uri: &str, auth: Option<&str>) -> TestResponse {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn device_authorization(&self) -> Value {
        let resp = self
            .post_form(
                "/device_authorization",
                "scope=openid%20profile",
                Some(&self.basic_auth()),
            )
            .await;
        assert_eq!(resp.status, StatusCode::OK, "{}", resp.body);
        resp.json()
    }

    async fn poll(&self, device_code: &str) -> TestResponse {
        let body = format!(
            "grant_type={}&device_code={}",
            urlencoding::encode(DEVICE_CODE_GRANT),
            urlencoding::encode(device_code)
        );
        self.post_form("/token", &body, Some(&self.basic_auth()))
            .await
    }

    async fn record(&self, device_code: &str) -> DeviceAuthorizationRecord {
        self.state
            .machine
            .store()
            .find_by_device_code(device_code)
            .await
            .expect("lookup failed")
            .expect("record exists")
    }

    async fn consent(
        &self,
        record: &DeviceAuthorizationRecord,
        username: &str,
        password: &str,
        action: &str,
    ) -> TestResponse {
        let body = format!(
            "record_id={}&user_code={}&username={}&password={}&action={}",
            record.id,
            urlencoding::encode(&record.user_code),
            urlencoding::encode(username),
            urlencoding::encode(password),
            action
        );
        self.post_form("/device_authorization/consent", &body, None)
            .await
    }
}

#[tokio::test]
async fn test_full_device_flow_over_http() {
    let app = TestApp::new().await;
    let alice = UserBuilder::new("alice")
        .with_email("alice@example.com")
        .create(&app.state.db)
        .await;

    let grant = app.device_authorization().await;
    let device_code = grant["device_code"].as_str().expect("device_code").to_string();
    let user_code = grant["user_code"].as_str().expect("user_code").to_string();
    assert_eq!(
        grant["verification_uri"],
        "https://idp.example.com/device_authorization.htm"
    );
    assert_eq!(
        grant["verification_uri_complete"],
        format!(
            "https://idp.example.com/device_authorization.htm?user_code={}",
            user_code
        )
    );
    assert_eq!(grant["expires_in"], 1800);
    assert_eq!(grant["interval"], 5);

    let pending = app.poll(&device_code).await;
    assert_eq!(pending.status, StatusCode::BAD_REQUEST);
    assert_eq!(pending.json()["error"], "authorization_pending");
    assert_eq!(
        pending.headers.get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );

    // verification page via the complete URI
    let page = app
        .get(
            &format!("/device_authorization.htm?user_code={}", user_code),
            None,
        )
        .await;
    assert_eq!(page.status, StatusCode::OK);
    assert!(page.body.contains("Living Room TV"));
    assert!(page.body.contains("192.0.2.10"));

    let record = app.record(&device_code).await;
    let wrong = app.consent(&record, "alice", "nope", "approve").await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert!(wrong.body.contains("errorMessage"));

    let approved = app.consent(&record, "alice", "password123", "approve").await;
    assert_eq!(approved.status, StatusCode::OK);
    assert!(approved.body.contains("Device Approved"));

    app.clock.advance(10);
    let tokens = app.poll(&device_code).await;
    assert_eq!(tokens.status, StatusCode::OK, "{}", tokens.body);
    let tokens = tokens.json();
    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["scope"], "openid profile");
    assert!(tokens["refresh_token"].is_string());

    let id_token = tokens["id_token"].as_str().expect("id_token");
    let claims = app
        .state
        .jwks
        .verify_jwt_rs256(id_token)
        .expect("id_token verifies");
    assert_eq!(claims.subject(), Some(alice.subject.as_str()));
    assert_eq!(claims.issuer(), Some("https://idp.example.com"));

    let access_token = tokens["access_token"].as_str().expect("access_token");
    let info = app
        .get("/userinfo", Some(&format!("Bearer {}", access_token)))
        .await;
    assert_eq!(info.status, StatusCode::OK);
    assert_eq!(info.json()["sub"], alice.subject);
    assert_eq!(info.json()["preferred_username"], "alice");

    // device_code is single use
    app.clock.advance(10);
    let replay = app.poll(&device_code).await;
    assert_eq!(replay.json()["error"], "expired_token");
}

#[tokio::test]
async fn test_refresh_token_rotation() {
    let app = TestApp::new().await;
    UserBuilder::new("bob").create(&app.state.db).await;

    let grant = app.device_authorization().await;
    let device_code = grant["device_code"].as_str().unwrap().to_string();
    let record = app.record(&device_code).await;
    app.consent(&record, "bob", "password123", "approve").await;
    let tokens = app.poll(&device_code).await.json();
    let refresh_token = tokens["refresh_token"].as_str().unwrap().to_string();

    let body = format!(
        "grant_type=refresh_token&refresh_token={}",
        urlencoding::encode(&refresh_token)
    );
    let rotated = app.post_form("/token", &body, Some(&app.basic_auth())).await;
    assert_eq!(rotated.status, StatusCode::OK, "{}", rotated.body);
    let rotated = rotated.json();
    assert_ne!(rotated["refresh_token"], tokens["refresh_token"]);
    assert_eq!(rotated["scope"], "openid profile");

    let replay = app.post_form("/token", &body, Some(&app.basic_auth())).await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);
    assert_eq!(replay.json()["error"], "invalid_grant");

    let widened = format!(
        "grant_type=refresh_token&refresh_token={}&scope=openid%20email",
        urlencoding::encode(rotated["refresh_token"].as_str().unwrap())
    );
    let widened = app
        .post_form("/token", &widened, Some(&app.basic_auth()))
        .await;
    assert_eq!(widened.json()["error"], "invalid_scope");
}

#[tokio::test]
async fn test_deny_over_http() {
    let app = TestApp::new().await;
    UserBuilder::new("carol").create(&app.state.db).await;

    let grant = app.device_authorization().await;
    let device_code = grant["device_code"].as_str().unwrap().to_string();
    let record = app.record(&device_code).await;

    let denied = app.consent(&record, "carol", "password123", "deny").await;
    assert_eq!(denied.status, StatusCode::OK);
    assert!(denied.body.contains("Device Access Denied"));

    let approve_after = app.consent(&record, "carol", "password123", "approve").await;
    assert_eq!(approve_after.status, StatusCode::CONFLICT);

    let resp = app.poll(&device_code).await;
    assert_eq!(resp.json()["error"], "access_denied");
}

#[tokio::test]
async fn test_slow_down_reports_new_interval() {
    let app = TestApp::new().await;
    let grant = app.device_authorization().await;
    let device_code = grant["device_code"].as_str().unwrap().to_string();

    app.poll(&device_code).await;
    app.clock.advance(1);
    let resp = app.poll(&device_code).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    let body = resp.json();
    assert_eq!(body["error"], "slow_down");
    assert_eq!(body["interval"], 10);
}

#[tokio::test]
async fn test_client_authentication_is_required() {
    let app = TestApp::new().await;

    let anonymous = app
        .post_form("/device_authorization", "scope=openid", None)
        .await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
    assert_eq!(anonymous.json()["error"], "invalid_client");
    assert!(anonymous.headers.contains_key(header::WWW_AUTHENTICATE));

    let body = format!(
        "client_id={}&client_secret=wrong&scope=openid",
        app.client.client_id
    );
    let wrong_secret = app.post_form("/device_authorization", &body, None).await;
    assert_eq!(wrong_secret.status, StatusCode::UNAUTHORIZED);

    // client_secret_post works as well
    let body = format!(
        "client_id={}&client_secret={}&scope=openid",
        app.client.client_id, app.client.client_secret
    );
    let post_auth = app.post_form("/device_authorization", &body, None).await;
    assert_eq!(post_auth.status, StatusCode::OK);
    let device_code = post_auth.json()["device_code"].as_str().unwrap().to_string();

    // another client's device_code is indistinguishable from an unknown one
    let other = ClientBuilder::new().create(&app.state.db).await;
    let other_auth = format!(
        "Basic {}",
        Base64::encode_string(format!("{}:{}", other.client_id, other.client_secret).as_bytes())
    );
    let body = format!(
        "grant_type={}&device_code={}",
        urlencoding::encode(DEVICE_CODE_GRANT),
        device_code
    );
    let foreign = app.post_form("/token", &body, Some(&other_auth)).await;
    assert_eq!(foreign.json()["error"], "expired_token");
}

#[tokio::test]
async fn test_device_authorization_requires_openid_scope() {
    let app = TestApp::new().await;
    let resp = app
        .post_form(
            "/device_authorization",
            "scope=profile",
            Some(&app.basic_auth()),
        )
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(resp.json()["error"], "invalid_scope");
}

#[tokio::test]
async fn test_token_endpoint_rejects_unknown_grant_and_missing_code() {
    let app = TestApp::new().await;

    let resp = app
        .post_form(
            "/token",
            "grant_type=authorization_code&code=x",
            Some(&app.basic_auth()),
        )
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(resp.json()["error"], "unsupported_grant_type");

    let body = format!("grant_type={}", urlencoding::encode(DEVICE_CODE_GRANT));
    let resp = app.post_form("/token", &body, Some(&app.basic_auth())).await;
    assert_eq!(resp.json()["error"], "invalid_request");
}

#[tokio::test]
async fn test_verification_form_errors() {
    let app = TestApp::new().await;

    let entry = app.get("/device_authorization.htm", None).await;
    assert_eq!(entry.status, StatusCode::OK);
    assert!(entry.body.contains("deviceAuthzForm"));
    assert_eq!(
        entry.headers.get("x-frame-options").unwrap(),
        "DENY"
    );

    let malformed = app
        .post_form(
            "/device_authorization.htm",
            "userCodePart1=ab&userCodePart2=",
            None,
        )
        .await;
    assert_eq!(malformed.status, StatusCode::BAD_REQUEST);
    assert!(malformed.body.contains("errorMessage"));

    for _ in 0..5 {
        let unknown = app
            .post_form(
                "/device_authorization.htm",
                "userCodePart1=BBBB&userCodePart2=BBBB",
                None,
            )
            .await;
        assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
        assert!(unknown.body.contains("invalid or has expired"));
    }

    let locked = app
        .post_form(
            "/device_authorization.htm",
            "userCodePart1=BBBB&userCodePart2=BBBB",
            None,
        )
        .await;
    assert_eq!(locked.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(locked.body.contains("Try again in 5 minutes"));
    assert_eq!(locked.headers.get(header::RETRY_AFTER).unwrap(), "300");
}

#[tokio::test]
async fn test_rotating_forwarded_for_does_not_reset_lockout() {
    let app = TestApp::new().await;
    let grant = app.device_authorization().await;
    let (part1, part2) = grant["user_code"]
        .as_str()
        .unwrap()
        .split_once('-')
        .expect("grouped code");
    let valid = format!("userCodePart1={}&userCodePart2={}", part1, part2);
    let wrong = "userCodePart1=BBBB&userCodePart2=BBBB";

    for i in 0..5 {
        let resp = app
            .post_form_from(
                "/device_authorization.htm",
                wrong,
                "198.51.100.7:50000",
                &format!("203.0.113.{}", i),
            )
            .await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    }

    // a fresh header and source port from the same host stay locked out
    let locked = app
        .post_form_from(
            "/device_authorization.htm",
            &valid,
            "198.51.100.7:50001",
            "203.0.113.200",
        )
        .await;
    assert_eq!(locked.status, StatusCode::TOO_MANY_REQUESTS);

    let other_host = app
        .post_form_from(
            "/device_authorization.htm",
            &valid,
            "198.51.100.8:50000",
            "203.0.113.0",
        )
        .await;
    assert_eq!(other_host.status, StatusCode::OK);
    assert!(other_host.body.contains("Authorize Device"));
}

#[tokio::test]
async fn test_lockout_behind_trusted_proxy_keys_on_appended_hop() {
    let app = TestApp::with_settings(|s| s.server.trusted_proxy_hops = 1).await;
    let wrong = "userCodePart1=BBBB&userCodePart2=BBBB";
    let proxy = "10.0.0.1:443";

    // the client controls everything left of the proxy's own entry
    for i in 0..5 {
        let resp = app
            .post_form_from(
                "/device_authorization.htm",
                wrong,
                proxy,
                &format!("203.0.113.{}, 198.51.100.4", i),
            )
            .await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    }
    let locked = app
        .post_form_from(
            "/device_authorization.htm",
            wrong,
            proxy,
            "203.0.113.99, 198.51.100.4",
        )
        .await;
    assert_eq!(locked.status, StatusCode::TOO_MANY_REQUESTS);

    // another client behind the same proxy has its own budget
    let other = app
        .post_form_from(
            "/device_authorization.htm",
            wrong,
            proxy,
            "198.51.100.5",
        )
        .await;
    assert_eq!(other.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_verification_form_accepts_split_code() {
    let app = TestApp::new().await;
    let grant = app.device_authorization().await;
    let user_code = grant["user_code"].as_str().unwrap();
    let (part1, part2) = user_code.split_once('-').expect("grouped code");

    let body = format!(
        "userCodePart1={}&userCodePart2={}",
        part1.to_lowercase(),
        part2
    );
    let resp = app.post_form("/device_authorization.htm", &body, None).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(resp.body.contains("Authorize Device"));
    assert!(resp.body.contains(user_code));
}

#[tokio::test]
async fn test_discovery_and_jwks() {
    let app = TestApp::new().await;

    let discovery = app.get("/.well-known/openid-configuration", None).await;
    assert_eq!(discovery.status, StatusCode::OK);
    let doc = discovery.json();
    assert_eq!(doc["issuer"], "https://idp.example.com");
    assert_eq!(
        doc["device_authorization_endpoint"],
        "https://idp.example.com/device_authorization"
    );
    assert!(doc["grant_types_supported"]
        .as_array()
        .unwrap()
        .iter()
        .any(|g| g == DEVICE_CODE_GRANT));

    let jwks = app.get("/.well-known/jwks.json", None).await.json();
    let keys = jwks["keys"].as_array().expect("keys");
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kty"], "RSA");
    assert!(keys[0].get("d").is_none());
}

#[tokio::test]
async fn test_userinfo_requires_valid_bearer() {
    let app = TestApp::new().await;
    let missing = app.get("/userinfo", None).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);

    let bogus = app.get("/userinfo", Some("Bearer not-a-token")).await;
    assert_eq!(bogus.status, StatusCode::UNAUTHORIZED);
    assert_eq!(bogus.json()["error"], "invalid_token");
}
