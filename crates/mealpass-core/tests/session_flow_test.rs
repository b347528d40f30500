//! End-to-end session behavior against a mock API server

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mealpass_core::clock::SystemClock;
use mealpass_core::crypto::{BlobCodec, ChaChaCipher};
use mealpass_core::models::UserPayload;
use mealpass_core::store::MemoryStore;
use mealpass_core::vault::{CredentialVault, PROFILE_KEY, TOKEN_KEY};
use mealpass_core::{
    ApiError, Config, Credential, InvalidationReason, Notice, RenewalPhase, SecureStore,
    SessionEvent, SessionStack, SignInError, StorageBackend, StoreError, UserProfile,
};
use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Memory store that counts token removals and profile reads
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    token_removals: AtomicUsize,
    profile_reads: AtomicUsize,
}

impl SecureStore for CountingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if key == PROFILE_KEY {
            self.profile_reads.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if key == TOKEN_KEY {
            self.token_removals.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.remove(key)
    }
}

fn config_for(base_url: &str) -> Config {
    Config {
        api_base_url: base_url.to_string(),
        storage: StorageBackend::Memory,
        teardown_cooldown_ms: 1_000,
        ..Config::default()
    }
}

fn build(config: &Config) -> (SessionStack, Arc<CountingStore>) {
    let store = Arc::new(CountingStore::default());
    let codec = BlobCodec::new(Arc::new(ChaChaCipher::from_key([9; 32])));
    let vault = CredentialVault::new(store.clone(), codec);
    let stack = SessionStack::assemble(config, vault, Arc::new(SystemClock)).expect("stack");
    (stack, store)
}

fn user_json() -> Value {
    json!({
        "id": 7,
        "name": "Ana",
        "email": "ana@example.com",
        "permissions": {"tickets.scan": true, "tickets.refund": 0},
        "restaurantId": 42
    })
}

fn profile() -> UserProfile {
    let payload: UserPayload = serde_json::from_value(user_json()).expect("user payload");
    UserProfile::try_from(payload).expect("single affiliation")
}

fn login_body(token: &str, expires_in: chrono::Duration) -> Value {
    json!({
        "success": true,
        "data": {
            "token": token,
            "tokenExpiry": (Utc::now() + expires_in).to_rfc3339(),
            "user": user_json()
        }
    })
}

async fn mount_login(server: &MockServer, expires_in: chrono::Duration) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_body("tok-abc", expires_in)))
        .mount(server)
        .await;
}

async fn signed_in(server: &MockServer, config: &Config) -> (SessionStack, Arc<CountingStore>) {
    mount_login(server, chrono::Duration::hours(1)).await;
    let (stack, store) = build(config);
    stack
        .controller
        .sign_in("ana@example.com", "secret")
        .await
        .expect("sign in");
    (stack, store)
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    wanted: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

// ===== Sign-in =====

#[tokio::test]
async fn test_sign_in_persists_session_and_arms_renewal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"email": "ana@example.com", "password": "secret"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(login_body("tok-abc", chrono::Duration::hours(1))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (stack, _) = build(&config_for(&server.uri()));
    let mut events = stack.controller.subscribe();

    let profile = stack
        .controller
        .sign_in("ana@example.com", "secret")
        .await
        .unwrap();

    assert_eq!(profile.name, "Ana");
    assert!(profile.can("tickets.scan"));
    assert!(!profile.can("tickets.refund"));
    assert!(stack.controller.is_authenticated());
    assert_eq!(stack.controller.current_token().as_deref(), Some("tok-abc"));
    assert_eq!(stack.controller.renewal_phase(), RenewalPhase::Armed);
    assert!(matches!(events.try_recv(), Ok(SessionEvent::SignedIn(_))));
}

#[tokio::test]
async fn test_rejected_credentials_do_not_tear_down() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (stack, store) = build(&config_for(&server.uri()));
    let mut notices = stack.controller.notices();

    let err = stack
        .controller
        .sign_in("ana@example.com", "wrong")
        .await
        .unwrap_err();

    assert!(matches!(err, SignInError::Rejected(_)));
    assert!(!stack.controller.context().is_tearing_down());
    assert_eq!(store.token_removals.load(Ordering::SeqCst), 0);
    assert!(drain(&mut notices).is_empty());
}

#[tokio::test]
async fn test_unsuccessful_envelope_surfaces_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "message": "Account locked"
        })))
        .mount(&server)
        .await;

    let (stack, _) = build(&config_for(&server.uri()));
    let err = stack
        .controller
        .sign_in("ana@example.com", "secret")
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Account locked");
    assert!(!stack.controller.is_authenticated());
}

// ===== Cold start =====

#[tokio::test]
async fn test_bootstrap_restores_valid_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .and(header("authorization", "Bearer stored-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"user": user_json()}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(&server.uri());
    let (stack, _) = build(&config);
    let stale_profile = UserProfile {
        name: "Ana (old)".to_string(),
        ..profile()
    };
    stack
        .controller
        .context()
        .vault()
        .store_session(
            &Credential::new("stored-token", Utc::now() + chrono::Duration::hours(2)),
            &stale_profile,
        )
        .unwrap();
    let mut events = stack.controller.subscribe();

    assert!(stack.controller.bootstrap().await);
    assert_eq!(
        stack.controller.current_user().map(|p| p.name),
        Some("Ana".to_string())
    );
    assert_eq!(stack.controller.renewal_phase(), RenewalPhase::Armed);

    let seen = drain(&mut events);
    assert!(matches!(seen.first(), Some(SessionEvent::ProfileUpdated(_))));
    assert!(matches!(seen.last(), Some(SessionEvent::Restored(_))));
}

#[tokio::test]
async fn test_bootstrap_fails_closed_when_revalidation_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (stack, _) = build(&config_for(&server.uri()));
    let credential = Credential::new("stored-token", Utc::now() + chrono::Duration::hours(2));
    let vault = stack.controller.context().vault();
    vault.store_session(&credential, &profile()).unwrap();
    let mut events = stack.controller.subscribe();

    assert!(!stack.controller.bootstrap().await);
    assert!(!stack.controller.is_authenticated());
    assert!(vault.get_token().is_none());
    assert!(vault.get_profile().is_none());
    assert_eq!(stack.controller.renewal_phase(), RenewalPhase::Idle);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Invalidated(InvalidationReason::RevalidationFailed)]
    );
}

#[tokio::test]
async fn test_bootstrap_with_rejected_token_invalidates_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (stack, store) = build(&config_for(&server.uri()));
    stack
        .controller
        .context()
        .vault()
        .store_session(
            &Credential::new("revoked", Utc::now() + chrono::Duration::hours(2)),
            &profile(),
        )
        .unwrap();
    let mut events = stack.controller.subscribe();

    assert!(!stack.controller.bootstrap().await);
    assert!(store.token_removals.load(Ordering::SeqCst) >= 1);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Invalidated(InvalidationReason::Unauthorized)]
    );
}

// ===== Outgoing stage =====

#[tokio::test]
async fn test_requests_carry_bearer_and_tenant_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("authorization", "Bearer tok-abc"))
        .and(header("x-restaurant-id", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"orders": []})))
        .expect(1)
        .mount(&server)
        .await;

    let (stack, _) = signed_in(&server, &config_for(&server.uri())).await;
    let body: Value = stack.pipeline.get_json("/orders").await.unwrap();
    assert_eq!(body, json!({"orders": []}));
}

#[tokio::test]
async fn test_tenant_header_does_not_read_stored_profile() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("x-restaurant-id", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"orders": []})))
        .expect(5)
        .mount(&server)
        .await;

    let (stack, store) = signed_in(&server, &config_for(&server.uri())).await;
    let before = store.profile_reads.load(Ordering::SeqCst);
    for _ in 0..5 {
        let _: Value = stack.pipeline.get_json("/orders").await.unwrap();
    }
    assert_eq!(store.profile_reads.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn test_explicit_authorization_is_not_overridden() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/partner/feed"))
        .and(header("authorization", "Bearer partner-key"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (stack, _) = signed_in(&server, &config_for(&server.uri())).await;
    let request = stack
        .pipeline
        .request(Method::GET, "/partner/feed")
        .header(AUTHORIZATION, "Bearer partner-key");
    stack.pipeline.send(request).await.unwrap();
}

// ===== Incoming stage =====

#[tokio::test]
async fn test_burst_of_unauthorized_tears_down_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(401))
        .expect(5)
        .mount(&server)
        .await;

    let config = config_for(&server.uri());
    let (stack, store) = signed_in(&server, &config).await;
    let mut events = stack.controller.subscribe();
    let mut notices = stack.controller.notices();

    let calls = (0..5).map(|_| stack.pipeline.get_json::<Value>("/orders"));
    let results = futures::future::join_all(calls).await;

    assert!(results
        .iter()
        .all(|r| matches!(r, Err(ApiError::Unauthorized))));
    assert_eq!(store.token_removals.load(Ordering::SeqCst), 1);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Invalidated(InvalidationReason::Unauthorized)]
    );
    assert_eq!(drain(&mut notices), vec![Notice::SessionExpired]);
    assert!(!stack.controller.is_authenticated());
    assert_eq!(stack.controller.renewal_phase(), RenewalPhase::Idle);

    // Guard holds during the cooldown, then releases
    assert!(stack.controller.context().is_tearing_down());
    tokio::time::sleep(config.teardown_cooldown() + Duration::from_millis(300)).await;
    assert!(!stack.controller.context().is_tearing_down());
}

#[tokio::test]
async fn test_validation_notice_uses_first_field_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tickets"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "errors": {
                "amount": ["must be filled", "must be positive"],
                "date": ["is invalid"]
            }
        })))
        .mount(&server)
        .await;

    let (stack, _) = signed_in(&server, &config_for(&server.uri())).await;
    let mut notices = stack.controller.notices();

    let result: Result<Value, ApiError> = stack
        .pipeline
        .post_json("/tickets", &json!({"amount": null}))
        .await;

    match result {
        Err(ApiError::Validation { message, .. }) => assert_eq!(message, "must be filled"),
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(
        drain(&mut notices),
        vec![Notice::Validation("must be filled".to_string())]
    );
    assert!(stack.controller.is_authenticated());
}

#[tokio::test]
async fn test_status_notices() {
    let server = MockServer::start().await;
    for (route, status) in [("/forbidden", 403), ("/missing", 404), ("/broken", 500), ("/busy", 503)] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
    }

    let (stack, _) = signed_in(&server, &config_for(&server.uri())).await;
    let mut notices = stack.controller.notices();

    for route in ["/forbidden", "/missing", "/broken", "/busy"] {
        assert!(stack.pipeline.get_json::<Value>(route).await.is_err());
    }

    assert_eq!(
        drain(&mut notices),
        vec![Notice::Forbidden, Notice::NotFound, Notice::ServerError]
    );
    assert!(stack.controller.is_authenticated());
}

#[tokio::test]
async fn test_timeout_raises_notice() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let config = Config {
        request_timeout_secs: 1,
        ..config_for(&server.uri())
    };
    let (stack, _) = signed_in(&server, &config).await;
    let mut notices = stack.controller.notices();

    let result = stack.pipeline.get_json::<Value>("/slow").await;
    assert!(matches!(result, Err(ApiError::Timeout)));
    assert_eq!(drain(&mut notices), vec![Notice::Timeout]);
}

#[tokio::test]
async fn test_unreachable_server_raises_offline_notice() {
    // Nothing listens on the discard port
    let (stack, _) = build(&config_for("http://127.0.0.1:9"));
    let mut notices = stack.controller.notices();

    let result = stack.pipeline.get_json::<Value>("/orders").await;
    assert!(matches!(result, Err(ApiError::Offline(_))));
    assert_eq!(drain(&mut notices), vec![Notice::Offline]);
}

#[tokio::test]
async fn test_binary_client_only_reacts_to_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/photos/missing.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/photos/face.jpg"))
        .and(header("authorization", "Bearer tok-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF]))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/photos/private.jpg"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (stack, _) = signed_in(&server, &config_for(&server.uri())).await;
    let mut notices = stack.controller.notices();
    let mut events = stack.controller.subscribe();

    let bytes = stack.images.get_bytes("/photos/face.jpg").await.unwrap();
    assert_eq!(bytes, vec![0xFF, 0xD8, 0xFF]);

    assert!(stack.images.get_bytes("/photos/missing.jpg").await.is_err());
    assert!(drain(&mut notices).is_empty());

    assert!(stack.images.get_bytes("/photos/private.jpg").await.is_err());
    assert_eq!(drain(&mut notices), vec![Notice::SessionExpired]);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Invalidated(InvalidationReason::Unauthorized)]
    );
}

// ===== Renewal =====

#[tokio::test]
async fn test_token_inside_lead_window_is_renewed() {
    let server = MockServer::start().await;
    mount_login(&server, chrono::Duration::seconds(60)).await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(header("authorization", "Bearer tok-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "token": "tok-renewed",
                "tokenExpiry": (Utc::now() + chrono::Duration::hours(2)).timestamp()
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (stack, _) = build(&config_for(&server.uri()));
    let mut events = stack.controller.subscribe();
    stack
        .controller
        .sign_in("ana@example.com", "secret")
        .await
        .unwrap();

    wait_for_event(&mut events, |e| matches!(e, SessionEvent::Renewed { .. })).await;

    assert_eq!(stack.controller.current_token().as_deref(), Some("tok-renewed"));
    assert_eq!(
        stack.controller.context().default_auth().as_deref(),
        Some("Bearer tok-renewed")
    );
    assert_eq!(stack.controller.renewal_phase(), RenewalPhase::Armed);
}

#[tokio::test]
async fn test_rejected_renewal_invalidates_once() {
    let server = MockServer::start().await;
    mount_login(&server, chrono::Duration::seconds(60)).await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (stack, _) = build(&config_for(&server.uri()));
    let mut events = stack.controller.subscribe();
    stack
        .controller
        .sign_in("ana@example.com", "secret")
        .await
        .unwrap();

    wait_for_event(&mut events, |e| matches!(e, SessionEvent::Invalidated(_))).await;
    // Give the stale renewal result time to be discarded
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(drain(&mut events).is_empty());
    assert!(!stack.controller.is_authenticated());
    assert_eq!(stack.controller.renewal_phase(), RenewalPhase::Idle);
}

// ===== Sign-out =====

#[tokio::test]
async fn test_sign_out_twice_is_harmless() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .and(header("authorization", "Bearer tok-abc"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let (stack, store) = signed_in(&server, &config_for(&server.uri())).await;
    let mut events = stack.controller.subscribe();

    stack.controller.try_sign_out().await.unwrap();
    stack.controller.try_sign_out().await.unwrap();

    assert!(!stack.controller.is_authenticated());
    assert!(stack.controller.context().default_auth().is_none());
    // A rejected logout call does not go through the 401 teardown path
    assert!(!stack.controller.context().is_tearing_down());
    assert_eq!(store.token_removals.load(Ordering::SeqCst), 2);
    assert_eq!(drain(&mut events), vec![SessionEvent::SignedOut]);
}
