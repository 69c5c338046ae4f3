use axum::{
    extract::State,
    http::{
        header::{InvalidHeaderValue, SET_COOKIE, USER_AGENT},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument};

use crate::{
    auth::{
        dto::{
            ChangePasswordRequest, CompleteRecoveryRequest, LoginRequest, PublicUser,
            RecoveryRequest, RecoveryResponse, RegisterRequest, SessionResponse,
        },
        extractors::{bearer_from_headers, CurrentUser, SessionUser, SESSION_COOKIE},
        repo_types::SessionRecord,
        service::AuthenticatedSession,
        tokens::BearerValue,
    },
    config::AppEnv,
    error::AuthError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/session", get(current_session))
        .route("/auth/rotate", post(rotate))
        .route("/auth/password", post(change_password))
        .route("/auth/recovery", post(start_recovery))
        .route("/auth/recovery/complete", post(complete_recovery))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    let user = state.auth.register(&payload.username, &payload.password).await?;
    info!(user_id = user.id, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(PublicUser {
            id: user.id,
            username: user.username,
            created_at: user.created_at,
        }),
    ))
}

#[instrument(skip(state, headers, payload))]
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let user_agent = headers.get(USER_AGENT).and_then(|h| h.to_str().ok());
    let outcome = state
        .auth
        .login(&payload.username, &payload.password, user_agent)
        .await?;
    Ok(session_reply(
        &state,
        &outcome.bearer,
        &outcome.session,
        outcome.must_change_password,
    ))
}

/// 204 for a missing, unknown or already-dead session. The session is revoked
/// only when the presented token proves it; store failures surface as 503.
#[instrument(skip(state, headers))]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthError> {
    if let Some(bearer) = bearer_from_headers(&headers) {
        match state.auth.require_valid_session(&bearer).await {
            Ok(session) => {
                state.auth.logout(session.session_id).await?;
                info!(user_id = session.user_id, "user logged out");
            }
            Err(AuthError::SessionInvalid) => {}
            Err(e) => return Err(e),
        }
    }

    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(state.config.env) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    Ok((StatusCode::NO_CONTENT, response_headers))
}

#[instrument(skip_all)]
pub async fn current_session(SessionUser(session): SessionUser) -> Json<AuthenticatedSession> {
    Json(session)
}

#[instrument(skip(state, headers))]
pub async fn rotate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthError> {
    let bearer = bearer_from_headers(&headers).ok_or(AuthError::SessionInvalid)?;
    let (rotated, record) = state.auth.rotate(&bearer).await?;
    Ok(session_reply(&state, &rotated, &record, false))
}

#[instrument(skip_all, fields(user_id = session.user_id))]
pub async fn change_password(
    State(state): State<AppState>,
    SessionUser(session): SessionUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<StatusCode, AuthError> {
    state
        .auth
        .change_password(&session, &payload.current_password, &payload.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, payload))]
pub async fn start_recovery(
    State(state): State<AppState>,
    Json(payload): Json<RecoveryRequest>,
) -> Result<(StatusCode, Json<RecoveryResponse>), AuthError> {
    let message = state.auth.initiate_recovery(&payload.identifier).await?;
    Ok((StatusCode::ACCEPTED, Json(RecoveryResponse { message })))
}

#[instrument(skip(state, payload))]
pub async fn complete_recovery(
    State(state): State<AppState>,
    Json(payload): Json<CompleteRecoveryRequest>,
) -> Result<StatusCode, AuthError> {
    state
        .auth
        .complete_recovery(&payload.token, &payload.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<PublicUser>, AuthError> {
    let user = state.auth.user(user_id).await?;
    Ok(Json(PublicUser {
        id: user.id,
        username: user.username,
        created_at: user.created_at,
    }))
}

fn session_reply(
    state: &AppState,
    bearer: &BearerValue,
    record: &SessionRecord,
    must_change_password: bool,
) -> impl IntoResponse {
    let token = bearer.encode();
    let mut response_headers = HeaderMap::new();
    let max_age = state.config.session_ttl().whole_seconds();
    if let Ok(cookie) = session_cookie(state.config.env, &token, max_age) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (
        response_headers,
        Json(SessionResponse {
            token,
            session_id: record.session_id,
            expires_at: record.expires_at,
            must_change_password,
        }),
    )
}

/// `HttpOnly` cookie carrying the bearer value; `Secure` in production.
fn session_cookie(env: AppEnv, token: &str, max_age: i64) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");
    if env == AppEnv::Production {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn clear_session_cookie(env: AppEnv) -> Result<HeaderValue, InvalidHeaderValue> {
    session_cookie(env, "", 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::build_app;
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, header::COOKIE, header::RETRY_AFTER, Request},
        Router,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::auth::{
        memory::MemoryStore, recovery::TracingNotifier, repo::SessionRepo, repo_types::UserId,
        service::Stores,
    };
    use crate::clock::SystemClock;
    use crate::config::AppConfig;
    use crate::error::StoreError;

    /// Session store whose revoke always fails, as when the database drops out.
    struct FailingRevoke(Arc<MemoryStore>);

    #[async_trait::async_trait]
    impl SessionRepo for FailingRevoke {
        async fn insert(&self, session: &SessionRecord) -> Result<(), StoreError> {
            SessionRepo::insert(&*self.0, session).await
        }
        async fn find(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
            SessionRepo::find(&*self.0, session_id).await
        }
        async fn touch(&self, session_id: Uuid, now: OffsetDateTime) -> Result<(), StoreError> {
            SessionRepo::touch(&*self.0, session_id, now).await
        }
        async fn revoke(&self, _session_id: Uuid, _now: OffsetDateTime) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
        async fn revoke_all_for_user(
            &self,
            user_id: UserId,
            except: Option<Uuid>,
            now: OffsetDateTime,
        ) -> Result<u64, StoreError> {
            SessionRepo::revoke_all_for_user(&*self.0, user_id, except, now).await
        }
        async fn rotate_token(
            &self,
            session_id: Uuid,
            old_hash: &[u8],
            new_hash: &[u8],
            now: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> Result<bool, StoreError> {
            SessionRepo::rotate_token(&*self.0, session_id, old_hash, new_hash, now, expires_at).await
        }
        async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
            SessionRepo::delete_expired_before(&*self.0, cutoff).await
        }
    }

    async fn app_with_user(username: &str, password: &str, gated: bool) -> Router {
        let state = AppState::for_tests();
        state
            .auth
            .provision_user(username, password, gated)
            .await
            .expect("provision user");
        build_app(state)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn with_bearer(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {token}"));
        match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(app: &Router, username: &str, password: &str) -> (StatusCode, Value) {
        let res = app
            .clone()
            .oneshot(post_json(
                "/auth/login",
                json!({ "username": username, "password": password }),
            ))
            .await
            .unwrap();
        let status = res.status();
        (status, json_body(res).await)
    }

    #[tokio::test]
    async fn login_then_me() {
        let app = app_with_user("ana", "s3cret!", false).await;
        let res = app
            .clone()
            .oneshot(post_json("/auth/login", json!({ "username": "ana", "password": "s3cret!" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let cookie = res.headers().get(SET_COOKIE).unwrap().to_str().unwrap().to_owned();
        assert!(cookie.starts_with(&format!("{SESSION_COOKIE}=")));
        assert!(cookie.contains("HttpOnly"));
        let body = json_body(res).await;
        assert_eq!(body["must_change_password"], false);
        let token = body["token"].as_str().unwrap();

        let res = app
            .oneshot(with_bearer("GET", "/me", token, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["username"], "ana");
    }

    #[tokio::test]
    async fn bad_credentials_are_401_with_generic_body() {
        let app = app_with_user("ana", "s3cret!", false).await;
        let (status_wrong, wrong) = login(&app, "ana", "nope").await;
        let (status_missing, missing) = login(&app, "ghost", "nope").await;
        assert_eq!(status_wrong, StatusCode::UNAUTHORIZED);
        assert_eq!(status_missing, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong, missing);
    }

    #[tokio::test]
    async fn sixth_login_is_429_with_retry_after() {
        let app = app_with_user("ana", "s3cret!", false).await;
        for _ in 0..5 {
            assert_eq!(login(&app, "ana", "bad").await.0, StatusCode::UNAUTHORIZED);
        }
        let res = app
            .oneshot(post_json("/auth/login", json!({ "username": "ana", "password": "s3cret!" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = res.headers()[RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!(retry > 0 && retry <= 15 * 60);
    }

    #[tokio::test]
    async fn protected_route_requires_session() {
        let app = app_with_user("ana", "s3cret!", false).await;
        let res = app
            .clone()
            .oneshot(Request::get("/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let (_, body) = login(&app, "ana", "s3cret!").await;
        let token = body["token"].as_str().unwrap();
        let res = app
            .oneshot(
                Request::get(format!("/me?token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn session_cookie_authenticates() {
        let app = app_with_user("ana", "s3cret!", false).await;
        let (_, body) = login(&app, "ana", "s3cret!").await;
        let token = body["token"].as_str().unwrap();
        let res = app
            .oneshot(
                Request::get("/me")
                    .header(COOKIE, format!("{SESSION_COOKIE}={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn gated_account_must_change_password_first() {
        let app = app_with_user("admin", "admin", true).await;
        let (status, body) = login(&app, "admin", "admin").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["must_change_password"], true);
        let token = body["token"].as_str().unwrap().to_owned();

        let res = app.clone().oneshot(with_bearer("GET", "/me", &token, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = app
            .clone()
            .oneshot(with_bearer("GET", "/auth/session", &token, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["must_change_password"], true);

        let res = app
            .clone()
            .oneshot(with_bearer(
                "POST",
                "/auth/password",
                &token,
                Some(json!({ "current_password": "admin", "new_password": "Str0nger!" })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = app.oneshot(with_bearer("GET", "/me", &token, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn logout_revokes_and_tolerates_missing_token() {
        let app = app_with_user("ana", "s3cret!", false).await;
        let (_, body) = login(&app, "ana", "s3cret!").await;
        let token = body["token"].as_str().unwrap().to_owned();

        let res = app
            .clone()
            .oneshot(with_bearer("POST", "/auth/logout", &token, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(res.headers()[SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));

        let res = app.clone().oneshot(with_bearer("GET", "/me", &token, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app
            .oneshot(Request::post("/auth/logout").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn logout_reports_store_failure() {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores {
            users: store.clone(),
            sessions: Arc::new(FailingRevoke(store.clone())),
            rate_limits: store.clone(),
            reset_tokens: store,
        };
        let state = AppState::from_parts(
            AppConfig::for_tests(),
            stores,
            Arc::new(SystemClock),
            Arc::new(TracingNotifier),
        )
        .unwrap();
        state.auth.provision_user("ana", "s3cret!", false).await.unwrap();
        let app = build_app(state);
        let (_, body) = login(&app, "ana", "s3cret!").await;
        let token = body["token"].as_str().unwrap().to_owned();

        let res = app
            .clone()
            .oneshot(with_bearer("POST", "/auth/logout", &token, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(res.headers().get(SET_COOKIE).is_none());

        // The token is still live, and the client was told so.
        let res = app.oneshot(with_bearer("GET", "/me", &token, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rotate_replaces_the_token() {
        let app = app_with_user("ana", "s3cret!", false).await;
        let (_, body) = login(&app, "ana", "s3cret!").await;
        let old = body["token"].as_str().unwrap().to_owned();

        let res = app
            .clone()
            .oneshot(with_bearer("POST", "/auth/rotate", &old, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let rotated = json_body(res).await;
        assert_eq!(rotated["session_id"], body["session_id"]);
        let new = rotated["token"].as_str().unwrap();
        assert_ne!(new, old);

        let res = app.clone().oneshot(with_bearer("GET", "/me", &old, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let res = app.oneshot(with_bearer("GET", "/me", new, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn gated_account_cannot_rotate() {
        let app = app_with_user("admin", "admin", true).await;
        let (_, body) = login(&app, "admin", "admin").await;
        let token = body["token"].as_str().unwrap().to_owned();

        let res = app
            .clone()
            .oneshot(with_bearer("POST", "/auth/rotate", &token, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        // The original token was not replaced.
        let res = app
            .oneshot(with_bearer("GET", "/auth/session", &token, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_once_then_closed() {
        let app = build_app(AppState::for_tests());
        let res = app
            .clone()
            .oneshot(post_json(
                "/auth/register",
                json!({ "username": "ana", "password": "s3cret!" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let body = json_body(res).await;
        assert_eq!(body["username"], "ana");
        assert!(body.get("password_hash").is_none());

        let res = app
            .clone()
            .oneshot(post_json(
                "/auth/register",
                json!({ "username": "bruno", "password": "outra" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        assert_eq!(login(&app, "ana", "s3cret!").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn recovery_is_accepted_with_neutral_message() {
        let app = app_with_user("ana", "s3cret!", false).await;
        let mut bodies = Vec::new();
        for identifier in ["ana", "ghost"] {
            let res = app
                .clone()
                .oneshot(post_json("/auth/recovery", json!({ "identifier": identifier })))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::ACCEPTED);
            bodies.push(to_bytes(res.into_body(), usize::MAX).await.unwrap());
        }
        assert_eq!(bodies[0], bodies[1]);

        let res = app
            .oneshot(post_json(
                "/auth/recovery/complete",
                json!({ "token": "made-up", "new_password": "x" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
