use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
        HeaderMap,
    },
};

use crate::auth::repo_types::UserId;
use crate::auth::service::AuthenticatedSession;
use crate::auth::tokens::BearerValue;
use crate::error::AuthError;
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "ledgerkeep_session";

/// Bearer value from the Authorization header, falling back to the session
/// cookie. Query strings are never consulted.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<BearerValue> {
    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))?;
        return BearerValue::parse(token.trim());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| BearerValue::parse(value))
}

/// Any valid session, including one whose account must change its password.
pub struct SessionUser(pub AuthenticatedSession);

#[async_trait]
impl FromRequestParts<AppState> for SessionUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let bearer = bearer_from_headers(&parts.headers).ok_or(AuthError::SessionInvalid)?;
        let session = state.auth.require_valid_session(&bearer).await?;
        Ok(SessionUser(session))
    }
}

/// The user id every protected read or write is scoped to. Gated accounts
/// are rejected.
pub struct CurrentUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let bearer = bearer_from_headers(&parts.headers);
        let user_id = state.auth.resolve_current_user(bearer.as_ref()).await?;
        Ok(CurrentUser(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::RawToken;
    use axum::http::HeaderValue;
    use uuid::Uuid;

    fn encoded() -> String {
        BearerValue {
            session_id: Uuid::new_v4(),
            token: RawToken::generate().unwrap(),
        }
        .encode()
    }

    #[test]
    fn reads_authorization_header() {
        let value = encoded();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {value}")).unwrap());
        assert_eq!(bearer_from_headers(&headers).unwrap().encode(), value);
    }

    #[test]
    fn falls_back_to_session_cookie() {
        let value = encoded();
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE}={value}")).unwrap(),
        );
        assert_eq!(bearer_from_headers(&headers).unwrap().encode(), value);
    }

    #[test]
    fn other_schemes_and_garbage_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic YWRtaW46YWRtaW4="));
        assert!(bearer_from_headers(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer not-a-session"));
        assert!(bearer_from_headers(&headers).is_none());

        assert!(bearer_from_headers(&HeaderMap::new()).is_none());
    }
}
