use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use sos_protocol::mint_token;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AuthSettings;
use crate::error::{Error, Result};
use crate::store::SessionStore;

/// SHA-256 hex digest of a login token. Only digests are stored.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn session_key(digest: &str) -> String {
    format!("volunteer_session:{digest}")
}

fn login_key(volunteer_id: Uuid) -> String {
    format!("volunteer_login:{volunteer_id}")
}

/// Volunteer login tokens, one live token per volunteer.
#[derive(Clone)]
pub struct LoginSessions {
    sessions: Arc<dyn SessionStore>,
    settings: AuthSettings,
}

impl LoginSessions {
    pub fn new(sessions: Arc<dyn SessionStore>, settings: AuthSettings) -> Self {
        Self { sessions, settings }
    }

    pub fn ttl(&self) -> std::time::Duration {
        self.settings.volunteer_session_ttl()
    }

    /// Issue a fresh token for `volunteer_id`, revoking the previous one.
    pub async fn issue(&self, volunteer_id: Uuid) -> Result<String> {
        let token = mint_token();
        let digest = hash_token(&token);
        let ttl = self.settings.volunteer_session_ttl();

        if let Some(previous) = self.sessions.get(&login_key(volunteer_id)).await? {
            self.sessions.delete(&session_key(&previous)).await?;
            debug!(volunteer_id = %volunteer_id, "revoked previous login token");
        }

        self.sessions
            .set(&session_key(&digest), volunteer_id.to_string(), ttl)
            .await?;
        self.sessions
            .set(&login_key(volunteer_id), digest, ttl)
            .await?;

        info!(volunteer_id = %volunteer_id, ttl_seconds = ttl.as_secs(), "login token issued");
        Ok(token)
    }

    /// The volunteer a live token belongs to.
    pub async fn resolve(&self, token: &str) -> Result<Option<Uuid>> {
        let Some(raw) = self.sessions.get(&session_key(&hash_token(token))).await? else {
            return Ok(None);
        };
        Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| Error::Internal(format!("corrupt login session: {e}")))
    }
}

/// Authentication context extracted from request
#[derive(Debug, Clone, PartialEq)]
pub enum AuthContext {
    Volunteer(Uuid),
    None,
}

impl AuthContext {
    pub fn require_volunteer(&self) -> Result<Uuid> {
        match self {
            AuthContext::Volunteer(id) => Ok(*id),
            AuthContext::None => Err(Error::Unauthorized(
                "Invalid or expired session token.".to_string(),
            )),
        }
    }
}

/// Bearer token authentication middleware
pub async fn auth_middleware(
    State(logins): State<LoginSessions>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::to_string);

    let context = match token {
        Some(t) => match logins.resolve(&t).await {
            Ok(Some(volunteer_id)) => {
                debug!(volunteer_id = %volunteer_id, "token authenticated");
                AuthContext::Volunteer(volunteer_id)
            }
            Ok(None) => {
                warn!("invalid or expired token provided");
                AuthContext::None
            }
            Err(e) => {
                error!(error = %e, "login session lookup failed");
                return Err(e.to_status_code());
            }
        },
        None => {
            debug!("no token provided");
            AuthContext::None
        }
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
