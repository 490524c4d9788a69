use std::{str::FromStr, sync::Arc, time::Duration};

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::{
    config::Config,
    error::{AuthFailureKind, ServiceError, ServiceResult},
    protocol::{Intent, Medium},
    store::{Store, keys},
    util,
};

type HmacSha256 = Hmac<Sha256>;

/// Field names of the `session:<id>` hash.
pub mod fields {
    pub const CREATED_AT: &str = "createdAt";
    pub const LAST_SEEN: &str = "lastSeen";
    pub const SOCKET_ID: &str = "socketId";
    pub const SELECTED_MODE: &str = "selectedMode";
    pub const CONNECTION_TYPE: &str = "connectionType";
    pub const MATCH_ID: &str = "matchId";
    pub const PEER_ID: &str = "peerId";
    pub const IN_QUEUE: &str = "inQueue";
    pub const REPORT_COUNT: &str = "reportCount";
}

/// Decoded view of a `session:<id>` hash.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub created_at: u64,
    pub last_seen: u64,
    pub socket_id: Option<String>,
    pub selected_mode: Option<Intent>,
    pub connection_type: Option<Medium>,
    pub match_id: Option<String>,
    pub peer_id: Option<String>,
    pub in_queue: bool,
    pub report_count: u64,
}

impl SessionRecord {
    fn from_map(map: &std::collections::HashMap<String, String>) -> Option<Self> {
        if map.is_empty() {
            return None;
        }

        let number = |field: &str| map.get(field).and_then(|it| it.parse::<u64>().ok());

        Some(Self {
            created_at: number(fields::CREATED_AT).unwrap_or(0),
            last_seen: number(fields::LAST_SEEN).unwrap_or(0),
            socket_id: map.get(fields::SOCKET_ID).cloned(),
            selected_mode: map
                .get(fields::SELECTED_MODE)
                .and_then(|it| Intent::from_str(it).ok()),
            connection_type: map
                .get(fields::CONNECTION_TYPE)
                .and_then(|it| Medium::from_str(it).ok()),
            match_id: map.get(fields::MATCH_ID).cloned(),
            peer_id: map.get(fields::PEER_ID).cloned(),
            in_queue: map.get(fields::IN_QUEUE).map(|it| it == "1").unwrap_or(false),
            report_count: number(fields::REPORT_COUNT).unwrap_or(0),
        })
    }
}

/// A freshly issued anonymous identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedSession {
    pub session_id: String,
    pub token: String,
    pub expires_in: u64,
}

/// Issues and verifies short-lived anonymous identities.
///
/// Tokens are opaque bearer strings: `base64url(<id>.<expiry>.<hmac>)`,
/// signed with the process-wide shared secret. Verification is pure; a
/// store read then confirms the session record still exists.
#[derive(Clone)]
pub struct SessionAuthority {
    store: Arc<dyn Store>,
    secret: Arc<String>,
    session_ttl: Duration,
    token_ttl: u64,
}

impl SessionAuthority {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        let secret = if config.auth.secret.is_empty() {
            log::warn!("no shared secret configured, generated one for this boot only");
            util::rand_hex(32)
        } else {
            config.auth.secret.clone()
        };

        Self {
            store,
            secret: Arc::new(secret),
            session_ttl: Duration::from_secs(config.auth.session_ttl_secs),
            token_ttl: config.auth.token_ttl(),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Create a session record and return its bearer token.
    pub async fn issue(&self) -> ServiceResult<IssuedSession> {
        let session_id = util::rand_hex(16);
        let expires_at = util::now_secs() + self.token_ttl;
        let now = util::now_ms().to_string();

        self.store
            .hset(
                &keys::session(&session_id),
                &[
                    (fields::CREATED_AT, now.as_str()),
                    (fields::LAST_SEEN, now.as_str()),
                    (fields::IN_QUEUE, "0"),
                    (fields::REPORT_COUNT, "0"),
                ],
                Some(self.session_ttl),
            )
            .await?;

        Ok(IssuedSession {
            token: self.sign(&session_id, expires_at),
            session_id,
            expires_in: self.token_ttl,
        })
    }

    fn sign(&self, session_id: &str, expires_at: u64) -> String {
        let body = format!("{session_id}.{expires_at}");
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(body.as_bytes());

        let tag = hex::encode(mac.finalize().into_bytes());
        BASE64_URL_SAFE_NO_PAD.encode(format!("{body}.{tag}"))
    }

    /// Pure token verification, no store access. Returns the session id.
    pub fn verify(&self, token: &str) -> ServiceResult<String> {
        let decoded = BASE64_URL_SAFE_NO_PAD
            .decode(token)
            .ok()
            .and_then(|it| String::from_utf8(it).ok())
            .ok_or(ServiceError::AuthFailure(AuthFailureKind::MalformedToken))?;

        let mut parts = decoded.split('.');
        let (session_id, expires_at, tag) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(exp), Some(tag)) if parts.next().is_none() => (id, exp, tag),
            _ => return Err(ServiceError::AuthFailure(AuthFailureKind::MalformedToken)),
        };

        let expires_at: u64 = expires_at
            .parse()
            .map_err(|_| ServiceError::AuthFailure(AuthFailureKind::MalformedToken))?;

        let tag = hex::decode(tag)
            .map_err(|_| ServiceError::AuthFailure(AuthFailureKind::MalformedToken))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(format!("{session_id}.{expires_at}").as_bytes());
        mac.verify_slice(&tag)
            .map_err(|_| ServiceError::AuthFailure(AuthFailureKind::InvalidToken))?;

        if expires_at <= util::now_secs() {
            return Err(ServiceError::AuthFailure(AuthFailureKind::ExpiredToken));
        }

        Ok(session_id.to_string())
    }

    /// Verify the token and confirm the session record still exists.
    pub async fn authenticate(&self, token: &str) -> ServiceResult<String> {
        let session_id = self.verify(token)?;
        match self.load(&session_id).await? {
            Some(_) => Ok(session_id),
            None => Err(ServiceError::AuthFailure(AuthFailureKind::UnknownSession)),
        }
    }

    pub async fn load(&self, session_id: &str) -> ServiceResult<Option<SessionRecord>> {
        let map = self.store.hgetall(&keys::session(session_id)).await?;
        Ok(SessionRecord::from_map(&map))
    }

    /// Update last-seen and extend the session ttl.
    pub async fn touch(&self, session_id: &str) -> ServiceResult<()> {
        let now = util::now_ms().to_string();
        self.store
            .hset(
                &keys::session(session_id),
                &[(fields::LAST_SEEN, now.as_str())],
                Some(self.session_ttl),
            )
            .await?;

        Ok(())
    }

    /// Atomic report-count increment, returns the new value.
    pub async fn bump_report_count(&self, session_id: &str) -> ServiceResult<u64> {
        let count = self
            .store
            .hincr_by(&keys::session(session_id), fields::REPORT_COUNT, 1)
            .await?;

        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn authority() -> SessionAuthority {
        let mut config = Config::default();
        config.auth.secret = "test-secret".to_string();
        SessionAuthority::new(Arc::new(MemoryStore::new()), &config)
    }

    #[tokio::test]
    async fn token_round_trip() {
        let authority = authority();
        let issued = authority.issue().await.unwrap();

        assert_eq!(issued.session_id.len(), 32);
        assert_eq!(authority.verify(&issued.token).unwrap(), issued.session_id);
        assert_eq!(
            authority.authenticate(&issued.token).await.unwrap(),
            issued.session_id
        );
    }

    #[tokio::test]
    async fn tampered_token_rejected() {
        let authority = authority();
        let issued = authority.issue().await.unwrap();

        let mut forged = BASE64_URL_SAFE_NO_PAD
            .decode(&issued.token)
            .map(|it| String::from_utf8(it).unwrap())
            .unwrap();
        forged = forged.replacen('.', "9.", 1);
        let forged = BASE64_URL_SAFE_NO_PAD.encode(forged);

        assert!(matches!(
            authority.verify(&forged),
            Err(ServiceError::AuthFailure(_))
        ));

        assert!(matches!(
            authority.verify("not-a-token"),
            Err(ServiceError::AuthFailure(AuthFailureKind::MalformedToken))
        ));
    }

    #[tokio::test]
    async fn unknown_session_rejected() {
        let authority = authority();

        // A valid signature over a session that was never issued (or has
        // expired out of the store) must not authenticate.
        let token = authority.sign("deadbeef", util::now_secs() + 60);
        assert_eq!(authority.verify(&token).unwrap(), "deadbeef");
        assert!(matches!(
            authority.authenticate(&token).await,
            Err(ServiceError::AuthFailure(AuthFailureKind::UnknownSession))
        ));
    }

    #[tokio::test]
    async fn expired_token_rejected() {
        let authority = authority();
        let token = authority.sign("deadbeef", util::now_secs().saturating_sub(1));

        assert!(matches!(
            authority.verify(&token),
            Err(ServiceError::AuthFailure(AuthFailureKind::ExpiredToken))
        ));
    }

    #[tokio::test]
    async fn report_count_increments() {
        let authority = authority();
        let issued = authority.issue().await.unwrap();

        assert_eq!(authority.bump_report_count(&issued.session_id).await.unwrap(), 1);
        assert_eq!(authority.bump_report_count(&issued.session_id).await.unwrap(), 2);

        let record = authority.load(&issued.session_id).await.unwrap().unwrap();
        assert_eq!(record.report_count, 2);
    }
}
