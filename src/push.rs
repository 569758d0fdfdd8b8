//! Push delivery: an injectable dispatcher over a provider trait.
//!
//! The dispatcher is constructed once at startup and carried in
//! `AppState`. Construction never fails outward: missing or unreadable
//! FCM credentials produce a disabled dispatcher that logs once and
//! returns 0 from every call. Delivery failures are swallowed and
//! counted; tokens the provider reports as dead are deactivated in the
//! registry, never deleted inline.

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, warn};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;

use crate::calc::fmt_ts;

const CREDENTIALS_ENV: &str = "TUTORHUB_FCM_CREDENTIALS";
const STALE_TOKEN_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct DispatchError(pub String);

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The provider named the token as dead; deactivate it.
    Rejected,
}

pub trait PushProvider {
    /// One best-effort attempt for one token. `Err` means the provider
    /// was unreachable and says nothing about the token itself.
    fn send(&self, token: &str, message: &PushMessage) -> Result<Delivery, DispatchError>;
}

pub struct PushDispatcher {
    provider: Option<Box<dyn PushProvider>>,
}

impl PushDispatcher {
    /// Builds the dispatcher from `TUTORHUB_FCM_CREDENTIALS`. Any
    /// misconfiguration degrades to the disabled dispatcher, logged once
    /// here.
    pub fn from_env() -> Self {
        let path = match env::var(CREDENTIALS_ENV) {
            Ok(v) => v,
            Err(_) => {
                warn!("{} not set; push delivery disabled", CREDENTIALS_ENV);
                return Self::disabled();
            }
        };
        match FcmProvider::from_file(&path) {
            Ok(provider) => Self::with_provider(Box::new(provider)),
            Err(e) => {
                warn!("failed to load FCM credentials from {}: {}; push delivery disabled", path, e);
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        PushDispatcher { provider: None }
    }

    pub fn with_provider(provider: Box<dyn PushProvider>) -> Self {
        PushDispatcher {
            provider: Some(provider),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Attempts delivery to each token and returns the success count.
    /// Tokens the provider rejects are marked inactive in the registry.
    pub fn dispatch(&self, conn: &Connection, tokens: &[String], message: &PushMessage) -> usize {
        if tokens.is_empty() {
            return 0;
        }
        let Some(provider) = self.provider.as_ref() else {
            debug!("push disabled; dropping {} token(s)", tokens.len());
            return 0;
        };

        let mut delivered = 0usize;
        for token in tokens {
            match provider.send(token, message) {
                Ok(Delivery::Delivered) => delivered += 1,
                Ok(Delivery::Rejected) => {
                    warn!("provider rejected push token; deactivating");
                    deactivate_token(conn, token);
                }
                Err(e) => {
                    error!("push delivery failed: {}", e);
                }
            }
        }
        delivered
    }

    /// Delivery to every active token of one account.
    pub fn to_account(&self, conn: &Connection, account_id: &str, message: &PushMessage) -> usize {
        let tokens = active_tokens(conn, &[account_id.to_string()], None);
        self.dispatch(conn, &tokens, message)
    }

    /// Delivery across many accounts, optionally excluding one (the
    /// sender of a chat message never notifies themselves).
    pub fn to_accounts(
        &self,
        conn: &Connection,
        account_ids: &[String],
        exclude: Option<&str>,
        message: &PushMessage,
    ) -> usize {
        let tokens = active_tokens(conn, account_ids, exclude);
        self.dispatch(conn, &tokens, message)
    }
}

/// Distinct active tokens for the given accounts. A database error here
/// is a dispatch-path failure, so it logs and resolves to no tokens.
fn active_tokens(conn: &Connection, account_ids: &[String], exclude: Option<&str>) -> Vec<String> {
    if account_ids.is_empty() {
        return Vec::new();
    }
    let placeholders = vec!["?"; account_ids.len()].join(", ");
    let mut sql = format!(
        "SELECT DISTINCT token FROM push_tokens
         WHERE is_active = 1 AND account_id IN ({})",
        placeholders
    );
    let mut binds: Vec<String> = account_ids.to_vec();
    if let Some(excluded) = exclude {
        sql.push_str(" AND account_id <> ?");
        binds.push(excluded.to_string());
    }

    let result = conn
        .prepare(&sql)
        .and_then(|mut stmt| {
            stmt.query_map(params_from_iter(binds.iter()), |r| r.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        });
    match result {
        Ok(tokens) => tokens,
        Err(e) => {
            error!("failed to resolve push tokens: {}", e);
            Vec::new()
        }
    }
}

fn deactivate_token(conn: &Connection, token: &str) {
    let result = conn.execute(
        "UPDATE push_tokens SET is_active = 0, updated_at = ? WHERE token = ? AND is_active = 1",
        (fmt_ts(Utc::now()), token),
    );
    if let Err(e) = result {
        error!("failed to deactivate push token: {}", e);
    }
}

/// Purges tokens with no update for 30 days. Externally triggered; the
/// daemon runs no scheduler of its own.
pub fn cleanup_stale_tokens(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    let cutoff = fmt_ts(now - Duration::days(STALE_TOKEN_DAYS));
    conn.execute("DELETE FROM push_tokens WHERE updated_at < ?", [cutoff])
}

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    project_id: String,
    private_key: String,
    client_email: String,
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    scope: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug)]
struct CachedAccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// FCM HTTP v1 over a blocking client, authenticated with a
/// service-account JWT assertion exchanged for a cached OAuth token.
pub struct FcmProvider {
    service_account: ServiceAccountKey,
    client: reqwest::blocking::Client,
    access_token: RefCell<Option<CachedAccessToken>>,
}

impl FcmProvider {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let service_account: ServiceAccountKey = serde_json::from_str(&contents)?;
        Ok(FcmProvider {
            service_account,
            client: reqwest::blocking::Client::new(),
            access_token: RefCell::new(None),
        })
    }

    fn access_token(&self) -> Result<String, DispatchError> {
        {
            let cache = self.access_token.borrow();
            if let Some(cached) = cache.as_ref() {
                if cached.expires_at > Utc::now() + Duration::seconds(30) {
                    return Ok(cached.token.clone());
                }
            }
        }

        let now = Utc::now();
        let claims = AssertionClaims {
            iss: &self.service_account.client_email,
            sub: &self.service_account.client_email,
            aud: &self.service_account.token_uri,
            iat: now.timestamp(),
            exp: (now + Duration::minutes(55)).timestamp(),
            scope: "https://www.googleapis.com/auth/firebase.messaging",
        };

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(
            self.service_account.private_key.as_bytes(),
        )
        .map_err(|e| DispatchError(format!("invalid FCM private key: {}", e)))?;
        let assertion = jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| DispatchError(format!("failed to sign FCM assertion: {}", e)))?;

        let response = self
            .client
            .post(&self.service_account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .map_err(|e| DispatchError(format!("FCM token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DispatchError(format!(
                "FCM token request failed: {} {}",
                status, body
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .map_err(|e| DispatchError(format!("failed to parse FCM access token: {}", e)))?;

        let expires_at = Utc::now() + Duration::seconds(token_response.expires_in);
        *self.access_token.borrow_mut() = Some(CachedAccessToken {
            token: token_response.access_token.clone(),
            expires_at,
        });

        Ok(token_response.access_token)
    }
}

impl PushProvider for FcmProvider {
    fn send(&self, token: &str, message: &PushMessage) -> Result<Delivery, DispatchError> {
        let access_token = self.access_token()?;

        let payload = serde_json::json!({
            "message": {
                "token": token,
                "notification": {
                    "title": message.title,
                    "body": message.body,
                },
                "data": message.data,
            }
        });

        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.service_account.project_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .map_err(|e| DispatchError(format!("FCM send failed: {}", e)))?;

        if response.status().is_success() {
            return Ok(Delivery::Delivered);
        }

        let status = response.status();
        let body = response.text().unwrap_or_default();
        if body.contains("UNREGISTERED") || body.contains("NOT_FOUND") {
            return Ok(Delivery::Rejected);
        }
        Err(DispatchError(format!("FCM send failed: {} {}", status, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::collections::HashSet;
    use std::rc::Rc;

    struct ScriptedProvider {
        reject: HashSet<String>,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl PushProvider for ScriptedProvider {
        fn send(&self, token: &str, _message: &PushMessage) -> Result<Delivery, DispatchError> {
            self.calls.borrow_mut().push(token.to_string());
            if self.reject.contains(token) {
                Ok(Delivery::Rejected)
            } else {
                Ok(Delivery::Delivered)
            }
        }
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn insert_account(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO accounts(id, username, role, full_name, created_at)
             VALUES(?, ?, 'student', 'Test Student', ?)",
            (id, id, fmt_ts(Utc::now())),
        )
        .expect("insert account");
    }

    fn insert_token(conn: &Connection, account_id: &str, token: &str) {
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO push_tokens(id, account_id, token, is_active, created_at, updated_at)
             VALUES(?, ?, ?, 1, ?, ?)",
            (
                uuid::Uuid::new_v4().to_string(),
                account_id,
                token,
                &now,
                &now,
            ),
        )
        .expect("insert token");
    }

    fn message() -> PushMessage {
        PushMessage {
            title: "Test".to_string(),
            body: "body".to_string(),
            data: BTreeMap::new(),
        }
    }

    #[test]
    fn zero_tokens_skips_provider_entirely() {
        let conn = test_conn();
        insert_account(&conn, "acct-1");

        let calls = Rc::new(RefCell::new(Vec::new()));
        let dispatcher = PushDispatcher::with_provider(Box::new(ScriptedProvider {
            reject: HashSet::new(),
            calls: Rc::clone(&calls),
        }));

        assert_eq!(dispatcher.to_account(&conn, "acct-1", &message()), 0);
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn rejected_token_is_deactivated_and_excluded() {
        let conn = test_conn();
        insert_account(&conn, "acct-1");
        insert_token(&conn, "acct-1", "tok-good");
        insert_token(&conn, "acct-1", "tok-dead");

        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut reject = HashSet::new();
        reject.insert("tok-dead".to_string());
        let dispatcher = PushDispatcher::with_provider(Box::new(ScriptedProvider {
            reject,
            calls: Rc::clone(&calls),
        }));

        assert_eq!(dispatcher.to_account(&conn, "acct-1", &message()), 1);
        assert_eq!(calls.borrow().len(), 2);

        let active: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM push_tokens WHERE token = 'tok-dead' AND is_active = 1",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(active, 0);

        // A second dispatch no longer attempts the dead token.
        calls.borrow_mut().clear();
        assert_eq!(dispatcher.to_account(&conn, "acct-1", &message()), 1);
        assert_eq!(calls.borrow().as_slice(), ["tok-good".to_string()]);
    }

    #[test]
    fn exclusion_drops_the_sender() {
        let conn = test_conn();
        insert_account(&conn, "acct-1");
        insert_account(&conn, "acct-2");
        insert_token(&conn, "acct-1", "tok-1");
        insert_token(&conn, "acct-2", "tok-2");

        let calls = Rc::new(RefCell::new(Vec::new()));
        let dispatcher = PushDispatcher::with_provider(Box::new(ScriptedProvider {
            reject: HashSet::new(),
            calls: Rc::clone(&calls),
        }));

        let ids = vec!["acct-1".to_string(), "acct-2".to_string()];
        let delivered = dispatcher.to_accounts(&conn, &ids, Some("acct-1"), &message());
        assert_eq!(delivered, 1);
        assert_eq!(calls.borrow().as_slice(), ["tok-2".to_string()]);
    }

    #[test]
    fn disabled_dispatcher_counts_zero() {
        let conn = test_conn();
        insert_account(&conn, "acct-1");
        insert_token(&conn, "acct-1", "tok-1");

        let dispatcher = PushDispatcher::disabled();
        assert!(!dispatcher.is_enabled());
        assert_eq!(dispatcher.to_account(&conn, "acct-1", &message()), 0);
    }

    #[test]
    fn stale_tokens_are_purged_after_thirty_days() {
        let conn = test_conn();
        insert_account(&conn, "acct-1");
        insert_token(&conn, "acct-1", "tok-old");
        insert_token(&conn, "acct-1", "tok-fresh");

        let now = Utc::now();
        conn.execute(
            "UPDATE push_tokens SET updated_at = ? WHERE token = 'tok-old'",
            [fmt_ts(now - Duration::days(31))],
        )
        .expect("age token");

        let purged = cleanup_stale_tokens(&conn, now).expect("cleanup");
        assert_eq!(purged, 1);
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM push_tokens", [], |r| r.get(0))
            .expect("count");
        assert_eq!(remaining, 1);
    }
}
