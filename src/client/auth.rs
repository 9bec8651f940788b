//! Login, signup, and OAuth credential flows.
//!
//! All variants funnel through the method manager as ordinary `login` /
//! `createUser` / `logout` calls; this module owns the auth state machine,
//! the parameter shapes, and the OAuth page scrape.

use std::time::Duration;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::error::ClientError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    NoAuth,
    LoggingIn,
    LoggedIn,
    LoggedOut,
}

/// Stored credentials after a successful logon.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthSession {
    pub user_id: String,
    pub token: String,
}

pub type LogonCallback = Box<dyn FnOnce(Result<AuthSession, ClientError>) + Send>;

/// Identify the account by username or email.
#[derive(Clone, Debug)]
pub enum UserLocator {
    Username(String),
    Email(String),
}

#[derive(Default)]
pub struct AuthManager {
    state: AuthState,
    session: Option<AuthSession>,
    pending: Option<PendingLogon>,
}

struct PendingLogon {
    method_id: Option<String>,
    callback: Option<LogonCallback>,
}

impl AuthManager {
    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn token(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.token.as_str())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user_id.as_str())
    }

    /// Start a logon or signup attempt. A second in-flight attempt is
    /// rejected, handing the callback back so the caller can fail it.
    pub fn begin(
        &mut self,
        callback: Option<LogonCallback>,
    ) -> Result<(), (ClientError, Option<LogonCallback>)> {
        if self.pending.is_some() || self.state == AuthState::LoggingIn {
            return Err((
                ClientError::logon_rejected("logon already in flight"),
                callback,
            ));
        }
        self.state = AuthState::LoggingIn;
        self.pending = Some(PendingLogon {
            method_id: None,
            callback,
        });
        Ok(())
    }

    /// Bind the in-flight attempt to the wire method id once it is sent.
    pub fn attach_method(&mut self, method_id: impl Into<String>) {
        if let Some(pending) = self.pending.as_mut() {
            pending.method_id = Some(method_id.into());
        }
    }

    pub fn owns_method(&self, method_id: &str) -> bool {
        self.pending
            .as_ref()
            .and_then(|p| p.method_id.as_deref())
            .is_some_and(|id| id == method_id)
    }

    /// Successful `result` for the in-flight logon: store credentials and
    /// hand back the caller's callback.
    pub fn complete_success(&mut self, result: &Value) -> Option<(AuthSession, LogonCallback)> {
        let pending = self.pending.take()?;
        let session = AuthSession {
            user_id: result
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            token: result
                .get("token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        self.session = Some(session.clone());
        self.state = AuthState::LoggedIn;
        pending.callback.map(|callback| (session, callback))
    }

    /// Failed `result` (or transport loss) for the in-flight logon.
    pub fn complete_failure(&mut self) -> Option<LogonCallback> {
        let pending = self.pending.take()?;
        self.state = AuthState::LoggedOut;
        pending.callback
    }

    /// Local, fire-and-forget logout.
    pub fn logout(&mut self) {
        self.session = None;
        self.state = AuthState::LoggedOut;
    }
}

/// Lowercase-hex SHA-256 over the UTF-8 cleartext.
pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn password_value(password: &str) -> Value {
    json!({
        "digest": password_digest(password),
        "algorithm": "sha-256",
    })
}

pub fn password_params(user: &UserLocator, password: &str) -> Value {
    let user = match user {
        UserLocator::Username(name) => json!({ "username": name }),
        UserLocator::Email(email) => json!({ "email": email }),
    };
    json!({ "user": user, "password": password_value(password) })
}

pub fn resume_params(token: &str) -> Value {
    json!({ "resume": token })
}

pub fn signup_params(
    username: &str,
    email: &str,
    password: &str,
    profile: Map<String, Value>,
) -> Value {
    json!({
        "username": username,
        "email": email,
        "password": password_value(password),
        "profile": profile,
    })
}

// ---------------------------------------------------------------------------
// OAuth

/// Credential pair scraped from the OAuth completion page.
#[derive(Clone, Debug, PartialEq)]
pub struct OauthCredential {
    pub credential_token: String,
    pub credential_secret: String,
}

/// `ws[s]://host/websocket` → `http[s]://host` for the OAuth page fetch.
pub fn http_base_from_ws_url(ws_url: &str) -> Result<String, ClientError> {
    let (scheme, rest) = if let Some(rest) = ws_url.strip_prefix("wss://") {
        ("https://", rest)
    } else if let Some(rest) = ws_url.strip_prefix("ws://") {
        ("http://", rest)
    } else {
        return Err(ClientError::logon_rejected(format!(
            "not a websocket url: {ws_url}"
        )));
    };
    let rest = rest.strip_suffix("/websocket").unwrap_or(rest);
    Ok(format!("{scheme}{rest}"))
}

/// Token query parameter name: Facebook hands tokens over directly, every
/// other service goes through an authorization code.
pub fn token_type_for(service: &str) -> &'static str {
    if service == "facebook" { "accessToken" } else { "code" }
}

pub fn oauth_url(http_base: &str, service: &str, token: &str, credential_token: &str) -> String {
    use base64::Engine;
    let state = base64::engine::general_purpose::STANDARD.encode(
        json!({
            "credentialToken": credential_token,
            "loginStyle": "popup",
        })
        .to_string(),
    );
    let token_type = token_type_for(service);
    format!("{http_base}/_oauth/{service}/?{token_type}={token}&state={state}")
}

const CONFIG_DIV: &str = r#"<div id="config" style="display:none;">"#;

/// Pull the JSON blob out of the completion page's hidden config div.
pub fn extract_oauth_config(html: &str) -> Result<Value, ClientError> {
    let start = html
        .find(CONFIG_DIV)
        .ok_or_else(|| ClientError::logon_rejected("oauth page has no config element"))?
        + CONFIG_DIV.len();
    let end = html[start..]
        .find("</div>")
        .ok_or_else(|| ClientError::logon_rejected("oauth config element is unterminated"))?
        + start;
    serde_json::from_str(html[start..end].trim())
        .map_err(|err| ClientError::logon_rejected(format!("oauth config is not json: {err}")))
}

/// Validate the scraped config and extract the credential pair.
pub fn credential_from_config(
    config: &Value,
    expected_token: &str,
) -> Result<OauthCredential, ClientError> {
    if config.get("setCredentialToken").and_then(Value::as_bool) != Some(true) {
        return Err(ClientError::logon_rejected(
            "oauth flow did not set a credential token",
        ));
    }
    let credential_token = config
        .get("credentialToken")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::logon_rejected("oauth config lacks credentialToken"))?;
    if credential_token != expected_token {
        return Err(ClientError::logon_rejected("oauth credential token mismatch"));
    }
    let credential_secret = config
        .get("credentialSecret")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::logon_rejected("oauth config lacks credentialSecret"))?;
    Ok(OauthCredential {
        credential_token: credential_token.to_string(),
        credential_secret: credential_secret.to_string(),
    })
}

/// Blocking fetch + scrape of the OAuth completion page. Runs on a helper
/// thread, never on the worker loop.
pub fn fetch_oauth_credential(
    ws_url: &str,
    service: &str,
    token: &str,
    credential_token: &str,
) -> Result<OauthCredential, ClientError> {
    let base = http_base_from_ws_url(ws_url)?;
    let url = oauth_url(&base, service, token, credential_token);
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(20))
        .build();
    let body = agent
        .get(&url)
        .call()
        .map_err(|err| ClientError::logon_rejected(format!("oauth fetch failed: {err}")))?
        .into_string()
        .map_err(|err| ClientError::logon_rejected(format!("oauth page unreadable: {err}")))?;
    let config = extract_oauth_config(&body)?;
    credential_from_config(&config, credential_token)
}

pub fn oauth_login_params(options_key: &str, credential: &OauthCredential) -> Value {
    let mut params = Map::new();
    params.insert(
        options_key.to_string(),
        json!({
            "credentialToken": credential.credential_token,
            "credentialSecret": credential.credential_secret,
        }),
    );
    Value::Object(params)
}
