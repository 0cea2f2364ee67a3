//! OAuth credentials for the installed-app flow.
//!
//! The token is either on disk ([`AuthState::Authorized`]) or it is not
//! ([`AuthState::NoCredentials`]); the only way from the second state to the first is
//! [`AuthState::authorize`], which asks a [`ConsentPrompt`] for an authorization code and trades
//! it at a [`TokenEndpoint`]. The new token is written to the [`TokenStore`] before it is used.

use crate::error::BackupError;
use chrono::{DateTime, Duration, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::{BufRead, Write},
    path::{Path, PathBuf},
};
use tracing::{info, warn};
use url::Url;

pub const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/webmasters.readonly",
    "https://www.googleapis.com/auth/webmasters",
];

/// Out-of-band redirect: the consent page shows the code and the user pastes it back.
pub const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Tokens are treated as expired this long before their actual expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_owned()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_owned()
}

#[derive(Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecret")
            .field("client_id", &self.client_id)
            .field("auth_uri", &self.auth_uri)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    pub fn load(path: &Path) -> Result<Self, BackupError> {
        let raw = std::fs::read(path).map_err(|source| BackupError::Credentials {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Accepts the JSON downloaded from the cloud console (`installed` or `web` client).
    pub fn from_json(raw: &[u8]) -> Result<Self, BackupError> {
        let file: ClientSecretFile = serde_json::from_slice(raw)?;
        file.installed.or(file.web).ok_or_else(|| {
            BackupError::Auth("client secret has neither an `installed` nor a `web` section".into())
        })
    }

    pub fn consent_url(&self) -> Result<Url, BackupError> {
        let scope = SCOPES.join(" ");
        Ok(Url::parse_with_params(
            &self.auth_uri,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", OOB_REDIRECT_URI),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )?)
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredToken")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl StoredToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| at - Duration::seconds(EXPIRY_MARGIN_SECS) <= now)
    }
}

/// Token endpoint answer for both the code exchange and a refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// A refresh answer usually omits the refresh token; the previous one is kept then.
    pub fn into_token(self, now: DateTime<Utc>, previous_refresh: Option<String>) -> StoredToken {
        StoredToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self.expires_in.map(|secs| now + Duration::seconds(secs)),
            scopes: match self.scope {
                Some(scope) => scope.split_whitespace().map(str::to_owned).collect(),
                None => SCOPES.iter().map(|s| (*s).to_owned()).collect(),
            },
        }
    }
}

/// The identity provider.
pub trait TokenEndpoint {
    fn consent_url(&self) -> Result<Url, BackupError>;

    fn exchange_code(&self, code: &str) -> Result<TokenResponse, BackupError>;

    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, BackupError>;
}

/// The interactive step: show the consent URL, return the code the user obtained.
pub trait ConsentPrompt {
    fn authorization_code(&mut self, consent_url: &Url) -> Result<String, BackupError>;
}

pub struct GoogleOAuth {
    http: Client,
    secret: ClientSecret,
}

impl GoogleOAuth {
    pub fn new(secret: ClientSecret) -> Result<Self, BackupError> {
        Ok(Self {
            http: Client::builder().build()?,
            secret,
        })
    }

    fn post_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse, BackupError> {
        let response = self.http.post(&self.secret.token_uri).form(form).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(BackupError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json()?)
    }
}

impl TokenEndpoint for GoogleOAuth {
    fn consent_url(&self) -> Result<Url, BackupError> {
        self.secret.consent_url()
    }

    fn exchange_code(&self, code: &str) -> Result<TokenResponse, BackupError> {
        self.post_form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.secret.client_id.as_str()),
            ("client_secret", self.secret.client_secret.as_str()),
            ("redirect_uri", OOB_REDIRECT_URI),
        ])
    }

    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, BackupError> {
        self.post_form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.secret.client_id.as_str()),
            ("client_secret", self.secret.client_secret.as_str()),
        ])
    }
}

/// Prints the consent URL on stderr and reads the code from stdin.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl ConsentPrompt for StdinPrompt {
    fn authorization_code(&mut self, consent_url: &Url) -> Result<String, BackupError> {
        let mut stderr = std::io::stderr().lock();
        let io_err = |source| BackupError::Credentials {
            path: PathBuf::from("<stdin>"),
            source,
        };
        writeln!(stderr, "Open this URL in a browser and grant access:\n\n  {consent_url}\n")
            .map_err(io_err)?;
        write!(stderr, "Authorization code: ").map_err(io_err)?;
        stderr.flush().map_err(io_err)?;

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).map_err(io_err)?;
        let code = line.trim();
        if code.is_empty() {
            return Err(BackupError::Auth("no authorization code entered".into()));
        }
        Ok(code.to_owned())
    }
}

/// JSON token file at a fixed path.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StoredToken, BackupError> {
        let raw = std::fs::read(&self.path).map_err(|source| BackupError::Credentials {
            path: self.path.clone(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn save(&self, token: &StoredToken) -> Result<(), BackupError> {
        let io_err = |source| BackupError::Credentials {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(token)?).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    NoCredentials,
    Authorized(StoredToken),
}

impl AuthState {
    /// Anything but a readable, well-formed token file means `NoCredentials`.
    pub fn load(store: &TokenStore) -> Self {
        match store.load() {
            Ok(token) => AuthState::Authorized(token),
            Err(err) => {
                info!(path = %store.path().display(), %err, "no usable stored credentials");
                AuthState::NoCredentials
            }
        }
    }

    /// Refreshes an expired token. Without a refresh token, or when the refresh is refused,
    /// the state drops back to `NoCredentials`.
    pub fn refresh_if_expired<E: TokenEndpoint>(
        self,
        endpoint: &E,
        store: &TokenStore,
        now: DateTime<Utc>,
    ) -> Self {
        let token = match self {
            AuthState::Authorized(token) if token.is_expired(now) => token,
            other => return other,
        };
        let Some(refresh_token) = token.refresh_token.clone() else {
            info!("stored token expired and cannot be refreshed");
            return AuthState::NoCredentials;
        };

        let refreshed = endpoint
            .refresh(&refresh_token)
            .map(|response| response.into_token(now, Some(refresh_token)))
            .and_then(|token| store.save(&token).map(|()| token));
        match refreshed {
            Ok(token) => {
                info!(expires_at = ?token.expires_at, "access token refreshed");
                AuthState::Authorized(token)
            }
            Err(err) => {
                warn!(%err, "token refresh failed, asking for consent again");
                AuthState::NoCredentials
            }
        }
    }

    pub fn authorize<E: TokenEndpoint, P: ConsentPrompt>(
        self,
        endpoint: &E,
        prompt: &mut P,
        store: &TokenStore,
        now: DateTime<Utc>,
    ) -> Result<StoredToken, BackupError> {
        match self {
            AuthState::Authorized(token) => Ok(token),
            AuthState::NoCredentials => {
                let code = prompt.authorization_code(&endpoint.consent_url()?)?;
                let token = endpoint.exchange_code(&code)?.into_token(now, None);
                store.save(&token)?;
                info!(path = %store.path().display(), "credentials stored");
                Ok(token)
            }
        }
    }
}

/// Loads, refreshes or obtains the access token for this run.
pub fn obtain_token<E: TokenEndpoint, P: ConsentPrompt>(
    endpoint: &E,
    prompt: &mut P,
    store: &TokenStore,
    now: DateTime<Utc>,
) -> Result<StoredToken, BackupError> {
    AuthState::load(store)
        .refresh_if_expired(endpoint, store, now)
        .authorize(endpoint, prompt, store, now)
}
