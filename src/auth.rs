//! Access tokens for the mail provider.
//!
//! The interactive consent flow lives outside this tool. What it leaves
//! behind is an authorized-user token file; this module reads it and
//! refreshes the access token when it has expired.

use crate::mailbox::{MailError, MailResult};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Contents of an authorized-user token file. Fields this tool does not use
/// are carried through unchanged when the file is rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl StoredToken {
    /// Expired, or expiring within the next minute.
    pub fn is_expired(&self) -> bool {
        match (&self.token, self.expiry) {
            (None, _) => true,
            (Some(_), Some(exp)) => Utc::now() + Duration::seconds(60) >= exp,
            (Some(_), None) => false,
        }
    }

    fn apply_refresh(&mut self, response: TokenResponse) {
        self.token = Some(response.access_token);
        self.expiry = response
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));
        if response.refresh_token.is_some() {
            self.refresh_token = response.refresh_token;
        }
    }
}

pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TokenFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StoredToken> {
        let content = std::fs::read_to_string(&self.path).with_context(|| {
            format!(
                "Token file {} not readable; authorize this tool with your mail account first",
                self.path.display()
            )
        })?;
        serde_json::from_str(&content)
            .with_context(|| format!("Token file {} is malformed", self.path.display()))
    }

    pub fn save(&self, token: &StoredToken) -> Result<()> {
        let content = serde_json::to_string(token)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write token file {}", self.path.display()))
    }
}

/// Hands out bearer tokens for provider requests.
pub trait TokenSource {
    /// The current access token, refreshed first if it is known to be stale.
    fn access_token(&mut self) -> MailResult<String>;

    /// Get a new access token regardless of the recorded expiry. Called after
    /// the provider rejected the current one.
    fn refresh(&mut self) -> MailResult<String>;
}

/// Token source backed by a token file; refreshed tokens are written back.
pub struct RefreshingToken {
    file: TokenFile,
    client: reqwest::blocking::Client,
    stored: StoredToken,
}

impl RefreshingToken {
    pub fn load(file: TokenFile, client: reqwest::blocking::Client) -> Result<Self> {
        let stored = file.load()?;
        Ok(RefreshingToken {
            file,
            client,
            stored,
        })
    }
}

impl TokenSource for RefreshingToken {
    fn access_token(&mut self) -> MailResult<String> {
        match &self.stored.token {
            Some(token) if !self.stored.is_expired() => Ok(token.clone()),
            _ => {
                log::info!("Access token expired, refreshing");
                self.refresh()
            }
        }
    }

    fn refresh(&mut self) -> MailResult<String> {
        refresh(&self.client, &mut self.stored)?;
        self.file
            .save(&self.stored)
            .map_err(|e| MailError::Other(format!("{e:#}")))?;
        log::debug!("Refreshed access token saved to {}", self.file.path().display());
        self.stored
            .token
            .clone()
            .ok_or_else(|| MailError::AuthExpired("token endpoint returned no access token".into()))
    }
}

fn refresh(client: &reqwest::blocking::Client, stored: &mut StoredToken) -> MailResult<()> {
    let refresh_token = stored
        .refresh_token
        .clone()
        .ok_or_else(|| MailError::AuthExpired("no refresh token available".into()))?;

    let mut params = HashMap::new();
    params.insert("grant_type", "refresh_token".to_string());
    params.insert("refresh_token", refresh_token);
    if let Some(client_id) = &stored.client_id {
        params.insert("client_id", client_id.clone());
    }
    if let Some(secret) = &stored.client_secret {
        params.insert("client_secret", secret.clone());
    }

    let response = client.post(&stored.token_uri).form(&params).send()?;
    let status = response.status();
    let body = response.text()?;

    if !status.is_success() {
        return Err(refresh_error(status.as_u16(), &body));
    }

    let token_response: TokenResponse = serde_json::from_str(&body)?;
    stored.apply_refresh(token_response);
    Ok(())
}

fn refresh_error(status: u16, body: &str) -> MailError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) if err.error == "invalid_grant" || err.error == "invalid_client" || status == 401 => {
            MailError::AuthExpired(match err.error_description {
                Some(desc) => format!("{}: {desc}", err.error),
                None => err.error,
            })
        }
        Ok(err) => MailError::Api {
            status,
            message: err.error_description.unwrap_or(err.error),
        },
        Err(_) if status == 401 => MailError::AuthExpired(body.to_string()),
        Err(_) => MailError::Api {
            status,
            message: body.to_string(),
        },
    }
}
