use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_BASE_PATH: &str = "/_matrix/maubot/v1";

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid console URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("login rejected: {message}")]
    BadCredentials { message: String },
    #[error("auth token missing")]
    TokenMissing,
    #[error("auth token invalid")]
    TokenInvalid,
    #[error("unexpected response ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct PingResponse {
    username: String,
}

#[derive(Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Deserialize)]
struct PathsDocument {
    api_path: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

/// REST client for the management API mounted under the console URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    console_url: Url,
    base_path: String,
}

impl ApiClient {
    pub fn new(console_url: &str) -> Result<Self, ApiError> {
        let console_url = Url::parse(console_url)?;
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            console_url,
            base_path: DEFAULT_BASE_PATH.to_string(),
        })
    }

    pub fn console_url(&self) -> &Url {
        &self.console_url
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Fetches `paths.json` under the console root to find where the API is
    /// mounted. Any failure keeps the default mount.
    pub async fn discover_base_path(&mut self) {
        let url = join_endpoint(&self.console_url, "/paths.json");
        match self.fetch_paths(&url).await {
            Ok(api_path) => {
                self.base_path = normalize_base_path(&api_path);
                debug!(event = "api_path_discovered", api_path = %self.base_path);
            }
            Err(err) => {
                debug!(event = "api_path_fallback", error = %err, api_path = DEFAULT_BASE_PATH);
            }
        }
    }

    async fn fetch_paths(&self, url: &str) -> Result<String, ApiError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = read_body(response).await;
            return Err(ApiError::UnexpectedResponse { status, body });
        }
        let doc = response.json::<PathsDocument>().await?;
        Ok(doc.api_path)
    }

    /// Exchanges credentials for an auth token.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let response = self
            .http
            .post(self.api_endpoint("/auth/login"))
            .json(&LoginRequest { username, password })
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let body = response.json::<LoginResponse>().await?;
            return Ok(body.token);
        }
        let body = read_body(response).await;
        Err(classify_error(status.as_u16(), &body))
    }

    /// Validates a token and returns the username it belongs to.
    pub async fn ping(&self, token: &str) -> Result<String, ApiError> {
        let response = self
            .http
            .post(self.api_endpoint("/auth/ping"))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let body = response.json::<PingResponse>().await?;
            return Ok(body.username);
        }
        let body = read_body(response).await;
        Err(classify_error(status.as_u16(), &body))
    }

    pub async fn version(&self, token: &str) -> Result<String, ApiError> {
        let response = self
            .http
            .get(self.api_endpoint("/version"))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let body = response.json::<VersionResponse>().await?;
            return Ok(body.version);
        }
        let body = read_body(response).await;
        Err(classify_error(status.as_u16(), &body))
    }

    fn api_endpoint(&self, suffix: &str) -> String {
        format!(
            "{}{}{}",
            self.console_url.as_str().trim_end_matches('/'),
            self.base_path,
            suffix
        )
    }
}

async fn read_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "<unavailable>".to_string())
}

fn join_endpoint(root: &Url, path: &str) -> String {
    format!("{}{}", root.as_str().trim_end_matches('/'), path)
}

fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    format!("/{trimmed}")
}

fn classify_error(status: u16, body: &str) -> ApiError {
    let parsed = serde_json::from_str::<ErrorBody>(body).unwrap_or_default();
    match parsed.errcode.as_str() {
        "invalid_auth" => {
            let message = if parsed.error.is_empty() {
                "invalid credentials".to_string()
            } else {
                parsed.error
            };
            ApiError::BadCredentials { message }
        }
        "auth_token_missing" => ApiError::TokenMissing,
        "auth_token_invalid" => ApiError::TokenInvalid,
        _ => ApiError::UnexpectedResponse {
            status,
            body: body.to_string(),
        },
    }
}
