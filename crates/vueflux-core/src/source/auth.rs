//! Emporia account authentication.
//!
//! Emporia accounts live in an AWS Cognito user pool. Tokens are obtained with
//! the Cognito `InitiateAuth` call, either from username/password or from a
//! previously issued refresh token. With a token file, tokens survive restarts
//! and the password flow is only needed once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::SourceError;

/// Cognito endpoint of the Emporia user pool.
pub const COGNITO_ENDPOINT: &str = "https://cognito-idp.us-east-2.amazonaws.com/";

/// Cognito app client id used by the Emporia apps.
pub const CLIENT_ID: &str = "4qte47jbstod8apnfic0bunmrq";

/// Account credentials from the config file.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Tokens issued by Cognito; also the token file format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tokens {
    pub id_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl Tokens {
    /// Reads tokens from `path`. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Option<Self>, SourceError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes tokens to `path`, replacing any previous content.
    pub fn save(&self, path: &Path) -> Result<(), SourceError> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthResponse {
    authentication_result: Option<AuthenticationResult>,
    challenge_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationResult {
    id_token: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Parses an `InitiateAuth` response body.
///
/// Refresh responses carry no refresh token; the previous one is kept.
fn parse_auth_response(
    body: &str,
    username: Option<&str>,
    previous_refresh: Option<&str>,
) -> Result<Tokens, SourceError> {
    let response: InitiateAuthResponse = serde_json::from_str(body)?;

    let Some(result) = response.authentication_result else {
        let challenge = response
            .challenge_name
            .unwrap_or_else(|| "no authentication result".to_string());
        return Err(SourceError::Auth(format!("unsupported challenge: {}", challenge)));
    };

    Ok(Tokens {
        id_token: result.id_token,
        access_token: result.access_token,
        refresh_token: result
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string)),
        username: username.map(str::to_string),
    })
}

/// Obtains and refreshes tokens, persisting them to the token file.
pub struct Authenticator {
    http: reqwest::blocking::Client,
    endpoint: String,
    credentials: Option<Credentials>,
    token_file: Option<PathBuf>,
}

impl Authenticator {
    /// Creates an authenticator.
    ///
    /// # Arguments
    /// * `credentials` - Username/password, if configured
    /// * `token_file` - Optional file to load tokens from and save them to
    pub fn new(
        credentials: Option<Credentials>,
        token_file: Option<PathBuf>,
    ) -> Result<Self, SourceError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            endpoint: COGNITO_ENDPOINT.to_string(),
            credentials,
            token_file,
        })
    }

    /// Overrides the Cognito endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Returns a usable set of tokens.
    ///
    /// Tries the refresh token from the token file first, then falls back to
    /// username/password.
    pub fn login(&self) -> Result<Tokens, SourceError> {
        if let Some(path) = &self.token_file
            && let Some(stored) = Tokens::load(path)?
        {
            match self.refresh(&stored) {
                Ok(tokens) => {
                    info!("Authenticated with stored token from {}", path.display());
                    return Ok(tokens);
                }
                Err(e) => warn!("Stored token rejected ({}), logging in again", e),
            }
        }

        let credentials = self.credentials.as_ref().ok_or_else(|| {
            SourceError::Auth("vue.username and vue.password are required".to_string())
        })?;

        debug!("Logging in as {}", credentials.username);
        let tokens = self.initiate_auth(
            "USER_PASSWORD_AUTH",
            json!({
                "USERNAME": credentials.username,
                "PASSWORD": credentials.password,
            }),
            Some(&credentials.username),
            None,
        )?;
        self.persist(&tokens);
        Ok(tokens)
    }

    /// Exchanges the refresh token in `tokens` for fresh tokens.
    pub fn refresh(&self, tokens: &Tokens) -> Result<Tokens, SourceError> {
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| SourceError::Auth("no refresh token".to_string()))?;

        let refreshed = self.initiate_auth(
            "REFRESH_TOKEN_AUTH",
            json!({ "REFRESH_TOKEN": refresh_token }),
            tokens.username.as_deref(),
            Some(refresh_token),
        )?;
        self.persist(&refreshed);
        Ok(refreshed)
    }

    fn initiate_auth(
        &self,
        flow: &str,
        parameters: serde_json::Value,
        username: Option<&str>,
        previous_refresh: Option<&str>,
    ) -> Result<Tokens, SourceError> {
        let body = json!({
            "AuthFlow": flow,
            "ClientId": CLIENT_ID,
            "AuthParameters": parameters,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header(
                "X-Amz-Target",
                "AWSCognitoIdentityProviderService.InitiateAuth",
            )
            .body(body.to_string())
            .send()?;

        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(SourceError::Auth(format!("{}: {}", status.as_u16(), text)));
        }

        parse_auth_response(&text, username, previous_refresh)
    }

    fn persist(&self, tokens: &Tokens) {
        if let Some(path) = &self.token_file
            && let Err(e) = tokens.save(path)
        {
            warn!("Failed to save tokens to {}: {}", path.display(), e);
        }
    }
}
