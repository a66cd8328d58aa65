//! OAuth2 plumbing around the credential store
//!
//! - [`OAuthRefresher`] exchanges a refresh token at Google's token endpoint
//! - [`authorize_interactively`] runs yup-oauth2's installed-app consent flow
//!   and hands the resulting token pair to the store
//! - [`initialize_gmail_hub`] builds a Gmail hub that asks the store for a
//!   valid token on every request

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use google_gmail1::common::GetToken;
use google_gmail1::{hyper_rustls, hyper_util, Gmail};
use serde::Deserialize;
use std::env;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};
use yup_oauth2::storage::{TokenInfo, TokenStorage, TokenStorageError};
use yup_oauth2::ApplicationSecret;

use crate::credentials::{CredentialStore, TokenRefresher, TokenSource};
use crate::error::{LabelerError, Result};
use crate::models::Credential;

/// Scopes needed to search messages, manage labels and modify message labels
pub const REQUIRED_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.labels",
];

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub = Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Load the OAuth client secret
///
/// Reads `credentials_path` (Google's installed-app JSON) when it exists and
/// falls back to `GMAIL_CLIENT_ID` / `GMAIL_CLIENT_SECRET` otherwise.
pub async fn load_application_secret(credentials_path: &Path) -> Result<ApplicationSecret> {
    if credentials_path.exists() {
        debug!("Reading OAuth client secret from {:?}", credentials_path);
        return yup_oauth2::read_application_secret(credentials_path)
            .await
            .map_err(|e| LabelerError::ConfigError(format!("Failed to read credentials: {}", e)));
    }

    load_credentials_from_env().map_err(|e| {
        LabelerError::ConfigError(format!(
            "{:?} not found and environment fallback unavailable: {}",
            credentials_path, e
        ))
    })
}

const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

fn required_env(name: &str) -> Result<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| LabelerError::ConfigError(format!("{} not set", name)))
}

/// Build the client secret from `GMAIL_CLIENT_ID` and `GMAIL_CLIENT_SECRET`
///
/// `GMAIL_REDIRECT_URI` overrides the loopback redirect used by consent.
pub fn load_credentials_from_env() -> Result<ApplicationSecret> {
    let redirect = env::var("GMAIL_REDIRECT_URI").unwrap_or_else(|_| "http://localhost:8080".into());

    Ok(ApplicationSecret {
        client_id: required_env("GMAIL_CLIENT_ID")?,
        client_secret: required_env("GMAIL_CLIENT_SECRET")?,
        auth_uri: GOOGLE_AUTH_URI.to_string(),
        token_uri: GOOGLE_TOKEN_URI.to_string(),
        redirect_uris: vec![redirect],
        ..Default::default()
    })
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Refresh-token grant against the OAuth token endpoint
#[derive(Debug, Clone)]
pub struct OAuthRefresher {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    endpoint: String,
}

impl OAuthRefresher {
    pub fn new(secret: &ApplicationSecret, endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: secret.client_id.clone(),
            client_secret: secret.client_secret.clone(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, credential: &Credential) -> Result<Credential> {
        if !credential.has_refresh_token() {
            return Err(LabelerError::AuthError("missing refresh token".to_string()));
        }

        let response = self
            .http
            .post(&self.endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", credential.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| LabelerError::NetworkError(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LabelerError::AuthError(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| LabelerError::NetworkError(e.to_string()))?;
        let payload: RefreshResponse = serde_json::from_str(&body).map_err(|e| {
            LabelerError::AuthError(format!("unexpected token endpoint response: {}", e))
        })?;
        if payload.expires_in <= 0 {
            return Err(LabelerError::AuthError(format!(
                "invalid expires_in value: {}",
                payload.expires_in
            )));
        }

        // Google normally omits the refresh token on refresh; keep the old one
        let refresh_token = payload
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| credential.refresh_token.clone());

        Ok(Credential {
            access_token: payload.access_token,
            refresh_token,
            expiry: Utc::now() + Duration::seconds(payload.expires_in),
        })
    }
}

/// yup-oauth2 storage hook that forwards the consented token pair to the store
struct ConsentCapture {
    store: Arc<CredentialStore>,
}

#[async_trait]
impl TokenStorage for ConsentCapture {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> std::result::Result<(), TokenStorageError> {
        let previous = self.store.current().await;
        let credential = credential_from_token_info(token, previous.as_ref())
            .map_err(|e| TokenStorageError::Other(e.to_string().into()))?;

        self.store
            .accept(credential)
            .await
            .map_err(|e| TokenStorageError::Other(e.to_string().into()))
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        // Always run the consent flow when asked to authorize
        None
    }
}

fn credential_from_token_info(token: TokenInfo, previous: Option<&Credential>) -> Result<Credential> {
    let access_token = token
        .access_token
        .ok_or_else(|| LabelerError::AuthError("consent flow returned no access token".to_string()))?;

    let refresh_token = token
        .refresh_token
        .or_else(|| previous.map(|c| c.refresh_token.clone()))
        .unwrap_or_default();

    let expiry = token
        .expires_at
        .and_then(|t| DateTime::<Utc>::from_timestamp(t.unix_timestamp(), 0))
        .unwrap_or_else(|| Utc::now() + Duration::hours(1));

    Ok(Credential {
        access_token,
        refresh_token,
        expiry,
    })
}

/// Run the browser consent flow and persist the resulting credential
pub async fn authorize_interactively(
    secret: ApplicationSecret,
    store: Arc<CredentialStore>,
) -> Result<()> {
    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .with_storage(Box::new(ConsentCapture {
        store: store.clone(),
    }))
    .build()
    .await
    .map_err(|e| LabelerError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    auth.token(REQUIRED_SCOPES)
        .await
        .map_err(|e| LabelerError::AuthError(format!("Failed to obtain token: {}", e)))?;

    if store.current().await.is_none() {
        return Err(LabelerError::AuthError(
            "consent completed but no credential was stored".to_string(),
        ));
    }

    info!("Authorization complete; credential saved to {:?}", store.path());
    Ok(())
}

/// Supplies the hub with tokens from any [`TokenSource`]
#[derive(Clone)]
pub struct StoreTokenProvider {
    source: Arc<dyn TokenSource>,
}

impl StoreTokenProvider {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source }
    }
}

impl GetToken for StoreTokenProvider {
    fn get_token<'a>(
        &'a self,
        _scopes: &'a [&str],
    ) -> Pin<
        Box<
            dyn Future<Output = std::result::Result<Option<String>, Box<dyn std::error::Error + Send + Sync>>>
                + Send
                + 'a,
        >,
    > {
        Box::pin(async move {
            self.source
                .valid_token()
                .await
                .map(Some)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })
    }
}

/// Build the Gmail hub over HTTPS, authenticated through `source`
pub fn initialize_gmail_hub(source: Arc<dyn TokenSource>) -> Result<GmailHub> {
    // HTTP/1 only: google-gmail1 behaves better with it
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| LabelerError::ConfigError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, StoreTokenProvider::new(source)))
}
