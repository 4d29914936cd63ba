/*!
 * # Social Login
 *
 * Authorization-code flow with PKCE against Google, Kakao and Naver.
 *
 * 1. Client calls `/auth/oauth2/{provider}/authorize` and is sent to the provider
 * 2. Provider redirects back to `/auth/oauth2/{provider}/callback` with `code` and `state`
 * 3. The code is exchanged for a provider token and the profile is fetched
 * 4. The profile is resolved to a member and our own token pair is issued
 */

use oauth2::{
    basic::BasicClient, reqwest::async_http_client, AuthType, AuthUrl, AuthorizationCode,
    ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::entities::member::SocialType;
use crate::services::members::SocialProfile;

/// How long an issued `state` stays redeemable
const STATE_TTL: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum OAuth2Error {
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Invalid state parameter")]
    InvalidState,

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("Failed to fetch user info: {0}")]
    UserInfoFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Endpoints and credentials for one provider
#[derive(Debug, Clone, Deserialize)]
pub struct OAuth2ProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub user_info_url: String,
    pub redirect_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Send client credentials in the token request body instead of a Basic header
    #[serde(default)]
    pub credentials_in_body: bool,
}

impl OAuth2ProviderConfig {
    pub fn google(client_id: String, client_secret: String, redirect_url: String) -> Self {
        Self {
            client_id,
            client_secret,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            user_info_url: "https://www.googleapis.com/oauth2/v3/userinfo".to_string(),
            redirect_url,
            scopes: vec![
                "openid".to_string(),
                "email".to_string(),
                "profile".to_string(),
            ],
            credentials_in_body: false,
        }
    }

    pub fn kakao(client_id: String, client_secret: String, redirect_url: String) -> Self {
        Self {
            client_id,
            client_secret,
            auth_url: "https://kauth.kakao.com/oauth/authorize".to_string(),
            token_url: "https://kauth.kakao.com/oauth/token".to_string(),
            user_info_url: "https://kapi.kakao.com/v2/user/me".to_string(),
            redirect_url,
            scopes: vec!["profile_nickname".to_string(), "account_email".to_string()],
            credentials_in_body: true,
        }
    }

    pub fn naver(client_id: String, client_secret: String, redirect_url: String) -> Self {
        Self {
            client_id,
            client_secret,
            auth_url: "https://nid.naver.com/oauth2.0/authorize".to_string(),
            token_url: "https://nid.naver.com/oauth2.0/token".to_string(),
            user_info_url: "https://openapi.naver.com/v1/nid/me".to_string(),
            redirect_url,
            scopes: Vec::new(),
            credentials_in_body: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuth2Config {
    #[serde(default)]
    pub enabled: bool,
    pub google: Option<OAuth2ProviderConfig>,
    pub kakao: Option<OAuth2ProviderConfig>,
    pub naver: Option<OAuth2ProviderConfig>,
}

impl OAuth2Config {
    pub fn provider(&self, provider: SocialType) -> Option<&OAuth2ProviderConfig> {
        match provider {
            SocialType::Google => self.google.as_ref(),
            SocialType::Kakao => self.kakao.as_ref(),
            SocialType::Naver => self.naver.as_ref(),
        }
    }

    pub fn configured_providers(&self) -> Vec<SocialType> {
        [SocialType::Google, SocialType::Kakao, SocialType::Naver]
            .into_iter()
            .filter(|p| self.provider(*p).is_some())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthorizationUrlResponse {
    pub authorization_url: String,
    /// CSRF state the callback must echo back
    pub state: String,
    pub provider: SocialType,
}

struct PendingAuthorization {
    verifier: PkceCodeVerifier,
    provider: SocialType,
    issued_at: Instant,
}

/// Outstanding `state` values and their PKCE verifiers
#[derive(Default)]
pub struct OAuth2StateStore {
    pending: RwLock<HashMap<String, PendingAuthorization>>,
}

impl OAuth2StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn store(&self, state: String, verifier: PkceCodeVerifier, provider: SocialType) {
        let mut pending = self.pending.write().await;
        pending.retain(|_, entry| entry.issued_at.elapsed() < STATE_TTL);
        pending.insert(
            state,
            PendingAuthorization {
                verifier,
                provider,
                issued_at: Instant::now(),
            },
        );
    }

    /// Removes and returns the verifier; each state is redeemable once.
    pub async fn take(&self, state: &str) -> Option<(PkceCodeVerifier, SocialType)> {
        let entry = self.pending.write().await.remove(state)?;
        if entry.issued_at.elapsed() >= STATE_TTL {
            return None;
        }
        Some((entry.verifier, entry.provider))
    }
}

#[derive(Clone)]
pub struct OAuth2Service {
    config: OAuth2Config,
    state_store: Arc<OAuth2StateStore>,
    http_client: reqwest::Client,
}

impl OAuth2Service {
    pub fn new(config: OAuth2Config) -> Self {
        Self {
            config,
            state_store: Arc::new(OAuth2StateStore::new()),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn configured_providers(&self) -> Vec<SocialType> {
        self.config.configured_providers()
    }

    fn provider_config(&self, provider: SocialType) -> Result<&OAuth2ProviderConfig, OAuth2Error> {
        if !self.config.enabled {
            return Err(OAuth2Error::ProviderNotConfigured(provider.to_string()));
        }
        self.config
            .provider(provider)
            .ok_or_else(|| OAuth2Error::ProviderNotConfigured(provider.to_string()))
    }

    fn build_client(&self, config: &OAuth2ProviderConfig) -> Result<BasicClient, OAuth2Error> {
        let client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            AuthUrl::new(config.auth_url.clone())
                .map_err(|e| OAuth2Error::ConfigurationError(e.to_string()))?,
            Some(
                TokenUrl::new(config.token_url.clone())
                    .map_err(|e| OAuth2Error::ConfigurationError(e.to_string()))?,
            ),
        )
        .set_redirect_uri(
            RedirectUrl::new(config.redirect_url.clone())
                .map_err(|e| OAuth2Error::ConfigurationError(e.to_string()))?,
        );

        Ok(if config.credentials_in_body {
            client.set_auth_type(AuthType::RequestBody)
        } else {
            client
        })
    }

    pub async fn authorization_url(
        &self,
        provider: SocialType,
    ) -> Result<AuthorizationUrlResponse, OAuth2Error> {
        let config = self.provider_config(provider)?;
        let client = self.build_client(config)?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);
        for scope in &config.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (url, csrf_state) = request.url();

        self.state_store
            .store(csrf_state.secret().clone(), pkce_verifier, provider)
            .await;
        info!(provider = %provider, "social login started");

        Ok(AuthorizationUrlResponse {
            authorization_url: url.to_string(),
            state: csrf_state.secret().clone(),
            provider,
        })
    }

    /// Redeems the callback's code and returns the provider's view of the user.
    pub async fn complete_login(
        &self,
        provider: SocialType,
        code: String,
        state: &str,
    ) -> Result<SocialProfile, OAuth2Error> {
        let (verifier, issued_for) = self
            .state_store
            .take(state)
            .await
            .ok_or(OAuth2Error::InvalidState)?;
        if issued_for != provider {
            warn!(provider = %provider, issued_for = %issued_for, "state issued for another provider");
            return Err(OAuth2Error::InvalidState);
        }

        let config = self.provider_config(provider)?;
        let token = self
            .build_client(config)?
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(verifier)
            .request_async(async_http_client)
            .await
            .map_err(|e| OAuth2Error::TokenExchangeFailed(e.to_string()))?;

        let response = self
            .http_client
            .get(&config.user_info_url)
            .bearer_auth(token.access_token().secret())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| OAuth2Error::UserInfoFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(OAuth2Error::UserInfoFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let raw: Value = response
            .json()
            .await
            .map_err(|e| OAuth2Error::UserInfoFailed(e.to_string()))?;

        let profile = parse_profile(provider, &raw)?;
        info!(provider = %provider, "social profile fetched");
        Ok(profile)
    }
}

fn non_empty(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn is_true(value: &Value) -> bool {
    value.as_bool() == Some(true)
}

/// Maps a provider's user-info document onto a [`SocialProfile`].
///
/// Only addresses the provider vouches for are kept, since a profile email
/// links the identity onto an existing member with that address.
pub fn parse_profile(provider: SocialType, raw: &Value) -> Result<SocialProfile, OAuth2Error> {
    let missing = |field: &str| OAuth2Error::UserInfoFailed(format!("missing '{}' field", field));

    match provider {
        SocialType::Google => Ok(SocialProfile {
            social_type: provider,
            social_id: non_empty(&raw["sub"]).ok_or_else(|| missing("sub"))?,
            email: non_empty(&raw["email"]).filter(|_| is_true(&raw["email_verified"])),
            name: non_empty(&raw["name"]),
        }),
        SocialType::Kakao => {
            let id = raw["id"].as_i64().ok_or_else(|| missing("id"))?;
            let account = &raw["kakao_account"];
            Ok(SocialProfile {
                social_type: provider,
                social_id: id.to_string(),
                email: non_empty(&account["email"]).filter(|_| {
                    is_true(&account["is_email_verified"]) && is_true(&account["is_email_valid"])
                }),
                name: non_empty(&account["profile"]["nickname"])
                    .or_else(|| non_empty(&raw["properties"]["nickname"])),
            })
        }
        SocialType::Naver => {
            if raw["resultcode"].as_str().map_or(false, |code| code != "00") {
                return Err(OAuth2Error::UserInfoFailed(
                    non_empty(&raw["message"]).unwrap_or_else(|| "naver profile error".into()),
                ));
            }
            let body = &raw["response"];
            Ok(SocialProfile {
                social_type: provider,
                social_id: non_empty(&body["id"]).ok_or_else(|| missing("response.id"))?,
                // Naver reports no verification state for the contact address.
                email: None,
                name: non_empty(&body["name"]).or_else(|| non_empty(&body["nickname"])),
            })
        }
    }
}
