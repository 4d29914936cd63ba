/*!
 * # Authentication and Authorization
 *
 * Token lifecycle for members:
 *
 * - Short-lived access tokens (HS256 JWT) validated on every protected request
 * - One persisted refresh token per member, rotated on every renewal
 * - Logout drops the refresh token and revokes the access token until it expires
 * - Social login through [`oauth2`] resolves to the same token pair
 *
 * Authorization is role based: `user` for members, `admin` for operators.
 */

use async_trait::async_trait;
use axum::{
    extract::{DefaultBodyLimit, FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::member::{self, SocialType},
    errors::{ErrorResponse, ServiceError},
    services::members::{MemberResponse, MemberService, RegisterMemberRequest, SocialProfile},
    AppState,
};

pub mod oauth2;
pub mod refresh_token;

use self::oauth2::{AuthorizationUrlResponse, OAuth2Error};

pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub token_type: TokenType,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
    pub iss: String,
    pub aud: String,
}

/// Authenticated caller, attached to request extensions by [`auth_middleware`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub member_id: Uuid,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub token_id: String,
    /// Access token expiry, unix seconds
    pub expires_at: i64,
}

impl AuthUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_ADMIN)
    }

    /// Members may act on what they own; admins on anything.
    pub fn can_access(&self, owner_id: Uuid) -> bool {
        self.member_id == owner_id || self.is_admin()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_audience: String,
    pub jwt_issuer: String,
    pub access_token_expiration: Duration,
    pub refresh_token_expiration: Duration,
}

impl From<&AppConfig> for AuthConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            jwt_secret: cfg.jwt_secret.clone(),
            jwt_audience: cfg.auth_audience.clone(),
            jwt_issuer: cfg.auth_issuer.clone(),
            access_token_expiration: cfg.access_token_ttl(),
            refresh_token_expiration: cfg.refresh_token_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    ExpiredToken,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Token has been revoked")]
    RevokedToken,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("Member not found")]
    MemberNotFound,

    #[error("Token creation failed: {0}")]
    TokenCreation(String),

    #[error(transparent)]
    SocialLogin(#[from] OAuth2Error),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<sea_orm::DbErr> for AuthError {
    fn from(err: sea_orm::DbErr) -> Self {
        AuthError::Service(err.into())
    }
}

impl AuthError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "AUTH_INVALID_CREDENTIALS",
                "Invalid credentials".to_string(),
            ),
            Self::MissingToken => (
                StatusCode::UNAUTHORIZED,
                "AUTH_MISSING_TOKEN",
                "No authentication token provided".to_string(),
            ),
            Self::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "AUTH_INVALID_TOKEN",
                "Invalid authentication token".to_string(),
            ),
            Self::ExpiredToken => (
                StatusCode::UNAUTHORIZED,
                "AUTH_TOKEN_EXPIRED",
                "Token has expired".to_string(),
            ),
            Self::InvalidRefreshToken => (
                StatusCode::UNAUTHORIZED,
                "AUTH_INVALID_REFRESH_TOKEN",
                "Refresh token is invalid or has already been used".to_string(),
            ),
            Self::RevokedToken => (
                StatusCode::UNAUTHORIZED,
                "AUTH_REVOKED_TOKEN",
                "Authentication token has been revoked".to_string(),
            ),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                "AUTH_FORBIDDEN",
                "Insufficient permissions".to_string(),
            ),
            Self::MemberNotFound => (
                StatusCode::UNAUTHORIZED,
                "AUTH_MEMBER_NOT_FOUND",
                "Member no longer exists".to_string(),
            ),
            Self::TokenCreation(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "AUTH_TOKEN_CREATION_FAILED",
                "Could not issue tokens".to_string(),
            ),
            Self::SocialLogin(err) => match err {
                OAuth2Error::ProviderNotConfigured(_) => {
                    (StatusCode::NOT_FOUND, "AUTH_PROVIDER_NOT_CONFIGURED", err.to_string())
                }
                OAuth2Error::InvalidState => {
                    (StatusCode::BAD_REQUEST, "AUTH_INVALID_STATE", err.to_string())
                }
                OAuth2Error::TokenExchangeFailed(_) | OAuth2Error::UserInfoFailed(_) => (
                    StatusCode::BAD_GATEWAY,
                    "AUTH_PROVIDER_ERROR",
                    "Social login provider request failed".to_string(),
                ),
                OAuth2Error::ConfigurationError(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "AUTH_PROVIDER_MISCONFIGURED",
                    "Social login is misconfigured".to_string(),
                ),
            },
            Self::Service(err) => (err.status_code(), err.code(), err.response_message()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let AuthError::Service(err) = self {
            return err.into_response();
        }

        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, "authentication failure");
        } else {
            counter!("storefront.auth.rejections", 1);
            debug!(code, "request rejected");
        }

        let body = ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Unauthorized")
                .to_string(),
            code: code.to_string(),
            message,
            retryable: false,
            request_id: crate::tracing::current_request_id().map(|id| id.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

/// Issues, validates, rotates and revokes member tokens
pub struct AuthService {
    config: AuthConfig,
    db: Arc<DatabaseConnection>,
    members: Arc<MemberService>,
    /// Revoked access token ids and their expiry (unix seconds)
    revoked: DashMap<String, i64>,
}

impl AuthService {
    pub fn new(config: AuthConfig, db: Arc<DatabaseConnection>, members: Arc<MemberService>) -> Self {
        Self {
            config,
            db,
            members,
            revoked: DashMap::new(),
        }
    }

    fn claims(
        &self,
        member: &member::Model,
        token_type: TokenType,
        jti: String,
        ttl: Duration,
    ) -> Result<Claims, AuthError> {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl)
            .map_err(|_| AuthError::TokenCreation("invalid token duration".into()))?;
        let (email, roles) = match token_type {
            TokenType::Access => (Some(member.email.clone()), vec![member.role.as_str().to_string()]),
            TokenType::Refresh => (None, Vec::new()),
        };
        Ok(Claims {
            sub: member.id.to_string(),
            email,
            roles,
            token_type,
            jti,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            nbf: now.timestamp(),
            iss: self.config.jwt_issuer.clone(),
            aud: self.config.jwt_audience.clone(),
        })
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenCreation(e.to_string()))
    }

    fn token_pair(&self, member: &member::Model, refresh_jti: &str) -> Result<TokenPair, AuthError> {
        let access = self.claims(
            member,
            TokenType::Access,
            Uuid::new_v4().to_string(),
            self.config.access_token_expiration,
        )?;
        let refresh = self.claims(
            member,
            TokenType::Refresh,
            refresh_jti.to_string(),
            self.config.refresh_token_expiration,
        )?;
        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_token_expiration.as_secs() as i64,
            refresh_expires_in: self.config.refresh_token_expiration.as_secs() as i64,
        })
    }

    fn refresh_expiry(&self) -> Result<chrono::DateTime<Utc>, AuthError> {
        Ok(Utc::now()
            + ChronoDuration::from_std(self.config.refresh_token_expiration)
                .map_err(|_| AuthError::TokenCreation("invalid token duration".into()))?)
    }

    /// Issues a fresh pair, replacing whatever refresh token the member had.
    pub async fn issue_tokens(&self, member: &member::Model) -> Result<TokenPair, AuthError> {
        let jti = Uuid::new_v4().to_string();
        let expires_at = self.refresh_expiry()?;

        let replaced = refresh_token::Entity::update_many()
            .col_expr(refresh_token::Column::TokenId, Expr::value(jti.clone()))
            .col_expr(refresh_token::Column::ExpiresAt, Expr::value(expires_at))
            .col_expr(refresh_token::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(refresh_token::Column::MemberId.eq(member.id))
            .exec(&*self.db)
            .await?;

        if replaced.rows_affected == 0 {
            let now = Utc::now();
            let inserted = refresh_token::ActiveModel {
                id: Set(Uuid::new_v4()),
                member_id: Set(member.id),
                token_id: Set(jti.clone()),
                expires_at: Set(expires_at),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&*self.db)
            .await;

            if let Err(err) = inserted {
                let err = ServiceError::from(err);
                if !err.is_unique_violation() {
                    return Err(err.into());
                }
                // A concurrent login inserted the row first; take it over.
                refresh_token::Entity::update_many()
                    .col_expr(refresh_token::Column::TokenId, Expr::value(jti.clone()))
                    .col_expr(refresh_token::Column::ExpiresAt, Expr::value(expires_at))
                    .filter(refresh_token::Column::MemberId.eq(member.id))
                    .exec(&*self.db)
                    .await?;
            }
        }

        info!(member_id = %member.id, "tokens issued");
        self.token_pair(member, &jti)
    }

    fn decode(&self, token: &str, expected: TokenType) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.config.jwt_audience]);
        validation.set_issuer(&[&self.config.jwt_issuer]);

        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
            _ => AuthError::InvalidToken,
        })?
        .claims;

        if claims.token_type != expected {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    /// Validates an access token without touching the database.
    pub fn validate(&self, access_token: &str) -> Result<AuthUser, AuthError> {
        let claims = self.decode(access_token, TokenType::Access)?;
        if self.revoked.contains_key(&claims.jti) {
            return Err(AuthError::RevokedToken);
        }
        let member_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)?;
        Ok(AuthUser {
            member_id,
            email: claims.email,
            roles: claims.roles,
            token_id: claims.jti,
            expires_at: claims.exp,
        })
    }

    /// Exchanges a refresh token for a new pair. The presented token stops
    /// working immediately; presenting it again fails.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self
            .decode(refresh_token, TokenType::Refresh)
            .map_err(|_| AuthError::InvalidRefreshToken)?;
        let member_id =
            Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidRefreshToken)?;

        let member = match self.members.find_member_by_id(member_id).await {
            Ok(member) => member,
            Err(ServiceError::MemberNotFound(_)) => return Err(AuthError::InvalidRefreshToken),
            Err(err) => return Err(err.into()),
        };

        let next_jti = Uuid::new_v4().to_string();
        let rotated = refresh_token::Entity::update_many()
            .col_expr(refresh_token::Column::TokenId, Expr::value(next_jti.clone()))
            .col_expr(refresh_token::Column::ExpiresAt, Expr::value(self.refresh_expiry()?))
            .col_expr(refresh_token::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(refresh_token::Column::MemberId.eq(member_id))
            .filter(refresh_token::Column::TokenId.eq(claims.jti.as_str()))
            .filter(refresh_token::Column::ExpiresAt.gt(Utc::now()))
            .exec(&*self.db)
            .await?;

        if rotated.rows_affected != 1 {
            counter!("storefront.auth.refresh_replays", 1);
            warn!(member_id = %member_id, "stale refresh token presented");
            return Err(AuthError::InvalidRefreshToken);
        }

        debug!(member_id = %member_id, "refresh token rotated");
        self.token_pair(&member, &next_jti)
    }

    pub async fn login(&self, credentials: LoginCredentials) -> Result<TokenPair, AuthError> {
        let member = self
            .members
            .verify_credentials(&credentials.email, &credentials.password)
            .await
            .map_err(|err| match err {
                ServiceError::Unauthorized(_) => AuthError::InvalidCredentials,
                other => AuthError::Service(other),
            })?;
        self.issue_tokens(&member).await
    }

    pub async fn social_login(&self, profile: SocialProfile) -> Result<TokenPair, AuthError> {
        let member = self.members.find_or_create_by_social(profile).await?;
        self.issue_tokens(&member).await
    }

    /// Drops the member's refresh token and revokes the presented access token.
    pub async fn logout(&self, user: &AuthUser) -> Result<(), AuthError> {
        refresh_token::Entity::delete_many()
            .filter(refresh_token::Column::MemberId.eq(user.member_id))
            .exec(&*self.db)
            .await?;

        let now = Utc::now().timestamp();
        self.revoked.retain(|_, expires_at| *expires_at > now);
        self.revoked.insert(user.token_id.clone(), user.expires_at);
        info!(member_id = %user.member_id, "member logged out");
        Ok(())
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidToken)?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::InvalidToken)
}

/// Authentication middleware that validates the bearer token and attaches an [`AuthUser`]
pub async fn auth_middleware(mut request: Request, next: Next) -> Response {
    let auth_service = match request.extensions().get::<Arc<AuthService>>() {
        Some(service) => service.clone(),
        None => {
            return AuthError::Service(ServiceError::InternalError(
                "authentication service not available".into(),
            ))
            .into_response()
        }
    };

    match bearer_token(request.headers()).and_then(|token| auth_service.validate(token)) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Role middleware to check if a user has the required role
pub async fn role_middleware(
    State(required_role): State<String>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or(AuthError::MissingToken)?;
    if !user.has_role(&required_role) {
        return Err(AuthError::Forbidden);
    }
    Ok(next.run(request).await)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AuthError::MissingToken)
    }
}

/// Extension methods for Router to add auth middleware
pub trait AuthRouterExt {
    fn with_auth(self) -> Self;
    fn with_role(self, role: &str) -> Self;
}

impl<S> AuthRouterExt for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_auth(self) -> Self {
        self.layer(axum::middleware::from_fn(auth_middleware))
    }

    fn with_role(self, role: &str) -> Self {
        self.layer(axum::middleware::from_fn_with_state(
            role.to_string(),
            role_middleware,
        ))
        .with_auth()
    }
}

/// Authentication routes, mounted under `/auth`
pub fn auth_routes() -> Router<AppState> {
    let public = Router::new()
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/refresh", post(refresh_token_handler))
        .route("/verify-email", get(verify_email_handler))
        .route("/oauth2/:provider/authorize", get(oauth2_authorize_handler))
        .route("/oauth2/:provider/callback", get(oauth2_callback_handler));

    let authenticated = Router::new()
        .route("/logout", post(logout_handler))
        .with_auth();

    public
        .merge(authenticated)
        .layer(DefaultBodyLimit::max(1024 * 64))
}

#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterMemberRequest,
    responses(
        (status = 201, description = "Member registered", body = MemberResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterMemberRequest>,
) -> Result<(StatusCode, Json<MemberResponse>), ServiceError> {
    let member = state.services.members.register(request).await?;
    Ok((StatusCode::CREATED, Json(member.into())))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginCredentials,
    responses(
        (status = 200, description = "Token pair issued", body = TokenPair),
        (status = 401, description = "Invalid credentials", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login_handler(
    State(state): State<AppState>,
    Json(credentials): Json<LoginCredentials>,
) -> Result<Json<TokenPair>, AuthError> {
    Ok(Json(state.auth.login(credentials).await?))
}

#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshTokenRequest,
    responses(
        (status = 200, description = "Rotated token pair", body = TokenPair),
        (status = 401, description = "Refresh token invalid or already used", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn refresh_token_handler(
    State(state): State<AppState>,
    Json(request): Json<RefreshTokenRequest>,
) -> Result<Json<TokenPair>, AuthError> {
    Ok(Json(state.auth.refresh(&request.refresh_token).await?))
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 204, description = "Logged out"),
        (status = 401, description = "Not authenticated", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn logout_handler(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<StatusCode, AuthError> {
    state.auth.logout(&user).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct VerifyEmailQuery {
    pub token: String,
}

#[utoipa::path(
    get,
    path = "/auth/verify-email",
    params(VerifyEmailQuery),
    responses(
        (status = 200, description = "Email verified", body = MemberResponse),
        (status = 400, description = "Link invalid or expired", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn verify_email_handler(
    State(state): State<AppState>,
    Query(query): Query<VerifyEmailQuery>,
) -> Result<Json<MemberResponse>, ServiceError> {
    let member = state.services.members.verify_email(&query.token).await?;
    Ok(Json(member.into()))
}

fn parse_provider(provider: &str) -> Result<SocialType, AuthError> {
    provider
        .parse::<SocialType>()
        .map_err(|_| AuthError::SocialLogin(OAuth2Error::ProviderNotConfigured(provider.to_string())))
}

#[utoipa::path(
    get,
    path = "/auth/oauth2/{provider}/authorize",
    params(("provider" = String, Path, description = "google, kakao or naver")),
    responses(
        (status = 200, description = "Provider authorization URL", body = AuthorizationUrlResponse),
        (status = 404, description = "Provider not configured", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn oauth2_authorize_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<AuthorizationUrlResponse>, AuthError> {
    let provider = parse_provider(&provider)?;
    Ok(Json(state.oauth2.authorization_url(provider).await?))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct OAuth2CallbackQuery {
    pub code: String,
    pub state: String,
}

#[utoipa::path(
    get,
    path = "/auth/oauth2/{provider}/callback",
    params(
        ("provider" = String, Path, description = "google, kakao or naver"),
        OAuth2CallbackQuery
    ),
    responses(
        (status = 303, description = "Redirect to the frontend with the issued tokens"),
        (status = 400, description = "Unknown or expired state", body = ErrorResponse),
        (status = 502, description = "Provider request failed", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn oauth2_callback_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<OAuth2CallbackQuery>,
) -> Result<Redirect, AuthError> {
    let provider = parse_provider(&provider)?;
    let profile = state
        .oauth2
        .complete_login(provider, query.code, &query.state)
        .await?;
    let tokens = state.auth.social_login(profile).await?;

    // Tokens travel in the fragment so they never reach server logs.
    Ok(Redirect::to(&format!(
        "{}#access_token={}&refresh_token={}&expires_in={}",
        state.config.oauth2_frontend_url(),
        tokens.access_token,
        tokens.refresh_token,
        tokens.expires_in
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn user(roles: &[&str]) -> AuthUser {
        AuthUser {
            member_id: Uuid::new_v4(),
            email: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            token_id: "jti".into(),
            expires_at: 0,
        }
    }

    #[test]
    fn ownership_and_admin_access() {
        let member = user(&["user"]);
        assert!(member.can_access(member.member_id));
        assert!(!member.can_access(Uuid::new_v4()));
        assert!(user(&["admin"]).can_access(Uuid::new_v4()));
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_matches!(bearer_token(&headers), Err(AuthError::MissingToken));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_matches!(bearer_token(&headers), Err(AuthError::InvalidToken));

        headers.insert(header::AUTHORIZATION, "Bearer  tok ".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "tok");
    }

    #[test]
    fn auth_errors_are_unauthorized_except_forbidden() {
        for err in [
            AuthError::InvalidCredentials,
            AuthError::ExpiredToken,
            AuthError::InvalidToken,
            AuthError::InvalidRefreshToken,
            AuthError::RevokedToken,
            AuthError::MemberNotFound,
        ] {
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        }
        assert_eq!(
            AuthError::Forbidden.into_response().status(),
            StatusCode::FORBIDDEN
        );
    }
}
