//! Member accounts: registration, credential checks, social sign-up and
//! email verification.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration as ChronoDuration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        email_verification,
        member::{self, MemberRole, SocialType},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::mail::{MailDispatcher, MailMessage},
};

const VERIFICATION_TOKEN_LEN: usize = 48;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RegisterMemberRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[validate(length(min = 1, max = 50))]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MemberResponse {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: MemberRole,
    pub social_type: Option<SocialType>,
    pub email_verified: bool,
    pub created_at: chrono::DateTime<Utc>,
}

impl From<member::Model> for MemberResponse {
    fn from(m: member::Model) -> Self {
        Self {
            id: m.id,
            email: m.email,
            name: m.name,
            role: m.role,
            social_type: m.social_type,
            email_verified: m.email_verified,
            created_at: m.created_at,
        }
    }
}

/// Identity asserted by a social login provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocialProfile {
    pub social_type: SocialType,
    pub social_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MemberSettings {
    pub verification_ttl: Duration,
    /// Lowercased emails granted the admin role at registration
    pub admin_emails: Vec<String>,
    /// Base URL the verification token is appended to in outgoing mail
    pub verification_url: String,
}

pub fn hash_password(password: &str) -> Result<String, ServiceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ServiceError::HashError(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone)]
pub struct MemberService {
    db: Arc<DatabaseConnection>,
    mailer: Arc<dyn MailDispatcher>,
    event_sender: Option<Arc<EventSender>>,
    settings: MemberSettings,
}

impl MemberService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        mailer: Arc<dyn MailDispatcher>,
        event_sender: Option<Arc<EventSender>>,
        settings: MemberSettings,
    ) -> Self {
        Self {
            db,
            mailer,
            event_sender,
            settings,
        }
    }

    #[instrument(skip(self, request), fields(email = %request.email))]
    pub async fn register(&self, request: RegisterMemberRequest) -> Result<member::Model, ServiceError> {
        request.validate()?;
        let email = normalize_email(&request.email);

        if self.find_member_by_email(&email).await?.is_some() {
            return Err(ServiceError::Conflict("email is already registered".into()));
        }

        let role = if self.settings.admin_emails.contains(&email) {
            MemberRole::Admin
        } else {
            MemberRole::User
        };

        let member = member::ActiveModel {
            email: Set(email),
            name: Set(request.name.trim().to_string()),
            password_hash: Set(Some(hash_password(&request.password)?)),
            role: Set(role),
            social_type: Set(None),
            social_id: Set(None),
            email_verified: Set(false),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(|err| {
            let err = ServiceError::from(err);
            if err.is_unique_violation() {
                ServiceError::Conflict("email is already registered".into())
            } else {
                err
            }
        })?;

        info!(member_id = %member.id, role = member.role.as_str(), "member registered");
        self.announce_registration(member.id).await;
        self.issue_email_verification(&member).await?;
        Ok(member)
    }

    /// Checks an email / password pair. Unknown emails, social-only accounts
    /// and wrong passwords are indistinguishable to the caller.
    pub async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<member::Model, ServiceError> {
        let invalid = || ServiceError::Unauthorized("invalid credentials".into());
        let member = self
            .find_member_by_email(&normalize_email(email))
            .await?
            .ok_or_else(invalid)?;
        let hash = member.password_hash.as_deref().ok_or_else(invalid)?;
        if verify_password(password, hash) {
            Ok(member)
        } else {
            Err(invalid())
        }
    }

    pub async fn find_member_by_id(&self, member_id: Uuid) -> Result<member::Model, ServiceError> {
        member::Entity::find_by_id(member_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::MemberNotFound(member_id.to_string()))
    }

    pub async fn find_member_by_email(
        &self,
        email: &str,
    ) -> Result<Option<member::Model>, ServiceError> {
        Ok(member::Entity::find()
            .filter(member::Column::Email.eq(normalize_email(email)))
            .one(&*self.db)
            .await?)
    }

    async fn find_by_social(
        &self,
        social_type: SocialType,
        social_id: &str,
    ) -> Result<Option<member::Model>, ServiceError> {
        Ok(member::Entity::find()
            .filter(member::Column::SocialType.eq(social_type))
            .filter(member::Column::SocialId.eq(social_id))
            .one(&*self.db)
            .await?)
    }

    /// Resolves the member behind a social identity.
    ///
    /// An existing account with the same email is linked to the identity
    /// instead of creating a duplicate.
    #[instrument(skip(self, profile), fields(social_type = %profile.social_type))]
    pub async fn find_or_create_by_social(
        &self,
        profile: SocialProfile,
    ) -> Result<member::Model, ServiceError> {
        if let Some(member) = self
            .find_by_social(profile.social_type, &profile.social_id)
            .await?
        {
            return Ok(member);
        }

        let email = profile.email.as_deref().map(normalize_email);
        if let Some(email) = &email {
            if let Some(existing) = self.find_member_by_email(email).await? {
                let mut active: member::ActiveModel = existing.into();
                active.social_type = Set(Some(profile.social_type));
                active.social_id = Set(Some(profile.social_id.clone()));
                active.email_verified = Set(true);
                let linked = active.update(&*self.db).await?;
                info!(member_id = %linked.id, "social identity linked to existing member");
                return Ok(linked);
            }
        }

        let email = email.unwrap_or_else(|| {
            format!("{}@{}.social.invalid", profile.social_id, profile.social_type)
        });
        let inserted = member::ActiveModel {
            role: Set(if self.settings.admin_emails.contains(&email) {
                MemberRole::Admin
            } else {
                MemberRole::User
            }),
            email: Set(email),
            name: Set(profile
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("{} member", profile.social_type))),
            password_hash: Set(None),
            social_type: Set(Some(profile.social_type)),
            social_id: Set(Some(profile.social_id.clone())),
            email_verified: Set(profile.email.is_some()),
            ..Default::default()
        }
        .insert(&*self.db)
        .await;

        match inserted {
            Ok(member) => {
                info!(member_id = %member.id, "member registered through social login");
                self.announce_registration(member.id).await;
                Ok(member)
            }
            Err(err) => {
                let err = ServiceError::from(err);
                if !err.is_unique_violation() {
                    return Err(err);
                }
                // A concurrent callback for the same identity created it first.
                self.find_by_social(profile.social_type, &profile.social_id)
                    .await?
                    .ok_or(err)
            }
        }
    }

    /// Persists a verification token and mails it without waiting for delivery.
    pub async fn issue_email_verification(
        &self,
        member: &member::Model,
    ) -> Result<email_verification::Model, ServiceError> {
        let ttl = ChronoDuration::from_std(self.settings.verification_ttl)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(VERIFICATION_TOKEN_LEN)
            .map(char::from)
            .collect();
        let now = Utc::now();

        let verification = email_verification::ActiveModel {
            id: Set(Uuid::new_v4()),
            member_id: Set(member.id),
            token: Set(token),
            expires_at: Set(now + ttl),
            verified_at: Set(None),
            created_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        let message = MailMessage {
            to: member.email.clone(),
            subject: "Verify your email address".into(),
            body: format!(
                "Hello {},\n\nConfirm your address by opening {}?token={}\n",
                member.name, self.settings.verification_url, verification.token
            ),
        };
        let mailer = self.mailer.clone();
        let member_id = member.id;
        tokio::spawn(async move {
            if let Err(err) = mailer.send(message).await {
                warn!(member_id = %member_id, error = %err, "verification mail not sent");
            }
        });

        Ok(verification)
    }

    #[instrument(skip(self, token))]
    pub async fn verify_email(&self, token: &str) -> Result<member::Model, ServiceError> {
        let now = Utc::now();
        let verification = email_verification::Entity::find()
            .filter(email_verification::Column::Token.eq(token))
            .one(&*self.db)
            .await?
            .filter(|v| v.is_usable(now))
            .ok_or_else(|| {
                ServiceError::ValidationError("verification link is invalid or expired".into())
            })?;

        let claimed = email_verification::Entity::update_many()
            .col_expr(email_verification::Column::VerifiedAt, Expr::value(now))
            .filter(email_verification::Column::Id.eq(verification.id))
            .filter(email_verification::Column::VerifiedAt.is_null())
            .exec(&*self.db)
            .await?;
        if claimed.rows_affected != 1 {
            return Err(ServiceError::ValidationError(
                "verification link is invalid or expired".into(),
            ));
        }

        let member = self.find_member_by_id(verification.member_id).await?;
        let mut active: member::ActiveModel = member.into();
        active.email_verified = Set(true);
        let member = active.update(&*self.db).await.map_err(|e| {
            error!(member_id = %verification.member_id, error = %e, "failed to mark email verified");
            ServiceError::from(e)
        })?;
        info!(member_id = %member.id, "email verified");
        Ok(member)
    }

    async fn announce_registration(&self, member_id: Uuid) {
        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::MemberRegistered { member_id })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::mail::MockMailDispatcher};
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    async fn service_with(mailer: MockMailDispatcher) -> MemberService {
        let pool = db::establish_connection_with_config(&db::DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        db::run_migrations(&pool).await.unwrap();
        MemberService::new(
            Arc::new(pool),
            Arc::new(mailer),
            None,
            MemberSettings {
                verification_ttl: Duration::from_secs(3_600),
                admin_emails: vec![],
                verification_url: "http://localhost/verify".into(),
            },
        )
    }

    fn request(email: &str) -> RegisterMemberRequest {
        RegisterMemberRequest {
            email: email.into(),
            password: "correct horse battery".into(),
            name: "Kim".into(),
        }
    }

    #[tokio::test]
    async fn registration_sends_one_verification_mail() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mailer = MockMailDispatcher::new();
        mailer.expect_send().times(1).returning(move |message| {
            let _ = tx.send(message);
            Ok(())
        });
        let service = service_with(mailer).await;

        let member = service.register(request("Kim@Shop.Example")).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.to, "kim@shop.example");
        assert!(message.body.starts_with("Hello Kim,"));
        assert!(message.body.contains("http://localhost/verify?token="));
        assert!(!member.email_verified);
    }

    #[tokio::test]
    async fn failed_mail_does_not_fail_registration() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mailer = MockMailDispatcher::new();
        mailer.expect_send().times(1).returning(move |_| {
            let _ = tx.send(());
            Err(ServiceError::InternalError("smtp down".into()))
        });
        let service = service_with(mailer).await;

        service.register(request("lee@shop.example")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_matches!(
            service.register(request("LEE@shop.example")).await,
            Err(ServiceError::Conflict(_))
        );
    }

    #[test]
    fn password_hashes_verify_and_are_salted() {
        let first = hash_password("correct horse").unwrap();
        let second = hash_password("correct horse").unwrap();
        assert_ne!(first, second);
        assert!(verify_password("correct horse", &first));
        assert!(!verify_password("wrong horse", &first));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[test]
    fn emails_are_case_insensitive() {
        assert_eq!(normalize_email("  Kim@Shop.Example "), "kim@shop.example");
    }
}
