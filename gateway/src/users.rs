use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    User,
    Viewer,
}

impl Role {
    pub fn parse(value: &str) -> Self {
        match value {
            "admin" | "Admin" => Role::Admin,
            "manager" | "Manager" => Role::Manager,
            "viewer" | "Viewer" => Role::Viewer,
            _ => Role::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::User => "user",
            Role::Viewer => "viewer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl TeamRole {
    pub fn parse(value: &str) -> Self {
        match value {
            "owner" | "Owner" => TeamRole::Owner,
            "admin" | "Admin" => TeamRole::Admin,
            "viewer" | "Viewer" => TeamRole::Viewer,
            _ => TeamRole::Member,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// OIDC subject at the external IdP.
    pub external_subject: Option<String>,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TeamMembership {
    pub team_id: Uuid,
    pub role: TeamRole,
}

#[derive(Clone)]
pub struct UserStore {
    pool: PgPool,
}

impl UserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_external_subject(
        &self,
        subject: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, email, external_subject, role, active, created_at \
             FROM users WHERE external_subject = $1 AND deleted_at IS NULL",
        )
        .bind(subject)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_user))
    }

    /// Auto-provision on first OIDC login. The inferred IdP name is stored
    /// as advisory metadata only and never consulted for authorization.
    pub async fn provision(
        &self,
        subject: &str,
        email: &str,
        idp_hint: Option<&str>,
    ) -> Result<User, sqlx::Error> {
        let id = Uuid::new_v4();
        let row = sqlx::query(
            "INSERT INTO users (id, email, external_subject, role, active, oauth_provider, created_at) \
             VALUES ($1, $2, $3, 'user', TRUE, $4, NOW()) \
             ON CONFLICT (external_subject) DO UPDATE SET email = EXCLUDED.email \
             RETURNING id, email, external_subject, role, active, created_at",
        )
        .bind(id)
        .bind(email)
        .bind(subject)
        .bind(idp_hint)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_user(row))
    }

    pub async fn memberships(&self, user_id: Uuid) -> Result<Vec<TeamMembership>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT team_id, role FROM team_members WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| TeamMembership {
                team_id: row.get("team_id"),
                role: TeamRole::parse(row.get::<String, _>("role").as_str()),
            })
            .collect())
    }
}

fn row_to_user(row: sqlx::postgres::PgRow) -> User {
    User {
        id: row.get("id"),
        email: row.get("email"),
        external_subject: row.get("external_subject"),
        role: Role::parse(row.get::<String, _>("role").as_str()),
        active: row.get("active"),
        created_at: row.get("created_at"),
    }
}

/// Advisory-only inference of the upstream IdP from an email domain.
pub fn infer_idp_from_email(email: &str) -> Option<&'static str> {
    let domain = email.rsplit_once('@')?.1.to_ascii_lowercase();
    match domain.as_str() {
        "gmail.com" | "googlemail.com" => Some("google"),
        "outlook.com" | "hotmail.com" | "live.com" => Some("microsoft"),
        _ => None,
    }
}
