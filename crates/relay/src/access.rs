// Project membership checks for document sessions.
//
// Authentication happens upstream; by the time a session reaches the relay
// it carries a user id, and this module only answers "may this user open /
// edit documents of this project".

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("membership lookup failed: {0}")]
    Backend(String),

    #[error("invalid project role `{0}` in database")]
    InvalidRole(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectRole {
    Owner,
    Editor,
    Viewer,
}

impl ProjectRole {
    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Self::Owner),
            "editor" => Some(Self::Editor),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    pub fn can_edit(self) -> bool {
        matches!(self, Self::Owner | Self::Editor)
    }
}

#[derive(Clone)]
pub enum AccessPolicy {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<(Uuid, Uuid), ProjectRole>>>),
    /// Everyone edits everything. Only for database-less development runs.
    Open,
}

impl AccessPolicy {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Grant `role` on `project_id` to `user_id`. No-op for other backends.
    pub async fn grant(&self, project_id: Uuid, user_id: Uuid, role: ProjectRole) {
        if let Self::Memory(members) = self {
            members.write().await.insert((project_id, user_id), role);
        }
    }

    pub async fn role_for_user(
        &self,
        project_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ProjectRole>, AccessError> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, String>(
                r#"
SELECT role
FROM project_memberships
WHERE project_id = $1
  AND user_id = $2
                "#,
            )
            .bind(project_id)
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .map_err(|error| AccessError::Backend(error.to_string()))?
            .map(|role| ProjectRole::from_db_value(&role).ok_or(AccessError::InvalidRole(role)))
            .transpose(),
            Self::Memory(members) => Ok(members.read().await.get(&(project_id, user_id)).copied()),
            Self::Open => Ok(Some(ProjectRole::Editor)),
        }
    }
}
