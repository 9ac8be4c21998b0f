use application::{HubError, PermissionProvider};
use async_trait::async_trait;
use domain::{UserId, WorkspaceId};
use sqlx::PgPool;
use uuid::Uuid;

/// 以工作区成员关系作为房间授权：用户可以订阅自己所属的每个工作区
#[derive(Clone)]
pub struct PgWorkspaceMembership {
    pool: PgPool,
}

impl PgWorkspaceMembership {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn add_member(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO workspace_members (workspace_id, user_id) VALUES ($1, $2)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(workspace_id.as_uuid())
        .bind(user_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PermissionProvider for PgWorkspaceMembership {
    async fn authorized_rooms(&self, user_id: UserId) -> Result<Vec<String>, HubError> {
        let workspaces: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT workspace_id FROM workspace_members WHERE user_id = $1 ORDER BY workspace_id"#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|err| HubError::Permission(err.to_string()))?;

        Ok(workspaces.into_iter().map(|id| id.to_string()).collect())
    }
}
