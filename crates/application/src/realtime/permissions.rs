use std::collections::HashMap;

use async_trait::async_trait;
use domain::UserId;

use super::HubError;

/// 解析用户可以订阅的房间
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    async fn authorized_rooms(&self, user_id: UserId) -> Result<Vec<String>, HubError>;
}

/// 固定授权表
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    rooms: HashMap<UserId, Vec<String>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user_id: UserId, room: impl Into<String>) -> Self {
        self.rooms.entry(user_id).or_default().push(room.into());
        self
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissions {
    async fn authorized_rooms(&self, user_id: UserId) -> Result<Vec<String>, HubError> {
        Ok(self.rooms.get(&user_id).cloned().unwrap_or_default())
    }
}
