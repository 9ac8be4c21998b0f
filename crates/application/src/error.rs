use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::cache::CacheError;
use crate::unit_of_work::UnitOfWorkError;

/// 应用层错误类型
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("领域错误: {0}")]
    Domain(#[from] DomainError),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("仓储错误: {0}")]
    Repository(#[from] RepositoryError),

    #[error("工作单元错误: {0}")]
    UnitOfWork(#[from] UnitOfWorkError),

    #[error("缓存错误: {0}")]
    Cache(#[from] CacheError),

    #[error("基础设施错误: {0}")]
    Infrastructure(String),

    #[error("authentication failed")]
    Authentication,

    #[error("authorization failed")]
    Authorization,
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ApplicationError::NotFound(what.into())
    }
}

/// 应用层结果类型
pub type ApplicationResult<T> = Result<T, ApplicationError>;
