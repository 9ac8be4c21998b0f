//! 领域模型错误定义
//!
//! 定义了任务领域中可能出现的错误类型，提供清晰的错误上下文。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },

    /// 业务规则违反错误
    #[error("业务规则违反: {rule}")]
    BusinessRuleViolation { rule: String },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建业务规则违反错误
    pub fn business_rule_violation(rule: impl Into<String>) -> Self {
        Self::BusinessRuleViolation { rule: rule.into() }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 仓储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("记录不存在")]
    NotFound,

    #[error("数据冲突: {0}")]
    Conflict(String),

    #[error("存储错误: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
