//! 缓存键约定。前缀由 [`super::CacheAside`] 统一添加。

use std::fmt::Display;

/// 实体键：`{kind}:{id}`
pub fn entity(kind: &str, id: impl Display) -> String {
    format!("{kind}:{id}")
}

/// 查询键：`q:{name}:{p1}:{p2}...`，参数顺序即键的一部分
pub fn query<I, P>(name: &str, params: I) -> String
where
    I: IntoIterator<Item = P>,
    P: Display,
{
    let mut key = format!("q:{name}");
    for param in params {
        key.push(':');
        key.push_str(&param.to_string());
    }
    key
}

/// 标签键：`tag:{kind}:{id}`
pub fn tag(kind: &str, id: impl Display) -> String {
    format!("tag:{kind}:{id}")
}

/// 版本计数键：`rev:{scope}`
pub fn revision(scope: impl Display) -> String {
    format!("rev:{scope}")
}
