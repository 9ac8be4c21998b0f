use std::collections::HashMap;
use std::sync::Arc;

use super::OutboxHandler;

/// 按事件类型注册的处理器
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同一事件类型后注册的覆盖先注册的
    pub fn register(mut self, event_type: impl Into<String>, handler: Arc<dyn OutboxHandler>) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    /// 为多个事件类型注册同一个处理器
    pub fn register_many<I, T>(mut self, event_types: I, handler: Arc<dyn OutboxHandler>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for event_type in event_types {
            self.handlers.insert(event_type.into(), Arc::clone(&handler));
        }
        self
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn OutboxHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
