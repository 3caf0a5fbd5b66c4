//! 本地处理器注册表
//!
//! 每个处理器负责一个意图（intent），由 HandlerRegistry 按名注册与查找。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::session::Command;
use crate::core::HiveError;
use crate::memory::{RankedResults, Tier};
use crate::voice::LOCAL_VERBS;

/// 本地处理器：意图名 + 异步处理，返回要播报的回复
#[async_trait]
pub trait LocalHandler: Send + Sync {
    fn intent(&self) -> &str;

    async fn handle(&self, command: &Command, context: &RankedResults) -> Result<String, HiveError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn LocalHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置动词处理器（open / close / save / build / run / test）
    pub fn with_builtin_verbs() -> Self {
        let mut r = Self::new();
        for verb in LOCAL_VERBS {
            r.register(VerbHandler::new(verb));
        }
        r
    }

    pub fn register(&mut self, handler: impl LocalHandler + 'static) {
        let intent = handler.intent().to_string();
        self.handlers.insert(intent, Arc::new(handler));
    }

    pub fn get(&self, intent: &str) -> Option<Arc<dyn LocalHandler>> {
        self.handlers.get(intent).cloned()
    }

    pub fn contains(&self, intent: &str) -> bool {
        self.handlers.contains_key(intent)
    }

    pub fn intents(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

/// 内置动词：只确认动作，不真正操作文件或进程
pub struct VerbHandler {
    verb: String,
}

impl VerbHandler {
    pub fn new(verb: &str) -> Self {
        Self {
            verb: verb.to_string(),
        }
    }

    fn progressive(&self) -> String {
        match self.verb.as_str() {
            "close" => "Closing".to_string(),
            "save" => "Saving".to_string(),
            "run" => "Running".to_string(),
            "build" => "Building".to_string(),
            "test" => "Testing".to_string(),
            "open" => "Opening".to_string(),
            other => {
                let mut chars = other.chars();
                match chars.next() {
                    Some(c) => format!("{}{}ing", c.to_uppercase(), chars.as_str()),
                    None => String::new(),
                }
            }
        }
    }
}

#[async_trait]
impl LocalHandler for VerbHandler {
    fn intent(&self) -> &str {
        &self.verb
    }

    async fn handle(&self, command: &Command, context: &RankedResults) -> Result<String, HiveError> {
        let target = if command.arguments.is_empty() {
            "now".to_string()
        } else {
            command.arguments.clone()
        };
        // 热层命中同一句话，说明最近做过
        let repeated = context
            .records
            .iter()
            .any(|r| r.tier == Tier::Hot && r.record.key == command.utterance.normalized());
        let again = if repeated { " again" } else { "" };
        Ok(format!("{} {}{}.", self.progressive(), target, again))
    }
}
