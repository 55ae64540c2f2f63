//! 会话监管：每个运行中的会话持有一个子 CancellationToken
//!
//! 根 token 被取消（进程关闭）时所有会话一并取消。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    root: CancellationToken,
    sessions: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl SessionSupervisor {
    /// 挂在外部 token（通常是 ShutdownManager::token）之下
    pub fn with_parent(root: CancellationToken) -> Self {
        Self {
            root,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 为会话登记子 token；重复登记返回同一个 token
    pub async fn register(&self, session_id: &str) -> CancellationToken {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 会话结束后移除
    pub async fn release(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}
