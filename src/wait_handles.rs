use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitKind {
    Agent,
    Team,
    Custom,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitHandle {
    pub id: String,
    pub kind: WaitKind,
    pub status: WaitStatus,
    pub start_time: DateTime<Utc>,
    pub timeout_ms: Option<u64>,
    pub metadata: JsonValue,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

struct Slot {
    handle: WaitHandle,
    /// Flipped by a deadline timer; observed cooperatively by long-running
    /// work (the team orchestrator's per-agent loop) rather than used to
    /// actually cancel an in-flight future, per SPEC_FULL.md §4.8.
    timed_out: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

/// Process-wide registry of in-flight async operations, backing every
/// `_async` tool. Grounded in `UnifiedMcpServer`'s `Arc<RwLock<HashMap<...>>>`
/// map-registry idiom (`mcp_server.rs`); the notify-on-completion pattern is
/// new, since the teacher has no wait-handle analog.
pub struct WaitHandleRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl WaitHandleRegistry {
    pub fn new() -> Self {
        WaitHandleRegistry {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new pending handle and, if `timeout_ms` is set, spawns a
    /// timer task that flips the returned `timed_out` flag at the deadline.
    /// Callers doing continuable work should poll that flag; callers doing
    /// simple work can ignore it and let `wait_for` enforce the deadline.
    pub async fn register(
        &self,
        kind: WaitKind,
        metadata: JsonValue,
        timeout_ms: Option<u64>,
    ) -> (String, Arc<AtomicBool>) {
        let id = format!("wh_{}_{}", Utc::now().timestamp_millis(), uuid::Uuid::new_v4());
        let timed_out = Arc::new(AtomicBool::new(false));
        let handle = WaitHandle {
            id: id.clone(),
            kind,
            status: WaitStatus::Pending,
            start_time: Utc::now(),
            timeout_ms,
            metadata,
            result: None,
            error: None,
        };
        let notify = Arc::new(Notify::new());
        self.slots.write().await.insert(
            id.clone(),
            Slot {
                handle,
                timed_out: timed_out.clone(),
                notify,
            },
        );

        if let Some(ms) = timeout_ms {
            let flag = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                flag.store(true, Ordering::SeqCst);
            });
        }

        (id, timed_out)
    }

    pub async fn complete(&self, id: &str, result: JsonValue) -> Result<(), AgentError> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| AgentError::not_found(format!("wait handle '{}'", id)))?;
        if slot.handle.status != WaitStatus::Pending {
            return Err(AgentError::conflict(format!(
                "wait handle '{}' already terminal",
                id
            )));
        }
        slot.handle.status = WaitStatus::Completed;
        slot.handle.result = Some(result);
        slot.notify.notify_waiters();
        Ok(())
    }

    pub async fn fail(&self, id: &str, error_message: String) -> Result<(), AgentError> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| AgentError::not_found(format!("wait handle '{}'", id)))?;
        if slot.handle.status != WaitStatus::Pending {
            return Err(AgentError::conflict(format!(
                "wait handle '{}' already terminal",
                id
            )));
        }
        slot.handle.status = WaitStatus::Failed;
        slot.handle.error = Some(error_message);
        slot.notify.notify_waiters();
        Ok(())
    }

    pub async fn lookup(&self, id: &str) -> Option<WaitHandle> {
        self.slots.read().await.get(id).map(|s| s.handle.clone())
    }

    /// Blocks until the handle reaches a terminal state or `timeout_ms`
    /// elapses, whichever comes first. A caller-side timeout that fires
    /// before the underlying operation finishes returns the still-pending
    /// handle rather than an error.
    pub async fn wait_for(&self, id: &str, timeout_ms: Option<u64>) -> Result<WaitHandle, AgentError> {
        let notify = {
            let slots = self.slots.read().await;
            let slot = slots
                .get(id)
                .ok_or_else(|| AgentError::not_found(format!("wait handle '{}'", id)))?;
            if slot.handle.status != WaitStatus::Pending {
                return Ok(slot.handle.clone());
            }
            slot.notify.clone()
        };

        let wait_fut = notify.notified();
        match timeout_ms {
            Some(ms) => {
                let _ = tokio::time::timeout(Duration::from_millis(ms), wait_fut).await;
            }
            None => wait_fut.await,
        }

        let slots = self.slots.read().await;
        let slot = slots
            .get(id)
            .ok_or_else(|| AgentError::not_found(format!("wait handle '{}'", id)))?;
        Ok(slot.handle.clone())
    }
}

impl Default for WaitHandleRegistry {
    fn default() -> Self {
        WaitHandleRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_then_complete_transitions_status() {
        let registry = WaitHandleRegistry::new();
        let (id, _flag) = registry.register(WaitKind::Agent, json!({}), None).await;
        assert_eq!(registry.lookup(&id).await.unwrap().status, WaitStatus::Pending);
        registry.complete(&id, json!({"ok": true})).await.unwrap();
        let handle = registry.lookup(&id).await.unwrap();
        assert_eq!(handle.status, WaitStatus::Completed);
        assert!(handle.result.is_some());
    }

    #[tokio::test]
    async fn double_completion_is_rejected() {
        let registry = WaitHandleRegistry::new();
        let (id, _flag) = registry.register(WaitKind::Agent, json!({}), None).await;
        registry.complete(&id, json!({})).await.unwrap();
        let err = registry.complete(&id, json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::Conflict(_)));
    }

    #[tokio::test]
    async fn wait_for_unblocks_on_completion() {
        let registry = Arc::new(WaitHandleRegistry::new());
        let (id, _flag) = registry.register(WaitKind::Agent, json!({}), None).await;
        let id_clone = id.clone();
        let registry_clone = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry_clone.complete(&id_clone, json!({"done": true})).await.unwrap();
        });
        let handle = registry.wait_for(&id, Some(1000)).await.unwrap();
        assert_eq!(handle.status, WaitStatus::Completed);
    }

    #[tokio::test]
    async fn timeout_flag_flips_after_deadline() {
        let registry = WaitHandleRegistry::new();
        let (_id, flag) = registry.register(WaitKind::Team, json!({}), Some(10)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(flag.load(Ordering::SeqCst));
    }
}
