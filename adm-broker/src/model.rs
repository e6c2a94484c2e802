//! Data model: the entities tracked by the broker.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub type WorkspaceId = SmolStr;
pub type ClientId = SmolStr;
pub type TaskId = SmolStr;
pub type BridgeId = SmolStr;

/// Sentinel `client_id` used by an [`InflightTask`] that has no owning agent yet
/// (the task is sitting in the pending queue or awaiting re-dispatch).
pub const PENDING_OWNER: &str = "pending";

/// A frame pushed to an agent or bridge. Opaque to the broker beyond its `type`
/// discriminator; callers build this as a JSON object.
pub type Frame = serde_json::Value;

/// Outbound half of a transport: "can send a frame; reports terminal error"
/// Backed by the outbound half of the connection's WebSocket writer task;
/// a closed receiver means the transport is dead.
pub type OutboundSender = mpsc::Sender<Frame>;

/// A connected, possibly-unauthenticated IDE/CLI agent.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub client_id: ClientId,
    pub workspace_id: WorkspaceId,
    pub surface_type: SmolStr,
    pub authenticated: bool,
    pub last_heartbeat: tokio::time::Instant,
    pub connected_at: tokio::time::Instant,
    pub outbound: OutboundSender,
}

impl AgentSession {
    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = tokio::time::Instant::now();
    }
}

/// A bridge control channel.
#[derive(Debug, Clone)]
pub struct BridgeControl {
    pub bridge_id: BridgeId,
    pub owner_user_id: Option<SmolStr>,
    pub outbound: OutboundSender,
}

/// A task awaiting pickup by an agent, held in a per-workspace FIFO.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub task_id: TaskId,
    pub workspace_id: WorkspaceId,
    pub payload: Frame,
    pub target_client_id: Option<ClientId>,
    pub attempts: u32,
    pub created_at: tokio::time::Instant,
}

impl PendingTask {
    pub fn new(task_id: TaskId, workspace_id: WorkspaceId, payload: Frame, target_client_id: Option<ClientId>) -> Self {
        Self {
            task_id,
            workspace_id,
            payload,
            target_client_id,
            attempts: 0,
            created_at: tokio::time::Instant::now(),
        }
    }

    /// `agent_id` carried by the payload, used by reserve-time `surface_type`
    /// filtering, treated as authoritative only when present (see DESIGN.md
    /// for the corresponding decision).
    pub fn payload_agent_id(&self) -> Option<&str> {
        self.payload.get("agent_id").and_then(|v| v.as_str())
    }
}

/// A single-shot completion handle for `dispatch_and_wait`. Wraps a
/// `oneshot::Sender` so repeated `set` calls are no-ops by construction
/// (the channel can only be consumed once).
#[derive(Debug)]
pub struct ResultSlot(pub Option<oneshot::Sender<DispatchResult>>);

impl ResultSlot {
    pub fn new() -> (Self, oneshot::Receiver<DispatchResult>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Idempotent set: a slot already consumed silently drops the new value.
    pub fn set(&mut self, result: DispatchResult) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(result);
        }
    }

    pub fn is_live(&self) -> bool {
        self.0.is_some()
    }
}

/// Outcome of `dispatch_and_wait`, also the shape returned to REST `submit`
/// callers and carried in an agent's client→server `result` frame.
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub execution_id: TaskId,
    pub status: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<Object>))]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_created: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub governance: serde_json::Map<String, serde_json::Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl DispatchResult {
    pub fn failure(execution_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            execution_id,
            status: SmolStr::new_static("failed"),
            output: None,
            duration_seconds: None,
            tool_calls: Vec::new(),
            files_modified: Vec::new(),
            files_created: Vec::new(),
            error: Some(error.into()),
            governance: serde_json::Map::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn timeout(execution_id: TaskId, timeout_secs: u64) -> Self {
        let mut result = Self::failure(execution_id, format!("No result received within {timeout_secs}s"));
        result.status = SmolStr::new_static("timeout");
        result
    }

    pub fn is_completed(&self) -> bool {
        self.status.as_str() == "completed"
    }
}

/// task-id → {owning agent, payload snapshot, result future, ack flag,
/// dispatched-at}.
pub struct InflightTask {
    pub task_id: TaskId,
    pub workspace_id: WorkspaceId,
    /// [`PENDING_OWNER`] while awaiting pickup.
    pub client_id: ClientId,
    pub result_slot: ResultSlot,
    /// Retained so the task can be re-queued verbatim on disconnect.
    pub payload: Frame,
    pub acked: bool,
    pub dispatched_at: tokio::time::Instant,
}

/// Poll-mode counterpart of an `InflightTask` held under a lease.
pub struct ReservedTask {
    pub task: PendingTask,
    pub client_id: ClientId,
    pub lease_id: SmolStr,
    pub lease_deadline: tokio::time::Instant,
    pub cumulative_lease: std::time::Duration,
    pub acked: bool,
}

impl ReservedTask {
    pub fn is_expired(&self, now: tokio::time::Instant) -> bool {
        now >= self.lease_deadline
    }

    /// Extend the deadline by `extra` from the current deadline (not from
    /// `now`), accumulating it toward the lease cap. Returns `false`
    /// (without mutating) if the cap would be exceeded.
    pub fn try_extend(&mut self, extra: std::time::Duration, cap: std::time::Duration, now: tokio::time::Instant) -> bool {
        if self.cumulative_lease + extra > cap {
            return false;
        }
        self.cumulative_lease += extra;
        self.lease_deadline = self.lease_deadline.max(now) + extra;
        true
    }
}

/// Bounded FIFO of completed task-ids for idempotency.
/// Insert/evict/lookup are all O(1) amortized: a `VecDeque` carries insertion
/// order, a side `HashSet` gives membership tests without a linear scan.
pub struct CompletedSet {
    order: VecDeque<TaskId>,
    member: std::collections::HashSet<TaskId>,
    max_size: usize,
}

impl CompletedSet {
    pub fn new(max_size: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(max_size.min(1024)),
            member: std::collections::HashSet::new(),
            max_size,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.member.contains(task_id)
    }

    /// Inserts `task_id`, evicting the oldest entries until the set fits
    /// within `max_size`. A re-insert of an already-present id is
    /// a no-op (does not bump its position).
    pub fn insert(&mut self, task_id: TaskId) {
        if self.member.contains(&task_id) {
            return;
        }
        self.member.insert(task_id.clone());
        self.order.push_back(task_id);
        while self.order.len() > self.max_size {
            if let Some(evicted) = self.order.pop_front() {
                self.member.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Generates fresh ids/nonces/lease-ids. A thin wrapper so call
/// sites read intent rather than `Uuid::new_v4().to_string()` everywhere.
pub fn generate_id() -> SmolStr {
    SmolStr::new(Uuid::new_v4().to_string())
}

pub fn now_wall_clock() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Boundary: the completed set wraps at `max_size + 1`; the oldest id
    /// is evicted and no longer counts as a duplicate.
    #[test]
    fn completed_set_wraps_and_evicts_oldest() {
        let mut completed = CompletedSet::new(2);
        completed.insert("a".into());
        completed.insert("b".into());
        completed.insert("c".into());

        assert_eq!(completed.len(), 2);
        assert!(!completed.contains("a"), "oldest id evicted once the set wraps");
        assert!(completed.contains("b"));
        assert!(completed.contains("c"));
    }

    #[test]
    fn completed_set_reinsert_is_a_no_op() {
        let mut completed = CompletedSet::new(2);
        completed.insert("a".into());
        completed.insert("a".into());
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn result_slot_set_is_idempotent() {
        let (mut slot, mut rx) = ResultSlot::new();
        assert!(slot.is_live());

        slot.set(DispatchResult::failure("e1".into(), "first"));
        assert!(!slot.is_live());
        // Second set is a silent no-op; the channel was already consumed.
        slot.set(DispatchResult::failure("e1".into(), "second"));

        let result = rx.try_recv().expect("first set delivered");
        assert_eq!(result.error.as_deref(), Some("first"));
    }

    #[test]
    fn reserved_task_try_extend_respects_cap() {
        let pending = PendingTask::new("e1".into(), "w1".into(), serde_json::json!({}), None);
        let now = tokio::time::Instant::now();
        let original_deadline = now + std::time::Duration::from_secs(60);
        let mut reserved = ReservedTask {
            task: pending,
            client_id: "c1".into(),
            lease_id: "L1".into(),
            lease_deadline: original_deadline,
            cumulative_lease: std::time::Duration::from_secs(60),
            acked: false,
        };

        let cap = std::time::Duration::from_secs(90);
        assert!(!reserved.try_extend(std::time::Duration::from_secs(60), cap, now), "cap would be exceeded");
        assert_eq!(reserved.cumulative_lease, std::time::Duration::from_secs(60), "rejected extend must not mutate");
        assert_eq!(reserved.lease_deadline, original_deadline, "rejected extend must not move the deadline");

        assert!(reserved.try_extend(std::time::Duration::from_secs(20), cap, now));
        assert_eq!(reserved.cumulative_lease, std::time::Duration::from_secs(80));
        assert_eq!(reserved.lease_deadline, original_deadline + std::time::Duration::from_secs(20), "extends from the current deadline, not from `now`");
    }
}
