//! Broker state and its handler methods. Every method here runs
//! with exclusive access to the whole struct; the single coarse lock is
//! the actor's mailbox itself, not a `Mutex`. See `super::run`.
//!
//! Grounded on the Python mixins this unifies: `ConnectionMixin`,
//! `BridgeControlMixin`, the pending-queue/flush half of
//! `TaskDispatchMixin`, and `LeaseManagerMixin`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use smol_str::SmolStr;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::auth::{AuthOutcome, Verifier};
use crate::config::Conf;
use crate::model::{
    generate_id, now_wall_clock, AgentSession, BridgeControl, ClientId, CompletedSet, DispatchResult, Frame,
    InflightTask, OutboundSender, PendingTask, ReservedTask, ResultSlot, TaskId, WorkspaceId, PENDING_OWNER,
};
use crate::store::TasksStore;

/// Outcome of [`BrokerState::verify_auth`].
pub enum AuthVerifyOutcome {
    Ok { flushed_tasks: usize },
    Failed,
}

/// Ownership failure shared by every push-mode router handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterError {
    Unknown,
    NotOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    AlreadyAcked,
    AlreadyCompleted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    Ok,
    LeaseCapExceeded,
    Rejected,
}

pub enum SubmitOutcome {
    Accepted { workspace_id: Option<WorkspaceId>, duplicate: bool },
    UnknownTask,
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkspaceStatus {
    pub authenticated_count: usize,
    pub unauthenticated_count: usize,
    pub pending_depth: usize,
    pub surface_types: Vec<SmolStr>,
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub workspaces: HashMap<WorkspaceId, WorkspaceStatus>,
    pub inflight_count: usize,
    pub reserved_count: usize,
    pub bridge_count: usize,
    pub completed_count: usize,
}

pub struct BrokerState {
    pub(super) conf: Arc<Conf>,
    pub(super) store: Arc<dyn TasksStore>,
    verifier: Verifier,
    sessions: HashMap<WorkspaceId, HashMap<ClientId, AgentSession>>,
    bridges: HashMap<SmolStr, BridgeControl>,
    pending: HashMap<WorkspaceId, VecDeque<PendingTask>>,
    pending_notify: HashMap<WorkspaceId, Arc<Notify>>,
    inflight: HashMap<TaskId, InflightTask>,
    reserved: HashMap<TaskId, ReservedTask>,
    completed: CompletedSet,
}

impl BrokerState {
    pub fn new(conf: Arc<Conf>, store: Arc<dyn TasksStore>) -> Self {
        let completed_max = conf.completed_max;
        let verifier = Verifier::new(conf.auth_secret.clone(), conf.agent_token.clone());
        Self {
            conf,
            store,
            verifier,
            sessions: HashMap::new(),
            bridges: HashMap::new(),
            pending: HashMap::new(),
            pending_notify: HashMap::new(),
            inflight: HashMap::new(),
            reserved: HashMap::new(),
            completed: CompletedSet::new(completed_max),
        }
    }

    fn notify_for(&mut self, workspace_id: &WorkspaceId) -> Arc<Notify> {
        self.pending_notify
            .entry(workspace_id.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Returns the `Notify` a long-poll reserve call should await when it
    /// finds nothing to reserve immediately.
    pub fn pending_wakeup(&mut self, workspace_id: &WorkspaceId) -> Arc<Notify> {
        self.notify_for(workspace_id)
    }

    // ---------------------------------------------------------------
    // connection registry
    // ---------------------------------------------------------------

    /// Registers a new session. Returns `(client_id, authenticated, challenge_nonce)`.
    pub fn connect(
        &mut self,
        workspace_id: WorkspaceId,
        client_id: Option<ClientId>,
        surface_type: SmolStr,
        outbound: OutboundSender,
    ) -> (ClientId, bool, Option<SmolStr>) {
        let client_id = client_id.unwrap_or_else(generate_id);
        let dev_mode = !self.verifier.is_auth_required();

        let session = AgentSession {
            client_id: client_id.clone(),
            workspace_id: workspace_id.clone(),
            surface_type,
            authenticated: dev_mode,
            last_heartbeat: tokio::time::Instant::now(),
            connected_at: tokio::time::Instant::now(),
            outbound,
        };

        let challenge = if dev_mode {
            None
        } else {
            Some(self.verifier.issue_challenge(client_id.clone()))
        };

        self.sessions.entry(workspace_id.clone()).or_default().insert(client_id.clone(), session);

        info!(
            workspace_id = %workspace_id,
            client_id = %client_id,
            auth = if dev_mode { "skip" } else { "pending" },
            "agent connected",
        );

        (client_id, dev_mode, challenge)
    }

    /// Removes a session and applies the re-queue policy to its owned
    /// inflight tasks.
    pub fn disconnect(&mut self, workspace_id: &WorkspaceId, client_id: &ClientId) {
        if let Some(ws_sessions) = self.sessions.get_mut(workspace_id) {
            ws_sessions.remove(client_id);
            if ws_sessions.is_empty() {
                self.sessions.remove(workspace_id);
            }
        }

        let owned: Vec<TaskId> = self
            .inflight
            .iter()
            .filter(|(_, task)| task.client_id.as_str() == client_id.as_str())
            .map(|(task_id, _)| task_id.clone())
            .collect();

        for task_id in owned {
            self.requeue_on_disconnect(workspace_id, client_id, &task_id);
        }

        info!(workspace_id = %workspace_id, client_id = %client_id, "agent disconnected");
    }

    fn requeue_on_disconnect(&mut self, workspace_id: &WorkspaceId, client_id: &ClientId, task_id: &TaskId) {
        if self.completed.contains(task_id) {
            if let Some(mut task) = self.inflight.remove(task_id) {
                if task.result_slot.is_live() {
                    task.result_slot.set(DispatchResult {
                        execution_id: task_id.clone(),
                        status: SmolStr::new_static("completed"),
                        output: Some("Already completed before disconnect".to_owned()),
                        duration_seconds: None,
                        tool_calls: Vec::new(),
                        files_modified: Vec::new(),
                        files_created: Vec::new(),
                        error: None,
                        governance: serde_json::Map::new(),
                        metadata: serde_json::Map::new(),
                    });
                }
            }
            return;
        }

        let Some(task) = self.inflight.get_mut(task_id) else {
            return;
        };

        // Payload snapshot is always retained on InflightTask, so re-queue
        // always succeeds; the "no payload" failure path in the source
        // mixin this is grounded on is unreachable under this invariant.
        task.client_id = SmolStr::new_static(PENDING_OWNER);
        let mut pending = PendingTask::new(task_id.clone(), workspace_id.clone(), task.payload.clone(), None);
        pending.attempts = 1;

        self.enqueue_pending(pending);

        warn!(
            task_id = %task_id,
            client_id = %client_id,
            "re-queued task after disconnect, waiting future preserved",
        );
    }

    /// Best authenticated agent for a workspace, honoring an exact target
    /// when given.
    pub fn best_agent(&self, workspace_id: &WorkspaceId, target_client_id: Option<&str>) -> Option<ClientId> {
        let ws_sessions = self.sessions.get(workspace_id)?;

        if let Some(target) = target_client_id {
            return ws_sessions
                .get(target)
                .filter(|session| session.authenticated)
                .map(|session| session.client_id.clone());
        }

        ws_sessions
            .values()
            .filter(|session| session.authenticated)
            .max_by_key(|session| session.last_heartbeat)
            .map(|session| session.client_id.clone())
    }

    pub fn has_connections(&self, workspace_id: Option<&WorkspaceId>) -> bool {
        match workspace_id {
            Some(workspace_id) => self
                .sessions
                .get(workspace_id)
                .is_some_and(|clients| clients.values().any(|session| session.authenticated)),
            None => self
                .sessions
                .values()
                .any(|clients| clients.values().any(|session| session.authenticated)),
        }
    }

    fn outbound_of(&self, workspace_id: &WorkspaceId, client_id: &ClientId) -> Option<OutboundSender> {
        self.sessions.get(workspace_id)?.get(client_id).map(|session| session.outbound.clone())
    }

    pub fn touch_heartbeat(&mut self, workspace_id: &WorkspaceId, client_id: &ClientId) {
        if let Some(session) = self.sessions.get_mut(workspace_id).and_then(|m| m.get_mut(client_id)) {
            session.touch_heartbeat();
        }
    }

    /// Sessions that missed `CLIENT_TIMEOUT`, or stayed unauthenticated past
    /// `AUTH_TIMEOUT`. The caller disconnects each.
    pub fn stale_sessions(&self, now: tokio::time::Instant) -> Vec<(WorkspaceId, ClientId)> {
        let mut stale = Vec::new();
        for (workspace_id, clients) in &self.sessions {
            for session in clients.values() {
                let timed_out = now.saturating_duration_since(session.last_heartbeat) >= self.conf.client_timeout;
                let auth_expired =
                    !session.authenticated && now.saturating_duration_since(session.connected_at) >= self.conf.auth_timeout;
                if timed_out || auth_expired {
                    stale.push((workspace_id.clone(), session.client_id.clone()));
                }
            }
        }
        stale
    }

    // ---------------------------------------------------------------
    // auth
    // ---------------------------------------------------------------

    pub fn verify_auth(&mut self, workspace_id: &WorkspaceId, client_id: &ClientId, token: &str, nonce_response: &str) -> AuthVerifyOutcome {
        match self.verifier.verify(client_id, token, nonce_response) {
            AuthOutcome::Ok => {
                if let Some(session) = self.sessions.get_mut(workspace_id).and_then(|m| m.get_mut(client_id)) {
                    session.authenticated = true;
                }
                let flushed = self.flush_pending(workspace_id, client_id);
                AuthVerifyOutcome::Ok { flushed_tasks: flushed }
            }
            AuthOutcome::Rejected => AuthVerifyOutcome::Failed,
        }
    }

    // ---------------------------------------------------------------
    // bridge control registry
    // ---------------------------------------------------------------

    pub fn register_bridge(&mut self, bridge_id: SmolStr, owner_user_id: Option<SmolStr>, outbound: OutboundSender) {
        info!(bridge_id = %bridge_id, owner = ?owner_user_id, "bridge connected");
        self.bridges.insert(bridge_id.clone(), BridgeControl { bridge_id, owner_user_id, outbound });
    }

    pub fn unregister_bridge(&mut self, bridge_id: &str) {
        if self.bridges.remove(bridge_id).is_some() {
            info!(bridge_id, "bridge disconnected");
        }
    }

    fn broadcast(&mut self, frame: Frame, owner_user_id: Option<&str>) -> usize {
        let mut sent = 0;
        let mut dead = Vec::new();

        for bridge in self.bridges.values() {
            if let (Some(filter), Some(owner)) = (owner_user_id, bridge.owner_user_id.as_deref()) {
                if owner != filter {
                    continue;
                }
            }

            match bridge.outbound.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(_) => dead.push(bridge.bridge_id.clone()),
            }
        }

        for bridge_id in dead {
            self.unregister_bridge(&bridge_id);
        }

        sent
    }

    pub fn broadcast_assign(&mut self, workspace_id: &WorkspaceId, owner_user_id: Option<&str>) -> usize {
        let frame = serde_json::json!({"type": "assign", "workspace_id": workspace_id});
        self.broadcast(frame, owner_user_id)
    }

    pub fn broadcast_unassign(&mut self, workspace_id: &WorkspaceId, owner_user_id: Option<&str>) -> usize {
        let frame = serde_json::json!({"type": "unassign", "workspace_id": workspace_id});
        self.broadcast(frame, owner_user_id)
    }

    // ---------------------------------------------------------------
    // pending queue
    // ---------------------------------------------------------------

    /// Admits `task`, dropping the oldest entry on overflow and resolving
    /// its inflight future with a failure so no caller is left hanging on
    /// a task that was silently evicted.
    pub fn enqueue_pending(&mut self, task: PendingTask) {
        let workspace_id = task.workspace_id.clone();
        let queue = self.pending.entry(workspace_id.clone()).or_default();

        if queue.len() >= self.conf.max_pending_per_workspace {
            if let Some(dropped) = queue.pop_front() {
                warn!(workspace_id = %workspace_id, task_id = %dropped.task_id, "pending queue full, dropping oldest task");
                if let Some(mut inflight) = self.inflight.remove(&dropped.task_id) {
                    inflight.result_slot.set(DispatchResult::failure(dropped.task_id, "Dropped from pending queue: overflow"));
                }
            }
        }

        queue.push_back(task);
        self.notify_for(&workspace_id).notify_waiters();
    }

    /// Pushes as many matching pending tasks to `client_id` as will
    /// succeed, in FIFO order.
    pub fn flush_pending(&mut self, workspace_id: &WorkspaceId, client_id: &ClientId) -> usize {
        let Some(outbound) = self.outbound_of(workspace_id, client_id) else {
            return 0;
        };

        let Some(mut queue) = self.pending.remove(workspace_id) else {
            return 0;
        };

        let mut remaining = VecDeque::with_capacity(queue.len());
        let mut flushed = 0;
        let max_attempts = self.conf.max_dispatch_attempts;

        while let Some(mut task) = queue.pop_front() {
            if let Some(target) = task.target_client_id.as_deref() {
                if target != client_id.as_str() {
                    remaining.push_back(task);
                    continue;
                }
            }

            task.attempts += 1;
            if task.attempts > max_attempts {
                if let Some(mut inflight) = self.inflight.remove(&task.task_id) {
                    inflight.result_slot.set(DispatchResult::failure(
                        task.task_id.clone(),
                        format!("Max dispatch attempts ({max_attempts}) exceeded"),
                    ));
                }
                continue;
            }

            match outbound.try_send(task.payload.clone()) {
                Ok(()) => {
                    if let Some(inflight) = self.inflight.get_mut(&task.task_id) {
                        inflight.client_id = client_id.clone();
                        inflight.dispatched_at = tokio::time::Instant::now();
                    }
                    flushed += 1;
                }
                Err(_) => remaining.push_back(task),
            }
        }

        if !remaining.is_empty() {
            self.pending.insert(workspace_id.clone(), remaining);
        }

        if flushed > 0 {
            info!(workspace_id = %workspace_id, client_id = %client_id, flushed, "flushed pending tasks");
        }

        flushed
    }

    pub fn pending_depth(&self, workspace_id: &WorkspaceId) -> usize {
        self.pending.get(workspace_id).map_or(0, VecDeque::len)
    }

    // ---------------------------------------------------------------
    // dispatch orchestrator
    // ---------------------------------------------------------------

    /// Push path or enqueue path. Returns the
    /// receiver half of the single-shot future; the caller awaits it with
    /// a timeout outside the broker's mailbox.
    pub fn dispatch(
        &mut self,
        workspace_id: WorkspaceId,
        payload: Frame,
        task_id: TaskId,
        target_client_id: Option<ClientId>,
    ) -> tokio::sync::oneshot::Receiver<DispatchResult> {
        let (mut slot, rx) = ResultSlot::new();

        match self.best_agent(&workspace_id, target_client_id.as_deref()) {
            Some(agent_id) => {
                let Some(outbound) = self.outbound_of(&workspace_id, &agent_id) else {
                    slot.set(DispatchResult::failure(task_id, "Agent disappeared before dispatch"));
                    return rx;
                };

                match outbound.try_send(payload.clone()) {
                    Ok(()) => {
                        self.inflight.insert(
                            task_id.clone(),
                            InflightTask {
                                task_id,
                                workspace_id,
                                client_id: agent_id,
                                result_slot: slot,
                                payload,
                                acked: false,
                                dispatched_at: tokio::time::Instant::now(),
                            },
                        );
                    }
                    Err(_) => {
                        slot.set(DispatchResult::failure(task_id, "Failed to push task to agent"));
                    }
                }
            }
            None => {
                let pending = PendingTask::new(task_id.clone(), workspace_id.clone(), payload.clone(), target_client_id);
                self.enqueue_pending(pending);

                self.inflight.insert(
                    task_id.clone(),
                    InflightTask {
                        task_id,
                        workspace_id,
                        client_id: SmolStr::new_static(PENDING_OWNER),
                        result_slot: slot,
                        payload,
                        acked: false,
                        dispatched_at: tokio::time::Instant::now(),
                    },
                );
            }
        }

        rx
    }

    /// Called after a `dispatch_and_wait` timeout fires. Removing the
    /// entry here (rather than in the timeout future itself) keeps the
    /// mutation inside the actor's single-writer boundary.
    pub fn clear_inflight_on_timeout(&mut self, task_id: &TaskId) {
        self.inflight.remove(task_id);
    }

    // ---------------------------------------------------------------
    // message router (push-mode agent frames)
    // ---------------------------------------------------------------

    fn verify_ownership(&self, task_id: &TaskId, client_id: &ClientId) -> Result<(), RouterError> {
        match self.inflight.get(task_id) {
            None => Err(RouterError::Unknown),
            Some(task) if task.client_id.as_str() != client_id.as_str() => Err(RouterError::NotOwner),
            Some(_) => Ok(()),
        }
    }

    pub fn handle_ack(&mut self, task_id: &TaskId, client_id: &ClientId) -> Result<(), RouterError> {
        self.verify_ownership(task_id, client_id)?;
        if let Some(task) = self.inflight.get_mut(task_id) {
            task.acked = true;
        }
        Ok(())
    }

    pub fn handle_progress(&self, task_id: &TaskId, client_id: &ClientId) -> Result<(), RouterError> {
        self.verify_ownership(task_id, client_id)
    }

    pub fn handle_result(&mut self, task_id: &TaskId, client_id: &ClientId, mut result: DispatchResult) -> Result<(), RouterError> {
        self.verify_ownership(task_id, client_id)?;

        let Some(mut inflight) = self.inflight.remove(task_id) else {
            return Err(RouterError::Unknown);
        };

        let surface_type = self
            .sessions
            .get(&inflight.workspace_id)
            .and_then(|clients| clients.get(client_id))
            .map(|session| session.surface_type.clone());

        result.metadata.insert("transport".to_owned(), serde_json::Value::from("ws_push"));
        result.metadata.insert("client_id".to_owned(), serde_json::Value::from(client_id.as_str()));
        if let Some(surface_type) = surface_type {
            result.metadata.insert("surface_type".to_owned(), serde_json::Value::from(surface_type.as_str()));
        }
        inflight.result_slot.set(result);
        self.completed.insert(task_id.clone());

        Ok(())
    }

    // ---------------------------------------------------------------
    // reservation / lease manager
    // ---------------------------------------------------------------

    fn reclaim_expired_reserves(&mut self) {
        let now = tokio::time::Instant::now();
        let expired: Vec<TaskId> = self
            .reserved
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(task_id, _)| task_id.clone())
            .collect();

        for task_id in expired {
            if let Some(reservation) = self.reserved.remove(&task_id) {
                warn!(task_id = %task_id, "lease expired, re-queued");
                self.enqueue_pending(reservation.task);
            }
        }
    }

    /// Reserves up to `limit` pending tasks under a lease. Returns each
    /// reserved task's payload with
    /// `lease_id` merged in.
    pub fn reserve(
        &mut self,
        workspace_id: &WorkspaceId,
        client_id: &ClientId,
        surface_type: Option<&str>,
        limit: usize,
        lease_seconds: u64,
    ) -> Vec<Frame> {
        self.reclaim_expired_reserves();

        let Some(mut queue) = self.pending.remove(workspace_id) else {
            return Vec::new();
        };

        let mut remaining = VecDeque::with_capacity(queue.len());
        let mut out = Vec::new();
        let now = tokio::time::Instant::now();

        while let Some(task) = queue.pop_front() {
            if out.len() >= limit {
                remaining.push_back(task);
                continue;
            }

            if let Some(surface_type) = surface_type {
                if let Some(task_agent_id) = task.payload_agent_id() {
                    if task_agent_id != surface_type {
                        remaining.push_back(task);
                        continue;
                    }
                }
            }

            if let Some(target) = task.target_client_id.as_deref() {
                if target != client_id.as_str() {
                    remaining.push_back(task);
                    continue;
                }
            }

            let lease_id = generate_id();
            let lease_seconds_duration = std::time::Duration::from_secs(lease_seconds);

            let mut payload = task.payload.clone();
            merge_field(&mut payload, "lease_id", serde_json::Value::from(lease_id.as_str()));
            out.push(payload);

            self.reserved.insert(
                task.task_id.clone(),
                ReservedTask {
                    task,
                    client_id: client_id.clone(),
                    lease_id,
                    lease_deadline: now + lease_seconds_duration,
                    cumulative_lease: lease_seconds_duration,
                    acked: false,
                },
            );
        }

        if !remaining.is_empty() {
            self.pending.insert(workspace_id.clone(), remaining);
        }

        if !out.is_empty() {
            info!(workspace_id = %workspace_id, client_id = %client_id, count = out.len(), "reserved tasks");
        }

        out
    }

    pub fn ack_lease(&mut self, task_id: &TaskId, lease_id: &str, client_id: Option<&ClientId>) -> AckOutcome {
        let Some(reservation) = self.reserved.get_mut(task_id) else {
            return if self.completed.contains(task_id) {
                AckOutcome::AlreadyCompleted
            } else {
                AckOutcome::Rejected
            };
        };

        if reservation.lease_id.as_str() != lease_id {
            return AckOutcome::Rejected;
        }
        if let Some(client_id) = client_id {
            if reservation.client_id.as_str() != client_id.as_str() {
                return AckOutcome::Rejected;
            }
        }

        if reservation.acked {
            return AckOutcome::AlreadyAcked;
        }

        reservation.acked = true;
        reservation.try_extend(self.conf.ack_extend, self.conf.lease_cap, tokio::time::Instant::now());

        AckOutcome::Acked
    }

    pub fn lease_deadline_wall_clock(&self, task_id: &TaskId) -> Option<OffsetDateTime> {
        let reservation = self.reserved.get(task_id)?;
        let now_instant = tokio::time::Instant::now();
        let now_wall = now_wall_clock();
        let remaining = reservation.lease_deadline.saturating_duration_since(now_instant);
        Some(now_wall + remaining)
    }

    pub fn report_progress(
        &mut self,
        task_id: &TaskId,
        lease_id: &str,
        client_id: Option<&ClientId>,
    ) -> ProgressOutcome {
        let Some(reservation) = self.reserved.get_mut(task_id) else {
            return ProgressOutcome::Rejected;
        };

        if reservation.lease_id.as_str() != lease_id {
            return ProgressOutcome::Rejected;
        }
        if let Some(client_id) = client_id {
            if reservation.client_id.as_str() != client_id.as_str() {
                return ProgressOutcome::Rejected;
            }
        }

        let extended = reservation.try_extend(self.conf.progress_reset, self.conf.lease_cap, tokio::time::Instant::now());
        if extended {
            ProgressOutcome::Ok
        } else {
            ProgressOutcome::LeaseCapExceeded
        }
    }

    pub fn list_inflight(&mut self, client_id: &ClientId) -> Vec<Frame> {
        self.reclaim_expired_reserves();

        self.reserved
            .values()
            .filter(|r| r.client_id.as_str() == client_id.as_str())
            .map(|r| {
                let mut payload = r.task.payload.clone();
                merge_field(&mut payload, "lease_id", serde_json::Value::from(r.lease_id.as_str()));
                merge_field(&mut payload, "acked", serde_json::Value::from(r.acked));
                payload
            })
            .collect()
    }

    /// Submits a result: durable path first (best-effort; failures are
    /// logged and do not block the in-memory fast-path), then the
    /// in-memory fast-path that wakes a waiting `dispatch_and_wait` caller.
    pub async fn submit(
        &mut self,
        task_id: &TaskId,
        result_data: DispatchResult,
        client_id: Option<&ClientId>,
        lease_id: Option<&str>,
    ) -> SubmitOutcome {
        if self.completed.contains(task_id) {
            return SubmitOutcome::Accepted { workspace_id: None, duplicate: true };
        }

        if let Some(reservation) = self.reserved.get(task_id) {
            if let Some(lease_id) = lease_id {
                if reservation.lease_id.as_str() != lease_id {
                    return SubmitOutcome::UnknownTask;
                }
            }
            if let Some(client_id) = client_id {
                if reservation.client_id.as_str() != client_id.as_str() {
                    return SubmitOutcome::UnknownTask;
                }
            }
        }

        let mut workspace_id = None;
        let mut db_written = false;

        match self.store.get_task(task_id).await {
            Ok(Some(stored)) if !stored.status.is_terminal() => {
                let status = if result_data.is_completed() {
                    crate::store::TaskStatus::Succeeded
                } else {
                    crate::store::TaskStatus::Failed
                };
                let result_json = serde_json::to_value(&result_data).unwrap_or(serde_json::Value::Null);
                if let Err(error) = self
                    .store
                    .update_task_status(task_id, status, result_json, result_data.error.as_deref().map(SmolStr::new), now_wall_clock())
                    .await
                {
                    warn!(task_id = %task_id, %error, "tasks store write failed, continuing with in-memory path");
                } else {
                    db_written = true;
                }
                workspace_id = Some(stored.workspace_id);
            }
            Ok(Some(stored)) => {
                // Already terminal in the store: treat as a duplicate submit.
                self.completed.insert(task_id.clone());
                return SubmitOutcome::Accepted { workspace_id: Some(stored.workspace_id), duplicate: true };
            }
            Ok(None) => {}
            Err(error) => {
                warn!(task_id = %task_id, %error, "tasks store read failed, continuing with in-memory path");
            }
        }

        let inflight = self.inflight.remove(task_id);
        if let Some(mut inflight) = inflight {
            if workspace_id.is_none() {
                workspace_id = Some(inflight.workspace_id.clone());
            }
            inflight.result_slot.set(result_data);
        }

        self.reserved.remove(task_id);
        for queue in self.pending.values_mut() {
            queue.retain(|task| task.task_id.as_str() != task_id.as_str());
        }

        self.completed.insert(task_id.clone());

        if db_written || workspace_id.is_some() {
            SubmitOutcome::Accepted { workspace_id, duplicate: false }
        } else {
            SubmitOutcome::UnknownTask
        }
    }

    // ---------------------------------------------------------------
    // status/diagnostics
    // ---------------------------------------------------------------

    pub fn status(&self) -> StatusSnapshot {
        let mut workspaces = HashMap::new();

        for (workspace_id, clients) in &self.sessions {
            let authenticated_count = clients.values().filter(|s| s.authenticated).count();
            let unauthenticated_count = clients.len() - authenticated_count;
            let surface_types = clients.values().map(|s| s.surface_type.clone()).collect();
            workspaces.insert(
                workspace_id.clone(),
                WorkspaceStatus {
                    authenticated_count,
                    unauthenticated_count,
                    pending_depth: self.pending_depth(workspace_id),
                    surface_types,
                },
            );
        }

        for workspace_id in self.pending.keys() {
            workspaces.entry(workspace_id.clone()).or_insert_with(|| WorkspaceStatus {
                authenticated_count: 0,
                unauthenticated_count: 0,
                pending_depth: self.pending_depth(workspace_id),
                surface_types: Vec::new(),
            });
        }

        StatusSnapshot {
            workspaces,
            inflight_count: self.inflight.len(),
            reserved_count: self.reserved.len(),
            bridge_count: self.bridges.len(),
            completed_count: self.completed.len(),
        }
    }
}

/// Merges `key: value` into `payload` if it is a JSON object; a no-op
/// otherwise (payloads are expected to always be objects).
fn merge_field(payload: &mut Frame, key: &str, value: serde_json::Value) {
    if let Some(map) = payload.as_object_mut() {
        map.insert(key.to_owned(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfHandle;
    use crate::store::NullTasksStore;

    fn test_state(json: &str) -> BrokerState {
        let conf = ConfHandle::mock(json).expect("valid test config").get_conf();
        BrokerState::new(conf, Arc::new(NullTasksStore))
    }

    fn outbound() -> (OutboundSender, tokio::sync::mpsc::Receiver<Frame>) {
        tokio::sync::mpsc::channel(8)
    }

    fn payload(task_id: &str) -> Frame {
        serde_json::json!({"execution_id": task_id, "kind": "run"})
    }

    #[test]
    fn dev_mode_connect_auto_authenticates() {
        let mut state = test_state("{}");
        let (tx, _rx) = outbound();
        let (client_id, authenticated, challenge) = state.connect("w1".into(), None, "gemini_cli".into(), tx);

        assert!(authenticated);
        assert!(challenge.is_none());
        assert_eq!(state.best_agent(&"w1".into(), None), Some(client_id));
    }

    #[test]
    fn best_agent_honors_exact_target() {
        let mut state = test_state("{}");
        let (tx_a, _rx_a) = outbound();
        let (tx_b, _rx_b) = outbound();
        let (a, ..) = state.connect("w1".into(), Some("a".into()), "gemini_cli".into(), tx_a);
        let (b, ..) = state.connect("w1".into(), Some("b".into()), "claude_code".into(), tx_b);

        assert_eq!(state.best_agent(&"w1".into(), Some("b")), Some(b.clone()));
        assert_eq!(state.best_agent(&"w1".into(), Some("nonexistent")), None);
        let unfiltered = state.best_agent(&"w1".into(), None);
        assert!(unfiltered == Some(a) || unfiltered == Some(b));
    }

    /// Scenario 1: push happy path. An authenticated agent is connected, so
    /// `dispatch` pushes immediately and `handle_result` resolves the future.
    #[tokio::test]
    async fn push_happy_path_resolves_future() {
        let mut state = test_state("{}");
        let (tx, mut rx) = outbound();
        let (client_id, ..) = state.connect("w1".into(), Some("c1".into()), "gemini_cli".into(), tx);

        let mut result_rx = state.dispatch("w1".into(), payload("e1"), "e1".into(), None);
        assert!(rx.try_recv().is_ok(), "agent should have received the pushed payload");

        state.handle_ack(&"e1".into(), &client_id).unwrap();
        state
            .handle_result(&"e1".into(), &client_id, DispatchResult {
                execution_id: "e1".into(),
                status: "completed".into(),
                output: Some("ok".to_owned()),
                duration_seconds: None,
                tool_calls: Vec::new(),
                files_modified: Vec::new(),
                files_created: Vec::new(),
                error: None,
                governance: serde_json::Map::new(),
                metadata: serde_json::Map::new(),
            })
            .unwrap();

        let result = result_rx.try_recv().expect("future resolved");
        assert_eq!(result.status.as_str(), "completed");
        assert_eq!(result.output.as_deref(), Some("ok"));
        assert_eq!(result.metadata.get("transport").and_then(|v| v.as_str()), Some("ws_push"));
        assert!(state.inflight.is_empty());
        assert!(state.completed.contains("e1"));
    }

    /// Scenario 2: enqueue then late connect. No agent is connected when the
    /// task is dispatched, so it sits in the pending queue until an agent
    /// authenticates and the queue is flushed.
    #[test]
    fn enqueue_then_late_connect_flushes_pending() {
        let mut state = test_state("{}");

        let _rx = state.dispatch("w1".into(), payload("e2"), "e2".into(), None);
        assert_eq!(state.pending_depth(&"w1".into()), 1);

        let (tx, mut agent_rx) = outbound();
        let (client_id, ..) = state.connect("w1".into(), Some("c1".into()), "gemini_cli".into(), tx);
        let flushed = state.flush_pending(&"w1".into(), &client_id);

        assert_eq!(flushed, 1);
        assert_eq!(state.pending_depth(&"w1".into()), 0);
        assert!(agent_rx.try_recv().is_ok());
    }

    /// Scenario 3: disconnect mid-flight, then poll-mode recovery by another
    /// agent. The waiting future must survive the re-queue and resolve once
    /// the second agent submits a result.
    #[tokio::test]
    async fn disconnect_requeues_then_poll_recovers() {
        let mut state = test_state("{}");
        let (tx_a, mut rx_a) = outbound();
        let (client_a, ..) = state.connect("w1".into(), Some("a".into()), "gemini_cli".into(), tx_a);

        let mut result_rx = state.dispatch("w1".into(), payload("e3"), "e3".into(), None);
        assert!(rx_a.try_recv().is_ok());

        state.disconnect(&"w1".into(), &client_a);

        assert_eq!(state.pending_depth(&"w1".into()), 1);
        assert!(result_rx.try_recv().is_err(), "future must still be pending after re-queue");

        let reserved = state.reserve(&"w1".into(), &"b".into(), None, 5, 60);
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].get("execution_id").and_then(|v| v.as_str()), Some("e3"));
        let lease_id = reserved[0].get("lease_id").and_then(|v| v.as_str()).unwrap().to_owned();

        assert_eq!(state.ack_lease(&"e3".into(), &lease_id, Some(&"b".into())), AckOutcome::Acked);

        let outcome = state
            .submit(
                &"e3".into(),
                DispatchResult { output: Some("x".to_owned()), status: "completed".into(), ..DispatchResult::failure("e3".into(), "") },
                Some(&"b".into()),
                Some(&lease_id),
            )
            .await;
        assert!(matches!(outcome, SubmitOutcome::Accepted { duplicate: false, .. }));

        let result = result_rx.try_recv().expect("original caller's future resolves");
        assert_eq!(result.output.as_deref(), Some("x"));
    }

    /// Scenario 4: lease expiry. An unacked reservation past its deadline is
    /// lazily reclaimed by the next `reserve` call and returns to pending.
    #[test]
    fn expired_lease_is_lazily_reclaimed() {
        let mut state = test_state("{}");
        let _rx = state.dispatch("w1".into(), payload("e4"), "e4".into(), None);

        let first = state.reserve(&"w1".into(), &"a".into(), None, 1, 0);
        assert_eq!(first.len(), 1);

        let second = state.reserve(&"w1".into(), &"b".into(), None, 1, 60);
        assert_eq!(second.len(), 1, "zero-second lease must already be expired on the next reserve");
        assert_eq!(second[0].get("execution_id").and_then(|v| v.as_str()), Some("e4"));
    }

    /// Idempotence law: submit(task_id) then submit(task_id) again returns
    /// `duplicate: true` on the second call.
    #[tokio::test]
    async fn duplicate_submit_is_reported() {
        let mut state = test_state("{}");
        let (tx, _rx) = outbound();
        let (client_id, ..) = state.connect("w1".into(), Some("c1".into()), "gemini_cli".into(), tx);
        let _result_rx = state.dispatch("w1".into(), payload("e1"), "e1".into(), None);

        let first = state.submit(&"e1".into(), DispatchResult::failure("e1".into(), "boom"), Some(&client_id), None).await;
        assert!(matches!(first, SubmitOutcome::Accepted { duplicate: false, .. }));

        let second = state.submit(&"e1".into(), DispatchResult::failure("e1".into(), "boom"), Some(&client_id), None).await;
        assert!(matches!(second, SubmitOutcome::Accepted { duplicate: true, .. }));
    }

    /// Idempotence law: ack then ack(same) returns `already_acked` with the
    /// deadline left unchanged (the extension is only applied once).
    #[test]
    fn repeated_ack_is_a_no_op() {
        let mut state = test_state("{}");
        let _rx = state.dispatch("w1".into(), payload("e1"), "e1".into(), None);
        let reserved = state.reserve(&"w1".into(), &"a".into(), None, 1, 60);
        let lease_id = reserved[0].get("lease_id").and_then(|v| v.as_str()).unwrap().to_owned();

        let task_id: TaskId = "e1".into();
        assert_eq!(state.ack_lease(&task_id, &lease_id, None), AckOutcome::Acked);
        let deadline_after_first_ack = state.reserved.get(&task_id).unwrap().lease_deadline;

        assert_eq!(state.ack_lease(&task_id, &lease_id, None), AckOutcome::AlreadyAcked);
        let deadline_after_second_ack = state.reserved.get(&task_id).unwrap().lease_deadline;

        assert_eq!(deadline_after_first_ack, deadline_after_second_ack);
    }

    /// Scenario 6: pending overflow. With `max_pending_per_workspace = 2`,
    /// a third dispatch drops the oldest and resolves its future with a
    /// failure rather than leaving it to time out.
    #[test]
    fn pending_overflow_drops_oldest_and_resolves_its_future() {
        let mut state = test_state(r#"{"max_pending_per_workspace": 2}"#);

        let mut rx5 = state.dispatch("w1".into(), payload("e5"), "e5".into(), None);
        let _rx6 = state.dispatch("w1".into(), payload("e6"), "e6".into(), None);
        assert_eq!(state.pending_depth(&"w1".into()), 2);

        let _rx7 = state.dispatch("w1".into(), payload("e7"), "e7".into(), None);
        assert_eq!(state.pending_depth(&"w1".into()), 2);

        let dropped = rx5.try_recv().expect("e5's future resolves immediately on eviction");
        assert_eq!(dropped.status.as_str(), "failed");

        let (tx, mut agent_rx) = outbound();
        let (client_id, ..) = state.connect("w1".into(), Some("c1".into()), "gemini_cli".into(), tx);
        let flushed = state.flush_pending(&"w1".into(), &client_id);

        assert_eq!(flushed, 2, "e6 and e7 remain and are flushed in order");
        assert!(agent_rx.try_recv().is_ok());
        assert!(agent_rx.try_recv().is_ok());
    }

    /// Boundary: the `surface_type`/`agent_id` reserve filter is authoritative
    /// only when the payload actually carries an `agent_id`.
    #[test]
    fn reserve_filter_is_authoritative_only_when_payload_names_an_agent() {
        let mut state = test_state("{}");
        let mut tagged = payload("e1");
        tagged["agent_id"] = serde_json::Value::from("claude_code");
        state.enqueue_pending(PendingTask::new("e1".into(), "w1".into(), tagged, None));
        state.enqueue_pending(PendingTask::new("e2".into(), "w1".into(), payload("e2"), None));

        let reserved = state.reserve(&"w1".into(), &"a".into(), Some("gemini_cli"), 10, 60);
        let ids: Vec<_> = reserved.iter().filter_map(|f| f.get("execution_id").and_then(|v| v.as_str())).collect();

        assert!(ids.contains(&"e2"), "untagged payload is reservable by any surface_type");
        assert!(!ids.contains(&"e1"), "payload tagged for a different agent is not reservable");
    }
}
