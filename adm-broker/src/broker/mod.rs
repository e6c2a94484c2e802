//! The broker actor: one task owns every piece of shared state
//! behind an `mpsc` mailbox, so the single coarse lock this needs is the
//! actor's exclusive `&mut self` access rather than a `Mutex`. `BrokerTask`
//! owns the state and the mailbox's receiving half; `BrokerHandle` is the
//! cheaply cloneable sending half handed out to callers.

mod state;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker_task::{ShutdownSignal, Task};
use smol_str::SmolStr;
use tap::Pipe as _;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

pub use state::{AckOutcome, AuthVerifyOutcome, ProgressOutcome, RouterError, StatusSnapshot, SubmitOutcome, WorkspaceStatus};

use crate::config::Conf;
use crate::model::{ClientId, DispatchResult, Frame, OutboundSender, TaskId, WorkspaceId};
use crate::store::TasksStore;
use state::BrokerState;

enum BrokerMessage {
    Connect {
        workspace_id: WorkspaceId,
        client_id: Option<ClientId>,
        surface_type: SmolStr,
        outbound: OutboundSender,
        reply: oneshot::Sender<(ClientId, bool, Option<SmolStr>)>,
    },
    Disconnect {
        workspace_id: WorkspaceId,
        client_id: ClientId,
    },
    Heartbeat {
        workspace_id: WorkspaceId,
        client_id: ClientId,
    },
    VerifyAuth {
        workspace_id: WorkspaceId,
        client_id: ClientId,
        token: String,
        nonce_response: String,
        reply: oneshot::Sender<AuthVerifyOutcome>,
    },
    Ack {
        task_id: TaskId,
        client_id: ClientId,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    ProgressPush {
        task_id: TaskId,
        client_id: ClientId,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    ResultPush {
        task_id: TaskId,
        client_id: ClientId,
        result: DispatchResult,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    RegisterBridge {
        bridge_id: SmolStr,
        owner_user_id: Option<SmolStr>,
        outbound: OutboundSender,
    },
    UnregisterBridge {
        bridge_id: SmolStr,
    },
    BroadcastAssign {
        workspace_id: WorkspaceId,
        owner_user_id: Option<SmolStr>,
        reply: oneshot::Sender<usize>,
    },
    BroadcastUnassign {
        workspace_id: WorkspaceId,
        owner_user_id: Option<SmolStr>,
        reply: oneshot::Sender<usize>,
    },
    DispatchAndWait {
        workspace_id: WorkspaceId,
        payload: Frame,
        task_id: TaskId,
        target_client_id: Option<ClientId>,
        reply: oneshot::Sender<oneshot::Receiver<DispatchResult>>,
    },
    ClearInflightOnTimeout {
        task_id: TaskId,
    },
    Reserve {
        workspace_id: WorkspaceId,
        client_id: ClientId,
        surface_type: Option<SmolStr>,
        limit: usize,
        lease_seconds: u64,
        reply: oneshot::Sender<Vec<Frame>>,
    },
    AckLease {
        task_id: TaskId,
        lease_id: SmolStr,
        client_id: Option<ClientId>,
        reply: oneshot::Sender<(AckOutcome, Option<time::OffsetDateTime>)>,
    },
    ProgressLease {
        task_id: TaskId,
        lease_id: SmolStr,
        client_id: Option<ClientId>,
        reply: oneshot::Sender<(ProgressOutcome, Option<time::OffsetDateTime>)>,
    },
    ListInflight {
        client_id: ClientId,
        reply: oneshot::Sender<Vec<Frame>>,
    },
    SubmitResult {
        task_id: TaskId,
        result_data: DispatchResult,
        client_id: Option<ClientId>,
        lease_id: Option<SmolStr>,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    PendingWakeup {
        workspace_id: WorkspaceId,
        reply: oneshot::Sender<Arc<tokio::sync::Notify>>,
    },
}

/// Cheaply cloneable handle to the broker actor. Every method sends one
/// message and, where relevant, awaits the reply (suspension points cross
/// task boundaries, not lock boundaries).
#[derive(Clone)]
pub struct BrokerHandle(mpsc::Sender<BrokerMessage>);

impl BrokerHandle {
    pub async fn connect(
        &self,
        workspace_id: WorkspaceId,
        client_id: Option<ClientId>,
        surface_type: SmolStr,
        outbound: OutboundSender,
    ) -> anyhow::Result<(ClientId, bool, Option<SmolStr>)> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::Connect { workspace_id, client_id, surface_type, outbound, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn disconnect(&self, workspace_id: WorkspaceId, client_id: ClientId) {
        let _ = self.0.send(BrokerMessage::Disconnect { workspace_id, client_id }).await;
    }

    pub async fn heartbeat(&self, workspace_id: WorkspaceId, client_id: ClientId) {
        let _ = self.0.send(BrokerMessage::Heartbeat { workspace_id, client_id }).await;
    }

    pub async fn verify_auth(
        &self,
        workspace_id: WorkspaceId,
        client_id: ClientId,
        token: String,
        nonce_response: String,
    ) -> anyhow::Result<AuthVerifyOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::VerifyAuth { workspace_id, client_id, token, nonce_response, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn ack(&self, task_id: TaskId, client_id: ClientId) -> anyhow::Result<Result<(), RouterError>> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::Ack { task_id, client_id, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn progress_push(&self, task_id: TaskId, client_id: ClientId) -> anyhow::Result<Result<(), RouterError>> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::ProgressPush { task_id, client_id, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn result_push(
        &self,
        task_id: TaskId,
        client_id: ClientId,
        result: DispatchResult,
    ) -> anyhow::Result<Result<(), RouterError>> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::ResultPush { task_id, client_id, result, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn register_bridge(&self, bridge_id: SmolStr, owner_user_id: Option<SmolStr>, outbound: OutboundSender) {
        let _ = self.0.send(BrokerMessage::RegisterBridge { bridge_id, owner_user_id, outbound }).await;
    }

    pub async fn unregister_bridge(&self, bridge_id: SmolStr) {
        let _ = self.0.send(BrokerMessage::UnregisterBridge { bridge_id }).await;
    }

    pub async fn broadcast_assign(&self, workspace_id: WorkspaceId, owner_user_id: Option<SmolStr>) -> anyhow::Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::BroadcastAssign { workspace_id, owner_user_id, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn broadcast_unassign(&self, workspace_id: WorkspaceId, owner_user_id: Option<SmolStr>) -> anyhow::Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::BroadcastUnassign { workspace_id, owner_user_id, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn reserve(
        &self,
        workspace_id: WorkspaceId,
        client_id: ClientId,
        surface_type: Option<SmolStr>,
        limit: usize,
        lease_seconds: u64,
    ) -> anyhow::Result<Vec<Frame>> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::Reserve { workspace_id, client_id, surface_type, limit, lease_seconds, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn ack_lease(
        &self,
        task_id: TaskId,
        lease_id: SmolStr,
        client_id: Option<ClientId>,
    ) -> anyhow::Result<(AckOutcome, Option<time::OffsetDateTime>)> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::AckLease { task_id, lease_id, client_id, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn progress_lease(
        &self,
        task_id: TaskId,
        lease_id: SmolStr,
        client_id: Option<ClientId>,
    ) -> anyhow::Result<(ProgressOutcome, Option<time::OffsetDateTime>)> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::ProgressLease { task_id, lease_id, client_id, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn list_inflight(&self, client_id: ClientId) -> anyhow::Result<Vec<Frame>> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::ListInflight { client_id, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn submit_result(
        &self,
        task_id: TaskId,
        result_data: DispatchResult,
        client_id: Option<ClientId>,
        lease_id: Option<SmolStr>,
    ) -> anyhow::Result<SubmitOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::SubmitResult { task_id, result_data, client_id, lease_id, reply }).await?;
        rx.await.map_err(Into::into)
    }

    pub async fn status(&self) -> anyhow::Result<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::Status { reply }).await?;
        rx.await.map_err(Into::into)
    }

    /// Returns the `Notify` signaled whenever a task is enqueued for
    /// `workspace_id`, for a long-poll reserve call to await alongside a
    /// timeout.
    pub async fn pending_wakeup(&self, workspace_id: WorkspaceId) -> anyhow::Result<Arc<tokio::sync::Notify>> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::PendingWakeup { workspace_id, reply }).await?;
        rx.await.map_err(Into::into)
    }

    /// `dispatch_and_wait`: asks the actor to either push or
    /// enqueue the task, then awaits the resulting single-shot future
    /// outside the actor's mailbox, with `timeout` bounding the wait.
    pub async fn dispatch_and_wait(
        &self,
        workspace_id: WorkspaceId,
        payload: Frame,
        task_id: TaskId,
        target_client_id: Option<ClientId>,
        timeout: Duration,
    ) -> anyhow::Result<DispatchResult> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerMessage::DispatchAndWait { workspace_id, payload, task_id: task_id.clone(), target_client_id, reply })
            .await?;
        let result_rx = rx.await?;

        match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(result)) => Ok(result),
            // Either the timeout elapsed, or the sender was dropped without a value
            // (can only happen if the broker task itself died); both surface the
            // same structured "timeout" result rather than propagating an error.
            Ok(Err(_)) | Err(_) => {
                let _ = self.0.send(BrokerMessage::ClearInflightOnTimeout { task_id: task_id.clone() }).await;
                Ok(DispatchResult::timeout(task_id, timeout.as_secs()))
            }
        }
    }

    async fn send(&self, message: BrokerMessage) -> anyhow::Result<()> {
        self.0.send(message).await.map_err(|_| anyhow::anyhow!("broker task is gone"))
    }
}

fn broker_channel() -> (BrokerHandle, mpsc::Receiver<BrokerMessage>) {
    mpsc::channel(256).pipe(|(tx, rx)| (BrokerHandle(tx), rx))
}

pub struct BrokerTask {
    handle: BrokerHandle,
    rx: mpsc::Receiver<BrokerMessage>,
    state: BrokerState,
}

impl BrokerTask {
    pub fn new(conf: Arc<Conf>, store: Arc<dyn TasksStore>) -> Self {
        let (handle, rx) = broker_channel();
        Self { handle, rx, state: BrokerState::new(conf, store) }
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Task for BrokerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "agent dispatch broker";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        broker_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn broker_task(mut task: BrokerTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    debug!("Task started");

    let sweep_interval = task.state.conf.heartbeat_interval;
    let mut sweep = tokio::time::interval(sweep_interval);

    loop {
        tokio::select! {
            msg = task.rx.recv() => {
                let Some(msg) = msg else {
                    warn!("All senders are dead");
                    break;
                };
                handle_message(&mut task.state, msg).await;
            }
            _ = sweep.tick() => {
                sweep_stale_sessions(&mut task.state);
            }
            () = shutdown_signal.wait() => {
                break;
            }
        }
    }

    debug!("Task terminated");

    Ok(())
}

fn sweep_stale_sessions(state: &mut BrokerState) {
    let now = tokio::time::Instant::now();
    for (workspace_id, client_id) in state.stale_sessions(now) {
        warn!(workspace_id = %workspace_id, client_id = %client_id, "evicting stale session");
        state.disconnect(&workspace_id, &client_id);
    }
}

async fn handle_message(state: &mut BrokerState, msg: BrokerMessage) {
    match msg {
        BrokerMessage::Connect { workspace_id, client_id, surface_type, outbound, reply } => {
            let result = state.connect(workspace_id, client_id, surface_type, outbound);
            let _ = reply.send(result);
        }
        BrokerMessage::Disconnect { workspace_id, client_id } => {
            state.disconnect(&workspace_id, &client_id);
        }
        BrokerMessage::Heartbeat { workspace_id, client_id } => {
            state.touch_heartbeat(&workspace_id, &client_id);
        }
        BrokerMessage::VerifyAuth { workspace_id, client_id, token, nonce_response, reply } => {
            let result = state.verify_auth(&workspace_id, &client_id, &token, &nonce_response);
            let _ = reply.send(result);
        }
        BrokerMessage::Ack { task_id, client_id, reply } => {
            let result = state.handle_ack(&task_id, &client_id);
            let _ = reply.send(result);
        }
        BrokerMessage::ProgressPush { task_id, client_id, reply } => {
            let result = state.handle_progress(&task_id, &client_id);
            let _ = reply.send(result);
        }
        BrokerMessage::ResultPush { task_id, client_id, result, reply } => {
            let outcome = state.handle_result(&task_id, &client_id, result);
            let _ = reply.send(outcome);
        }
        BrokerMessage::RegisterBridge { bridge_id, owner_user_id, outbound } => {
            state.register_bridge(bridge_id, owner_user_id, outbound);
        }
        BrokerMessage::UnregisterBridge { bridge_id } => {
            state.unregister_bridge(&bridge_id);
        }
        BrokerMessage::BroadcastAssign { workspace_id, owner_user_id, reply } => {
            let count = state.broadcast_assign(&workspace_id, owner_user_id.as_deref());
            let _ = reply.send(count);
        }
        BrokerMessage::BroadcastUnassign { workspace_id, owner_user_id, reply } => {
            let count = state.broadcast_unassign(&workspace_id, owner_user_id.as_deref());
            let _ = reply.send(count);
        }
        BrokerMessage::DispatchAndWait { workspace_id, payload, task_id, target_client_id, reply } => {
            let rx = state.dispatch(workspace_id, payload, task_id, target_client_id);
            let _ = reply.send(rx);
        }
        BrokerMessage::ClearInflightOnTimeout { task_id } => {
            state.clear_inflight_on_timeout(&task_id);
        }
        BrokerMessage::Reserve { workspace_id, client_id, surface_type, limit, lease_seconds, reply } => {
            let out = state.reserve(&workspace_id, &client_id, surface_type.as_deref(), limit, lease_seconds);
            let _ = reply.send(out);
        }
        BrokerMessage::AckLease { task_id, lease_id, client_id, reply } => {
            let outcome = state.ack_lease(&task_id, &lease_id, client_id.as_ref());
            let deadline = state.lease_deadline_wall_clock(&task_id);
            let _ = reply.send((outcome, deadline));
        }
        BrokerMessage::ProgressLease { task_id, lease_id, client_id, reply } => {
            let outcome = state.report_progress(&task_id, &lease_id, client_id.as_ref());
            let deadline = state.lease_deadline_wall_clock(&task_id);
            let _ = reply.send((outcome, deadline));
        }
        BrokerMessage::ListInflight { client_id, reply } => {
            let out = state.list_inflight(&client_id);
            let _ = reply.send(out);
        }
        BrokerMessage::SubmitResult { task_id, result_data, client_id, lease_id, reply } => {
            let outcome = state.submit(&task_id, result_data, client_id.as_ref(), lease_id.as_deref()).await;
            let _ = reply.send(outcome);
        }
        BrokerMessage::Status { reply } => {
            let _ = reply.send(state.status());
        }
        BrokerMessage::PendingWakeup { workspace_id, reply } => {
            let _ = reply.send(state.pending_wakeup(&workspace_id));
        }
    }
}

/// Awaits the per-workspace enqueue notification, for long-poll reserve
/// callers that found nothing immediately.
pub fn wait_for_enqueue(notify: Arc<tokio::sync::Notify>) -> impl Future<Output = ()> {
    async move { notify.notified().await }
}

#[cfg(test)]
mod tests {
    use broker_task::ShutdownHandle;

    use super::*;
    use crate::config::ConfHandle;
    use crate::store::NullTasksStore;

    fn spawn_broker() -> (BrokerHandle, ShutdownHandle) {
        let conf = ConfHandle::mock("{}").unwrap().get_conf();
        let task = BrokerTask::new(conf, Arc::new(NullTasksStore));
        let handle = task.handle();
        let (shutdown, signal) = ShutdownHandle::new();
        tokio::spawn(broker_task(task, signal));
        (handle, shutdown)
    }

    #[tokio::test]
    async fn connect_then_dispatch_push_round_trip() {
        let (handle, _shutdown) = spawn_broker();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);

        let (client_id, authenticated, _) =
            handle.connect("w1".into(), None, "cli".into(), outbound_tx).await.unwrap();
        assert!(authenticated, "dev mode authenticates on connect");

        let dispatch = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .dispatch_and_wait(
                        "w1".into(),
                        serde_json::json!({"task_id": "e1"}),
                        "e1".into(),
                        None,
                        Duration::from_secs(5),
                    )
                    .await
                    .unwrap()
            }
        });

        let pushed = outbound_rx.recv().await.expect("frame pushed to the connected agent");
        assert_eq!(pushed["task_id"], "e1");

        handle.ack("e1".into(), client_id.clone()).await.unwrap().unwrap();
        let result = DispatchResult {
            execution_id: "e1".into(),
            status: "completed".into(),
            output: Some("done".to_owned()),
            duration_seconds: None,
            tool_calls: Vec::new(),
            files_modified: Vec::new(),
            files_created: Vec::new(),
            error: None,
            governance: serde_json::Map::new(),
            metadata: serde_json::Map::new(),
        };
        handle.result_push("e1".into(), client_id, result).await.unwrap().unwrap();

        let outcome = dispatch.await.unwrap();
        assert_eq!(outcome.status.as_str(), "completed");
    }

    #[tokio::test]
    async fn status_reports_connected_agent() {
        let (handle, _shutdown) = spawn_broker();
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        handle.connect("w1".into(), None, "cli".into(), outbound_tx).await.unwrap();

        let snapshot = handle.status().await.unwrap();
        assert_eq!(snapshot.workspaces.len(), 1);
        let workspace = snapshot.workspaces.get(&WorkspaceId::from("w1")).expect("w1 reported");
        assert_eq!(workspace.authenticated_count, 1);
    }
}
