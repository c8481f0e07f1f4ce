use crate::domains::approvals::entity::ApprovalStatus;
use crate::domains::executions::entity::ExecutionStatus;
use crate::domains::workspaces::entity::SessionStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Change notifications published by the control-plane store. The runner
/// subscribes for cancellation and approval resolution; UI collaborators
/// subscribe for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum StoreEvent {
    WorkspaceCreated {
        workspace_id: String,
    },
    WorkspaceUpdated {
        workspace_id: String,
    },
    WorkspaceDeleted {
        workspace_id: String,
    },
    SessionAdded {
        workspace_id: String,
        session_id: String,
    },
    SessionStatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    ExecutionStarted {
        execution_id: String,
        session_id: String,
    },
    ExecutionStatusChanged {
        execution_id: String,
        session_id: String,
        status: ExecutionStatus,
    },
    ExecutionCancelRequested {
        execution_id: String,
    },
    RepoStateRecorded {
        execution_id: String,
        workspace_repo_id: String,
    },
    QueueUpdated {
        session_id: String,
    },
    QueueConsumed {
        session_id: String,
    },
    QueueDiscarded {
        session_id: String,
    },
    ApprovalRequested {
        approval_id: String,
        session_id: String,
        execution_id: String,
    },
    ApprovalResolved {
        approval_id: String,
        execution_id: String,
        status: ApprovalStatus,
    },
    LeaseReclaimed {
        execution_id: String,
    },
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast fan-out for store mutations. Slow subscribers lag and lose the
/// oldest events rather than blocking writers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StoreEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
