//! Handle for controlling the registry runtime and receiving events.
//!
//! The handle is returned when starting the runtime and provides:
//! - The async mesh-event stream for topology updates
//! - Current state queries
//! - Tool/port updates and shutdown control

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::events::MeshEvent;
use crate::runtime::RuntimeCommand;
use crate::spec::ToolSpec;

/// Internal state shared between handle and runtime.
#[derive(Debug, Default)]
pub struct HandleState {
    /// Current dependency endpoints (capability -> endpoint)
    pub dependencies: HashMap<String, String>,

    /// Agent ID acknowledged by the registry
    pub agent_id: Option<String>,
}

/// Handle to a running registry runtime.
pub struct RuntimeHandle {
    /// Event receiver (from runtime)
    event_rx: Mutex<mpsc::Receiver<MeshEvent>>,

    /// Shared state
    state: Arc<RwLock<HandleState>>,

    /// Command channel to the runtime
    command_tx: mpsc::Sender<RuntimeCommand>,

    /// Whether shutdown has been requested
    shutdown_requested: AtomicBool,
}

impl RuntimeHandle {
    pub fn new(
        event_rx: mpsc::Receiver<MeshEvent>,
        state: Arc<RwLock<HandleState>>,
        command_tx: mpsc::Sender<RuntimeCommand>,
    ) -> Self {
        Self {
            event_rx: Mutex::new(event_rx),
            state,
            command_tx,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    /// Wait for the next mesh event.
    ///
    /// Returns None once the runtime has emitted its terminal `Shutdown`
    /// event and stopped.
    pub async fn next_event(&self) -> Option<MeshEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    /// Replace the registered tool list.
    ///
    /// The runtime diffs the content and only contacts the registry when it
    /// actually changed.
    pub async fn update_tools(&self, tools: Vec<ToolSpec>) {
        if self
            .command_tx
            .send(RuntimeCommand::UpdateTools(tools))
            .await
            .is_err()
        {
            debug!("Runtime gone, dropping tool update");
        }
    }

    /// Announce a different HTTP port (e.g., after binding port 0).
    pub async fn update_port(&self, port: u16) {
        if self
            .command_tx
            .send(RuntimeCommand::UpdatePort(port))
            .await
            .is_err()
        {
            debug!("Runtime gone, dropping port update");
        }
    }

    /// Request graceful shutdown. Idempotent; the runtime deregisters and
    /// emits a terminal `Shutdown` event within one loop cycle.
    pub async fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.command_tx.send(RuntimeCommand::Shutdown).await;
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Snapshot of current dependency endpoints (capability -> endpoint).
    pub async fn dependencies(&self) -> HashMap<String, String> {
        self.state.read().await.dependencies.clone()
    }

    /// The agent ID acknowledged by the registry, if registered.
    pub async fn agent_id(&self) -> Option<String> {
        self.state.read().await.agent_id.clone()
    }
}
