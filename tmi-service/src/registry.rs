//! Keeps track of all currently running Session Hubs so concurrent joins
//! to the same diagram share one hub instead of racing to spawn two
//! (spec §4.A).
//!
//! Generalizes the teacher's `OpenSessions`: that type only ever needed
//! to reject reuse of a session id, so a bare `HashSet` under a
//! `parking_lot::Mutex` sufficed. Here a lookup miss must *create* a
//! live actor, so the registry holds `SessionHubHandle`s and a regular
//! `tokio::sync::Mutex` guards only the brief create-or-fetch critical
//! section, released before anyone touches the hub itself.

use std::collections::HashMap;
use std::sync::Arc;

use tmi_types::collaborators::{Clock, DiagramStore, EventBus};
use tmi_types::ids::DiagramId;
use tokio::sync::Mutex;

use crate::config::TmiServiceConfig;
use crate::hub::{self, SessionHubHandle};

/// Process-wide directory of live Session Hubs, one per open diagram.
pub struct Registry<D: DiagramStore, C: Clock, E: EventBus> {
    store: Arc<D>,
    clock: Arc<C>,
    event_bus: Arc<E>,
    config: Arc<TmiServiceConfig>,
    hubs: Mutex<HashMap<DiagramId, SessionHubHandle>>,
}

impl<D: DiagramStore, C: Clock, E: EventBus> Registry<D, C, E> {
    /// Builds an empty registry around the collaborators every hub needs.
    pub fn new(store: Arc<D>, clock: Arc<C>, event_bus: Arc<E>, config: Arc<TmiServiceConfig>) -> Self {
        Self { store, clock, event_bus, config, hubs: Mutex::new(HashMap::new()) }
    }

    /// Returns a handle to the hub for `diagram_id`, spawning one if none
    /// is running or the cached handle's task has already exited.
    pub async fn hub_for(&self, diagram_id: DiagramId) -> SessionHubHandle {
        let mut hubs = self.hubs.lock().await;
        if let Some(handle) = hubs.get(&diagram_id)
            && !handle.is_closed()
        {
            return handle.clone();
        }
        let handle = hub::spawn(
            diagram_id,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&self.event_bus),
            Arc::clone(&self.config),
        );
        hubs.insert(diagram_id, handle.clone());
        handle
    }
}
