//! A toy `DiagramStore`: diagrams live only in process memory and are
//! lost on restart. Stands in for a real Postgres/S3-backed store.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tmi_types::collaborators::{DiagramStore, HistorySlice};
use tmi_types::diagram::Diagram;
use tmi_types::ids::DiagramId;

/// Holds every diagram's latest snapshot in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDiagramStore {
    diagrams: Arc<Mutex<HashMap<DiagramId, Diagram>>>,
}

#[async_trait]
impl DiagramStore for InMemoryDiagramStore {
    type Error = Infallible;

    async fn load(&self, diagram_id: DiagramId) -> Result<Diagram, Self::Error> {
        Ok(self.diagrams.lock().get(&diagram_id).cloned().unwrap_or_else(|| Diagram::empty(Utc::now())))
    }

    async fn persist(&self, diagram_id: DiagramId, diagram: &Diagram, history: &HistorySlice) -> Result<(), Self::Error> {
        tracing::debug!(%diagram_id, operations = history.operations.len(), "persisting diagram snapshot");
        self.diagrams.lock().insert(diagram_id, diagram.clone());
        Ok(())
    }
}
