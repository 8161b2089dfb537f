//! The diagram data model: cells, their geometry, and the working diagram
//! itself.
//!
//! Styling/port maps are modeled as opaque [`serde_json::Value`]s rather
//! than a closed set of fields — new shapes or attribute keys never
//! require a change to the mutation pipeline in `tmi-core`, only to the
//! set of recognized `shape` tags.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::CellId;

/// The shape of a node cell. Immutable once a cell is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Shape {
    /// An external actor interacting with the system.
    Actor,
    /// A process that transforms data.
    Process,
    /// A data store at rest.
    Store,
    /// A security/trust boundary.
    SecurityBoundary,
    /// A free-floating text annotation.
    TextBox,
}

/// A 2D point, used for node positions and edge vertices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

/// A 2D extent, used for node sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    /// Width.
    pub w: f64,
    /// Height.
    pub h: f64,
}

/// Either end of an edge: a reference to another cell, or a free point not
/// attached to anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellEndpoint {
    /// The endpoint is anchored to an existing cell.
    Cell(CellId),
    /// The endpoint floats at a fixed point.
    Point(Point),
}

impl CellEndpoint {
    /// Returns the referenced cell id, if this endpoint is anchored.
    pub fn cell_id(&self) -> Option<CellId> {
        match self {
            CellEndpoint::Cell(id) => Some(*id),
            CellEndpoint::Point(_) => None,
        }
    }
}

/// A node: an actor, process, store, security boundary, or text box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// The node's shape. Immutable after creation.
    pub shape: Shape,
    /// Top-left position in diagram coordinates.
    pub position: Point,
    /// Width/height of the node.
    pub size: Size,
    /// Optional rotation, in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
    /// Opaque styling object, validated only for size/well-formedness.
    #[serde(default)]
    pub attrs: Value,
    /// Opaque port map.
    #[serde(default)]
    pub ports: Value,
    /// Optional parent cell; must reference an existing cell and must not
    /// form a cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CellId>,
}

/// An edge connecting two endpoints, with an ordered polyline of
/// intermediate vertices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// The edge's source endpoint.
    pub source: CellEndpoint,
    /// The edge's target endpoint.
    pub target: CellEndpoint,
    /// Ordered intermediate routing points.
    #[serde(default)]
    pub vertices: Vec<Point>,
    /// Opaque styling object.
    #[serde(default)]
    pub attrs: Value,
}

/// A single cell in a diagram: either a node or an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "snake_case")]
pub enum Cell {
    /// A node cell.
    Node(Node),
    /// An edge cell.
    Edge(Edge),
}

impl Cell {
    /// Returns the cell ids this cell structurally references: the parent
    /// for a node, the anchored endpoints for an edge.
    pub fn referenced_cells(&self) -> Vec<CellId> {
        match self {
            Cell::Node(node) => node.parent.into_iter().collect(),
            Cell::Edge(edge) => [edge.source.cell_id(), edge.target.cell_id()]
                .into_iter()
                .flatten()
                .collect(),
        }
    }

    /// Returns `true` if this cell is an edge whose source or target names
    /// `cell_id`.
    pub fn references_as_edge(&self, cell_id: CellId) -> bool {
        match self {
            Cell::Node(_) => false,
            Cell::Edge(edge) => {
                edge.source.cell_id() == Some(cell_id) || edge.target.cell_id() == Some(cell_id)
            }
        }
    }

    /// The immutable shape tag, if this is a node.
    pub fn shape(&self) -> Option<Shape> {
        match self {
            Cell::Node(node) => Some(node.shape),
            Cell::Edge(_) => None,
        }
    }
}

/// A cell paired with its id, the unit `add_cells`/`remove_cells` operate
/// on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedCell {
    /// The cell's id, unique within the diagram.
    pub id: CellId,
    /// The cell itself.
    pub cell: Cell,
}

/// The working copy of a diagram, owned exclusively by one Session Hub
/// while the diagram is being collaboratively edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagram {
    /// Monotonic version, bumped by every applied operation.
    pub version: u64,
    /// All cells, keyed by id.
    pub cells: HashMap<CellId, Cell>,
    /// Server clock of the last applied operation.
    pub updated_at: DateTime<Utc>,
    /// `true` iff the working diagram has diverged from the last
    /// persisted snapshot.
    pub dirty: bool,
}

impl Diagram {
    /// Creates an empty diagram, as loaded for a threat model that has no
    /// diagram content yet.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            cells: HashMap::new(),
            updated_at: now,
            dirty: false,
        }
    }

    /// Returns `true` iff a cell with this id exists.
    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    /// All edges that reference `cell_id` as source or target.
    pub fn edges_referencing(&self, cell_id: CellId) -> Vec<CellId> {
        self.cells
            .iter()
            .filter(|(_, cell)| cell.references_as_edge(cell_id))
            .map(|(id, _)| *id)
            .collect()
    }
}
