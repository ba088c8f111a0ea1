//! Graph files.
//!
//! The hub only needs load and save hooks; [`FileStore`] keeps the graph as
//! a JSON or YAML document chosen by file extension.

use crate::graph::{format_node_id, parse_node_id, MeshEdge, MeshGraph};
use crate::TopologyError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load/save hooks for the hub's graph
pub trait GraphStore: Send + Sync {
    /// Read the graph
    fn load(&self) -> Result<MeshGraph, TopologyError>;

    /// Write the graph, optionally keeping the previous copy
    fn save(&self, graph: &MeshGraph, backup: bool) -> Result<(), TopologyError>;
}

/// Serialized node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// `0x%06X` node id
    pub id: String,
    /// Free-text tag
    #[serde(default)]
    pub tag: String,
    /// Firmware revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// Coordinator flag, restores the local node on load
    #[serde(default)]
    pub coordinator: bool,
    /// Layout hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<(f32, f32)>,
}

/// Serialized edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// One end, `0x%06X`
    pub from: String,
    /// Other end, `0x%06X`
    pub to: String,
    /// Cost as seen by the remote end
    pub cost_remote: f64,
    /// Cost as seen locally
    pub cost_local: f64,
}

/// Graph file contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    /// Nodes
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    /// Edges
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

impl GraphDocument {
    /// Snapshot a graph
    pub fn from_graph(graph: &MeshGraph) -> Self {
        let nodes = graph
            .nodes()
            .map(|n| NodeRecord {
                id: format_node_id(n.id),
                tag: n.tag.clone(),
                firmware: n.firmware.clone(),
                coordinator: n.coordinator,
                position: n.position,
            })
            .collect();
        let edges = graph
            .edges()
            .map(|(a, b, e)| EdgeRecord {
                from: format_node_id(a),
                to: format_node_id(b),
                cost_remote: e.cost_remote,
                cost_local: e.cost_local,
            })
            .collect();
        Self { nodes, edges }
    }

    /// Rebuild the graph; edges may name nodes the node list lacks
    pub fn into_graph(self) -> Result<MeshGraph, TopologyError> {
        let mut graph = MeshGraph::new();
        for record in self.nodes {
            let node = graph.add_node(parse_node_id(&record.id)?, &record.tag);
            node.firmware = record.firmware;
            node.coordinator = record.coordinator;
            node.position = record.position;
        }
        for record in self.edges {
            let from = parse_node_id(&record.from)?;
            let to = parse_node_id(&record.to)?;
            graph.add_node(from, "");
            graph.add_node(to, "");
            graph.add_edge(from, to, MeshEdge::new(record.cost_remote, record.cost_local))?;
        }
        graph.restore_local_node();
        Ok(graph)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

/// Graph kept in a single file
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Store at `path`; `.yaml`/`.yml` selects YAML, anything else JSON
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the previous copy goes on a backed-up save
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    fn format(&self) -> Format {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Format::Yaml,
            _ => Format::Json,
        }
    }
}

impl GraphStore for FileStore {
    fn load(&self) -> Result<MeshGraph, TopologyError> {
        let text = fs::read_to_string(&self.path)?;
        let document: GraphDocument = match self.format() {
            Format::Json => serde_json::from_str(&text)?,
            Format::Yaml => serde_yaml::from_str(&text)?,
        };
        let graph = document.into_graph()?;
        info!(
            "Loaded graph from {} ({} nodes, {} edges)",
            self.path.display(),
            graph.node_count(),
            graph.edge_count()
        );
        Ok(graph)
    }

    fn save(&self, graph: &MeshGraph, backup: bool) -> Result<(), TopologyError> {
        let document = GraphDocument::from_graph(graph);
        let text = match self.format() {
            Format::Json => serde_json::to_string_pretty(&document)?,
            Format::Yaml => serde_yaml::to_string(&document)?,
        };
        if backup && self.path.exists() {
            fs::rename(&self.path, self.backup_path())?;
        }
        fs::write(&self.path, text)?;
        info!("Saved graph to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> MeshGraph {
        let mut graph = MeshGraph::new();
        graph.add_node(0x112233, "hall").firmware = Some("1.4.2".to_string());
        graph.add_node(0x445566, "garage").position = Some((10.0, -3.5));
        graph
            .add_edge(0x112233, 0x445566, MeshEdge::new(0.25, 0.5))
            .unwrap();
        graph.set_local_node(0x112233);
        graph
    }

    #[test]
    fn test_json_store_restores_graph() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("mesh.graph.json"));
        store.save(&sample(), false).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"0x112233\""));

        let graph = store.load().unwrap();
        assert_eq!(graph.local_node(), Some(0x112233));
        assert_eq!(graph.node(0x112233).unwrap().firmware.as_deref(), Some("1.4.2"));
        assert_eq!(graph.node(0x445566).unwrap().position, Some((10.0, -3.5)));
        assert_eq!(graph.edge(0x445566, 0x112233), Some(&MeshEdge::new(0.25, 0.5)));
    }

    #[test]
    fn test_yaml_store_by_extension() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("mesh.yaml"));
        store.save(&sample(), false).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("cost_remote"));
        assert!(!text.trim_start().starts_with('{'));
        assert_eq!(store.load().unwrap().node_count(), 2);
    }

    #[test]
    fn test_save_with_backup_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("mesh.json"));
        store.save(&sample(), false).unwrap();

        let mut graph = sample();
        graph.add_node(0x778899, "new");
        store.save(&graph, true).unwrap();

        let previous = FileStore::new(store.backup_path()).load().unwrap();
        assert_eq!(previous.node_count(), 2);
        assert_eq!(store.load().unwrap().node_count(), 3);
    }

    #[test]
    fn test_edges_add_missing_nodes() {
        let document = GraphDocument {
            nodes: vec![],
            edges: vec![EdgeRecord {
                from: "0x000001".to_string(),
                to: "0x000002".to_string(),
                cost_remote: 0.1,
                cost_local: 0.2,
            }],
        };
        let graph = document.into_graph().unwrap();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.local_node(), None);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("absent.json"));
        assert!(matches!(store.load(), Err(TopologyError::Io(_))));
    }
}
