//! Topology store: an index arena of nodes and directed links.
//!
//! Nodes and links are addressed by dense `usize` indices so diffusion and
//! quorum code can share the graph across worker threads without reference
//! cycles. The adjacency used for diffusion is undirected: a link `a → b`
//! makes `a` and `b` neighbors of each other, and parallel links count once.
//!
//! A `Topology` is immutable while a tick runs. Changes are applied between
//! ticks by building a new version (the controller swaps an `Arc`).

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(NodeId);
string_id!(LinkId);

#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("unknown link: {0}")]
    UnknownLink(String),
    #[error("duplicate node: {0}")]
    DuplicateNode(String),
    #[error("duplicate link: {0}")]
    DuplicateLink(String),
    #[error("link {0} connects a node to itself")]
    SelfLoop(String),
    #[error("link {link} has invalid capacity {capacity}")]
    InvalidCapacity { link: String, capacity: f64 },
}

#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    /// Distinct undirected neighbors (arena indices).
    pub neighbors: BTreeSet<usize>,
}

impl Node {
    pub fn degree(&self) -> usize {
        self.neighbors.len()
    }
}

/// A directed path `from → to`. Traffic shaping and circuit breaking act on
/// links; stress is read from the `to` node's fields.
#[derive(Clone, Debug)]
pub struct Link {
    pub id: LinkId,
    pub from: usize,
    pub to: usize,
    /// Relative capacity weight (> 0).
    pub capacity: f64,
}

/// Out-of-band topology change, applied between ticks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TopologyChange {
    AddNode {
        id: NodeId,
    },
    RemoveNode {
        id: NodeId,
    },
    AddLink {
        id: LinkId,
        from: NodeId,
        to: NodeId,
        #[serde(default = "default_capacity")]
        capacity: f64,
    },
    RemoveLink {
        id: LinkId,
    },
}

fn default_capacity() -> f64 {
    1.0
}

/// Serializable description of a whole topology (scenario files).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopologySpec {
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkSpec {
    pub id: LinkId,
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default = "default_capacity")]
    pub capacity: f64,
}

#[derive(Clone, Debug, Default)]
pub struct Topology {
    nodes: Vec<Node>,
    node_index: HashMap<NodeId, usize>,
    links: Vec<Link>,
    link_index: HashMap<LinkId, usize>,
    /// Outgoing link indices per node.
    outgoing: Vec<Vec<usize>>,
    /// Incoming link indices per node.
    incoming: Vec<Vec<usize>>,
    version: u64,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_spec(spec: &TopologySpec) -> Result<Self, TopologyError> {
        let mut topo = Self::new();
        for id in &spec.nodes {
            topo.add_node(id.clone())?;
        }
        for link in &spec.links {
            topo.add_link(link.id.clone(), &link.from, &link.to, link.capacity)?;
        }
        Ok(topo)
    }

    pub fn to_spec(&self) -> TopologySpec {
        TopologySpec {
            nodes: self.nodes.iter().map(|n| n.id.clone()).collect(),
            links: self
                .links
                .iter()
                .map(|l| LinkSpec {
                    id: l.id.clone(),
                    from: self.nodes[l.from].id.clone(),
                    to: self.nodes[l.to].id.clone(),
                    capacity: l.capacity,
                })
                .collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx)
    }

    pub fn link(&self, idx: usize) -> Option<&Link> {
        self.links.get(idx)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.node_index.get(id).copied()
    }

    pub fn link_index_of(&self, id: &str) -> Option<usize> {
        self.link_index.get(id).copied()
    }

    pub fn link_by_id(&self, id: &str) -> Option<&Link> {
        self.link_index_of(id).map(|i| &self.links[i])
    }

    /// Links leaving `node`.
    pub fn outgoing(&self, node: usize) -> &[usize] {
        self.outgoing.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Links entering `node`.
    pub fn incoming(&self, node: usize) -> &[usize] {
        self.incoming.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn deg_max(&self) -> usize {
        self.nodes.iter().map(Node::degree).max().unwrap_or(0)
    }

    pub fn add_node(&mut self, id: NodeId) -> Result<usize, TopologyError> {
        if self.node_index.contains_key(&id) {
            return Err(TopologyError::DuplicateNode(id.0));
        }
        let idx = self.nodes.len();
        self.node_index.insert(id.clone(), idx);
        self.nodes.push(Node {
            id,
            neighbors: BTreeSet::new(),
        });
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        self.version += 1;
        Ok(idx)
    }

    pub fn add_link(
        &mut self,
        id: LinkId,
        from: &NodeId,
        to: &NodeId,
        capacity: f64,
    ) -> Result<usize, TopologyError> {
        if self.link_index.contains_key(&id) {
            return Err(TopologyError::DuplicateLink(id.0));
        }
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(TopologyError::InvalidCapacity { link: id.0, capacity });
        }
        let a = self
            .index_of(from.as_str())
            .ok_or_else(|| TopologyError::UnknownNode(from.0.clone()))?;
        let b = self
            .index_of(to.as_str())
            .ok_or_else(|| TopologyError::UnknownNode(to.0.clone()))?;
        if a == b {
            return Err(TopologyError::SelfLoop(id.0));
        }

        let idx = self.links.len();
        self.link_index.insert(id.clone(), idx);
        self.links.push(Link {
            id,
            from: a,
            to: b,
            capacity,
        });
        self.outgoing[a].push(idx);
        self.incoming[b].push(idx);
        self.nodes[a].neighbors.insert(b);
        self.nodes[b].neighbors.insert(a);
        self.version += 1;
        Ok(idx)
    }

    /// Apply one change, producing the next topology version.
    ///
    /// Removals compact the arena, so indices are only stable within a
    /// version. Use [`Topology::carry_over`] to move per-node state across.
    pub fn apply(&self, change: &TopologyChange) -> Result<Topology, TopologyError> {
        let mut spec = self.to_spec();
        match change {
            TopologyChange::AddNode { id } => {
                let mut next = self.clone();
                next.add_node(id.clone())?;
                return Ok(next);
            }
            TopologyChange::AddLink {
                id,
                from,
                to,
                capacity,
            } => {
                let mut next = self.clone();
                next.add_link(id.clone(), from, to, *capacity)?;
                return Ok(next);
            }
            TopologyChange::RemoveNode { id } => {
                if self.index_of(id.as_str()).is_none() {
                    return Err(TopologyError::UnknownNode(id.0.clone()));
                }
                spec.nodes.retain(|n| n != id);
                spec.links.retain(|l| &l.from != id && &l.to != id);
            }
            TopologyChange::RemoveLink { id } => {
                if self.link_index_of(id.as_str()).is_none() {
                    return Err(TopologyError::UnknownLink(id.0.clone()));
                }
                spec.links.retain(|l| &l.id != id);
            }
        }
        let mut next = Topology::from_spec(&spec)?;
        next.version = self.version + 1;
        Ok(next)
    }

    /// Move per-node state from `old` indices to this topology's indices,
    /// matching by node id. Nodes new to this topology get `fresh()`.
    pub fn carry_over<T>(&self, old: &Topology, values: Vec<T>, mut fresh: impl FnMut() -> T) -> Vec<T> {
        let mut slots: Vec<Option<T>> = values.into_iter().map(Some).collect();
        self.nodes
            .iter()
            .map(|node| {
                old.index_of(node.id.as_str())
                    .and_then(|i| slots.get_mut(i).and_then(Option::take))
                    .unwrap_or_else(&mut fresh)
            })
            .collect()
    }
}
