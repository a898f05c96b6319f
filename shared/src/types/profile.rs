//! Profile snapshot data structures
//!
//! These types represent a finished profile in a form suitable for storage
//! and visualization. The call tree is flattened into a node list where
//! children are referenced by id, so arbitrarily deep trees serialize
//! without recursion.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::events::Timestamp;

/// One frame of the stack at which code was deoptimized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeoptFrame {
    pub script_id: Option<i32>,
    pub position: u64,
}

/// A deoptimization observed while a node was being sampled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeoptInfo {
    pub reason: String,

    /// Innermost frame first; the rest are inline points
    pub stack: Vec<DeoptFrame>,
}

/// Hit count of a single source line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTick {
    pub line: u32,
    pub hit_count: u64,
}

/// One call-tree node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Node id, unique within the profile
    pub id: u32,

    /// Id shared by every node of the same logical function
    pub function_id: u32,

    pub parent: Option<u32>,
    pub name: String,
    pub name_prefix: String,
    pub resource_name: String,
    pub script_id: Option<i32>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub bailout_reason: Option<String>,
    pub self_ticks: u64,
    pub total_ticks: u64,

    /// Ascending by line
    pub line_ticks: Vec<LineTick>,
    pub deopt_infos: Vec<DeoptInfo>,

    /// Child node ids in insertion order
    pub children: Vec<u32>,
}

/// One entry of the sample timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub timestamp: Timestamp,
    pub node_id: u32,
}

/// A finished profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub title: String,
    pub start_time: Timestamp,
    pub end_time: Option<Timestamp>,
    pub record_samples: bool,

    /// Pre-order; the first node is the root
    pub nodes: Vec<NodeSnapshot>,

    /// Empty unless samples were recorded
    pub samples: Vec<SampleRecord>,
}

impl ProfileSnapshot {
    pub fn root(&self) -> Option<&NodeSnapshot> {
        self.nodes.first()
    }

    /// Ticks attributed anywhere in the tree
    pub fn total_ticks(&self) -> u64 {
        self.root().map_or(0, |r| r.total_ticks)
    }

    /// Duration of the profile, zero while it is still running
    pub fn duration_ns(&self) -> u64 {
        self.end_time
            .map_or(0, |end| end.saturating_sub(self.start_time))
    }

    pub fn node(&self, id: u32) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Follow a path of function names from the root.
    pub fn find_path(&self, names: &[&str]) -> Option<&NodeSnapshot> {
        let by_id: HashMap<u32, &NodeSnapshot> = self.nodes.iter().map(|n| (n.id, n)).collect();
        let mut current = self.root()?;
        for name in names {
            current = current
                .children
                .iter()
                .filter_map(|id| by_id.get(id).copied())
                .find(|child| child.name == *name)?;
        }
        Some(current)
    }
}
