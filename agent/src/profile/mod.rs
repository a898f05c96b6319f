//! Profiling sessions
//!
//! A [`CpuProfile`] is one profiling session: a call tree, an optional
//! timeline of samples and the session metadata. Profiles are shared
//! between the sampling side, which feeds them paths, and the consumer,
//! which reads them once they are finished.

pub mod collection;
pub mod tree;

use aperture_shared::types::events::Timestamp;
use aperture_shared::types::profile::{NodeSnapshot, ProfileSnapshot, SampleRecord};
use aperture_shared::utils::time::system_time_nanos;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::collector::code_entry::CodeEntry;
use tree::{NodeId, ProfileNode, ProfileTree, TreeVisitor};

#[derive(Debug)]
struct ProfileData {
    tree: ProfileTree,
    timestamps: Vec<Timestamp>,
    samples: Vec<NodeId>,
    end_time: Option<Timestamp>,
}

/// One profiling session
#[derive(Debug)]
pub struct CpuProfile {
    title: String,
    record_samples: bool,
    start_time: Timestamp,
    data: Mutex<ProfileData>,
}

impl CpuProfile {
    pub fn new(title: &str, record_samples: bool) -> Self {
        Self {
            title: title.to_string(),
            record_samples,
            start_time: system_time_nanos(),
            data: Mutex::new(ProfileData {
                tree: ProfileTree::new(),
                timestamps: Vec::new(),
                samples: Vec::new(),
                end_time: None,
            }),
        }
    }

    fn data(&self) -> MutexGuard<'_, ProfileData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn record_samples(&self) -> bool {
        self.record_samples
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Set once the session has been stopped
    pub fn end_time(&self) -> Option<Timestamp> {
        self.data().end_time
    }

    pub fn is_finished(&self) -> bool {
        self.end_time().is_some()
    }

    /// Feed one resolved path into the tree and, when recording, the
    /// timeline. Samples without a timestamp (zero) count in the tree but
    /// stay off the timeline.
    pub fn add_path(
        &self,
        timestamp: Timestamp,
        path: &[Option<Arc<CodeEntry>>],
        src_line: Option<u32>,
        update_stats: bool,
    ) {
        let mut data = self.data();
        let top_frame_node = data.tree.add_path_from_end(path, src_line, update_stats);
        if self.record_samples && timestamp != 0 {
            data.timestamps.push(timestamp);
            data.samples.push(top_frame_node);
        }
    }

    /// Fix the end time. Later calls keep the first value.
    pub(crate) fn finish(&self) {
        let mut data = self.data();
        if data.end_time.is_none() {
            data.end_time = Some(system_time_nanos().max(self.start_time));
        }
    }

    pub fn samples_count(&self) -> usize {
        self.data().samples.len()
    }

    /// `(timestamp, leaf node id)` per recorded sample, in arrival order.
    /// Empty unless the session was started with sample recording.
    pub fn sample_log(&self) -> Vec<(Timestamp, u32)> {
        let data = self.data();
        data.timestamps
            .iter()
            .zip(&data.samples)
            .map(|(&ts, &node)| (ts, data.tree.node(node).id()))
            .collect()
    }

    /// Run `f` against the call tree while holding the profile lock.
    pub fn with_tree<R>(&self, f: impl FnOnce(&ProfileTree) -> R) -> R {
        f(&self.data().tree)
    }

    pub fn traverse<V: TreeVisitor + ?Sized>(&self, visitor: &mut V) {
        self.data().tree.traverse_depth_first(visitor);
    }

    /// Serializable copy of the profile
    pub fn snapshot(&self) -> ProfileSnapshot {
        let data = self.data();
        let totals = data.tree.total_ticks_by_node();

        struct Flatten<'a> {
            tree: &'a ProfileTree,
            totals: &'a [u64],
            nodes: Vec<NodeSnapshot>,
        }

        impl Flatten<'_> {
            fn push(&mut self, node: &ProfileNode, parent: Option<&ProfileNode>) {
                let entry = node.entry();
                self.nodes.push(NodeSnapshot {
                    id: node.id(),
                    function_id: node.function_id(),
                    parent: parent.map(ProfileNode::id),
                    name: entry.name().to_string(),
                    name_prefix: entry.name_prefix().to_string(),
                    resource_name: entry.resource_name().to_string(),
                    script_id: entry.script_id(),
                    line: entry.line_number(),
                    column: entry.column_number(),
                    bailout_reason: entry.bailout_reason().map(|r| r.to_string()),
                    self_ticks: node.self_ticks(),
                    total_ticks: self.totals[node.id() as usize - 1],
                    line_ticks: node.line_ticks().collect(),
                    deopt_infos: node.deopt_infos().to_vec(),
                    children: node
                        .children()
                        .iter()
                        .map(|child| self.tree.node(*child).id())
                        .collect(),
                });
            }
        }

        impl TreeVisitor for Flatten<'_> {
            fn before_traversing_child(&mut self, parent: &ProfileNode, child: &ProfileNode) {
                self.push(child, Some(parent));
            }
        }

        let mut flatten = Flatten {
            tree: &data.tree,
            totals: &totals,
            nodes: Vec::with_capacity(data.tree.node_count()),
        };
        flatten.push(data.tree.root(), None);
        data.tree.traverse_depth_first(&mut flatten);
        let nodes = flatten.nodes;

        let samples = data
            .timestamps
            .iter()
            .zip(&data.samples)
            .map(|(&timestamp, &node)| SampleRecord {
                timestamp,
                node_id: data.tree.node(node).id(),
            })
            .collect();

        ProfileSnapshot {
            title: self.title.clone(),
            start_time: self.start_time,
            end_time: data.end_time,
            record_samples: self.record_samples,
            nodes,
            samples,
        }
    }
}
