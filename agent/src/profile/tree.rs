//! Top-down call tree
//!
//! Nodes live in an arena owned by the tree and refer to each other by
//! [`NodeId`]. Each node stands for one logical function reached through
//! one specific call path from the root. Children are keyed by
//! [`FunctionKey`], so distinct code entries for the same function merge.

use aperture_shared::types::events::CodeTag;
use aperture_shared::types::profile::{DeoptInfo, LineTick};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::collector::code_entry::{CodeEntry, FunctionKey};

/// Name of the entry every tree is rooted at.
pub const ROOT_ENTRY_NAME: &str = "(root)";

/// Index of a node inside its tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// One call-tree node
#[derive(Debug)]
pub struct ProfileNode {
    entry: Arc<CodeEntry>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    children_index: HashMap<FunctionKey, NodeId>,
    self_ticks: u64,
    line_ticks: BTreeMap<u32, u64>,
    deopt_infos: Vec<DeoptInfo>,
    id: u32,
    function_id: u32,
}

impl ProfileNode {
    pub fn entry(&self) -> &Arc<CodeEntry> {
        &self.entry
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in insertion order
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn self_ticks(&self) -> u64 {
        self.self_ticks
    }

    /// Per-line hit counts, ascending by line
    pub fn line_ticks(&self) -> impl Iterator<Item = LineTick> + '_ {
        self.line_ticks.iter().map(|(&line, &hit_count)| LineTick { line, hit_count })
    }

    pub fn line_ticks_count(&self) -> usize {
        self.line_ticks.len()
    }

    pub fn deopt_infos(&self) -> &[DeoptInfo] {
        &self.deopt_infos
    }

    /// Monotonic id, unique within the tree; the root is 1
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Id shared by all nodes of the same logical function
    pub fn function_id(&self) -> u32 {
        self.function_id
    }

    fn increment_line_ticks(&mut self, line: u32) {
        *self.line_ticks.entry(line).or_insert(0) += 1;
    }
}

/// Callbacks of [`ProfileTree::traverse_depth_first`]
pub trait TreeVisitor {
    /// Called when the walk descends from `parent` into `child`.
    fn before_traversing_child(&mut self, _parent: &ProfileNode, _child: &ProfileNode) {}

    /// Called once per node after its whole subtree has been walked.
    fn after_all_children_traversed(&mut self, _node: &ProfileNode) {}

    /// Called once per non-root node, after its subtree, before the walk
    /// moves on to the next sibling.
    fn after_child_traversed(&mut self, _parent: &ProfileNode, _child: &ProfileNode) {}
}

#[derive(Debug)]
pub struct ProfileTree {
    nodes: Vec<ProfileNode>,
    function_ids: HashMap<FunctionKey, u32>,
}

impl Default for ProfileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileTree {
    pub fn new() -> Self {
        let root_entry = Arc::new(CodeEntry::builder(CodeTag::Function, ROOT_ENTRY_NAME).build());
        let mut tree = Self {
            nodes: Vec::new(),
            function_ids: HashMap::new(),
        };
        tree.push_node(root_entry, None);
        tree
    }

    fn push_node(&mut self, entry: Arc<CodeEntry>, parent: Option<NodeId>) -> NodeId {
        let next_function_id = self.function_ids.len() as u32 + 1;
        let function_id = *self
            .function_ids
            .entry(entry.function_key().clone())
            .or_insert(next_function_id);
        let node_id = NodeId(self.nodes.len());
        self.nodes.push(ProfileNode {
            entry,
            parent,
            children: Vec::new(),
            children_index: HashMap::new(),
            self_ticks: 0,
            line_ticks: BTreeMap::new(),
            deopt_infos: Vec::new(),
            id: node_id.0 as u32 + 1,
            function_id,
        });
        node_id
    }

    pub fn root(&self) -> &ProfileNode {
        &self.nodes[NodeId::ROOT.0]
    }

    pub fn node(&self, id: NodeId) -> &ProfileNode {
        &self.nodes[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Child of `parent` for the same logical function as `entry`.
    pub fn find_child(&self, parent: NodeId, entry: &CodeEntry) -> Option<NodeId> {
        self.nodes[parent.0]
            .children_index
            .get(entry.function_key())
            .copied()
    }

    pub fn find_or_add_child(&mut self, parent: NodeId, entry: &Arc<CodeEntry>) -> NodeId {
        if let Some(child) = self.find_child(parent, entry) {
            return child;
        }
        let child = self.push_node(entry.clone(), Some(parent));
        let parent_node = &mut self.nodes[parent.0];
        parent_node.children.push(child);
        parent_node
            .children_index
            .insert(entry.function_key().clone(), child);
        child
    }

    /// Add a leaf-first `path` to the tree, walking it from the outermost
    /// frame. Unresolved frames are skipped. Returns the deepest node
    /// reached, which is the root when nothing resolved.
    pub fn add_path_from_end(
        &mut self,
        path: &[Option<Arc<CodeEntry>>],
        src_line: Option<u32>,
        update_stats: bool,
    ) -> NodeId {
        let mut node = NodeId::ROOT;
        let mut last_entry = None;
        for entry in path.iter().rev().flatten() {
            node = self.find_or_add_child(node, entry);
            last_entry = Some(entry);
        }
        if let Some(info) = last_entry.and_then(|e| e.take_deopt_info()) {
            self.nodes[node.0].deopt_infos.push(info);
        }
        if update_stats {
            let target = &mut self.nodes[node.0];
            target.self_ticks += 1;
            if let Some(line) = src_line {
                target.increment_line_ticks(line);
            }
        }
        node
    }

    /// Follow a path of function names from the root.
    pub fn find_path(&self, names: &[&str]) -> Option<NodeId> {
        let mut current = NodeId::ROOT;
        for name in names {
            current = *self.nodes[current.0]
                .children
                .iter()
                .find(|child| self.nodes[child.0].entry.name() == *name)?;
        }
        Some(current)
    }

    /// Non-recursive depth-first post-order walk over the whole tree.
    pub fn traverse_depth_first<V: TreeVisitor + ?Sized>(&self, visitor: &mut V) {
        struct Position {
            node: NodeId,
            child_idx: usize,
        }

        let mut stack = vec![Position {
            node: NodeId::ROOT,
            child_idx: 0,
        }];
        while let Some(current) = stack.last() {
            let node = &self.nodes[current.node.0];
            if let Some(&child) = node.children.get(current.child_idx) {
                visitor.before_traversing_child(node, &self.nodes[child.0]);
                stack.push(Position {
                    node: child,
                    child_idx: 0,
                });
            } else {
                visitor.after_all_children_traversed(node);
                stack.pop();
                if let Some(parent) = stack.last_mut() {
                    visitor.after_child_traversed(&self.nodes[parent.node.0], node);
                    parent.child_idx += 1;
                }
            }
        }
    }

    /// Self ticks of `id` plus those of every descendant.
    pub fn total_ticks(&self, id: NodeId) -> u64 {
        let mut total = 0;
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            let node = &self.nodes[next.0];
            total += node.self_ticks;
            pending.extend_from_slice(&node.children);
        }
        total
    }

    /// Total ticks of every node, indexed by [`NodeId::index`].
    pub fn total_ticks_by_node(&self) -> Vec<u64> {
        struct Totals(Vec<u64>);

        impl TreeVisitor for Totals {
            fn after_all_children_traversed(&mut self, node: &ProfileNode) {
                self.0[node.id as usize - 1] += node.self_ticks;
            }

            fn after_child_traversed(&mut self, parent: &ProfileNode, child: &ProfileNode) {
                self.0[parent.id as usize - 1] += self.0[child.id as usize - 1];
            }
        }

        let mut totals = Totals(vec![0; self.nodes.len()]);
        self.traverse_depth_first(&mut totals);
        totals.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> Arc<CodeEntry> {
        Arc::new(CodeEntry::builder(CodeTag::Function, name).build())
    }

    fn path(entries: &[&Arc<CodeEntry>]) -> Vec<Option<Arc<CodeEntry>>> {
        entries.iter().map(|e| Some((*e).clone())).collect()
    }

    #[test]
    fn test_add_path_creates_ancestors() {
        let (a, b, c) = (entry("a"), entry("b"), entry("c"));
        let mut tree = ProfileTree::new();

        // Leaf first: c is called by b, which is called by a
        let leaf = tree.add_path_from_end(&path(&[&c, &b, &a]), None, true);

        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.find_path(&["a", "b", "c"]), Some(leaf));
        assert_eq!(tree.node(leaf).self_ticks(), 1);

        let b_node = tree.node(leaf).parent().unwrap();
        let a_node = tree.node(b_node).parent().unwrap();
        assert_eq!(tree.node(b_node).entry().name(), "b");
        assert_eq!(tree.node(a_node).parent(), Some(NodeId::ROOT));
        assert_eq!(tree.root().entry().name(), ROOT_ENTRY_NAME);
    }

    #[test]
    fn test_same_path_reuses_nodes() {
        let (a, b) = (entry("a"), entry("b"));
        let mut tree = ProfileTree::new();

        let mut leaves = Vec::new();
        for _ in 0..5 {
            leaves.push(tree.add_path_from_end(&path(&[&b, &a]), Some(7), true));
        }

        assert!(leaves.iter().all(|l| *l == leaves[0]));
        assert_eq!(tree.node_count(), 3);
        let leaf = tree.node(leaves[0]);
        assert_eq!(leaf.self_ticks(), 5);
        assert_eq!(
            leaf.line_ticks().collect::<Vec<_>>(),
            vec![LineTick { line: 7, hit_count: 5 }]
        );
    }

    #[test]
    fn test_equivalent_entries_merge() {
        let first = Arc::new(CodeEntry::builder(CodeTag::Function, "foo").script(4, 88).build());
        let recompiled = Arc::new(CodeEntry::builder(CodeTag::Function, "foo").script(4, 88).build());
        let mut tree = ProfileTree::new();

        let n1 = tree.add_path_from_end(&path(&[&first]), None, true);
        let n2 = tree.add_path_from_end(&path(&[&recompiled]), None, true);

        assert_eq!(n1, n2);
        assert_eq!(tree.node(n1).self_ticks(), 2);
        assert_eq!(tree.root().children().len(), 1);
    }

    #[test]
    fn test_function_ids_shared_across_paths() {
        let (a, b) = (entry("a"), entry("b"));
        let mut tree = ProfileTree::new();
        let ab = tree.add_path_from_end(&path(&[&b, &a]), None, true);
        let b_top = tree.add_path_from_end(&path(&[&b]), None, true);

        assert_ne!(ab, b_top);
        assert_eq!(tree.node(ab).function_id(), tree.node(b_top).function_id());
        assert_ne!(tree.root().function_id(), tree.node(ab).function_id());
    }

    #[test]
    fn test_unresolved_and_empty_paths_hit_root() {
        let a = entry("a");
        let mut tree = ProfileTree::new();

        assert_eq!(tree.add_path_from_end(&[], None, true), NodeId::ROOT);
        assert_eq!(tree.add_path_from_end(&[None, None], Some(3), true), NodeId::ROOT);
        assert_eq!(tree.root().self_ticks(), 2);
        assert_eq!(tree.root().line_ticks_count(), 1);

        // Unresolved frames in the middle are skipped
        let leaf = tree.add_path_from_end(&[None, Some(a.clone()), None], None, true);
        assert_eq!(tree.node(leaf).parent(), Some(NodeId::ROOT));
    }

    #[test]
    fn test_no_stats_update() {
        let a = entry("a");
        let mut tree = ProfileTree::new();
        let leaf = tree.add_path_from_end(&path(&[&a]), Some(1), false);

        assert_eq!(tree.node(leaf).self_ticks(), 0);
        assert_eq!(tree.node(leaf).line_ticks_count(), 0);
        assert_eq!(tree.node_count(), 2);
    }

    #[test]
    fn test_deopt_moved_to_node_once() {
        let a = entry("a");
        a.set_deopt_info("not a Smi", 1, 4);
        let mut tree = ProfileTree::new();

        let leaf = tree.add_path_from_end(&path(&[&a]), None, true);
        tree.add_path_from_end(&path(&[&a]), None, true);

        assert_eq!(tree.node(leaf).deopt_infos().len(), 1);
        assert_eq!(tree.node(leaf).deopt_infos()[0].reason, "not a Smi");
        assert!(!a.has_deopt_info());
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl TreeVisitor for Recorder {
        fn before_traversing_child(&mut self, parent: &ProfileNode, child: &ProfileNode) {
            self.events
                .push(format!("enter {}->{}", parent.entry().name(), child.entry().name()));
        }

        fn after_all_children_traversed(&mut self, node: &ProfileNode) {
            self.events.push(format!("done {}", node.entry().name()));
        }

        fn after_child_traversed(&mut self, parent: &ProfileNode, child: &ProfileNode) {
            self.events
                .push(format!("leave {}->{}", parent.entry().name(), child.entry().name()));
        }
    }

    #[test]
    fn test_traversal_order() {
        let (a, b, c) = (entry("a"), entry("b"), entry("c"));
        let mut tree = ProfileTree::new();
        tree.add_path_from_end(&path(&[&b, &a]), None, true);
        tree.add_path_from_end(&path(&[&c, &a]), None, true);

        let mut recorder = Recorder::default();
        tree.traverse_depth_first(&mut recorder);

        assert_eq!(
            recorder.events,
            vec![
                "enter (root)->a",
                "enter a->b",
                "done b",
                "leave a->b",
                "enter a->c",
                "done c",
                "leave a->c",
                "done a",
                "leave (root)->a",
                "done (root)",
            ]
        );
    }

    #[test]
    fn test_traversal_completeness() {
        let entries: Vec<_> = (0..6).map(|i| entry(&format!("f{}", i))).collect();
        let mut tree = ProfileTree::new();
        tree.add_path_from_end(&path(&[&entries[2], &entries[1], &entries[0]]), None, true);
        tree.add_path_from_end(&path(&[&entries[3], &entries[1], &entries[0]]), None, true);
        tree.add_path_from_end(&path(&[&entries[5], &entries[4]]), None, true);

        struct Counter {
            done: HashMap<u32, usize>,
            after_child: HashMap<u32, (u32, usize)>,
            violations: usize,
        }

        impl TreeVisitor for Counter {
            fn after_all_children_traversed(&mut self, node: &ProfileNode) {
                *self.done.entry(node.id()).or_insert(0) += 1;
            }

            fn after_child_traversed(&mut self, parent: &ProfileNode, child: &ProfileNode) {
                if self.done.contains_key(&parent.id()) || !self.done.contains_key(&child.id()) {
                    self.violations += 1;
                }
                let slot = self.after_child.entry(child.id()).or_insert((parent.id(), 0));
                slot.1 += 1;
            }
        }

        let mut counter = Counter {
            done: HashMap::new(),
            after_child: HashMap::new(),
            violations: 0,
        };
        tree.traverse_depth_first(&mut counter);

        let k = tree.node_count();
        assert_eq!(k, 7);
        assert_eq!(counter.done.len(), k);
        assert!(counter.done.values().all(|&n| n == 1));
        assert_eq!(counter.after_child.len(), k - 1);
        for (child, (parent, count)) in &counter.after_child {
            assert_eq!(*count, 1);
            let child_node = tree.node(NodeId(*child as usize - 1));
            assert_eq!(tree.node(child_node.parent().unwrap()).id(), *parent);
        }
        assert_eq!(counter.violations, 0);
    }

    #[test]
    fn test_total_ticks() {
        let (a, b, c) = (entry("a"), entry("b"), entry("c"));
        let mut tree = ProfileTree::new();
        tree.add_path_from_end(&path(&[&a]), None, true);
        tree.add_path_from_end(&path(&[&b, &a]), None, true);
        tree.add_path_from_end(&path(&[&b, &a]), None, true);
        tree.add_path_from_end(&path(&[&c]), None, true);

        let a_node = tree.find_path(&["a"]).unwrap();
        assert_eq!(tree.total_ticks(a_node), 3);
        assert_eq!(tree.total_ticks(NodeId::ROOT), 4);

        let totals = tree.total_ticks_by_node();
        assert_eq!(totals[NodeId::ROOT.index()], 4);
        assert_eq!(totals[a_node.index()], 3);
        assert_eq!(totals[tree.find_path(&["c"]).unwrap().index()], 1);
    }
}
