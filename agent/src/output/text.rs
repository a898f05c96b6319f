//! Text output
//!
//! Indented top-down dump of a call tree: self ticks, name, script id and
//! node id, then the source location, deopt log and bailout reason.

use std::io::{self, Write};

use crate::profile::tree::{ProfileNode, TreeVisitor};
use crate::profile::CpuProfile;

const INDENT_STEP: usize = 2;
const DETAIL_INDENT: usize = 10;

struct TreePrinter<'w, W: Write> {
    out: &'w mut W,
    depth: usize,
    error: Option<io::Error>,
}

impl<W: Write> TreePrinter<'_, W> {
    fn print(&mut self, node: &ProfileNode) {
        if self.error.is_none() {
            if let Err(e) = write_node(self.out, node, self.depth * INDENT_STEP) {
                self.error = Some(e);
            }
        }
    }
}

impl<W: Write> TreeVisitor for TreePrinter<'_, W> {
    fn before_traversing_child(&mut self, _parent: &ProfileNode, child: &ProfileNode) {
        self.depth += 1;
        self.print(child);
    }

    fn after_child_traversed(&mut self, _parent: &ProfileNode, _child: &ProfileNode) {
        self.depth -= 1;
    }
}

fn write_node(out: &mut impl Write, node: &ProfileNode, indent: usize) -> io::Result<()> {
    let entry = node.entry();
    write!(
        out,
        "{:5} {:indent$} {}{} {} #{}",
        node.self_ticks(),
        "",
        entry.name_prefix(),
        entry.name(),
        entry.script_id().unwrap_or(0),
        node.id(),
        indent = indent
    )?;
    if !entry.resource_name().is_empty() {
        write!(
            out,
            "  {}:{}",
            entry.resource_name(),
            entry.line_number().unwrap_or(0)
        )?;
    }
    writeln!(out)?;

    let detail = indent + DETAIL_INDENT;
    for info in node.deopt_infos() {
        let mut frames = info.stack.iter();
        if let Some(first) = frames.next() {
            writeln!(
                out,
                "{:detail$};;; deopted at script_id: {} position: {} with reason '{}'.",
                "",
                first.script_id.unwrap_or(0),
                first.position,
                info.reason,
                detail = detail
            )?;
        }
        for frame in frames {
            writeln!(
                out,
                "{:detail$};;;     Inline point: script_id {} position: {}.",
                "",
                frame.script_id.unwrap_or(0),
                frame.position,
                detail = detail
            )?;
        }
    }
    if let Some(reason) = entry.bailout_reason() {
        writeln!(out, "{:detail$} bailed out due to '{}'", "", reason, detail = detail)?;
    }
    Ok(())
}

/// Write the top-down tree of `profile`.
pub fn write_tree(profile: &CpuProfile, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "[Top down]:")?;
    profile.with_tree(|tree| {
        let mut printer = TreePrinter {
            out: &mut *out,
            depth: 0,
            error: None,
        };
        printer.print(tree.root());
        tree.traverse_depth_first(&mut printer);
        printer.error.map_or(Ok(()), Err)
    })
}

/// The top-down tree of `profile` as a string.
pub fn tree_to_string(profile: &CpuProfile) -> String {
    let mut out = Vec::new();
    // Writing into a Vec cannot fail
    let _ = write_tree(profile, &mut out);
    String::from_utf8_lossy(&out).into_owned()
}
