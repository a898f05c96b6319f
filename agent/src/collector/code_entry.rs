//! Code entries
//!
//! A [`CodeEntry`] describes one logical unit of generated code: a function,
//! builtin, callback, regexp or stub. Address ranges in the code map and
//! nodes in call trees both refer to entries through `Arc<CodeEntry>`.
//! Identity fields are fixed at construction; only the pending deopt and
//! the bailout reason change afterwards.

use aperture_shared::types::events::{
    Address, BuiltinId, CodeCreateEvent, CodeTag, DeoptInlinedFrame, InlinedFunction,
};
use aperture_shared::types::profile::{DeoptFrame, DeoptInfo};
use aperture_shared::utils::source_position;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mapping from pc offsets inside a code object to 1-based source lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    pc_offset_map: BTreeMap<u32, u32>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that code at `pc_offset` belongs to `line`. Non-positive
    /// lines carry no information and are ignored, as are offsets whose
    /// lookup already yields `line`.
    pub fn set_position(&mut self, pc_offset: u32, line: i64) {
        let Some(line) = source_position(Some(line)) else {
            return;
        };
        if self.source_line(pc_offset) != Some(line) {
            self.pc_offset_map.entry(pc_offset).or_insert(line);
        }
    }

    /// Line of the first recorded offset at or after `pc_offset`, or the
    /// last recorded line when `pc_offset` is past every entry.
    pub fn source_line(&self, pc_offset: u32) -> Option<u32> {
        self.pc_offset_map
            .range(pc_offset..)
            .next()
            .or_else(|| self.pc_offset_map.iter().next_back())
            .map(|(_, line)| *line)
    }

    pub fn is_empty(&self) -> bool {
        self.pc_offset_map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pc_offset_map.len()
    }
}

/// Key under which two entries count as the same logical function.
///
/// With a script id, script id and start position decide. Without one,
/// name prefix, name, resource name and line number must all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FunctionKey {
    Script {
        script_id: i32,
        position: u32,
    },
    Named {
        name_prefix: Arc<str>,
        name: Arc<str>,
        resource_name: Arc<str>,
        line: Option<u32>,
    },
}

/// A deoptimization reported for an entry and not yet attributed to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDeopt {
    pub reason: Arc<str>,
    pub deopt_id: i32,
    pub position: u32,
}

#[derive(Debug, Default)]
struct EntryState {
    bailout_reason: Option<Arc<str>>,
    deopt: Option<PendingDeopt>,
}

/// Identity and tables of one logical unit of generated code
pub struct CodeEntry {
    tag: CodeTag,
    builtin: Option<BuiltinId>,
    name: Arc<str>,
    name_prefix: Arc<str>,
    resource_name: Arc<str>,
    script_id: Option<i32>,
    position: u32,
    line_number: Option<u32>,
    column_number: Option<u32>,
    instruction_start: Address,
    line_info: Option<LineTable>,
    /// Inlined functions per pc offset, outermost first
    inline_locations: HashMap<u32, Vec<Arc<CodeEntry>>>,
    deopt_inlined_frames: HashMap<i32, Vec<DeoptInlinedFrame>>,
    key: FunctionKey,
    state: Mutex<EntryState>,
}

impl fmt::Debug for CodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeEntry")
            .field("tag", &self.tag)
            .field("name", &self.name)
            .field("resource_name", &self.resource_name)
            .field("script_id", &self.script_id)
            .field("position", &self.position)
            .field("line_number", &self.line_number)
            .field("instruction_start", &format_args!("{:#x}", self.instruction_start))
            .finish_non_exhaustive()
    }
}

impl CodeEntry {
    pub fn builder(tag: CodeTag, name: &str) -> CodeEntryBuilder {
        CodeEntryBuilder::new(tag, name)
    }

    pub fn tag(&self) -> CodeTag {
        self.tag
    }

    pub fn builtin(&self) -> Option<BuiltinId> {
        self.builtin
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn script_id(&self) -> Option<i32> {
        self.script_id
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn line_number(&self) -> Option<u32> {
        self.line_number
    }

    pub fn column_number(&self) -> Option<u32> {
        self.column_number
    }

    pub fn instruction_start(&self) -> Address {
        self.instruction_start
    }

    pub fn function_key(&self) -> &FunctionKey {
        &self.key
    }

    /// Whether `self` and `other` are the same logical function.
    pub fn is_same_function_as(&self, other: &CodeEntry) -> bool {
        std::ptr::eq(self, other) || self.key == other.key
    }

    /// Source line for a pc offset from the line table, if there is one.
    pub fn source_line(&self, pc_offset: u32) -> Option<u32> {
        self.line_info
            .as_ref()
            .filter(|table| !table.is_empty())
            .and_then(|table| table.source_line(pc_offset))
    }

    /// Inlined functions active at exactly `pc_offset`, outermost first.
    pub fn inline_stack(&self, pc_offset: u32) -> Option<&[Arc<CodeEntry>]> {
        self.inline_locations.get(&pc_offset).map(Vec::as_slice)
    }

    pub fn has_deopt_inlined_frames_for(&self, deopt_id: i32) -> bool {
        self.deopt_inlined_frames.contains_key(&deopt_id)
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bailout_reason(&self) -> Option<Arc<str>> {
        self.state().bailout_reason.clone()
    }

    pub fn set_bailout_reason(&self, reason: &str) {
        self.state().bailout_reason = (!reason.is_empty()).then(|| Arc::from(reason));
    }

    /// Record a deoptimization. A newer deopt replaces one that has not
    /// been attributed to a node yet.
    pub fn set_deopt_info(&self, reason: &str, deopt_id: i32, position: u32) {
        self.state().deopt = Some(PendingDeopt {
            reason: Arc::from(reason),
            deopt_id,
            position,
        });
    }

    pub fn has_deopt_info(&self) -> bool {
        self.state().deopt.is_some()
    }

    /// Take the pending deopt, converting it into a deopt-log entry.
    /// Each deopt is handed out at most once.
    pub fn take_deopt_info(&self) -> Option<DeoptInfo> {
        let pending = self.state().deopt.take()?;
        Some(self.deopt_info(&pending))
    }

    fn deopt_info(&self, pending: &PendingDeopt) -> DeoptInfo {
        let stack = match self.deopt_inlined_frames.get(&pending.deopt_id) {
            None => vec![DeoptFrame {
                script_id: self.script_id,
                position: u64::from(self.position) + u64::from(pending.position),
            }],
            Some(frames) => {
                let mut deopt_position = u64::from(pending.position);
                let mut stack = Vec::with_capacity(frames.len());
                for frame in frames.iter().rev() {
                    stack.push(DeoptFrame {
                        script_id: frame.script_id,
                        position: deopt_position + u64::from(frame.position),
                    });
                    // Only the innermost frame carries the deopt offset.
                    deopt_position = 0;
                }
                stack
            }
        };
        DeoptInfo {
            reason: pending.reason.to_string(),
            stack,
        }
    }
}

/// Builder for [`CodeEntry`]
pub struct CodeEntryBuilder {
    tag: CodeTag,
    builtin: Option<BuiltinId>,
    name: Arc<str>,
    name_prefix: Arc<str>,
    resource_name: Arc<str>,
    script_id: Option<i32>,
    position: u32,
    line_number: Option<u32>,
    column_number: Option<u32>,
    instruction_start: Address,
    line_info: Option<LineTable>,
    inline_locations: HashMap<u32, Vec<Arc<CodeEntry>>>,
    deopt_inlined_frames: HashMap<i32, Vec<DeoptInlinedFrame>>,
    bailout_reason: Option<Arc<str>>,
}

impl CodeEntryBuilder {
    fn new(tag: CodeTag, name: &str) -> Self {
        Self {
            tag,
            builtin: None,
            name: Arc::from(name),
            name_prefix: Arc::from(""),
            resource_name: Arc::from(""),
            script_id: None,
            position: 0,
            line_number: None,
            column_number: None,
            instruction_start: 0,
            line_info: None,
            inline_locations: HashMap::new(),
            deopt_inlined_frames: HashMap::new(),
            bailout_reason: None,
        }
    }

    pub fn builtin(mut self, id: BuiltinId) -> Self {
        self.tag = CodeTag::Builtin;
        self.builtin = Some(id);
        self
    }

    pub fn name_prefix(mut self, prefix: &str) -> Self {
        self.name_prefix = Arc::from(prefix);
        self
    }

    pub fn resource_name(mut self, resource: &str) -> Self {
        self.resource_name = Arc::from(resource);
        self
    }

    pub fn script(mut self, script_id: i32, position: u32) -> Self {
        self.script_id = Some(script_id);
        self.position = position;
        self
    }

    /// Raw line number; non-positive or oversized values mean "unknown".
    pub fn line(mut self, line: i64) -> Self {
        self.line_number = source_position(Some(line));
        self
    }

    /// Raw column number; non-positive or oversized values mean "unknown".
    pub fn column(mut self, column: i64) -> Self {
        self.column_number = source_position(Some(column));
        self
    }

    pub fn instruction_start(mut self, start: Address) -> Self {
        self.instruction_start = start;
        self
    }

    pub fn line_table(mut self, table: LineTable) -> Self {
        self.line_info = Some(table);
        self
    }

    /// Inlined functions at `pc_offset`, outermost first. The first stack
    /// registered for an offset wins.
    pub fn inline_stack(mut self, pc_offset: u32, stack: Vec<Arc<CodeEntry>>) -> Self {
        self.inline_locations.entry(pc_offset).or_insert(stack);
        self
    }

    pub fn deopt_inlined_frames(mut self, deopt_id: i32, frames: Vec<DeoptInlinedFrame>) -> Self {
        self.deopt_inlined_frames.entry(deopt_id).or_insert(frames);
        self
    }

    pub fn bailout_reason(mut self, reason: &str) -> Self {
        self.bailout_reason = (!reason.is_empty()).then(|| Arc::from(reason));
        self
    }

    pub fn build(self) -> CodeEntry {
        let key = match self.script_id {
            Some(script_id) => FunctionKey::Script {
                script_id,
                position: self.position,
            },
            None => FunctionKey::Named {
                name_prefix: self.name_prefix.clone(),
                name: self.name.clone(),
                resource_name: self.resource_name.clone(),
                line: self.line_number,
            },
        };
        CodeEntry {
            tag: self.tag,
            builtin: self.builtin,
            name: self.name,
            name_prefix: self.name_prefix,
            resource_name: self.resource_name,
            script_id: self.script_id,
            position: self.position,
            line_number: self.line_number,
            column_number: self.column_number,
            instruction_start: self.instruction_start,
            line_info: self.line_info,
            inline_locations: self.inline_locations,
            deopt_inlined_frames: self.deopt_inlined_frames,
            key,
            state: Mutex::new(EntryState {
                bailout_reason: self.bailout_reason,
                deopt: None,
            }),
        }
    }
}

/// Owner of every code entry created during the profiler's lifetime
#[derive(Debug, Default)]
pub struct CodeEntries {
    entries: Mutex<Vec<Arc<CodeEntry>>>,
}

impl CodeEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `entry` and hand back a shared handle to it.
    pub fn add(&self, entry: CodeEntry) -> Arc<CodeEntry> {
        let entry = Arc::new(entry);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        entry
    }

    /// Build and register the entry described by a code creation event,
    /// together with entries for every function inlined into it.
    pub fn add_from_event(&self, event: &CodeCreateEvent) -> Arc<CodeEntry> {
        let mut builder = CodeEntry::builder(event.tag, &event.name)
            .name_prefix(&event.name_prefix)
            .resource_name(&event.resource_name)
            .instruction_start(event.start);
        if let Some(id) = event.builtin {
            builder = builder.builtin(id);
        }
        if let Some(script_id) = event.script_id {
            builder = builder.script(script_id, event.position);
        }
        if let Some(line) = event.line {
            builder = builder.line(line);
        }
        if let Some(column) = event.column {
            builder = builder.column(column);
        }
        if !event.line_table.is_empty() {
            let mut table = LineTable::new();
            for pos in &event.line_table {
                table.set_position(pos.pc_offset, pos.line);
            }
            builder = builder.line_table(table);
        }
        for stack in &event.inline_stacks {
            let frames = stack
                .frames
                .iter()
                .map(|f| self.add(Self::inlined_entry(f)))
                .collect();
            builder = builder.inline_stack(stack.pc_offset, frames);
        }
        for deopt in &event.deopt_frames {
            builder = builder.deopt_inlined_frames(deopt.deopt_id, deopt.frames.clone());
        }
        if let Some(reason) = &event.bailout_reason {
            builder = builder.bailout_reason(reason);
        }
        self.add(builder.build())
    }

    fn inlined_entry(function: &InlinedFunction) -> CodeEntry {
        let mut builder =
            CodeEntry::builder(CodeTag::Function, &function.name).resource_name(&function.resource_name);
        if let Some(script_id) = function.script_id {
            builder = builder.script(script_id, function.position);
        }
        if let Some(line) = function.line {
            builder = builder.line(line);
        }
        builder.build()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_shared::types::events::{DeoptFrames, InlineStack, LinePosition};

    #[test]
    fn test_line_table_lookup() {
        let mut table = LineTable::new();
        table.set_position(10, 3);
        table.set_position(20, 5);

        assert_eq!(table.source_line(0), Some(3));
        assert_eq!(table.source_line(10), Some(3));
        assert_eq!(table.source_line(11), Some(5));
        // Past the last offset: last known line
        assert_eq!(table.source_line(500), Some(5));
        assert!(LineTable::new().source_line(0).is_none());
    }

    #[test]
    fn test_line_table_ignores_bad_and_redundant_lines() {
        let mut table = LineTable::new();
        table.set_position(4, 0);
        table.set_position(5, -1);
        assert!(table.is_empty());

        table.set_position(20, 7);
        // Lookup at 10 already yields 7
        table.set_position(10, 7);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_function_by_script() {
        let a = CodeEntry::builder(CodeTag::Function, "foo").script(3, 120).build();
        let b = CodeEntry::builder(CodeTag::Function, "renamed").script(3, 120).build();
        let c = CodeEntry::builder(CodeTag::Function, "foo").script(3, 121).build();

        assert!(a.is_same_function_as(&b));
        assert!(!a.is_same_function_as(&c));
    }

    #[test]
    fn test_same_function_by_name() {
        let a = CodeEntry::builder(CodeTag::Function, "foo").resource_name("a.js").line(10).build();
        let b = CodeEntry::builder(CodeTag::Function, "foo").resource_name("a.js").line(10).build();
        let c = CodeEntry::builder(CodeTag::Function, "foo").resource_name("a.js").line(11).build();
        let d = CodeEntry::builder(CodeTag::Function, "foo")
            .name_prefix("get ")
            .resource_name("a.js")
            .line(10)
            .build();

        assert!(a.is_same_function_as(&b));
        assert_eq!(a.function_key(), b.function_key());
        assert!(!a.is_same_function_as(&c));
        assert!(!a.is_same_function_as(&d));
    }

    #[test]
    fn test_source_line_uses_table() {
        let mut table = LineTable::new();
        table.set_position(8, 42);
        let entry = CodeEntry::builder(CodeTag::Function, "f").line(40).line_table(table).build();
        assert_eq!(entry.source_line(2), Some(42));

        let bare = CodeEntry::builder(CodeTag::Function, "g").line(40).build();
        assert_eq!(bare.source_line(2), None);
        assert_eq!(bare.line_number(), Some(40));
    }

    #[test]
    fn test_deopt_taken_once() {
        let entry = CodeEntry::builder(CodeTag::Function, "f").script(1, 100).build();
        entry.set_deopt_info("wrong map", 2, 7);
        assert!(entry.has_deopt_info());

        let info = entry.take_deopt_info().unwrap();
        assert_eq!(info.reason, "wrong map");
        assert_eq!(
            info.stack,
            vec![DeoptFrame {
                script_id: Some(1),
                position: 107
            }]
        );
        assert!(!entry.has_deopt_info());
        assert!(entry.take_deopt_info().is_none());
    }

    #[test]
    fn test_deopt_with_inlined_frames() {
        let entry = CodeEntry::builder(CodeTag::Function, "outer")
            .script(1, 100)
            .deopt_inlined_frames(
                4,
                vec![
                    DeoptInlinedFrame { position: 10, script_id: Some(1) },
                    DeoptInlinedFrame { position: 50, script_id: Some(2) },
                ],
            )
            .build();
        assert!(entry.has_deopt_inlined_frames_for(4));
        entry.set_deopt_info("overflow", 4, 3);

        let info = entry.take_deopt_info().unwrap();
        assert_eq!(
            info.stack,
            vec![
                DeoptFrame { script_id: Some(2), position: 53 },
                DeoptFrame { script_id: Some(1), position: 10 },
            ]
        );
    }

    #[test]
    fn test_registry_from_event() {
        let registry = CodeEntries::new();
        let mut event = CodeCreateEvent::function(0x1000, 0x100, "foo");
        event.line = Some(-4);
        event.column = Some(i64::MAX);
        event.line_table = vec![LinePosition { pc_offset: 0x10, line: 12 }];
        event.inline_stacks = vec![InlineStack {
            pc_offset: 0x20,
            frames: vec![
                InlinedFunction {
                    name: "mid".to_string(),
                    resource_name: String::new(),
                    script_id: Some(1),
                    position: 5,
                    line: Some(3),
                },
                InlinedFunction {
                    name: "leaf".to_string(),
                    resource_name: String::new(),
                    script_id: Some(1),
                    position: 9,
                    line: Some(4),
                },
            ],
        }];
        event.deopt_frames = vec![DeoptFrames { deopt_id: 1, frames: vec![] }];

        let entry = registry.add_from_event(&event);
        assert_eq!(registry.len(), 3);
        assert_eq!(entry.instruction_start(), 0x1000);
        assert_eq!(entry.line_number(), None);
        assert_eq!(entry.column_number(), None);
        assert_eq!(entry.source_line(0), Some(12));

        let inlined = entry.inline_stack(0x20).unwrap();
        assert_eq!(inlined.len(), 2);
        assert_eq!(inlined[0].name(), "mid");
        assert!(entry.inline_stack(0x21).is_none());
        assert!(entry.has_deopt_inlined_frames_for(1));
    }
}
