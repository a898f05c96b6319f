//! Tick sample resolution
//!
//! Turns raw tick samples into leaf-first paths of code entries and feeds
//! them to every active profile. Also applies code lifecycle events to the
//! code map so that later samples resolve against the current layout.

use aperture_shared::types::events::{Address, CodeEvent, CodeTag, StateTag, TickSample};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, trace};

use super::code_entry::CodeEntry;
use super::code_map::CodeMap;
use crate::profile::collection::CpuProfilesCollection;

pub const PROGRAM_ENTRY_NAME: &str = "(program)";
pub const IDLE_ENTRY_NAME: &str = "(idle)";
pub const GARBAGE_COLLECTOR_ENTRY_NAME: &str = "(garbage collector)";
pub const UNRESOLVED_FUNCTION_NAME: &str = "(unresolved function)";

/// A sample resolved against the code map
#[derive(Debug, Clone, Default)]
pub struct ResolvedSample {
    /// Leaf first; `None` marks frames that did not resolve
    pub path: Vec<Option<Arc<CodeEntry>>>,

    /// Source line of the innermost resolved frame
    pub src_line: Option<u32>,
}

impl ResolvedSample {
    /// Names of the path, `None` for unresolved frames.
    pub fn names(&self) -> Vec<Option<&str>> {
        self.path
            .iter()
            .map(|e| e.as_ref().map(|e| e.name()))
            .collect()
    }
}

/// Resolves samples and fans them out to the active profiles
#[derive(Debug)]
pub struct ProfileGenerator {
    profiles: Arc<CpuProfilesCollection>,
    code_map: RwLock<CodeMap>,
    attribute_vm_state: bool,
    program_entry: Arc<CodeEntry>,
    idle_entry: Arc<CodeEntry>,
    gc_entry: Arc<CodeEntry>,
    unresolved_entry: Arc<CodeEntry>,
}

impl ProfileGenerator {
    pub fn new(profiles: Arc<CpuProfilesCollection>, attribute_vm_state: bool) -> Self {
        let sentinel = |tag, name| profiles.new_code_entry(CodeEntry::builder(tag, name).build());
        let program_entry = sentinel(CodeTag::Function, PROGRAM_ENTRY_NAME);
        let idle_entry = sentinel(CodeTag::Function, IDLE_ENTRY_NAME);
        let gc_entry = sentinel(CodeTag::Builtin, GARBAGE_COLLECTOR_ENTRY_NAME);
        let unresolved_entry = sentinel(CodeTag::Function, UNRESOLVED_FUNCTION_NAME);
        Self {
            profiles,
            code_map: RwLock::new(CodeMap::new()),
            attribute_vm_state,
            program_entry,
            idle_entry,
            gc_entry,
            unresolved_entry,
        }
    }

    pub fn profiles(&self) -> &Arc<CpuProfilesCollection> {
        &self.profiles
    }

    /// Read access to the code map, e.g. for dumping it.
    pub fn code_map(&self) -> RwLockReadGuard<'_, CodeMap> {
        self.code_map.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one code lifecycle event.
    pub fn process_code_event(&self, event: &CodeEvent) {
        match event {
            CodeEvent::Create(create) => {
                let entry = self.profiles.code_entries().add_from_event(create);
                debug!(
                    "Code created: {} at {:#x}+{}",
                    entry.name(),
                    create.start,
                    create.size
                );
                self.code_map
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .add_code(create.start, entry, create.size);
            }
            CodeEvent::Move { from, to } => {
                trace!("Code moved: {:#x} -> {:#x}", from, to);
                self.code_map
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .move_code(*from, *to);
            }
            CodeEvent::Deopt {
                start,
                reason,
                deopt_id,
                position,
            } => match self.lookup(*start) {
                Some((_, entry)) => {
                    debug!("Code deoptimized: {} ({})", entry.name(), reason);
                    entry.set_deopt_info(reason, *deopt_id, *position);
                }
                None => debug!("Deopt for unknown code at {:#x}", start),
            },
            CodeEvent::DisableOpt {
                start,
                bailout_reason,
            } => {
                if let Some((_, entry)) = self.lookup(*start) {
                    entry.set_bailout_reason(bailout_reason);
                }
            }
        }
    }

    /// Range start and entry for `addr`. The map lock is held only for
    /// the lookup itself.
    fn lookup(&self, addr: Address) -> Option<(Address, Arc<CodeEntry>)> {
        self.code_map()
            .lookup(addr)
            .map(|(start, entry)| (start, entry.clone()))
    }

    fn source_line_at(entry: &CodeEntry, pc_offset: u32) -> Option<u32> {
        entry.source_line(pc_offset).or_else(|| entry.line_number())
    }

    /// Resolve a sample into a leaf-first path and its representative line.
    pub fn resolve_sample(&self, sample: &TickSample) -> ResolvedSample {
        // Frames plus pc, an unresolved-function marker and a VM-state
        // entry; inlined frames may add more.
        let mut path = Vec::with_capacity(sample.stack.len() + 3);
        let mut src_line = None;
        let mut src_line_found = false;

        if let Some(pc) = sample.pc {
            if sample.has_external_callback && sample.state == StateTag::External {
                // The pc may point inside the callback itself, which would
                // make the callback look like it calls itself.
                path.push(
                    sample
                        .external_callback_entry
                        .and_then(|addr| self.lookup(addr))
                        .map(|(_, entry)| entry),
                );
            } else {
                let mut hit = self.lookup(pc).map(|(start, entry)| (pc, start, entry));
                if hit.is_none() && !sample.has_external_callback {
                    // Frameless invocation: the function has not set up its
                    // frame yet, but its return address is on top of stack.
                    hit = sample
                        .tos
                        .and_then(|tos| self.lookup(tos).map(|(start, entry)| (tos, start, entry)));
                }
                if let Some((addr, start, entry)) = hit {
                    src_line = Self::source_line_at(&entry, pc_offset(addr, start));
                    src_line_found = true;
                    let through_trampoline = entry
                        .builtin()
                        .is_some_and(|id| id.is_call_trampoline());
                    path.push(Some(entry));
                    if through_trampoline && !sample.has_external_callback {
                        // The caller of apply/call cannot be told apart from
                        // an internal frame.
                        path.push(Some(self.unresolved_entry.clone()));
                    }
                }
            }

            for &addr in &sample.stack {
                let hit = self.lookup(addr);
                if let Some((start, entry)) = &hit {
                    let offset = pc_offset(addr, *start);
                    if let Some(inlined) = entry.inline_stack(offset) {
                        path.extend(inlined.iter().rev().cloned().map(Some));
                    }
                    if !src_line_found {
                        src_line = Self::source_line_at(entry, offset);
                        src_line_found = true;
                    }
                }
                path.push(hit.map(|(_, entry)| entry));
            }
        }

        if self.attribute_vm_state && path.iter().all(Option::is_none) {
            path.push(self.entry_for_vm_state(sample.state));
        }

        ResolvedSample { path, src_line }
    }

    /// Resolve a sample and add it to every active profile.
    pub fn record_tick_sample(&self, sample: &TickSample) {
        let resolved = self.resolve_sample(sample);
        trace!(
            "Tick at {}: {} frames, line {:?}",
            sample.timestamp,
            resolved.path.len(),
            resolved.src_line
        );
        self.profiles.add_path_to_current_profiles(
            sample.timestamp,
            &resolved.path,
            resolved.src_line,
            sample.update_stats,
        );
    }

    /// Bucket for samples with no symbolized frame; `None` drops them.
    pub fn entry_for_vm_state(&self, state: StateTag) -> Option<Arc<CodeEntry>> {
        match state {
            StateTag::Gc => Some(self.gc_entry.clone()),
            // Embedder callbacks show up as OTHER/EXTERNAL; keep them with
            // the rest of the program.
            StateTag::Js | StateTag::Compiler | StateTag::Other | StateTag::External => {
                Some(self.program_entry.clone())
            }
            StateTag::Idle => Some(self.idle_entry.clone()),
            StateTag::Parser | StateTag::BytecodeCompiler => None,
        }
    }
}

/// Offset of `addr` into the region starting at `start`. Regions are at
/// most `u32::MAX` bytes long.
fn pc_offset(addr: Address, start: Address) -> u32 {
    u32::try_from(addr.saturating_sub(start)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_shared::types::events::{BuiltinId, CodeCreateEvent, InlineStack, InlinedFunction, LinePosition};

    fn generator(attribute_vm_state: bool) -> ProfileGenerator {
        ProfileGenerator::new(Arc::new(CpuProfilesCollection::new(4)), attribute_vm_state)
    }

    fn create(gen: &ProfileGenerator, start: Address, size: u32, name: &str, line: i64) {
        let mut event = CodeCreateEvent::function(start, size, name);
        event.line = Some(line);
        gen.process_code_event(&CodeEvent::Create(event));
    }

    #[test]
    fn test_resolve_pc_and_stack() {
        let gen = generator(false);
        create(&gen, 0x1000, 0x100, "leaf", 10);
        create(&gen, 0x2000, 0x100, "caller", 20);

        let sample = TickSample::new(1, 0x1010, vec![0x2040, 0x9999]);
        let resolved = gen.resolve_sample(&sample);

        assert_eq!(resolved.names(), vec![Some("leaf"), Some("caller"), None]);
        assert_eq!(resolved.src_line, Some(10));
    }

    #[test]
    fn test_line_from_table_at_offset() {
        let gen = generator(false);
        let mut event = CodeCreateEvent::function(0x1000, 0x100, "f");
        event.line = Some(3);
        event.line_table = vec![
            LinePosition { pc_offset: 0x10, line: 4 },
            LinePosition { pc_offset: 0x40, line: 6 },
        ];
        gen.process_code_event(&CodeEvent::Create(event));

        let resolved = gen.resolve_sample(&TickSample::new(1, 0x1020, vec![]));
        assert_eq!(resolved.src_line, Some(6));
    }

    #[test]
    fn test_unresolved_pc_uses_first_resolved_caller_line() {
        let gen = generator(false);
        create(&gen, 0x2000, 0x100, "caller", 20);

        let resolved = gen.resolve_sample(&TickSample::new(1, 0x50, vec![0x2010]));
        assert_eq!(resolved.names(), vec![Some("caller")]);
        assert_eq!(resolved.src_line, Some(20));
    }

    #[test]
    fn test_frameless_invocation_uses_tos() {
        let gen = generator(false);
        create(&gen, 0x3000, 0x100, "frameless", 7);

        let mut sample = TickSample::new(1, 0x50, vec![]);
        sample.tos = Some(0x3008);
        assert_eq!(gen.resolve_sample(&sample).names(), vec![Some("frameless")]);

        // Not while inside a native callback
        sample.has_external_callback = true;
        assert!(gen.resolve_sample(&sample).path.is_empty());
    }

    #[test]
    fn test_external_callback_ignores_pc() {
        let gen = generator(false);
        create(&gen, 0x1000, 0x100, "js", 1);
        let mut cb = CodeCreateEvent::function(0x5000, 0x10, "nativeCallback");
        cb.tag = CodeTag::Callback;
        gen.process_code_event(&CodeEvent::Create(cb));

        let mut sample = TickSample::new(1, 0x1010, vec![0x1020]);
        sample.state = StateTag::External;
        sample.has_external_callback = true;
        sample.external_callback_entry = Some(0x5000);

        let resolved = gen.resolve_sample(&sample);
        assert_eq!(resolved.names(), vec![Some("nativeCallback"), Some("js")]);
    }

    #[test]
    fn test_trampoline_synthesizes_unresolved_frame() {
        let gen = generator(false);
        let mut apply = CodeCreateEvent::function(0x4000, 0x80, "FunctionPrototypeApply");
        apply.builtin = Some(BuiltinId::FunctionPrototypeApply);
        gen.process_code_event(&CodeEvent::Create(apply));
        create(&gen, 0x1000, 0x100, "caller", 1);

        let resolved = gen.resolve_sample(&TickSample::new(1, 0x4010, vec![0x1010]));
        assert_eq!(
            resolved.names(),
            vec![
                Some("FunctionPrototypeApply"),
                Some(UNRESOLVED_FUNCTION_NAME),
                Some("caller")
            ]
        );
    }

    #[test]
    fn test_call_trampoline_with_external_callback_flag() {
        let gen = generator(false);
        let mut call = CodeCreateEvent::function(0x4000, 0x80, "FunctionPrototypeCall");
        call.builtin = Some(BuiltinId::FunctionPrototypeCall);
        gen.process_code_event(&CodeEvent::Create(call));

        let mut sample = TickSample::new(1, 0x4010, vec![]);
        sample.has_external_callback = true;
        assert_eq!(
            gen.resolve_sample(&sample).names(),
            vec![Some("FunctionPrototypeCall")]
        );
    }

    #[test]
    fn test_inlined_frames_spliced() {
        let gen = generator(false);
        let mut outer = CodeCreateEvent::function(0x1000, 0x100, "outer");
        outer.inline_stacks = vec![InlineStack {
            pc_offset: 0x20,
            frames: vec![
                InlinedFunction {
                    name: "mid".to_string(),
                    resource_name: String::new(),
                    script_id: Some(1),
                    position: 10,
                    line: None,
                },
                InlinedFunction {
                    name: "inner".to_string(),
                    resource_name: String::new(),
                    script_id: Some(1),
                    position: 20,
                    line: None,
                },
            ],
        }];
        gen.process_code_event(&CodeEvent::Create(outer));
        create(&gen, 0x2000, 0x100, "leaf", 1);

        let resolved = gen.resolve_sample(&TickSample::new(1, 0x2000, vec![0x1020]));
        assert_eq!(
            resolved.names(),
            vec![Some("leaf"), Some("inner"), Some("mid"), Some("outer")]
        );
    }

    #[test]
    fn test_vm_state_attribution() {
        let gen = generator(true);
        let bucket = |state| {
            let mut sample = TickSample::new(1, 0x10, vec![0x20]);
            sample.state = state;
            gen.resolve_sample(&sample)
                .path
                .last()
                .cloned()
                .flatten()
                .map(|e| e.name().to_string())
        };

        assert_eq!(bucket(StateTag::Gc).as_deref(), Some(GARBAGE_COLLECTOR_ENTRY_NAME));
        assert_eq!(bucket(StateTag::Js).as_deref(), Some(PROGRAM_ENTRY_NAME));
        assert_eq!(bucket(StateTag::Compiler).as_deref(), Some(PROGRAM_ENTRY_NAME));
        assert_eq!(bucket(StateTag::Other).as_deref(), Some(PROGRAM_ENTRY_NAME));
        assert_eq!(bucket(StateTag::External).as_deref(), Some(PROGRAM_ENTRY_NAME));
        assert_eq!(bucket(StateTag::Idle).as_deref(), Some(IDLE_ENTRY_NAME));
        assert_eq!(bucket(StateTag::Parser), None);
        assert_eq!(bucket(StateTag::BytecodeCompiler), None);
    }

    #[test]
    fn test_vm_state_not_used_when_disabled_or_resolved() {
        let gen = generator(false);
        let sample = TickSample::new(1, 0x10, vec![]);
        assert_eq!(gen.resolve_sample(&sample).names(), Vec::<Option<&str>>::new());

        let gen = generator(true);
        create(&gen, 0x1000, 0x100, "f", 1);
        let sample = TickSample::new(1, 0x1000, vec![]);
        assert_eq!(gen.resolve_sample(&sample).names(), vec![Some("f")]);
    }

    #[test]
    fn test_missing_pc_skips_stack() {
        let gen = generator(true);
        create(&gen, 0x1000, 0x100, "f", 1);
        let mut sample = TickSample::new(1, 0, vec![0x1010]);
        sample.pc = None;
        sample.state = StateTag::Idle;

        assert_eq!(gen.resolve_sample(&sample).names(), vec![Some(IDLE_ENTRY_NAME)]);
    }

    #[test]
    fn test_deopt_and_disable_opt_events() {
        let gen = generator(false);
        create(&gen, 0x1000, 0x100, "f", 1);
        gen.process_code_event(&CodeEvent::Deopt {
            start: 0x1000,
            reason: "wrong map".to_string(),
            deopt_id: 1,
            position: 2,
        });
        gen.process_code_event(&CodeEvent::DisableOpt {
            start: 0x1000,
            bailout_reason: "generator".to_string(),
        });
        // Unknown address is ignored
        gen.process_code_event(&CodeEvent::Deopt {
            start: 0x9000,
            reason: "x".to_string(),
            deopt_id: 1,
            position: 0,
        });

        let entry = gen.code_map().find_entry(0x1000).cloned().unwrap();
        assert!(entry.has_deopt_info());
        assert_eq!(entry.bailout_reason().as_deref(), Some("generator"));
    }

    #[test]
    fn test_record_tick_sample_reaches_profiles() {
        let gen = generator(false);
        create(&gen, 0x1000, 0x100, "foo", 10);
        gen.profiles().start_profiling("t1", false);

        gen.record_tick_sample(&TickSample::new(1, 0x1050, vec![]));
        let profile = gen.profiles().stop_profiling("t1").unwrap();

        profile.with_tree(|tree| {
            let foo = tree.node(tree.find_path(&["foo"]).unwrap());
            assert_eq!(foo.self_ticks(), 1);
            assert_eq!(foo.line_ticks().next().map(|t| (t.line, t.hit_count)), Some((10, 1)));
        });
    }

    #[test]
    fn test_code_move_keeps_resolution() {
        let gen = generator(false);
        create(&gen, 0x1000, 0x100, "f", 1);
        gen.process_code_event(&CodeEvent::Move { from: 0x1000, to: 0x8000 });

        assert!(gen.resolve_sample(&TickSample::new(1, 0x1010, vec![])).path.is_empty());
        assert_eq!(
            gen.resolve_sample(&TickSample::new(1, 0x8010, vec![])).names(),
            vec![Some("f")]
        );
    }
}
