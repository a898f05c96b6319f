//! Event type definitions for profiling data
//!
//! These types represent the raw inputs consumed by the aggregation engine:
//! tick samples captured by the sampling producer and code registration
//! events emitted whenever generated code is created, moved or deoptimized.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Timestamp in nanoseconds
pub type Timestamp = u64;

/// Instruction address inside generated code
pub type Address = u64;

/// Run state of the sampled thread at the time of the tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTag {
    Js,
    Gc,
    Parser,
    BytecodeCompiler,
    Compiler,
    #[default]
    Other,
    External,
    Idle,
}

impl StateTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Js => "js",
            Self::Gc => "gc",
            Self::Parser => "parser",
            Self::BytecodeCompiler => "bytecode_compiler",
            Self::Compiler => "compiler",
            Self::Other => "other",
            Self::External => "external",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown state tag: {0}")]
pub struct UnknownStateTag(pub String);

impl FromStr for StateTag {
    type Err = UnknownStateTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "js" => Ok(Self::Js),
            "gc" => Ok(Self::Gc),
            "parser" => Ok(Self::Parser),
            "bytecode_compiler" => Ok(Self::BytecodeCompiler),
            "compiler" => Ok(Self::Compiler),
            "other" => Ok(Self::Other),
            "external" => Ok(Self::External),
            "idle" => Ok(Self::Idle),
            _ => Err(UnknownStateTag(s.to_string())),
        }
    }
}

/// One raw stack sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSample {
    /// Timestamp when the sample was taken
    pub timestamp: Timestamp,

    /// Run state of the sampled thread
    #[serde(default)]
    pub state: StateTag,

    /// Program counter; `None` when the sampler could not read registers
    pub pc: Option<Address>,

    /// Top-of-stack slot, used for frameless invocations
    #[serde(default)]
    pub tos: Option<Address>,

    /// Entry of the native callback the thread is currently executing
    #[serde(default)]
    pub external_callback_entry: Option<Address>,

    /// Whether the thread is inside a native callback
    #[serde(default)]
    pub has_external_callback: bool,

    /// Return addresses from innermost to outermost
    #[serde(default)]
    pub stack: Vec<Address>,

    /// Whether this tick counts towards self ticks
    #[serde(default = "default_update_stats")]
    pub update_stats: bool,
}

fn default_update_stats() -> bool {
    true
}

impl TickSample {
    /// A sample at `pc` with the given return addresses, counted in stats.
    pub fn new(timestamp: Timestamp, pc: Address, stack: Vec<Address>) -> Self {
        Self {
            timestamp,
            state: StateTag::Js,
            pc: Some(pc),
            tos: None,
            external_callback_entry: None,
            has_external_callback: false,
            stack,
            update_stats: true,
        }
    }

    /// Number of frames the sampler captured, including the pc.
    pub fn frames_count(&self) -> usize {
        self.stack.len() + usize::from(self.pc.is_some())
    }
}

/// Kind of generated code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeTag {
    #[default]
    Function,
    Builtin,
    Callback,
    Regexp,
    Stub,
}

/// Builtin identity, as far as the aggregation engine cares about it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinId {
    /// `Function.prototype.apply` trampoline
    FunctionPrototypeApply,
    /// `Function.prototype.call` trampoline
    FunctionPrototypeCall,
    Other(u32),
}

impl BuiltinId {
    /// Trampolines through which the true caller cannot be recovered.
    pub fn is_call_trampoline(&self) -> bool {
        matches!(self, Self::FunctionPrototypeApply | Self::FunctionPrototypeCall)
    }
}

/// One pc-offset to source-line mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinePosition {
    pub pc_offset: u32,
    pub line: i64,
}

/// A function inlined into a code object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlinedFunction {
    pub name: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub script_id: Option<i32>,
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub line: Option<i64>,
}

/// Inlined functions active at one pc offset, outermost first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineStack {
    pub pc_offset: u32,
    pub frames: Vec<InlinedFunction>,
}

/// Frame of an inlining chain captured for a deoptimization point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeoptInlinedFrame {
    pub position: u32,
    pub script_id: Option<i32>,
}

/// Inlining chain (outermost first) for one deopt id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeoptFrames {
    pub deopt_id: i32,
    pub frames: Vec<DeoptInlinedFrame>,
}

/// Registration of a new generated-code region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCreateEvent {
    pub start: Address,
    pub size: u32,
    #[serde(default)]
    pub tag: CodeTag,
    #[serde(default)]
    pub builtin: Option<BuiltinId>,
    pub name: String,
    #[serde(default)]
    pub name_prefix: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub script_id: Option<i32>,
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default)]
    pub column: Option<i64>,
    #[serde(default)]
    pub line_table: Vec<LinePosition>,
    #[serde(default)]
    pub inline_stacks: Vec<InlineStack>,
    #[serde(default)]
    pub deopt_frames: Vec<DeoptFrames>,
    #[serde(default)]
    pub bailout_reason: Option<String>,
}

impl CodeCreateEvent {
    /// A plain function region with no tables attached.
    pub fn function(start: Address, size: u32, name: &str) -> Self {
        Self {
            start,
            size,
            tag: CodeTag::Function,
            builtin: None,
            name: name.to_string(),
            name_prefix: String::new(),
            resource_name: String::new(),
            script_id: None,
            position: 0,
            line: None,
            column: None,
            line_table: Vec::new(),
            inline_stacks: Vec::new(),
            deopt_frames: Vec::new(),
            bailout_reason: None,
        }
    }
}

/// Code lifecycle events delivered by the code-generation collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodeEvent {
    Create(CodeCreateEvent),
    Move {
        from: Address,
        to: Address,
    },
    Deopt {
        start: Address,
        reason: String,
        deopt_id: i32,
        position: u32,
    },
    DisableOpt {
        start: Address,
        bailout_reason: String,
    },
}
