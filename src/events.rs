//! Events
//!
//! Events are identified by short names (`n+`, `.f`, `m.t`) and carry at
//! most one typed argument. This module defines the event sum type, the
//! name table with declared argument types, trigger-argument validation,
//! the classification of globally ordering events, and the bind table that
//! expands one event into follow-up events on possibly different channels.

use crate::error::ModuleError;
use crate::sheet::parse_tstamp;
use crate::tstamp::Tstamp;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Maximum depth of bind-triggered event expansion.
pub const BIND_RECURSION_DEPTH_MAX: u32 = 6;

/// Declared argument type of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventArgType {
    None,
    Bool,
    Int,
    Float,
    Tstamp,
}

/// A validated event argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Tstamp(Tstamp),
}

impl EventValue {
    /// Numeric view used by bind predicates.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EventValue::Int(i) => Some(*i as f64),
            EventValue::Float(f) => Some(*f),
            EventValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// Dispatch group of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// Control flow over the channel's enabled-events stack.
    General,
    /// Global but not musical.
    Control,
    /// Mutates master parameters (tempo, jumps, playback mode).
    Master,
    /// Mutates channel state and touches foreground voices.
    Channel,
    /// Audio-unit scoped.
    Au,
}

/// The engine's event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Channel
    NoteOn,
    NoteOff,
    SetForce,
    SlideForce,
    SlideForceLength,
    TremoloSpeed,
    TremoloDepth,
    SetPitch,
    SlidePitch,
    SlidePitchLength,
    VibratoSpeed,
    VibratoDepth,
    SetPanning,
    SlidePanning,
    SlidePanningLength,
    AutowahSpeed,
    AutowahDepth,
    CarryForce,
    CarryPitch,
    CarryStream,
    SetAuInput,
    SelectStream,
    SetStreamValue,
    SlideStreamValue,
    SlideStreamLength,
    StreamOscSpeed,
    StreamOscDepth,
    // Master
    SetTempo,
    SlideTempo,
    SlideTempoLength,
    SetVolume,
    Jump,
    SetJumpCounter,
    PatternDelay,
    SelectTuningTable,
    Retune,
    // General
    If,
    Else,
    EndIf,
    // Control
    Trace,
    // Au
    Bypass,
}

impl EventType {
    pub fn category(self) -> EventCategory {
        use EventType::*;
        match self {
            NoteOn | NoteOff | SetForce | SlideForce | SlideForceLength | TremoloSpeed
            | TremoloDepth | SetPitch | SlidePitch | SlidePitchLength | VibratoSpeed
            | VibratoDepth | SetPanning | SlidePanning | SlidePanningLength | AutowahSpeed
            | AutowahDepth | CarryForce | CarryPitch | CarryStream | SetAuInput
            | SelectStream | SetStreamValue | SlideStreamValue | SlideStreamLength
            | StreamOscSpeed | StreamOscDepth => EventCategory::Channel,
            SetTempo | SlideTempo | SlideTempoLength | SetVolume | Jump | SetJumpCounter
            | PatternDelay | SelectTuningTable | Retune => EventCategory::Master,
            If | Else | EndIf => EventCategory::General,
            Trace => EventCategory::Control,
            Bypass => EventCategory::Au,
        }
    }

    /// Whether this event forces the scheduler to end the current slice at
    /// its position: anything that changes the global time mapping or the
    /// playback cursor itself.
    pub fn is_global_breakpoint(self) -> bool {
        matches!(
            self,
            EventType::SetTempo
                | EventType::SlideTempo
                | EventType::Jump
                | EventType::PatternDelay
        )
    }
}

/// Name table entry: `(name, type, argument type)`.
const EVENT_SPECS: &[(&str, EventType, EventArgType)] = &[
    ("n+", EventType::NoteOn, EventArgType::Float),
    ("n-", EventType::NoteOff, EventArgType::None),
    (".f", EventType::SetForce, EventArgType::Float),
    ("/f", EventType::SlideForce, EventArgType::Float),
    ("/=f", EventType::SlideForceLength, EventArgType::Tstamp),
    ("ts", EventType::TremoloSpeed, EventArgType::Float),
    ("td", EventType::TremoloDepth, EventArgType::Float),
    (".p", EventType::SetPitch, EventArgType::Float),
    ("/p", EventType::SlidePitch, EventArgType::Float),
    ("/=p", EventType::SlidePitchLength, EventArgType::Tstamp),
    ("vs", EventType::VibratoSpeed, EventArgType::Float),
    ("vd", EventType::VibratoDepth, EventArgType::Float),
    (".pn", EventType::SetPanning, EventArgType::Float),
    ("/pn", EventType::SlidePanning, EventArgType::Float),
    ("/=pn", EventType::SlidePanningLength, EventArgType::Tstamp),
    ("ws", EventType::AutowahSpeed, EventArgType::Float),
    ("wd", EventType::AutowahDepth, EventArgType::Float),
    ("c.f", EventType::CarryForce, EventArgType::Bool),
    ("c.p", EventType::CarryPitch, EventArgType::Bool),
    ("c.s", EventType::CarryStream, EventArgType::Bool),
    (".a", EventType::SetAuInput, EventArgType::Int),
    (".sn", EventType::SelectStream, EventArgType::Int),
    ("s.v", EventType::SetStreamValue, EventArgType::Float),
    ("s/v", EventType::SlideStreamValue, EventArgType::Float),
    ("s/=v", EventType::SlideStreamLength, EventArgType::Tstamp),
    ("sos", EventType::StreamOscSpeed, EventArgType::Float),
    ("sod", EventType::StreamOscDepth, EventArgType::Float),
    ("m.t", EventType::SetTempo, EventArgType::Float),
    ("m/t", EventType::SlideTempo, EventArgType::Float),
    ("m/=t", EventType::SlideTempoLength, EventArgType::Tstamp),
    ("m.v", EventType::SetVolume, EventArgType::Float),
    ("mj", EventType::Jump, EventArgType::None),
    ("m.jc", EventType::SetJumpCounter, EventArgType::Int),
    ("mpd", EventType::PatternDelay, EventArgType::Tstamp),
    ("m.tt", EventType::SelectTuningTable, EventArgType::Int),
    ("mrt", EventType::Retune, EventArgType::Int),
    ("if", EventType::If, EventArgType::Bool),
    ("else", EventType::Else, EventArgType::None),
    ("endif", EventType::EndIf, EventArgType::None),
    ("ct", EventType::Trace, EventArgType::Bool),
    ("abp", EventType::Bypass, EventArgType::Bool),
];

fn name_table() -> &'static HashMap<&'static str, (EventType, EventArgType)> {
    static TABLE: OnceLock<HashMap<&'static str, (EventType, EventArgType)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        EVENT_SPECS
            .iter()
            .map(|&(name, ty, arg)| (name, (ty, arg)))
            .collect()
    })
}

/// Look up an event name; returns its type and declared argument type.
pub fn event_by_name(name: &str) -> Option<(EventType, EventArgType)> {
    name_table().get(name).copied()
}

/// Validate a JSON argument against an event's declared type.
pub fn parse_event_arg(arg_type: EventArgType, arg: &Value) -> Result<EventValue, ModuleError> {
    match arg_type {
        EventArgType::None => match arg {
            Value::Null => Ok(EventValue::None),
            _ => Err(ModuleError::parse("event takes no argument")),
        },
        EventArgType::Bool => arg
            .as_bool()
            .map(EventValue::Bool)
            .ok_or_else(|| ModuleError::parse("event argument must be a boolean")),
        EventArgType::Int => arg
            .as_i64()
            .map(EventValue::Int)
            .ok_or_else(|| ModuleError::parse("event argument must be an integer")),
        EventArgType::Float => arg
            .as_f64()
            .map(EventValue::Float)
            .ok_or_else(|| ModuleError::parse("event argument must be a number")),
        EventArgType::Tstamp => parse_tstamp(arg).map(EventValue::Tstamp),
    }
}

/// Parse and validate a full `["name", arg]` event description.
pub fn parse_event_desc(desc: &Value) -> Result<(EventType, EventValue), ModuleError> {
    let parts = desc
        .as_array()
        .filter(|p| !p.is_empty() && p.len() <= 2)
        .ok_or_else(|| ModuleError::parse("event must be [name] or [name, arg]"))?;
    let name = parts[0]
        .as_str()
        .ok_or_else(|| ModuleError::parse("event name must be a string"))?;
    let (ty, arg_type) =
        event_by_name(name).ok_or_else(|| ModuleError::parse(format!("unknown event: {}", name)))?;
    let arg = parts.get(1).unwrap_or(&Value::Null);
    let value = parse_event_arg(arg_type, arg)?;
    Ok((ty, value))
}

/// Comparison operator of a bind predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl CmpOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">=" => Some(Self::Ge),
            ">" => Some(Self::Gt),
            _ => None,
        }
    }

    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Ge => lhs >= rhs,
            Self::Gt => lhs > rhs,
        }
    }
}

/// Numeric predicate over the source event's argument.
#[derive(Debug, Clone)]
pub struct BindPredicate {
    op: CmpOp,
    value: f64,
}

impl BindPredicate {
    pub fn matches(&self, arg: &EventValue) -> bool {
        arg.as_f64().map(|v| self.op.apply(v, self.value)).unwrap_or(false)
    }
}

/// One follow-up event fired by a bind match.
#[derive(Debug, Clone)]
pub struct BindTarget {
    /// Channel offset relative to the triggering channel.
    pub ch_offset: i32,
    pub event_name: String,
    /// Literal argument, or the string `"$"` to pass the source argument
    /// through.
    pub arg: Value,
}

#[derive(Debug, Clone)]
struct BindEntry {
    event_name: String,
    predicate: Option<BindPredicate>,
    targets: Vec<BindTarget>,
}

/// The module-global bind table.
///
/// Parsed from `[[event_name, predicate, [[ch_offset, [name, arg]], ...]],
/// ...]` where `predicate` is `null` or `[op, number]`.
#[derive(Debug, Clone, Default)]
pub struct Bind {
    entries: Vec<BindEntry>,
}

impl Bind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: &Value) -> Result<Self, ModuleError> {
        let items = value
            .as_array()
            .ok_or_else(|| ModuleError::parse("bind table must be an array"))?;

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let parts = item
                .as_array()
                .filter(|p| p.len() == 3)
                .ok_or_else(|| {
                    ModuleError::parse("bind entry must be [event, predicate, targets]")
                })?;

            let event_name = parts[0]
                .as_str()
                .ok_or_else(|| ModuleError::parse("bind source must be an event name"))?;
            if event_by_name(event_name).is_none() {
                return Err(ModuleError::parse(format!(
                    "bind source is not a known event: {}",
                    event_name
                )));
            }

            let predicate = match &parts[1] {
                Value::Null => None,
                Value::Array(p) if p.len() == 2 => {
                    let op = p[0]
                        .as_str()
                        .and_then(CmpOp::parse)
                        .ok_or_else(|| ModuleError::parse("bad bind predicate operator"))?;
                    let value = p[1]
                        .as_f64()
                        .ok_or_else(|| ModuleError::parse("bind predicate value must be numeric"))?;
                    Some(BindPredicate { op, value })
                }
                _ => return Err(ModuleError::parse("bad bind predicate")),
            };

            let raw_targets = parts[2]
                .as_array()
                .ok_or_else(|| ModuleError::parse("bind targets must be an array"))?;
            let mut targets = Vec::with_capacity(raw_targets.len());
            for raw in raw_targets {
                let t = raw
                    .as_array()
                    .filter(|t| t.len() == 2)
                    .ok_or_else(|| ModuleError::parse("bind target must be [ch_offset, event]"))?;
                let ch_offset = t[0]
                    .as_i64()
                    .ok_or_else(|| ModuleError::parse("bind channel offset must be an integer"))?;
                let event = t[1]
                    .as_array()
                    .filter(|e| !e.is_empty() && e.len() <= 2)
                    .ok_or_else(|| ModuleError::parse("bind target event must be [name, arg]"))?;
                let event_name = event[0]
                    .as_str()
                    .ok_or_else(|| ModuleError::parse("bind target name must be a string"))?;
                if event_by_name(event_name).is_none() {
                    return Err(ModuleError::parse(format!(
                        "bind target is not a known event: {}",
                        event_name
                    )));
                }
                targets.push(BindTarget {
                    ch_offset: ch_offset as i32,
                    event_name: event_name.to_string(),
                    arg: event.get(1).cloned().unwrap_or(Value::Null),
                });
            }

            entries.push(BindEntry {
                event_name: event_name.to_string(),
                predicate,
                targets,
            });
        }

        Ok(Self { entries })
    }

    /// All targets whose entry matches the fired event.
    pub fn expansions(&self, event_name: &str, arg: &EventValue) -> Vec<&BindTarget> {
        let mut out = Vec::new();
        for entry in &self.entries {
            if entry.event_name != event_name {
                continue;
            }
            let matched = match &entry.predicate {
                None => true,
                Some(p) => p.matches(arg),
            };
            if matched {
                out.extend(entry.targets.iter());
            }
        }
        out
    }

    /// Whether a trigger of this event may expand into a globally ordering
    /// event. Predicates are ignored here: the scheduler must stop at any
    /// row that could possibly change the time mapping.
    pub fn event_may_break_globally(&self, event_name: &str) -> bool {
        self.entries
            .iter()
            .filter(|e| e.event_name == event_name)
            .flat_map(|e| e.targets.iter())
            .any(|t| {
                event_by_name(&t.event_name)
                    .map(|(ty, _)| ty.is_global_breakpoint())
                    .unwrap_or(false)
            })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether a trigger row event (by name) is a global breakpoint, either
/// directly or through a bind expansion.
pub fn trigger_is_global_breakpoint(name: &str, bind: Option<&Bind>) -> bool {
    if let Some((ty, _)) = event_by_name(name) {
        if ty.is_global_breakpoint() {
            return true;
        }
    }
    bind.map(|b| b.event_may_break_globally(name)).unwrap_or(false)
}
