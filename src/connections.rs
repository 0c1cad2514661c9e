//! The Connections Graph
//!
//! A connections object is parsed from a list of `(sender, receiver)` edges
//! such as `["au_00/out_00", "out_00"]`. Each path resolves against a scope
//! (the module top level or an audio-unit interior) to the master output,
//! an audio unit, an interface proxy or a processor.
//!
//! Storage is the **transpose** of the musical flow: each node keeps, per
//! receive port, the list of `(sender, send port)` pairs feeding it, so
//! graph walks iterate "who feeds me". Nodes live in a slotmap arena and
//! the walk colors live in the per-thread device state, which keeps the
//! graph itself immutable during rendering.
//!
//! Validation runs in three stages: path grammar, port existence, then
//! acyclicity by depth-first three-coloring (a back edge fails with a
//! cycle error). The same DFS fixes the execution order used by the render
//! walks.

use crate::audio_unit::AudioUnit;
use crate::device::{DeviceId, MixedRenderContext, PortType, SignalType, VoiceRenderContext};
use crate::device_state::{DeviceState, DeviceStates, NodeState, ThreadStateSet};
use crate::error::ModuleError;
use crate::module::Module;
use crate::voice::Voice;
use crate::DEVICE_PORTS_MAX;

use serde_json::Value;
use slotmap::{new_key_type, SecondaryMap, SlotMap};
use std::collections::HashMap;

new_key_type! {
    /// Arena key of one graph node.
    pub struct NodeKey;
}

/// A device reference within one connection scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRef {
    /// The scope owner's sink: the master output at the top level.
    Master,
    /// The audio-unit input proxy (interior scope only).
    IfaceIn,
    /// The audio-unit output proxy (interior scope only).
    IfaceOut,
    /// An audio unit within the scope.
    Au(usize),
    /// A processor within the scope (interior scope only).
    Proc(usize),
}

impl std::fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRef::Master => write!(f, "master"),
            DeviceRef::IfaceIn => write!(f, "in"),
            DeviceRef::IfaceOut => write!(f, "out"),
            DeviceRef::Au(i) => write!(f, "au_{:02x}", i),
            DeviceRef::Proc(i) => write!(f, "proc_{:02x}", i),
        }
    }
}

/// Port-level facts a scope reports about one referenced device.
#[derive(Debug, Clone, Copy)]
pub struct ScopeDevice {
    pub device_id: DeviceId,
    pub recv_ports: usize,
    pub send_ports: usize,
}

/// Resolution interface the graph builder uses; implemented by the module
/// top level and by audio units for their interiors.
pub trait GraphScope {
    /// Resolve a device reference, or `None` for a dangling endpoint.
    fn resolve(&self, dref: DeviceRef) -> Option<ScopeDevice>;

    /// Whether this is the module top level (changes the bare-port rules).
    fn is_top(&self) -> bool;
}

impl GraphScope for Module {
    fn resolve(&self, dref: DeviceRef) -> Option<ScopeDevice> {
        match dref {
            DeviceRef::Master => Some(ScopeDevice {
                device_id: self.master_device.id(),
                recv_ports: self.master_device.port_count(PortType::Receive),
                send_ports: 0,
            }),
            DeviceRef::Au(index) => {
                let au = self.au_table.get(index)?;
                if !au.device.is_existent() {
                    return None;
                }
                Some(ScopeDevice {
                    device_id: au.device.id(),
                    recv_ports: au.device.port_count(PortType::Receive),
                    send_ports: au.device.port_count(PortType::Send),
                })
            }
            _ => None,
        }
    }

    fn is_top(&self) -> bool {
        true
    }
}

impl GraphScope for AudioUnit {
    fn resolve(&self, dref: DeviceRef) -> Option<ScopeDevice> {
        match dref {
            DeviceRef::IfaceIn => Some(ScopeDevice {
                device_id: self.iface_in.id(),
                recv_ports: 0,
                send_ports: self.iface_in.port_count(PortType::Send),
            }),
            DeviceRef::IfaceOut => Some(ScopeDevice {
                device_id: self.iface_out.id(),
                recv_ports: self.iface_out.port_count(PortType::Receive),
                send_ports: 0,
            }),
            DeviceRef::Proc(index) => {
                let proc = self.proc(index)?;
                if !proc.device.is_existent() {
                    return None;
                }
                Some(ScopeDevice {
                    device_id: proc.device.id(),
                    recv_ports: proc.device.port_count(PortType::Receive),
                    send_ports: proc.device.port_count(PortType::Send),
                })
            }
            DeviceRef::Au(index) => {
                let au = self.nested_au(index)?;
                if !au.device.is_existent() {
                    return None;
                }
                Some(ScopeDevice {
                    device_id: au.device.id(),
                    recv_ports: au.device.port_count(PortType::Receive),
                    send_ports: au.device.port_count(PortType::Send),
                })
            }
            DeviceRef::Master => None,
        }
    }

    fn is_top(&self) -> bool {
        false
    }
}

/// One graph node: a device plus its per-receive-port sender lists.
#[derive(Debug)]
pub struct DeviceNode {
    pub dref: DeviceRef,
    pub device_id: DeviceId,
    recv_ports: usize,
    send_ports: usize,
    /// Indexed by receive port: `(sender node, sender send port)`.
    senders: Vec<Vec<(NodeKey, usize)>>,
}

impl DeviceNode {
    fn new(dref: DeviceRef, info: ScopeDevice) -> Self {
        Self {
            dref,
            device_id: info.device_id,
            recv_ports: info.recv_ports,
            send_ports: info.send_ports,
            senders: (0..DEVICE_PORTS_MAX).map(|_| Vec::new()).collect(),
        }
    }

    pub fn recv_ports(&self) -> usize {
        self.recv_ports
    }

    pub fn send_ports(&self) -> usize {
        self.send_ports
    }

    /// Senders feeding one receive port.
    pub fn senders(&self, port: usize) -> &[(NodeKey, usize)] {
        &self.senders[port]
    }

    /// Receive ports with at least one sender.
    pub fn connected_ports(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.recv_ports).filter(|&p| !self.senders[p].is_empty())
    }
}

/// A validated connection graph for one scope.
#[derive(Debug)]
pub struct Connections {
    nodes: SlotMap<NodeKey, DeviceNode>,
    by_ref: HashMap<DeviceRef, NodeKey>,
    /// Execution order: every sender precedes its receivers.
    order: Vec<NodeKey>,
}

impl Connections {
    /// Build and validate a graph from `[[sender, receiver], ...]` JSON.
    pub fn from_json(value: &Value, scope: &dyn GraphScope) -> Result<Self, ModuleError> {
        let edges = value
            .as_array()
            .ok_or_else(|| ModuleError::parse("connection list must be an array"))?;

        let mut conns = Self {
            nodes: SlotMap::with_key(),
            by_ref: HashMap::new(),
            order: Vec::new(),
        };

        for edge in edges {
            let pair = edge
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| ModuleError::parse("connection must be [sender, receiver]"))?;
            let src = pair[0]
                .as_str()
                .ok_or_else(|| ModuleError::parse("connection endpoint must be a string"))?;
            let dst = pair[1]
                .as_str()
                .ok_or_else(|| ModuleError::parse("connection endpoint must be a string"))?;

            let (send_ref, send_port) = parse_path(src, scope.is_top(), PortType::Send)?;
            let (recv_ref, recv_port) = parse_path(dst, scope.is_top(), PortType::Receive)?;

            let send_key = conns.ensure_node(send_ref, scope)?;
            let recv_key = conns.ensure_node(recv_ref, scope)?;

            let send_node = &conns.nodes[send_key];
            if send_port >= send_node.send_ports {
                return Err(ModuleError::format(format!(
                    "{} has no output port {:02x}",
                    send_ref, send_port
                )));
            }
            let recv_node = &conns.nodes[recv_key];
            if recv_port >= recv_node.recv_ports {
                return Err(ModuleError::format(format!(
                    "{} has no input port {:02x}",
                    recv_ref, recv_port
                )));
            }

            conns.nodes[recv_key].senders[recv_port].push((send_key, send_port));
        }

        conns.compute_order()?;
        Ok(conns)
    }

    fn ensure_node(
        &mut self,
        dref: DeviceRef,
        scope: &dyn GraphScope,
    ) -> Result<NodeKey, ModuleError> {
        if let Some(&key) = self.by_ref.get(&dref) {
            return Ok(key);
        }
        let info = scope.resolve(dref).ok_or_else(|| {
            ModuleError::format(format!("dangling connection endpoint: {}", dref))
        })?;
        let key = self.nodes.insert(DeviceNode::new(dref, info));
        self.by_ref.insert(dref, key);
        Ok(key)
    }

    /// DFS three-coloring: detects cycles and records a senders-first
    /// execution order.
    fn compute_order(&mut self) -> Result<(), ModuleError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            New,
            Reached,
            Visited,
        }

        fn visit(
            nodes: &SlotMap<NodeKey, DeviceNode>,
            key: NodeKey,
            colors: &mut SecondaryMap<NodeKey, Color>,
            order: &mut Vec<NodeKey>,
        ) -> Result<(), ModuleError> {
            match colors.get(key).copied().unwrap_or(Color::New) {
                Color::Visited => return Ok(()),
                Color::Reached => {
                    return Err(ModuleError::format("connection graph contains a cycle"))
                }
                Color::New => {}
            }
            colors.insert(key, Color::Reached);
            for port in 0..DEVICE_PORTS_MAX {
                for &(sender, _) in &nodes[key].senders[port] {
                    visit(nodes, sender, colors, order)?;
                }
            }
            colors.insert(key, Color::Visited);
            order.push(key);
            Ok(())
        }

        let mut colors: SecondaryMap<NodeKey, Color> = SecondaryMap::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        let keys: Vec<NodeKey> = self.nodes.keys().collect();
        for key in keys {
            visit(&self.nodes, key, &mut colors, &mut order)?;
        }

        self.order = order;
        Ok(())
    }

    pub fn node(&self, key: NodeKey) -> &DeviceNode {
        &self.nodes[key]
    }

    pub fn get(&self, dref: DeviceRef) -> Option<&DeviceNode> {
        self.by_ref.get(&dref).map(|&key| &self.nodes[key])
    }

    /// Execution order with every sender before its receivers.
    pub fn order(&self) -> &[NodeKey] {
        &self.order
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Parse one connection path into a device reference and a port index.
///
/// Grammar: `[au_XX/ | proc_XX/] (in_XX | out_XX)` with two lowercase hex
/// digits per index. Bare ports belong to the scope owner and keep the
/// external perspective: at the top level a bare `out_NN` is the master
/// receive port; inside an audio unit a bare `in_NN` is an interior sender
/// (the input proxy) and a bare `out_NN` an interior receiver (the output
/// proxy).
fn parse_path(
    path: &str,
    is_top: bool,
    expected: PortType,
) -> Result<(DeviceRef, usize), ModuleError> {
    let mut parts = path.split('/');
    let first = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ModuleError::parse_at("empty connection path", path))?;
    let second = parts.next();
    if parts.next().is_some() {
        return Err(ModuleError::parse_at("too many path components", path));
    }

    match second {
        None => {
            // Bare port of the scope owner; direction is mirrored.
            let (dir, port) = parse_port(first, path)?;
            let (dref, owner_dir) = if is_top {
                (DeviceRef::Master, PortType::Receive)
            } else {
                match dir {
                    PortType::Receive => (DeviceRef::IfaceIn, PortType::Send),
                    PortType::Send => (DeviceRef::IfaceOut, PortType::Receive),
                }
            };
            if is_top && dir != PortType::Send {
                return Err(ModuleError::parse_at(
                    "master ports are addressed as out_XX",
                    path,
                ));
            }
            if owner_dir != expected {
                return Err(ModuleError::parse_at(
                    "connection endpoint has the wrong direction",
                    path,
                ));
            }
            Ok((dref, port))
        }
        Some(port_part) => {
            let dref = parse_device(first, is_top, path)?;
            let (dir, port) = parse_port(port_part, path)?;
            if dir != expected {
                return Err(ModuleError::parse_at(
                    "connection endpoint has the wrong direction",
                    path,
                ));
            }
            Ok((dref, port))
        }
    }
}

fn parse_device(part: &str, is_top: bool, path: &str) -> Result<DeviceRef, ModuleError> {
    if let Some(hex) = part.strip_prefix("au_") {
        return Ok(DeviceRef::Au(parse_hex_index(hex, path)?));
    }
    if let Some(hex) = part.strip_prefix("proc_") {
        if is_top {
            return Err(ModuleError::parse_at(
                "processors cannot be addressed at the top level",
                path,
            ));
        }
        return Ok(DeviceRef::Proc(parse_hex_index(hex, path)?));
    }
    Err(ModuleError::parse_at("unrecognized device path", path))
}

fn parse_port(part: &str, path: &str) -> Result<(PortType, usize), ModuleError> {
    if let Some(hex) = part.strip_prefix("in_") {
        let port = parse_hex_index(hex, path)?;
        check_port_range(port, path)?;
        return Ok((PortType::Receive, port));
    }
    if let Some(hex) = part.strip_prefix("out_") {
        let port = parse_hex_index(hex, path)?;
        check_port_range(port, path)?;
        return Ok((PortType::Send, port));
    }
    Err(ModuleError::parse_at("unrecognized port name", path))
}

fn parse_hex_index(hex: &str, path: &str) -> Result<usize, ModuleError> {
    if hex.len() != 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ModuleError::parse_at(
            "index must be two hexadecimal digits",
            path,
        ));
    }
    usize::from_str_radix(hex, 16)
        .map_err(|_| ModuleError::parse_at("index must be two hexadecimal digits", path))
}

fn check_port_range(port: usize, path: &str) -> Result<(), ModuleError> {
    if port >= DEVICE_PORTS_MAX {
        return Err(ModuleError::parse_at("port index out of range", path));
    }
    Ok(())
}

// ============================================================================
// Buffer preparation
// ============================================================================

/// Allocate every buffer the render walks will touch, so the hot path
/// stays allocation-free. Runs once per graph, rate or buffer-size change.
pub fn prepare_buffers(module: &Module, states: &mut DeviceStates, buffer_size: usize) {
    if buffer_size == 0 {
        return;
    }
    let thread_count = states.thread_count();

    if let Some(conns) = &module.connections {
        prepare_graph_thread0(conns, states, buffer_size);
    }
    for (_, au) in module.au_table.iter() {
        prepare_au(au, states, buffer_size, thread_count);
    }
}

fn prepare_graph_thread0(conns: &Connections, states: &mut DeviceStates, buffer_size: usize) {
    let tset = states.thread_mut(0);
    for &key in conns.order() {
        let node = conns.node(key);
        let tstate = tset.get_mut(node.device_id);
        tstate.clear_in_connected();
        for port in 0..node.recv_ports() {
            tstate.ensure_mixed_in(port, buffer_size);
        }
        for port in 0..node.send_ports() {
            tstate.ensure_mixed_out(port, buffer_size);
        }
        let connected: Vec<usize> = node.connected_ports().collect();
        for port in connected {
            tset.get_mut(node.device_id).set_in_connected(port);
        }
    }
}

fn prepare_au(au: &AudioUnit, states: &mut DeviceStates, buffer_size: usize, thread_count: usize) {
    // External and interface ports on the mixed path (thread 0).
    {
        let tset = states.thread_mut(0);
        let recv = au.device.port_count(PortType::Receive);
        let send = au.device.port_count(PortType::Send);
        let au_ts = tset.get_mut(au.device.id());
        for port in 0..recv {
            au_ts.ensure_mixed_in(port, buffer_size);
        }
        for port in 0..send {
            au_ts.ensure_mixed_out(port, buffer_size);
        }
        let in_ts = tset.get_mut(au.iface_in.id());
        for port in 0..au.iface_in.port_count(PortType::Send) {
            in_ts.ensure_mixed_out(port, buffer_size);
        }
        let out_ts = tset.get_mut(au.iface_out.id());
        for port in 0..au.iface_out.port_count(PortType::Receive) {
            out_ts.ensure_mixed_in(port, buffer_size);
        }
    }

    if let Some(conns) = &au.connections {
        prepare_graph_thread0(conns, states, buffer_size);
    }

    // Voice processors need voice scratch (and a mixed accumulation
    // target) on every thread.
    for (_, proc) in au.procs() {
        if !proc.has_imp() {
            continue;
        }
        let is_voice = proc.signal_type() == SignalType::Voice;
        let recv = proc.device.port_count(PortType::Receive);
        let send = proc.device.port_count(PortType::Send);
        for thread in 0..thread_count {
            let tstate = states.thread_mut(thread).get_mut(proc.device.id());
            if is_voice {
                for port in 0..recv {
                    tstate.ensure_voice_in(port, buffer_size);
                }
                for port in 0..send {
                    tstate.ensure_voice_out(port, buffer_size);
                    tstate.ensure_mixed_out(port, buffer_size);
                }
            }
        }
    }

    for (_, nested) in au.nested_aus() {
        prepare_au(nested, states, buffer_size, thread_count);
    }
}

// ============================================================================
// Mixed-path rendering
// ============================================================================

/// Mix each sender's mixed output into the node's mixed input buffers.
fn gather_mixed_inputs(
    conns: &Connections,
    key: NodeKey,
    tset: &mut ThreadStateSet,
    start: usize,
    stop: usize,
) {
    let node = conns.node(key);
    for rport in 0..node.recv_ports() {
        for &(send_key, sport) in node.senders(rport) {
            let sender = conns.node(send_key);
            if sender.device_id == node.device_id {
                continue;
            }
            let (recv_ts, send_ts) = tset.get_pair_mut(node.device_id, sender.device_id);
            let Some(src) = send_ts.mixed_out(sport) else {
                continue;
            };
            if !src.is_valid() {
                continue;
            }
            if let Some(dest) = recv_ts.mixed_in_mut(rport) {
                dest.mix(src, start, stop);
            }
        }
    }
}

/// Copy valid port buffers from one device's buffers to another's.
fn forward_ports(
    tset: &mut ThreadStateSet,
    from_id: DeviceId,
    from_out: bool,
    to_id: DeviceId,
    to_out: bool,
    port_count: usize,
    start: usize,
    stop: usize,
) {
    if from_id == to_id {
        return;
    }
    let (from_ts, to_ts) = tset.get_pair_mut(from_id, to_id);
    for port in 0..port_count {
        let src = if from_out {
            from_ts.mixed_out(port)
        } else {
            from_ts.mixed_in(port)
        };
        let Some(src) = src else { continue };
        if !src.is_valid() {
            continue;
        }
        let dest = if to_out {
            to_ts.mixed_out_mut(port)
        } else {
            to_ts.mixed_in_mut(port)
        };
        if let Some(dest) = dest {
            dest.copy_from(src, start, stop);
        }
    }
}

/// Render the module's mixed signal path for `[start, stop)` on thread 0.
///
/// Voice accumulations are expected to be merged into thread 0 already;
/// the walk fills receive buffers sender-side and calls `render_mixed` on
/// every mixed-path device in execution order.
pub fn render_mixed_graph(
    module: &Module,
    dstates: &mut [DeviceState],
    tset: &mut ThreadStateSet,
    start: usize,
    stop: usize,
    tempo: f64,
    audio_rate: u32,
) {
    let Some(conns) = &module.connections else {
        return;
    };
    for &key in conns.order() {
        gather_mixed_inputs(conns, key, tset, start, stop);
        if let DeviceRef::Au(index) = conns.node(key).dref {
            if let Some(au) = module.au_table.get(index) {
                render_au_mixed(au, dstates, tset, start, stop, tempo, audio_rate);
            }
        }
    }
}

fn render_au_mixed(
    au: &AudioUnit,
    dstates: &mut [DeviceState],
    tset: &mut ThreadStateSet,
    start: usize,
    stop: usize,
    tempo: f64,
    audio_rate: u32,
) {
    let au_id = au.device.id();

    // The walk color guards against rendering the unit twice in one slice.
    if tset.get(au_id).node_state == NodeState::Visited {
        return;
    }
    tset.get_mut(au_id).node_state = NodeState::Reached;

    if dstates[au_id].bypass {
        // Receive ports go straight to the matching send ports.
        let ports = au
            .device
            .port_count(PortType::Receive)
            .min(au.device.port_count(PortType::Send));
        let tstate = tset.get_mut(au_id);
        for port in 0..ports {
            tstate.copy_in_to_out(port, start, stop);
        }
        tstate.has_mixed_audio = true;
        tstate.node_state = NodeState::Visited;
        return;
    }

    // Forward external input to the interior input proxy.
    forward_ports(
        tset,
        au_id,
        false,
        au.iface_in.id(),
        true,
        au.iface_in.port_count(PortType::Send),
        start,
        stop,
    );

    if let Some(conns) = &au.connections {
        for &key in conns.order() {
            gather_mixed_inputs(conns, key, tset, start, stop);
            let node = conns.node(key);
            match node.dref {
                DeviceRef::Proc(index) => {
                    let Some(proc) = au.proc(index) else { continue };
                    let Some(imp) = proc.imp() else { continue };
                    if proc.signal_type() != SignalType::Mixed {
                        // Voice processors' send buffers already carry the
                        // accumulated voice signals.
                        continue;
                    }
                    let proc_id = proc.device.id();
                    let mut ctx = MixedRenderContext {
                        dstate: &mut dstates[proc_id],
                        tstate: tset.get_mut(proc_id),
                        start,
                        stop,
                        tempo,
                        audio_rate,
                    };
                    imp.render_mixed(&mut ctx);
                }
                DeviceRef::Au(index) => {
                    if let Some(nested) = au.nested_au(index) {
                        render_au_mixed(nested, dstates, tset, start, stop, tempo, audio_rate);
                    }
                }
                _ => {}
            }
        }
    }

    // Collect the interior output proxy back to the external send ports.
    forward_ports(
        tset,
        au.iface_out.id(),
        false,
        au_id,
        true,
        au.iface_out.port_count(PortType::Receive),
        start,
        stop,
    );
    let tstate = tset.get_mut(au_id);
    tstate.has_mixed_audio = true;
    tstate.node_state = NodeState::Visited;
}

// ============================================================================
// Voice-path rendering
// ============================================================================

/// Render one voice group through its audio unit's interior graph.
///
/// Walks the unit's voice processors in execution order, mixing voice
/// buffers along interior edges, and accumulates completed output into
/// this thread's mixed send buffers. Returns `true` while any member voice
/// remains active.
pub fn render_voice_group(
    module: &Module,
    group: &mut [Voice],
    tset: &mut ThreadStateSet,
    start: usize,
    stop: usize,
    tempo: f64,
    audio_rate: u32,
) -> bool {
    debug_assert!(!group.is_empty());
    let au_index = group[0].au_index;
    let Some(au) = module.au_table.get(au_index) else {
        for voice in group.iter_mut() {
            voice.active = false;
        }
        return false;
    };

    // Note-ons mid-buffer begin at their trigger frame.
    let start = start.max(group[0].frame_offset).min(stop);
    if start >= stop {
        return group.iter().any(|v| v.active);
    }

    // Recycled per-group scratch must not leak the previous group.
    for (_, proc) in au.procs() {
        if proc.has_imp() && proc.signal_type() == SignalType::Voice {
            tset.get_mut(proc.device.id()).clear_voice_buffers();
        }
    }

    let Some(conns) = &au.connections else {
        for voice in group.iter_mut() {
            voice.active = false;
        }
        return false;
    };

    for &key in conns.order() {
        let node = conns.node(key);
        let DeviceRef::Proc(proc_index) = node.dref else {
            continue;
        };
        let Some(proc) = au.proc(proc_index) else {
            continue;
        };
        let Some(imp) = proc.imp() else { continue };
        if proc.signal_type() != SignalType::Voice {
            continue;
        }
        let proc_id = proc.device.id();

        // Gather voice inputs from voice-path senders.
        for rport in 0..node.recv_ports() {
            for &(send_key, sport) in node.senders(rport) {
                let sender = conns.node(send_key);
                let DeviceRef::Proc(sender_index) = sender.dref else {
                    continue;
                };
                let Some(sender_proc) = au.proc(sender_index) else {
                    continue;
                };
                if sender_proc.signal_type() != SignalType::Voice
                    || sender.device_id == proc_id
                {
                    continue;
                }
                let (recv_ts, send_ts) = tset.get_pair_mut(proc_id, sender.device_id);
                let Some(src) = send_ts.voice_out(sport) else {
                    continue;
                };
                if !src.is_valid() {
                    continue;
                }
                if let Some(dest) = recv_ts.voice_in_mut(rport) {
                    dest.mix(src, start, stop);
                }
            }
        }

        let Some(voice) = group.iter_mut().find(|v| v.proc_index == proc_index) else {
            continue;
        };
        if !voice.active {
            continue;
        }

        let mut ctx = VoiceRenderContext {
            voice,
            tstate: tset.get_mut(proc_id),
            start,
            stop,
            tempo,
            audio_rate,
        };
        imp.render_voice(&mut ctx);
    }

    // Accumulate this group's output into the thread's mixed buffers.
    for (_, proc) in au.procs() {
        if proc.has_imp() && proc.signal_type() == SignalType::Voice {
            tset.get_mut(proc.device.id()).mix_voice_signals(start, stop);
        }
    }

    for voice in group.iter_mut() {
        voice.frame_offset = 0;
    }
    group.iter().any(|v| v.active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A minimal scope for graph-structure tests.
    struct TestScope {
        devices: Vec<(DeviceRef, ScopeDevice)>,
        top: bool,
    }

    impl GraphScope for TestScope {
        fn resolve(&self, dref: DeviceRef) -> Option<ScopeDevice> {
            self.devices
                .iter()
                .find(|(r, _)| *r == dref)
                .map(|(_, info)| *info)
        }

        fn is_top(&self) -> bool {
            self.top
        }
    }

    fn top_scope_with_aus(count: usize) -> TestScope {
        let mut devices = vec![(
            DeviceRef::Master,
            ScopeDevice {
                device_id: 0,
                recv_ports: 2,
                send_ports: 0,
            },
        )];
        for i in 0..count {
            devices.push((
                DeviceRef::Au(i),
                ScopeDevice {
                    device_id: 1 + i,
                    recv_ports: 2,
                    send_ports: 2,
                },
            ));
        }
        TestScope { devices, top: true }
    }

    #[test]
    fn test_parse_and_build_top_level() {
        let scope = top_scope_with_aus(1);
        let conns =
            Connections::from_json(&json!([["au_00/out_00", "out_00"]]), &scope).unwrap();
        assert_eq!(conns.node_count(), 2);

        let master = conns.get(DeviceRef::Master).unwrap();
        assert_eq!(master.senders(0).len(), 1);
    }

    #[test]
    fn test_order_has_senders_first() {
        let scope = top_scope_with_aus(2);
        let conns = Connections::from_json(
            &json!([
                ["au_00/out_00", "au_01/in_00"],
                ["au_01/out_00", "out_00"],
            ]),
            &scope,
        )
        .unwrap();

        let order = conns.order();
        let pos = |dref| {
            order
                .iter()
                .position(|&k| conns.node(k).dref == dref)
                .unwrap()
        };
        assert!(pos(DeviceRef::Au(0)) < pos(DeviceRef::Au(1)));
        assert!(pos(DeviceRef::Au(1)) < pos(DeviceRef::Master));
    }

    #[test]
    fn test_cycle_detection() {
        let scope = top_scope_with_aus(2);
        let result = Connections::from_json(
            &json!([
                ["au_00/out_00", "au_01/in_00"],
                ["au_01/out_00", "au_00/in_00"],
            ]),
            &scope,
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let scope = top_scope_with_aus(1);
        let result =
            Connections::from_json(&json!([["au_00/out_00", "au_00/in_00"]]), &scope);
        assert!(result.unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn test_dangling_endpoint() {
        let scope = top_scope_with_aus(1);
        let result =
            Connections::from_json(&json!([["au_05/out_00", "out_00"]]), &scope);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("dangling"));
    }

    #[test]
    fn test_missing_port_rejected() {
        let scope = top_scope_with_aus(1);
        // The au only declares ports 0 and 1.
        let result =
            Connections::from_json(&json!([["au_00/out_02", "out_00"]]), &scope);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_path_grammar() {
        let scope = top_scope_with_aus(1);
        for bad in [
            json!([["au_0/out_00", "out_00"]]),
            json!([["au_00/out_0", "out_00"]]),
            json!([["au_00/sideways_00", "out_00"]]),
            json!([["au_00/out_00", "proc_00/in_00"]]),
            json!([["au_00/out_00/extra", "out_00"]]),
            json!([["au_00/in_00", "out_00"]]),
        ] {
            assert!(
                Connections::from_json(&bad, &scope).is_err(),
                "accepted: {}",
                bad
            );
        }
    }

    #[test]
    fn test_interior_scope_bare_ports() {
        let scope = TestScope {
            top: false,
            devices: vec![
                (
                    DeviceRef::IfaceIn,
                    ScopeDevice {
                        device_id: 10,
                        recv_ports: 0,
                        send_ports: 2,
                    },
                ),
                (
                    DeviceRef::IfaceOut,
                    ScopeDevice {
                        device_id: 11,
                        recv_ports: 2,
                        send_ports: 0,
                    },
                ),
                (
                    DeviceRef::Proc(0),
                    ScopeDevice {
                        device_id: 12,
                        recv_ports: 2,
                        send_ports: 2,
                    },
                ),
            ],
        };

        let conns = Connections::from_json(
            &json!([
                ["in_00", "proc_00/in_00"],
                ["proc_00/out_00", "out_00"],
            ]),
            &scope,
        )
        .unwrap();

        assert!(conns.get(DeviceRef::IfaceIn).is_some());
        assert!(conns.get(DeviceRef::IfaceOut).is_some());
        let out = conns.get(DeviceRef::IfaceOut).unwrap();
        assert_eq!(out.senders(0).len(), 1);
    }

    #[test]
    fn test_fan_out_and_fan_in() {
        let scope = top_scope_with_aus(3);
        let conns = Connections::from_json(
            &json!([
                ["au_00/out_00", "au_01/in_00"],
                ["au_00/out_00", "au_02/in_00"],
                ["au_01/out_00", "out_00"],
                ["au_02/out_00", "out_00"],
            ]),
            &scope,
        )
        .unwrap();

        let master = conns.get(DeviceRef::Master).unwrap();
        assert_eq!(master.senders(0).len(), 2);
    }

    #[test]
    fn test_empty_graph() {
        let scope = top_scope_with_aus(0);
        let conns = Connections::from_json(&json!([]), &scope).unwrap();
        assert_eq!(conns.node_count(), 0);
        assert!(conns.order().is_empty());
    }
}
