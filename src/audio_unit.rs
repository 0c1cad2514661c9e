//! Audio Units
//!
//! An audio unit is a composite device: externally a single node with
//! receive and send ports, internally a small connections graph of
//! processors and nested effect units. The interior is bridged by two
//! interface proxies: the "in" proxy forwards the unit's receive ports to
//! interior senders, the "out" proxy collects interior signal back to the
//! unit's send ports.

use crate::connections::Connections;
use crate::device::{Device, DeviceImpl, DeviceParams, PortType, SignalType};
use crate::error::ModuleError;
use crate::processors::new_proc_impl;
use crate::{AUDIO_UNITS_MAX, PROCESSORS_MAX};

use serde_json::Value;

/// Role of an audio unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuType {
    /// Playable: note events resolve to this unit and allocate voices.
    #[default]
    Instrument,
    /// Signal transformer without its own notes.
    Effect,
}

/// A leaf device performing one DSP operation.
pub struct Processor {
    pub device: Device,
    pub params: DeviceParams,
    imp: Option<Box<dyn DeviceImpl>>,
    signal_type_override: Option<SignalType>,
}

impl Processor {
    pub fn new() -> Self {
        Self {
            device: Device::new(),
            params: DeviceParams::new(),
            imp: None,
            signal_type_override: None,
        }
    }

    /// Instantiate the implementation named in the manifest and declare
    /// its ports.
    pub fn set_type(&mut self, type_name: &str) -> Result<(), ModuleError> {
        let imp = new_proc_impl(type_name)?;
        let (num_in, num_out) = imp.port_counts();
        self.device.set_port_count(PortType::Receive, num_in);
        self.device.set_port_count(PortType::Send, num_out);
        self.device.set_existent(true);

        // Replay configuration that arrived before the manifest.
        let keys: Vec<String> = self.params.keys().map(String::from).collect();
        let mut imp = imp;
        for key in keys {
            if let Some(value) = self.params.get(&key) {
                imp.set_key(&key, value)?;
            }
        }

        self.imp = Some(imp);
        Ok(())
    }

    pub fn imp(&self) -> Option<&dyn DeviceImpl> {
        self.imp.as_deref()
    }

    pub fn has_imp(&self) -> bool {
        self.imp.is_some()
    }

    /// The processor's signal path: an explicit `p_signal_type.json` wins,
    /// otherwise the implementation's default.
    pub fn signal_type(&self) -> SignalType {
        if let Some(st) = self.signal_type_override {
            return st;
        }
        self.imp
            .as_deref()
            .map(|imp| imp.default_signal_type())
            .unwrap_or(SignalType::Voice)
    }

    /// Apply one configuration key below the processor path.
    pub fn set_key(&mut self, key: &str, value: Value) -> Result<(), ModuleError> {
        if key == "p_signal_type.json" {
            self.signal_type_override = match value.as_str() {
                Some("voice") => Some(SignalType::Voice),
                Some("mixed") => Some(SignalType::Mixed),
                _ => {
                    return Err(ModuleError::parse(
                        "p_signal_type.json must be \"voice\" or \"mixed\"",
                    ))
                }
            };
        }

        if !self.params.set(key, value.clone()) {
            // Identical value: device state must not change.
            return Ok(());
        }
        if let Some(imp) = self.imp.as_mut() {
            imp.set_key(key, &value)?;
        }
        Ok(())
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        if let Some(imp) = self.imp.as_mut() {
            imp.set_audio_rate(audio_rate);
        }
    }

    pub fn set_buffer_size(&mut self, size: usize) {
        if let Some(imp) = self.imp.as_mut() {
            imp.set_buffer_size(size);
        }
    }

    pub fn update_tempo(&mut self, tempo: f64) {
        if let Some(imp) = self.imp.as_mut() {
            imp.update_tempo(tempo);
        }
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

/// One named stream declared by an audio unit: events write to the name,
/// the processor at `proc_index` delivers the value into the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub name: String,
    pub proc_index: usize,
}

/// A composite device with an interior processor graph.
pub struct AudioUnit {
    pub device: Device,
    /// Interface proxy forwarding the unit's receive ports inward.
    pub iface_in: Device,
    /// Interface proxy collecting interior signal to the unit's send ports.
    pub iface_out: Device,
    pub params: DeviceParams,
    au_type: AuType,
    procs: Vec<Option<Processor>>,
    aus: Vec<Option<AudioUnit>>,
    /// Built at validation time from the raw edge list.
    pub connections: Option<Connections>,
    raw_connections: Option<Value>,
    streams: Vec<StreamEntry>,
}

impl AudioUnit {
    pub fn new() -> Self {
        Self {
            device: Device::new(),
            iface_in: Device::new(),
            iface_out: Device::new(),
            params: DeviceParams::new(),
            au_type: AuType::Instrument,
            procs: Vec::new(),
            aus: Vec::new(),
            connections: None,
            raw_connections: None,
            streams: Vec::new(),
        }
    }

    pub fn au_type(&self) -> AuType {
        self.au_type
    }

    pub fn set_au_type(&mut self, au_type: AuType) {
        self.au_type = au_type;
    }

    pub fn proc(&self, index: usize) -> Option<&Processor> {
        self.procs.get(index).and_then(Option::as_ref)
    }

    pub fn proc_mut(&mut self, index: usize) -> Option<&mut Processor> {
        self.procs.get_mut(index).and_then(Option::as_mut)
    }

    /// The processor at `index`, created on first touch.
    pub fn ensure_proc(&mut self, index: usize) -> Result<&mut Processor, ModuleError> {
        if index >= PROCESSORS_MAX {
            return Err(ModuleError::format(format!(
                "processor index {} out of range",
                index
            )));
        }
        if self.procs.len() <= index {
            self.procs.resize_with(index + 1, || None);
        }
        Ok(self.procs[index].get_or_insert_with(Processor::new))
    }

    pub fn proc_slots(&self) -> usize {
        self.procs.len()
    }

    /// Iterate existing processors with their indices.
    pub fn procs(&self) -> impl Iterator<Item = (usize, &Processor)> {
        self.procs
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (i, p)))
    }

    pub fn procs_mut(&mut self) -> impl Iterator<Item = (usize, &mut Processor)> {
        self.procs
            .iter_mut()
            .enumerate()
            .filter_map(|(i, p)| p.as_mut().map(|p| (i, p)))
    }

    /// Indices of processors on the voice signal path, in index order:
    /// the per-note group allocates one voice per entry.
    pub fn voice_proc_indices(&self) -> Vec<usize> {
        self.procs()
            .filter(|(_, p)| p.has_imp() && p.signal_type() == SignalType::Voice)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn nested_au(&self, index: usize) -> Option<&AudioUnit> {
        self.aus.get(index).and_then(Option::as_ref)
    }

    pub fn nested_au_mut(&mut self, index: usize) -> Option<&mut AudioUnit> {
        self.aus.get_mut(index).and_then(Option::as_mut)
    }

    /// The nested effect unit at `index`, created on first touch.
    pub fn ensure_nested_au(&mut self, index: usize) -> Result<&mut AudioUnit, ModuleError> {
        if index >= AUDIO_UNITS_MAX {
            return Err(ModuleError::format(format!(
                "audio unit index {} out of range",
                index
            )));
        }
        if self.aus.len() <= index {
            self.aus.resize_with(index + 1, || None);
        }
        Ok(self.aus[index].get_or_insert_with(AudioUnit::new))
    }

    pub fn nested_aus(&self) -> impl Iterator<Item = (usize, &AudioUnit)> {
        self.aus
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_ref().map(|a| (i, a)))
    }

    pub fn nested_aus_mut(&mut self) -> impl Iterator<Item = (usize, &mut AudioUnit)> {
        self.aus
            .iter_mut()
            .enumerate()
            .filter_map(|(i, a)| a.as_mut().map(|a| (i, a)))
    }

    /// Store the raw interior edge list; resolved during validation.
    pub fn set_raw_connections(&mut self, value: Value) {
        self.raw_connections = Some(value);
        self.connections = None;
    }

    pub fn raw_connections(&self) -> Option<&Value> {
        self.raw_connections.as_ref()
    }

    /// Parse the stream declaration `[[name, proc_index], ...]`.
    pub fn set_streams_from_json(&mut self, value: &Value) -> Result<(), ModuleError> {
        let items = value
            .as_array()
            .ok_or_else(|| ModuleError::parse("stream list must be an array"))?;
        let mut streams = Vec::with_capacity(items.len());
        for item in items {
            let pair = item
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| ModuleError::parse("stream entry must be [name, proc_index]"))?;
            let name = pair[0]
                .as_str()
                .ok_or_else(|| ModuleError::parse("stream name must be a string"))?;
            let proc_index = pair[1]
                .as_u64()
                .ok_or_else(|| ModuleError::parse("stream proc index must be an integer"))?;
            streams.push(StreamEntry {
                name: name.to_string(),
                proc_index: proc_index as usize,
            });
        }
        self.streams = streams;
        Ok(())
    }

    pub fn streams(&self) -> &[StreamEntry] {
        &self.streams
    }

    /// Stream entry by declaration index.
    pub fn stream(&self, index: usize) -> Option<&StreamEntry> {
        self.streams.get(index)
    }

    /// Mirror the unit's external ports onto the interface proxies:
    /// the in-proxy sends what the unit receives, the out-proxy receives
    /// what the unit sends.
    pub fn sync_iface_ports(&mut self) {
        self.iface_in.set_port_count(
            PortType::Send,
            self.device.port_count(PortType::Receive),
        );
        self.iface_out.set_port_count(
            PortType::Receive,
            self.device.port_count(PortType::Send),
        );
        self.iface_in.set_existent(true);
        self.iface_out.set_existent(true);

        for au in self.aus.iter_mut().flatten() {
            au.sync_iface_ports();
        }
    }

    /// Assign dense device ids to the unit, its interface proxies, its
    /// processors and its nested units, in a stable depth-first order.
    pub fn assign_device_ids(&mut self, next: &mut crate::device::DeviceId) {
        self.device.set_id(*next);
        *next += 1;
        self.iface_in.set_id(*next);
        *next += 1;
        self.iface_out.set_id(*next);
        *next += 1;
        for (_, proc) in self.procs_mut() {
            proc.device.set_id(*next);
            *next += 1;
        }
        for au in self.aus.iter_mut().flatten() {
            au.assign_device_ids(next);
        }
    }

    /// Check gapless port numbering throughout the subtree.
    pub fn validate_ports(&self) -> Result<(), ModuleError> {
        self.device.validate_port_prefix()?;
        for (index, proc) in self.procs() {
            proc.device.validate_port_prefix().map_err(|e| {
                ModuleError::format(format!("proc_{:02x}: {}", index, e.message()))
            })?;
        }
        for (index, au) in self.nested_aus() {
            au.validate_ports().map_err(|e| {
                ModuleError::format(format!("au_{:02x}: {}", index, e.message()))
            })?;
        }
        Ok(())
    }

    /// Build the interior connection graphs, nested units first.
    ///
    /// A unit with live processors and no edge list is a structural error:
    /// there is no way to guess how its signal reaches the output.
    pub fn build_connections(&mut self) -> Result<(), ModuleError> {
        let indices: Vec<usize> = self.nested_aus().map(|(i, _)| i).collect();
        for index in indices {
            if let Some(nested) = self.nested_au_mut(index) {
                nested.build_connections().map_err(|e| {
                    ModuleError::format(format!("au_{:02x}: {}", index, e.message()))
                })?;
            }
        }

        let Some(raw) = self.raw_connections.clone() else {
            if self.procs().any(|(_, p)| p.has_imp()) {
                return Err(ModuleError::format(
                    "missing connections for audio unit with processors",
                ));
            }
            self.connections = None;
            return Ok(());
        };
        let conns = Connections::from_json(&raw, &*self)?;
        self.connections = Some(conns);
        Ok(())
    }

    /// Propagate the audio rate to every implementation in the subtree.
    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        for (_, proc) in self.procs_mut() {
            proc.set_audio_rate(audio_rate);
        }
        for au in self.aus.iter_mut().flatten() {
            au.set_audio_rate(audio_rate);
        }
    }

    /// Propagate the buffer size to every implementation in the subtree.
    pub fn set_buffer_size(&mut self, size: usize) {
        for (_, proc) in self.procs_mut() {
            proc.set_buffer_size(size);
        }
        for au in self.aus.iter_mut().flatten() {
            au.set_buffer_size(size);
        }
    }

    /// Propagate a tempo change to every implementation in the subtree.
    pub fn update_tempo(&mut self, tempo: f64) {
        for (_, proc) in self.procs_mut() {
            proc.update_tempo(tempo);
        }
        for au in self.aus.iter_mut().flatten() {
            au.update_tempo(tempo);
        }
    }
}

impl Default for AudioUnit {
    fn default() -> Self {
        Self::new()
    }
}

/// The module's (or an audio unit's) bank of audio units.
#[derive(Default)]
pub struct AuTable {
    aus: Vec<Option<AudioUnit>>,
}

impl AuTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<&AudioUnit> {
        self.aus.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut AudioUnit> {
        self.aus.get_mut(index).and_then(Option::as_mut)
    }

    pub fn ensure(&mut self, index: usize) -> Result<&mut AudioUnit, ModuleError> {
        if index >= AUDIO_UNITS_MAX {
            return Err(ModuleError::format(format!(
                "audio unit index {} out of range",
                index
            )));
        }
        if self.aus.len() <= index {
            self.aus.resize_with(index + 1, || None);
        }
        Ok(self.aus[index].get_or_insert_with(AudioUnit::new))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &AudioUnit)> {
        self.aus
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_ref().map(|a| (i, a)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut AudioUnit)> {
        self.aus
            .iter_mut()
            .enumerate()
            .filter_map(|(i, a)| a.as_mut().map(|a| (i, a)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_processor_type_declares_ports() {
        let mut proc = Processor::new();
        proc.set_type("debug").unwrap();
        assert!(proc.device.port_exists(PortType::Receive, 0));
        assert!(proc.device.port_exists(PortType::Receive, 1));
        assert!(proc.device.port_exists(PortType::Send, 0));
        assert!(!proc.device.port_exists(PortType::Send, 1));
    }

    #[test]
    fn test_processor_key_before_type_is_replayed() {
        let mut proc = Processor::new();
        proc.set_key("p_b_single_pulse.json", json!(true)).unwrap();
        // The manifest arrives after the parameter; it must still apply.
        proc.set_type("debug").unwrap();
        assert_eq!(proc.params.get_bool("p_b_single_pulse.json"), Some(true));
    }

    #[test]
    fn test_processor_signal_type_override() {
        let mut proc = Processor::new();
        proc.set_type("volume").unwrap();
        assert_eq!(proc.signal_type(), SignalType::Mixed);

        proc.set_key("p_signal_type.json", json!("voice")).unwrap();
        assert_eq!(proc.signal_type(), SignalType::Voice);

        assert!(proc.set_key("p_signal_type.json", json!("bogus")).is_err());
    }

    #[test]
    fn test_voice_proc_indices_ordered() {
        let mut au = AudioUnit::new();
        au.ensure_proc(2).unwrap().set_type("debug").unwrap();
        au.ensure_proc(0).unwrap().set_type("force").unwrap();
        au.ensure_proc(1).unwrap().set_type("volume").unwrap(); // mixed

        assert_eq!(au.voice_proc_indices(), vec![0, 2]);
    }

    #[test]
    fn test_iface_ports_mirror_external() {
        let mut au = AudioUnit::new();
        au.device.set_port_count(PortType::Receive, 2);
        au.device.set_port_count(PortType::Send, 1);
        au.sync_iface_ports();

        assert_eq!(au.iface_in.port_count(PortType::Send), 2);
        assert_eq!(au.iface_out.port_count(PortType::Receive), 1);
    }

    #[test]
    fn test_streams_parse() {
        let mut au = AudioUnit::new();
        au.set_streams_from_json(&json!([["cutoff", 3], ["env", 0]]))
            .unwrap();
        assert_eq!(au.streams().len(), 2);
        assert_eq!(
            au.stream(0),
            Some(&StreamEntry {
                name: "cutoff".to_string(),
                proc_index: 3
            })
        );
        assert!(au.stream(2).is_none());
    }

    #[test]
    fn test_au_table_bounds() {
        let mut table = AuTable::new();
        assert!(table.ensure(AUDIO_UNITS_MAX).is_err());
        table.ensure(3).unwrap();
        assert!(table.get(3).is_some());
        assert!(table.get(2).is_none());
    }
}
