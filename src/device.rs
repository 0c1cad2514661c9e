//! Devices
//!
//! A device is any node in the connections graph: the master output, an
//! audio unit, an audio-unit interface proxy, or a processor. This module
//! defines the common skeleton every node embeds (identity, existence,
//! typed port sets and a keyed parameter store) plus [`DeviceImpl`], the
//! interface processor implementations plug into.

use crate::device_state::{DeviceState, DeviceThreadState};
use crate::error::ModuleError;
use crate::processors::VoiceStateData;
use crate::voice::Voice;
use crate::DEVICE_PORTS_MAX;

use serde_json::Value;
use std::collections::HashMap;

/// Dense device identifier, assigned at validation time; indexes the
/// runtime state arrays.
pub type DeviceId = usize;

/// Port direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortType {
    /// Input: the device consumes the signal.
    Receive,
    /// Output: the device produces the signal.
    Send,
}

/// Signal path class of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Rendered once per active voice inside an audio unit.
    Voice,
    /// Rendered once per frame slice on the mixed path.
    Mixed,
}

/// The common skeleton of every graph node.
#[derive(Debug, Clone)]
pub struct Device {
    id: DeviceId,
    existent: bool,
    /// Port existence bit arrays, indexed by direction.
    port_bits: [u32; 2],
}

impl Device {
    pub fn new() -> Self {
        Self {
            id: 0,
            existent: false,
            port_bits: [0; 2],
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn set_id(&mut self, id: DeviceId) {
        self.id = id;
    }

    pub fn is_existent(&self) -> bool {
        self.existent
    }

    pub fn set_existent(&mut self, existent: bool) {
        self.existent = existent;
    }

    /// Declare or retract one port.
    pub fn set_port_existence(&mut self, port_type: PortType, port: usize, exists: bool) {
        debug_assert!(port < DEVICE_PORTS_MAX);
        let bits = &mut self.port_bits[port_type as usize];
        if exists {
            *bits |= 1 << port;
        } else {
            *bits &= !(1 << port);
        }
    }

    /// Declare ports `[0, count)` in one direction.
    pub fn set_port_count(&mut self, port_type: PortType, count: usize) {
        debug_assert!(count <= DEVICE_PORTS_MAX);
        self.port_bits[port_type as usize] = if count == 0 { 0 } else { (1u32 << count) - 1 };
    }

    pub fn port_exists(&self, port_type: PortType, port: usize) -> bool {
        port < DEVICE_PORTS_MAX && (self.port_bits[port_type as usize] >> port) & 1 == 1
    }

    /// Number of ports if they form a gapless prefix.
    pub fn port_count(&self, port_type: PortType) -> usize {
        self.port_bits[port_type as usize].count_ones() as usize
    }

    /// Check that existent ports form a prefix `[0, k)` in both directions.
    pub fn validate_port_prefix(&self) -> Result<(), ModuleError> {
        for (bits, dir) in [
            (self.port_bits[PortType::Receive as usize], "input"),
            (self.port_bits[PortType::Send as usize], "output"),
        ] {
            // A gapless prefix of n bits is 2^n - 1: adding one yields a
            // power of two.
            if bits != 0 && !(bits + 1).is_power_of_two() {
                return Err(ModuleError::format(format!(
                    "gap in {} port numbering",
                    dir
                )));
            }
        }
        Ok(())
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed parameter store of one device.
///
/// Values are the payloads of `[version, value]` JSON envelopes, keyed by
/// the subkey below the device path (e.g. `p_b_single_pulse.json`).
#[derive(Debug, Clone, Default)]
pub struct DeviceParams {
    values: HashMap<String, Value>,
}

impl DeviceParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a parameter value. Storing an identical value is a no-op so
    /// repeated writes cannot perturb device state.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if self.values.get(&key) == Some(&value) {
            return false;
        }
        self.values.insert(key, value);
        true
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Everything a mixed-path render call may touch.
pub struct MixedRenderContext<'a> {
    /// Per-device mutable runtime state (delay lines, DSP history).
    pub dstate: &'a mut DeviceState,
    /// Per-thread buffer scratch; receive buffers are filled, send buffers
    /// are written.
    pub tstate: &'a mut DeviceThreadState,
    pub start: usize,
    pub stop: usize,
    pub tempo: f64,
    pub audio_rate: u32,
}

/// Everything a per-voice render call may touch.
pub struct VoiceRenderContext<'a> {
    /// The voice being rendered; holds the processor's per-voice state.
    pub voice: &'a mut Voice,
    /// Per-thread buffer scratch for the voice path.
    pub tstate: &'a mut DeviceThreadState,
    pub start: usize,
    pub stop: usize,
    pub tempo: f64,
    pub audio_rate: u32,
}

/// The interface every processor implementation provides.
///
/// All methods except the port declaration have working defaults, so an
/// implementation only supplies what its signal path needs: voice
/// processors implement `init_vstate` and `render_voice`, mixed processors
/// implement `render_mixed`.
pub trait DeviceImpl: Send + Sync {
    /// Receive and send port counts declared by this implementation.
    fn port_counts(&self) -> (usize, usize);

    /// The implementation's natural signal path; a processor's
    /// `p_signal_type.json` key may override it.
    fn default_signal_type(&self) -> SignalType {
        SignalType::Voice
    }

    /// Apply one configuration key. Unknown keys are ignored so that
    /// future data stays loadable.
    fn set_key(&mut self, _key: &str, _value: &Value) -> Result<(), ModuleError> {
        Ok(())
    }

    fn set_audio_rate(&mut self, _audio_rate: u32) {}

    fn set_buffer_size(&mut self, _size: usize) {}

    fn update_tempo(&mut self, _tempo: f64) {}

    /// Drop implementation-internal caches.
    fn reset(&mut self) {}

    /// Initialize per-voice state for a fresh note.
    fn init_vstate(&self) -> VoiceStateData {
        VoiceStateData::None
    }

    /// Fill per-voice send buffers for `[start, stop)`.
    ///
    /// Returns the index at which rendering actually stopped; a processor
    /// that finishes early deactivates the voice and returns the earlier
    /// stop index.
    fn render_voice(&self, ctx: &mut VoiceRenderContext) -> usize {
        ctx.stop
    }

    /// Fill mixed-path send buffers for `[start, stop)` from the receive
    /// buffers.
    fn render_mixed(&self, _ctx: &mut MixedRenderContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_port_existence() {
        let mut dev = Device::new();
        assert!(!dev.port_exists(PortType::Receive, 0));

        dev.set_port_existence(PortType::Receive, 0, true);
        dev.set_port_existence(PortType::Send, 3, true);
        assert!(dev.port_exists(PortType::Receive, 0));
        assert!(!dev.port_exists(PortType::Send, 0));
        assert!(dev.port_exists(PortType::Send, 3));
    }

    #[test]
    fn test_port_count_prefix() {
        let mut dev = Device::new();
        dev.set_port_count(PortType::Send, 2);
        assert!(dev.port_exists(PortType::Send, 0));
        assert!(dev.port_exists(PortType::Send, 1));
        assert!(!dev.port_exists(PortType::Send, 2));
        assert_eq!(dev.port_count(PortType::Send), 2);
        assert!(dev.validate_port_prefix().is_ok());
    }

    #[test]
    fn test_port_gap_detected() {
        let mut dev = Device::new();
        dev.set_port_existence(PortType::Receive, 0, true);
        dev.set_port_existence(PortType::Receive, 2, true);
        assert!(dev.validate_port_prefix().is_err());
    }

    #[test]
    fn test_retracting_port_creates_gap() {
        let mut dev = Device::new();
        dev.set_port_count(PortType::Receive, 3);
        dev.set_port_existence(PortType::Receive, 1, false);
        assert!(dev.validate_port_prefix().is_err());
    }

    #[test]
    fn test_params_idempotent_set() {
        let mut params = DeviceParams::new();
        assert!(params.set("p_volume.json", json!(-6.0)));
        // Same value again: no change reported.
        assert!(!params.set("p_volume.json", json!(-6.0)));
        assert!(params.set("p_volume.json", json!(0.0)));
    }

    #[test]
    fn test_params_typed_getters() {
        let mut params = DeviceParams::new();
        params.set("p_b_single_pulse.json", json!(true));
        params.set("p_volume.json", json!(-6.0));
        params.set("p_signal_type.json", json!("voice"));

        assert_eq!(params.get_bool("p_b_single_pulse.json"), Some(true));
        assert_eq!(params.get_f64("p_volume.json"), Some(-6.0));
        assert_eq!(params.get_str("p_signal_type.json"), Some("voice"));
        assert_eq!(params.get_bool("p_missing.json"), None);
    }
}
