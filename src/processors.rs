//! Processor Implementations
//!
//! Processors are the leaf devices of the graph: each performs one DSP
//! operation on the voice or mixed signal path. This module provides the
//! implementations the engine ships with plus the registry that maps a
//! `p_manifest.json` type name to a constructor.
//!
//! Common input conventions shared by all implementations:
//!
//! - an absent or invalid receive buffer is replaced by a neutral constant
//!   (silence, 440 Hz pitch, 0 dB force) and the output's constant region
//!   is still tracked,
//! - a force input that is final-constant at -inf dB deactivates the voice
//!   at that index,
//! - pitch buffers carry Hz, force buffers carry dB; amplitude conversion
//!   is `10^(dB/20)`,
//! - inputs that will be multiplied by zero are clamped first so that
//!   `inf * 0` can never inject NaN into a signal path.

use crate::controls::LinearControls;
use crate::device::{DeviceImpl, MixedRenderContext, SignalType, VoiceRenderContext};
use crate::error::ModuleError;
use crate::voice::VoicePriority;
use crate::work_buffer::WorkBuffer;

use libm::Libm;
use serde_json::Value;

/// Receive port layout shared by the audio-generating voice processors.
pub const PORT_PITCH: usize = 0;
/// See [`PORT_PITCH`].
pub const PORT_FORCE: usize = 1;

/// Silence threshold treated as -inf dB.
const FORCE_SILENT_DB: f32 = -144.0;

/// Convert decibels to a linear amplitude factor.
#[inline]
pub fn db_to_gain(db: f64) -> f64 {
    Libm::<f64>::pow(10.0, db / 20.0)
}

/// Per-voice state of any processor, preallocated inside each voice slot.
///
/// A tagged enum keeps the size fixed and known up front, so activating a
/// note never allocates.
#[derive(Debug, Clone, Default)]
pub enum VoiceStateData {
    #[default]
    None,
    Debug(DebugVState),
    Add(AddVState),
    Force(ForceVState),
    Pitch(PitchVState),
    Stream(StreamVState),
    Panning(PanningVState),
}

impl VoiceStateData {
    pub fn as_force_mut(&mut self) -> Option<&mut ForceVState> {
        match self {
            Self::Force(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pitch_mut(&mut self) -> Option<&mut PitchVState> {
        match self {
            Self::Pitch(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_stream_mut(&mut self) -> Option<&mut StreamVState> {
        match self {
            Self::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_panning_mut(&mut self) -> Option<&mut PanningVState> {
        match self {
            Self::Panning(s) => Some(s),
            _ => None,
        }
    }
}

/// Create a processor implementation from its manifest type name.
pub fn new_proc_impl(type_name: &str) -> Result<Box<dyn DeviceImpl>, ModuleError> {
    match type_name {
        "debug" => Ok(Box::new(DebugProc::new())),
        "add" => Ok(Box::new(AddProc::new())),
        "force" => Ok(Box::new(ForceProc::new())),
        "pitch" => Ok(Box::new(PitchProc::new())),
        "stream" => Ok(Box::new(StreamProc::new())),
        "volume" => Ok(Box::new(VolumeProc::new())),
        "rangemap" => Ok(Box::new(RangemapProc::new())),
        "panning" => Ok(Box::new(PanningProc::new())),
        _ => Err(ModuleError::format(format!(
            "unknown processor type: {}",
            type_name
        ))),
    }
}

/// Scan a force input for a final -inf dB region.
///
/// Returns the index at which the voice should deactivate, or `stop` if
/// the force keeps the voice alive through the slice.
fn force_deactivation_index(force: Option<&WorkBuffer>, start: usize, stop: usize) -> usize {
    let Some(force) = force else {
        return stop;
    };
    if !force.is_valid() || !force.is_final() {
        return stop;
    }
    let Some(const_start) = force.const_start() else {
        return stop;
    };
    if const_start >= stop {
        return stop;
    }
    let tail = force.contents()[const_start.max(start)];
    if tail <= FORCE_SILENT_DB {
        const_start.max(start)
    } else {
        stop
    }
}

/// Amplitude factor of a force input at one frame, with neutral fallback.
#[inline]
fn force_gain_at(force: Option<&WorkBuffer>, frame: usize) -> f32 {
    match force {
        Some(buf) if buf.is_valid() => {
            let db = buf.contents()[frame].max(FORCE_SILENT_DB);
            db_to_gain(f64::from(db)) as f32
        }
        _ => 1.0,
    }
}

// ============================================================================
// Debug
// ============================================================================

/// The test-signal processor.
///
/// In single-pulse mode it emits exactly one unit sample at note-on. In
/// envelope mode it emits `1.0` on the first frame of every 4-frame group
/// and `0.5` on the rest while the note is held, ending at the next group
/// boundary after release.
pub struct DebugProc {
    single_pulse: bool,
}

/// Per-voice state of [`DebugProc`].
#[derive(Debug, Clone, Default)]
pub struct DebugVState {
    /// Frames rendered since note-on.
    pub pos: u64,
}

impl DebugProc {
    pub fn new() -> Self {
        Self {
            single_pulse: false,
        }
    }
}

impl Default for DebugProc {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceImpl for DebugProc {
    fn port_counts(&self) -> (usize, usize) {
        (2, 1)
    }

    fn set_key(&mut self, key: &str, value: &Value) -> Result<(), ModuleError> {
        if key == "p_b_single_pulse.json" {
            self.single_pulse = value
                .as_bool()
                .ok_or_else(|| ModuleError::parse("p_b_single_pulse.json must be a boolean"))?;
        }
        Ok(())
    }

    fn init_vstate(&self) -> VoiceStateData {
        VoiceStateData::Debug(DebugVState::default())
    }

    fn render_voice(&self, ctx: &mut VoiceRenderContext) -> usize {
        let released = ctx.voice.prio() <= VoicePriority::Bg;
        let (ins, outs) = ctx.tstate.voice_bufs_mut();
        let VoiceStateData::Debug(state) = &mut ctx.voice.state else {
            ctx.voice.active = false;
            return ctx.start;
        };
        let Some(out) = outs[0].as_mut() else {
            ctx.voice.active = false;
            return ctx.start;
        };

        let stop = force_deactivation_index(
            ins.get(PORT_FORCE).and_then(Option::as_ref),
            ctx.start,
            ctx.stop,
        );

        let mut render_stop = stop;
        {
            let samples = out.contents_mut();
            if self.single_pulse {
                for i in ctx.start..stop {
                    samples[i] = if state.pos == 0 { 1.0 } else { 0.0 };
                    state.pos += 1;
                }
            } else {
                for i in ctx.start..stop {
                    if released && state.pos % 4 == 0 && state.pos > 0 {
                        // Finish at the group boundary after release.
                        render_stop = i;
                        break;
                    }
                    samples[i] = if state.pos % 4 == 0 { 1.0 } else { 0.5 };
                    state.pos += 1;
                }
            }
        }

        if render_stop < ctx.stop || (self.single_pulse && state.pos > 0) {
            // The tail is silent for the rest of the voice's life.
            let tail_start = render_stop.max(ctx.start);
            out.clear(tail_start, ctx.stop);
            out.set_final(true);
        }
        if self.single_pulse {
            out.set_const_start((ctx.start + 1).min(ctx.stop));
            if state.pos > 0 {
                // The pulse has been emitted; only silence remains.
                ctx.voice.active = false;
            }
        }
        out.mark_valid();

        if render_stop < ctx.stop {
            ctx.voice.active = false;
        }
        render_stop
    }
}

// ============================================================================
// Add (sine base wave)
// ============================================================================

/// Additive base-wave generator: a sine oscillator with a short attack
/// ramp to avoid clicks on its discontinuous onset.
pub struct AddProc {
    volume_db: f64,
}

/// Per-voice state of [`AddProc`].
#[derive(Debug, Clone, Default)]
pub struct AddVState {
    pub phase: f64,
    /// Attack ramp progress in [0, 1].
    pub ramp: f64,
}

/// Attack ramp duration in seconds.
const ADD_RAMP_TIME: f64 = 0.001;

impl AddProc {
    pub fn new() -> Self {
        Self { volume_db: 0.0 }
    }
}

impl Default for AddProc {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceImpl for AddProc {
    fn port_counts(&self) -> (usize, usize) {
        (2, 1)
    }

    fn set_key(&mut self, key: &str, value: &Value) -> Result<(), ModuleError> {
        if key == "p_f_volume.json" {
            self.volume_db = value
                .as_f64()
                .ok_or_else(|| ModuleError::parse("p_f_volume.json must be a number"))?;
        }
        Ok(())
    }

    fn init_vstate(&self) -> VoiceStateData {
        VoiceStateData::Add(AddVState::default())
    }

    fn render_voice(&self, ctx: &mut VoiceRenderContext) -> usize {
        let (ins, outs) = ctx.tstate.voice_bufs_mut();
        let VoiceStateData::Add(state) = &mut ctx.voice.state else {
            ctx.voice.active = false;
            return ctx.start;
        };
        let Some(out) = outs[0].as_mut() else {
            ctx.voice.active = false;
            return ctx.start;
        };

        let pitch = ins.get(PORT_PITCH).and_then(Option::as_ref);
        let force = ins.get(PORT_FORCE).and_then(Option::as_ref);
        let stop = force_deactivation_index(force, ctx.start, ctx.stop);

        let rate = f64::from(ctx.audio_rate.max(1));
        let ramp_step = 1.0 / (ADD_RAMP_TIME * rate).max(1.0);
        let base_gain = db_to_gain(self.volume_db);

        let samples = out.contents_mut();
        for i in ctx.start..stop {
            let freq = match pitch {
                Some(buf) if buf.is_valid() => f64::from(buf.contents()[i]).max(0.0),
                _ => 440.0,
            };
            let gain = f64::from(force_gain_at(force, i)) * base_gain;

            let value = Libm::<f64>::sin(state.phase * core::f64::consts::TAU) * gain;
            let ramped = if state.ramp < 1.0 {
                let v = value * state.ramp;
                state.ramp = (state.ramp + ramp_step).min(1.0);
                v
            } else {
                value
            };
            samples[i] = ramped as f32;

            state.phase += freq / rate;
            if state.phase >= 1.0 {
                state.phase -= Libm::<f64>::floor(state.phase);
            }
        }

        if stop < ctx.stop {
            out.clear(stop, ctx.stop);
            out.set_final(true);
            ctx.voice.active = false;
        }
        out.mark_valid();
        stop
    }
}

// ============================================================================
// Force
// ============================================================================

/// Produces the per-voice force stream in dB, including tremolo.
pub struct ForceProc {
    /// Global offset added to the controls at note-on.
    pub global_force_db: f64,
}

/// Per-voice state of [`ForceProc`].
#[derive(Debug, Clone)]
pub struct ForceVState {
    pub controls: LinearControls,
}

impl Default for ForceVState {
    fn default() -> Self {
        let mut controls = LinearControls::new();
        controls.set_value(0.0);
        Self { controls }
    }
}

impl ForceProc {
    pub fn new() -> Self {
        Self {
            global_force_db: 0.0,
        }
    }
}

impl Default for ForceProc {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceImpl for ForceProc {
    fn port_counts(&self) -> (usize, usize) {
        (0, 1)
    }

    fn set_key(&mut self, key: &str, value: &Value) -> Result<(), ModuleError> {
        if key == "p_f_global_force.json" {
            self.global_force_db = value
                .as_f64()
                .ok_or_else(|| ModuleError::parse("p_f_global_force.json must be a number"))?;
        }
        Ok(())
    }

    fn init_vstate(&self) -> VoiceStateData {
        VoiceStateData::Force(ForceVState::default())
    }

    fn render_voice(&self, ctx: &mut VoiceRenderContext) -> usize {
        let (_, outs) = ctx.tstate.voice_bufs_mut();
        let VoiceStateData::Force(state) = &mut ctx.voice.state else {
            ctx.voice.active = false;
            return ctx.start;
        };
        let Some(out) = outs[0].as_mut() else {
            return ctx.stop;
        };

        state.controls.set_audio_rate(ctx.audio_rate);
        state.controls.set_tempo(ctx.tempo);
        state.controls.fill_work_buffer(out, ctx.start, ctx.stop);

        if self.global_force_db != 0.0 {
            let offset = self.global_force_db as f32;
            let const_start = out.const_start();
            let samples = out.contents_mut();
            for v in samples.iter_mut().take(ctx.stop).skip(ctx.start) {
                *v += offset;
            }
            if let Some(cs) = const_start {
                out.set_const_start(cs);
            }
        }

        out.set_final(!state.controls.is_active());
        out.mark_valid();
        ctx.stop
    }
}

// ============================================================================
// Pitch
// ============================================================================

/// Produces the per-voice pitch stream, converting cents to Hz.
pub struct PitchProc;

/// Per-voice state of [`PitchProc`]; the controls operate in cents.
#[derive(Debug, Clone)]
pub struct PitchVState {
    pub controls: LinearControls,
}

impl Default for PitchVState {
    fn default() -> Self {
        let mut controls = LinearControls::new();
        controls.set_value(0.0);
        Self { controls }
    }
}

impl PitchProc {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PitchProc {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceImpl for PitchProc {
    fn port_counts(&self) -> (usize, usize) {
        (0, 1)
    }

    fn init_vstate(&self) -> VoiceStateData {
        VoiceStateData::Pitch(PitchVState::default())
    }

    fn render_voice(&self, ctx: &mut VoiceRenderContext) -> usize {
        let (_, outs) = ctx.tstate.voice_bufs_mut();
        let VoiceStateData::Pitch(state) = &mut ctx.voice.state else {
            ctx.voice.active = false;
            return ctx.start;
        };
        let Some(out) = outs[0].as_mut() else {
            return ctx.stop;
        };

        state.controls.set_audio_rate(ctx.audio_rate);
        state.controls.set_tempo(ctx.tempo);
        // Fill in cents first, then convert in place; the conversion only
        // needs one evaluation for the constant tail.
        state.controls.fill_work_buffer(out, ctx.start, ctx.stop);

        let const_start = out.const_start().unwrap_or(ctx.stop).clamp(ctx.start, ctx.stop);
        let samples = out.contents_mut();
        for v in samples.iter_mut().take(const_start).skip(ctx.start) {
            *v = crate::tuning::cents_to_hz(f64::from(*v)) as f32;
        }
        if const_start < ctx.stop {
            let hz = crate::tuning::cents_to_hz(f64::from(samples[const_start])) as f32;
            for v in samples.iter_mut().take(ctx.stop).skip(const_start) {
                *v = hz;
            }
        }
        out.set_const_start(const_start);
        out.set_final(!state.controls.is_active());
        out.mark_valid();
        ctx.stop
    }
}

// ============================================================================
// Stream
// ============================================================================

/// Delivers a named continuous value written by events into the graph.
pub struct StreamProc {
    init_value: f64,
}

/// Per-voice state of [`StreamProc`].
#[derive(Debug, Clone)]
pub struct StreamVState {
    pub controls: LinearControls,
}

impl Default for StreamVState {
    fn default() -> Self {
        let mut controls = LinearControls::new();
        controls.set_value(0.0);
        Self { controls }
    }
}

impl StreamProc {
    pub fn new() -> Self {
        Self { init_value: 0.0 }
    }

    pub fn init_value(&self) -> f64 {
        self.init_value
    }
}

impl Default for StreamProc {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceImpl for StreamProc {
    fn port_counts(&self) -> (usize, usize) {
        (0, 1)
    }

    fn set_key(&mut self, key: &str, value: &Value) -> Result<(), ModuleError> {
        if key == "p_f_init_value.json" {
            self.init_value = value
                .as_f64()
                .ok_or_else(|| ModuleError::parse("p_f_init_value.json must be a number"))?;
        }
        Ok(())
    }

    fn init_vstate(&self) -> VoiceStateData {
        let mut state = StreamVState::default();
        state.controls.set_value(self.init_value);
        VoiceStateData::Stream(state)
    }

    fn render_voice(&self, ctx: &mut VoiceRenderContext) -> usize {
        let (_, outs) = ctx.tstate.voice_bufs_mut();
        let VoiceStateData::Stream(state) = &mut ctx.voice.state else {
            ctx.voice.active = false;
            return ctx.start;
        };
        let Some(out) = outs[0].as_mut() else {
            return ctx.stop;
        };

        state.controls.set_audio_rate(ctx.audio_rate);
        state.controls.set_tempo(ctx.tempo);
        state.controls.fill_work_buffer(out, ctx.start, ctx.stop);
        out.set_final(!state.controls.is_active());
        out.mark_valid();
        ctx.stop
    }
}

// ============================================================================
// Volume
// ============================================================================

/// Scales audio by a fixed gain; works on both signal paths.
pub struct VolumeProc {
    volume_db: f64,
}

impl VolumeProc {
    pub fn new() -> Self {
        Self { volume_db: 0.0 }
    }

    fn apply(
        &self,
        ins: &[Option<WorkBuffer>],
        outs: &mut [Option<WorkBuffer>],
        start: usize,
        stop: usize,
    ) {
        let gain = db_to_gain(self.volume_db) as f32;
        for port in 0..2 {
            let Some(input) = ins.get(port).and_then(Option::as_ref) else {
                continue;
            };
            if !input.is_valid() {
                continue;
            }
            let Some(out) = outs.get_mut(port).and_then(Option::as_mut) else {
                continue;
            };
            out.copy_from(input, start, stop);
            if gain != 1.0 {
                let const_start = out.const_start();
                let is_final = out.is_final();
                let samples = out.contents_mut();
                for v in samples.iter_mut().take(stop).skip(start) {
                    *v *= gain;
                }
                if let Some(cs) = const_start {
                    out.set_const_start(cs);
                    out.set_final(is_final);
                }
            }
            out.mark_valid();
        }
    }
}

impl Default for VolumeProc {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceImpl for VolumeProc {
    fn port_counts(&self) -> (usize, usize) {
        (2, 2)
    }

    fn default_signal_type(&self) -> SignalType {
        SignalType::Mixed
    }

    fn set_key(&mut self, key: &str, value: &Value) -> Result<(), ModuleError> {
        if key == "p_f_volume.json" {
            self.volume_db = value
                .as_f64()
                .ok_or_else(|| ModuleError::parse("p_f_volume.json must be a number"))?;
        }
        Ok(())
    }

    fn init_vstate(&self) -> VoiceStateData {
        VoiceStateData::None
    }

    fn render_voice(&self, ctx: &mut VoiceRenderContext) -> usize {
        let (ins, outs) = ctx.tstate.voice_bufs_mut();
        self.apply(ins, outs, ctx.start, ctx.stop);
        ctx.stop
    }

    fn render_mixed(&self, ctx: &mut MixedRenderContext) {
        let (ins, outs) = ctx.tstate.mixed_bufs_mut();
        self.apply(ins, outs, ctx.start, ctx.stop);
    }
}

// ============================================================================
// Rangemap
// ============================================================================

/// Affinely remaps one signal range onto another, optionally clamping.
pub struct RangemapProc {
    from_min: f64,
    from_max: f64,
    min_to: f64,
    max_to: f64,
    clamp_dest: bool,
}

impl RangemapProc {
    pub fn new() -> Self {
        Self {
            from_min: 0.0,
            from_max: 1.0,
            min_to: 0.0,
            max_to: 1.0,
            clamp_dest: false,
        }
    }

    fn apply(
        &self,
        ins: &[Option<WorkBuffer>],
        outs: &mut [Option<WorkBuffer>],
        start: usize,
        stop: usize,
    ) {
        let Some(input) = ins.first().and_then(Option::as_ref) else {
            return;
        };
        if !input.is_valid() {
            return;
        }
        let Some(out) = outs.get_mut(0).and_then(Option::as_mut) else {
            return;
        };

        let width = self.from_max - self.from_min;
        let scale = if width != 0.0 {
            (self.max_to - self.min_to) / width
        } else {
            0.0
        };
        let (lo, hi) = if self.min_to <= self.max_to {
            (self.min_to as f32, self.max_to as f32)
        } else {
            (self.max_to as f32, self.min_to as f32)
        };

        let const_start = input.const_start();
        let is_final = input.is_final();
        {
            let src = input.contents();
            let dest = out.contents_mut();
            for i in start..stop {
                let mut v =
                    (self.min_to + (f64::from(src[i]) - self.from_min) * scale) as f32;
                if self.clamp_dest {
                    v = v.clamp(lo, hi);
                }
                dest[i] = v;
            }
        }
        if let Some(cs) = const_start {
            out.set_const_start(cs);
            out.set_final(is_final);
        }
        out.mark_valid();
    }
}

impl Default for RangemapProc {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceImpl for RangemapProc {
    fn port_counts(&self) -> (usize, usize) {
        (1, 1)
    }

    fn set_key(&mut self, key: &str, value: &Value) -> Result<(), ModuleError> {
        let num = |v: &Value, name: &str| {
            v.as_f64()
                .ok_or_else(|| ModuleError::parse(format!("{} must be a number", name)))
        };
        match key {
            "p_f_from_min.json" => self.from_min = num(value, key)?,
            "p_f_from_max.json" => self.from_max = num(value, key)?,
            "p_f_min_to.json" => self.min_to = num(value, key)?,
            "p_f_max_to.json" => self.max_to = num(value, key)?,
            "p_b_clamp_dest.json" => {
                self.clamp_dest = value
                    .as_bool()
                    .ok_or_else(|| ModuleError::parse("p_b_clamp_dest.json must be a boolean"))?
            }
            _ => {}
        }
        Ok(())
    }

    fn init_vstate(&self) -> VoiceStateData {
        VoiceStateData::None
    }

    fn render_voice(&self, ctx: &mut VoiceRenderContext) -> usize {
        let (ins, outs) = ctx.tstate.voice_bufs_mut();
        self.apply(ins, outs, ctx.start, ctx.stop);
        ctx.stop
    }

    fn render_mixed(&self, ctx: &mut MixedRenderContext) {
        let (ins, outs) = ctx.tstate.mixed_bufs_mut();
        self.apply(ins, outs, ctx.start, ctx.stop);
    }
}

// ============================================================================
// Panning
// ============================================================================

/// Constant-power stereo panner on the voice path.
pub struct PanningProc;

/// Per-voice state of [`PanningProc`]; the controls run in [-1, 1].
#[derive(Debug, Clone)]
pub struct PanningVState {
    pub controls: LinearControls,
}

impl Default for PanningVState {
    fn default() -> Self {
        let mut controls = LinearControls::new();
        controls.set_range(-1.0, 1.0);
        controls.set_value(0.0);
        Self { controls }
    }
}

impl PanningProc {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PanningProc {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceImpl for PanningProc {
    fn port_counts(&self) -> (usize, usize) {
        (2, 2)
    }

    fn init_vstate(&self) -> VoiceStateData {
        VoiceStateData::Panning(PanningVState::default())
    }

    fn render_voice(&self, ctx: &mut VoiceRenderContext) -> usize {
        let VoiceStateData::Panning(state) = &mut ctx.voice.state else {
            ctx.voice.active = false;
            return ctx.start;
        };

        // Produce the pan stream into the voice's scratch slab first.
        let Some(scratch) = ctx.voice.work_buffer.as_mut() else {
            return ctx.stop;
        };
        state.controls.set_audio_rate(ctx.audio_rate);
        state.controls.set_tempo(ctx.tempo);
        state.controls.fill_work_buffer(scratch, ctx.start, ctx.stop);

        let (ins, outs) = ctx.tstate.voice_bufs_mut();
        let pan = scratch.contents();
        for port in 0..2 {
            let Some(input) = ins.get(port).and_then(Option::as_ref) else {
                continue;
            };
            if !input.is_valid() {
                continue;
            }
            let Some(out) = outs.get_mut(port).and_then(Option::as_mut) else {
                continue;
            };
            {
                let src = input.contents();
                let dest = out.contents_mut();
                for i in ctx.start..ctx.stop {
                    let p = f64::from(pan[i].clamp(-1.0, 1.0));
                    let angle = (p + 1.0) * core::f64::consts::PI / 4.0;
                    let gain = if port == 0 {
                        Libm::<f64>::cos(angle)
                    } else {
                        Libm::<f64>::sin(angle)
                    };
                    dest[i] = src[i] * gain as f32;
                }
            }
            out.mark_valid();
        }
        ctx.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_state::DeviceThreadState;
    use crate::rng::Rng;
    use crate::voice::Voice;
    use approx::assert_relative_eq;

    fn voice_with(impl_: &dyn DeviceImpl) -> Voice {
        let mut voice = Voice::new();
        voice.init(0, 0, 0, impl_.init_vstate(), Rng::from_seed(1), 0);
        voice.work_buffer = Some(WorkBuffer::new(128));
        voice
    }

    fn tstate_for(impl_: &dyn DeviceImpl, size: usize) -> DeviceThreadState {
        let mut ts = DeviceThreadState::new();
        let (num_in, num_out) = impl_.port_counts();
        for port in 0..num_in {
            ts.ensure_voice_in(port, size);
        }
        for port in 0..num_out {
            ts.ensure_voice_out(port, size);
        }
        ts
    }

    fn render(
        impl_: &dyn DeviceImpl,
        voice: &mut Voice,
        tstate: &mut DeviceThreadState,
        start: usize,
        stop: usize,
    ) -> usize {
        let mut ctx = VoiceRenderContext {
            voice,
            tstate,
            start,
            stop,
            tempo: 120.0,
            audio_rate: 220,
        };
        impl_.render_voice(&mut ctx)
    }

    #[test]
    fn test_debug_single_pulse() {
        let mut proc = DebugProc::new();
        proc.set_key("p_b_single_pulse.json", &serde_json::json!(true))
            .unwrap();

        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 128);
        render(&proc, &mut voice, &mut ts, 0, 128);

        let out = ts.voice_out(0).unwrap();
        assert!(out.is_valid());
        assert_eq!(out.contents()[0], 1.0);
        assert!(out.contents()[1..128].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_debug_envelope_pattern() {
        let proc = DebugProc::new();
        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 16);
        render(&proc, &mut voice, &mut ts, 0, 16);

        let out = ts.voice_out(0).unwrap();
        for i in 0..16 {
            let expected = if i % 4 == 0 { 1.0 } else { 0.5 };
            assert_eq!(out.contents()[i], expected, "frame {}", i);
        }
        assert!(voice.active);
    }

    #[test]
    fn test_debug_release_ends_at_group_boundary() {
        let proc = DebugProc::new();
        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 16);
        render(&proc, &mut voice, &mut ts, 0, 6);

        voice.set_prio(VoicePriority::Bg);
        let stop = render(&proc, &mut voice, &mut ts, 6, 16);
        // Note-off at frame 6: the current 4-frame group ends at frame 8.
        assert_eq!(stop, 8);
        assert!(!voice.active);
        let out = ts.voice_out(0).unwrap();
        assert_eq!(out.contents()[7], 0.5);
        assert_eq!(out.contents()[8], 0.0);
        assert!(out.is_final());
    }

    #[test]
    fn test_debug_deactivates_on_final_silent_force() {
        let proc = DebugProc::new();
        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 16);

        {
            let force = ts.voice_in_mut(PORT_FORCE).unwrap();
            force.fill_const(-1000.0, 0, 16);
            force.set_const_start(4);
            force.set_final(true);
        }

        let stop = render(&proc, &mut voice, &mut ts, 0, 16);
        assert_eq!(stop, 4);
    }

    #[test]
    fn test_add_starts_with_ramp_and_follows_pitch() {
        let proc = AddProc::new();
        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 64);

        {
            let pitch = ts.voice_in_mut(PORT_PITCH).unwrap();
            pitch.fill_const(55.0, 0, 64);
        }

        render(&proc, &mut voice, &mut ts, 0, 64);
        let out = ts.voice_out(0).unwrap();
        assert!(out.is_valid());
        // Zero phase start: the very first sample is silent.
        assert_eq!(out.contents()[0], 0.0);
        // The signal is nonzero once the wave and ramp get going.
        assert!(out.contents()[..64].iter().any(|&x| x.abs() > 0.01));
    }

    #[test]
    fn test_force_fill_and_final_flag() {
        let proc = ForceProc::new();
        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 32);

        if let Some(state) = voice.state.as_force_mut() {
            state.controls.set_audio_rate(220);
            state.controls.set_value(-6.0);
        }

        render(&proc, &mut voice, &mut ts, 0, 32);
        let out = ts.voice_out(0).unwrap();
        assert!(out.is_valid());
        assert!(out.is_final());
        assert_relative_eq!(out.contents()[10], -6.0);
    }

    #[test]
    fn test_pitch_converts_cents_to_hz() {
        let proc = PitchProc::new();
        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 16);

        if let Some(state) = voice.state.as_pitch_mut() {
            state.controls.set_value(0.0); // 0 cents = 440 Hz
        }

        render(&proc, &mut voice, &mut ts, 0, 16);
        let out = ts.voice_out(0).unwrap();
        assert_relative_eq!(out.contents()[5], 440.0, epsilon = 1e-3);
        assert_eq!(out.const_start(), Some(0));
    }

    #[test]
    fn test_stream_uses_init_value() {
        let mut proc = StreamProc::new();
        proc.set_key("p_f_init_value.json", &serde_json::json!(0.75))
            .unwrap();

        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 8);
        render(&proc, &mut voice, &mut ts, 0, 8);

        let out = ts.voice_out(0).unwrap();
        assert_relative_eq!(out.contents()[0], 0.75);
    }

    #[test]
    fn test_volume_unity_passthrough() {
        let proc = VolumeProc::new();
        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 8);
        ts.voice_in_mut(0).unwrap().fill_const(0.5, 0, 8);

        render(&proc, &mut voice, &mut ts, 0, 8);
        let out = ts.voice_out(0).unwrap();
        // 0 dB: bit-exact passthrough.
        assert_eq!(out.contents()[3], 0.5);
    }

    #[test]
    fn test_volume_gain() {
        let mut proc = VolumeProc::new();
        proc.set_key("p_f_volume.json", &serde_json::json!(-20.0))
            .unwrap();

        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 8);
        ts.voice_in_mut(0).unwrap().fill_const(1.0, 0, 8);

        render(&proc, &mut voice, &mut ts, 0, 8);
        let out = ts.voice_out(0).unwrap();
        assert_relative_eq!(out.contents()[0], 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_volume_skips_invalid_input() {
        let proc = VolumeProc::new();
        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 8);

        render(&proc, &mut voice, &mut ts, 0, 8);
        assert!(!ts.voice_out(0).unwrap().is_valid());
    }

    #[test]
    fn test_rangemap_remaps_and_clamps() {
        let mut proc = RangemapProc::new();
        for (key, v) in [
            ("p_f_from_min.json", 0.0),
            ("p_f_from_max.json", 1.0),
            ("p_f_min_to.json", -2.0),
            ("p_f_max_to.json", 2.0),
        ] {
            proc.set_key(key, &serde_json::json!(v)).unwrap();
        }
        proc.set_key("p_b_clamp_dest.json", &serde_json::json!(true))
            .unwrap();

        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 8);
        ts.voice_in_mut(0).unwrap().fill_const(2.0, 0, 8);

        render(&proc, &mut voice, &mut ts, 0, 8);
        let out = ts.voice_out(0).unwrap();
        // 2.0 maps to 6.0 but clamps to 2.0.
        assert_relative_eq!(out.contents()[0], 2.0);
    }

    #[test]
    fn test_panning_center_is_equal_power() {
        let proc = PanningProc::new();
        let mut voice = voice_with(&proc);
        let mut ts = tstate_for(&proc, 8);
        ts.voice_in_mut(0).unwrap().fill_const(1.0, 0, 8);
        ts.voice_in_mut(1).unwrap().fill_const(1.0, 0, 8);

        render(&proc, &mut voice, &mut ts, 0, 8);
        let l = ts.voice_out(0).unwrap().contents()[0];
        let r = ts.voice_out(1).unwrap().contents()[0];
        assert_relative_eq!(l, r, epsilon = 1e-6);
        assert_relative_eq!(l, core::f64::consts::FRAC_1_SQRT_2 as f32, epsilon = 1e-6);
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        assert!(new_proc_impl("debug").is_ok());
        assert!(new_proc_impl("no_such_proc").is_err());
    }
}
