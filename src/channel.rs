//! Channel State
//!
//! A channel is the per-column musical state: which audio unit notes
//! resolve to, the current pitch/force/panning automation, carry flags,
//! the named stream dictionary, and the `if`/`else` enabled-events stack.
//! Channels own no audio buffers; they drive voices.

use crate::controls::LinearControls;
use crate::rng::Rng;
use crate::tstamp::Tstamp;

use std::collections::HashMap;

/// Default force slide length: 0 (jump in one sample).
const DEFAULT_SLIDE_LENGTH: Tstamp = Tstamp::zero();

/// One `if` frame of the enabled-events stack.
#[derive(Debug, Clone, Copy)]
struct CondFrame {
    cond: bool,
    else_seen: bool,
}

impl CondFrame {
    fn active(&self) -> bool {
        if self.else_seen {
            !self.cond
        } else {
            self.cond
        }
    }
}

/// Control flow state shared by general events and bind expansion.
#[derive(Debug, Clone, Default)]
pub struct GeneralState {
    cond_stack: Vec<CondFrame>,
    /// Current bind expansion depth.
    pub bind_depth: u32,
}

impl GeneralState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether non-general events are currently processed.
    pub fn events_enabled(&self) -> bool {
        self.cond_stack.iter().all(CondFrame::active)
    }

    pub fn begin_if(&mut self, cond: bool) {
        self.cond_stack.push(CondFrame {
            cond,
            else_seen: false,
        });
    }

    /// Flip the innermost branch. Without an open `if` this is a dropped
    /// event, not an error.
    pub fn begin_else(&mut self) -> bool {
        match self.cond_stack.last_mut() {
            Some(frame) if !frame.else_seen => {
                frame.else_seen = true;
                true
            }
            _ => false,
        }
    }

    pub fn end_if(&mut self) -> bool {
        self.cond_stack.pop().is_some()
    }

    pub fn reset(&mut self) {
        self.cond_stack.clear();
        self.bind_depth = 0;
    }
}

/// One named continuous value written by events.
#[derive(Debug, Clone)]
pub struct StreamSlot {
    pub controls: LinearControls,
}

/// The channel's named stream dictionary.
///
/// Streams keep their values across notes; whether a note-on reuses or
/// resets them is decided by the channel's carry flag.
#[derive(Debug, Clone, Default)]
pub struct ChannelStreamState {
    slots: HashMap<String, StreamSlot>,
}

impl ChannelStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&StreamSlot> {
        self.slots.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut StreamSlot> {
        self.slots.get_mut(name)
    }

    /// The slot for `name`, created with the given initial value on first
    /// touch.
    pub fn entry(&mut self, name: &str, init_value: f64, audio_rate: u32) -> &mut StreamSlot {
        self.slots.entry(name.to_string()).or_insert_with(|| {
            let mut controls = LinearControls::new();
            controls.set_audio_rate(audio_rate);
            controls.set_value(init_value);
            StreamSlot { controls }
        })
    }

    /// Overwrite a slot's value, breaking slides; used when carry is off.
    pub fn reset_value(&mut self, name: &str, value: f64, audio_rate: u32) {
        let slot = self.entry(name, value, audio_rate);
        slot.controls.set_value(value);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Per-column musical state.
pub struct Channel {
    pub index: usize,
    pub general: GeneralState,
    /// Group id of the foreground voices, 0 when none.
    pub fg_group_id: u64,
    /// Audio unit selected by `.a` through the control map.
    pub au_input: usize,
    /// Stream targeted by subsequent stream events, as a declaration index
    /// into the audio unit's stream table.
    pub selected_stream: Option<usize>,

    /// Pitch automation in cents.
    pub pitch_controls: LinearControls,
    /// Force automation in dB.
    pub force_controls: LinearControls,
    /// Panning automation in [-1, 1].
    pub panning_controls: LinearControls,

    pub carry_force: bool,
    pub carry_pitch: bool,
    pub carry_stream: bool,

    pub streams: ChannelStreamState,
    pub rng: Rng,

    audio_rate: u32,
    tempo: f64,
}

impl Channel {
    pub fn new(index: usize, seed_rng: &Rng) -> Self {
        let mut ch = Self {
            index,
            general: GeneralState::new(),
            fg_group_id: 0,
            au_input: 0,
            selected_stream: None,
            pitch_controls: LinearControls::new(),
            force_controls: LinearControls::new(),
            panning_controls: LinearControls::new(),
            carry_force: false,
            carry_pitch: false,
            carry_stream: false,
            streams: ChannelStreamState::new(),
            rng: seed_rng.fork(index as u64),
            audio_rate: 48000,
            tempo: 120.0,
        };
        ch.init_controls();
        ch
    }

    fn init_controls(&mut self) {
        self.pitch_controls.set_value(0.0);
        self.pitch_controls.slide_length(&DEFAULT_SLIDE_LENGTH);

        self.force_controls.set_value(0.0);
        self.force_controls.slide_length(&DEFAULT_SLIDE_LENGTH);

        self.panning_controls.set_range(-1.0, 1.0);
        self.panning_controls.set_value(0.0);
        self.panning_controls.slide_length(&DEFAULT_SLIDE_LENGTH);
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.audio_rate = audio_rate;
        self.pitch_controls.set_audio_rate(audio_rate);
        self.force_controls.set_audio_rate(audio_rate);
        self.panning_controls.set_audio_rate(audio_rate);
    }

    pub fn audio_rate(&self) -> u32 {
        self.audio_rate
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.tempo = tempo;
        self.pitch_controls.set_tempo(tempo);
        self.force_controls.set_tempo(tempo);
        self.panning_controls.set_tempo(tempo);
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Restore the start-of-playback state, keeping the audio rate.
    pub fn reset(&mut self, default_au_input: usize, seed_rng: &Rng) {
        self.general.reset();
        self.fg_group_id = 0;
        self.au_input = default_au_input;
        self.selected_stream = None;
        self.carry_force = false;
        self.carry_pitch = false;
        self.carry_stream = false;
        self.streams.clear();
        self.rng = seed_rng.fork(self.index as u64);
        self.pitch_controls = LinearControls::new();
        self.force_controls = LinearControls::new();
        self.panning_controls = LinearControls::new();
        self.init_controls();
        self.set_audio_rate(self.audio_rate);
        self.set_tempo(self.tempo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general_state_if_else() {
        let mut gs = GeneralState::new();
        assert!(gs.events_enabled());

        gs.begin_if(false);
        assert!(!gs.events_enabled());

        assert!(gs.begin_else());
        assert!(gs.events_enabled());

        assert!(gs.end_if());
        assert!(gs.events_enabled());
    }

    #[test]
    fn test_general_state_nesting() {
        let mut gs = GeneralState::new();
        gs.begin_if(true);
        gs.begin_if(false);
        assert!(!gs.events_enabled());
        gs.end_if();
        assert!(gs.events_enabled());
        gs.end_if();
    }

    #[test]
    fn test_general_state_stray_else_and_endif() {
        let mut gs = GeneralState::new();
        assert!(!gs.begin_else());
        assert!(!gs.end_if());

        gs.begin_if(true);
        assert!(gs.begin_else());
        // A second else in the same frame is dropped.
        assert!(!gs.begin_else());
    }

    #[test]
    fn test_stream_entry_initializes_once() {
        let mut streams = ChannelStreamState::new();
        streams.entry("cutoff", 0.5, 48000);
        streams
            .get_mut("cutoff")
            .unwrap()
            .controls
            .set_value(0.9);

        // A later entry call must not clobber the live value.
        let slot = streams.entry("cutoff", 0.5, 48000);
        assert!((slot.controls.value() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_stream_reset_value_clobbers() {
        let mut streams = ChannelStreamState::new();
        streams.entry("env", 0.0, 48000);
        streams.get_mut("env").unwrap().controls.set_value(0.7);
        streams.reset_value("env", 0.1, 48000);
        assert!((streams.get("env").unwrap().controls.value() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_channel_reset_restores_defaults() {
        let seed = Rng::from_seed(99);
        let mut ch = Channel::new(3, &seed);
        ch.carry_force = true;
        ch.au_input = 7;
        ch.fg_group_id = 42;
        ch.force_controls.set_value(-12.0);

        ch.reset(2, &seed);
        assert!(!ch.carry_force);
        assert_eq!(ch.au_input, 2);
        assert_eq!(ch.fg_group_id, 0);
        assert!((ch.force_controls.value() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_channel_rng_deterministic_per_index() {
        let seed = Rng::from_seed(5);
        let mut a = Channel::new(0, &seed);
        let mut b = Channel::new(0, &seed);
        let mut c = Channel::new(1, &seed);
        assert_eq!(a.rng.next_u64(), b.rng.next_u64());
        assert_ne!(a.rng.next_u64(), c.rng.next_u64());
    }
}
