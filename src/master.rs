//! Master Parameters
//!
//! The global playback state: current tempo with its slide, playback mode,
//! mixing volume, jump bookkeeping, pattern delay, the runtime tuning
//! copies and the master random stream. Everything here is mutated by
//! master events between render slices and read by the scheduler.

use crate::rng::Rng;
use crate::tstamp::Tstamp;
use crate::tuning::TuningTable;
use crate::TUNING_TABLES_MAX;

/// Playback mode of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackMode {
    #[default]
    Stop,
    /// Follow the album's track list.
    Song,
    /// Loop one pattern instance.
    Pattern,
}

/// A linear tempo slide.
///
/// The slide length is fixed in frames at start time (using the starting
/// tempo), which keeps the trajectory well-defined while the tempo itself
/// is moving.
#[derive(Debug, Clone, Default)]
pub struct TempoSlide {
    active: bool,
    from: f64,
    target: f64,
    total_frames: f64,
    pos_frames: f64,
}

impl TempoSlide {
    pub fn start(&mut self, from: f64, target: f64, length: &Tstamp, audio_rate: u32) {
        debug_assert!(from > 0.0);
        debug_assert!(target > 0.0);
        self.from = from;
        self.target = target;
        self.total_frames = length.to_frames(from, audio_rate).max(1.0);
        self.pos_frames = 0.0;
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Advance by a frame count and return the new tempo.
    pub fn advance(&mut self, frames: usize) -> f64 {
        if !self.active {
            return self.target;
        }
        self.pos_frames += frames as f64;
        if self.pos_frames >= self.total_frames {
            self.active = false;
            return self.target;
        }
        let progress = self.pos_frames / self.total_frames;
        self.from + (self.target - self.from) * progress
    }

    pub fn cancel(&mut self) {
        self.active = false;
    }
}

/// The global playback parameters.
pub struct MasterParams {
    pub playback_mode: PlaybackMode,
    /// Track being played in song mode.
    pub track: i32,
    pub tempo: f64,
    pub tempo_slide: TempoSlide,
    /// Length of subsequent tempo slides.
    pub tempo_slide_length: Tstamp,
    /// Module mixing volume in dB.
    pub volume_db: f64,
    /// Remaining `mj` executions; set by `m.jc`.
    pub jump_counter: i64,
    /// Set when a jump event fired; consumed by the player, which rewinds
    /// the current pattern.
    pub jump_requested: bool,
    /// Remaining pattern delay; while nonzero the cursors hold position.
    pub pattern_delay_left: Tstamp,
    /// Runtime tuning copies, mutable by retune events.
    tuning_states: Vec<Option<TuningTable>>,
    /// Active tuning table index, if any.
    pub active_tuning: Option<usize>,
    pub rng: Rng,
}

impl MasterParams {
    pub fn new(seed: u64) -> Self {
        Self {
            playback_mode: PlaybackMode::Stop,
            track: 0,
            tempo: 120.0,
            tempo_slide: TempoSlide::default(),
            tempo_slide_length: Tstamp::zero(),
            volume_db: 0.0,
            jump_counter: 0,
            jump_requested: false,
            pattern_delay_left: Tstamp::zero(),
            tuning_states: (0..TUNING_TABLES_MAX).map(|_| None).collect(),
            active_tuning: None,
            rng: Rng::from_seed(seed),
        }
    }

    /// Install the runtime tuning copies from the module's tables.
    pub fn set_tuning_tables(&mut self, tables: &[Option<TuningTable>]) {
        for (slot, table) in self.tuning_states.iter_mut().zip(tables.iter()) {
            *slot = table.clone();
        }
        for slot in self.tuning_states.iter_mut().skip(tables.len()) {
            *slot = None;
        }
    }

    pub fn tuning_state(&self, index: usize) -> Option<&TuningTable> {
        self.tuning_states.get(index).and_then(Option::as_ref)
    }

    pub fn tuning_state_mut(&mut self, index: usize) -> Option<&mut TuningTable> {
        self.tuning_states.get_mut(index).and_then(Option::as_mut)
    }

    /// The tuning table notes are currently resolved against, if any.
    pub fn active_tuning_state(&self) -> Option<&TuningTable> {
        self.active_tuning.and_then(|i| self.tuning_state(i))
    }

    /// Reset for a new playback run at the given tempo.
    pub fn reset(&mut self, track: i32, tempo: f64, volume_db: f64, seed: u64) {
        self.playback_mode = PlaybackMode::Song;
        self.track = track;
        self.tempo = tempo;
        self.tempo_slide = TempoSlide::default();
        self.tempo_slide_length = Tstamp::zero();
        self.volume_db = volume_db;
        self.jump_counter = 0;
        self.jump_requested = false;
        self.pattern_delay_left = Tstamp::zero();
        self.active_tuning = None;
        self.rng = Rng::from_seed(seed);
    }

    /// Step the tempo slide across a rendered chunk.
    pub fn advance_tempo_slide(&mut self, frames: usize) {
        if self.tempo_slide.is_active() {
            self.tempo = self.tempo_slide.advance(frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tempo_slide_reaches_target() {
        let mut slide = TempoSlide::default();
        // One beat at 120 BPM and 8 Hz = 4 frames.
        slide.start(120.0, 60.0, &Tstamp::new(1, 0), 8);
        assert!(slide.is_active());

        let mid = slide.advance(2);
        assert!(mid < 120.0 && mid > 60.0);

        let done = slide.advance(2);
        assert_relative_eq!(done, 60.0);
        assert!(!slide.is_active());
    }

    #[test]
    fn test_master_reset() {
        let mut mp = MasterParams::new(1);
        mp.jump_counter = 3;
        mp.pattern_delay_left = Tstamp::new(1, 0);
        mp.playback_mode = PlaybackMode::Pattern;

        mp.reset(0, 140.0, -3.0, 1);
        assert_eq!(mp.playback_mode, PlaybackMode::Song);
        assert_relative_eq!(mp.tempo, 140.0);
        assert_relative_eq!(mp.volume_db, -3.0);
        assert_eq!(mp.jump_counter, 0);
        assert!(mp.pattern_delay_left.is_zero());
    }

    #[test]
    fn test_tuning_state_install_and_select() {
        let mut mp = MasterParams::new(1);
        let tables = vec![Some(TuningTable::twelve_tet()), None];
        mp.set_tuning_tables(&tables);

        assert!(mp.tuning_state(0).is_some());
        assert!(mp.tuning_state(1).is_none());
        assert!(mp.active_tuning_state().is_none());

        mp.active_tuning = Some(0);
        assert!(mp.active_tuning_state().is_some());
    }
}
