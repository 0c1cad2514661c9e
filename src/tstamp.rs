//! Musical Time
//!
//! This module defines [`Tstamp`], the fixed-point musical timestamp used for
//! all positions and distances in sheet data, along with the pattern
//! addressing types [`PatInstRef`] and [`Position`].
//!
//! A `Tstamp` counts whole beats plus a remainder expressed in units of
//! 1/[`TSTAMP_BEAT`] of a beat. The representation is exact under addition
//! and subtraction, totally ordered, and converts to an audio frame count
//! only at the last moment, given the current tempo and audio rate.

use serde::{Deserialize, Serialize};

/// Number of timestamp remainder units in one beat.
///
/// Chosen as a highly composite value so that common tuplet subdivisions
/// (2..=9, 11, 13, ...) divide it exactly.
pub const TSTAMP_BEAT: i32 = 882_161_280;

/// Fixed-point musical time: whole beats plus a remainder.
///
/// Invariant: `0 <= rem < TSTAMP_BEAT` for all values produced by this
/// module; negative time is expressed with negative `beats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tstamp {
    beats: i64,
    rem: i32,
}

impl Tstamp {
    /// Create a timestamp from beats and a remainder.
    pub fn new(beats: i64, rem: i32) -> Self {
        debug_assert!((0..TSTAMP_BEAT).contains(&rem));
        Self { beats, rem }
    }

    /// The zero timestamp.
    pub const fn zero() -> Self {
        Self { beats: 0, rem: 0 }
    }

    /// The largest representable timestamp, used as a "no limit" marker in
    /// minimum-distance searches.
    pub const fn max() -> Self {
        Self {
            beats: i64::MAX,
            rem: TSTAMP_BEAT - 1,
        }
    }

    /// Smallest positive timestamp.
    pub const fn epsilon() -> Self {
        Self { beats: 0, rem: 1 }
    }

    /// Whole beat count.
    #[inline]
    pub fn beats(&self) -> i64 {
        self.beats
    }

    /// Beat remainder in units of 1/[`TSTAMP_BEAT`].
    #[inline]
    pub fn rem(&self) -> i32 {
        self.rem
    }

    /// Whether this timestamp is exactly zero.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.beats == 0 && self.rem == 0
    }

    /// Checked addition with remainder carry.
    pub fn add(&self, other: &Tstamp) -> Tstamp {
        let mut beats = self.beats + other.beats;
        let mut rem = self.rem + other.rem;
        if rem >= TSTAMP_BEAT {
            rem -= TSTAMP_BEAT;
            beats += 1;
        }
        Tstamp::new(beats, rem)
    }

    /// Subtraction with remainder borrow. May produce negative beats.
    pub fn sub(&self, other: &Tstamp) -> Tstamp {
        let mut beats = self.beats - other.beats;
        let mut rem = self.rem - other.rem;
        if rem < 0 {
            rem += TSTAMP_BEAT;
            beats -= 1;
        }
        Tstamp::new(beats, rem)
    }

    /// Update `self` to `min(self, other)` in place.
    pub fn min_update(&mut self, other: &Tstamp) {
        if *other < *self {
            *self = *other;
        }
    }

    /// This timestamp as a floating-point beat count.
    #[inline]
    pub fn to_beats(&self) -> f64 {
        self.beats as f64 + f64::from(self.rem) / f64::from(TSTAMP_BEAT)
    }

    /// Convert to an exact (fractional) frame count at the given tempo and
    /// audio rate.
    pub fn to_frames(&self, tempo: f64, audio_rate: u32) -> f64 {
        debug_assert!(tempo > 0.0);
        debug_assert!(audio_rate > 0);
        self.to_beats() * 60.0 / tempo * f64::from(audio_rate)
    }

    /// Convert a frame count back to musical time at the given tempo and
    /// audio rate, rounding to the nearest remainder unit.
    pub fn from_frames(frames: f64, tempo: f64, audio_rate: u32) -> Tstamp {
        debug_assert!(frames >= 0.0);
        debug_assert!(tempo > 0.0);
        debug_assert!(audio_rate > 0);

        let beats_f = frames * tempo / 60.0 / f64::from(audio_rate);
        let beats = beats_f.floor();
        let rem = ((beats_f - beats) * f64::from(TSTAMP_BEAT)).round() as i32;
        if rem >= TSTAMP_BEAT {
            Tstamp::new(beats as i64 + 1, 0)
        } else {
            Tstamp::new(beats as i64, rem)
        }
    }
}

impl Default for Tstamp {
    fn default() -> Self {
        Self::zero()
    }
}

/// Address of one pattern instance: `(pattern index, instance index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatInstRef {
    pub pat: i32,
    pub inst: i32,
}

impl PatInstRef {
    pub fn new(pat: i32, inst: i32) -> Self {
        Self { pat, inst }
    }

    /// The "no pattern" marker used before a position is resolved.
    pub const fn invalid() -> Self {
        Self { pat: -1, inst: -1 }
    }

    pub fn is_valid(&self) -> bool {
        self.pat >= 0 && self.inst >= 0
    }
}

/// A playback position.
///
/// Either fully valid (track and system resolved against the album) or a
/// pattern-playback position that addresses one pattern instance directly
/// and has no track/system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// Track index, or -1 in pattern playback.
    pub track: i32,
    /// System index within the song, or -1 in pattern playback.
    pub system: i32,
    /// Position within the current pattern.
    pub pat_pos: Tstamp,
    /// The pattern instance being played.
    pub piref: PatInstRef,
}

impl Position {
    /// Starting position of the given track.
    pub fn start_of_track(track: i32) -> Self {
        Self {
            track,
            system: 0,
            pat_pos: Tstamp::zero(),
            piref: PatInstRef::invalid(),
        }
    }

    /// Pattern-playback position addressing one pattern instance.
    pub fn pattern_playback(piref: PatInstRef) -> Self {
        Self {
            track: -1,
            system: -1,
            pat_pos: Tstamp::zero(),
            piref,
        }
    }

    /// Whether this is a fully valid normal-playback position.
    pub fn is_valid(&self) -> bool {
        self.track >= 0 && self.system >= 0
    }

    /// Whether this position addresses a playable pattern directly.
    pub fn has_valid_pattern_pos(&self) -> bool {
        self.piref.is_valid()
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::start_of_track(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_carries_remainder() {
        let a = Tstamp::new(1, TSTAMP_BEAT - 1);
        let b = Tstamp::new(0, 2);
        let sum = a.add(&b);
        assert_eq!(sum, Tstamp::new(2, 1));
    }

    #[test]
    fn test_sub_borrows_remainder() {
        let a = Tstamp::new(2, 0);
        let b = Tstamp::new(0, 1);
        let diff = a.sub(&b);
        assert_eq!(diff, Tstamp::new(1, TSTAMP_BEAT - 1));
    }

    #[test]
    fn test_sub_can_go_negative() {
        let a = Tstamp::new(0, 0);
        let b = Tstamp::new(0, 1);
        let diff = a.sub(&b);
        assert_eq!(diff.beats(), -1);
        assert_eq!(diff.rem(), TSTAMP_BEAT - 1);
    }

    #[test]
    fn test_ordering() {
        assert!(Tstamp::new(0, 5) < Tstamp::new(0, 6));
        assert!(Tstamp::new(1, 0) > Tstamp::new(0, TSTAMP_BEAT - 1));
        assert!(Tstamp::zero() < Tstamp::max());
    }

    #[test]
    fn test_min_update() {
        let mut dist = Tstamp::max();
        dist.min_update(&Tstamp::new(3, 0));
        assert_eq!(dist, Tstamp::new(3, 0));
        dist.min_update(&Tstamp::new(5, 0));
        assert_eq!(dist, Tstamp::new(3, 0));
    }

    #[test]
    fn test_frame_conversion_round_trip() {
        // One beat at 120 BPM, 48000 Hz = half a second = 24000 frames.
        let one_beat = Tstamp::new(1, 0);
        let frames = one_beat.to_frames(120.0, 48000);
        assert!((frames - 24000.0).abs() < 1e-9);

        let back = Tstamp::from_frames(24000.0, 120.0, 48000);
        assert_eq!(back, one_beat);
    }

    #[test]
    fn test_from_frames_rounds_cleanly_at_beat_boundary() {
        // A frame count a hair below a whole beat must not produce an
        // out-of-range remainder.
        let ts = Tstamp::from_frames(23999.9999999999, 120.0, 48000);
        assert!(ts.rem() < TSTAMP_BEAT);
        assert_eq!(ts, Tstamp::new(1, 0));
    }

    #[test]
    fn test_position_validity() {
        let normal = Position::start_of_track(0);
        assert!(normal.is_valid());

        let pat = Position::pattern_playback(PatInstRef::new(3, 0));
        assert!(!pat.is_valid());
        assert!(pat.has_valid_pattern_pos());
    }
}
