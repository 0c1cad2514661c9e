//! Tuning Tables
//!
//! A tuning table is an ordered list of notes within one octave, a
//! per-octave ratio, a reference note with a reference pitch, and an
//! optional global offset in cents. It answers two queries: `(note, octave)`
//! to Hz, and cents to Hz via the nearest table note. Tables can be retuned
//! on the fly: the scale pattern is restarted from a new reference note
//! while one fixed note keeps its current pitch, which is how modulating
//! between keys works in just intonation.

use crate::error::ModuleError;

use libm::Libm;
use serde_json::Value;

/// Maximum number of notes within one octave.
pub const TUNING_TABLE_NOTES_MAX: usize = 128;

/// Number of addressable octaves.
pub const TUNING_TABLE_OCTAVES: usize = 16;

/// The octave whose notes sound at their base cents values.
pub const TUNING_TABLE_CENTER_OCTAVE: usize = 8;

/// Default reference pitch in Hz (C5 in 12-TET from A440).
pub const TUNING_TABLE_DEFAULT_REF_PITCH: f64 = 523.251_130_601_197_25;

/// Convert a pitch in cents (0 = 440 Hz) to Hz.
#[inline]
pub fn cents_to_hz(cents: f64) -> f64 {
    440.0 * Libm::<f64>::exp2(cents / 1200.0)
}

/// Convert a pitch in Hz to cents (440 Hz = 0).
#[inline]
pub fn hz_to_cents(hz: f64) -> f64 {
    debug_assert!(hz > 0.0);
    1200.0 * Libm::<f64>::log2(hz / 440.0)
}

/// A microtonal pitch lookup table with retuning support.
#[derive(Debug, Clone)]
pub struct TuningTable {
    /// Base cents of each note relative to the first note.
    init_cents: Vec<f64>,
    /// Current (possibly retuned) cents of each note.
    retuned_cents: Vec<f64>,
    ref_note: usize,
    ref_note_retuned: usize,
    ref_pitch: f64,
    /// Global pitch offset in cents.
    pitch_offset: f64,
    /// Octave width in cents.
    octave_width: f64,
    /// Inverse-lookup subindex: (cents within octave, note index), sorted.
    pitch_map: Vec<(f64, usize)>,
}

impl TuningTable {
    /// Create a 12-tone equal-temperament table, the fallback used when a
    /// module declares no tuning of its own.
    pub fn twelve_tet() -> Self {
        let notes: Vec<f64> = (0..12).map(|i| f64::from(i) * 100.0).collect();
        Self::with_notes(&notes, 0, TUNING_TABLE_DEFAULT_REF_PITCH, 1200.0)
            .expect("12-TET layout is always valid")
    }

    /// Create a table from explicit note offsets (cents from the first
    /// note), a reference note, a reference pitch and an octave width.
    pub fn with_notes(
        notes: &[f64],
        ref_note: usize,
        ref_pitch: f64,
        octave_width: f64,
    ) -> Result<Self, ModuleError> {
        if notes.is_empty() || notes.len() > TUNING_TABLE_NOTES_MAX {
            return Err(ModuleError::format(format!(
                "tuning table must have 1..={} notes, got {}",
                TUNING_TABLE_NOTES_MAX,
                notes.len()
            )));
        }
        if ref_note >= notes.len() {
            return Err(ModuleError::format(format!(
                "tuning table reference note {} out of range",
                ref_note
            )));
        }
        if !(ref_pitch > 0.0) {
            return Err(ModuleError::format("tuning table reference pitch must be positive"));
        }
        if !(octave_width > 0.0) {
            return Err(ModuleError::format("tuning table octave width must be positive"));
        }

        let mut table = Self {
            init_cents: notes.to_vec(),
            retuned_cents: notes.to_vec(),
            ref_note,
            ref_note_retuned: ref_note,
            ref_pitch,
            pitch_offset: 0.0,
            octave_width,
            pitch_map: Vec::new(),
        };
        table.rebuild_pitch_map();
        Ok(table)
    }

    /// Parse a table from its JSON description.
    ///
    /// Recognized fields: `notes` (cents numbers or `["/", [num, den]]`
    /// ratios), `ref_note`, `ref_pitch`, `pitch_offset`, and
    /// `octave_ratio` (a ratio array or a cents number).
    pub fn from_json(value: &Value) -> Result<Self, ModuleError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ModuleError::parse("tuning table description must be an object"))?;

        let notes = match obj.get("notes") {
            Some(Value::Array(items)) => {
                let mut cents = Vec::with_capacity(items.len());
                for item in items {
                    cents.push(parse_pitch_entry(item)?);
                }
                cents
            }
            Some(_) => return Err(ModuleError::parse("tuning table notes must be an array")),
            None => (0..12).map(|i| f64::from(i) * 100.0).collect(),
        };

        let ref_note = obj
            .get("ref_note")
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| ModuleError::parse("tuning table ref_note must be an integer"))
            })
            .transpose()?
            .unwrap_or(0) as usize;

        let ref_pitch = obj
            .get("ref_pitch")
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| ModuleError::parse("tuning table ref_pitch must be a number"))
            })
            .transpose()?
            .unwrap_or(TUNING_TABLE_DEFAULT_REF_PITCH);

        let octave_width = match obj.get("octave_ratio") {
            Some(v) => parse_pitch_entry(v)?,
            None => 1200.0,
        };

        let mut table = Self::with_notes(&notes, ref_note, ref_pitch, octave_width)?;

        if let Some(v) = obj.get("pitch_offset") {
            let offset = v
                .as_f64()
                .ok_or_else(|| ModuleError::parse("tuning table pitch_offset must be a number"))?;
            table.set_pitch_offset(offset);
        }

        Ok(table)
    }

    pub fn note_count(&self) -> usize {
        self.init_cents.len()
    }

    pub fn ref_note(&self) -> usize {
        self.ref_note
    }

    pub fn ref_note_retuned(&self) -> usize {
        self.ref_note_retuned
    }

    pub fn ref_pitch(&self) -> f64 {
        self.ref_pitch
    }

    pub fn octave_width(&self) -> f64 {
        self.octave_width
    }

    /// Set the global pitch offset in cents.
    pub fn set_pitch_offset(&mut self, offset: f64) {
        debug_assert!(offset.is_finite());
        self.pitch_offset = offset;
    }

    /// The current cents value of one note in the center octave, relative
    /// to the reference pitch.
    pub fn note_cents(&self, note: usize) -> f64 {
        debug_assert!(note < self.note_count());
        self.retuned_cents[note] - self.init_cents[self.ref_note]
    }

    /// Pitch of `(note, octave)` in Hz.
    pub fn pitch(&self, note: usize, octave: usize) -> f64 {
        debug_assert!(note < self.note_count());
        debug_assert!(octave < TUNING_TABLE_OCTAVES);

        let oct_offset =
            (octave as f64 - TUNING_TABLE_CENTER_OCTAVE as f64) * self.octave_width;
        let cents = self.note_cents(note) + oct_offset + self.pitch_offset;
        self.ref_pitch * Libm::<f64>::exp2(cents / 1200.0)
    }

    /// Map an arbitrary pitch in cents (440 Hz = 0) to Hz through the
    /// nearest table note.
    pub fn pitch_from_cents(&self, cents: f64) -> f64 {
        let ref_cents = hz_to_cents(self.ref_pitch);
        let rel = cents - ref_cents - self.pitch_offset;

        let (note, octave_shift) = self.nearest_note(rel);
        let oct_offset = octave_shift as f64 * self.octave_width;
        let snapped = self.note_cents(note) + oct_offset + self.pitch_offset;
        self.ref_pitch * Libm::<f64>::exp2(snapped / 1200.0)
    }

    /// Find the table note nearest to a cents offset from the reference
    /// pitch. Returns `(note index, octave shift from the center octave)`.
    pub fn nearest_note(&self, rel_cents: f64) -> (usize, i32) {
        let octave_shift = Libm::<f64>::floor(rel_cents / self.octave_width);
        let within = rel_cents - octave_shift * self.octave_width;

        let mut best = (0usize, f64::INFINITY, 0.0f64);
        // The nearest entry may sit in the adjacent octave on either side.
        for (cents, note) in &self.pitch_map {
            for wrap in [-self.octave_width, 0.0, self.octave_width] {
                let d = (cents + wrap - within).abs();
                if d < best.1 {
                    best = (*note, d, wrap);
                }
            }
        }

        let extra = if best.2 < 0.0 {
            -1
        } else if best.2 > 0.0 {
            1
        } else {
            0
        };
        (best.0, octave_shift as i32 + extra)
    }

    /// Restart the scale pattern from a new reference note.
    ///
    /// The note at `fixed_point` keeps its current pitch; every other note
    /// is reassigned following the original interval pattern as if the
    /// scale now began at `new_ref`. A negative `new_ref` resets the table
    /// to its initial tuning.
    pub fn retune(&mut self, new_ref: i32, fixed_point: usize) {
        if new_ref < 0 {
            self.retuned_cents.copy_from_slice(&self.init_cents);
            self.ref_note_retuned = self.ref_note;
            self.rebuild_pitch_map();
            return;
        }

        let new_ref = new_ref as usize;
        let n = self.note_count();
        debug_assert!(new_ref < n);
        debug_assert!(fixed_point < n);

        if new_ref == self.ref_note_retuned {
            return;
        }

        // Interval of the fixed point above the new reference, taken from
        // the original pattern. The fixed point's own wrap count is the
        // baseline for the octave correction below; measuring every wrap
        // relative to it keeps the fixed note's value exactly unchanged
        // even when `new_ref > fixed_point` wraps the pattern walk.
        let k_fixed = (fixed_point + n - new_ref) % n;
        let wraps_fixed = ((new_ref + k_fixed) / n) as f64;
        let fixed_interval = self.pattern_interval(k_fixed);
        let new_ref_cents = self.retuned_cents[fixed_point] - fixed_interval;

        let mut retuned = vec![0.0; n];
        for k in 0..n {
            let idx = (new_ref + k) % n;
            let wraps = ((new_ref + k) / n) as f64;
            retuned[idx] = new_ref_cents + self.pattern_interval(k)
                - (wraps - wraps_fixed) * self.octave_width;
        }

        self.retuned_cents = retuned;
        self.ref_note_retuned = new_ref;
        self.rebuild_pitch_map();
    }

    /// Copy another table's initial parameters, then adopt its retuning.
    pub fn retune_with_source(&mut self, source: &TuningTable) {
        self.init_cents = source.init_cents.clone();
        self.retuned_cents = source.retuned_cents.clone();
        self.ref_note = source.ref_note;
        self.ref_note_retuned = source.ref_note_retuned;
        self.ref_pitch = source.ref_pitch;
        self.pitch_offset = source.pitch_offset;
        self.octave_width = source.octave_width;
        self.rebuild_pitch_map();
    }

    /// Interval of the note `k` pattern steps above the original reference,
    /// in cents (wrapping adds octaves).
    fn pattern_interval(&self, k: usize) -> f64 {
        let n = self.note_count();
        let src = (self.ref_note + k) % n;
        let wraps = ((self.ref_note + k) / n) as f64;
        self.init_cents[src] - self.init_cents[self.ref_note] + wraps * self.octave_width
    }

    fn rebuild_pitch_map(&mut self) {
        self.pitch_map.clear();
        let base = self.init_cents[self.ref_note];
        for (note, cents) in self.retuned_cents.iter().enumerate() {
            let rel = cents - base;
            let wrapped = rel - Libm::<f64>::floor(rel / self.octave_width) * self.octave_width;
            self.pitch_map.push((wrapped, note));
        }
        self.pitch_map
            .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(core::cmp::Ordering::Equal));
    }
}

fn parse_pitch_entry(value: &Value) -> Result<f64, ModuleError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ModuleError::parse("pitch entry is not a finite number")),
        Value::Array(items) => {
            // ["/", [num, den]] ratio notation
            if items.len() == 2 && items[0].as_str() == Some("/") {
                let pair = items[1]
                    .as_array()
                    .ok_or_else(|| ModuleError::parse("pitch ratio must be [num, den]"))?;
                if pair.len() != 2 {
                    return Err(ModuleError::parse("pitch ratio must be [num, den]"));
                }
                let num = pair[0]
                    .as_f64()
                    .ok_or_else(|| ModuleError::parse("pitch ratio numerator must be a number"))?;
                let den = pair[1]
                    .as_f64()
                    .ok_or_else(|| ModuleError::parse("pitch ratio denominator must be a number"))?;
                if num <= 0.0 || den <= 0.0 {
                    return Err(ModuleError::parse("pitch ratio terms must be positive"));
                }
                Ok(1200.0 * Libm::<f64>::log2(num / den))
            } else {
                Err(ModuleError::parse("unrecognized pitch entry"))
            }
        }
        _ => Err(ModuleError::parse("unrecognized pitch entry")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_twelve_tet_reference() {
        let tt = TuningTable::twelve_tet();
        assert_eq!(tt.note_count(), 12);
        assert_relative_eq!(
            tt.pitch(0, TUNING_TABLE_CENTER_OCTAVE),
            TUNING_TABLE_DEFAULT_REF_PITCH,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_octave_doubles() {
        let tt = TuningTable::twelve_tet();
        let low = tt.pitch(0, TUNING_TABLE_CENTER_OCTAVE);
        let high = tt.pitch(0, TUNING_TABLE_CENTER_OCTAVE + 1);
        assert_relative_eq!(high / low, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_semitone_ratio() {
        let tt = TuningTable::twelve_tet();
        let c = tt.pitch(0, 8);
        let cis = tt.pitch(1, 8);
        assert_relative_eq!(cis / c, Libm::<f64>::exp2(1.0 / 12.0), epsilon = 1e-9);
    }

    #[test]
    fn test_pitch_offset_shifts_everything() {
        let mut tt = TuningTable::twelve_tet();
        let before = tt.pitch(4, 8);
        tt.set_pitch_offset(100.0);
        let after = tt.pitch(4, 8);
        assert_relative_eq!(after / before, Libm::<f64>::exp2(100.0 / 1200.0), epsilon = 1e-9);
    }

    /// A 5-limit just intonation layout; unlike an equal temperament, its
    /// interval pattern is uneven, so retuning genuinely moves notes.
    fn just_intonation() -> TuningTable {
        let cents = [
            0.0, 111.73, 203.91, 315.64, 386.31, 498.04, 590.22, 701.96, 813.69, 884.36,
            996.09, 1088.27,
        ];
        TuningTable::with_notes(&cents, 0, 440.0, 1200.0).unwrap()
    }

    #[test]
    fn test_retune_preserves_fixed_point() {
        // `new_ref > fixed_point` wraps the pattern walk across the
        // octave; the fixed note must still hold its pitch exactly.
        let mut tt = just_intonation();
        let fixed_before = tt.pitch(0, 8);
        let moved_before = tt.pitch(8, 8);

        tt.retune(4, 0);
        assert_relative_eq!(tt.pitch(0, 8), fixed_before, epsilon = 1e-9);
        assert_eq!(tt.ref_note_retuned(), 4);
        // The retune is not a no-op: the uneven pattern reassigns other
        // notes.
        assert!((tt.pitch(8, 8) - moved_before).abs() > 1e-3);
    }

    #[test]
    fn test_retune_sequence_returns_to_fresh_tuning() {
        // Retuning back to the original reference with fixed point 0
        // after any sequence of retunes equals a fresh table retuned
        // directly to that reference.
        let mut fresh = just_intonation();
        fresh.retune(0, 0);

        let mut tt = just_intonation();
        tt.retune(4, 0);
        tt.retune(9, 0);
        tt.retune(2, 0);
        tt.retune(0, 0);

        assert_eq!(tt.ref_note_retuned(), fresh.ref_note_retuned());
        for i in 0..12 {
            assert_relative_eq!(tt.pitch(i, 8), fresh.pitch(i, 8), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_retune_to_same_ref_is_noop() {
        let mut tt = TuningTable::twelve_tet();
        let snapshot: Vec<f64> = (0..12).map(|i| tt.pitch(i, 8)).collect();
        tt.retune(0, 5);
        for (i, &p) in snapshot.iter().enumerate() {
            assert_relative_eq!(tt.pitch(i, 8), p, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_retune_reset() {
        let mut tt = TuningTable::twelve_tet();
        let fresh: Vec<f64> = (0..12).map(|i| tt.pitch(i, 8)).collect();

        tt.retune(3, 0);
        tt.retune(7, 2);
        tt.retune(-1, 0);

        for (i, &p) in fresh.iter().enumerate() {
            assert_relative_eq!(tt.pitch(i, 8), p, epsilon = 1e-9);
        }
        assert_eq!(tt.ref_note_retuned(), tt.ref_note());
    }

    #[test]
    fn test_retune_in_equal_temperament_keeps_pitches() {
        // In an equal temperament every interval pattern is the same, so
        // retuning with the new reference as the fixed point changes no
        // pitch.
        let mut tt = TuningTable::twelve_tet();
        let before: Vec<f64> = (0..12).map(|i| tt.pitch(i, 8)).collect();
        tt.retune(5, 5);
        for (i, &p) in before.iter().enumerate() {
            assert_relative_eq!(tt.pitch(i, 8), p, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_nearest_note_roundtrip() {
        let tt = TuningTable::twelve_tet();
        // Note 7 of the center octave, slightly detuned.
        let target = tt.note_cents(7) + 3.0;
        let (note, octave_shift) = tt.nearest_note(target);
        assert_eq!(note, 7);
        assert_eq!(octave_shift, 0);
    }

    #[test]
    fn test_pitch_from_cents_snaps() {
        let tt = TuningTable::twelve_tet();
        let exact = tt.pitch(7, 8);
        let detuned_cents = hz_to_cents(exact) + 4.0;
        let snapped = tt.pitch_from_cents(detuned_cents);
        assert_relative_eq!(snapped, exact, epsilon = 1e-9);
    }

    #[test]
    fn test_from_json_with_ratios() {
        let desc: Value = serde_json::json!({
            "ref_pitch": 440.0,
            "ref_note": 0,
            "octave_ratio": ["/", [2, 1]],
            "notes": [0.0, ["/", [3, 2]]],
        });
        let tt = TuningTable::from_json(&desc).unwrap();
        assert_eq!(tt.note_count(), 2);
        let fifth = tt.pitch(1, 8) / tt.pitch(0, 8);
        assert_relative_eq!(fifth, 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_from_json_rejects_bad_notes() {
        let desc: Value = serde_json::json!({ "notes": "nope" });
        assert!(TuningTable::from_json(&desc).is_err());
    }

    #[test]
    fn test_retune_with_source() {
        let mut source = TuningTable::twelve_tet();
        source.retune(4, 0);

        let mut tt = TuningTable::twelve_tet();
        tt.retune_with_source(&source);
        assert_eq!(tt.ref_note_retuned(), 4);
        for i in 0..12 {
            assert_relative_eq!(tt.pitch(i, 8), source.pitch(i, 8), epsilon = 1e-12);
        }
    }
}
