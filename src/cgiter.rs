//! Column Iterator
//!
//! A `Cgiter` is the playback cursor of one column: it follows the album →
//! song → order list chain (or loops a single pattern instance in pattern
//! playback), yields each trigger row at the current position exactly
//! once, and answers the scheduler's distance queries: how far to the
//! next trigger row in this column, and how far to the next globally
//! ordering event.
//!
//! The peek/advance split is explicit: [`Cgiter::peek_row`] marks the row
//! returned, the caller consumes the triggers and then clears the mark
//! before moving on.

use crate::events::{trigger_is_global_breakpoint, Bind};
use crate::module::Module;
use crate::sheet::{Pattern, Trigger};
use crate::tstamp::{Position, Tstamp};

/// Playback cursor over one column of pattern content.
#[derive(Debug, Clone)]
pub struct Cgiter {
    col_index: usize,
    pos: Position,
    row_returned: bool,
    has_finished: bool,
    is_pattern_playback: bool,
}

impl Cgiter {
    pub fn new(col_index: usize) -> Self {
        Self {
            col_index,
            pos: Position::default(),
            row_returned: false,
            has_finished: false,
            is_pattern_playback: false,
        }
    }

    pub fn col_index(&self) -> usize {
        self.col_index
    }

    pub fn position(&self) -> &Position {
        &self.pos
    }

    pub fn has_finished(&self) -> bool {
        self.has_finished
    }

    /// Rewind to a starting position.
    ///
    /// A fully valid position starts normal playback; a position carrying
    /// only a pattern instance starts pattern playback.
    pub fn reset(&mut self, module: &Module, start_pos: &Position) {
        if start_pos.is_valid() {
            self.pos = *start_pos;
            match module.find_pat_inst_ref(self.pos.track, self.pos.system) {
                Some(piref) => self.pos.piref = *piref,
                None => self.pos.track = -1,
            }
            self.is_pattern_playback = false;
        } else {
            debug_assert!(start_pos.has_valid_pattern_pos());
            self.pos = *start_pos;
            self.is_pattern_playback = true;
        }

        self.row_returned = false;
        self.has_finished = false;
    }

    fn find_pattern<'m>(&self, module: &'m Module) -> Option<&'m Pattern> {
        let piref = if self.is_pattern_playback {
            Some(&self.pos.piref)
        } else {
            module.find_pat_inst_ref(self.pos.track, self.pos.system)
        };
        piref.and_then(|piref| module.pattern(piref))
    }

    /// The trigger row at the current position, yielded at most once.
    ///
    /// Returns `None` when there is no row exactly at the position, the
    /// cursor has finished, or the row was already returned.
    pub fn peek_row<'m>(&mut self, module: &'m Module) -> Option<&'m [Trigger]> {
        if self.has_finished || self.row_returned {
            return None;
        }
        self.row_returned = true;

        let piref = if self.is_pattern_playback {
            self.pos.piref
        } else {
            *module.find_pat_inst_ref(self.pos.track, self.pos.system)?
        };
        let pattern = module.pattern(&piref)?;
        self.pos.piref = piref;

        let column = pattern.column(self.col_index)?;
        let (row_pos, row) = column.row_at_or_after(&self.pos.pat_pos)?;
        if *row_pos > self.pos.pat_pos {
            return None;
        }
        Some(row)
    }

    /// Allow the current row to be considered again; called after the
    /// caller has finished consuming it and moved on.
    pub fn clear_returned_status(&mut self) {
        self.row_returned = false;
    }

    /// Min-update `dist` with the distance to the next event in this
    /// column or to the end of the pattern. Returns whether the cursor
    /// contributed a distance at all.
    pub fn local_bp_dist(&self, module: &Module, dist: &mut Tstamp) -> bool {
        if self.has_finished {
            return false;
        }
        let Some(pattern) = self.find_pattern(module) else {
            return false;
        };

        let dist_to_end = pattern.length().sub(&self.pos.pat_pos);
        if dist_to_end <= Tstamp::zero() {
            // We cannot move forwards in playback time.
            *dist = Tstamp::zero();
            return true;
        }

        if let Some(column) = pattern.column(self.col_index) {
            if let Some((row_pos, _)) = column.row_after(&self.pos.pat_pos) {
                if *row_pos <= *pattern.length() {
                    dist.min_update(&row_pos.sub(&self.pos.pat_pos));
                    return true;
                }
            }
        }

        dist.min_update(&dist_to_end);
        true
    }

    /// Min-update `dist` with the distance to the next global breakpoint:
    /// a row containing an event whose type (or bind expansion) forces the
    /// scheduler to end the slice there. Non-breakpoint rows are skipped.
    pub fn global_bp_dist(&self, module: &Module, bind: Option<&Bind>, dist: &mut Tstamp) -> bool {
        if self.has_finished {
            return false;
        }
        let Some(pattern) = self.find_pattern(module) else {
            return false;
        };

        let dist_to_end = pattern.length().sub(&self.pos.pat_pos);
        if dist_to_end <= Tstamp::zero() {
            *dist = Tstamp::zero();
            return true;
        }

        if let Some(column) = pattern.column(self.col_index) {
            let next = self.pos.pat_pos.add(&Tstamp::epsilon());
            for (row_pos, row) in column.rows_from(&next) {
                if *row_pos > *pattern.length() {
                    break;
                }
                let is_bp = row
                    .iter()
                    .any(|t| trigger_is_global_breakpoint(&t.name, bind));
                if is_bp {
                    dist.min_update(&row_pos.sub(&self.pos.pat_pos));
                    return true;
                }
            }
        }

        dist.min_update(&dist_to_end);
        true
    }

    /// Advance the pattern position by `dist`; reaching or passing the
    /// pattern end transitions to the next system, or loops in pattern
    /// playback. A zero-length pattern plays once and then finishes.
    pub fn move_by(&mut self, module: &Module, dist: &Tstamp) {
        debug_assert!(*dist >= Tstamp::zero());

        if !self.pos.piref.is_valid() {
            return;
        }

        let Some(pattern) = module.pattern(&self.pos.piref) else {
            self.has_finished = true;
            return;
        };

        let pat_length = *pattern.length();
        if self.pos.pat_pos >= pat_length {
            // dist must be 0 or the pattern length changed.
            if self.is_pattern_playback {
                self.pos.pat_pos = Tstamp::zero();

                // Play a zero-length pattern only once to avoid an
                // infinite loop.
                if pat_length.is_zero() {
                    self.has_finished = true;
                }
            } else {
                self.go_to_next_system(module);
            }

            self.row_returned = false;
            return;
        }

        self.pos.pat_pos = self.pos.pat_pos.add(dist);
        if *dist > Tstamp::zero() {
            self.row_returned = false;
        }
    }

    fn go_to_next_system(&mut self, module: &Module) {
        debug_assert!(!self.is_pattern_playback);

        self.pos.pat_pos = Tstamp::zero();
        self.pos.system += 1;
        self.pos.piref = crate::tstamp::PatInstRef::invalid();
        match module.find_pat_inst_ref(self.pos.track, self.pos.system) {
            Some(piref) => self.pos.piref = *piref,
            None => self.has_finished = true,
        }
    }

    /// Rewind within the current pattern (jump support).
    pub fn rewind_pattern(&mut self) {
        self.pos.pat_pos = Tstamp::zero();
        self.row_returned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::TrackList;
    use crate::tstamp::PatInstRef;
    use serde_json::json;

    /// One song, one 4-beat pattern with triggers at beats 0 and 2 in
    /// column 0.
    fn test_module() -> Module {
        let mut module = Module::new();
        {
            let pat = module.ensure_pattern(0).unwrap();
            pat.set_instance_existent(0, true);
            pat.set_length(Tstamp::new(4, 0));
            let col = pat.column_mut(0).unwrap();
            col.insert(Trigger::new(Tstamp::zero(), "n+", json!(0.0)));
            col.insert(Trigger::new(Tstamp::new(2, 0), "n-", json!(null)));
        }
        module
            .ensure_song(0)
            .unwrap()
            .set_order_list_from_json(&json!([[0, 0]]))
            .unwrap();
        module.track_list = Some(TrackList::from_json(&json!([0])).unwrap());
        module
    }

    #[test]
    fn test_peek_row_once() {
        let module = test_module();
        let mut cgiter = Cgiter::new(0);
        cgiter.reset(&module, &Position::start_of_track(0));

        let row = cgiter.peek_row(&module).unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(row[0].name, "n+");

        // The row is not returned twice.
        assert!(cgiter.peek_row(&module).is_none());
    }

    #[test]
    fn test_local_bp_dist_to_next_row() {
        let module = test_module();
        let mut cgiter = Cgiter::new(0);
        cgiter.reset(&module, &Position::start_of_track(0));

        let mut dist = Tstamp::max();
        assert!(cgiter.local_bp_dist(&module, &mut dist));
        // From beat 0 the next row is at beat 2.
        assert_eq!(dist, Tstamp::new(2, 0));
    }

    #[test]
    fn test_local_bp_dist_to_pattern_end() {
        let module = test_module();
        let mut cgiter = Cgiter::new(0);
        cgiter.reset(&module, &Position::start_of_track(0));
        cgiter.move_by(&module, &Tstamp::new(3, 0));

        let mut dist = Tstamp::max();
        assert!(cgiter.local_bp_dist(&module, &mut dist));
        assert_eq!(dist, Tstamp::new(1, 0));
    }

    #[test]
    fn test_global_bp_skips_plain_rows() {
        let mut module = test_module();
        {
            let pat = module.ensure_pattern(0).unwrap();
            let col = pat.column_mut(0).unwrap();
            col.insert(Trigger::new(Tstamp::new(3, 0), "m.t", json!(90.0)));
        }

        let mut cgiter = Cgiter::new(0);
        cgiter.reset(&module, &Position::start_of_track(0));

        let mut dist = Tstamp::max();
        assert!(cgiter.global_bp_dist(&module, None, &mut dist));
        // The note-off at beat 2 is not a global breakpoint; the tempo
        // change at beat 3 is.
        assert_eq!(dist, Tstamp::new(3, 0));
    }

    #[test]
    fn test_advance_through_pattern_finishes() {
        let module = test_module();
        let mut cgiter = Cgiter::new(0);
        cgiter.reset(&module, &Position::start_of_track(0));

        cgiter.move_by(&module, &Tstamp::new(4, 0));
        assert!(!cgiter.has_finished());
        // At the end: a zero-distance move transitions to the next system,
        // and the order list has none.
        cgiter.move_by(&module, &Tstamp::zero());
        assert!(cgiter.has_finished());
    }

    #[test]
    fn test_pattern_playback_loops() {
        let module = test_module();
        let mut cgiter = Cgiter::new(0);
        cgiter.reset(
            &module,
            &Position::pattern_playback(PatInstRef::new(0, 0)),
        );

        cgiter.move_by(&module, &Tstamp::new(4, 0));
        cgiter.move_by(&module, &Tstamp::zero());
        assert!(!cgiter.has_finished());
        assert!(cgiter.position().pat_pos.is_zero());

        // The first row is available again after the loop.
        assert!(cgiter.peek_row(&module).is_some());
    }

    #[test]
    fn test_zero_length_pattern_plays_once() {
        let mut module = Module::new();
        {
            let pat = module.ensure_pattern(0).unwrap();
            pat.set_instance_existent(0, true);
            pat.set_length(Tstamp::zero());
        }

        let mut cgiter = Cgiter::new(0);
        cgiter.reset(
            &module,
            &Position::pattern_playback(PatInstRef::new(0, 0)),
        );

        let mut dist = Tstamp::max();
        assert!(cgiter.local_bp_dist(&module, &mut dist));
        assert!(dist.is_zero());

        cgiter.move_by(&module, &Tstamp::zero());
        assert!(cgiter.has_finished());
    }

    #[test]
    fn test_move_clears_returned_status() {
        let module = test_module();
        let mut cgiter = Cgiter::new(0);
        cgiter.reset(&module, &Position::start_of_track(0));

        assert!(cgiter.peek_row(&module).is_some());
        cgiter.clear_returned_status();
        cgiter.move_by(&module, &Tstamp::new(2, 0));

        // The row at beat 2 is available.
        let row = cgiter.peek_row(&module).unwrap();
        assert_eq!(row[0].name, "n-");
    }

    #[test]
    fn test_empty_column_reports_pattern_end() {
        let module = test_module();
        let mut cgiter = Cgiter::new(5);
        cgiter.reset(&module, &Position::start_of_track(0));

        assert!(cgiter.peek_row(&module).is_none());
        let mut dist = Tstamp::max();
        assert!(cgiter.local_bp_dist(&module, &mut dist));
        assert_eq!(dist, Tstamp::new(4, 0));
    }
}
