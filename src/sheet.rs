//! Sheet Data
//!
//! The musical content of a module: patterns made of columns, columns made
//! of trigger rows, and the song/order structures that arrange pattern
//! instances into playback order.
//!
//! Triggers at the same position form an ordered row; insertion order
//! within a row is preserved and is the dispatch order. Trigger arguments
//! stay as parsed JSON until dispatch time, when the event handler checks
//! them against the event's declared argument type.

use crate::error::ModuleError;
use crate::tstamp::{PatInstRef, Tstamp};
use crate::COLUMNS_MAX;

use serde_json::Value;
use std::collections::BTreeMap;

/// One event at one position within a column.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub pos: Tstamp,
    pub name: String,
    pub arg: Value,
}

impl Trigger {
    pub fn new(pos: Tstamp, name: impl Into<String>, arg: Value) -> Self {
        Self {
            pos,
            name: name.into(),
            arg,
        }
    }
}

/// One sub-track of a pattern holding an ordered list of triggers.
///
/// Rows are keyed by position; a keyed lookup returns the first row at or
/// after the given position.
#[derive(Debug, Clone, Default)]
pub struct Column {
    rows: BTreeMap<Tstamp, Vec<Trigger>>,
}

impl Column {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a column from `[[position, [name, arg]], ...]` JSON data.
    pub fn from_json(value: &Value) -> Result<Self, ModuleError> {
        let items = value
            .as_array()
            .ok_or_else(|| ModuleError::parse("trigger list must be an array"))?;

        let mut column = Column::new();
        for item in items {
            let entry = item
                .as_array()
                .filter(|e| e.len() == 2)
                .ok_or_else(|| ModuleError::parse("trigger must be [position, event]"))?;

            let pos = parse_tstamp(&entry[0])?;

            let event = entry[1]
                .as_array()
                .filter(|e| !e.is_empty() && e.len() <= 2)
                .ok_or_else(|| ModuleError::parse("trigger event must be [name] or [name, arg]"))?;
            let name = event[0]
                .as_str()
                .ok_or_else(|| ModuleError::parse("trigger event name must be a string"))?;
            let arg = event.get(1).cloned().unwrap_or(Value::Null);

            column.insert(Trigger::new(pos, name, arg));
        }

        Ok(column)
    }

    /// Append a trigger to the row at its position, preserving insertion
    /// order within the row.
    pub fn insert(&mut self, trigger: Trigger) {
        self.rows.entry(trigger.pos).or_default().push(trigger);
    }

    /// The first trigger row at or after `pos`, with its position.
    pub fn row_at_or_after(&self, pos: &Tstamp) -> Option<(&Tstamp, &[Trigger])> {
        self.rows
            .range(pos..)
            .next()
            .map(|(ts, row)| (ts, row.as_slice()))
    }

    /// The first trigger row strictly after `pos`.
    pub fn row_after(&self, pos: &Tstamp) -> Option<(&Tstamp, &[Trigger])> {
        let min = pos.add(&Tstamp::epsilon());
        self.row_at_or_after(&min)
    }

    /// The row exactly at `pos`, if any.
    pub fn row_at(&self, pos: &Tstamp) -> Option<&[Trigger]> {
        self.rows.get(pos).map(|r| r.as_slice())
    }

    /// Iterate rows at or after `pos` in order.
    pub fn rows_from<'a>(
        &'a self,
        pos: &Tstamp,
    ) -> impl Iterator<Item = (&'a Tstamp, &'a [Trigger])> + 'a {
        self.rows.range(*pos..).map(|(ts, row)| (ts, row.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A pattern: a fixed bank of columns plus an explicit length.
///
/// A pattern may have several playable instances, each with its own
/// existence flag.
#[derive(Debug, Clone)]
pub struct Pattern {
    columns: Vec<Column>,
    length: Tstamp,
    instance_existent: Vec<bool>,
}

/// Default pattern length: 16 beats.
pub const PATTERN_DEFAULT_LENGTH_BEATS: i64 = 16;

impl Pattern {
    pub fn new() -> Self {
        Self {
            columns: (0..COLUMNS_MAX).map(|_| Column::new()).collect(),
            length: Tstamp::new(PATTERN_DEFAULT_LENGTH_BEATS, 0),
            instance_existent: Vec::new(),
        }
    }

    pub fn length(&self) -> &Tstamp {
        &self.length
    }

    pub fn set_length(&mut self, length: Tstamp) {
        self.length = length;
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn column_mut(&mut self, index: usize) -> Option<&mut Column> {
        self.columns.get_mut(index)
    }

    /// Mark a pattern instance as existent or not.
    pub fn set_instance_existent(&mut self, inst: usize, existent: bool) {
        if self.instance_existent.len() <= inst {
            self.instance_existent.resize(inst + 1, false);
        }
        self.instance_existent[inst] = existent;
    }

    pub fn instance_exists(&self, inst: usize) -> bool {
        self.instance_existent.get(inst).copied().unwrap_or(false)
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-song default tempo in beats per minute.
pub const SONG_DEFAULT_TEMPO: f64 = 120.0;

/// One song: an initial tempo and an order list of pattern instances.
#[derive(Debug, Clone)]
pub struct Song {
    pub tempo: f64,
    order_list: Vec<PatInstRef>,
}

impl Song {
    pub fn new() -> Self {
        Self {
            tempo: SONG_DEFAULT_TEMPO,
            order_list: Vec::new(),
        }
    }

    /// Parse an order list from `[[pat, inst], ...]` JSON data.
    pub fn set_order_list_from_json(&mut self, value: &Value) -> Result<(), ModuleError> {
        let items = value
            .as_array()
            .ok_or_else(|| ModuleError::parse("order list must be an array"))?;

        let mut order = Vec::with_capacity(items.len());
        for item in items {
            let pair = item
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| ModuleError::parse("order list entry must be [pattern, instance]"))?;
            let pat = pair[0]
                .as_i64()
                .ok_or_else(|| ModuleError::parse("pattern index must be an integer"))?;
            let inst = pair[1]
                .as_i64()
                .ok_or_else(|| ModuleError::parse("instance index must be an integer"))?;
            order.push(PatInstRef::new(pat as i32, inst as i32));
        }

        self.order_list = order;
        Ok(())
    }

    pub fn order_list(&self) -> &[PatInstRef] {
        &self.order_list
    }

    /// Pattern instance at one system position.
    pub fn pat_inst_ref(&self, system: usize) -> Option<&PatInstRef> {
        self.order_list.get(system)
    }

    pub fn system_count(&self) -> usize {
        self.order_list.len()
    }
}

impl Default for Song {
    fn default() -> Self {
        Self::new()
    }
}

/// The album's track list: song indices in playback order.
#[derive(Debug, Clone, Default)]
pub struct TrackList {
    songs: Vec<usize>,
}

impl TrackList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from `[song_index, ...]` JSON data.
    pub fn from_json(value: &Value) -> Result<Self, ModuleError> {
        let items = value
            .as_array()
            .ok_or_else(|| ModuleError::parse("track list must be an array"))?;
        let mut songs = Vec::with_capacity(items.len());
        for item in items {
            let index = item
                .as_u64()
                .ok_or_else(|| ModuleError::parse("track entry must be a song index"))?;
            songs.push(index as usize);
        }
        Ok(Self { songs })
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    /// Song index at one track position.
    pub fn song_index(&self, track: usize) -> Option<usize> {
        self.songs.get(track).copied()
    }
}

/// Parse a `[beats, rem]` timestamp pair.
pub fn parse_tstamp(value: &Value) -> Result<Tstamp, ModuleError> {
    let pair = value
        .as_array()
        .filter(|p| p.len() == 2)
        .ok_or_else(|| ModuleError::parse("timestamp must be [beats, rem]"))?;
    let beats = pair[0]
        .as_i64()
        .ok_or_else(|| ModuleError::parse("timestamp beats must be an integer"))?;
    let rem = pair[1]
        .as_i64()
        .filter(|&r| (0..i64::from(crate::tstamp::TSTAMP_BEAT)).contains(&r))
        .ok_or_else(|| ModuleError::parse("timestamp remainder out of range"))?;
    Ok(Tstamp::new(beats, rem as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_insertion_order_within_row() {
        let mut col = Column::new();
        let pos = Tstamp::new(1, 0);
        col.insert(Trigger::new(pos, ".f", json!(-6.0)));
        col.insert(Trigger::new(pos, "n+", json!(0.0)));

        let row = col.row_at(&pos).unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row[0].name, ".f");
        assert_eq!(row[1].name, "n+");
    }

    #[test]
    fn test_column_lookup_at_or_after() {
        let mut col = Column::new();
        col.insert(Trigger::new(Tstamp::new(2, 0), "n+", json!(0.0)));

        let (pos, _) = col.row_at_or_after(&Tstamp::new(1, 0)).unwrap();
        assert_eq!(*pos, Tstamp::new(2, 0));

        let (pos, _) = col.row_at_or_after(&Tstamp::new(2, 0)).unwrap();
        assert_eq!(*pos, Tstamp::new(2, 0));

        assert!(col.row_at_or_after(&Tstamp::new(3, 0)).is_none());
    }

    #[test]
    fn test_column_row_after_is_strict() {
        let mut col = Column::new();
        col.insert(Trigger::new(Tstamp::new(2, 0), "n+", json!(0.0)));
        assert!(col.row_after(&Tstamp::new(2, 0)).is_none());
        assert!(col.row_after(&Tstamp::new(1, 0)).is_some());
    }

    #[test]
    fn test_column_from_json() {
        let data = json!([
            [[0, 0], ["n+", 0.0]],
            [[1, 0], ["n-"]],
        ]);
        let col = Column::from_json(&data).unwrap();
        assert!(col.row_at(&Tstamp::zero()).is_some());
        assert!(col.row_at(&Tstamp::new(1, 0)).is_some());
    }

    #[test]
    fn test_column_from_json_rejects_garbage() {
        assert!(Column::from_json(&json!("not a list")).is_err());
        assert!(Column::from_json(&json!([[[0, 0]]])).is_err());
        assert!(Column::from_json(&json!([[[0, 0], [42, 0.0]]])).is_err());
    }

    #[test]
    fn test_pattern_instances() {
        let mut pat = Pattern::new();
        assert!(!pat.instance_exists(0));
        pat.set_instance_existent(0, true);
        pat.set_instance_existent(2, true);
        assert!(pat.instance_exists(0));
        assert!(!pat.instance_exists(1));
        assert!(pat.instance_exists(2));
    }

    #[test]
    fn test_pattern_length_may_exceed_rows() {
        let mut pat = Pattern::new();
        pat.set_length(Tstamp::new(4, 0));
        pat.column_mut(0)
            .unwrap()
            .insert(Trigger::new(Tstamp::new(2, 0), "n+", json!(0.0)));
        assert_eq!(*pat.length(), Tstamp::new(4, 0));
    }

    #[test]
    fn test_song_order_list() {
        let mut song = Song::new();
        song.set_order_list_from_json(&json!([[0, 0], [1, 0], [0, 1]]))
            .unwrap();
        assert_eq!(song.system_count(), 3);
        assert_eq!(*song.pat_inst_ref(2).unwrap(), PatInstRef::new(0, 1));
        assert!(song.pat_inst_ref(3).is_none());
    }

    #[test]
    fn test_track_list() {
        let tl = TrackList::from_json(&json!([0, 2])).unwrap();
        assert_eq!(tl.len(), 2);
        assert_eq!(tl.song_index(1), Some(2));
        assert_eq!(tl.song_index(2), None);
    }

    #[test]
    fn test_parse_tstamp_validates_remainder() {
        assert!(parse_tstamp(&json!([0, -1])).is_err());
        assert!(parse_tstamp(&json!([0, crate::tstamp::TSTAMP_BEAT])).is_err());
        assert_eq!(parse_tstamp(&json!([3, 5])).unwrap(), Tstamp::new(3, 5));
    }
}
