//! The Module
//!
//! A module is the self-contained composition: audio units, patterns,
//! songs, connections, tuning tables, the bind table and the global
//! settings. After loading it is read-mostly; the renderer never mutates
//! it, and key updates are applied between render calls only.

use crate::audio_unit::{AuTable, AudioUnit};
use crate::connections::Connections;
use crate::device::{Device, DeviceId, PortType};
use crate::error::ModuleError;
use crate::events::Bind;
use crate::sheet::{Pattern, Song, TrackList};
use crate::tstamp::PatInstRef;
use crate::tuning::TuningTable;
use crate::{CONTROLS_MAX, PATTERNS_MAX, SONGS_MAX, TUNING_TABLES_MAX};

use serde_json::Value;
use std::collections::HashMap;

/// Default mixing volume in dB.
pub const MODULE_DEFAULT_MIX_VOL: f64 = 0.0;

/// The complete module description.
pub struct Module {
    /// The master output device; its receive ports are the final stereo
    /// mix.
    pub master_device: Device,
    pub au_table: AuTable,
    /// Top-level connections, built during validation.
    pub connections: Option<Connections>,
    raw_connections: Option<Value>,

    patterns: Vec<Option<Pattern>>,
    songs: Vec<Option<Song>>,
    pub track_list: Option<TrackList>,
    pub tuning_tables: Vec<Option<TuningTable>>,

    /// Control index to audio-unit index.
    control_map: Vec<Option<usize>>,
    /// Default control per channel.
    channel_defaults: Vec<usize>,

    pub bind: Option<Bind>,
    pub environment: HashMap<String, Value>,

    pub mixing_volume_db: f64,
    /// Global offset applied to note-on force in dB.
    pub force_shift: f64,
    pub random_seed: u64,
    pub dc_blocker_enabled: bool,

    device_count: usize,
}

impl Module {
    pub fn new() -> Self {
        let mut master_device = Device::new();
        master_device.set_port_count(PortType::Receive, 2);
        master_device.set_existent(true);

        Self {
            master_device,
            au_table: AuTable::new(),
            connections: None,
            raw_connections: None,
            patterns: Vec::new(),
            songs: Vec::new(),
            track_list: None,
            tuning_tables: (0..TUNING_TABLES_MAX).map(|_| None).collect(),
            control_map: (0..CONTROLS_MAX).map(|_| None).collect(),
            channel_defaults: Vec::new(),
            bind: None,
            environment: HashMap::new(),
            mixing_volume_db: MODULE_DEFAULT_MIX_VOL,
            force_shift: 0.0,
            random_seed: 0,
            dc_blocker_enabled: true,
            device_count: 0,
        }
    }

    // ------------------------------------------------------------------
    // Sheet access
    // ------------------------------------------------------------------

    pub fn pattern(&self, piref: &PatInstRef) -> Option<&Pattern> {
        if !piref.is_valid() {
            return None;
        }
        let pat = self.patterns.get(piref.pat as usize)?.as_ref()?;
        if !pat.instance_exists(piref.inst as usize) {
            return None;
        }
        Some(pat)
    }

    pub fn pattern_by_index(&self, index: usize) -> Option<&Pattern> {
        self.patterns.get(index).and_then(Option::as_ref)
    }

    pub fn ensure_pattern(&mut self, index: usize) -> Result<&mut Pattern, ModuleError> {
        if index >= PATTERNS_MAX {
            return Err(ModuleError::format(format!(
                "pattern index {} out of range",
                index
            )));
        }
        if self.patterns.len() <= index {
            self.patterns.resize_with(index + 1, || None);
        }
        Ok(self.patterns[index].get_or_insert_with(Pattern::new))
    }

    pub fn song(&self, index: usize) -> Option<&Song> {
        self.songs.get(index).and_then(Option::as_ref)
    }

    pub fn ensure_song(&mut self, index: usize) -> Result<&mut Song, ModuleError> {
        if index >= SONGS_MAX {
            return Err(ModuleError::format(format!(
                "song index {} out of range",
                index
            )));
        }
        if self.songs.len() <= index {
            self.songs.resize_with(index + 1, || None);
        }
        Ok(self.songs[index].get_or_insert_with(Song::new))
    }

    /// Resolve `(track, system)` to a pattern instance through the album
    /// and order lists.
    pub fn find_pat_inst_ref(&self, track: i32, system: i32) -> Option<&PatInstRef> {
        if track < 0 || system < 0 {
            return None;
        }
        let tl = self.track_list.as_ref()?;
        let song_index = tl.song_index(track as usize)?;
        let song = self.song(song_index)?;
        song.pat_inst_ref(system as usize)
    }

    /// The song a track refers to.
    pub fn track_song(&self, track: i32) -> Option<&Song> {
        if track < 0 {
            return None;
        }
        let tl = self.track_list.as_ref()?;
        self.song(tl.song_index(track as usize)?)
    }

    // ------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------

    pub fn set_control_map_from_json(&mut self, value: &Value) -> Result<(), ModuleError> {
        let items = value
            .as_array()
            .ok_or_else(|| ModuleError::parse("control map must be an array"))?;
        let mut map: Vec<Option<usize>> = (0..CONTROLS_MAX).map(|_| None).collect();
        for item in items {
            let pair = item
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| ModuleError::parse("control map entry must be [control, au]"))?;
            let control = pair[0]
                .as_u64()
                .ok_or_else(|| ModuleError::parse("control index must be an integer"))?
                as usize;
            let au = pair[1]
                .as_u64()
                .ok_or_else(|| ModuleError::parse("au index must be an integer"))?
                as usize;
            if control >= CONTROLS_MAX {
                return Err(ModuleError::format(format!(
                    "control index {} out of range",
                    control
                )));
            }
            map[control] = Some(au);
        }
        self.control_map = map;
        Ok(())
    }

    /// The audio unit a control index resolves to.
    pub fn au_from_input(&self, control: usize) -> Option<(usize, &AudioUnit)> {
        let au_index = (*self.control_map.get(control)?)?;
        self.au_table.get(au_index).map(|au| (au_index, au))
    }

    pub fn set_channel_defaults_from_json(&mut self, value: &Value) -> Result<(), ModuleError> {
        let items = value
            .as_array()
            .ok_or_else(|| ModuleError::parse("channel defaults must be an array"))?;
        let mut defaults = Vec::with_capacity(items.len());
        for item in items {
            let control = item
                .as_u64()
                .ok_or_else(|| ModuleError::parse("channel default must be a control index"))?;
            defaults.push(control as usize);
        }
        self.channel_defaults = defaults;
        Ok(())
    }

    /// Default control index of one channel.
    pub fn channel_default_control(&self, channel: usize) -> usize {
        self.channel_defaults.get(channel).copied().unwrap_or(0)
    }

    pub fn set_environment_from_json(&mut self, value: &Value) -> Result<(), ModuleError> {
        let items = value
            .as_array()
            .ok_or_else(|| ModuleError::parse("environment must be an array"))?;
        let mut env = HashMap::new();
        for item in items {
            let pair = item
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| ModuleError::parse("environment entry must be [name, value]"))?;
            let name = pair[0]
                .as_str()
                .ok_or_else(|| ModuleError::parse("environment name must be a string"))?;
            env.insert(name.to_string(), pair[1].clone());
        }
        self.environment = env;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Structure finalization
    // ------------------------------------------------------------------

    pub fn set_raw_connections(&mut self, value: Value) {
        self.raw_connections = Some(value);
        self.connections = None;
    }

    /// Number of devices after the last validation.
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Finalize the module structure: assign device ids, mirror interface
    /// ports, check ports and references, and build every connections
    /// graph. Must be re-run after any structural key change.
    pub fn validate(&mut self) -> Result<(), ModuleError> {
        // Dense device ids: master first, then each audio unit subtree.
        let mut next: DeviceId = 0;
        self.master_device.set_id(next);
        next += 1;
        // Collect indices first: assignment needs mutable access.
        let au_indices: Vec<usize> = self.au_table.iter().map(|(i, _)| i).collect();
        for index in au_indices {
            if let Some(au) = self.au_table.get_mut(index) {
                au.sync_iface_ports();
                au.assign_device_ids(&mut next);
            }
        }
        self.device_count = next;

        // Port numbering must be gapless everywhere.
        self.master_device.validate_port_prefix()?;
        for (index, au) in self.au_table.iter() {
            au.validate_ports().map_err(|e| {
                ModuleError::format(format!("au_{:02x}: {}", index, e.message()))
            })?;
        }

        // Control map targets must exist.
        for (control, au_index) in self
            .control_map
            .iter()
            .enumerate()
            .filter_map(|(c, a)| a.map(|a| (c, a)))
        {
            if self.au_table.get(au_index).is_none() {
                return Err(ModuleError::format(format!(
                    "control_{:02x} refers to missing au_{:02x}",
                    control, au_index
                )));
            }
        }

        // Order lists must refer to existing pattern instances.
        for (index, song) in self
            .songs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
        {
            for piref in song.order_list() {
                if self.pattern(piref).is_none() {
                    return Err(ModuleError::format(format!(
                        "song_{:02x} order list refers to missing pattern instance \
                         ({}, {})",
                        index, piref.pat, piref.inst
                    )));
                }
            }
        }
        if let Some(tl) = &self.track_list {
            for track in 0..tl.len() {
                let song_index = tl.song_index(track).unwrap();
                if self.song(song_index).is_none() {
                    return Err(ModuleError::format(format!(
                        "album refers to missing song_{:02x}",
                        song_index
                    )));
                }
            }
        }

        // Build the graphs: a module with audio units must say how they
        // reach the output.
        if self.au_table.iter().next().is_some() && self.raw_connections.is_none() {
            return Err(ModuleError::format("missing top-level connections"));
        }
        if let Some(raw) = self.raw_connections.clone() {
            let conns = Connections::from_json(&raw, &*self)?;
            self.connections = Some(conns);
        }

        let au_indices: Vec<usize> = self.au_table.iter().map(|(i, _)| i).collect();
        for index in au_indices {
            // Build interiors bottom-up; detach to satisfy the borrow
            // checker while the unit acts as its own resolution scope.
            if let Some(au) = self.au_table.get_mut(index) {
                au.build_connections().map_err(|e| {
                    ModuleError::format(format!("au_{:02x}: {}", index, e.message()))
                })?;
            }
        }

        Ok(())
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
