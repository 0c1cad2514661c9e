//! The Handle
//!
//! A handle owns a module under construction: keys are written one at a
//! time with [`Handle::set_data`], then [`Handle::validate`] finalizes the
//! structure and builds the connection graphs. There is no process-wide
//! handle table; a handle is an ordinary owned value.
//!
//! Keys form a flat namespace where the path encodes structural position
//! (`au_00/proc_00/p_signal_type.json`). Every `.json` value is wrapped in
//! a `[version, payload]` envelope. Loader errors are persistent: the
//! first failure is kept and re-reported by `validate`, while later writes
//! are still accepted.

use crate::audio_unit::{AuType, AudioUnit};
use crate::device::PortType;
use crate::error::ModuleError;
use crate::events::Bind;
use crate::module::Module;
use crate::player::Player;
use crate::sheet::{parse_tstamp, Column, TrackList};
use crate::tuning::TuningTable;
use crate::{COLUMNS_MAX, DEVICE_PORTS_MAX, PAT_INSTANCES_MAX, TUNING_TABLES_MAX};

use serde_json::Value;
use std::sync::Arc;

/// Envelope version accepted by this engine.
const KEY_FORMAT_VERSION: i64 = 0;

/// An engine instance being loaded.
pub struct Handle {
    module: Module,
    error: Option<ModuleError>,
}

impl Handle {
    pub fn new() -> Self {
        Self {
            module: Module::new(),
            error: None,
        }
    }

    /// The first load error, if any; kept until the handle is dropped.
    pub fn error(&self) -> Option<&ModuleError> {
        self.error.as_ref()
    }

    /// Read access to the module under construction.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Write one key. Errors are returned and also retained on the
    /// handle; writes after an error still apply.
    pub fn set_data(&mut self, key: &str, data: &[u8]) -> Result<(), ModuleError> {
        let result = self.set_data_inner(key, data);
        if let Err(err) = &result {
            log::warn!("set_data {}: {}", key, err);
            if self.error.is_none() {
                self.error = Some(err.clone());
            }
        }
        result
    }

    fn set_data_inner(&mut self, key: &str, data: &[u8]) -> Result<(), ModuleError> {
        let leaf = key.rsplit('/').next().unwrap_or(key);
        if leaf.ends_with(".wv") || leaf.ends_with(".wav") || leaf.ends_with(".ogg") {
            return Err(ModuleError::resource(format!(
                "sample data is not supported by this engine: {}",
                key
            )));
        }
        if !leaf.contains(".json") {
            return Err(ModuleError::parse_at("unrecognized key subtype", key));
        }

        let payload = parse_envelope(key, data)?;
        let parts: Vec<&str> = key.split('/').collect();
        self.route(key, &parts, payload)
    }

    /// Finalize the module structure; re-reports any retained load error.
    pub fn validate(&mut self) -> Result<(), ModuleError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        match self.module.validate() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Validate and build a player for the loaded module, consuming the
    /// handle.
    pub fn into_player(
        mut self,
        audio_rate: u32,
        audio_buffer_size: usize,
        event_buffer_size: usize,
        voice_count: usize,
    ) -> Result<Player, ModuleError> {
        self.validate()?;
        Player::new(
            Arc::new(self.module),
            audio_rate,
            audio_buffer_size,
            event_buffer_size,
            voice_count,
        )
    }

    // ------------------------------------------------------------------
    // Key routing
    // ------------------------------------------------------------------

    fn route(&mut self, key: &str, parts: &[&str], payload: Value) -> Result<(), ModuleError> {
        match parts {
            // Root-level keys
            ["p_connections.json"] => {
                self.module.set_raw_connections(payload);
                Ok(())
            }
            ["p_control_map.json"] => self.module.set_control_map_from_json(&payload),
            ["p_channel_defaults.json"] => self.module.set_channel_defaults_from_json(&payload),
            ["p_bind.json"] => {
                self.module.bind = Some(Bind::from_json(&payload)?);
                Ok(())
            }
            ["p_environment.json"] => self.module.set_environment_from_json(&payload),
            ["p_mixing_volume.json"] => {
                self.module.mixing_volume_db = expect_f64(key, &payload)?;
                Ok(())
            }
            ["p_force_shift.json"] => {
                self.module.force_shift = expect_f64(key, &payload)?;
                Ok(())
            }
            ["p_random_seed.json"] => {
                self.module.random_seed = payload
                    .as_u64()
                    .ok_or_else(|| ModuleError::parse_at("seed must be an integer", key))?;
                Ok(())
            }
            ["p_dc_blocker_enabled.json"] => {
                self.module.dc_blocker_enabled = expect_bool(key, &payload)?;
                Ok(())
            }

            // Album
            ["album", "p_manifest.json"] => Ok(()),
            ["album", "p_tracks.json"] => {
                self.module.track_list = Some(TrackList::from_json(&payload)?);
                Ok(())
            }

            // Songs
            [song, rest @ ..] if song.starts_with("song_") => {
                let index = parse_index(key, song, "song_", 2, 16)?;
                let song = self.module.ensure_song(index)?;
                match rest {
                    ["p_manifest.json"] => Ok(()),
                    ["p_order_list.json"] => song.set_order_list_from_json(&payload),
                    ["p_tempo.json"] => {
                        let tempo = expect_f64(key, &payload)?;
                        if tempo <= 0.0 {
                            return Err(ModuleError::parse_at("tempo must be positive", key));
                        }
                        song.tempo = tempo;
                        Ok(())
                    }
                    _ => Err(ModuleError::parse_at("unrecognized song key", key)),
                }
            }

            // Patterns
            [pat, rest @ ..] if pat.starts_with("pat_") => {
                let index = parse_index(key, pat, "pat_", 3, 10)?;
                self.route_pattern(key, index, rest, payload)
            }

            // Audio units
            [au, rest @ ..] if au.starts_with("au_") => {
                let index = parse_index(key, au, "au_", 2, 16)?;
                let au = self.module.au_table.ensure(index)?;
                route_au(key, au, rest, payload)
            }

            // Controls
            [control, "p_manifest.json"] if control.starts_with("control_") => {
                let _ = parse_index(key, control, "control_", 2, 16)?;
                Ok(())
            }

            // Tuning tables
            [tuning, "p_tuning_table.json"] if tuning.starts_with("tuning_") => {
                let index = parse_index(key, tuning, "tuning_", 2, 16)?;
                if index >= TUNING_TABLES_MAX {
                    return Err(ModuleError::format(format!(
                        "tuning table index {} out of range",
                        index
                    )));
                }
                self.module.tuning_tables[index] = Some(TuningTable::from_json(&payload)?);
                Ok(())
            }

            _ => Err(ModuleError::parse_at("unrecognized key", key)),
        }
    }

    fn route_pattern(
        &mut self,
        key: &str,
        index: usize,
        rest: &[&str],
        payload: Value,
    ) -> Result<(), ModuleError> {
        let pattern = self.module.ensure_pattern(index)?;
        match rest {
            ["p_manifest.json"] => Ok(()),
            ["p_length.json"] => {
                pattern.set_length(parse_tstamp(&payload).map_err(|e| {
                    ModuleError::parse_at(e.message().to_string(), key)
                })?);
                Ok(())
            }
            [inst, "p_manifest.json"] if inst.starts_with("instance_") => {
                let inst = parse_index(key, inst, "instance_", 3, 10)?;
                if inst >= PAT_INSTANCES_MAX {
                    return Err(ModuleError::format(format!(
                        "pattern instance index {} out of range",
                        inst
                    )));
                }
                pattern.set_instance_existent(inst, manifest_exists(&payload));
                Ok(())
            }
            [col, "p_triggers.json"] if col.starts_with("col_") => {
                let col = parse_index(key, col, "col_", 2, 10)?;
                if col >= COLUMNS_MAX {
                    return Err(ModuleError::format(format!(
                        "column index {} out of range",
                        col
                    )));
                }
                let column = Column::from_json(&payload)
                    .map_err(|e| ModuleError::parse_at(e.message().to_string(), key))?;
                *pattern.column_mut(col).expect("index checked above") = column;
                Ok(())
            }
            _ => Err(ModuleError::parse_at("unrecognized pattern key", key)),
        }
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

/// Route a key below an audio unit path, recursing into nested units.
fn route_au(
    key: &str,
    au: &mut AudioUnit,
    rest: &[&str],
    payload: Value,
) -> Result<(), ModuleError> {
    match rest {
        ["p_manifest.json"] => {
            au.device.set_existent(manifest_exists(&payload));
            if let Some(kind) = payload.get("type").and_then(Value::as_str) {
                au.set_au_type(match kind {
                    "instrument" => AuType::Instrument,
                    "effect" => AuType::Effect,
                    _ => {
                        return Err(ModuleError::parse_at(
                            "audio unit type must be \"instrument\" or \"effect\"",
                            key,
                        ))
                    }
                });
            }
            Ok(())
        }
        ["p_connections.json"] => {
            au.set_raw_connections(payload);
            Ok(())
        }
        ["p_streams.json"] => au.set_streams_from_json(&payload),
        [port, "p_manifest.json"] if port.starts_with("in_") => {
            let port = parse_port_index(key, port, "in_")?;
            au.device
                .set_port_existence(PortType::Receive, port, manifest_exists(&payload));
            Ok(())
        }
        [port, "p_manifest.json"] if port.starts_with("out_") => {
            let port = parse_port_index(key, port, "out_")?;
            au.device
                .set_port_existence(PortType::Send, port, manifest_exists(&payload));
            Ok(())
        }
        [proc, rest @ ..] if proc.starts_with("proc_") => {
            let index = parse_index(key, proc, "proc_", 2, 16)?;
            let proc = au.ensure_proc(index)?;
            match rest {
                ["p_manifest.json"] => {
                    if let Some(kind) = payload.get("type").and_then(Value::as_str) {
                        proc.set_type(kind)?;
                    }
                    proc.device.set_existent(manifest_exists(&payload));
                    Ok(())
                }
                [subkey] => proc.set_key(subkey, payload),
                _ => Err(ModuleError::parse_at("unrecognized processor key", key)),
            }
        }
        [nested, rest @ ..] if nested.starts_with("au_") => {
            let index = parse_index(key, nested, "au_", 2, 16)?;
            let nested = au.ensure_nested_au(index)?;
            route_au(key, nested, rest, payload)
        }
        _ => Err(ModuleError::parse_at("unrecognized audio unit key", key)),
    }
}

/// Unwrap the `[version, payload]` envelope.
fn parse_envelope(key: &str, data: &[u8]) -> Result<Value, ModuleError> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| ModuleError::parse_at(format!("invalid JSON: {}", e), key))?;
    let parts = value
        .as_array()
        .filter(|p| p.len() == 2)
        .ok_or_else(|| ModuleError::parse_at("expected [version, value] envelope", key))?;
    let version = parts[0]
        .as_i64()
        .ok_or_else(|| ModuleError::parse_at("envelope version must be an integer", key))?;
    if version != KEY_FORMAT_VERSION {
        return Err(ModuleError::format(format!(
            "unsupported format version {} in {}",
            version, key
        )));
    }
    Ok(parts[1].clone())
}

/// Whether a manifest payload declares the entry existent.
fn manifest_exists(payload: &Value) -> bool {
    match payload {
        Value::Null | Value::Bool(false) => false,
        Value::Bool(true) => true,
        Value::Object(_) => true,
        _ => false,
    }
}

fn parse_index(
    key: &str,
    part: &str,
    prefix: &str,
    digits: usize,
    radix: u32,
) -> Result<usize, ModuleError> {
    let suffix = part
        .strip_prefix(prefix)
        .ok_or_else(|| ModuleError::parse_at("bad key component", key))?;
    if suffix.len() != digits {
        return Err(ModuleError::parse_at(
            format!("index in {:?} must have {} digits", part, digits),
            key,
        ));
    }
    usize::from_str_radix(suffix, radix)
        .map_err(|_| ModuleError::parse_at(format!("bad index in {:?}", part), key))
}

fn parse_port_index(key: &str, part: &str, prefix: &str) -> Result<usize, ModuleError> {
    let port = parse_index(key, part, prefix, 2, 16)?;
    if port >= DEVICE_PORTS_MAX {
        return Err(ModuleError::format(format!(
            "port index {} out of range",
            port
        )));
    }
    Ok(port)
}

fn expect_f64(key: &str, payload: &Value) -> Result<f64, ModuleError> {
    payload
        .as_f64()
        .ok_or_else(|| ModuleError::parse_at("expected a number", key))
}

fn expect_bool(key: &str, payload: &Value) -> Result<bool, ModuleError> {
    payload
        .as_bool()
        .ok_or_else(|| ModuleError::parse_at("expected a boolean", key))
}
