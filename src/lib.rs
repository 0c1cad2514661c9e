//! # Hocket: Tracker Composition & Realtime Synthesis Engine
//!
//! > *"A hocket splits one melody across several voices, which is exactly
//! > how this engine realizes a note: one voice per processor, living and
//! > dying together."*
//!
//! `hocket` is a Rust library for music composition and realtime
//! synthesis. It loads a self-contained module description (audio units,
//! patterns, connections, tuning tables) and renders stereo PCM audio
//! frame-by-frame while accepting live control events. The engine is a
//! pure library: **push events and pull frames**.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  Player                                   │  Slice scheduler
//! │  - sample-accurate event placement        │  "between two events,
//! │  - voice render → merge → mixed render    │   one render call"
//! ├───────────────────────────────────────────┤
//! │  Sheet machinery                          │  Playback cursors
//! │  - Cgiter per column, trigger rows        │
//! │  - event dispatch, binds, carry flags     │
//! ├───────────────────────────────────────────┤
//! │  Device graph                             │  Signal topology
//! │  - audio units, processors, typed ports   │
//! │  - transpose storage, DFS walks           │
//! ├───────────────────────────────────────────┤
//! │  Work buffers & automation                │  Signal transport
//! │  - const-region tracking, final flags     │
//! │  - sliders, LFOs, linear controls         │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hocket::prelude::*;
//! use serde_json::json;
//!
//! fn set(handle: &mut Handle, key: &str, payload: serde_json::Value) {
//!     let data = serde_json::to_vec(&json!([0, payload])).unwrap();
//!     handle.set_data(key, &data).unwrap();
//! }
//!
//! let mut handle = Handle::new();
//!
//! // One instrument: a sine generator routed to the master output.
//! set(&mut handle, "au_00/p_manifest.json", json!({"type": "instrument"}));
//! set(&mut handle, "au_00/out_00/p_manifest.json", json!({}));
//! set(&mut handle, "au_00/proc_00/p_manifest.json", json!({"type": "add"}));
//! set(&mut handle, "au_00/p_connections.json",
//!     json!([["proc_00/out_00", "out_00"]]));
//! set(&mut handle, "p_control_map.json", json!([[0, 0]]));
//! set(&mut handle, "p_connections.json", json!([["au_00/out_00", "out_00"]]));
//!
//! // An album with one empty 16-beat pattern to play through.
//! set(&mut handle, "album/p_manifest.json", json!({}));
//! set(&mut handle, "album/p_tracks.json", json!([0]));
//! set(&mut handle, "song_00/p_manifest.json", json!({}));
//! set(&mut handle, "song_00/p_order_list.json", json!([[0, 0]]));
//! set(&mut handle, "pat_000/p_manifest.json", json!({}));
//! set(&mut handle, "pat_000/p_length.json", json!([16, 0]));
//! set(&mut handle, "pat_000/instance_000/p_manifest.json", json!({}));
//!
//! // Validate, build a player, push an event, pull frames.
//! let mut player = handle.into_player(48000, 1024, 64, 32).unwrap();
//! player.reset(0);
//! player.fire(0, &json!(["n+", 0]));
//! player.play(1024);
//! let left: &[f32] = player.get_audio(0);
//! let right: &[f32] = player.get_audio(1);
//! # let _ = (left, right);
//! ```
//!
//! ## Key Concepts
//!
//! - **Device graph**: a DAG of signal producers/consumers with typed
//!   ports, validated for acyclicity and walked in topological order.
//! - **Voice group**: all voices realizing one note inside one audio
//!   unit; allocated, stolen and reset atomically.
//! - **Work buffer**: an audio-rate `f32` slab with a constant-region
//!   marker and a "final value" flag that let processors short-circuit.
//! - **Cgiter**: the per-column playback cursor reporting distances to
//!   the next trigger row and the next global breakpoint.
//! - **Sample accuracy**: the render slice boundary coincides with the
//!   event frame, so parameter changes land exactly where the sheet says.
//!
//! ## Determinism
//!
//! Given the same module, audio rate, buffer size and event stream, the
//! output is bit-reproducible. With worker threads, voice groups are
//! assigned to threads in deterministic sorted order, so the thread count
//! does not change the output either.
//!
//! ## Module Documentation
//!
//! - [`handle`] - key/value loading surface and validation
//! - [`player`] - the render loop and public playback API
//! - [`connections`] - the device graph and its walks
//! - [`voice`] - voice pool, groups, priority stealing
//! - [`processors`] - the built-in processor implementations
//! - [`controls`] - sliders, LFOs and linear controls
//! - [`cgiter`] - playback cursors over pattern content
//! - [`tuning`] - microtonal tuning tables with retuning

pub mod audio_unit;
pub mod cgiter;
pub mod channel;
pub mod connections;
pub mod controls;
pub mod device;
pub mod device_state;
pub mod error;
pub mod event_handler;
pub mod events;
pub mod handle;
pub mod master;
pub mod module;
pub mod player;
pub mod processors;
pub mod rng;
pub mod sheet;
pub mod tstamp;
pub mod tuning;
pub mod voice;
pub mod work_buffer;

/// Number of columns in a pattern, and therefore of channels.
pub const COLUMNS_MAX: usize = 64;

/// Number of playback channels; one per pattern column.
pub const CHANNELS_MAX: usize = COLUMNS_MAX;

/// Maximum number of patterns in a module.
pub const PATTERNS_MAX: usize = 1024;

/// Maximum number of instances of one pattern.
pub const PAT_INSTANCES_MAX: usize = 32;

/// Maximum number of songs in a module.
pub const SONGS_MAX: usize = 256;

/// Maximum number of audio units per table.
pub const AUDIO_UNITS_MAX: usize = 256;

/// Maximum number of processors inside one audio unit.
pub const PROCESSORS_MAX: usize = 256;

/// Maximum number of control slots mapping to audio units.
pub const CONTROLS_MAX: usize = 256;

/// Number of ports per direction on any device.
pub const DEVICE_PORTS_MAX: usize = 16;

/// Maximum voice pool size.
pub const VOICES_MAX: usize = 1024;

/// Exclusive upper bound of the render thread count.
pub const THREADS_MAX: usize = 32;

/// Maximum number of tuning tables in a module.
pub const TUNING_TABLES_MAX: usize = 16;

/// Maximum internal audio buffer size in frames.
pub const AUDIO_BUFFER_SIZE_MAX: usize = 1 << 22;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::ModuleError;
    pub use crate::handle::Handle;
    pub use crate::module::Module;
    pub use crate::player::Player;
    pub use crate::tstamp::{PatInstRef, Position, Tstamp};

    pub use crate::connections::{Connections, DeviceRef};
    pub use crate::controls::{Lfo, LinearControls, Slider};
    pub use crate::device::{Device, DeviceImpl, PortType, SignalType};
    pub use crate::events::{EventArgType, EventType, EventValue};
    pub use crate::tuning::TuningTable;
    pub use crate::voice::{Voice, VoicePool, VoicePriority};
    pub use crate::work_buffer::WorkBuffer;
}

// Re-export key types at crate root for convenience
pub use prelude::*;
