//! The Player
//!
//! The player ties everything together: it asks the column iterators for
//! the distance to the next event, renders exactly up to that point,
//! dispatches the trigger row, and repeats. Between two successive events
//! there is a single call into the render machinery, so parameter changes
//! land exactly at the frame computed from their musical time.
//!
//! One render slice proceeds clear → voice render → voice-signal merge →
//! mixed render → master volume and DC blocker → PCM copy. Voice groups
//! may render on worker threads; groups are assigned to threads in sorted
//! order, so output does not depend on scheduling.

use crate::cgiter::Cgiter;
use crate::channel::Channel;
use crate::connections::{self, DeviceRef};
use crate::device_state::DeviceStates;
use crate::error::ModuleError;
use crate::event_handler::{trigger_event, EventContext};
use crate::master::{MasterParams, PlaybackMode};
use crate::module::Module;
use crate::processors::db_to_gain;
use crate::rng::Rng;
use crate::tstamp::{PatInstRef, Position, Tstamp};
use crate::voice::{Voice, VoicePool, VoicePriority};
use crate::{AUDIO_BUFFER_SIZE_MAX, CHANNELS_MAX, THREADS_MAX, VOICES_MAX};

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Default audio rate in frames per second.
pub const DEFAULT_AUDIO_RATE: u32 = 48000;

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Upper bound of one internal render slice.
const CHUNK_MAX: usize = 1024;

/// Slice cap while a tempo slide is in progress, keeping the slide smooth.
const TEMPO_SLIDE_CHUNK_MAX: usize = 64;

/// One-pole DC blocking filter over the stereo master output.
#[derive(Debug, Clone, Default)]
struct DcBlocker {
    x1: [f32; 2],
    y1: [f32; 2],
}

const DC_BLOCKER_R: f32 = 0.995;

impl DcBlocker {
    fn apply(&mut self, channel: usize, samples: &mut [f32]) {
        let mut x1 = self.x1[channel];
        let mut y1 = self.y1[channel];
        for s in samples.iter_mut() {
            let x = *s;
            let y = x - x1 + DC_BLOCKER_R * y1;
            x1 = x;
            y1 = y;
            *s = y;
        }
        self.x1[channel] = x1;
        self.y1[channel] = y1;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The playback engine: push events, pull frames.
pub struct Player {
    module: Arc<Module>,
    audio_rate: u32,
    audio_buffer_size: usize,
    thread_count: usize,

    channels: Vec<Channel>,
    cgiters: Vec<Cgiter>,
    master: MasterParams,
    voices: VoicePool,
    device_states: DeviceStates,

    audio_buffers: [Vec<f32>; 2],
    frames_avail: usize,
    /// Fractional frames by which musical position leads rendered frames.
    frame_lag: f64,
    nanoseconds: i64,

    event_buffer: Vec<String>,
    event_buffer_size: usize,

    dc_blocker: DcBlocker,
}

impl Player {
    /// Create a player for a validated module.
    pub fn new(
        module: Arc<Module>,
        audio_rate: u32,
        audio_buffer_size: usize,
        event_buffer_size: usize,
        voice_count: usize,
    ) -> Result<Self, ModuleError> {
        if audio_rate == 0 {
            return Err(ModuleError::argument("audio rate must be positive"));
        }
        if audio_buffer_size == 0 || audio_buffer_size > AUDIO_BUFFER_SIZE_MAX {
            return Err(ModuleError::argument(format!(
                "audio buffer size must be in 1..={}",
                AUDIO_BUFFER_SIZE_MAX
            )));
        }
        if voice_count > VOICES_MAX {
            return Err(ModuleError::argument(format!(
                "voice count must be at most {}",
                VOICES_MAX
            )));
        }
        if module.device_count() == 0 {
            return Err(ModuleError::argument(
                "module must be validated before creating a player",
            ));
        }

        let seed_rng = Rng::from_seed(module.random_seed);
        let channels: Vec<Channel> = (0..CHANNELS_MAX)
            .map(|i| {
                let mut ch = Channel::new(i, &seed_rng);
                ch.au_input = module.channel_default_control(i);
                ch.set_audio_rate(audio_rate);
                ch
            })
            .collect();
        let cgiters = (0..CHANNELS_MAX).map(Cgiter::new).collect();

        let mut voices = VoicePool::new(voice_count);
        voices.reserve_work_buffers(audio_buffer_size);

        let mut device_states = DeviceStates::new(module.device_count(), 1);
        connections::prepare_buffers(&module, &mut device_states, audio_buffer_size);

        let mut master = MasterParams::new(module.random_seed);
        master.set_tuning_tables(&module.tuning_tables);

        Ok(Self {
            module,
            audio_rate,
            audio_buffer_size,
            thread_count: 1,
            channels,
            cgiters,
            master,
            voices,
            device_states,
            audio_buffers: [vec![0.0; audio_buffer_size], vec![0.0; audio_buffer_size]],
            frames_avail: 0,
            frame_lag: 0.0,
            nanoseconds: 0,
            event_buffer: Vec::new(),
            event_buffer_size,
            dc_blocker: DcBlocker::default(),
        })
    }

    pub fn audio_rate(&self) -> u32 {
        self.audio_rate
    }

    /// Change the audio rate. Active voices are dropped: their state is
    /// meaningless at the new rate.
    pub fn set_audio_rate(&mut self, audio_rate: u32) -> Result<(), ModuleError> {
        if audio_rate == 0 {
            return Err(ModuleError::argument("audio rate must be positive"));
        }
        self.audio_rate = audio_rate;
        for ch in &mut self.channels {
            ch.set_audio_rate(audio_rate);
        }
        self.voices.reset();
        Ok(())
    }

    pub fn audio_buffer_size(&self) -> usize {
        self.audio_buffer_size
    }

    /// Change the internal buffer size, resizing every work buffer.
    pub fn set_audio_buffer_size(&mut self, size: usize) -> Result<(), ModuleError> {
        if size == 0 || size > AUDIO_BUFFER_SIZE_MAX {
            return Err(ModuleError::argument(format!(
                "audio buffer size must be in 1..={}",
                AUDIO_BUFFER_SIZE_MAX
            )));
        }
        self.audio_buffer_size = size;
        for buf in &mut self.audio_buffers {
            buf.clear();
            buf.resize(size, 0.0);
        }
        self.device_states.set_buffer_size(size);
        connections::prepare_buffers(&self.module, &mut self.device_states, size);
        self.voices.reserve_work_buffers(size);
        self.voices.reset();
        self.frames_avail = 0;
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Set the number of render threads used for voice rendering.
    pub fn set_thread_count(&mut self, count: usize) -> Result<(), ModuleError> {
        if count == 0 || count >= THREADS_MAX {
            return Err(ModuleError::argument(format!(
                "thread count must be in 1..{}",
                THREADS_MAX
            )));
        }
        self.thread_count = count;
        self.device_states.set_thread_count(count);
        connections::prepare_buffers(&self.module, &mut self.device_states, self.audio_buffer_size);
        Ok(())
    }

    /// Change the voice pool size between renders.
    pub fn set_voice_count(&mut self, count: usize) -> Result<(), ModuleError> {
        if count > VOICES_MAX {
            return Err(ModuleError::argument(format!(
                "voice count must be at most {}",
                VOICES_MAX
            )));
        }
        self.voices.resize(count);
        self.voices.reserve_work_buffers(self.audio_buffer_size);
        Ok(())
    }

    /// Restart playback from the beginning of a track (-1 plays the first
    /// track of the album).
    pub fn reset(&mut self, track: i32) {
        let track = track.max(0);
        let tempo = self
            .module
            .track_song(track)
            .map(|s| s.tempo)
            .unwrap_or(DEFAULT_TEMPO);

        self.master.reset(
            track,
            tempo,
            self.module.mixing_volume_db,
            self.module.random_seed,
        );
        self.master.set_tuning_tables(&self.module.tuning_tables);

        let seed_rng = Rng::from_seed(self.module.random_seed);
        for ch in &mut self.channels {
            let default = self.module.channel_default_control(ch.index);
            ch.reset(default, &seed_rng);
            ch.set_tempo(tempo);
        }

        let start = Position::start_of_track(track);
        for cgiter in &mut self.cgiters {
            cgiter.reset(&self.module, &start);
        }

        self.voices.reset();
        self.frames_avail = 0;
        self.frame_lag = 0.0;
        self.nanoseconds = 0;
        self.event_buffer.clear();
    }

    /// Loop one pattern instance instead of following the album.
    pub fn reset_pattern(&mut self, piref: PatInstRef) {
        self.reset(0);
        self.master.playback_mode = PlaybackMode::Pattern;
        let start = Position::pattern_playback(piref);
        for cgiter in &mut self.cgiters {
            cgiter.reset(&self.module, &start);
        }
    }

    /// Drop the DC blocker history, preventing a click when toggling it.
    pub fn reset_dc_blocker(&mut self) {
        self.dc_blocker.reset();
    }

    pub fn has_stopped(&self) -> bool {
        self.master.playback_mode == PlaybackMode::Stop
    }

    /// Length of music rendered or skipped since the last reset.
    pub fn nanoseconds(&self) -> i64 {
        self.nanoseconds
    }

    /// Number of frames produced by the last [`Player::play`] call.
    pub fn frames_available(&self) -> usize {
        self.frames_avail
    }

    /// The rendered PCM of one output channel (0 = left, 1 = right).
    pub fn get_audio(&self, channel: usize) -> &[f32] {
        debug_assert!(channel < 2);
        &self.audio_buffers[channel][..self.frames_avail]
    }

    /// Dispatched and dropped events of the last render call, one JSON
    /// entry per line.
    pub fn events_json(&self) -> String {
        self.event_buffer.join("\n")
    }

    /// Inject a live event on a channel. Returns false (and logs) for an
    /// invalid event.
    pub fn fire(&mut self, channel: usize, event: &Value) -> bool {
        let module = Arc::clone(&self.module);
        let parts = match event.as_array() {
            Some(p) if !p.is_empty() && p.len() <= 2 => p,
            _ => {
                log::warn!("fired event is not [name, arg]: {}", event);
                self.record_event(channel, "?", event);
                return false;
            }
        };
        let Some(name) = parts[0].as_str() else {
            log::warn!("fired event has no name: {}", event);
            self.record_event(channel, "?", event);
            return false;
        };
        let arg = parts.get(1).cloned().unwrap_or(Value::Null);

        let mut ctx = EventContext {
            module: &module,
            channels: &mut self.channels,
            master: &mut self.master,
            voices: &mut self.voices,
            dstates: &mut self.device_states,
            audio_rate: self.audio_rate,
            frame_offset: 0,
        };
        match trigger_event(&mut ctx, channel, name, &arg) {
            Ok(()) => {
                self.record_event(channel, name, &arg);
                true
            }
            Err(err) => {
                log::warn!("dropped event {} on channel {}: {}", name, channel, err);
                self.record_event(channel, name, &arg);
                false
            }
        }
    }

    /// Render up to `nframes` frames into the internal buffers.
    pub fn play(&mut self, nframes: usize) {
        self.event_buffer.clear();
        let nframes = nframes.min(self.audio_buffer_size);
        for buf in &mut self.audio_buffers {
            buf[..nframes].fill(0.0);
        }
        let rendered = self.run(nframes, true);
        self.frames_avail = rendered;
        self.account_time(rendered);
    }

    /// Fast-forward playback without producing audio.
    pub fn skip(&mut self, nframes: u64) {
        self.event_buffer.clear();
        let mut left = nframes;
        while left > 0 && !self.has_stopped() {
            let step = left.min(self.audio_buffer_size as u64) as usize;
            let done = self.run(step, false);
            self.account_time(done);
            if done == 0 {
                break;
            }
            left -= done as u64;
        }
        // Skipped notes have no audible tail to keep.
        self.voices.reset();
        self.frames_avail = 0;
    }

    fn account_time(&mut self, frames: usize) {
        self.nanoseconds += frames as i64 * 1_000_000_000 / i64::from(self.audio_rate);
    }

    /// The scheduler core: alternate between event dispatch at the current
    /// position and rendering up to the next breakpoint.
    fn run(&mut self, nframes: usize, render: bool) -> usize {
        let mut rendered = 0;

        while rendered < nframes {
            if self.master.playback_mode == PlaybackMode::Stop {
                break;
            }

            self.process_current_rows(rendered);

            if self.master.jump_requested {
                self.master.jump_requested = false;
                for cgiter in &mut self.cgiters {
                    cgiter.rewind_pattern();
                }
                continue;
            }

            // Distance to the next breakpoint.
            let in_delay = !self.master.pattern_delay_left.is_zero();
            let mut dist = Tstamp::max();
            let mut found = false;
            if in_delay {
                dist = self.master.pattern_delay_left;
                found = true;
            } else {
                for cgiter in &self.cgiters {
                    found |= cgiter.local_bp_dist(&self.module, &mut dist);
                }
            }

            if !found {
                // Nothing left to schedule: let active voices ring out,
                // then stop.
                if self.voices.voices().iter().any(|v| v.group_id() != 0) {
                    let chunk = (nframes - rendered).min(CHUNK_MAX);
                    if chunk == 0 {
                        break;
                    }
                    if render {
                        self.render_slice(rendered, rendered + chunk);
                    }
                    rendered += chunk;
                    if !self.voices.voices().iter().any(|v| v.group_id() != 0) {
                        self.master.playback_mode = PlaybackMode::Stop;
                    }
                    continue;
                }
                self.master.playback_mode = PlaybackMode::Stop;
                break;
            }

            let tempo = self.master.tempo;
            let dist_frames = dist.to_frames(tempo, self.audio_rate);
            let avail = (self.frame_lag + dist_frames).floor() as usize;

            let mut chunk = avail.min(nframes - rendered).min(CHUNK_MAX);
            if self.master.tempo_slide.is_active() {
                chunk = chunk.min(TEMPO_SLIDE_CHUNK_MAX);
            }

            if chunk == 0 {
                // The breakpoint lies within the current frame: advance
                // musical time and dispatch there.
                self.advance_position(&dist, in_delay);
                self.frame_lag += dist_frames;
                continue;
            }

            if render {
                self.render_slice(rendered, rendered + chunk);
            } else {
                for ch in &mut self.channels {
                    ch.force_controls.skip(chunk as u64);
                    ch.pitch_controls.skip(chunk as u64);
                    ch.panning_controls.skip(chunk as u64);
                }
            }

            if chunk == avail {
                // We reached the breakpoint exactly.
                self.advance_position(&dist, in_delay);
                self.frame_lag = self.frame_lag + dist_frames - chunk as f64;
            } else {
                // Buffer (or cap) limited: advance by the rendered length.
                let adv =
                    Tstamp::from_frames(chunk as f64 - self.frame_lag, tempo, self.audio_rate);
                self.advance_position(&adv, in_delay);
                self.frame_lag =
                    (self.frame_lag + adv.to_frames(tempo, self.audio_rate) - chunk as f64)
                        .max(0.0);
            }

            self.master.advance_tempo_slide(chunk);
            if self.master.tempo_slide.is_active() || self.master.tempo != tempo {
                let new_tempo = self.master.tempo;
                for ch in &mut self.channels {
                    ch.set_tempo(new_tempo);
                }
            }

            rendered += chunk;
        }

        // End of content with silent voices also counts as stopped.
        if rendered < nframes
            && self.master.playback_mode != PlaybackMode::Stop
            && self.cgiters.iter().all(|c| c.has_finished())
            && !self.voices.voices().iter().any(|v| v.group_id() != 0)
        {
            self.master.playback_mode = PlaybackMode::Stop;
        }

        rendered
    }

    fn advance_position(&mut self, dist: &Tstamp, in_delay: bool) {
        if in_delay {
            let left = self.master.pattern_delay_left.sub(dist);
            self.master.pattern_delay_left = if left > Tstamp::zero() {
                left
            } else {
                Tstamp::zero()
            };
            return;
        }
        for cgiter in &mut self.cgiters {
            cgiter.move_by(&self.module, dist);
        }
    }

    /// Dispatch every trigger row at the current position, channels in
    /// index order, triggers in insertion order.
    fn process_current_rows(&mut self, frame_offset: usize) {
        let module = Arc::clone(&self.module);
        for ch_index in 0..self.cgiters.len() {
            let Some(row) = self.cgiters[ch_index].peek_row(&module) else {
                continue;
            };
            let triggers: Vec<(String, Value)> = row
                .iter()
                .map(|t| (t.name.clone(), t.arg.clone()))
                .collect();

            for (name, arg) in triggers {
                let mut ctx = EventContext {
                    module: &module,
                    channels: &mut self.channels,
                    master: &mut self.master,
                    voices: &mut self.voices,
                    dstates: &mut self.device_states,
                    audio_rate: self.audio_rate,
                    frame_offset,
                };
                if let Err(err) = trigger_event(&mut ctx, ch_index, &name, &arg) {
                    log::warn!(
                        "dropped trigger {} on channel {}: {}",
                        name,
                        ch_index,
                        err
                    );
                }
                self.record_event(ch_index, &name, &arg);
            }
        }
    }

    fn record_event(&mut self, channel: usize, name: &str, arg: &Value) {
        if self.event_buffer.len() >= self.event_buffer_size {
            return;
        }
        self.event_buffer
            .push(serde_json::json!([channel, [name, arg]]).to_string());
    }

    /// Render one slice `[start, stop)` of the current buffer.
    fn render_slice(&mut self, start: usize, stop: usize) {
        debug_assert!(start < stop);
        debug_assert!(stop <= self.audio_buffer_size);

        // Clear
        self.device_states.clear_mixed_buffers();

        // Voice rendering, possibly on worker threads.
        render_voices(
            &self.module,
            &mut self.voices,
            &mut self.device_states,
            start,
            stop,
            self.master.tempo,
            self.audio_rate,
        );

        // Merge worker accumulations, then the single-threaded mixed walk.
        self.device_states.merge_thread_signals(start, stop);
        {
            let (dstates, tset) = self.device_states.split_thread(0);
            connections::render_mixed_graph(
                &self.module,
                dstates,
                tset,
                start,
                stop,
                self.master.tempo,
                self.audio_rate,
            );
        }

        // Master volume, DC blocker, PCM copy.
        let gain = db_to_gain(self.master.volume_db) as f32;
        let master_id = self.module.master_device.id();
        let use_dc_blocker = self.module.dc_blocker_enabled;
        let tset = self.device_states.thread(0);
        let master_ts = tset.get(master_id);
        let master_connected = self
            .module
            .connections
            .as_ref()
            .and_then(|c| c.get(DeviceRef::Master))
            .is_some();
        for channel in 0..2 {
            let out = &mut self.audio_buffers[channel][start..stop];
            match master_ts.mixed_in(channel) {
                Some(buf) if master_connected && buf.is_valid() => {
                    let src = &buf.contents()[start..stop];
                    for (o, &s) in out.iter_mut().zip(src.iter()) {
                        *o = s * gain;
                    }
                }
                _ => out.fill(0.0),
            }
            if use_dc_blocker {
                self.dc_blocker.apply(channel, out);
            }
        }
    }
}

/// Render all voice groups for one slice.
///
/// Groups are sorted, split into disjoint slices and assigned to threads
/// round-robin in sorted order; with one thread everything runs inline.
/// Completed groups are reset afterwards and fresh voices drop their
/// steal protection.
fn render_voices(
    module: &Arc<Module>,
    voices: &mut VoicePool,
    states: &mut DeviceStates,
    start: usize,
    stop: usize,
    tempo: f64,
    audio_rate: u32,
) {
    voices.start_group_iteration();
    let module_ref: &Module = module;

    {
        let (_, tsets) = states.split_for_render();
        let groups = voices.group_slices();
        let thread_count = tsets.len();

        if thread_count <= 1 || groups.len() <= 1 {
            let tset = &mut tsets[0];
            for group in groups {
                connections::render_voice_group(
                    module_ref, group, tset, start, stop, tempo, audio_rate,
                );
            }
        } else {
            // Deterministic static assignment: group i runs on thread
            // i % thread_count.
            let mut buckets: Vec<VecDeque<&mut [Voice]>> =
                (0..thread_count).map(|_| VecDeque::new()).collect();
            for (i, group) in groups.into_iter().enumerate() {
                buckets[i % thread_count].push_back(group);
            }

            std::thread::scope(|scope| {
                for (tset, mut bucket) in tsets.iter_mut().zip(buckets.into_iter()) {
                    scope.spawn(move || {
                        while let Some(group) = bucket.pop_front() {
                            connections::render_voice_group(
                                module_ref, group, tset, start, stop, tempo, audio_rate,
                            );
                        }
                    });
                }
            });
        }
    }

    // Fresh voices lose their steal protection after their first render.
    let mut finished_groups: Vec<u64> = Vec::new();
    for voice in voices.voices_mut() {
        if voice.prio() == VoicePriority::New {
            voice.set_prio(VoicePriority::Fg);
        }
    }
    let mut last_group = 0u64;
    for voice in voices.voices() {
        let gid = voice.group_id();
        if gid == 0 || gid == last_group {
            continue;
        }
        last_group = gid;
        if !voices.group_is_active(gid) {
            finished_groups.push(gid);
        }
    }
    for gid in finished_groups {
        voices.reset_group(gid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::{TrackList, Trigger};
    use serde_json::json;

    /// A module with one debug instrument and a 16-beat empty pattern.
    fn debug_module(single_pulse: bool) -> Arc<Module> {
        let mut module = Module::new();
        {
            let au = module.au_table.ensure(0).unwrap();
            au.device.set_existent(true);
            au.device
                .set_port_count(crate::device::PortType::Send, 1);
            let proc = au.ensure_proc(0).unwrap();
            proc.set_type("debug").unwrap();
            proc.set_key("p_b_single_pulse.json", json!(single_pulse))
                .unwrap();
            au.set_raw_connections(json!([["proc_00/out_00", "out_00"]]));
        }
        module.set_control_map_from_json(&json!([[0, 0]])).unwrap();
        module.set_raw_connections(json!([["au_00/out_00", "out_00"]]));

        {
            let pat = module.ensure_pattern(0).unwrap();
            pat.set_instance_existent(0, true);
            pat.set_length(Tstamp::new(16, 0));
        }
        module
            .ensure_song(0)
            .unwrap()
            .set_order_list_from_json(&json!([[0, 0]]))
            .unwrap();
        module.track_list = Some(TrackList::from_json(&json!([0])).unwrap());
        module.dc_blocker_enabled = false;

        module.validate().unwrap();
        Arc::new(module)
    }

    fn player_at_220(module: Arc<Module>) -> Player {
        let mut player = Player::new(module, 220, 1024, 64, 16).unwrap();
        player.reset(0);
        player
    }

    #[test]
    fn test_scenario_single_pulse_voice() {
        let mut player = player_at_220(debug_module(true));
        assert!(player.fire(0, &json!(["n+", 0])));
        player.play(128);

        assert_eq!(player.frames_available(), 128);
        let out = player.get_audio(0);
        assert_eq!(out[0], 1.0);
        assert!(out[1..128].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_scenario_repeated_pulse_envelope() {
        let mut player = player_at_220(debug_module(false));
        assert!(player.fire(0, &json!(["n+", 0])));
        player.play(128);

        let out = player.get_audio(0);
        for i in 0..32 {
            let expected = if i % 4 == 0 { 1.0 } else { 0.5 };
            assert_eq!(out[i], expected, "frame {}", i);
        }
    }

    /// Two instruments on controls 0 and 1.
    fn two_instrument_module() -> Arc<Module> {
        let mut module = Module::new();
        for (index, single_pulse) in [(0usize, true), (1usize, false)] {
            let au = module.au_table.ensure(index).unwrap();
            au.device.set_existent(true);
            au.device
                .set_port_count(crate::device::PortType::Send, 1);
            let proc = au.ensure_proc(0).unwrap();
            proc.set_type("debug").unwrap();
            proc.set_key("p_b_single_pulse.json", json!(single_pulse))
                .unwrap();
            au.set_raw_connections(json!([["proc_00/out_00", "out_00"]]));
        }
        module
            .set_control_map_from_json(&json!([[0, 0], [1, 1]]))
            .unwrap();
        module.set_raw_connections(json!([
            ["au_00/out_00", "out_00"],
            ["au_01/out_00", "out_00"],
        ]));

        {
            let pat = module.ensure_pattern(0).unwrap();
            pat.set_instance_existent(0, true);
            pat.set_length(Tstamp::new(16, 0));
        }
        module
            .ensure_song(0)
            .unwrap()
            .set_order_list_from_json(&json!([[0, 0]]))
            .unwrap();
        module.track_list = Some(TrackList::from_json(&json!([0])).unwrap());
        module.dc_blocker_enabled = false;

        module.validate().unwrap();
        Arc::new(module)
    }

    #[test]
    fn test_scenario_instrument_map_indexing() {
        let mut player = player_at_220(two_instrument_module());

        player.fire(0, &json!([".a", 0]));
        player.fire(0, &json!(["n+", 0]));
        player.play(10);
        let mut out: Vec<f32> = player.get_audio(0).to_vec();

        player.fire(0, &json!([".a", 1]));
        player.fire(0, &json!(["n+", 0]));
        player.play(118);
        out.extend_from_slice(player.get_audio(0));

        // Instrument 0: one pulse at frame 0, silence after.
        assert_eq!(out[0], 1.0);
        assert!(out[1..10].iter().all(|&x| x == 0.0));
        // Instrument 1 takes over at frame 10 with the 4-frame envelope.
        for i in 10..30 {
            let expected = if (i - 10) % 4 == 0 { 1.0 } else { 0.5 };
            assert_eq!(out[i], expected, "frame {}", i);
        }
    }

    /// A debug instrument with a nested effect unit (0 dB volume) between
    /// the generator and the output.
    fn nested_effect_module() -> Arc<Module> {
        let mut module = Module::new();
        {
            let au = module.au_table.ensure(0).unwrap();
            au.device.set_existent(true);
            au.device
                .set_port_count(crate::device::PortType::Send, 1);
            let proc = au.ensure_proc(0).unwrap();
            proc.set_type("debug").unwrap();
            proc.set_key("p_b_single_pulse.json", json!(false)).unwrap();

            {
                let effect = au.ensure_nested_au(0).unwrap();
                effect.device.set_existent(true);
                effect.set_au_type(crate::audio_unit::AuType::Effect);
                effect
                    .device
                    .set_port_count(crate::device::PortType::Receive, 1);
                effect
                    .device
                    .set_port_count(crate::device::PortType::Send, 1);
                let vol = effect.ensure_proc(0).unwrap();
                vol.set_type("volume").unwrap();
                effect.set_raw_connections(json!([
                    ["in_00", "proc_00/in_00"],
                    ["proc_00/out_00", "out_00"],
                ]));
            }

            au.set_raw_connections(json!([
                ["proc_00/out_00", "au_00/in_00"],
                ["au_00/out_00", "out_00"],
            ]));
        }
        module.set_control_map_from_json(&json!([[0, 0]])).unwrap();
        module.set_raw_connections(json!([["au_00/out_00", "out_00"]]));

        {
            let pat = module.ensure_pattern(0).unwrap();
            pat.set_instance_existent(0, true);
            pat.set_length(Tstamp::new(16, 0));
        }
        module
            .ensure_song(0)
            .unwrap()
            .set_order_list_from_json(&json!([[0, 0]]))
            .unwrap();
        module.track_list = Some(TrackList::from_json(&json!([0])).unwrap());
        module.dc_blocker_enabled = false;

        module.validate().unwrap();
        Arc::new(module)
    }

    #[test]
    fn test_scenario_bypass_passthrough() {
        let mut player = player_at_220(nested_effect_module());

        // Bypass the nested effect unit directly.
        let nested_id = {
            let au = player.module.au_table.get(0).unwrap();
            au.nested_au(0).unwrap().device.id()
        };
        player.device_states.state_mut(nested_id).bypass = true;

        player.fire(0, &json!(["n+", 0]));
        player.play(32);
        let out = player.get_audio(0);
        for i in 0..32 {
            let expected = if i % 4 == 0 { 1.0 } else { 0.5 };
            assert_eq!(out[i], expected, "frame {}", i);
        }
    }

    #[test]
    fn test_nested_effect_passes_audio_without_bypass() {
        // A 0 dB volume chain is bit-transparent either way.
        let mut player = player_at_220(nested_effect_module());
        player.fire(0, &json!(["n+", 0]));
        player.play(16);
        let out = player.get_audio(0);
        assert_eq!(out[0], 1.0);
        assert_eq!(out[1], 0.5);
    }

    /// A stream instrument: the output is the stream's value.
    fn stream_module() -> Arc<Module> {
        let mut module = Module::new();
        {
            let au = module.au_table.ensure(0).unwrap();
            au.device.set_existent(true);
            au.device
                .set_port_count(crate::device::PortType::Send, 1);
            let proc = au.ensure_proc(0).unwrap();
            proc.set_type("stream").unwrap();
            au.set_raw_connections(json!([["proc_00/out_00", "out_00"]]));
            au.set_streams_from_json(&json!([["level", 0]])).unwrap();
        }
        module.set_control_map_from_json(&json!([[0, 0]])).unwrap();
        module.set_raw_connections(json!([["au_00/out_00", "out_00"]]));

        {
            let pat = module.ensure_pattern(0).unwrap();
            pat.set_instance_existent(0, true);
            pat.set_length(Tstamp::new(64, 0));
        }
        module
            .ensure_song(0)
            .unwrap()
            .set_order_list_from_json(&json!([[0, 0]]))
            .unwrap();
        module.track_list = Some(TrackList::from_json(&json!([0])).unwrap());
        module.dc_blocker_enabled = false;

        module.validate().unwrap();
        Arc::new(module)
    }

    #[test]
    fn test_scenario_slide_break_on_retarget() {
        // 220 Hz at 120 BPM: one beat is 110 frames, so a 2-beat slide is
        // one second.
        let mut player = player_at_220(stream_module());
        player.fire(0, &json!(["n+", 0]));
        player.fire(0, &json!([".sn", 0]));
        player.fire(0, &json!(["s.v", -6.0]));
        player.fire(0, &json!(["s/=v", [2, 0]]));
        player.fire(0, &json!(["s/v", 0.0]));

        player.play(110);
        let first: Vec<f32> = player.get_audio(0).to_vec();
        // Halfway through the slide from -6 to 0 the value is -3.
        assert!((first[109] - (-3.0)).abs() < 1e-4, "got {}", first[109]);

        // Retarget to -3: the value is already there, so it stays flat.
        player.fire(0, &json!(["s/v", -3.0]));
        player.play(110);
        let second = player.get_audio(0);
        assert!(second.iter().all(|&x| (x - (-3.0)).abs() < 1e-4));
    }

    #[test]
    fn test_scenario_cycle_rejection() {
        let mut module = Module::new();
        for index in 0..2 {
            let au = module.au_table.ensure(index).unwrap();
            au.device.set_existent(true);
            au.device
                .set_port_count(crate::device::PortType::Receive, 1);
            au.device
                .set_port_count(crate::device::PortType::Send, 1);
        }
        module.set_raw_connections(json!([
            ["au_00/out_00", "au_01/in_00"],
            ["au_01/out_00", "au_00/in_00"],
        ]));

        let err = module.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_pattern_trigger_timing_is_sample_accurate() {
        // Note-on at beat 0, note-off at beat 1. At 220 Hz / 120 BPM the
        // note-off lands exactly at frame 110; the envelope finishes at
        // the next 4-frame boundary (112).
        let module = {
            let mut module = Arc::try_unwrap(debug_module(false)).ok().unwrap();
            {
                let pat = module.ensure_pattern(0).unwrap();
                let col = pat.column_mut(0).unwrap();
                col.insert(Trigger::new(Tstamp::zero(), "n+", json!(0.0)));
                col.insert(Trigger::new(Tstamp::new(1, 0), "n-", Value::Null));
            }
            module.validate().unwrap();
            Arc::new(module)
        };

        let mut player = player_at_220(module);
        player.play(256);
        let out = player.get_audio(0);

        for i in 0..110 {
            let expected = if i % 4 == 0 { 1.0 } else { 0.5 };
            assert_eq!(out[i], expected, "frame {}", i);
        }
        // Note-off at frame 110: frames 110..112 finish the 4-frame
        // group, then silence.
        assert_eq!(out[110], 0.5);
        assert_eq!(out[111], 0.5);
        assert_eq!(out[112], 0.0);
        assert!(out[112..180].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_determinism_single_thread() {
        let module = debug_module(false);
        let render = |module: &Arc<Module>| {
            let mut player = player_at_220(Arc::clone(module));
            player.fire(0, &json!(["n+", 0]));
            player.play(256);
            player.get_audio(0).to_vec()
        };
        assert_eq!(render(&module), render(&module));
    }

    #[test]
    fn test_multi_thread_matches_single_thread() {
        let module = two_instrument_module();

        let render = |threads: usize| {
            let mut player = player_at_220(Arc::clone(&module));
            player.set_thread_count(threads).unwrap();
            player.fire(0, &json!([".a", 0]));
            player.fire(0, &json!(["n+", 0]));
            player.fire(1, &json!([".a", 1]));
            player.fire(1, &json!(["n+", 0]));
            player.play(128);
            player.get_audio(0).to_vec()
        };

        assert_eq!(render(1), render(3));
    }

    #[test]
    fn test_zero_length_pattern_playback_finishes() {
        let module = {
            let mut module = Arc::try_unwrap(debug_module(false)).ok().unwrap();
            {
                let pat = module.ensure_pattern(1).unwrap();
                pat.set_instance_existent(0, true);
                pat.set_length(Tstamp::zero());
            }
            module.validate().unwrap();
            Arc::new(module)
        };

        let mut player = player_at_220(module);
        player.reset_pattern(PatInstRef::new(1, 0));
        player.play(64);
        assert!(player.has_stopped());
        assert!(player.frames_available() < 64);
    }

    #[test]
    fn test_tempo_event_stretches_pattern() {
        // With a tempo change to 60 BPM at beat 0, one beat lasts 220
        // frames instead of 110.
        let module = {
            let mut module = Arc::try_unwrap(debug_module(false)).ok().unwrap();
            {
                let pat = module.ensure_pattern(0).unwrap();
                let col = pat.column_mut(0).unwrap();
                col.insert(Trigger::new(Tstamp::zero(), "m.t", json!(60.0)));
                col.insert(Trigger::new(Tstamp::zero(), "n+", json!(0.0)));
                col.insert(Trigger::new(Tstamp::new(1, 0), "n-", Value::Null));
            }
            module.validate().unwrap();
            Arc::new(module)
        };

        let mut player = player_at_220(module);
        player.play(512);
        let out = player.get_audio(0);
        // The note-off now lands at frame 220, which is a 4-frame group
        // boundary, so the envelope stops right there.
        assert_eq!(out[219], 0.5);
        assert_eq!(out[216], 1.0);
        assert_eq!(out[220], 0.0);
    }

    #[test]
    fn test_playback_stops_after_song() {
        let mut player = player_at_220(debug_module(false));
        // 16 beats at 120 BPM and 220 Hz = 1760 frames. Render past it.
        let mut total = 0;
        for _ in 0..4 {
            player.play(1024);
            total += player.frames_available();
            if player.has_stopped() {
                break;
            }
        }
        assert!(player.has_stopped());
        assert!(total <= 1760 + 1024);
    }

    #[test]
    fn test_skip_advances_time_without_audio() {
        let mut player = player_at_220(debug_module(false));
        player.skip(880); // 4 beats
        assert_eq!(player.frames_available(), 0);
        assert_eq!(player.nanoseconds(), 880 * 1_000_000_000 / 220);
    }

    #[test]
    fn test_fire_invalid_event_is_dropped_and_recorded() {
        let mut player = player_at_220(debug_module(true));
        assert!(!player.fire(0, &json!(["zz", 1])));
        assert!(!player.fire(0, &json!("garbage")));
        assert!(player.events_json().contains("zz"));

        // The engine still renders silence afterwards.
        player.play(16);
        assert_eq!(player.frames_available(), 16);
        assert!(player.get_audio(0).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_event_buffer_reports_pattern_triggers() {
        let module = {
            let mut module = Arc::try_unwrap(debug_module(false)).ok().unwrap();
            {
                let pat = module.ensure_pattern(0).unwrap();
                let col = pat.column_mut(0).unwrap();
                col.insert(Trigger::new(Tstamp::zero(), "n+", json!(0.0)));
            }
            module.validate().unwrap();
            Arc::new(module)
        };
        let mut player = player_at_220(module);
        player.play(16);
        assert!(player.events_json().contains("n+"));
    }

    #[test]
    fn test_reset_restarts_playback() {
        let mut player = player_at_220(debug_module(true));
        player.fire(0, &json!(["n+", 0]));
        player.play(64);
        assert_eq!(player.get_audio(0)[0], 1.0);

        player.reset(0);
        assert_eq!(player.nanoseconds(), 0);
        player.play(64);
        // No note fired after the reset.
        assert!(player.get_audio(0).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_pattern_delay_holds_position() {
        // A one-beat pattern delay at beat 0 postpones the note-off by a
        // beat of wall-clock time.
        let module = {
            let mut module = Arc::try_unwrap(debug_module(false)).ok().unwrap();
            {
                let pat = module.ensure_pattern(0).unwrap();
                let col = pat.column_mut(0).unwrap();
                col.insert(Trigger::new(Tstamp::zero(), "n+", json!(0.0)));
                col.insert(Trigger::new(Tstamp::zero(), "mpd", json!([1, 0])));
                col.insert(Trigger::new(Tstamp::new(1, 0), "n-", Value::Null));
            }
            module.validate().unwrap();
            Arc::new(module)
        };

        let mut player = player_at_220(module);
        player.play(512);
        let out = player.get_audio(0);
        // Without the delay the note-off would land at frame 110; with it
        // the envelope is still running there.
        assert_eq!(out[150], if 150 % 4 == 0 { 1.0 } else { 0.5 });
        // The note-off lands at frame 220 instead.
        assert_eq!(out[222], 0.0);
    }

    #[test]
    fn test_argument_validation_in_constructor() {
        let module = debug_module(true);
        assert!(Player::new(Arc::clone(&module), 0, 1024, 64, 16).is_err());
        assert!(Player::new(Arc::clone(&module), 48000, 0, 64, 16).is_err());
        assert!(Player::new(Arc::clone(&module), 48000, 1024, 64, VOICES_MAX + 1).is_err());
    }
}
