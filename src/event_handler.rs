//! Event Dispatch
//!
//! The event handler routes validated events to the state they mutate:
//! channel events to channel state and foreground voices, master events to
//! the global playback parameters, audio-unit events to device state,
//! general events to the channel's control-flow stack. Note-on is the
//! heavyweight: it resolves the channel's audio unit, allocates a voice
//! group sized by the unit's voice processor count, and initializes every
//! member's per-voice state from the channel.
//!
//! After a successful dispatch the bind table may expand the event into
//! follow-up events on other channels; expansion depth is bounded.

use crate::channel::Channel;
use crate::controls::LinearControls;
use crate::device_state::DeviceStates;
use crate::error::ModuleError;
use crate::events::{
    event_by_name, parse_event_arg, EventCategory, EventType, EventValue, BIND_RECURSION_DEPTH_MAX,
};
use crate::master::MasterParams;
use crate::module::Module;
use crate::processors::VoiceStateData;
use crate::tuning::hz_to_cents;
use crate::voice::{VoicePool, VoicePriority};
use crate::CHANNELS_MAX;

use serde_json::Value;

/// Everything an event application may touch.
pub struct EventContext<'a> {
    pub module: &'a Module,
    pub channels: &'a mut [Channel],
    pub master: &'a mut MasterParams,
    pub voices: &'a mut VoicePool,
    pub dstates: &'a mut DeviceStates,
    pub audio_rate: u32,
    /// Buffer frame at which the event takes effect.
    pub frame_offset: usize,
}

/// Validate and apply one event on a channel, then fire bind expansions.
///
/// Returns an error for an unknown name or a mismatched argument; such
/// events are dropped by the caller.
pub fn trigger_event(
    ctx: &mut EventContext,
    ch_index: usize,
    name: &str,
    arg: &Value,
) -> Result<(), ModuleError> {
    if ch_index >= ctx.channels.len() {
        return Err(ModuleError::argument(format!(
            "channel {} out of range",
            ch_index
        )));
    }

    let (event_type, arg_type) = event_by_name(name)
        .ok_or_else(|| ModuleError::parse(format!("unknown event: {}", name)))?;
    let value = parse_event_arg(arg_type, arg)?;

    // Only general events pass through a disabled branch.
    if event_type.category() != EventCategory::General
        && !ctx.channels[ch_index].general.events_enabled()
    {
        return Ok(());
    }

    apply_event(ctx, ch_index, event_type, &value)?;
    fire_binds(ctx, ch_index, name, &value)
}

fn fire_binds(
    ctx: &mut EventContext,
    ch_index: usize,
    name: &str,
    value: &EventValue,
) -> Result<(), ModuleError> {
    let Some(bind) = &ctx.module.bind else {
        return Ok(());
    };

    let targets: Vec<(i32, String, Value)> = bind
        .expansions(name, value)
        .into_iter()
        .map(|t| (t.ch_offset, t.event_name.clone(), t.arg.clone()))
        .collect();
    if targets.is_empty() {
        return Ok(());
    }

    if ctx.channels[ch_index].general.bind_depth >= BIND_RECURSION_DEPTH_MAX {
        log::warn!("bind expansion depth limit reached at event {}", name);
        return Ok(());
    }
    ctx.channels[ch_index].general.bind_depth += 1;

    let result: Result<(), ModuleError> = (|| {
        for (ch_offset, event_name, arg) in &targets {
            let target_ch =
                (ch_index as i32 + ch_offset).rem_euclid(CHANNELS_MAX as i32) as usize;
            let arg = if arg.as_str() == Some("$") {
                event_value_to_json(value)
            } else {
                arg.clone()
            };
            trigger_event(ctx, target_ch, event_name, &arg)?;
        }
        Ok(())
    })();

    ctx.channels[ch_index].general.bind_depth -= 1;
    result
}

fn event_value_to_json(value: &EventValue) -> Value {
    match value {
        EventValue::None => Value::Null,
        EventValue::Bool(b) => Value::Bool(*b),
        EventValue::Int(i) => serde_json::json!(i),
        EventValue::Float(f) => serde_json::json!(f),
        EventValue::Tstamp(ts) => serde_json::json!([ts.beats(), ts.rem()]),
    }
}

fn apply_event(
    ctx: &mut EventContext,
    ch_index: usize,
    event_type: EventType,
    value: &EventValue,
) -> Result<(), ModuleError> {
    use EventType::*;
    match event_type {
        // ------------------------------------------------------------
        // General
        // ------------------------------------------------------------
        If => {
            if let EventValue::Bool(cond) = value {
                ctx.channels[ch_index].general.begin_if(*cond);
            }
        }
        Else => {
            ctx.channels[ch_index].general.begin_else();
        }
        EndIf => {
            ctx.channels[ch_index].general.end_if();
        }

        // ------------------------------------------------------------
        // Control
        // ------------------------------------------------------------
        Trace => {
            if let EventValue::Bool(on) = value {
                log::debug!("channel {} trace {}", ch_index, on);
            }
        }

        // ------------------------------------------------------------
        // Master
        // ------------------------------------------------------------
        SetTempo => {
            if let EventValue::Float(tempo) = value {
                if *tempo > 0.0 {
                    ctx.master.tempo = *tempo;
                    ctx.master.tempo_slide.cancel();
                    for ch in ctx.channels.iter_mut() {
                        ch.set_tempo(*tempo);
                    }
                }
            }
        }
        SlideTempo => {
            if let EventValue::Float(target) = value {
                if *target > 0.0 {
                    let length = ctx.master.tempo_slide_length;
                    let from = ctx.master.tempo;
                    ctx.master
                        .tempo_slide
                        .start(from, *target, &length, ctx.audio_rate);
                }
            }
        }
        SlideTempoLength => {
            if let EventValue::Tstamp(length) = value {
                ctx.master.tempo_slide_length = *length;
            }
        }
        SetVolume => {
            if let EventValue::Float(db) = value {
                ctx.master.volume_db = *db;
            }
        }
        Jump => {
            if ctx.master.jump_counter > 0 {
                ctx.master.jump_counter -= 1;
                ctx.master.jump_requested = true;
            }
        }
        SetJumpCounter => {
            if let EventValue::Int(count) = value {
                ctx.master.jump_counter = (*count).max(0);
            }
        }
        PatternDelay => {
            if let EventValue::Tstamp(delay) = value {
                ctx.master.pattern_delay_left = *delay;
            }
        }
        SelectTuningTable => {
            if let EventValue::Int(index) = value {
                let index = *index;
                if index >= 0 && ctx.master.tuning_state(index as usize).is_some() {
                    ctx.master.active_tuning = Some(index as usize);
                } else {
                    ctx.master.active_tuning = None;
                }
            }
        }
        Retune => {
            if let EventValue::Int(new_ref) = value {
                let new_ref = *new_ref;
                if let Some(index) = ctx.master.active_tuning {
                    if let Some(tt) = ctx.master.tuning_state_mut(index) {
                        let fixed = tt.ref_note_retuned();
                        if new_ref < 0 || (new_ref as usize) < tt.note_count() {
                            tt.retune(new_ref as i32, fixed);
                        }
                    }
                }
            }
        }

        // ------------------------------------------------------------
        // Au
        // ------------------------------------------------------------
        Bypass => {
            if let EventValue::Bool(on) = value {
                let control = ctx.channels[ch_index].au_input;
                if let Some((_, au)) = ctx.module.au_from_input(control) {
                    ctx.dstates.state_mut(au.device.id()).bypass = *on;
                }
            }
        }

        // ------------------------------------------------------------
        // Channel
        // ------------------------------------------------------------
        NoteOn => {
            if let EventValue::Float(cents) = value {
                note_on(ctx, ch_index, *cents);
            }
        }
        NoteOff => {
            let ch = &mut ctx.channels[ch_index];
            if ch.fg_group_id != 0 {
                ctx.voices.set_group_prio(ch.fg_group_id, VoicePriority::Bg);
                ch.fg_group_id = 0;
            }
        }
        SetForce => {
            if let EventValue::Float(db) = value {
                ctx.channels[ch_index].force_controls.set_value(*db);
                let shift = ctx.module.force_shift;
                for_fg_force(ctx, ch_index, |c| c.set_value(db + shift));
            }
        }
        SlideForce => {
            if let EventValue::Float(db) = value {
                ctx.channels[ch_index].force_controls.slide_target(*db);
                let shift = ctx.module.force_shift;
                for_fg_force(ctx, ch_index, |c| c.slide_target(db + shift));
            }
        }
        SlideForceLength => {
            if let EventValue::Tstamp(length) = value {
                ctx.channels[ch_index].force_controls.slide_length(length);
                for_fg_force(ctx, ch_index, |c| c.slide_length(length));
            }
        }
        TremoloSpeed => {
            if let EventValue::Float(speed) = value {
                if *speed >= 0.0 {
                    ctx.channels[ch_index].force_controls.osc_speed(*speed);
                    for_fg_force(ctx, ch_index, |c| c.osc_speed(*speed));
                }
            }
        }
        TremoloDepth => {
            if let EventValue::Float(depth) = value {
                ctx.channels[ch_index].force_controls.osc_depth(*depth);
                for_fg_force(ctx, ch_index, |c| c.osc_depth(*depth));
            }
        }
        SetPitch => {
            if let EventValue::Float(cents) = value {
                ctx.channels[ch_index].pitch_controls.set_value(*cents);
                for_fg_pitch(ctx, ch_index, |c| c.set_value(*cents));
            }
        }
        SlidePitch => {
            if let EventValue::Float(cents) = value {
                ctx.channels[ch_index].pitch_controls.slide_target(*cents);
                for_fg_pitch(ctx, ch_index, |c| c.slide_target(*cents));
            }
        }
        SlidePitchLength => {
            if let EventValue::Tstamp(length) = value {
                ctx.channels[ch_index].pitch_controls.slide_length(length);
                for_fg_pitch(ctx, ch_index, |c| c.slide_length(length));
            }
        }
        VibratoSpeed => {
            if let EventValue::Float(speed) = value {
                if *speed >= 0.0 {
                    ctx.channels[ch_index].pitch_controls.osc_speed(*speed);
                    for_fg_pitch(ctx, ch_index, |c| c.osc_speed(*speed));
                }
            }
        }
        VibratoDepth => {
            if let EventValue::Float(depth) = value {
                ctx.channels[ch_index].pitch_controls.osc_depth(*depth);
                for_fg_pitch(ctx, ch_index, |c| c.osc_depth(*depth));
            }
        }
        SetPanning => {
            if let EventValue::Float(pan) = value {
                ctx.channels[ch_index].panning_controls.set_value(*pan);
                for_fg_panning(ctx, ch_index, |c| c.set_value(*pan));
            }
        }
        SlidePanning => {
            if let EventValue::Float(pan) = value {
                ctx.channels[ch_index].panning_controls.slide_target(*pan);
                for_fg_panning(ctx, ch_index, |c| c.slide_target(*pan));
            }
        }
        SlidePanningLength => {
            if let EventValue::Tstamp(length) = value {
                ctx.channels[ch_index].panning_controls.slide_length(length);
                for_fg_panning(ctx, ch_index, |c| c.slide_length(length));
            }
        }
        AutowahSpeed => {
            if let EventValue::Float(speed) = value {
                if *speed >= 0.0 {
                    apply_stream_by_name(ctx, ch_index, "autowah", |c| c.osc_speed(*speed));
                }
            }
        }
        AutowahDepth => {
            if let EventValue::Float(depth) = value {
                apply_stream_by_name(ctx, ch_index, "autowah", |c| c.osc_depth(*depth));
            }
        }
        CarryForce => {
            if let EventValue::Bool(on) = value {
                ctx.channels[ch_index].carry_force = *on;
            }
        }
        CarryPitch => {
            if let EventValue::Bool(on) = value {
                ctx.channels[ch_index].carry_pitch = *on;
            }
        }
        CarryStream => {
            if let EventValue::Bool(on) = value {
                ctx.channels[ch_index].carry_stream = *on;
            }
        }
        SetAuInput => {
            if let EventValue::Int(control) = value {
                if (0..crate::CONTROLS_MAX as i64).contains(control) {
                    ctx.channels[ch_index].au_input = *control as usize;
                }
            }
        }
        SelectStream => {
            if let EventValue::Int(index) = value {
                ctx.channels[ch_index].selected_stream = if *index >= 0 {
                    Some(*index as usize)
                } else {
                    None
                };
            }
        }
        SetStreamValue => {
            if let EventValue::Float(v) = value {
                apply_selected_stream(ctx, ch_index, |c| c.set_value(*v));
            }
        }
        SlideStreamValue => {
            if let EventValue::Float(v) = value {
                apply_selected_stream(ctx, ch_index, |c| c.slide_target(*v));
            }
        }
        SlideStreamLength => {
            if let EventValue::Tstamp(length) = value {
                apply_selected_stream(ctx, ch_index, |c| c.slide_length(length));
            }
        }
        StreamOscSpeed => {
            if let EventValue::Float(speed) = value {
                if *speed >= 0.0 {
                    apply_selected_stream(ctx, ch_index, |c| c.osc_speed(*speed));
                }
            }
        }
        StreamOscDepth => {
            if let EventValue::Float(depth) = value {
                apply_selected_stream(ctx, ch_index, |c| c.osc_depth(*depth));
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Note-on
// ----------------------------------------------------------------------

fn note_on(ctx: &mut EventContext, ch_index: usize, cents: f64) {
    let control = ctx.channels[ch_index].au_input;
    let Some((au_index, au)) = ctx.module.au_from_input(control) else {
        return;
    };
    let voice_procs = au.voice_proc_indices();
    if voice_procs.is_empty() {
        return;
    }

    // Pitch through the active tuning, snapping to the nearest note.
    let pitch_cents = match ctx.master.active_tuning_state() {
        Some(tt) => hz_to_cents(tt.pitch_from_cents(cents)),
        None => cents,
    };

    // The previous note of this channel moves to the background.
    if ctx.channels[ch_index].fg_group_id != 0 {
        let old = ctx.channels[ch_index].fg_group_id;
        ctx.voices.set_group_prio(old, VoicePriority::Bg);
        ctx.channels[ch_index].fg_group_id = 0;
    }

    let ch = &mut ctx.channels[ch_index];
    if ch.carry_pitch {
        ch.pitch_controls.slide_target(pitch_cents);
    } else {
        ch.pitch_controls.set_value(pitch_cents);
    }

    let group_id = ctx.voices.new_group_id();
    let mut allocated_any = false;

    for proc_index in voice_procs {
        let Some(proc) = au.proc(proc_index) else {
            continue;
        };
        let Some(imp) = proc.imp() else { continue };
        let Some(voice_index) = ctx.voices.get_voice(group_id) else {
            break;
        };
        allocated_any = true;

        let mut state = imp.init_vstate();
        init_voice_state(ctx, ch_index, au, proc_index, &mut state);

        let ch = &mut ctx.channels[ch_index];
        let voice_rng = ch.rng.fork(group_id);
        let voice = ctx.voices.voice_mut(voice_index);
        voice.init(
            ch_index,
            au_index,
            proc_index,
            state,
            voice_rng,
            ctx.frame_offset,
        );
    }

    if allocated_any {
        ctx.channels[ch_index].fg_group_id = group_id;
    }
}

/// Populate a fresh per-voice state from the channel, honoring carry
/// flags.
fn init_voice_state(
    ctx: &mut EventContext,
    ch_index: usize,
    au: &crate::audio_unit::AudioUnit,
    proc_index: usize,
    state: &mut VoiceStateData,
) {
    let shift = ctx.module.force_shift;
    let audio_rate = ctx.audio_rate;
    let ch = &mut ctx.channels[ch_index];

    match state {
        VoiceStateData::Force(fs) => {
            if ch.carry_force {
                fs.controls = ch.force_controls.clone();
            } else {
                let mut controls = LinearControls::new();
                controls.set_audio_rate(audio_rate);
                controls.set_tempo(ch.tempo());
                controls.set_value(ch.force_controls.value());
                fs.controls = controls;
            }
            if shift != 0.0 {
                // The global force shift lands in the voice, not in the
                // channel state.
                let value = fs.controls.value() + shift;
                fs.controls.set_value(value);
            }
        }
        VoiceStateData::Pitch(ps) => {
            ps.controls = ch.pitch_controls.clone();
            if !ch.carry_pitch {
                let cents = ch.pitch_controls.value();
                let mut controls = LinearControls::new();
                controls.set_audio_rate(audio_rate);
                controls.set_tempo(ch.tempo());
                controls.set_value(cents);
                ps.controls = controls;
            }
        }
        VoiceStateData::Panning(ps) => {
            ps.controls = ch.panning_controls.clone();
        }
        VoiceStateData::Stream(ss) => {
            if let Some(entry) = au.streams().iter().find(|s| s.proc_index == proc_index) {
                let init_value = stream_init_value(au, proc_index);
                if ch.carry_stream {
                    let slot = ch.streams.entry(&entry.name, init_value, audio_rate);
                    ss.controls = slot.controls.clone();
                } else {
                    ch.streams.reset_value(&entry.name, init_value, audio_rate);
                    ss.controls.set_audio_rate(audio_rate);
                    ss.controls.set_value(init_value);
                }
            }
        }
        _ => {}
    }
}

fn stream_init_value(au: &crate::audio_unit::AudioUnit, proc_index: usize) -> f64 {
    au.proc(proc_index)
        .and_then(|p| p.params.get_f64("p_f_init_value.json"))
        .unwrap_or(0.0)
}

// ----------------------------------------------------------------------
// Foreground-voice propagation
// ----------------------------------------------------------------------

fn for_fg_force(
    ctx: &mut EventContext,
    ch_index: usize,
    f: impl Fn(&mut LinearControls),
) {
    let group = ctx.channels[ch_index].fg_group_id;
    if group == 0 {
        return;
    }
    for voice in ctx.voices.voices_mut() {
        if voice.group_id() == group {
            if let Some(fs) = voice.state.as_force_mut() {
                f(&mut fs.controls);
            }
        }
    }
}

fn for_fg_pitch(
    ctx: &mut EventContext,
    ch_index: usize,
    f: impl Fn(&mut LinearControls),
) {
    let group = ctx.channels[ch_index].fg_group_id;
    if group == 0 {
        return;
    }
    for voice in ctx.voices.voices_mut() {
        if voice.group_id() == group {
            if let Some(ps) = voice.state.as_pitch_mut() {
                f(&mut ps.controls);
            }
        }
    }
}

fn for_fg_panning(
    ctx: &mut EventContext,
    ch_index: usize,
    f: impl Fn(&mut LinearControls),
) {
    let group = ctx.channels[ch_index].fg_group_id;
    if group == 0 {
        return;
    }
    for voice in ctx.voices.voices_mut() {
        if voice.group_id() == group {
            if let Some(ps) = voice.state.as_panning_mut() {
                f(&mut ps.controls);
            }
        }
    }
}

/// Apply a mutation to the stream selected by `.sn`, both in the channel
/// dictionary and in the matching foreground voice.
fn apply_selected_stream(
    ctx: &mut EventContext,
    ch_index: usize,
    f: impl Fn(&mut LinearControls),
) {
    let Some(stream_index) = ctx.channels[ch_index].selected_stream else {
        return;
    };
    let control = ctx.channels[ch_index].au_input;
    let Some((_, au)) = ctx.module.au_from_input(control) else {
        return;
    };
    let Some(entry) = au.stream(stream_index) else {
        log::warn!(
            "channel {} selected stream {} is not declared",
            ch_index,
            stream_index
        );
        return;
    };
    let name = entry.name.clone();
    let proc_index = entry.proc_index;
    let init_value = stream_init_value(au, proc_index);
    apply_stream(ctx, ch_index, &name, proc_index, init_value, f);
}

/// Apply a mutation to a stream addressed by name, if the audio unit
/// declares it.
fn apply_stream_by_name(
    ctx: &mut EventContext,
    ch_index: usize,
    name: &str,
    f: impl Fn(&mut LinearControls),
) {
    let control = ctx.channels[ch_index].au_input;
    let Some((_, au)) = ctx.module.au_from_input(control) else {
        return;
    };
    let Some(entry) = au.streams().iter().find(|s| s.name == name) else {
        return;
    };
    let proc_index = entry.proc_index;
    let init_value = stream_init_value(au, proc_index);
    apply_stream(ctx, ch_index, name, proc_index, init_value, f);
}

fn apply_stream(
    ctx: &mut EventContext,
    ch_index: usize,
    name: &str,
    proc_index: usize,
    init_value: f64,
    f: impl Fn(&mut LinearControls),
) {
    let audio_rate = ctx.audio_rate;
    {
        let ch = &mut ctx.channels[ch_index];
        let slot = ch.streams.entry(name, init_value, audio_rate);
        f(&mut slot.controls);
    }

    let group = ctx.channels[ch_index].fg_group_id;
    if group == 0 {
        return;
    }
    for voice in ctx.voices.voices_mut() {
        if voice.group_id() == group && voice.proc_index == proc_index {
            if let Some(ss) = voice.state.as_stream_mut() {
                f(&mut ss.controls);
            }
        }
    }
}
