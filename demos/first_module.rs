//! First Module
//!
//! Builds a small module through the key/value API, plays a short chord
//! progression and prints level measurements of the rendered audio.
//!
//! Run with: `cargo run --example first_module`

use hocket::prelude::*;
use serde_json::json;

fn set(handle: &mut Handle, key: &str, payload: serde_json::Value) {
    let data = serde_json::to_vec(&json!([0, payload])).expect("payload encodes");
    handle
        .set_data(key, &data)
        .unwrap_or_else(|e| panic!("{}: {}", key, e));
}

fn main() {
    let mut handle = Handle::new();

    // A sine instrument: pitch and force processors feed the generator.
    set(&mut handle, "au_00/p_manifest.json", json!({"type": "instrument"}));
    set(&mut handle, "au_00/out_00/p_manifest.json", json!({}));
    set(&mut handle, "au_00/proc_00/p_manifest.json", json!({"type": "pitch"}));
    set(&mut handle, "au_00/proc_01/p_manifest.json", json!({"type": "force"}));
    set(&mut handle, "au_00/proc_02/p_manifest.json", json!({"type": "add"}));
    set(
        &mut handle,
        "au_00/p_connections.json",
        json!([
            ["proc_00/out_00", "proc_02/in_00"],
            ["proc_01/out_00", "proc_02/in_01"],
            ["proc_02/out_00", "out_00"],
        ]),
    );
    set(&mut handle, "p_control_map.json", json!([[0, 0]]));
    set(&mut handle, "p_connections.json", json!([["au_00/out_00", "out_00"]]));

    // An album with one empty four-beat pattern per pass.
    set(&mut handle, "album/p_manifest.json", json!({}));
    set(&mut handle, "album/p_tracks.json", json!([0]));
    set(&mut handle, "song_00/p_manifest.json", json!({}));
    set(&mut handle, "song_00/p_order_list.json", json!([[0, 0]]));
    set(&mut handle, "song_00/p_tempo.json", json!(120.0));
    set(&mut handle, "pat_000/p_manifest.json", json!({}));
    set(&mut handle, "pat_000/p_length.json", json!([4, 0]));
    set(&mut handle, "pat_000/instance_000/p_manifest.json", json!({}));

    let mut player = handle
        .into_player(48000, 2048, 64, 32)
        .expect("module validates");
    player.reset(0);

    // A minor chord, one note per channel, in cents above 440 Hz.
    for (channel, cents) in [(0, 0.0), (1, 300.0), (2, 700.0)] {
        player.fire(channel, &json!([".f", -9.0]));
        player.fire(channel, &json!(["n+", cents]));
    }

    let mut peak: f32 = 0.0;
    let mut sum_sq = 0.0f64;
    let mut frames = 0usize;
    while frames < 48000 && !player.has_stopped() {
        player.play(2048);
        let rendered = player.frames_available();
        if rendered == 0 {
            break;
        }
        for &s in player.get_audio(0) {
            peak = peak.max(s.abs());
            sum_sq += f64::from(s) * f64::from(s);
        }
        frames += rendered;
    }

    let rms = (sum_sq / frames.max(1) as f64).sqrt();
    println!("rendered {} frames", frames);
    println!("peak: {:.4}", peak);
    println!("rms:  {:.4}", rms);
    println!("time: {} ns", player.nanoseconds());
}
