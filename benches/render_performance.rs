//! Render Performance Benchmarks
//!
//! Validates that the engine meets real-time rendering requirements at
//! various buffer sizes and polyphony levels. For real-time audio, a
//! buffer of samples must be produced before the next buffer is due:
//!
//! ```text
//! time_budget = buffer_size / audio_rate
//! ```
//!
//! | Audio Rate | Buffer 64 | Buffer 256 | Buffer 1024 |
//! |------------|-----------|------------|-------------|
//! | 48 kHz     | 1.33 ms   | 5.33 ms    | 21.33 ms    |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hocket::module::Module;
use hocket::player::Player;
use hocket::sheet::TrackList;
use hocket::tstamp::Tstamp;
use serde_json::json;
use std::sync::Arc;

const BUFFER_SIZES: [usize; 3] = [64, 256, 1024];
const NOTE_COUNTS: [usize; 4] = [1, 4, 8, 16];

/// One sine instrument with force and pitch processors, plus a long empty
/// pattern to render through.
fn sine_module() -> Arc<Module> {
    let mut module = Module::new();
    {
        let au = module.au_table.ensure(0).unwrap();
        au.device.set_existent(true);
        au.device
            .set_port_count(hocket::device::PortType::Send, 1);
        au.ensure_proc(0).unwrap().set_type("pitch").unwrap();
        au.ensure_proc(1).unwrap().set_type("force").unwrap();
        au.ensure_proc(2).unwrap().set_type("add").unwrap();
        au.set_raw_connections(json!([
            ["proc_00/out_00", "proc_02/in_00"],
            ["proc_01/out_00", "proc_02/in_01"],
            ["proc_02/out_00", "out_00"],
        ]));
    }
    module
        .set_control_map_from_json(&json!([[0, 0]]))
        .unwrap();
    module.set_raw_connections(json!([["au_00/out_00", "out_00"]]));

    {
        let pat = module.ensure_pattern(0).unwrap();
        pat.set_instance_existent(0, true);
        pat.set_length(Tstamp::new(1024, 0));
    }
    module
        .ensure_song(0)
        .unwrap()
        .set_order_list_from_json(&json!([[0, 0]]))
        .unwrap();
    module.track_list = Some(TrackList::from_json(&json!([0])).unwrap());

    module.validate().unwrap();
    Arc::new(module)
}

fn player_with_notes(module: &Arc<Module>, buffer_size: usize, notes: usize) -> Player {
    let mut player = Player::new(Arc::clone(module), 48000, buffer_size, 64, 64).unwrap();
    player.reset(0);
    for ch in 0..notes {
        player.fire(ch, &json!(["n+", (ch as f64) * 100.0]));
    }
    player
}

fn bench_buffer_sizes(c: &mut Criterion) {
    let module = sine_module();
    let mut group = c.benchmark_group("render_buffer_sizes");

    for &size in &BUFFER_SIZES {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut player = player_with_notes(&module, size, 4);
            b.iter(|| {
                player.play(size);
                black_box(player.get_audio(0));
            });
        });
    }
    group.finish();
}

fn bench_polyphony(c: &mut Criterion) {
    let module = sine_module();
    let mut group = c.benchmark_group("render_polyphony");

    for &notes in &NOTE_COUNTS {
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::from_parameter(notes), &notes, |b, &notes| {
            let mut player = player_with_notes(&module, 256, notes);
            b.iter(|| {
                player.play(256);
                black_box(player.get_audio(0));
            });
        });
    }
    group.finish();
}

fn bench_skip(c: &mut Criterion) {
    let module = sine_module();
    c.bench_function("skip_one_second", |b| {
        b.iter(|| {
            let mut player = Player::new(Arc::clone(&module), 48000, 1024, 64, 64).unwrap();
            player.reset(0);
            player.skip(black_box(48000));
        });
    });
}

criterion_group!(benches, bench_buffer_sizes, bench_polyphony, bench_skip);
criterion_main!(benches);
