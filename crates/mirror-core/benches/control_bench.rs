//! Criterion benchmarks for control-event parsing and decoding.
//!
//! Every touch the controller sends goes through `parse_control_payload`
//! and `decode_control_event` on the data-channel callback, so both must stay
//! well under a millisecond.
//!
//! Run with:
//! ```bash
//! cargo bench --package mirror-core --bench control_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mirror_core::protocol::control::{
    decode_control_event, parse_control_payload, GestureTimings,
};
use mirror_core::protocol::messages::parse_inbound;

// ── Payload fixtures ──────────────────────────────────────────────────────────

const TAP: &[u8] = br#"{"type":"click","x":540.5,"y":1200.25,"timestamp":1700000000000}"#;
const LONG_PRESS: &[u8] = br#"{"type":"long_click","x":540,"y":1200,"timestamp":1700000000000}"#;
const SWIPE: &[u8] =
    br#"{"type":"swipe","x":540,"y":1600,"endX":540,"endY":400,"duration":300,"timestamp":1}"#;
const BACK_KEY: &[u8] = br#"{"type":"click","x":-1,"y":-1,"timestamp":1}"#;

fn bench_parse_and_decode(c: &mut Criterion) {
    let timings = GestureTimings::default();
    let mut group = c.benchmark_group("control_decode");

    for (name, payload) in [
        ("tap", TAP),
        ("long_press", LONG_PRESS),
        ("swipe", SWIPE),
        ("back_key", BACK_KEY),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &payload, |b, payload| {
            b.iter(|| {
                let event = parse_control_payload(black_box(payload)).expect("valid payload");
                decode_control_event(&event, &timings).expect("decodable event")
            })
        });
    }

    group.finish();
}

fn bench_signaling_parse(c: &mut Criterion) {
    let candidate = r#"{"type":"ice_candidate","candidate":"candidate:842163049 1 udp 1677729535 192.168.1.20 53912 typ srflx raddr 0.0.0.0 rport 0 generation 0","sdpMid":"0","sdpMLineIndex":0}"#;
    c.bench_function("parse_inbound_ice_candidate", |b| {
        b.iter(|| parse_inbound(black_box(candidate)).expect("valid message"))
    });
}

criterion_group!(benches, bench_parse_and_decode, bench_signaling_parse);
criterion_main!(benches);
