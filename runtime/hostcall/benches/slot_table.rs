//! Slot table benchmarks: inline slot lifecycle and a threaded call round trip
use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use kaal_hostcall::{
    Backpressure, CallPacket, Caller, Dispatcher, HostcallConfig, ServiceId, ServiceRegistry,
    SlotTable,
};

fn inline_lifecycle(c: &mut Criterion) {
    let table = Arc::new(SlotTable::new(1024).unwrap());
    let dispatcher = Dispatcher::new(table.clone(), ServiceRegistry::new());
    let packet = CallPacket::new(ServiceId::Default, [0; 8]);

    c.bench_function("acquire-submit-poll-release", |b| {
        b.iter(|| {
            let mut handle = table.acquire().unwrap();
            handle.submit(black_box(&packet)).unwrap();
            dispatcher.poll_once();
            black_box(handle.try_reply().unwrap());
            table.release(handle).unwrap();
        })
    });
}

fn round_trip(c: &mut Criterion) {
    let table = Arc::new(SlotTable::new(64).unwrap());
    let config = HostcallConfig {
        workers: 0,
        ..HostcallConfig::default()
    };
    let running = Dispatcher::new(table.clone(), ServiceRegistry::new())
        .spawn(&config)
        .unwrap();
    let caller = Caller::new(table, Backpressure::Unbounded);
    let packet = CallPacket::new(ServiceId::Default, [0; 8]);

    c.bench_function("call-round-trip", |b| {
        b.iter(|| black_box(caller.call_raw(black_box(&packet)).unwrap()))
    });
    running.shutdown();
}

criterion_group!(benches, inline_lifecycle, round_trip);
criterion_main!(benches);
