use criterion::{black_box, criterion_group, criterion_main, Criterion};
use marlin_cluster::timer_wheel::TimerWheel;
use marlin_cluster::types::CorrelationId;

fn bench_schedule_cancel(c: &mut Criterion) {
    c.bench_function("timer_wheel_schedule_cancel", |b| {
        let mut wheel = TimerWheel::new(8, 1024);
        let mut next = 0i64;
        b.iter(|| {
            next += 1;
            let correlation = CorrelationId(next);
            wheel.schedule(correlation, black_box((next as u64) * 8 + 10_000));
            wheel.cancel(correlation);
        });
    });
}

fn bench_poll_expiring(c: &mut Criterion) {
    c.bench_function("timer_wheel_poll_1k_due", |b| {
        b.iter_with_setup(
            || {
                let mut wheel = TimerWheel::new(8, 1024);
                for i in 0..1_000 {
                    wheel.schedule(CorrelationId(i), (i as u64 % 512) * 8);
                }
                wheel
            },
            |mut wheel| {
                let expired = wheel.poll(1 << 16, |correlation| {
                    black_box(correlation);
                    true
                });
                black_box(expired);
            },
        );
    });
}

criterion_group!(benches, bench_schedule_cancel, bench_poll_expiring);
criterion_main!(benches);
