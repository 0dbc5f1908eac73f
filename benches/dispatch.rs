use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fiberjob::{JobHandle, JobInfo, Manager};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn spread(c: &mut Criterion) {
    let manager = Manager::builder().with_worker_threads(4).build();
    let counter = Arc::new(AtomicU32::new(0));

    let mut group = c.benchmark_group("spread");
    for num_jobs in [16u32, 256, 2048] {
        group.bench_with_input(BenchmarkId::from_parameter(num_jobs), &num_jobs, |b, &num_jobs| {
            b.iter(|| {
                let gate = manager.allocate_handle().unwrap();
                let mut handle = gate;
                for _ in 0..num_jobs {
                    let counter = Arc::clone(&counter);
                    manager.run(JobInfo::new(move || { counter.fetch_add(1, Ordering::Relaxed); }), Some(&mut handle)).unwrap();
                }
                manager.dec_handle(gate);
                manager.wait(handle);
            });
        });
    }
    group.finish();

    manager.uninitialize();
}

fn chain(c: &mut Criterion) {
    let manager = Manager::builder().with_worker_threads(4).build();

    c.bench_function("chain 256", |b| {
        b.iter(|| {
            let mut previous = JobHandle::INVALID;
            for _ in 0..256 {
                let mut handle = JobHandle::INVALID;
                manager.run_ex(|| {}, Some(&mut handle), previous).unwrap();
                previous = handle;
            }
            manager.wait(previous);
        });
    });

    manager.uninitialize();
}

fn nested_wait(c: &mut Criterion) {
    let manager = Manager::builder().with_worker_threads(4).build();

    c.bench_function("nested wait 64x8", |b| {
        b.iter(|| {
            let gate = manager.allocate_handle().unwrap();
            let mut root = gate;
            for _ in 0..64 {
                let m = manager.clone();
                manager.run(JobInfo::new(move || {
                    let mut children = JobHandle::INVALID;
                    for _ in 0..8 {
                        m.run(JobInfo::new(|| {}), Some(&mut children)).unwrap();
                    }
                    m.wait(children);
                }), Some(&mut root)).unwrap();
            }
            manager.dec_handle(gate);
            manager.wait(root);
        });
    });

    manager.uninitialize();
}

criterion_group!(benches, spread, chain, nested_wait);
criterion_main!(benches);
