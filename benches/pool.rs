use criterion::*;

use taskwell::{TaskPack, TaskPool, WaitMode};

fn criterion_benchmark(c: &mut Criterion) {
    let threads = num_cpus::get().max(1);

    let tasks = 1000;

    let mut group = c.benchmark_group("pool");
    group.sample_size(10);

    group.bench_function("taskwell", |b| {
        b.iter_batched(
            || TaskPool::with_size(threads).unwrap(),
            |pool| {
                let mut pack = TaskPack::new(tasks, WaitMode::Blocking);

                for i in 0..tasks {
                    pack.set_task_at(i, || {
                        let _ = black_box(8 + 9);
                    });
                }

                for task in pack.take_tasks() {
                    pool.submit(task);
                }

                pack.wait();
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("taskwell_bulk", |b| {
        b.iter_batched(
            || TaskPool::with_size(threads).unwrap(),
            |pool| {
                let mut pack = TaskPack::new(tasks, WaitMode::Blocking);

                for i in 0..tasks {
                    pack.set_task_at(i, || {
                        let _ = black_box(8 + 9);
                    });
                }

                pool.submit_bulk(pack.take_tasks());
                pack.wait();
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("taskwell_token_bulk", |b| {
        b.iter_batched(
            || {
                let pool = TaskPool::with_size(threads).unwrap();
                let token = pool.producer_token();
                (pool, token)
            },
            |(pool, token)| {
                let mut pack = TaskPack::new(tasks, WaitMode::Blocking);

                for i in 0..tasks {
                    pack.set_task_at(i, || {
                        let _ = black_box(8 + 9);
                    });
                }

                pool.submit_bulk_with(&token, pack.take_tasks());
                pack.wait();
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("threadpool", |b| {
        b.iter_batched(
            || threadpool::ThreadPool::new(threads),
            |pool| {
                for _ in 0..tasks {
                    pool.execute(|| {
                        let _ = black_box(8 + 9);
                    });
                }

                pool.join();
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("rusty_pool", |b| {
        b.iter_batched(
            || rusty_pool::ThreadPool::new(threads, threads, std::time::Duration::ZERO),
            |pool| {
                for _ in 0..tasks {
                    pool.execute(|| {
                        let _ = black_box(8 + 9);
                    });
                }

                pool.shutdown_join();
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
