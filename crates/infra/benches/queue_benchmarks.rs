use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use procrastinate_core::{JobStatus, NewJob};
use procrastinate_infra::{Connector, InMemoryConnector, JobManager};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn manager(rt: &Runtime) -> JobManager {
    let connector = Arc::new(InMemoryConnector::new());
    rt.block_on(connector.open()).unwrap();
    JobManager::new(connector)
}

fn bench_defer_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("defer_throughput");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let manager = manager(&rt);
                let job = NewJob::new("sum").with_arg("a", 1).with_arg("b", 2);
                b.to_async(&rt).iter(|| {
                    let (manager, job) = (manager.clone(), job.clone());
                    async move {
                        for _ in 0..batch_size {
                            black_box(manager.defer_job(&job).await.unwrap());
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_job_lifecycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_lifecycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("defer_fetch_finish", |b| {
        let manager = manager(&rt);
        b.to_async(&rt).iter(|| {
            let manager = manager.clone();
            async move {
                manager.defer_job(&NewJob::new("sum")).await.unwrap();
                let job = manager.fetch_job(None, None).await.unwrap().unwrap();
                manager
                    .finish_job(&job, JobStatus::Succeeded, true)
                    .await
                    .unwrap();
            }
        });
    });

    group.bench_function("defer_with_lock_contention", |b| {
        let manager = manager(&rt);
        b.to_async(&rt).iter(|| {
            let manager = manager.clone();
            async move {
                for _ in 0..10 {
                    manager
                        .defer_job(&NewJob::new("sum").with_lock("shared"))
                        .await
                        .unwrap();
                }
                while let Some(job) = manager.fetch_job(None, None).await.unwrap() {
                    manager
                        .finish_job(&job, JobStatus::Succeeded, true)
                        .await
                        .unwrap();
                }
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_defer_throughput, bench_job_lifecycle);
criterion_main!(benches);
