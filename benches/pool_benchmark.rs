use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use generic_objectpool::{
    BoxError, GenericKeyedObjectPool, GenericObjectPool, KeyedPoolConfig, KeyedPooledObjectFactory, PoolConfig,
    PooledObjectFactory,
};
use std::thread;

struct Blocks;

impl PooledObjectFactory<Vec<u8>> for Blocks {
    fn make_object(&self) -> Result<Vec<u8>, BoxError> {
        Ok(vec![0; 1024])
    }
}

impl KeyedPooledObjectFactory<u32, Vec<u8>> for Blocks {
    fn make_object(&self, key: &u32) -> Result<Vec<u8>, BoxError> {
        Ok(vec![0; *key as usize])
    }
}

fn bench_borrow_return(c: &mut Criterion) {
    let mut group = c.benchmark_group("borrow_return");

    let pool = GenericObjectPool::new(Blocks, PoolConfig::new().with_max_total(16));
    group.bench_function("explicit", |b| {
        b.iter(|| {
            let obj = pool.borrow_object().unwrap();
            black_box(obj.len());
            pool.return_object(obj).unwrap();
        })
    });

    group.bench_function("lease", |b| {
        b.iter(|| {
            let obj = pool.lease().unwrap();
            black_box(obj.len());
        })
    });

    let fifo = GenericObjectPool::new(Blocks, PoolConfig::new().with_max_total(16).with_lifo(false));
    group.bench_function("lease_fifo", |b| {
        b.iter(|| {
            let obj = fifo.lease().unwrap();
            black_box(obj.len());
        })
    });

    group.finish();
}

fn bench_keyed(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyed");

    for keys in [1u32, 8, 64] {
        let pool = GenericKeyedObjectPool::new(Blocks, KeyedPoolConfig::new().with_max_total_per_key(4));
        group.bench_with_input(BenchmarkId::new("lease", keys), &keys, |b, &keys| {
            let mut next = 0;
            b.iter(|| {
                next = (next + 1) % keys;
                let key = 256 + next;
                let obj = pool.lease(&key).unwrap();
                black_box(obj.len());
            })
        });
    }

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");

    for threads in [2usize, 4, 8] {
        let pool = GenericObjectPool::new(Blocks, PoolConfig::new().with_max_total(4));
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            b.iter(|| {
                thread::scope(|s| {
                    for _ in 0..threads {
                        s.spawn(|| {
                            for _ in 0..100 {
                                let obj = pool.lease().unwrap();
                                black_box(obj.len());
                            }
                        });
                    }
                });
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_borrow_return, bench_keyed, bench_contended);
criterion_main!(benches);
