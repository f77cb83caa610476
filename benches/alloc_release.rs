use criterion::{criterion_group, criterion_main, Criterion};
use handle_pool::{DynamicManager32, FixedManager32};

pub fn criterion_benchmark(c: &mut Criterion) {
	c.bench_function("fixed32_alloc_release", |b| {
		let pool = FixedManager32::new(32, 4096).unwrap();
		b.iter(|| {
			let h = pool.alloc();
			pool.release(h);
		});
	});

	c.bench_function("dynamic32_alloc_release", |b| {
		let pool = DynamicManager32::new(32, 1024, 64, false).unwrap();
		b.iter(|| {
			let h = pool.alloc();
			pool.release(h);
		});
	});

	c.bench_function("fixed32_sustained_alloc", |b| {
		let pool = FixedManager32::new(32, 1 << 16).unwrap();
		let mut held = Vec::new();
		b.iter(|| {
			held.push(pool.alloc());
			if held.len() == (1 << 16) {
				for h in held.drain(..) {
					pool.release(h);
				}
			}
		});
	});
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
