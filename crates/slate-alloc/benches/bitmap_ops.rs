use criterion::{Criterion, black_box, criterion_group, criterion_main};
use slate_alloc::FreeBlockView;
use slate_types::BlockNo;

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let view = FreeBlockView::new(1 << 20);
    for b in 0..(1_u32 << 16) {
        view.seed_free(BlockNo(b));
    }

    c.bench_function("free_view_alloc_free", |b| {
        b.iter(|| {
            let bno = view.alloc().expect("seeded view");
            view.free(black_box(bno));
        });
    });
}

fn bench_seed(c: &mut Criterion) {
    c.bench_function("free_view_seed_64k", |b| {
        b.iter(|| {
            let view = FreeBlockView::new(1 << 16);
            for bno in 0..(1_u32 << 16) {
                view.seed_free(BlockNo(bno));
            }
            black_box(view.free_count())
        });
    });
}

criterion_group!(benches, bench_alloc_free_cycle, bench_seed);
criterion_main!(benches);
