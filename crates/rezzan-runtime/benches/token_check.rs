//! Throughput of the hot path: token tests and range checks over clean
//! memory, which is what every intercepted copy pays per word.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use rezzan_runtime::check::find_violation;
use rezzan_runtime::config::TokenMode;
use rezzan_runtime::{nonce, token};

fn bench_token_test(c: &mut Criterion) {
    nonce::init(TokenMode::Precise61).expect("nonce init");
    let words = vec![0u64; 1024];

    c.bench_function("test_token61_per_word", |b| {
        b.iter(|| {
            let mut hits = 0u32;
            for word in &words {
                // SAFETY: aligned live slot borrowed from the vec.
                if unsafe { token::test_token61(black_box(word as *const u64)) } {
                    hits += 1;
                }
            }
            hits
        });
    });

    c.bench_function("test_token64_per_word", |b| {
        b.iter(|| {
            let mut hits = 0u32;
            for word in &words {
                // SAFETY: aligned live slot borrowed from the vec.
                if unsafe { token::test_token64(black_box(word as *const u64)) } {
                    hits += 1;
                }
            }
            hits
        });
    });
}

fn bench_range_check(c: &mut Criterion) {
    nonce::init(TokenMode::Precise61).expect("nonce init");
    let buffer = vec![0u8; 64 * 1024];
    let base = buffer.as_ptr() as usize;

    let mut group = c.benchmark_group("check_range_clean");
    for len in [16usize, 256, 4096] {
        group.bench_function(format!("{len}B"), |b| {
            b.iter(|| find_violation(black_box(base), black_box(len), TokenMode::Precise61));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_token_test, bench_range_check);
criterion_main!(benches);
