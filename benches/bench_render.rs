#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    reason = "benchmark"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use kiln::{Environment, MemoryLoader};

mod utils;

fn environment(optimize: bool) -> Environment {
    let loader = MemoryLoader::new()
        .with("base.html", include_str!("template_base.html"))
        .with("macros.html", include_str!("template_macros.html"))
        .with("page.html", include_str!("template_page.html"));
    Environment::builder()
        .optimize(optimize)
        .autoescape(true)
        .trim_blocks(true)
        .auto_reload(false)
        .loader(loader)
        .build()
}

fn render_benchmark(c: &mut Criterion) {
    let contexts = utils::generate_random_contexts(100);

    let mut group = c.benchmark_group("Template Rendering");
    group.sample_size(50);

    for (label, optimize) in [("render_optimized", true), ("render_unoptimized", false)] {
        let env = environment(optimize);
        let template = env.get_template("page.html").unwrap();
        group.bench_function(label, |b| {
            b.iter(|| {
                for context in &contexts {
                    black_box(template.render(context).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn compile_benchmark(c: &mut Criterion) {
    let source = include_str!("template_page.html");
    let mut group = c.benchmark_group("Template Compilation");

    group.bench_function("compile", |b| {
        let env = environment(true);
        b.iter(|| {
            env.clear_cache();
            black_box(env.add_template("page.html", source).unwrap());
        });
    });

    group.bench_function("analyze", |b| {
        let env = environment(true);
        b.iter(|| {
            // Metadata is memoized per template, so each iteration compiles afresh.
            let template = env.add_template("page.html", source).unwrap();
            black_box(template.block_metadata().len());
        });
    });

    group.finish();
}

criterion_group!(benches, render_benchmark, compile_benchmark);
criterion_main!(benches);
