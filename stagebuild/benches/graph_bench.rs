//! Benchmarks for stage graph validation and planning.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stagebuild::declaration::{BaseRef, Instruction};
use stagebuild::pipeline::{PipelineBuilder, StageSpec};

/// A base stage, `width` builders copying into one runner.
fn fan_in(width: usize) -> Vec<StageSpec> {
    let mut specs = vec![StageSpec::new("base", BaseRef::Image("debian:slim".into()))];
    for i in 0..width {
        specs.push(
            StageSpec::new(format!("builder-{i}"), BaseRef::Stage("base".into()))
                .with_output(format!("/out/{i}"))
                .with_step(Instruction::Run {
                    command: format!("make -C /src/{i}"),
                }),
        );
    }
    let mut runner = StageSpec::new("runner", BaseRef::Stage("base".into()));
    for i in 0..width {
        runner = runner.with_step(Instruction::CopyFrom {
            stage: format!("builder-{i}"),
            src: format!("/out/{i}").into(),
            dest: format!("/app/{i}").into(),
        });
    }
    specs.push(runner);
    specs
}

fn graph_benchmark(c: &mut Criterion) {
    let specs = fan_in(64);

    c.bench_function("validate_fan_in_64", |b| {
        b.iter(|| {
            let mut builder = PipelineBuilder::new("bench");
            for spec in &specs {
                builder.add_stage_spec(spec.clone()).unwrap();
            }
            black_box(builder.build().unwrap())
        });
    });

    let mut builder = PipelineBuilder::new("bench");
    for spec in &specs {
        builder.add_stage_spec(spec.clone()).unwrap();
    }
    let graph = builder.build().unwrap();

    c.bench_function("plan_fan_in_64", |b| b.iter(|| black_box(graph.plan())));
}

criterion_group!(benches, graph_benchmark);
criterion_main!(benches);
