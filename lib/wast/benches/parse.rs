use breakwater_types::Features;
use breakwater_wast::parse_test_commands;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_parse_script(c: &mut Criterion) {
    let mut source = String::new();
    source.push_str("(module $m (memory (export \"mem\") 1)\n");
    for i in 0..100 {
        source.push_str(&format!(
            "  (func (export \"f{i}\") (param i32) (result i32) local.get 0 i32.const {i} i32.add)\n"
        ));
    }
    source.push_str(")\n");
    for i in 0..100 {
        source.push_str(&format!(
            "(assert_return (invoke \"f{i}\" (i32.const 1)) (i32.const {}))\n",
            i + 1
        ));
    }

    c.bench_function("parse_test_commands", |b| {
        b.iter(|| {
            let (commands, errors) =
                parse_test_commands(black_box(&source), &Features::default());
            assert!(errors.is_empty());
            commands
        })
    });
}

criterion_group!(benches, bench_parse_script);
criterion_main!(benches);
