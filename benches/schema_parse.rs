use criterion::{criterion_group, criterion_main, Criterion};

use kaitai_rt::expr::ExprCache;
use kaitai_rt::schema::def::{FieldDef, MetaDef, SchemaDef, TypeRefDef};
use kaitai_rt::schema::Schema;
use kaitai_rt::stream::Reader;
use kaitai_rt::{parse_with_cache, serialize_with_cache};

/// A flat record of `field_count` little-endian `u2` fields — the
/// schema-driven-interpreter analogue of the teacher's fixed-width
/// bit-fragment benchmark, sized the same way (one fragment/field per
/// 16 bits) so the two remain comparable in spirit.
fn gen_schema(field_count: usize) -> Schema {
    let seq = (0..field_count)
        .map(|i| FieldDef {
            id: format!("f{i}"),
            type_ref: Some(TypeRefDef::Name("u2le".to_string())),
            ..Default::default()
        })
        .collect();
    let def = SchemaDef {
        meta: MetaDef {
            id: "bench".to_string(),
            ..Default::default()
        },
        seq,
        ..Default::default()
    };
    Schema::compile(&def).unwrap()
}

fn gen_packet(field_count: usize) -> Vec<u8> {
    (0..field_count).flat_map(|i| (i as u16).to_le_bytes()).collect()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("schema_parse");
    for &field_count in &[16usize, 256, 4096] {
        let schema = gen_schema(field_count);
        let packet = gen_packet(field_count);
        let cache = ExprCache::default();
        group.bench_function(format!("parse/{field_count}_fields"), |b| {
            b.iter(|| {
                let mut stream = Reader::from_bytes(&packet);
                parse_with_cache(&schema, &mut stream, &cache, None).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("schema_round_trip");
    for &field_count in &[16usize, 256] {
        let schema = gen_schema(field_count);
        let packet = gen_packet(field_count);
        let cache = ExprCache::default();
        let mut stream = Reader::from_bytes(&packet);
        let value = parse_with_cache(&schema, &mut stream, &cache, None).unwrap();
        group.bench_function(format!("serialize/{field_count}_fields"), |b| {
            b.iter(|| serialize_with_cache(&schema, &value, &cache, None).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_round_trip);
criterion_main!(benches);
