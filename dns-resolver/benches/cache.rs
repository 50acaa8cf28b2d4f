use std::net::Ipv4Addr;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use dns_proto::protocol::types::test_util::*;
use dns_proto::protocol::types::*;
use dns_resolver::cache::Cache;

fn question(name: &str) -> Question {
    Question {
        name: domain(name),
        qtype: QueryType::Record(RecordType::A),
        qclass: QueryClass::Record(RecordClass::IN),
    }
}

fn set_and_get(c: &mut Criterion) {
    c.bench_function("cache set+get, 1000 distinct questions", |b| {
        b.iter(|| {
            let mut cache = Cache::new();
            for i in 0..1000 {
                let q = question(&format!("host{i}.example."));
                let rr = a_record(&format!("host{i}.example."), Ipv4Addr::new(10, 0, 0, 1));
                cache.set(&q, &[rr]);
            }
            for i in 0..1000 {
                let q = question(&format!("host{i}.example."));
                black_box(cache.get(&q.name, &q.qtype, &q.qclass));
            }
        });
    });
}

criterion_group!(benches, set_and_get);
criterion_main!(benches);
