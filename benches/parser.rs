use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use contun::proto;
use contun::socks;

const GREETING: &[u8] = &[0x05, 0x03, 0x00, 0x01, 0x02];

const CONNECT_IPV4: &[u8] = &[0x05, 0x01, 0x00, 0x01, 192, 168, 10, 20, 0x1F, 0x90];

const CONNECT_DOMAIN: &[u8] = &[
    0x05, 0x01, 0x00, 0x03, 0x14, b'i', b'n', b't', b'e', b'r', b'n', b'a', b'l', b'.', b'e',
    b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'o', b'r', b'g', 0x01, 0xBB,
];

const REQUEST_LINE: &str = "REQUEST CONNECT domain internal.example.org 8443";

const REPLY_LINE: &str = "REPLY 0 ipv4 192.168.10.20 40000";

fn benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("socks");
    group.throughput(Throughput::Bytes(GREETING.len() as u64));
    group.bench_with_input(
        BenchmarkId::new("greeting", GREETING.len() as u64),
        GREETING,
        |b, i| b.iter(|| socks::parse_greeting(i)),
    );
    for &input in [CONNECT_IPV4, CONNECT_DOMAIN].iter() {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("request", input.len() as u64),
            input,
            |b, i| b.iter(|| socks::parse_request(i)),
        );
    }
    group.finish();

    let mut group = c.benchmark_group("control");
    group.throughput(Throughput::Bytes(REQUEST_LINE.len() as u64));
    group.bench_with_input(
        BenchmarkId::new("parse", "request"),
        REQUEST_LINE,
        |b, i| b.iter(|| proto::parse_request(i)),
    );
    group.throughput(Throughput::Bytes(REPLY_LINE.len() as u64));
    group.bench_with_input(BenchmarkId::new("parse", "reply"), REPLY_LINE, |b, i| {
        b.iter(|| proto::parse_reply(i))
    });
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
