use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use storefront_core::{OrderId, ProductId, UserId};
use storefront_events::{
    Consumer, EventBus, EventEnvelope, EventRegistry, InMemoryBroker, OrderLine, OrderPlaced,
    Producer, Topic,
};
use storefront_infra::outbox::OutboxRecord;
use storefront_infra::store::{InMemoryProductDb, InventoryStore};
use storefront_products::CreateProduct;

fn order(n: usize, lines: usize) -> OrderPlaced {
    OrderPlaced {
        order_id: OrderId::parse(format!("o{n}")).unwrap(),
        user_id: UserId::parse("u1").unwrap(),
        items: (0..lines)
            .map(|i| OrderLine {
                product_id: ProductId::parse(format!("p{i}")).unwrap(),
                quantity: 1,
            })
            .collect(),
    }
}

fn bench_broker_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_round_trip");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &n| {
            b.iter(|| {
                let broker = InMemoryBroker::new();
                let mut consumer = broker.subscribe("bench", Topic::OrderPlaced).unwrap();
                for i in 0..n {
                    broker
                        .emit(EventEnvelope::from_event(Uuid::now_v7(), &order(i, 1)).unwrap())
                        .unwrap();
                }
                for _ in 0..n {
                    let delivery = consumer.fetch(Duration::ZERO).unwrap().unwrap();
                    consumer.commit(&delivery).unwrap();
                    black_box(delivery);
                }
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_order_placed");
    let registry = EventRegistry::builder().register::<OrderPlaced>().build();

    for lines in [1usize, 10, 50] {
        let envelope = EventEnvelope::from_event(Uuid::now_v7(), &order(0, lines)).unwrap();
        group.throughput(Throughput::Bytes(envelope.payload().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &envelope, |b, envelope| {
            b.iter(|| black_box(registry.decode(black_box(envelope)).unwrap()));
        });
    }
    group.finish();
}

fn bench_apply_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_order");
    group.sample_size(200);

    group.bench_function("ten_lines", |b| {
        let db = InMemoryProductDb::new();
        for i in 0..10 {
            let product = CreateProduct {
                product_id: ProductId::parse(format!("p{i}")).unwrap(),
                name: format!("product {i}"),
                price: 1.0,
                inventory_count: u32::MAX,
            }
            .into_product(Utc::now())
            .unwrap();
            let row = OutboxRecord::for_event(&product.created_event()).unwrap();
            db.create_product(&product, &row).unwrap();
        }

        let mut n = 0usize;
        b.iter(|| {
            n += 1;
            black_box(db.apply_order(&order(n, 10)).unwrap());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_broker_round_trip, bench_decode, bench_apply_order);
criterion_main!(benches);
