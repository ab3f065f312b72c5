use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures::future::join_all;
use kafkabus::{Bus, BusConfig, ConsumerConfig, ProducerConfig, SendOptions, TopicConfig};
use tokio::runtime::Builder;

fn benchmark_produce(c: &mut Criterion) {
    let rt = Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    let bus = rt.block_on(async {
        let bus = Bus::new(BusConfig::in_memory()).await.unwrap();
        bus.create_topic("bench", 8, TopicConfig::default())
            .await
            .unwrap();
        bus
    });

    let mut group = c.benchmark_group("produce");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    let message_size = 1000;
    let messages_per_task = 500;
    for &producers in &[1usize, 4, 16] {
        group.throughput(Throughput::Elements((producers * messages_per_task) as u64));
        group.bench_with_input(
            BenchmarkId::new("concurrent_producers", producers),
            &producers,
            |b, &producers| {
                let payload = vec![b'a'; message_size];
                b.to_async(&rt).iter(|| {
                    let bus = bus.clone();
                    let payload = payload.clone();
                    async move {
                        let tasks = (0..producers).map(|p| {
                            let producer =
                                bus.create_producer(&format!("bench-{}", p), ProducerConfig::default());
                            let payload = payload.clone();
                            async move {
                                for i in 0..messages_per_task {
                                    producer
                                        .send(
                                            "bench",
                                            payload.clone(),
                                            SendOptions::keyed(format!("key-{}", i % 64)),
                                        )
                                        .await
                                        .unwrap();
                                }
                            }
                        });
                        join_all(tasks).await;
                    }
                });
            },
        );
    }
    group.finish();
}

fn benchmark_poll(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    let consumer = rt.block_on(async {
        let bus = Bus::new(BusConfig::in_memory()).await.unwrap();
        bus.create_topic("bench", 4, TopicConfig::default())
            .await
            .unwrap();
        let producer = bus.create_producer("seed", ProducerConfig::default());
        for i in 0..10_000 {
            producer
                .send("bench", format!("message-{}", i), SendOptions::default())
                .await
                .unwrap();
        }
        let consumer = bus.create_consumer("bench", ConsumerConfig::default()).unwrap();
        consumer.subscribe(&["bench"]).await.unwrap();
        consumer
    });

    c.bench_function("poll_500", |b| {
        b.to_async(&rt).iter(|| async { consumer.poll().await.unwrap() });
    });
}

criterion_group!(benches, benchmark_produce, benchmark_poll);
criterion_main!(benches);
