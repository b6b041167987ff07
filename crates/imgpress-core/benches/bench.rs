use async_trait::async_trait;
use bytes::Bytes;
use core::{hint::black_box, num::NonZeroUsize, time::Duration};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use imgpress_core::{
    ArchiveStreamer, BatchOrchestrator, Compressor, Result, SourceItem, TargetFormat,
    stream_batch,
};
use std::sync::Arc;
use tokio::{io::AsyncReadExt, runtime::Builder};
use tokio_util::sync::CancellationToken;

/// Echoes its input after a fixed delay, standing in for the network round
/// trip of a real compression service.
struct EchoCompressor {
    latency: Duration,
}

#[async_trait]
impl Compressor for EchoCompressor {
    async fn compress(&self, bytes: Bytes, _format: TargetFormat) -> Result<Bytes> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(bytes)
    }
}

fn batch(items: usize, item_bytes: usize) -> Vec<SourceItem> {
    (0..items)
        .map(|i| {
            let payload: Vec<u8> = (0..item_bytes).map(|b| (b * 31 + i) as u8).collect();
            SourceItem::new(&format!("image-{i}.png"), payload, Some("image/png".to_string()))
                .expect("valid item")
        })
        .collect()
}

fn pipeline_bench(c: &mut Criterion) {
    let rt = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let mut group = c.benchmark_group("stream_batch");
    const ITEMS: usize = 20;
    const ITEM_BYTES: usize = 256 * 1024;
    group.throughput(Throughput::Bytes((ITEMS * ITEM_BYTES) as u64));

    for concurrency in [1, 4, 8] {
        let orchestrator = BatchOrchestrator::new(Arc::new(EchoCompressor {
            latency: Duration::from_millis(1),
        }))
        .with_concurrency(NonZeroUsize::new(concurrency).expect("non-zero"));

        group.bench_with_input(
            BenchmarkId::new("concurrency", concurrency),
            &orchestrator,
            |b, orchestrator| {
                b.to_async(&rt).iter(|| async {
                    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
                    let drain = tokio::spawn(async move {
                        let mut sink = Vec::new();
                        reader.read_to_end(&mut sink).await.map(|_| sink.len())
                    });

                    let report = stream_batch(
                        orchestrator,
                        batch(ITEMS, ITEM_BYTES),
                        TargetFormat::Original,
                        ArchiveStreamer::begin(writer),
                        &CancellationToken::new(),
                    )
                    .await
                    .expect("pipeline failed");

                    let written = drain.await.expect("drain panicked").expect("drain failed");
                    black_box((report, written))
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, pipeline_bench);
criterion_main!(benches);
