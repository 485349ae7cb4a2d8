//! # OTLP Export Pipeline Demo
//!
//! Builds a span pipeline (batch processor, export delegate, retrying
//! transport), feeds it from several producer tasks and shuts it down.
//!
//! Without `--endpoint` (or `OTEL_EXPORTER_OTLP_ENDPOINT`) the payloads are
//! printed to stdout instead of being sent.
//!
//! ## Running
//!
//! ```bash
//! # Print payloads locally
//! cargo run -p otlp_export --bin demo -- --quick --verbose
//!
//! # Send to a local collector over gRPC with gzip
//! cargo run -p otlp_export --bin demo -- --endpoint http://localhost:4317 --transport grpc --gzip
//! ```

use clap::{Parser, ValueEnum};
use otlp_export::{
    detect_resources, BatchConfig, BatchProcessor, Compression, EnvResourceDetector, ExportDelegate,
    ExporterConfig, JsonSerializer, ProcessResourceDetector, Resource, ResourceDetector, SdkResourceDetector,
    Span, SpanKind, SpanStatus, StdoutTransport, SubmitError, TransportStrategy,
};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Http,
    Grpc,
    Beacon,
}

impl From<TransportArg> for TransportStrategy {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Http => Self::BufferedRequest,
            TransportArg::Grpc => Self::StreamingRpc,
            TransportArg::Beacon => Self::Beacon,
        }
    }
}

/// Generates spans and exports them through the OTLP pipeline.
#[derive(Parser, Debug)]
#[command(name = "demo")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Collector endpoint; payloads go to stdout when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    endpoint: Option<String>,

    /// Transport used with --endpoint
    #[arg(long, value_enum, default_value_t = TransportArg::Http)]
    transport: TransportArg,

    /// Gzip request bodies
    #[arg(long)]
    gzip: bool,

    /// Number of producer tasks
    #[arg(long, default_value_t = 8)]
    producers: usize,

    /// Spans generated by each producer
    #[arg(long, default_value_t = 100)]
    spans_per_producer: usize,

    /// Records per export
    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// 4 producers, 25 spans each
    #[arg(long)]
    quick: bool,

    /// Print every exported payload (stdout mode)
    #[arg(long)]
    verbose: bool,
}

const OPERATIONS: [(&str, SpanKind); 5] = [
    ("GET /api/cart", SpanKind::Server),
    ("SELECT orders", SpanKind::Client),
    ("cache.get", SpanKind::Client),
    ("publish order.created", SpanKind::Producer),
    ("render", SpanKind::Internal),
];

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,otlp_export=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn generate_span(rng: &mut impl Rng, producer: usize) -> Span {
    let (name, kind) = OPERATIONS[rng.gen_range(0..OPERATIONS.len())];
    let parent = if rng.gen_bool(0.8) { rng.r#gen::<u64>() } else { 0 };
    let mut span = Span::new(rng.r#gen(), rng.r#gen(), parent, name, kind);
    span.set_attribute("producer.id", i64::try_from(producer).unwrap_or(i64::MAX));
    if rng.gen_bool(0.1) {
        span.set_attribute("error.type", "timeout");
        span.finish(SpanStatus::Error);
    } else {
        span.finish(SpanStatus::Ok);
    }
    span
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let (producers, spans_per_producer) = if args.quick {
        (4, 25)
    } else {
        (args.producers, args.spans_per_producer)
    };

    // Resource: SDK defaults, process info and OTEL_* overrides, plus one
    // attribute that resolves asynchronously.
    let from_env = EnvResourceDetector::new();
    let detectors: [&dyn ResourceDetector; 3] = [&SdkResourceDetector, &ProcessResourceDetector, &from_env];
    let mut resource = detect_resources(&detectors).merge(&Resource::empty().with_pending(
        "host.name",
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()).into())
        },
    ));
    resource.wait_for_async_attributes().await;

    let mut config = ExporterConfig::from_env();
    if args.gzip {
        config = config.with_compression(Compression::Gzip);
    }
    let delegate = match &args.endpoint {
        Some(endpoint) => {
            config = config.with_endpoint(endpoint).with_transport(args.transport.into());
            ExportDelegate::<Span>::from_config(&config, &resource)?
        }
        None => ExportDelegate::with_transport(
            JsonSerializer::<Span>::new(&resource),
            StdoutTransport::new(args.verbose),
            &config,
        ),
    };
    tracing::info!(
        transport = delegate.transport_name(),
        producers,
        spans_per_producer,
        "pipeline ready"
    );

    let batch_config = BatchConfig::default()
        .with_max_export_batch_size(args.batch_size)
        .with_scheduled_delay(Duration::from_millis(200))
        .with_concurrency_limit(config.concurrency_limit);
    let processor = Arc::new(BatchProcessor::new(delegate, batch_config));

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(producers);
    for producer in 0..producers {
        let processor = Arc::clone(&processor);
        tasks.push(tokio::spawn(async move {
            let mut dropped = 0usize;
            for _ in 0..spans_per_producer {
                let span = generate_span(&mut rand::thread_rng(), producer);
                match processor.enqueue(span) {
                    Ok(()) => {}
                    Err(SubmitError::Full) => dropped += 1,
                    Err(SubmitError::Shutdown) => break,
                }
                if producer % 2 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            dropped
        }));
    }

    let mut dropped = 0;
    for task in tasks {
        dropped += task.await?;
    }

    let report = processor.shutdown().await?;
    let metrics = processor.metrics();
    let elapsed = started.elapsed();

    println!();
    println!("Spans enqueued:     {}", metrics.records_enqueued());
    println!("Spans dropped:      {dropped}");
    println!("Spans exported:     {}", metrics.records_exported());
    println!("Batches exported:   {}", metrics.batches_exported());
    println!("Export failures:    {}", metrics.export_failures());
    println!("Final flush:        {report:?}");
    println!(
        "Throughput:         {:.0} spans/s",
        metrics.records_exported() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}
