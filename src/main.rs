use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use tsdb_reader::config::Settings;
use tsdb_reader::lookup::{
    BucketLookup, Dependencies, HostLookup, MemBucketLookup, MemOrganizationLookup,
    OrganizationLookup, StaticLookup,
};
use tsdb_reader::metrics;
use tsdb_reader::query::id::{DatasetId, Id};
use tsdb_reader::query::source::{LogSink, Source};
use tsdb_reader::query::spec::ReadSpec;
use tsdb_reader::query::time::Time;
use tsdb_reader::storage::mem::MemStore;
use tsdb_reader::storage::memory::Allocator;
use tsdb_reader::storage::reader::Reader;

const DEMO_ORG: u64 = 0x0000_0000_0000_0001;
const DEMO_BUCKET: u64 = 0x0000_0000_0000_0002;

#[tokio::main]
async fn main() {
    let settings = match std::env::args().nth(1) {
        Some(path) => match Settings::from_file(&path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Failed to load settings from {}: {}", path, e);
                std::process::exit(2);
            }
        },
        None => Settings::default(),
    };

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::from_str(&settings.log_level).unwrap_or(Level::INFO))
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true)
        .pretty()
        .init();

    // Initialize metrics
    if let Some(addr) = settings.metrics_addr {
        if let Err(e) = metrics::init_metrics(addr) {
            eprintln!("Failed to initialize metrics: {}", e);
        } else {
            info!("Metrics server listening on {}", addr);
        }
    }

    if let Err(e) = run(settings).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.cancel();
        }
    });

    let org_id = Id::new(DEMO_ORG)?;
    let bucket_id = Id::new(DEMO_BUCKET)?;
    let store = Arc::new(seed(org_id, bucket_id, &settings).await?);

    let mut organizations = MemOrganizationLookup::new();
    organizations.insert(settings.organization.clone(), org_id);
    let mut buckets = MemBucketLookup::new();
    buckets.insert(org_id, settings.bucket.clone(), bucket_id);

    let reader: Arc<dyn Reader> = store;
    let bucket_lookup: Arc<dyn BucketLookup> = Arc::new(buckets);
    let organization_lookup: Arc<dyn OrganizationLookup> = Arc::new(organizations);
    Dependencies {
        reader: Some(Arc::clone(&reader)),
        bucket_lookup: Some(Arc::clone(&bucket_lookup)),
        organization_lookup: Some(Arc::clone(&organization_lookup)),
    }
    .validate()?;

    let hosts = StaticLookup::new(settings.hosts.clone());
    let org = organization_lookup
        .lookup(&cancel, &settings.organization)
        .await?
        .ok_or_else(|| format!("organization not found: {}", settings.organization))?;
    let bucket = bucket_lookup
        .lookup(&cancel, org, &settings.bucket)
        .await?
        .ok_or_else(|| format!("bucket not found: {}", settings.bucket))?;

    let mut spec = ReadSpec::new(org, bucket).with_aggregate(settings.aggregate_method.clone());
    spec.hosts = hosts.hosts();
    spec.ram_limit = settings.ram_limit;

    let alloc = Arc::new(match settings.ram_limit() {
        Some(limit) => Allocator::with_limit(limit),
        None => Allocator::new(),
    });
    let bounds = settings.bounds();
    let mut source = Source::new(
        DatasetId::new(),
        Arc::clone(&reader),
        spec,
        bounds,
        settings.window(),
        bounds.start.saturating_add(settings.period),
        alloc,
    )?;
    source.add_sink(Box::new(LogSink::default()));

    let result = source.run(&cancel).await;
    reader.close().await;
    result?;
    Ok(())
}

/// Fills the store with one point per second for three hosts
async fn seed(org: Id, bucket: Id, settings: &Settings) -> Result<MemStore, Box<dyn std::error::Error>> {
    let store = MemStore::new();
    let step = 1_000_000_000;
    for host in ["web-1", "web-2", "db-1"] {
        let mut t = settings.start;
        let mut i = 0u32;
        while t < settings.stop {
            store
                .write(org, bucket, &[("host", host)], Time::from_nanos(t), f64::from(i % 100))
                .await?;
            t = t.saturating_add(step);
            i += 1;
        }
    }
    info!("Seeded in-memory store for {}", settings.bounds());
    Ok(store)
}
