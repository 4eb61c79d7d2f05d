use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::BoxFuture;
use humantime::parse_duration;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::Semaphore;

use batchcache::{BatchRequest, CacheConfig, Cacher, ProducedBatch};

#[derive(Debug, Deserialize)]
struct WorkloadsConfig {
    /// Cache settings shared by all workloads.
    #[serde(default)]
    cache: CacheConfig,
    workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
struct Workload {
    /// Concurrent requests kept in flight.
    concurrency: usize,
    /// Number of distinct keys the workload draws from.
    key_space: u64,
    /// Keys per request.
    batch_size: usize,
    /// Simulated backend latency per production.
    #[serde(with = "humantime_serde")]
    produce_delay: Duration,
}

/// Simulated expensive backend: sleeps, then returns a payload per key.
struct SlowBackend {
    delay: Duration,
    produced_keys: Arc<AtomicUsize>,
}

impl BatchRequest for SlowBackend {
    type Key = u64;
    type Value = String;

    fn produce_many<'a>(
        &'a self,
        keys: &'a BTreeSet<u64>,
    ) -> BoxFuture<'a, ProducedBatch<u64, String>> {
        self.produced_keys.fetch_add(keys.len(), Ordering::Relaxed);
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(keys
                .iter()
                .map(|key| (*key, format!("payload for {key}")))
                .collect())
        })
    }
}

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let WorkloadsConfig { cache, workloads } =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    tracing_subscriber::fmt::init();

    let mut tasks = Vec::with_capacity(workloads.len());
    for (index, workload) in workloads.into_iter().enumerate() {
        let cache_config = CacheConfig {
            name: format!("stress-{index}"),
            ..cache.clone()
        };
        let produced_keys = Arc::new(AtomicUsize::new(0));
        let backend = SlowBackend {
            delay: workload.produce_delay,
            produced_keys: Arc::clone(&produced_keys),
        };
        let cacher = Cacher::new(backend, cache_config);

        let deadline = tokio::time::Instant::now() + cli.duration;
        let task = tokio::spawn(async move {
            let finished_ops = Arc::new(AtomicUsize::new(0));
            let requested_keys = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(workload.concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let permit = permit.expect("semaphore closed");
                        let cacher = cacher.clone();
                        let finished_ops = Arc::clone(&finished_ops);
                        let requested_keys = Arc::clone(&requested_keys);
                        let key_space = workload.key_space;
                        let batch_size = workload.batch_size;

                        tokio::spawn(async move {
                            let keys: BTreeSet<u64> = {
                                let mut rng = rand::thread_rng();
                                (0..batch_size).map(|_| rng.gen_range(0..key_space)).collect()
                            };
                            requested_keys.fetch_add(keys.len(), Ordering::Relaxed);
                            cacher.get_many(keys).await.expect("production failed");
                            finished_ops.fetch_add(1, Ordering::Relaxed);

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // we only count finished requests
            let ops = finished_ops.load(Ordering::Relaxed);

            // by acquiring *all* the permits, we wait for outstanding requests to finish
            let _permits = semaphore.acquire_many(workload.concurrency as u32).await;

            (workload, ops, requested_keys.load(Ordering::Relaxed))
        });
        tasks.push((index, produced_keys, task));
    }

    for (index, produced_keys, task) in tasks {
        let (workload, ops, requested) = task.await?;
        let produced = produced_keys.load(Ordering::Relaxed);

        let ops_ps = ops as f32 / cli.duration.as_secs_f32();
        let hit_rate = if requested > 0 {
            100.0 * (1.0 - produced as f32 / requested as f32)
        } else {
            0.0
        };
        println!(
            "Workload {index} (concurrency: {}): {ops} requests, {ops_ps:.1} requests/s, \
             {requested} keys requested, {produced} produced, {hit_rate:.1}% served from cache",
            workload.concurrency,
        );
    }

    Ok(())
}
