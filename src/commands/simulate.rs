//! `bcachefs-acct simulate` — hammer a shared [`Filesystem`] from several
//! threads at once, each repeatedly reserving, writing, committing or
//! aborting, and check the capacity invariant holds throughout and at
//! the end: nothing is ever oversubscribed, and a clean shutdown leaves
//! every sector accounted for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use accounting_core::{
    mark_key, reservation_flags, Device, Filesystem, KeyKind, MarkContext, Pos, PointerRef,
};
use anyhow::{bail, Result};
use clap::Parser;
use log::{debug, info};

#[derive(Parser, Debug)]
#[command(about = "Run a concurrent reserve/write/commit workload and check the capacity invariant")]
pub struct Cli {
    /// Worker threads
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Reserve+write+commit cycles per thread
    #[arg(long, default_value_t = 2_000)]
    iterations: usize,

    /// Sectors reserved per cycle
    #[arg(long, default_value_t = 8)]
    write_sectors: u64,

    /// Buckets per (single, shared) device
    #[arg(long, default_value_t = 4096)]
    buckets: u64,

    /// Sectors per bucket
    #[arg(long, default_value_t = 512)]
    bucket_size: u64,

    /// Fraction (out of 100) of cycles that abort instead of committing
    #[arg(long, default_value_t = 10)]
    abort_pct: u64,
}

pub fn simulate(cli: Cli) -> Result<()> {
    let nr_shards = num_cpus::get().max(cli.threads);
    let capacity_sectors = cli.buckets * cli.bucket_size;
    let dev = Arc::new(Device::new(0, 0, cli.buckets, nr_shards));
    let fs = Arc::new(Filesystem::new(vec![dev], capacity_sectors, nr_shards));

    info!(
        "simulate: {} threads x {} iterations, capacity {} sectors",
        cli.threads, cli.iterations, capacity_sectors
    );

    let committed_sectors = Arc::new(AtomicU64::new(0));
    let aborted = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(cli.threads);
        for shard in 0..cli.threads {
            let fs = Arc::clone(&fs);
            let committed_sectors = Arc::clone(&committed_sectors);
            let aborted = Arc::clone(&aborted);
            let failed = Arc::clone(&failed);
            let cli_write_sectors = cli.write_sectors;
            let cli_iterations = cli.iterations;
            let cli_abort_pct = cli.abort_pct.min(100);
            let nr_buckets = cli.buckets;

            handles.push(scope.spawn(move || {
                for i in 0..cli_iterations {
                    let bucket = (shard as u64 * 2654435761u64 ^ i as u64) % nr_buckets.max(1);
                    let abort = (i as u64 % 100) < cli_abort_pct;

                    let mut res = match fs.acquire_reservation(shard, cli_write_sectors, reservation_flags::NOFAIL) {
                        Ok(r) => r,
                        Err(e) => {
                            debug!("thread {shard}: acquire failed: {e}");
                            failed.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };

                    if abort {
                        fs.release_reservation(shard, res);
                        aborted.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    let ptrs = [PointerRef::new(0, bucket, 0, false)];
                    let mut delta = match mark_key(
                        &fs,
                        KeyKind::Extent,
                        cli_write_sectors as i64,
                        &ptrs,
                        MarkContext::default(),
                        Pos::MIN,
                    ) {
                        Ok(d) => d,
                        Err(e) => {
                            debug!("thread {shard}: mark failed: {e}");
                            fs.release_reservation(shard, res);
                            failed.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };

                    fs.apply_reservation(&mut delta, &mut res, Pos::MIN);
                    if res.sectors() > 0 {
                        fs.release_reservation(shard, res);
                    }
                    committed_sectors.fetch_add(cli_write_sectors, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            let _ = h.join();
        }
    });

    let snapshot = fs.usage.live.read();
    let short = fs.usage_short(capacity_sectors, 0);

    info!(
        "done: committed={} aborted={} failed={} fs.data={} fs.online_reserved={}",
        committed_sectors.load(Ordering::Relaxed),
        aborted.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        snapshot.data,
        snapshot.online_reserved,
    );

    if snapshot.online_reserved != 0 {
        bail!(
            "invariant violated: {} sectors of online_reserved left dangling after every thread finished",
            snapshot.online_reserved
        );
    }
    if short.used > short.capacity {
        bail!(
            "invariant violated: used {} sectors exceeds capacity {} sectors",
            short.used,
            short.capacity
        );
    }
    if snapshot.data != committed_sectors.load(Ordering::Relaxed) {
        bail!(
            "invariant violated: fs_usage.data {} does not match {} sectors actually committed",
            snapshot.data,
            committed_sectors.load(Ordering::Relaxed)
        );
    }

    println!("ok: capacity invariant held across {} threads / {} iterations each", cli.threads, cli.iterations);
    Ok(())
}
