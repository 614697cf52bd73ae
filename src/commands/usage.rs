//! `bcachefs-acct usage` — build an in-memory filesystem out of
//! synthetic devices, mark a small fixed workload through the key
//! marking engine, and print the resulting usage report. Demonstrates
//! `accounting-core` end to end without a real block device or btree.

use std::sync::Arc;

use accounting_core::{
    mark_key, Device, Filesystem, KeyKind, MarkContext, Pos, PointerRef,
};
use anyhow::Result;
use chrono::Local;
use clap::Parser;
use owo_colors::OwoColorize;

use crate::util::{fmt_bytes_human, fmt_num_human};

#[derive(Parser, Debug)]
#[command(about = "Build a synthetic filesystem and print its usage report")]
pub struct Cli {
    /// Number of synthetic devices
    #[arg(long, default_value_t = 2)]
    devices: u8,

    /// Buckets per device
    #[arg(long, default_value_t = 1024)]
    buckets: u64,

    /// Sectors per bucket
    #[arg(long, default_value_t = 512)]
    bucket_size: u64,

    /// Sectors to mark as written, round-robined across devices/buckets
    #[arg(long, default_value_t = 200_000)]
    write_sectors: u64,

    /// Emit the report as JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(serde::Serialize)]
struct Report {
    capacity_sectors: u64,
    used_sectors: u64,
    nr_inodes: u64,
    fs_data_sectors: u64,
    fs_cached_sectors: u64,
    fs_reserved_sectors: u64,
    per_device: Vec<DeviceReport>,
}

#[derive(serde::Serialize)]
struct DeviceReport {
    idx: u8,
    uuid: uuid::Uuid,
    buckets_used: u64,
    buckets_total: u64,
}

pub fn usage(cli: Cli) -> Result<()> {
    let capacity_sectors = cli.devices as u64 * cli.buckets * cli.bucket_size;

    let devices: Vec<Arc<Device>> = (0..cli.devices)
        .map(|i| Arc::new(Device::new(i, 0, cli.buckets, num_cpus::get())))
        .collect();
    let device_uuids: Vec<uuid::Uuid> = devices.iter().map(|_| uuid::Uuid::new_v4()).collect();

    let fs = Filesystem::new(devices, capacity_sectors, num_cpus::get());

    let mut remaining = cli.write_sectors;
    let mut dev = 0u8;
    let mut bucket = 0u64;
    while remaining > 0 {
        let chunk = remaining.min(cli.bucket_size);
        let ptrs = [PointerRef::new(dev, bucket, 0, false)];
        let delta = mark_key(&fs, KeyKind::Extent, chunk as i64, &ptrs, MarkContext::default(), Pos::MIN)?;
        fs.apply(&delta, Pos::MIN);
        remaining -= chunk;
        bucket += 1;
        if bucket >= cli.buckets {
            bucket = 0;
            dev = (dev + 1) % cli.devices.max(1);
        }
    }

    let short = fs.usage_short(capacity_sectors, 0);
    let snapshot = fs.usage.live.read();

    let per_device = fs
        .devices
        .iter()
        .zip(device_uuids)
        .map(|(d, uuid)| {
            let dev_snapshot = d.usage.live.read();
            let buckets_used: u64 = dev_snapshot.buckets.iter().sum();
            DeviceReport { idx: d.idx, uuid, buckets_used, buckets_total: d.nr_buckets() }
        })
        .collect();

    let report = Report {
        capacity_sectors: short.capacity,
        used_sectors: short.used,
        nr_inodes: short.nr_inodes,
        fs_data_sectors: snapshot.data,
        fs_cached_sectors: snapshot.cached,
        fs_reserved_sectors: snapshot.reserved,
        per_device,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{} {}", "filesystem usage".bold(), Local::now().format("(%Y-%m-%d %H:%M:%S)").dimmed());
    println!(
        "  capacity {:>10}   used {:>10}   inodes {}",
        fmt_bytes_human(report.capacity_sectors * 512).green(),
        fmt_bytes_human(report.used_sectors * 512).yellow(),
        fmt_num_human(report.nr_inodes),
    );
    println!(
        "  data {:>10}   cached {:>10}   reserved {:>10}",
        fmt_bytes_human(report.fs_data_sectors * 512),
        fmt_bytes_human(report.fs_cached_sectors * 512),
        fmt_bytes_human(report.fs_reserved_sectors * 512),
    );
    println!("{}", "per-device".bold());
    for d in &report.per_device {
        println!(
            "  dev{} {}  buckets {}/{}",
            d.idx,
            d.uuid.to_string().dimmed(),
            fmt_num_human(d.buckets_used),
            fmt_num_human(d.buckets_total),
        );
    }

    Ok(())
}
