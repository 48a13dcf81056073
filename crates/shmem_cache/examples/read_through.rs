// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Several worker processes sharing one cache in front of a slow store.
//!
//! Run without arguments to launch the workers:
//!
//! ```text
//! cargo run --example read_through -- 4
//! ```
//!
//! The launcher starts this executable once per rank with `worker <group> <rank> <size>`. Every
//! worker walks the whole key space in its own order, so most elements are read from the store by
//! one worker and served from shared memory to the others.

use std::env;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shmem_cache::{BackingReader, BoxError, Cache, NodeGroup, recommended_capacity};

const KEYS: usize = 512;
const ELEMENT_SIZE: usize = 1024;

/// Pretends to be a slow file system.
struct SlowStore;

impl BackingReader<f64> for SlowStore {
    fn element_size(&self) -> usize {
        ELEMENT_SIZE
    }

    #[expect(clippy::cast_precision_loss, reason = "keys are small")]
    fn read(&self, key: usize, destination: &mut [f64]) -> Result<(), BoxError> {
        thread::sleep(Duration::from_micros(200));
        destination.fill(key as f64);
        Ok(())
    }
}

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.as_slice() {
        [mode, group, rank, size] if mode == "worker" => worker(group, rank.parse()?, size.parse()?),
        [size] => launch(size.parse()?),
        [] => launch(4),
        _ => Err("usage: read_through [workers] | read_through worker <group> <rank> <size>".into()),
    }
}

fn launch(size: usize) -> Result<(), BoxError> {
    let exe = env::current_exe()?;
    let group = format!("read-through-{}", std::process::id());

    let children = (0..size)
        .map(|rank| {
            Command::new(&exe)
                .args(["worker", &group, &rank.to_string(), &size.to_string()])
                .spawn()
        })
        .collect::<Result<Vec<_>, _>>()?;

    for mut child in children {
        let status = child.wait()?;
        if !status.success() {
            return Err(format!("a worker failed with {status}").into());
        }
    }

    Ok(())
}

fn worker(group: &str, rank: usize, size: usize) -> Result<(), BoxError> {
    let group = Arc::new(NodeGroup::join(group, rank, size)?);

    // A quarter of the key space, unless the node is short on memory.
    let element_bytes = ELEMENT_SIZE * size_of::<f64>();
    let capacity = recommended_capacity(0.05, element_bytes, KEYS)?.min(KEYS / 4);

    let cache = Cache::builder()
        .number_of_keys(KEYS)
        .capacity(capacity)
        .verbosity(2)
        .build(group, SlowStore)?;

    let mut checksum = 0.0;
    for step in 0..KEYS {
        let key = (step * 7 + rank * KEYS / size) % KEYS;
        let element = cache.access(key)?;
        checksum += element[0];
    }

    tracing::info!(rank, checksum, "worker done");

    // Rank 0 logs the group-wide report.
    let _report = cache.shutdown();
    Ok(())
}
