// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A small service whose coverage counters are wired up by hand, the way
//! instrumented code would emit them, with the coverage agent embedded.
//!
//! ```text
//! GOC_CENTER=http://127.0.0.1:7777 goc-demo-service
//! curl http://<agent>/v1/cover/coverage
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use goc_agent::{Config, CoverVar, PackageCover, Registry};

// orders/pricing.rs: 4 blocks
static PRICING_COUNTS: [AtomicU32; 4] = [
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
];
#[rustfmt::skip]
static PRICING_POS: [u32; 12] = [
    3, 5, (40 << 16) | 2,
    5, 7, (20 << 16) | 6,
    7, 9, (6 << 16) | 6,
    10, 10, (14 << 16) | 2,
];
static PRICING_STMTS: [u16; 4] = [1, 1, 1, 1];

// orders/worker.rs: 3 blocks
static WORKER_COUNTS: [AtomicU32; 3] = [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)];
#[rustfmt::skip]
static WORKER_POS: [u32; 9] = [
    4, 8, (30 << 16) | 2,
    8, 11, (22 << 16) | 3,
    11, 13, (3 << 16) | 2,
];
static WORKER_STMTS: [u16; 3] = [3, 2, 1];

static PRICING: CoverVar = CoverVar::new(
    "orders/pricing.rs",
    &PRICING_COUNTS,
    &PRICING_POS,
    &PRICING_STMTS,
);
static WORKER: CoverVar =
    CoverVar::new("orders/worker.rs", &WORKER_COUNTS, &WORKER_POS, &WORKER_STMTS);

fn hit(counters: &[AtomicU32], block: usize) {
    counters[block].fetch_add(1, Ordering::Relaxed);
}

fn price(quantity: u32) -> u32 {
    hit(&PRICING_COUNTS, 0);
    if quantity >= 100 {
        hit(&PRICING_COUNTS, 1);
        return quantity * 8;
    }
    if quantity == 0 {
        // never taken by the worker below, stays uncovered
        hit(&PRICING_COUNTS, 2);
        return 0;
    }
    hit(&PRICING_COUNTS, 3);
    quantity * 10
}

fn process_batch(batch: u32) -> u32 {
    hit(&WORKER_COUNTS, 0);
    let quantity = batch % 150 + 1;
    let total = price(quantity);
    if total > 1000 {
        hit(&WORKER_COUNTS, 1);
        debug!("Large order: {quantity} units for {total}");
    }
    hit(&WORKER_COUNTS, 2);
    total
}

fn registry() -> Registry {
    Registry::new(
        PackageCover::new("goc-demo-service/orders", vec![PRICING, WORKER]),
        vec![],
    )
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("goc-demo-service: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = goc_agent::start(config, registry()) {
        error!("Coverage agent failed to start: {e}");
        std::process::exit(1);
    }
    info!("Demo service started");

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut batch = 0u32;
    loop {
        ticker.tick().await;
        let total = process_batch(batch);
        batch = batch.wrapping_add(37);
        debug!("Processed batch {batch}, total {total}");
    }
}
