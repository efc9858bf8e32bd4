use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Metrics {
    inputs_registered: Arc<AtomicU64>,
    inputs_rejected: Arc<AtomicU64>,
    inputs_confirmed: Arc<AtomicU64>,
    mixes_succeeded: Arc<AtomicU64>,
    mixes_failed: Arc<AtomicU64>,
    blames: Arc<AtomicU64>,
    bans: Arc<AtomicU64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub inputs_registered: u64,
    pub inputs_rejected: u64,
    pub inputs_confirmed: u64,
    pub mixes_succeeded: u64,
    pub mixes_failed: u64,
    pub blames: u64,
    pub bans: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_inputs_registered(&self) {
        self.inputs_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_inputs_rejected(&self) {
        self.inputs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_inputs_confirmed(&self) {
        self.inputs_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mixes_succeeded(&self) {
        self.mixes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mixes_failed(&self) {
        self.mixes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blames(&self) {
        self.blames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bans(&self) {
        self.bans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inputs_registered: self.inputs_registered.load(Ordering::Relaxed),
            inputs_rejected: self.inputs_rejected.load(Ordering::Relaxed),
            inputs_confirmed: self.inputs_confirmed.load(Ordering::Relaxed),
            mixes_succeeded: self.mixes_succeeded.load(Ordering::Relaxed),
            mixes_failed: self.mixes_failed.load(Ordering::Relaxed),
            blames: self.blames.load(Ordering::Relaxed),
            bans: self.bans.load(Ordering::Relaxed),
        }
    }

    pub fn report(&self) {
        let s = self.snapshot();
        tracing::info!(
            "Metrics: registered={} rejected={} confirmed={} mixes_ok={} mixes_failed={} blames={} bans={}",
            s.inputs_registered,
            s.inputs_rejected,
            s.inputs_confirmed,
            s.mixes_succeeded,
            s.mixes_failed,
            s.blames,
            s.bans,
        );
    }
}
