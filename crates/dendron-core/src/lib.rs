//! # Dendron Core
//!
//! Shared types and utilities for the Dendron single-neuron STDP simulator.
//!
//! ## Layers
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `dendron-core` | Errors, ids, diagnostics sinks |
//! | `dendron-cell` | Connection, synapse, compartment, dendrite, cell |
//! | `dendron-stimulus` | Poisson noise and spike-pattern streams |
//! | `dendron-sim` | Step pipeline and run/reset controller |
//!
//! ## Design Philosophy
//!
//! 1. Discrete time: one step is one time mark (`TIME_STEP`)
//! 2. Every entity owns its own state; nothing global
//! 3. Diagnostics are written to a sink the kernel never reads back

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum DendronError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Simulation error: {0}")]
    Simulation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DendronError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DendronError>;

/// Time mark (steps, nominally milliseconds)
pub type Time = f64;

/// Spike bit: 0 or 1
pub type Spike = u8;

/// Duration of one simulation pass
pub const TIME_STEP: Time = 1.0;

/// Fails with a configuration error unless `value` is usable as a decay
/// time constant (the denominator of `exp(-dt/tao)`).
pub fn require_time_constant(name: &str, value: f64) -> Result<()> {
    if value <= 0.0 || !value.is_finite() {
        return Err(DendronError::config(format!(
            "{name} must be positive and finite (got {value})"
        )));
    }
    Ok(())
}

// ============================================================================
// IDS
// ============================================================================

/// Hands out sequential ids while a network is being built.
#[derive(Debug, Clone, Default)]
pub struct IdGen {
    next: usize,
}

impl IdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> usize {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Number of ids issued so far
    pub fn issued(&self) -> usize {
        self.next
    }
}

// ============================================================================
// DIAGNOSTICS
// ============================================================================

/// Diagnostic channels the simulation writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Poisson noise stream output
    Noise,
    /// Pattern stream output
    Stimulus,
    /// Cell output spike
    CellOutput,
    SynapseDt,
    SynapseSurge,
    SynapsePsp,
    SynapseWeight,
    NeuronDt,
    NeuronPsp,
    NeuronApFast,
    NeuronApSlow,
}

impl Channel {
    pub const ALL: [Channel; 11] = [
        Channel::Noise,
        Channel::Stimulus,
        Channel::CellOutput,
        Channel::SynapseDt,
        Channel::SynapseSurge,
        Channel::SynapsePsp,
        Channel::SynapseWeight,
        Channel::NeuronDt,
        Channel::NeuronPsp,
        Channel::NeuronApFast,
        Channel::NeuronApSlow,
    ];

    /// Channels with one lane per synapse (or per input stream)
    pub fn is_per_synapse(&self) -> bool {
        matches!(
            self,
            Channel::Noise
                | Channel::Stimulus
                | Channel::SynapseDt
                | Channel::SynapseSurge
                | Channel::SynapsePsp
                | Channel::SynapseWeight
        )
    }
}

/// Write-only destination for diagnostics.
pub trait SampleSink {
    /// Record `value` for series `id` at time mark `time`. `key` is an
    /// opaque tag (e.g. a plotting color index).
    fn put(&mut self, channel: Channel, time: Time, value: f64, id: usize, key: u32);

    /// Called once at the end of a bounded run.
    fn post(&mut self) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn put(&mut self, _channel: Channel, _time: Time, _value: f64, _id: usize, _key: u32) {}
}

/// Fixed-capacity sample lanes for one channel. Row = lane (series id),
/// column = time mark.
#[derive(Debug, Clone)]
pub struct Samples {
    values: Array2<f64>,
    keys: Array2<u32>,
    /// Highest time mark written + 1
    filled: usize,
    min: Vec<f64>,
    max: Vec<f64>,
    range_start: usize,
    range_end: usize,
}

impl Samples {
    pub fn new(lanes: usize, size: usize) -> Self {
        Self {
            values: Array2::zeros((lanes, size)),
            keys: Array2::zeros((lanes, size)),
            filled: 0,
            min: vec![0.0; lanes],
            max: vec![0.0; lanes],
            range_start: 0,
            range_end: size,
        }
    }

    pub fn lanes(&self) -> usize {
        self.values.nrows()
    }

    pub fn size(&self) -> usize {
        self.values.ncols()
    }

    pub fn put(&mut self, time: Time, value: f64, id: usize, key: u32) {
        if time < 0.0 {
            return;
        }
        let col = time as usize;
        if id >= self.lanes() || col >= self.size() {
            return;
        }
        self.values[[id, col]] = value;
        self.keys[[id, col]] = key;
        self.filled = self.filled.max(col + 1);
    }

    pub fn get(&self, time: Time, id: usize) -> Option<f64> {
        let col = time as usize;
        if time < 0.0 || id >= self.lanes() || col >= self.filled {
            return None;
        }
        Some(self.values[[id, col]])
    }

    pub fn key(&self, time: Time, id: usize) -> Option<u32> {
        self.get(time, id).map(|_| self.keys[[id, time as usize]])
    }

    /// Compute per-lane min/max over the written samples
    pub fn post(&mut self) {
        for lane in 0..self.lanes() {
            let row = self.values.row(lane);
            let written = row.iter().take(self.filled);
            let (min, max) = written.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
            if self.filled == 0 {
                self.min[lane] = 0.0;
                self.max[lane] = 0.0;
            } else {
                self.min[lane] = min;
                self.max[lane] = max;
            }
        }
    }

    pub fn min(&self, id: usize) -> Option<f64> {
        self.min.get(id).copied()
    }

    pub fn max(&self, id: usize) -> Option<f64> {
        self.max.get(id).copied()
    }

    // Window range (used by viewers)

    pub fn reset_range(&mut self) {
        self.range_start = 0;
        self.range_end = self.size();
    }

    pub fn set_range(&mut self, start: usize, end: usize) {
        let end = end.min(self.size());
        self.range_start = start.min(end);
        self.range_end = end;
    }

    pub fn range(&self) -> (usize, usize) {
        (self.range_start, self.range_end)
    }

    pub fn range_width(&self) -> usize {
        self.range_end - self.range_start
    }
}

/// In-memory sink holding one `Samples` block per channel.
#[derive(Debug, Clone)]
pub struct SampleCollection {
    channels: HashMap<Channel, Samples>,
    size: usize,
}

impl SampleCollection {
    /// `synapses` lanes for per-synapse channels, one lane otherwise.
    pub fn new(synapses: usize, size: usize) -> Self {
        let channels = Channel::ALL
            .iter()
            .map(|&ch| {
                let lanes = if ch.is_per_synapse() { synapses } else { 1 };
                (ch, Samples::new(lanes, size))
            })
            .collect();
        Self { channels, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn channel(&self, channel: Channel) -> &Samples {
        &self.channels[&channel]
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut Samples {
        let size = self.size;
        self.channels
            .entry(channel)
            .or_insert_with(|| Samples::new(1, size))
    }
}

impl SampleSink for SampleCollection {
    fn put(&mut self, channel: Channel, time: Time, value: f64, id: usize, key: u32) {
        if let Some(samples) = self.channels.get_mut(&channel) {
            samples.put(time, value, id, key);
        }
    }

    fn post(&mut self) {
        for samples in self.channels.values_mut() {
            samples.post();
        }
        log::debug!("Sample collection post-processed ({} channels)", self.channels.len());
    }
}
