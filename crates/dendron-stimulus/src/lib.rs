//! # Dendron Stimulus
//!
//! Spike sources feeding the cell's connections:
//!
//! - [`PoissonStream`]: background noise with a seeded inter-spike interval
//! - [`FixedPattern`]: a bit pattern replayed from start to end
//! - [`PatternGroup`]: patterns presented together, separated by a gap
//!
//! Streams route their output into the connection table themselves, each
//! step, to every connection they were attached to at build time.

use dendron_cell::{Connection, ConnectionId, NeuronModel};
use dendron_core::{DendronError, Result, Spike};
use pest::Parser;
use pest_derive::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Accepted range for a Poisson firing rate (spikes per step).
pub const MIN_FIRING_RATE: f64 = 0.002;
pub const MAX_FIRING_RATE: f64 = 1.0;

/// Largest Poisson mean accepted; `exp(-lambda)` underflows past ~745.
pub const MAX_POISSON_LAMBDA: f64 = 700.0;

/// Largest number of zeros inserted after each pattern bit.
pub const MAX_STIMULUS_SCALE: usize = 10_000;

/// Knuth's Poisson sampler: multiply uniforms until the product drops below
/// `exp(-lambda)`. `lambda` is clamped to `[0, MAX_POISSON_LAMBDA]`.
pub fn knuth_poisson<R: Rng>(rng: &mut R, lambda: f64) -> usize {
    let limit = (-lambda.clamp(0.0, MAX_POISSON_LAMBDA)).exp();
    let mut p = 1.0;
    let mut k: usize = 0;
    while p > limit {
        k += 1;
        p *= rng.gen::<f64>();
    }
    k.saturating_sub(1)
}

fn route(targets: &[ConnectionId], bit: Spike, connections: &mut [Connection]) {
    for &id in targets {
        if let Some(con) = connections.get_mut(id) {
            con.input(bit);
        }
    }
}

// ============================================================================
// POISSON STREAM
// ============================================================================

/// Noise source. Each step: when the interval countdown is 0 emit a spike
/// and draw a new interval, otherwise emit 0 and count down.
#[derive(Debug, Clone)]
pub struct PoissonStream {
    id: usize,
    seed: u64,
    rng: StdRng,
    firing_rate: f64,
    isi: usize,
    value: Spike,
    targets: Vec<ConnectionId>,
}

impl PoissonStream {
    pub fn new(id: usize, seed: u64, firing_rate: f64) -> Result<Self> {
        validate_rate(firing_rate)?;
        let mut stream = Self {
            id,
            seed,
            rng: StdRng::seed_from_u64(seed),
            firing_rate,
            isi: 0,
            value: 0,
            targets: Vec::new(),
        };
        stream.isi = stream.draw();
        Ok(stream)
    }

    /// `lambda = 1/rate - 1` gives a mean spike spacing of `1/rate` steps.
    fn draw(&mut self) -> usize {
        let lambda = 1.0 / self.firing_rate - 1.0;
        knuth_poisson(&mut self.rng, lambda)
    }

    pub fn attach(&mut self, connection: ConnectionId) {
        self.targets.push(connection);
    }

    pub fn step(&mut self, connections: &mut [Connection]) -> Spike {
        if self.isi == 0 {
            self.value = 1;
            self.isi = self.draw();
        } else {
            self.value = 0;
            self.isi -= 1;
        }
        route(&self.targets, self.value, connections);
        self.value
    }

    /// Reseed and redraw; the stream replays the same sequence.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.value = 0;
        self.isi = self.draw();
    }

    /// Takes effect at the next interval draw.
    pub fn set_firing_rate(&mut self, rate: f64) -> Result<()> {
        validate_rate(rate)?;
        self.firing_rate = rate;
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn firing_rate(&self) -> f64 {
        self.firing_rate
    }

    /// Steps remaining before the next spike
    pub fn isi(&self) -> usize {
        self.isi
    }

    pub fn output(&self) -> Spike {
        self.value
    }

    pub fn targets(&self) -> &[ConnectionId] {
        &self.targets
    }
}

/// Firing rates outside `[MIN_FIRING_RATE, MAX_FIRING_RATE]` are configuration errors.
pub fn validate_rate(rate: f64) -> Result<()> {
    if !(MIN_FIRING_RATE..=MAX_FIRING_RATE).contains(&rate) {
        return Err(DendronError::config(format!(
            "Firing_Rate must be in [{MIN_FIRING_RATE}, {MAX_FIRING_RATE}] (got {rate})"
        )));
    }
    Ok(())
}

// ============================================================================
// FIXED PATTERN
// ============================================================================

/// A replayable bit pattern.
///
/// `pattern` holds the bits as defined; `expanded` is what is actually
/// emitted after temporal stretching.
#[derive(Debug, Clone)]
pub struct FixedPattern {
    id: usize,
    pattern: Vec<Spike>,
    expanded: Vec<Spike>,
    scale: usize,
    cursor: usize,
    value: Spike,
    complete: bool,
    auto_reset: bool,
    targets: Vec<ConnectionId>,
}

impl FixedPattern {
    pub fn new(id: usize, bits: Vec<Spike>) -> Self {
        let bits: Vec<Spike> = bits.into_iter().map(|b| b & 1).collect();
        Self {
            id,
            expanded: bits.clone(),
            pattern: bits,
            scale: 0,
            cursor: 0,
            value: 0,
            complete: false,
            auto_reset: true,
            targets: Vec::new(),
        }
    }

    /// Build from `.`/`|` glyphs.
    pub fn from_glyphs(id: usize, glyphs: &str) -> Result<Self> {
        let bits = glyphs
            .chars()
            .map(|c| match c {
                '.' => Ok(0),
                '|' => Ok(1),
                other => Err(DendronError::parse(format!(
                    "unexpected glyph {other:?} in pattern {id}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(id, bits))
    }

    pub fn with_auto_reset(mut self, auto_reset: bool) -> Self {
        self.auto_reset = auto_reset;
        self
    }

    pub fn attach(&mut self, connection: ConnectionId) {
        self.targets.push(connection);
    }

    /// Emit the current bit and advance. Returns true on the step that emits
    /// the last bit.
    pub fn step(&mut self, connections: &mut [Connection]) -> bool {
        self.value = self.expanded.get(self.cursor).copied().unwrap_or(0);
        route(&self.targets, self.value, connections);

        if self.cursor < self.expanded.len() {
            self.cursor += 1;
        }
        self.complete = self.cursor >= self.expanded.len();
        if self.complete && self.auto_reset {
            self.cursor = 0;
        }
        self.complete
    }

    /// Back to the first bit. The last emitted value stays readable.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.complete = false;
    }

    pub fn reset(&mut self) {
        self.rewind();
        self.value = 0;
    }

    /// Quiet step: nothing routed, output reads 0.
    pub fn idle(&mut self) {
        self.value = 0;
    }

    /// Rebuild the emitted bits with `scale` zeros after every defined bit.
    /// An unrepresentable length is an error and leaves the pattern as it was.
    pub fn expand(&mut self, scale: usize) -> Result<()> {
        let len = expanded_len(self.pattern.len(), scale).ok_or_else(|| {
            DendronError::config(format!(
                "pattern {}: scale {scale} is too large for {} bits",
                self.id,
                self.pattern.len()
            ))
        })?;
        self.scale = scale;
        self.expanded = Vec::with_capacity(len);
        for &bit in &self.pattern {
            self.expanded.push(bit);
            self.expanded.extend(std::iter::repeat(0).take(scale));
        }
        if self.cursor > self.expanded.len() {
            self.cursor = 0;
        }
        Ok(())
    }

    pub fn set(&mut self, index: usize) {
        self.write(index, 1);
    }

    pub fn set_range(&mut self, indices: &[usize]) {
        for &index in indices {
            self.write(index, 1);
        }
    }

    pub fn clear(&mut self, index: usize) {
        self.write(index, 0);
    }

    fn write(&mut self, index: usize, bit: Spike) {
        match self.pattern.get_mut(index) {
            Some(slot) => {
                *slot = bit;
                let at = index * (self.scale + 1);
                if let Some(e) = self.expanded.get_mut(at) {
                    *e = bit;
                }
            }
            None => log::warn!(
                "Pattern {}: index {} outside length {}, skipped",
                self.id,
                index,
                self.pattern.len()
            ),
        }
    }

    /// `.` for 0, `|` for 1.
    pub fn render(&self) -> String {
        self.expanded
            .iter()
            .map(|&b| if b == 0 { '.' } else { '|' })
            .collect()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Defined bits (before expansion)
    pub fn pattern(&self) -> &[Spike] {
        &self.pattern
    }

    /// Emitted bits
    pub fn bits(&self) -> &[Spike] {
        &self.expanded
    }

    pub fn len(&self) -> usize {
        self.expanded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expanded.is_empty()
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn output(&self) -> Spike {
        self.value
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn targets(&self) -> &[ConnectionId] {
        &self.targets
    }
}

fn expanded_len(bits: usize, scale: usize) -> Option<usize> {
    scale.checked_add(1)?.checked_mul(bits)
}

// ============================================================================
// PATTERN GROUP
// ============================================================================

/// How long a group stays quiet between presentations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GapPolicy {
    /// Always the same number of steps
    Fixed(usize),
    /// A fresh Poisson draw per gap
    Poisson { lambda: f64 },
}

impl GapPolicy {
    /// `hertz > 0`: one presentation every `1000/hertz` steps.
    /// `hertz == 0`: Poisson gaps with mean `poisson_max`.
    pub fn from_settings(hertz: f64, poisson_max: f64) -> Result<Self> {
        if !hertz.is_finite() || hertz < 0.0 {
            return Err(DendronError::config(format!(
                "Hertz must be >= 0 (got {hertz})"
            )));
        }
        if hertz > 0.0 {
            return Ok(GapPolicy::Fixed((1000.0 / hertz).floor() as usize));
        }
        if !(0.0..=MAX_POISSON_LAMBDA).contains(&poisson_max) {
            return Err(DendronError::config(format!(
                "Poisson_Pattern_max must be in [0, {MAX_POISSON_LAMBDA}] (got {poisson_max})"
            )));
        }
        Ok(GapPolicy::Poisson { lambda: poisson_max })
    }
}

/// Patterns presented in lockstep after each gap.
#[derive(Debug, Clone)]
pub struct PatternGroup {
    patterns: Vec<FixedPattern>,
    policy: GapPolicy,
    seed: u64,
    rng: StdRng,
    remaining: usize,
}

impl PatternGroup {
    pub fn new(policy: GapPolicy, seed: u64) -> Self {
        let mut group = Self {
            patterns: Vec::new(),
            policy,
            seed,
            rng: StdRng::seed_from_u64(seed),
            remaining: 0,
        };
        group.remaining = group.draw_gap();
        group
    }

    fn draw_gap(&mut self) -> usize {
        match self.policy {
            GapPolicy::Fixed(steps) => steps,
            GapPolicy::Poisson { lambda } => knuth_poisson(&mut self.rng, lambda),
        }
    }

    pub fn add(&mut self, pattern: FixedPattern) {
        self.patterns.push(pattern);
    }

    pub fn step(&mut self, connections: &mut [Connection]) {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.patterns.iter_mut().for_each(FixedPattern::idle);
            return;
        }

        let mut complete = false;
        for pattern in &mut self.patterns {
            complete |= pattern.step(connections);
        }

        if complete {
            self.patterns.iter_mut().for_each(FixedPattern::rewind);
            self.remaining = self.draw_gap();
        }
    }

    /// Reseed, redraw the gap and rewind every pattern.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.patterns.iter_mut().for_each(FixedPattern::reset);
        self.remaining = self.draw_gap();
    }

    /// Re-expand every member from its defined bits. Either every member is
    /// re-expanded or none is.
    pub fn expand(&mut self, scale: usize) -> Result<()> {
        if let Some(p) = self
            .patterns
            .iter()
            .find(|p| expanded_len(p.pattern().len(), scale).is_none())
        {
            return Err(DendronError::config(format!(
                "pattern {}: scale {scale} is too large",
                p.id()
            )));
        }
        for pattern in &mut self.patterns {
            pattern.expand(scale)?;
        }
        Ok(())
    }

    pub fn set_policy(&mut self, policy: GapPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> GapPolicy {
        self.policy
    }

    /// Steps left in the current gap
    pub fn gap_remaining(&self) -> usize {
        self.remaining
    }

    pub fn patterns(&self) -> &[FixedPattern] {
        &self.patterns
    }

    pub fn patterns_mut(&mut self) -> &mut [FixedPattern] {
        &mut self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

// ============================================================================
// PATTERN FILES
// ============================================================================

/// One pattern per line, `.` for no spike and `|` for a spike.
#[derive(Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" }

spike = { "|" }
rest = { "." }
row = ${ (spike | rest)+ }
file = { SOI ~ NEWLINE* ~ (row ~ (NEWLINE+ ~ row)*)? ~ NEWLINE* ~ EOI }
"#]
struct PatternParser;

/// Parse pattern text into one bit vector per non-blank line.
pub fn parse_patterns(text: &str) -> Result<Vec<Vec<Spike>>> {
    let mut pairs = PatternParser::parse(Rule::file, text)
        .map_err(|e| DendronError::parse(format!("pattern file: {e}")))?;

    let Some(file) = pairs.next() else {
        return Ok(Vec::new());
    };

    Ok(file
        .into_inner()
        .filter(|p| p.as_rule() == Rule::row)
        .map(|row| {
            row.into_inner()
                .map(|glyph| match glyph.as_rule() {
                    Rule::spike => 1,
                    _ => 0,
                })
                .collect()
        })
        .collect())
}

/// Read a pattern file; ids are assigned in line order from `first_id`.
pub fn load_patterns(path: &Path, first_id: usize) -> Result<Vec<FixedPattern>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        DendronError::config(format!("cannot read pattern file {}: {e}", path.display()))
    })?;
    let rows = parse_patterns(&text)?;
    log::debug!("Loaded {} patterns from {}", rows.len(), path.display());
    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(i, bits)| FixedPattern::new(first_id + i, bits))
        .collect())
}

// ============================================================================
// SETTINGS
// ============================================================================

/// Stimulus set parameters (one JSON file per stimulus set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusSettings {
    #[serde(rename = "StimulusScaler")]
    pub scaler: f64,
    #[serde(rename = "Hertz")]
    pub hertz: f64,
    #[serde(rename = "Firing_Rate")]
    pub firing_rate: f64,
    #[serde(rename = "Poisson_Pattern_max")]
    pub poisson_pattern_max: f64,
    #[serde(rename = "Poisson_Pattern_spread", default)]
    pub poisson_pattern_spread: f64,
    #[serde(rename = "Poisson_Pattern_min", default)]
    pub poisson_pattern_min: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(rename = "RefractoryPeriod", default, skip_serializing_if = "Option::is_none")]
    pub refractory_period: Option<f64>,
    #[serde(rename = "Neuron", default, skip_serializing_if = "Option::is_none")]
    pub neuron: Option<NeuronModel>,
}

impl Default for StimulusSettings {
    fn default() -> Self {
        Self {
            scaler: 1.0,
            hertz: 0.0,
            firing_rate: 0.05,
            poisson_pattern_max: 50.0,
            poisson_pattern_spread: 15.0,
            poisson_pattern_min: 2.0,
            threshold: None,
            refractory_period: None,
            neuron: None,
        }
    }
}

impl StimulusSettings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DendronError::config(format!("cannot read stimulus file {}: {e}", path.display()))
        })?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_rate(self.firing_rate)?;
        GapPolicy::from_settings(self.hertz, self.poisson_pattern_max)?;
        self.scale()?;
        Ok(())
    }

    /// `StimulusScaler` as a whole number of inserted zeros.
    pub fn scale(&self) -> Result<usize> {
        scale_from(self.scaler)
    }

    pub fn gap_policy(&self) -> Result<GapPolicy> {
        GapPolicy::from_settings(self.hertz, self.poisson_pattern_max)
    }
}

/// Truncates like a stretch factor. Values outside
/// `[0, MAX_STIMULUS_SCALE]` are errors.
pub fn scale_from(scaler: f64) -> Result<usize> {
    if !(0.0..=MAX_STIMULUS_SCALE as f64).contains(&scaler) {
        return Err(DendronError::config(format!(
            "StimulusScaler must be in [0, {MAX_STIMULUS_SCALE}] (got {scaler})"
        )));
    }
    Ok(scaler as usize)
}

// ============================================================================
// TESTS
// ============================================================================
