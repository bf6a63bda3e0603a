//! # Dendron Sim
//!
//! Wires one cell to its stimulus and runs the step pipeline.
//!
//! ## Topology
//!
//! Every synapse gets its own straight (or delayed) connection. That
//! connection is fed by a dedicated Poisson noise stream and, for the first
//! `patterns.len()` synapses, by the matching pattern stream. 80% of the
//! synapses are excitatory by default; excitatory synapses come first.
//!
//! ## Step pipeline
//!
//! 1. Pre: step every stream (outputs routed into connections)
//! 2. Process: cell pre-integration hook
//! 3. Integrate: the cell, its dendrite and every synapse
//! 4. Diagnostics: read entity state into the sample sink
//! 5. Post: clear or shift every connection

use dendron_cell::{
    Cell, CellParams, Compartment, Connection, Dendrite, FieldChange, LearningRule, NeuronModel,
    Synapse, SynapseKind, SynapseParams, WeightBounds,
};
use dendron_core::{
    require_time_constant, Channel, DendronError, IdGen, Result, SampleSink, Spike, Time,
};
use dendron_stimulus::{
    load_patterns, scale_from, validate_rate, FixedPattern, GapPolicy, PatternGroup, PoissonStream,
    StimulusSettings, MAX_STIMULUS_SCALE,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod control;

pub use control::{spawn, Command, ControlHandle, Controller, RunSummary, Status};

/// Seed the per-stream seeds are drawn from.
pub const MASTER_SEED: u64 = 1963;

// Diagnostic tags
const CELL_KEY: u32 = 0;
const EXCITATORY_KEY: u32 = 1;
const INHIBITORY_KEY: u32 = 2;
const NOISE_KEY: u32 = 3;
const STIMULUS_KEY: u32 = 4;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Run settings file (`neuron.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(rename = "weightMin")]
    pub weight_min: f64,
    #[serde(rename = "weightMax")]
    pub weight_max: f64,
    /// Viewer window start (time mark)
    #[serde(rename = "RangeStart", default)]
    pub range_start: f64,
    /// Viewer window end (time mark)
    #[serde(rename = "RangeEnd", default)]
    pub range_end: f64,
    /// Seconds
    #[serde(rename = "Duration")]
    pub duration: f64,
    /// Microseconds
    #[serde(rename = "TimeStep")]
    pub time_step: f64,
    #[serde(rename = "Synapse_Count")]
    pub synapse_count: usize,
    /// Stimulus set name; `<Stimulus>.json` and `<Stimulus>.txt`
    #[serde(rename = "Stimulus")]
    pub stimulus: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            weight_min: 0.0,
            weight_max: 10.0,
            range_start: 0.0,
            range_end: 1000.0,
            duration: 1.0,
            time_step: 1000.0,
            synapse_count: 10,
            stimulus: "stimulus".to_string(),
        }
    }
}

impl RunSettings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DendronError::config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.time_step > 0.0 && self.time_step.is_finite()) {
            return Err(DendronError::config(format!(
                "TimeStep must be positive (got {})",
                self.time_step
            )));
        }
        if !(self.duration >= 0.0 && self.duration.is_finite()) {
            return Err(DendronError::config(format!(
                "Duration must be >= 0 (got {})",
                self.duration
            )));
        }
        if self.synapse_count == 0 {
            return Err(DendronError::config("Synapse_Count must be at least 1"));
        }
        WeightBounds::new(self.weight_min, self.weight_max)?;
        Ok(())
    }

    /// Number of passes in one run: `Duration` over `TimeStep`.
    pub fn samples(&self) -> usize {
        (self.duration * 1_000_000.0 / self.time_step).round() as usize
    }

    pub fn range(&self) -> (usize, usize) {
        (self.range_start.max(0.0) as usize, self.range_end.max(0.0) as usize)
    }
}

/// Everything needed to build the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub synapse_count: usize,
    pub excitatory_fraction: f64,
    pub seed: u64,
    pub rule: LearningRule,
    pub bounds: WeightBounds,
    pub synapse: SynapseParams,
    pub cell: CellParams,
    pub dendrite_length: f64,
    pub tao_eff: f64,
    /// Connection delay in steps (0 = straight)
    pub connection_delay: usize,
    pub firing_rate: f64,
    pub hertz: f64,
    pub poisson_pattern_max: f64,
    /// Zeros inserted after every pattern bit
    pub scale: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            synapse_count: 10,
            excitatory_fraction: 0.8,
            seed: MASTER_SEED,
            rule: LearningRule::Triplet,
            bounds: WeightBounds::default(),
            synapse: SynapseParams::default(),
            cell: CellParams::default(),
            dendrite_length: 10.0,
            tao_eff: 5.0,
            connection_delay: 0,
            firing_rate: 0.05,
            hertz: 0.0,
            poisson_pattern_max: 50.0,
            scale: 1,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.synapse_count == 0 {
            return Err(DendronError::config("synapse count must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.excitatory_fraction) {
            return Err(DendronError::config(format!(
                "excitatory fraction must be in [0, 1] (got {})",
                self.excitatory_fraction
            )));
        }
        self.bounds.validate()?;
        self.synapse.validate("synapse")?;
        self.cell.validate()?;
        require_time_constant("taoEff", self.tao_eff)?;
        if self.scale > MAX_STIMULUS_SCALE {
            return Err(DendronError::config(format!(
                "pattern scale must be at most {MAX_STIMULUS_SCALE} (got {})",
                self.scale
            )));
        }
        self.gap_policy()?;
        Ok(())
    }

    pub fn gap_policy(&self) -> Result<GapPolicy> {
        GapPolicy::from_settings(self.hertz, self.poisson_pattern_max)
    }

    /// Excitatory synapses, rounded down; the rest are inhibitory.
    pub fn excitatory_count(&self) -> usize {
        ((self.synapse_count as f64 * self.excitatory_fraction).floor() as usize)
            .min(self.synapse_count)
    }
}

/// Settings, stimulus set and pattern rows read from disk.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub run: RunSettings,
    pub stimulus: StimulusSettings,
    pub patterns: Vec<Vec<Spike>>,
    /// Where the stimulus set was read from; `load` re-reads it
    pub stimulus_path: Option<PathBuf>,
}

impl Experiment {
    pub fn new(run: RunSettings, stimulus: StimulusSettings, patterns: Vec<Vec<Spike>>) -> Self {
        Self {
            run,
            stimulus,
            patterns,
            stimulus_path: None,
        }
    }

    /// Read the run settings, then `<dir>/<Stimulus>.json` and
    /// `<dir>/<Stimulus>.txt`. `dir` defaults to `stimulus/` next to the
    /// settings file.
    pub fn load(settings: &Path, stimulus_dir: Option<&Path>) -> Result<Self> {
        let run = RunSettings::from_file(settings)?;
        let dir = match stimulus_dir {
            Some(dir) => dir.to_path_buf(),
            None => settings
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("stimulus"),
        };

        let stimulus_path = dir.join(format!("{}.json", run.stimulus));
        let stimulus = StimulusSettings::from_file(&stimulus_path)?;
        let patterns = load_patterns(&dir.join(format!("{}.txt", run.stimulus)), 0)?
            .into_iter()
            .map(|p| p.pattern().to_vec())
            .collect::<Vec<_>>();

        log::info!(
            "Loaded experiment {} ({} patterns, {} samples)",
            run.stimulus,
            patterns.len(),
            run.samples()
        );

        Ok(Self {
            run,
            stimulus,
            patterns,
            stimulus_path: Some(stimulus_path),
        })
    }

    pub fn network_config(&self) -> Result<NetworkConfig> {
        let mut cell = CellParams::default();
        if let Some(threshold) = self.stimulus.threshold {
            cell.threshold = threshold;
        }
        if let Some(period) = self.stimulus.refractory_period {
            if !(period >= 0.0 && period.fract() == 0.0) {
                return Err(DendronError::config(format!(
                    "RefractoryPeriod must be a non-negative whole number (got {period})"
                )));
            }
            cell.refractory_period = period as u32;
        }

        let config = NetworkConfig {
            synapse_count: self.run.synapse_count,
            bounds: WeightBounds::new(self.run.weight_min, self.run.weight_max)?,
            cell,
            firing_rate: self.stimulus.firing_rate,
            hertz: self.stimulus.hertz,
            poisson_pattern_max: self.stimulus.poisson_pattern_max,
            scale: self.stimulus.scale()?,
            ..NetworkConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// LIVE TUNING
// ============================================================================

/// What a [`FieldUpdate`] is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldTarget {
    Neuron,
    Dendrite,
    /// Every synapse
    Synapse,
    /// Stimulus and weight-bound settings
    Simulation,
}

impl std::str::FromStr for FieldTarget {
    type Err = DendronError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "neuron" | "cell" => Ok(FieldTarget::Neuron),
            "dendrite" => Ok(FieldTarget::Dendrite),
            "synapse" | "synapses" => Ok(FieldTarget::Synapse),
            "simulation" | "sim" => Ok(FieldTarget::Simulation),
            other => Err(DendronError::parse(format!("unknown field target {other:?}"))),
        }
    }
}

impl std::fmt::Display for FieldTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldTarget::Neuron => "neuron",
            FieldTarget::Dendrite => "dendrite",
            FieldTarget::Synapse => "synapse",
            FieldTarget::Simulation => "simulation",
        };
        f.write_str(name)
    }
}

/// A named parameter change, applied by whoever owns the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub target: FieldTarget,
    pub field: String,
    pub value: String,
}

impl FieldUpdate {
    pub fn new(target: FieldTarget, field: &str, value: &str) -> Self {
        Self {
            target,
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

fn parse_value(field: &str, value: &str) -> std::result::Result<f64, String> {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(v) => Err(format!("{field}: {v} is not finite")),
        Err(e) => Err(format!("{field}: cannot parse {value:?} ({e})")),
    }
}

fn rejected(reason: String) -> FieldChange {
    log::warn!("Ignoring field update: {reason}");
    FieldChange::Rejected(reason)
}

// ============================================================================
// SIMULATION
// ============================================================================

/// One cell, its connections and its stimulus.
#[derive(Debug, Clone)]
pub struct Simulation {
    config: NetworkConfig,
    cell: Cell,
    connections: Vec<Connection>,
    noise: Vec<PoissonStream>,
    group: PatternGroup,
}

impl Simulation {
    pub fn build(config: NetworkConfig, patterns: &[Vec<Spike>]) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut synapse_ids = IdGen::new();
        let mut stream_ids = IdGen::new();

        let mut group = PatternGroup::new(config.gap_policy()?, rng.gen());
        for (i, bits) in patterns.iter().enumerate() {
            let mut pattern = FixedPattern::new(i, bits.clone());
            pattern.expand(config.scale)?;
            group.add(pattern);
        }

        let excitatory = config.excitatory_count();
        let mut compartment = Compartment::new(0);
        let mut connections = Vec::with_capacity(config.synapse_count);
        let mut noise = Vec::with_capacity(config.synapse_count);

        for i in 0..config.synapse_count {
            let kind = if i < excitatory {
                SynapseKind::Excitatory
            } else {
                SynapseKind::Inhibitory
            };

            let connection = connections.len();
            connections.push(Connection::delayed(config.connection_delay));

            let synapse = Synapse::new(
                synapse_ids.next_id(),
                kind,
                connection,
                config.synapse.clone(),
                config.bounds,
            )?
            .with_rule(config.rule);
            compartment.add_synapse(synapse);

            let mut stream = PoissonStream::new(stream_ids.next_id(), rng.gen(), config.firing_rate)?;
            stream.attach(connection);
            noise.push(stream);

            if let Some(pattern) = group.patterns_mut().get_mut(i) {
                pattern.attach(connection);
            }
        }

        if group.len() > config.synapse_count {
            log::warn!(
                "{} patterns for {} synapses; extra patterns are not routed",
                group.len(),
                config.synapse_count
            );
        }

        let mut dendrite = Dendrite::new(0, config.dendrite_length, config.tao_eff)?;
        dendrite.add_compartment(compartment);
        let cell = Cell::new(0, config.cell.clone(), dendrite)?;

        log::info!(
            "Network created: {} synapses ({} excitatory, {} inhibitory), {} patterns",
            config.synapse_count,
            excitatory,
            config.synapse_count - excitatory,
            group.len()
        );

        Ok(Self {
            config,
            cell,
            connections,
            noise,
            group,
        })
    }

    /// One pass at time mark `t`. Returns the cell output.
    pub fn step(&mut self, t: Time, sink: &mut dyn SampleSink) -> Spike {
        self.pre();
        self.cell.process();
        let output = self.cell.integrate(t, &self.connections);
        self.diagnostics(t, sink);
        self.post();
        output
    }

    fn pre(&mut self) {
        for stream in &mut self.noise {
            stream.step(&mut self.connections);
        }
        self.group.step(&mut self.connections);
    }

    fn diagnostics(&self, t: Time, sink: &mut dyn SampleSink) {
        for stream in &self.noise {
            sink.put(Channel::Noise, t, stream.output() as f64, stream.id(), NOISE_KEY);
        }
        for pattern in self.group.patterns() {
            sink.put(Channel::Stimulus, t, pattern.output() as f64, pattern.id(), STIMULUS_KEY);
        }

        let cell = &self.cell;
        sink.put(Channel::CellOutput, t, cell.output() as f64, cell.id(), CELL_KEY);

        for syn in cell.dendrite().synapses() {
            let key = if syn.is_excitatory() {
                EXCITATORY_KEY
            } else {
                INHIBITORY_KEY
            };
            sink.put(Channel::SynapseDt, t, syn.last_dt(), syn.id(), key);
            sink.put(Channel::SynapseSurge, t, syn.surge(), syn.id(), key);
            sink.put(Channel::SynapsePsp, t, syn.signed_psp(), syn.id(), key);
            sink.put(Channel::SynapseWeight, t, syn.weight(), syn.id(), key);
        }

        sink.put(Channel::NeuronDt, t, cell.last_dt(), cell.id(), CELL_KEY);
        sink.put(Channel::NeuronPsp, t, cell.psp(), cell.id(), CELL_KEY);
        sink.put(Channel::NeuronApFast, t, cell.ap_fast(), cell.id(), CELL_KEY);
        sink.put(Channel::NeuronApSlow, t, cell.ap_slow(), cell.id(), CELL_KEY);
    }

    fn post(&mut self) {
        self.connections.iter_mut().for_each(Connection::post);
    }

    /// Streams reseeded, cell and weights back to their initial state.
    pub fn reset(&mut self) {
        self.noise.iter_mut().for_each(PoissonStream::reset);
        self.group.reset();
        self.connections.iter_mut().for_each(Connection::clear);
        self.cell.reset();
        log::debug!("Simulation reset");
    }

    /// End of a bounded run.
    pub fn post_process(&mut self, sink: &mut dyn SampleSink) {
        self.cell.post_process();
        sink.post();
    }

    pub fn apply(&mut self, update: &FieldUpdate) -> FieldChange {
        let (field, value) = (update.field.as_str(), update.value.as_str());
        let change = match update.target {
            FieldTarget::Neuron => self.cell.set_field(field, value),
            FieldTarget::Dendrite => self.cell.dendrite_mut().set_field(field, value),
            FieldTarget::Synapse => self.cell.set_synapse_field(field, value),
            FieldTarget::Simulation => self.set_simulation_field(field, value),
        };
        match &change {
            FieldChange::Applied => log::debug!("{} {} = {}", update.target, field, value),
            FieldChange::Unknown => log::debug!("{} has no field {field:?}", update.target),
            FieldChange::Rejected(_) => {}
        }
        change
    }

    fn set_simulation_field(&mut self, field: &str, value: &str) -> FieldChange {
        if !matches!(
            field,
            "StimulusScaler" | "Hertz" | "Poisson_Pattern_max" | "Firing_Rate" | "weightMin" | "weightMax"
        ) {
            return FieldChange::Unknown;
        }
        let v = match parse_value(field, value) {
            Ok(v) => v,
            Err(reason) => return rejected(reason),
        };

        let outcome = match field {
            "StimulusScaler" => scale_from(v).and_then(|scale| {
                self.group.expand(scale)?;
                self.config.scale = scale;
                Ok(())
            }),
            "Hertz" => GapPolicy::from_settings(v, self.config.poisson_pattern_max).map(|policy| {
                self.config.hertz = v;
                self.group.set_policy(policy);
            }),
            "Poisson_Pattern_max" => GapPolicy::from_settings(self.config.hertz, v).map(|policy| {
                self.config.poisson_pattern_max = v;
                self.group.set_policy(policy);
            }),
            "Firing_Rate" => self.set_firing_rate(v),
            "weightMin" => self.set_bounds(v, self.config.bounds.max),
            _ => self.set_bounds(self.config.bounds.min, v),
        };

        match outcome {
            Ok(()) => FieldChange::Applied,
            Err(e) => rejected(e.to_string()),
        }
    }

    fn set_firing_rate(&mut self, rate: f64) -> Result<()> {
        validate_rate(rate)?;
        for stream in &mut self.noise {
            stream.set_firing_rate(rate)?;
        }
        self.config.firing_rate = rate;
        Ok(())
    }

    fn set_bounds(&mut self, min: f64, max: f64) -> Result<()> {
        let bounds = WeightBounds::new(min, max)?;
        self.cell.set_weight_bounds(bounds)?;
        self.config.bounds = bounds;
        Ok(())
    }

    pub fn to_model(&self) -> NeuronModel {
        self.cell.to_model()
    }

    pub fn load_model(&mut self, model: &NeuronModel) -> Result<()> {
        self.cell.apply_model(model)?;
        self.config.bounds = WeightBounds::new(model.w_min, model.w_max)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    pub fn cell_mut(&mut self) -> &mut Cell {
        &mut self.cell
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn noise(&self) -> &[PoissonStream] {
        &self.noise
    }

    pub fn patterns(&self) -> &PatternGroup {
        &self.group
    }

    pub fn synapse_count(&self) -> usize {
        self.cell.dendrite().synapse_count()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use dendron_core::{NullSink, SampleCollection};

    fn config() -> NetworkConfig {
        NetworkConfig {
            synapse_count: 10,
            hertz: 100.0,
            ..NetworkConfig::default()
        }
    }

    fn patterns() -> Vec<Vec<Spike>> {
        vec![vec![1, 0, 1], vec![0, 1, 0], vec![1, 1, 1]]
    }

    #[test]
    fn test_topology() {
        let sim = Simulation::build(config(), &patterns()).unwrap();
        let syns: Vec<_> = sim.cell().dendrite().synapses().collect();
        assert_eq!(syns.len(), 10);
        assert_eq!(syns.iter().filter(|s| s.is_excitatory()).count(), 8);
        assert!(syns[..8].iter().all(|s| s.is_excitatory()));

        for (i, syn) in syns.iter().enumerate() {
            assert_eq!(syn.connection(), i);
            assert_eq!(sim.noise()[i].targets(), &[i]);
        }
        for (i, pattern) in sim.patterns().patterns().iter().enumerate() {
            assert_eq!(pattern.targets(), &[i]);
            assert_eq!(pattern.scale(), 1);
        }

        // Distinct noise seeds
        let mut seeds: Vec<u64> = sim.noise().iter().map(|s| s.seed()).collect();
        seeds.dedup();
        assert_eq!(seeds.len(), 10);
    }

    #[test]
    fn test_odd_synapse_count_keeps_every_synapse() {
        let cfg = NetworkConfig {
            synapse_count: 7,
            ..config()
        };
        let sim = Simulation::build(cfg, &[]).unwrap();
        assert_eq!(sim.synapse_count(), 7);
        let inhibitory = sim
            .cell()
            .dendrite()
            .synapses()
            .filter(|s| !s.is_excitatory())
            .count();
        assert_eq!(inhibitory, 2);
    }

    #[test]
    fn test_connections_cleared_after_step() {
        let mut sim = Simulation::build(config(), &patterns()).unwrap();
        let mut sink = NullSink;
        for t in 0..50 {
            sim.step(t as Time, &mut sink);
            assert!(sim.connections().iter().all(|c| c.output() == 0));
        }
    }

    #[test]
    fn test_reset_reproduces_run() {
        let mut sim = Simulation::build(config(), &patterns()).unwrap();
        let mut sink = NullSink;

        let run = |sim: &mut Simulation, sink: &mut NullSink| {
            let outputs: Vec<Spike> = (0..400).map(|t| sim.step(t as Time, sink)).collect();
            let weights: Vec<u64> = sim
                .cell()
                .dendrite()
                .synapses()
                .map(|s| s.weight().to_bits())
                .collect();
            (outputs, weights)
        };

        let first = run(&mut sim, &mut sink);
        sim.reset();
        let second = run(&mut sim, &mut sink);
        assert_eq!(first, second);
    }

    #[test]
    fn test_diagnostics_signed_psp() {
        let mut sim = Simulation::build(config(), &patterns()).unwrap();
        let steps = 300;
        let mut samples = SampleCollection::new(10, steps);
        for t in 0..steps {
            sim.step(t as Time, &mut samples);
        }
        samples.post();

        let psp = samples.channel(Channel::SynapsePsp);
        for lane in 0..8 {
            assert!(psp.min(lane).unwrap() >= 0.0);
        }
        for lane in 8..10 {
            assert!(psp.max(lane).unwrap() <= 0.0);
        }

        let noise = samples.channel(Channel::Noise);
        assert!((0..10).any(|lane| noise.max(lane).unwrap() == 1.0));
        assert_eq!(
            samples.channel(Channel::SynapseWeight).key(0.0, 9),
            Some(INHIBITORY_KEY)
        );
    }

    #[test]
    fn test_simulation_fields() {
        let mut sim = Simulation::build(config(), &patterns()).unwrap();

        let scale = FieldUpdate::new(FieldTarget::Simulation, "StimulusScaler", "3");
        assert!(sim.apply(&scale).is_applied());
        assert_eq!(sim.patterns().patterns()[0].len(), 12);

        let rate = FieldUpdate::new(FieldTarget::Simulation, "Firing_Rate", "7");
        assert!(matches!(sim.apply(&rate), FieldChange::Rejected(_)));
        assert_eq!(sim.noise()[0].firing_rate(), 0.05);

        let rate = FieldUpdate::new(FieldTarget::Simulation, "Firing_Rate", "0.1");
        assert!(sim.apply(&rate).is_applied());
        assert!(sim.noise().iter().all(|s| s.firing_rate() == 0.1));

        let hertz = FieldUpdate::new(FieldTarget::Simulation, "Hertz", "250");
        assert!(sim.apply(&hertz).is_applied());
        assert_eq!(sim.patterns().policy(), GapPolicy::Fixed(4));

        let wmax = FieldUpdate::new(FieldTarget::Simulation, "weightMax", "2");
        assert!(sim.apply(&wmax).is_applied());
        assert!(sim.cell().dendrite().synapses().all(|s| s.weight() <= 2.0));

        let bad = FieldUpdate::new(FieldTarget::Simulation, "weightMin", "5");
        assert!(matches!(sim.apply(&bad), FieldChange::Rejected(_)));

        let huge = FieldUpdate::new(FieldTarget::Simulation, "StimulusScaler", "1e20");
        assert!(matches!(sim.apply(&huge), FieldChange::Rejected(_)));
        assert_eq!(sim.config().scale, 3);
        assert_eq!(sim.patterns().patterns()[0].len(), 12);

        let big = NetworkConfig {
            scale: usize::MAX,
            ..config()
        };
        assert!(Simulation::build(big, &patterns()).is_err());

        let unknown = FieldUpdate::new(FieldTarget::Simulation, "Colour", "red");
        assert_eq!(sim.apply(&unknown), FieldChange::Unknown);

        let threshold = FieldUpdate::new(FieldTarget::Neuron, "threshold", "1.5");
        assert!(sim.apply(&threshold).is_applied());
        assert_eq!(sim.cell().params().threshold, 1.5);
    }

    #[test]
    fn test_run_settings_samples() {
        let settings = RunSettings {
            duration: 2.0,
            time_step: 500.0,
            ..RunSettings::default()
        };
        assert_eq!(settings.samples(), 4000);

        let json = r#"{
            "weightMin": 0.0, "weightMax": 5.0, "RangeStart": 0, "RangeEnd": 500,
            "Duration": 0.5, "TimeStep": 1000, "Synapse_Count": 20, "Stimulus": "set1"
        }"#;
        let settings: RunSettings = serde_json::from_str(json).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.samples(), 500);
        assert_eq!(settings.range(), (0, 500));

        let bad = RunSettings {
            time_step: 0.0,
            ..RunSettings::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_experiment_from_files() {
        let dir = std::env::temp_dir().join(format!("dendron-sim-exp-{}", std::process::id()));
        let stim_dir = dir.join("stimulus");
        std::fs::create_dir_all(&stim_dir).unwrap();

        let run = RunSettings {
            synapse_count: 5,
            stimulus: "set1".to_string(),
            ..RunSettings::default()
        };
        let settings_path = dir.join("neuron.json");
        std::fs::write(&settings_path, serde_json::to_string(&run).unwrap()).unwrap();

        // Missing stimulus set fails fast
        assert!(Experiment::load(&settings_path, None).is_err());

        let stimulus = StimulusSettings {
            threshold: Some(2.0),
            refractory_period: Some(4.0),
            ..StimulusSettings::default()
        };
        stimulus.to_file(&stim_dir.join("set1.json")).unwrap();
        std::fs::write(stim_dir.join("set1.txt"), "|..|\n.||.\n").unwrap();

        let experiment = Experiment::load(&settings_path, None).unwrap();
        assert_eq!(experiment.patterns.len(), 2);
        assert_eq!(experiment.patterns[0], vec![1, 0, 0, 1]);

        let cfg = experiment.network_config().unwrap();
        assert_eq!(cfg.synapse_count, 5);
        assert_eq!(cfg.cell.threshold, 2.0);
        assert_eq!(cfg.cell.refractory_period, 4);

        std::fs::remove_dir_all(&dir).ok();
    }
}
