//! # Dendron Cell
//!
//! The single-neuron kernel: a soma that owns one dendrite, a dendrite that
//! owns compartments, and compartments that own synapses. Synapses read their
//! pre-synaptic input from a [`Connection`] and learn with a triplet STDP rule.
//!
//! ## Ownership
//!
//! Parents own children in ordered `Vec`s. Children never point back at their
//! parent; instead the soma hands a [`PostTraces`] snapshot down the tree each
//! step, and synapses refer to their connection by index into the
//! simulation-owned connection table.
//!
//! ## Time constants
//!
//! Every decay is closed form, `x(t) = x0 * exp(-dt/tao)`. A zero time
//! constant is rejected when a network is built or loaded.

use dendron_core::{require_time_constant, DendronError, Result, Spike, Time};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub mod schema;

pub use schema::{CompartmentModel, DendriteModel, NeuronModel, SynapseModel};

/// Index into the connection table owned by the simulation wiring.
pub type ConnectionId = usize;

/// Time mark a synapse starts from after reset and at the end of each run.
pub const INITIAL_PRE_T: Time = 0.0;

/// Time mark the soma starts from: far enough back that the first spike is
/// fully efficacious.
pub const NEVER_FIRED: Time = -1.0e15;

// ============================================================================
// CONNECTION
// ============================================================================

/// Merges zero or more spike producers into one bit per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Connection {
    /// No delay: input appears on the output in the same step
    Straight { value: Spike },
    /// Output is the merged input from `line.len()` steps ago
    Delayed { line: VecDeque<Spike>, staged: Spike },
}

impl Default for Connection {
    fn default() -> Self {
        Self::straight()
    }
}

impl Connection {
    pub fn straight() -> Self {
        Connection::Straight { value: 0 }
    }

    /// A delay line of `depth` steps. A depth of 0 is a straight connection.
    pub fn delayed(depth: usize) -> Self {
        if depth == 0 {
            return Self::straight();
        }
        Connection::Delayed {
            line: VecDeque::from(vec![0; depth]),
            staged: 0,
        }
    }

    /// OR the bit into the current step's value.
    pub fn input(&mut self, bit: Spike) {
        match self {
            Connection::Straight { value } => *value |= bit & 1,
            Connection::Delayed { staged, .. } => *staged |= bit & 1,
        }
    }

    pub fn output(&self) -> Spike {
        match self {
            Connection::Straight { value } => *value,
            Connection::Delayed { line, .. } => line.front().copied().unwrap_or(0),
        }
    }

    /// End-of-step: clear (straight) or shift the line (delayed).
    pub fn post(&mut self) {
        match self {
            Connection::Straight { value } => *value = 0,
            Connection::Delayed { line, staged } => {
                line.push_back(*staged);
                line.pop_front();
                *staged = 0;
            }
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Connection::Straight { .. } => 0,
            Connection::Delayed { line, .. } => line.len(),
        }
    }

    /// Drop everything in flight.
    pub fn clear(&mut self) {
        match self {
            Connection::Straight { value } => *value = 0,
            Connection::Delayed { line, staged } => {
                line.iter_mut().for_each(|b| *b = 0);
                *staged = 0;
            }
        }
    }
}

// ============================================================================
// LIVE TUNING
// ============================================================================

/// Result of a `set_field` call.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Applied,
    /// Unrecognized name; nothing changed
    Unknown,
    /// Recognized name but unusable value; previous value kept
    Rejected(String),
}

impl FieldChange {
    pub fn is_applied(&self) -> bool {
        matches!(self, FieldChange::Applied)
    }
}

fn parse_field(field: &str, value: &str) -> std::result::Result<f64, String> {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(v) => Err(format!("{field}: {v} is not finite")),
        Err(e) => Err(format!("{field}: cannot parse {value:?} ({e})")),
    }
}

/// Parse and store `value` into `slot`, keeping the old value on failure.
fn assign(slot: &mut f64, field: &str, value: &str) -> FieldChange {
    match parse_field(field, value) {
        Ok(v) => {
            *slot = v;
            FieldChange::Applied
        }
        Err(reason) => reject(reason),
    }
}

/// Like `assign` but the value must also be a valid time constant.
fn assign_tao(slot: &mut f64, field: &str, value: &str) -> FieldChange {
    match parse_field(field, value) {
        Ok(v) => match require_time_constant(field, v) {
            Ok(()) => {
                *slot = v;
                FieldChange::Applied
            }
            Err(e) => reject(e.to_string()),
        },
        Err(reason) => reject(reason),
    }
}

fn reject(reason: String) -> FieldChange {
    log::warn!("Ignoring field update: {reason}");
    FieldChange::Rejected(reason)
}

// ============================================================================
// SYNAPSE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynapseKind {
    Excitatory,
    Inhibitory,
}

impl SynapseKind {
    pub fn sign(&self) -> f64 {
        match self {
            SynapseKind::Excitatory => 1.0,
            SynapseKind::Inhibitory => -1.0,
        }
    }
}

/// Weight update rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningRule {
    /// One pre trace, fast and slow post traces
    #[default]
    Triplet,
    /// Classic pair-based rule, kept for comparison runs
    Pair,
}

/// Weight bounds shared by every synapse of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 10.0 }
    }
}

impl WeightBounds {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        let bounds = Self { min, max };
        bounds.validate()?;
        Ok(bounds)
    }

    /// `0 <= min <= max` and `max > 0` (weights are normalized by `max`).
    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(DendronError::config("weight bounds must be finite"));
        }
        if self.min < 0.0 || self.max <= 0.0 || self.min > self.max {
            return Err(DendronError::config(format!(
                "weight bounds must satisfy 0 <= wMin <= wMax, wMax > 0 (got [{}, {}])",
                self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn clamp(&self, w: f64) -> f64 {
        w.min(self.max).max(self.min)
    }

    pub fn contains(&self, w: f64) -> bool {
        w >= self.min && w <= self.max
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }
}

/// Per-synapse tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapseParams {
    pub tao_p: f64,   // Excitatory PSP decay
    pub tao_n: f64,   // Inhibitory PSP decay
    pub tao_i: f64,   // Pre-spike efficacy recovery
    pub ama: f64,     // Surge amplitude
    pub amb: f64,     // Surge base (pair rule)
    pub tsw: f64,     // Surge window (pair rule)
    pub mu: f64,      // Weight dependence: 0 additive, 1 multiplicative
    pub lambda: f64,  // Learning rate
    pub alpha: f64,   // Depression/potentiation asymmetry
    pub learning_rate_slow: f64,
    pub learning_rate_fast: f64,
    pub distance: f64, // From soma
}

impl Default for SynapseParams {
    fn default() -> Self {
        Self {
            tao_p: 15.0,
            tao_n: 12.0,
            tao_i: 30.0,
            ama: 1.0,
            amb: 1.0,
            tsw: 1.0,
            mu: 1.0,
            lambda: 0.05,
            alpha: 1.0,
            learning_rate_slow: 0.0,
            learning_rate_fast: 0.0,
            distance: 0.0,
        }
    }
}

impl SynapseParams {
    pub fn validate(&self, label: &str) -> Result<()> {
        require_time_constant(&format!("{label}.taoP"), self.tao_p)?;
        require_time_constant(&format!("{label}.taoN"), self.tao_n)?;
        require_time_constant(&format!("{label}.taoI"), self.tao_i)?;
        require_time_constant(&format!("{label}.tsw"), self.tsw)?;
        let finite = [
            ("ama", self.ama),
            ("amb", self.amb),
            ("mu", self.mu),
            ("lambda", self.lambda),
            ("alpha", self.alpha),
            ("learningRateSlow", self.learning_rate_slow),
            ("learningRateFast", self.learning_rate_fast),
            ("distance", self.distance),
        ];
        for (name, v) in finite {
            if !v.is_finite() {
                return Err(DendronError::config(format!("{label}.{name} must be finite")));
            }
        }
        Ok(())
    }
}

/// What a synapse sees of its cell during integration.
///
/// Captured before the dendrite integrates, so `output` and the AP traces are
/// the values left by the previous step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PostTraces {
    pub output: Spike,
    pub ap_fast: f64,
    pub ap_slow: f64,
    pub ap_slow_prior: f64,
    pub efficacy: f64,
}

#[derive(Debug, Clone)]
pub struct Synapse {
    id: usize,
    kind: SynapseKind,
    rule: LearningRule,
    connection: ConnectionId,
    compartment: usize,

    params: SynapseParams,
    bounds: WeightBounds,

    w: f64,
    psp: f64,
    surge: f64,
    prev_efficacy_trace: f64,
    pre_t: Time,
    distance_efficacy: f64,

    // Diagnostics
    last_dt: f64,
}

impl Synapse {
    pub fn new(
        id: usize,
        kind: SynapseKind,
        connection: ConnectionId,
        params: SynapseParams,
        bounds: WeightBounds,
    ) -> Result<Self> {
        params.validate(&format!("synapse[{id}]"))?;
        bounds.validate()?;
        Ok(Self {
            id,
            kind,
            rule: LearningRule::Triplet,
            connection,
            compartment: 0,
            params,
            bounds,
            w: bounds.midpoint(),
            psp: 0.0,
            surge: 0.0,
            prev_efficacy_trace: 1.0,
            pre_t: INITIAL_PRE_T,
            distance_efficacy: 1.0,
            last_dt: 0.0,
        })
    }

    pub fn with_rule(mut self, rule: LearningRule) -> Self {
        self.rule = rule;
        self
    }

    /// Midpoint weight, cleared traces.
    pub fn reset(&mut self) {
        self.prev_efficacy_trace = 1.0;
        self.surge = 0.0;
        self.psp = 0.0;
        self.pre_t = INITIAL_PRE_T;
        self.last_dt = 0.0;
        self.w = self.bounds.midpoint();
    }

    /// Per-step hook ahead of integration; nothing to do yet.
    pub fn process(&mut self) {}

    /// End of a run (not a pass).
    pub fn post_process(&mut self) {
        self.pre_t = INITIAL_PRE_T;
    }

    /// Advance one step and return the signed, weighted contribution.
    pub fn integrate(&mut self, t: Time, cell: &PostTraces, connections: &[Connection]) -> f64 {
        let input = connections
            .get(self.connection)
            .map(Connection::output)
            .unwrap_or(0);

        match self.rule {
            LearningRule::Triplet => self.triplet_integrate(t, cell, input),
            LearningRule::Pair => self.pair_integrate(t, cell, input),
        }

        self.kind.sign() * self.psp * self.w
    }

    // Depression: fast post trace read at the pre spike.
    // Potentiation: slow post trace (t-1) plus pre trace read at the post spike.
    fn triplet_integrate(&mut self, t: Time, cell: &PostTraces, input: Spike) {
        let mut dt = t - self.pre_t;
        self.last_dt = dt;

        let tao = self.tao();
        let mut dw_d = 0.0;
        let mut dw_p = 0.0;
        let mut update = false;

        if input == 1 {
            self.surge = self.psp + self.params.ama * (-self.psp / tao).exp();

            // LTD
            dw_d = self.prev_efficacy_trace * self.weight_factor(false, self.w) * cell.ap_fast;

            self.prev_efficacy_trace = efficacy(dt, self.params.tao_i);

            self.pre_t = t;
            dt = 0.0;
            update = true;
        }

        self.psp = self.surge * (-dt / tao).exp();

        if cell.output == 1 {
            // LTP
            dw_p = cell.efficacy
                * self.distance_efficacy
                * self.weight_factor(true, self.w)
                * (self.psp + cell.ap_slow_prior);
            update = true;
        }

        // Both terms first, then clamp once.
        if update {
            self.w = self.bounds.clamp(self.w + dw_p - dw_d);
        }
    }

    fn pair_integrate(&mut self, t: Time, cell: &PostTraces, input: Spike) {
        let dt = t - self.pre_t;
        self.last_dt = dt;

        if input == 1 {
            self.surge = self.params.amb - self.params.ama * (-self.psp / self.params.tsw).exp();
            self.psp = self.surge;
            self.w = self.bounds.clamp(self.w - cell.ap_fast);
            self.pre_t = t;
        } else {
            self.psp = self.surge * (-dt / self.tao()).exp();
        }

        if cell.output == 1 {
            self.w = self.bounds.clamp(self.w + self.psp);
        }
    }

    /// `lambda*(1 - w/wMax)^mu` when potentiating, `lambda*alpha*(w/wMax)^mu`
    /// when depressing.
    pub fn weight_factor(&self, potentiation: bool, w: f64) -> f64 {
        let p = &self.params;
        if potentiation {
            p.lambda * (1.0 - w / self.bounds.max).powf(p.mu)
        } else {
            p.lambda * p.alpha * (w / self.bounds.max).powf(p.mu)
        }
    }

    fn tao(&self) -> f64 {
        match self.kind {
            SynapseKind::Excitatory => self.params.tao_p,
            SynapseKind::Inhibitory => self.params.tao_n,
        }
    }

    pub fn set_field(&mut self, field: &str, value: &str) -> FieldChange {
        let p = &mut self.params;
        match field {
            "ama" => assign(&mut p.ama, field, value),
            "amb" => assign(&mut p.amb, field, value),
            "tsw" => assign_tao(&mut p.tsw, field, value),
            "mu" => assign(&mut p.mu, field, value),
            "lambda" => assign(&mut p.lambda, field, value),
            "alpha" => assign(&mut p.alpha, field, value),
            "learningRateSlow" => assign(&mut p.learning_rate_slow, field, value),
            "learningRateFast" => assign(&mut p.learning_rate_fast, field, value),
            "taoP" => assign_tao(&mut p.tao_p, field, value),
            "taoN" => assign_tao(&mut p.tao_n, field, value),
            "taoI" => assign_tao(&mut p.tao_i, field, value),
            "distance" => assign(&mut p.distance, field, value),
            _ => FieldChange::Unknown,
        }
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> SynapseKind {
        self.kind
    }

    pub fn is_excitatory(&self) -> bool {
        self.kind == SynapseKind::Excitatory
    }

    pub fn rule(&self) -> LearningRule {
        self.rule
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Id of the owning compartment
    pub fn compartment(&self) -> usize {
        self.compartment
    }

    pub fn params(&self) -> &SynapseParams {
        &self.params
    }

    pub fn bounds(&self) -> WeightBounds {
        self.bounds
    }

    pub fn weight(&self) -> f64 {
        self.w
    }

    /// Saturates into the bounds.
    pub fn set_weight(&mut self, w: f64) {
        self.w = self.bounds.clamp(w);
    }

    /// Tighten or widen the bounds; the weight is clamped into the new range.
    pub fn set_bounds(&mut self, bounds: WeightBounds) {
        self.bounds = bounds;
        self.w = bounds.clamp(self.w);
    }

    /// Unsigned PSP trace
    pub fn psp(&self) -> f64 {
        self.psp
    }

    /// PSP with the synapse's polarity applied
    pub fn signed_psp(&self) -> f64 {
        self.kind.sign() * self.psp
    }

    pub fn surge(&self) -> f64 {
        self.surge
    }

    pub fn last_spike_time(&self) -> Time {
        self.pre_t
    }

    pub fn prev_efficacy_trace(&self) -> f64 {
        self.prev_efficacy_trace
    }

    pub fn distance_efficacy(&self) -> f64 {
        self.distance_efficacy
    }

    /// `t - lastSpikeTime` seen by the most recent integration
    pub fn last_dt(&self) -> f64 {
        self.last_dt
    }

    pub(crate) fn set_distance_efficacy(&mut self, e: f64) {
        self.distance_efficacy = e;
    }

    pub(crate) fn set_compartment(&mut self, id: usize) {
        self.compartment = id;
    }

    pub(crate) fn replace_params(&mut self, params: SynapseParams) {
        self.params = params;
    }

    pub(crate) fn replace_weight(&mut self, w: f64) {
        self.w = w;
    }
}

/// Recovery curve: 0 right after a spike, approaching 1 with time constant `tao`.
pub fn efficacy(dt: f64, tao: f64) -> f64 {
    1.0 - (-dt / tao).exp()
}

// ============================================================================
// COMPARTMENT
// ============================================================================

/// An ordered group of synapses at one location along the dendrite.
#[derive(Debug, Clone, Default)]
pub struct Compartment {
    id: usize,
    synapses: Vec<Synapse>,
}

impl Compartment {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            synapses: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn add_synapse(&mut self, mut synapse: Synapse) {
        synapse.set_compartment(self.id);
        self.synapses.push(synapse);
    }

    pub fn synapses(&self) -> &[Synapse] {
        &self.synapses
    }

    pub fn synapses_mut(&mut self) -> &mut [Synapse] {
        &mut self.synapses
    }

    pub fn process(&mut self) {
        self.synapses.iter_mut().for_each(Synapse::process);
    }

    pub fn post_process(&mut self) {
        self.synapses.iter_mut().for_each(Synapse::post_process);
    }

    pub fn reset(&mut self) {
        self.synapses.iter_mut().for_each(Synapse::reset);
    }

    /// Plain sum; no floor at this level.
    pub fn integrate(&mut self, t: Time, cell: &PostTraces, connections: &[Connection]) -> f64 {
        self.synapses
            .iter_mut()
            .map(|s| s.integrate(t, cell, connections))
            .sum()
    }
}

// ============================================================================
// DENDRITE
// ============================================================================

#[derive(Debug, Clone)]
pub struct Dendrite {
    id: usize,
    compartments: Vec<Compartment>,
    length: f64,
    tao_eff: f64,
}

impl Dendrite {
    pub fn new(id: usize, length: f64, tao_eff: f64) -> Result<Self> {
        require_time_constant("taoEff", tao_eff)?;
        if !length.is_finite() {
            return Err(DendronError::config("dendrite length must be finite"));
        }
        Ok(Self {
            id,
            compartments: Vec::new(),
            length,
            tao_eff,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn tao_eff(&self) -> f64 {
        self.tao_eff
    }

    pub fn add_compartment(&mut self, compartment: Compartment) {
        self.compartments.push(compartment);
        self.refresh_efficacy();
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn compartments_mut(&mut self) -> &mut [Compartment] {
        &mut self.compartments
    }

    pub fn synapses(&self) -> impl Iterator<Item = &Synapse> {
        self.compartments.iter().flat_map(|c| c.synapses().iter())
    }

    pub fn synapses_mut(&mut self) -> impl Iterator<Item = &mut Synapse> {
        self.compartments
            .iter_mut()
            .flat_map(|c| c.synapses_mut().iter_mut())
    }

    pub fn synapse_count(&self) -> usize {
        self.compartments.iter().map(|c| c.synapses().len()).sum()
    }

    /// Back-propagating AP efficacy at `distance` from the soma.
    pub fn ap_efficacy(&self, distance: f64) -> f64 {
        ap_efficacy(self.length, self.tao_eff, distance)
    }

    /// Re-cache every synapse's distance efficacy.
    pub fn refresh_efficacy(&mut self) {
        let (length, tao_eff) = (self.length, self.tao_eff);
        for syn in self.synapses_mut() {
            let e = ap_efficacy(length, tao_eff, syn.params().distance);
            syn.set_distance_efficacy(e);
        }
    }

    pub fn process(&mut self) {
        self.compartments.iter_mut().for_each(Compartment::process);
    }

    pub fn post_process(&mut self) {
        self.compartments.iter_mut().for_each(Compartment::post_process);
    }

    pub fn reset(&mut self) {
        self.compartments.iter_mut().for_each(Compartment::reset);
    }

    /// Net dendritic input, floored at zero.
    pub fn integrate(&mut self, t: Time, cell: &PostTraces, connections: &[Connection]) -> f64 {
        let psp: f64 = self
            .compartments
            .iter_mut()
            .map(|c| c.integrate(t, cell, connections))
            .sum();
        psp.max(0.0)
    }

    pub fn set_field(&mut self, field: &str, value: &str) -> FieldChange {
        let change = match field {
            "length" => assign(&mut self.length, field, value),
            "taoEff" => assign_tao(&mut self.tao_eff, field, value),
            _ => FieldChange::Unknown,
        };
        if change.is_applied() {
            self.refresh_efficacy();
        }
        change
    }

    pub(crate) fn set_geometry(&mut self, length: f64, tao_eff: f64) {
        self.length = length;
        self.tao_eff = tao_eff;
    }
}

fn ap_efficacy(length: f64, tao_eff: f64, distance: f64) -> f64 {
    if distance < length {
        return 1.0;
    }
    (-(length - distance) / tao_eff).exp()
}

// ============================================================================
// CELL
// ============================================================================

/// Soma tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellParams {
    pub threshold: f64,
    pub ap_max: f64,
    pub ntao: f64,       // Fast AP trace decay
    pub ntao_s: f64,     // Slow AP trace decay
    pub ntao_j: f64,     // Post-spike efficacy recovery
    pub fast_surge: f64, // nFastSurge
    pub slow_surge: f64, // nSlowSurge
    pub refractory_period: u32,
}

impl Default for CellParams {
    fn default() -> Self {
        Self {
            threshold: 5.0,
            ap_max: 1.0,
            ntao: 15.0,
            ntao_s: 100.0,
            ntao_j: 20.0,
            fast_surge: 1.0,
            slow_surge: 1.0,
            refractory_period: 3,
        }
    }
}

impl CellParams {
    pub fn validate(&self) -> Result<()> {
        require_time_constant("ntao", self.ntao)?;
        require_time_constant("ntaoS", self.ntao_s)?;
        require_time_constant("ntaoJ", self.ntao_j)?;
        for (name, v) in [
            ("Threshold", self.threshold),
            ("APMax", self.ap_max),
            ("nFastSurge", self.fast_surge),
            ("nSlowSurge", self.slow_surge),
        ] {
            if !v.is_finite() {
                return Err(DendronError::config(format!("{name} must be finite")));
            }
        }
        Ok(())
    }
}

/// Soma state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Integrating,
    Refractory,
}

/// A neuron with one dendrite.
#[derive(Debug, Clone)]
pub struct Cell {
    id: usize,
    params: CellParams,

    output: Spike,
    prev_output: Spike,

    ap_fast: f64,
    ap_slow: f64,
    ap_slow_prior: f64,

    // Surge bases recomputed at each AP
    fast_surge_base: f64,
    slow_surge_base: f64,

    pre_t: Time,
    efficacy_trace: f64,

    refractory: bool,
    refractory_count: u32,

    // Diagnostics
    psp: f64,
    last_dt: f64,

    dendrite: Dendrite,
}

impl Cell {
    pub fn new(id: usize, params: CellParams, mut dendrite: Dendrite) -> Result<Self> {
        params.validate()?;
        dendrite.refresh_efficacy();
        let mut cell = Self {
            id,
            params,
            output: 0,
            prev_output: 0,
            ap_fast: 0.0,
            ap_slow: 0.0,
            ap_slow_prior: 0.0,
            fast_surge_base: 0.0,
            slow_surge_base: 0.0,
            pre_t: NEVER_FIRED,
            efficacy_trace: 0.0,
            refractory: false,
            refractory_count: 0,
            psp: 0.0,
            last_dt: 0.0,
            dendrite,
        };
        cell.reset();
        Ok(cell)
    }

    /// Clear soma traces and reset every synapse.
    pub fn reset(&mut self) {
        self.ap_fast = 0.0;
        self.ap_slow = 0.0;
        self.ap_slow_prior = 0.0;
        self.pre_t = NEVER_FIRED;
        self.refractory = false;
        self.refractory_count = 0;
        self.fast_surge_base = 0.0;
        self.slow_surge_base = 0.0;
        self.output = 0;
        self.prev_output = 0;
        self.efficacy_trace = 0.0;
        self.psp = 0.0;
        self.last_dt = 0.0;
        self.dendrite.reset();
    }

    /// Pre-integration hook; passes through to the dendrite.
    pub fn process(&mut self) {
        self.dendrite.process();
    }

    /// End of a run (not a pass).
    pub fn post_process(&mut self) {
        self.dendrite.post_process();
    }

    /// Snapshot handed to the synapses this step.
    pub fn traces(&self) -> PostTraces {
        PostTraces {
            output: self.output,
            ap_fast: self.ap_fast,
            ap_slow: self.ap_slow,
            ap_slow_prior: self.ap_slow_prior,
            efficacy: self.efficacy_trace,
        }
    }

    /// One step of the soma. Returns the output bit.
    pub fn integrate(&mut self, t: Time, connections: &[Connection]) -> Spike {
        let mut dt = t - self.pre_t;
        self.last_dt = dt;

        self.efficacy_trace = efficacy(dt, self.params.ntao_j);

        let traces = self.traces();
        let psp = self.dendrite.integrate(t, &traces, connections);
        self.psp = psp;

        self.prev_output = self.output;
        self.output = 0;

        if self.refractory {
            self.refractory_count += 1;
            if self.refractory_count >= self.params.refractory_period {
                self.refractory = false;
                self.refractory_count = 0;
            }
        } else if psp > self.params.threshold {
            self.refractory = self.params.refractory_period > 0;
            self.output = 1;

            // Surge from the current (pre-decay) traces
            let p = &self.params;
            self.fast_surge_base =
                p.ap_max + self.ap_fast * p.fast_surge * (-self.ap_fast / p.ntao).exp();
            self.slow_surge_base =
                p.ap_max + self.ap_slow * p.slow_surge * (-self.ap_slow / p.ntao_s).exp();

            self.pre_t = t;
            dt = 0.0;
        }

        // Prior is for the triplet term, read by synapses next step
        self.ap_slow_prior = self.ap_slow;

        self.ap_fast = self.fast_surge_base * (-dt / self.params.ntao).exp();
        self.ap_slow = self.slow_surge_base * (-dt / self.params.ntao_s).exp();

        self.output
    }

    pub fn set_field(&mut self, field: &str, value: &str) -> FieldChange {
        let p = &mut self.params;
        match field {
            "threshold" | "Threshold" => assign(&mut p.threshold, field, value),
            "nFastSurge" => assign(&mut p.fast_surge, field, value),
            "nSlowSurge" => assign(&mut p.slow_surge, field, value),
            "ntao" => assign_tao(&mut p.ntao, field, value),
            "ntaoS" => assign_tao(&mut p.ntao_s, field, value),
            "ntaoJ" => assign_tao(&mut p.ntao_j, field, value),
            "APMax" => assign(&mut p.ap_max, field, value),
            "RefractoryPeriod" => match parse_field(field, value).and_then(|v| period(field, v)) {
                Ok(n) => {
                    p.refractory_period = n;
                    FieldChange::Applied
                }
                Err(reason) => reject(reason),
            },
            _ => FieldChange::Unknown,
        }
    }

    /// Apply a field to every synapse. Distance changes re-cache the AP
    /// efficacy.
    pub fn set_synapse_field(&mut self, field: &str, value: &str) -> FieldChange {
        let mut result = FieldChange::Unknown;
        for syn in self.dendrite.synapses_mut() {
            result = syn.set_field(field, value);
            if !result.is_applied() {
                return result;
            }
        }
        if field == "distance" && result.is_applied() {
            self.dendrite.refresh_efficacy();
        }
        result
    }

    pub fn set_weight_bounds(&mut self, bounds: WeightBounds) -> Result<()> {
        bounds.validate()?;
        for syn in self.dendrite.synapses_mut() {
            syn.set_bounds(bounds);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn params(&self) -> &CellParams {
        &self.params
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.params.threshold = threshold;
    }

    pub fn output(&self) -> Spike {
        self.output
    }

    pub fn prev_output(&self) -> Spike {
        self.prev_output
    }

    pub fn state(&self) -> CellState {
        if self.refractory {
            CellState::Refractory
        } else {
            CellState::Integrating
        }
    }

    pub fn is_refractory(&self) -> bool {
        self.refractory
    }

    pub fn ap_fast(&self) -> f64 {
        self.ap_fast
    }

    pub fn ap_slow(&self) -> f64 {
        self.ap_slow
    }

    pub fn ap_slow_prior(&self) -> f64 {
        self.ap_slow_prior
    }

    pub fn efficacy(&self) -> f64 {
        self.efficacy_trace
    }

    /// Dendritic input seen by the last integration
    pub fn psp(&self) -> f64 {
        self.psp
    }

    pub fn last_dt(&self) -> f64 {
        self.last_dt
    }

    pub fn last_spike_time(&self) -> Time {
        self.pre_t
    }

    pub fn dendrite(&self) -> &Dendrite {
        &self.dendrite
    }

    pub fn dendrite_mut(&mut self) -> &mut Dendrite {
        &mut self.dendrite
    }

    pub(crate) fn replace_params(&mut self, params: CellParams) {
        self.params = params;
    }
}

fn period(field: &str, v: f64) -> std::result::Result<u32, String> {
    if v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
        return Err(format!("{field}: {v} is not a non-negative whole number of steps"));
    }
    Ok(v as u32)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_params() -> SynapseParams {
        SynapseParams {
            lambda: 0.0,
            ..SynapseParams::default()
        }
    }

    /// One compartment, one synapse on connection 0.
    fn single_synapse_cell(kind: SynapseKind, syn: SynapseParams, cell: CellParams) -> Cell {
        let bounds = WeightBounds::new(0.0, 1.0).unwrap();
        let mut comp = Compartment::new(0);
        comp.add_synapse(Synapse::new(0, kind, 0, syn, bounds).unwrap());
        let mut den = Dendrite::new(0, 10.0, 5.0).unwrap();
        den.add_compartment(comp);
        Cell::new(0, cell, den).unwrap()
    }

    /// Tiny deterministic bit source for the timing sweeps.
    fn lcg_bits(seed: u64, n: usize, one_in: u64) -> Vec<Spike> {
        let mut x = seed;
        (0..n)
            .map(|_| {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((x >> 33) % one_in == 0) as Spike
            })
            .collect()
    }

    #[test]
    fn test_connection_or_merge() {
        let mut con = Connection::straight();
        con.input(1);
        con.input(1);
        assert_eq!(con.output(), 1);
        con.post();
        assert_eq!(con.output(), 0);

        con.input(0);
        con.input(1);
        con.input(0);
        assert_eq!(con.output(), 1);
    }

    #[test]
    fn test_connection_delay_line() {
        let mut con = Connection::delayed(2);
        assert_eq!(con.depth(), 2);

        let inputs = [1, 0, 0, 1, 0, 0];
        let mut outputs = vec![];
        for &bit in &inputs {
            con.input(bit);
            outputs.push(con.output());
            con.post();
        }
        assert_eq!(outputs, vec![0, 0, 1, 0, 0, 1]);

        assert_eq!(Connection::delayed(0), Connection::straight());
    }

    #[test]
    fn test_weight_stays_in_bounds() {
        let cell_params = CellParams {
            threshold: 0.2,
            refractory_period: 1,
            ..CellParams::default()
        };
        let syn_params = SynapseParams {
            lambda: 2.5,
            mu: 0.0,
            ama: 3.0,
            ..SynapseParams::default()
        };

        for (seed, kind) in [(1, SynapseKind::Excitatory), (7, SynapseKind::Inhibitory)] {
            let mut cell = single_synapse_cell(kind, syn_params.clone(), cell_params.clone());
            let mut cons = vec![Connection::straight()];
            for (t, bit) in lcg_bits(seed, 2000, 3).into_iter().enumerate() {
                cons[0].input(bit);
                cell.integrate(t as Time, &cons);
                let syn = &cell.dendrite().compartments()[0].synapses()[0];
                assert!(syn.bounds().contains(syn.weight()), "w = {}", syn.weight());
                cons[0].post();
            }
        }
    }

    #[test]
    fn test_refractory_output_is_zero() {
        let params = CellParams {
            threshold: 0.5,
            refractory_period: 5,
            ..CellParams::default()
        };
        let mut cell = single_synapse_cell(SynapseKind::Excitatory, quiet_params(), params);
        let mut cons = vec![Connection::straight()];
        for t in 0..100 {
            cons[0].input(1);
            let was_refractory = cell.is_refractory();
            let out = cell.integrate(t as Time, &cons);
            if was_refractory {
                assert_eq!(out, 0);
            }
            cons[0].post();
        }
    }

    #[test]
    fn test_fire_then_three_refractory_steps() {
        let params = CellParams {
            threshold: 0.5,
            refractory_period: 3,
            ..CellParams::default()
        };
        let mut cell = single_synapse_cell(SynapseKind::Excitatory, quiet_params(), params);
        // psp 1.0 on the first spike, w = 1.0 held fixed (lambda = 0)
        for syn in cell.dendrite_mut().synapses_mut() {
            syn.set_weight(1.0);
        }
        let mut cons = vec![Connection::straight()];
        let mut outputs = vec![];
        for t in 0..12 {
            cons[0].input(1);
            outputs.push(cell.integrate(t as Time, &cons));
            cons[0].post();
        }
        assert_eq!(outputs, vec![1, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_psp_decays_without_input() {
        let params = CellParams {
            threshold: 1.0e9,
            ..CellParams::default()
        };
        for kind in [SynapseKind::Excitatory, SynapseKind::Inhibitory] {
            let mut cell = single_synapse_cell(kind, quiet_params(), params.clone());
            let mut cons = vec![Connection::straight()];

            // One pre spike to charge the trace
            cons[0].input(1);
            cell.integrate(0.0, &cons);
            cons[0].post();

            let mut prev = f64::INFINITY;
            for t in 1..500 {
                cell.integrate(t as Time, &cons);
                let syn = &cell.dendrite().compartments()[0].synapses()[0];
                let signed = syn.signed_psp();
                assert!(syn.psp() >= 0.0);
                assert!(syn.psp() <= prev);
                if kind == SynapseKind::Inhibitory {
                    assert!(signed <= 0.0);
                } else {
                    assert!(signed >= 0.0);
                }
                prev = syn.psp();
            }
            assert!(prev < 1.0e-6);
        }
    }

    #[test]
    fn test_weight_factor_mu() {
        let bounds = WeightBounds::new(0.0, 2.0).unwrap();
        let additive = SynapseParams {
            mu: 0.0,
            lambda: 0.5,
            alpha: 2.0,
            ..SynapseParams::default()
        };
        let syn = Synapse::new(0, SynapseKind::Excitatory, 0, additive, bounds).unwrap();
        assert_eq!(syn.weight_factor(true, 1.5), 0.5);
        assert_eq!(syn.weight_factor(false, 1.5), 1.0);

        let multiplicative = SynapseParams {
            mu: 1.0,
            lambda: 0.5,
            alpha: 2.0,
            ..SynapseParams::default()
        };
        let syn = Synapse::new(1, SynapseKind::Excitatory, 0, multiplicative, bounds).unwrap();
        assert!((syn.weight_factor(true, 1.5) - 0.5 * 0.25).abs() < 1e-12);
        assert!((syn.weight_factor(false, 1.5) - 0.5 * 2.0 * 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_depression_on_pre_spike_after_post() {
        // Post trace is non-zero when a pre spike arrives -> weight drops
        let params = CellParams {
            threshold: 0.1,
            refractory_period: 50,
            ..CellParams::default()
        };
        let syn_params = SynapseParams {
            lambda: 0.1,
            mu: 0.0,
            ..SynapseParams::default()
        };
        let mut cell = single_synapse_cell(SynapseKind::Excitatory, syn_params, params);
        let mut cons = vec![Connection::straight()];

        cons[0].input(1);
        assert_eq!(cell.integrate(0.0, &cons), 1);
        cons[0].post();
        assert!(cell.ap_fast() > 0.0);

        let weight = |cell: &Cell| cell.dendrite().synapses().next().unwrap().weight();

        let w_before = weight(&cell);
        // t=1: potentiation from the t=0 AP, no pre spike
        cell.integrate(1.0, &cons);
        let w_after_ltp = weight(&cell);
        assert!(w_after_ltp > w_before);

        // Pre spikes at t=5 and t=7 while the fast AP trace is still up.
        // The first only recharges the pre efficacy; the second depresses.
        for t in 2..8 {
            if t == 5 || t == 7 {
                cons[0].input(1);
            }
            cell.integrate(t as Time, &cons);
            cons[0].post();
        }
        assert!(weight(&cell) < w_after_ltp);
    }

    #[test]
    fn test_pair_rule_bounds() {
        let bounds = WeightBounds::new(0.0, 1.0).unwrap();
        let mut syn = Synapse::new(0, SynapseKind::Excitatory, 0, SynapseParams::default(), bounds)
            .unwrap()
            .with_rule(LearningRule::Pair);
        let mut cons = vec![Connection::straight()];
        let post = PostTraces {
            output: 1,
            ap_fast: 0.3,
            ..PostTraces::default()
        };
        for (t, bit) in lcg_bits(3, 300, 2).into_iter().enumerate() {
            cons[0].input(bit);
            syn.integrate(t as Time, &post, &cons);
            assert!(bounds.contains(syn.weight()));
            cons[0].post();
        }
    }

    #[test]
    fn test_dendrite_floor_and_efficacy() {
        let bounds = WeightBounds::new(0.0, 1.0).unwrap();
        let mut comp = Compartment::new(0);
        comp.add_synapse(Synapse::new(0, SynapseKind::Inhibitory, 0, quiet_params(), bounds).unwrap());
        let mut den = Dendrite::new(0, 10.0, 4.0).unwrap();
        den.add_compartment(comp);

        let mut cons = vec![Connection::straight()];
        cons[0].input(1);
        let psp = den.integrate(0.0, &PostTraces::default(), &cons);
        assert_eq!(psp, 0.0);
        assert!(den.compartments()[0].synapses()[0].signed_psp() < 0.0);

        assert_eq!(den.ap_efficacy(3.0), 1.0);
        assert!((den.ap_efficacy(14.0) - (4.0f64 / 4.0).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_distance_field_refreshes_efficacy() {
        let mut cell = single_synapse_cell(
            SynapseKind::Excitatory,
            quiet_params(),
            CellParams::default(),
        );
        assert_eq!(cell.dendrite().synapses().next().unwrap().distance_efficacy(), 1.0);
        assert!(cell.set_synapse_field("distance", "15").is_applied());
        let e = cell.dendrite().synapses().next().unwrap().distance_efficacy();
        assert!((e - 1.0f64.exp()).abs() < 1e-12);

        assert!(cell.dendrite_mut().set_field("length", "20").is_applied());
        assert_eq!(cell.dendrite().synapses().next().unwrap().distance_efficacy(), 1.0);
    }

    #[test]
    fn test_set_field_policy() {
        let mut cell = single_synapse_cell(
            SynapseKind::Excitatory,
            quiet_params(),
            CellParams::default(),
        );
        assert_eq!(cell.set_field("bogus", "1.0"), FieldChange::Unknown);
        assert!(cell.set_field("threshold", "2.5").is_applied());
        assert_eq!(cell.params().threshold, 2.5);

        assert!(matches!(cell.set_field("threshold", "abc"), FieldChange::Rejected(_)));
        assert_eq!(cell.params().threshold, 2.5);

        assert!(matches!(cell.set_field("ntao", "0"), FieldChange::Rejected(_)));
        assert_eq!(cell.params().ntao, CellParams::default().ntao);

        assert!(cell.set_field("RefractoryPeriod", "4").is_applied());
        assert_eq!(cell.params().refractory_period, 4);
        assert!(matches!(cell.set_field("RefractoryPeriod", "2.5"), FieldChange::Rejected(_)));

        assert!(cell.set_synapse_field("taoP", "22").is_applied());
        assert_eq!(cell.dendrite().synapses().next().unwrap().params().tao_p, 22.0);
        assert!(matches!(cell.set_synapse_field("taoI", "0"), FieldChange::Rejected(_)));
        assert_eq!(cell.set_synapse_field("nope", "1"), FieldChange::Unknown);
    }

    #[test]
    fn test_zero_time_constant_is_config_error() {
        let bounds = WeightBounds::default();
        let bad = SynapseParams {
            tao_i: 0.0,
            ..SynapseParams::default()
        };
        let err = Synapse::new(3, SynapseKind::Excitatory, 0, bad, bounds).unwrap_err();
        assert!(err.to_string().contains("synapse[3].taoI"));

        let bad_cell = CellParams {
            ntao_j: 0.0,
            ..CellParams::default()
        };
        let den = Dendrite::new(0, 1.0, 1.0).unwrap();
        assert!(Cell::new(0, bad_cell, den).is_err());
        assert!(Dendrite::new(0, 1.0, 0.0).is_err());
    }

    #[test]
    fn test_reset_restores_midpoint() {
        let params = CellParams {
            threshold: 0.1,
            ..CellParams::default()
        };
        let mut cell = single_synapse_cell(SynapseKind::Excitatory, SynapseParams::default(), params);
        let mut cons = vec![Connection::straight()];
        for t in 0..50 {
            cons[0].input((t % 2) as Spike);
            cell.integrate(t as Time, &cons);
            cons[0].post();
        }
        cell.reset();
        let syn = cell.dendrite().synapses().next().unwrap();
        assert_eq!(syn.weight(), 0.5);
        assert_eq!(syn.psp(), 0.0);
        assert_eq!(syn.prev_efficacy_trace(), 1.0);
        assert_eq!(cell.ap_fast(), 0.0);
        assert_eq!(cell.state(), CellState::Integrating);
        assert_eq!(cell.last_spike_time(), NEVER_FIRED);
    }
}
