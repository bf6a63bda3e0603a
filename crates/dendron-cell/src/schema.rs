//! Persisted model parameters.
//!
//! The JSON layout mirrors the cell tree: neuron fields at the top level, then
//! `Dendrites -> Compartments[] -> Synapses[]`. Loading is positional: the
//! n-th element of an array is applied to the n-th child in build order, and
//! the element `id`s are informational only.

use crate::{Cell, CellParams, SynapseParams, WeightBounds};
use dendron_core::{require_time_constant, DendronError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<usize>,
    #[serde(rename = "Threshold")]
    pub threshold: f64,
    pub ntao: f64,
    #[serde(rename = "ntaoS")]
    pub ntao_s: f64,
    #[serde(rename = "ntaoJ")]
    pub ntao_j: f64,
    #[serde(rename = "nFastSurge")]
    pub fast_surge: f64,
    #[serde(rename = "nSlowSurge")]
    pub slow_surge: f64,
    #[serde(rename = "RefractoryPeriod")]
    pub refractory_period: f64,
    #[serde(rename = "APMax")]
    pub ap_max: f64,
    #[serde(rename = "wMin")]
    pub w_min: f64,
    #[serde(rename = "wMax")]
    pub w_max: f64,
    #[serde(rename = "Dendrites")]
    pub dendrite: DendriteModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DendriteModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<usize>,
    pub length: f64,
    #[serde(rename = "taoEff")]
    pub tao_eff: f64,
    #[serde(rename = "Compartments")]
    pub compartments: Vec<CompartmentModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<usize>,
    #[serde(rename = "Synapses")]
    pub synapses: Vec<SynapseModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapseModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<usize>,
    pub w: f64,
    #[serde(rename = "taoP")]
    pub tao_p: f64,
    #[serde(rename = "taoN")]
    pub tao_n: f64,
    #[serde(rename = "taoI")]
    pub tao_i: f64,
    pub distance: f64,
    pub ama: f64,
    pub amb: f64,
    pub mu: f64,
    pub lambda: f64,
    pub alpha: f64,
    #[serde(rename = "learningRateSlow", default, skip_serializing_if = "Option::is_none")]
    pub learning_rate_slow: Option<f64>,
    #[serde(rename = "learningRateFast", default, skip_serializing_if = "Option::is_none")]
    pub learning_rate_fast: Option<f64>,
}

impl NeuronModel {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn cell_params(&self) -> Result<CellParams> {
        let period = self.refractory_period;
        if !(period >= 0.0 && period.fract() == 0.0 && period <= u32::MAX as f64) {
            return Err(DendronError::config(format!(
                "RefractoryPeriod must be a non-negative whole number (got {period})"
            )));
        }
        let params = CellParams {
            threshold: self.threshold,
            ap_max: self.ap_max,
            ntao: self.ntao,
            ntao_s: self.ntao_s,
            ntao_j: self.ntao_j,
            fast_surge: self.fast_surge,
            slow_surge: self.slow_surge,
            refractory_period: period as u32,
        };
        params.validate()?;
        Ok(params)
    }
}

impl SynapseModel {
    fn params(&self, previous: &SynapseParams) -> SynapseParams {
        SynapseParams {
            tao_p: self.tao_p,
            tao_n: self.tao_n,
            tao_i: self.tao_i,
            ama: self.ama,
            amb: self.amb,
            mu: self.mu,
            lambda: self.lambda,
            alpha: self.alpha,
            distance: self.distance,
            learning_rate_slow: self.learning_rate_slow.unwrap_or(previous.learning_rate_slow),
            learning_rate_fast: self.learning_rate_fast.unwrap_or(previous.learning_rate_fast),
            // Not persisted
            tsw: previous.tsw,
        }
    }
}

impl Cell {
    /// Snapshot of every persisted parameter.
    pub fn to_model(&self) -> NeuronModel {
        let p = self.params();
        let bounds = self
            .dendrite()
            .synapses()
            .next()
            .map(|s| s.bounds())
            .unwrap_or_default();
        let dendrite = self.dendrite();

        NeuronModel {
            id: Some(self.id()),
            threshold: p.threshold,
            ntao: p.ntao,
            ntao_s: p.ntao_s,
            ntao_j: p.ntao_j,
            fast_surge: p.fast_surge,
            slow_surge: p.slow_surge,
            refractory_period: p.refractory_period as f64,
            ap_max: p.ap_max,
            w_min: bounds.min,
            w_max: bounds.max,
            dendrite: DendriteModel {
                id: Some(dendrite.id()),
                length: dendrite.length(),
                tao_eff: dendrite.tao_eff(),
                compartments: dendrite
                    .compartments()
                    .iter()
                    .map(|c| CompartmentModel {
                        id: Some(c.id()),
                        synapses: c
                            .synapses()
                            .iter()
                            .map(|s| {
                                let sp = s.params();
                                SynapseModel {
                                    id: Some(s.id()),
                                    w: s.weight(),
                                    tao_p: sp.tao_p,
                                    tao_n: sp.tao_n,
                                    tao_i: sp.tao_i,
                                    distance: sp.distance,
                                    ama: sp.ama,
                                    amb: sp.amb,
                                    mu: sp.mu,
                                    lambda: sp.lambda,
                                    alpha: sp.alpha,
                                    learning_rate_slow: Some(sp.learning_rate_slow),
                                    learning_rate_fast: Some(sp.learning_rate_fast),
                                }
                            })
                            .collect(),
                    })
                    .collect(),
            },
        }
    }

    /// Apply a persisted model positionally.
    ///
    /// Everything is validated before anything is written, so a rejected
    /// model leaves the cell untouched.
    pub fn apply_model(&mut self, model: &NeuronModel) -> Result<()> {
        let cell_params = model.cell_params()?;
        let bounds = WeightBounds::new(model.w_min, model.w_max)?;

        let dm = &model.dendrite;
        require_time_constant("taoEff", dm.tao_eff)?;
        if !dm.length.is_finite() {
            return Err(DendronError::config("dendrite length must be finite"));
        }

        let built = self.dendrite().compartments();
        if dm.compartments.len() != built.len() {
            return Err(DendronError::config(format!(
                "model has {} compartments, cell has {}",
                dm.compartments.len(),
                built.len()
            )));
        }

        let mut staged = Vec::with_capacity(self.dendrite().synapse_count());
        for (ci, (cm, comp)) in dm.compartments.iter().zip(built).enumerate() {
            if cm.synapses.len() != comp.synapses().len() {
                return Err(DendronError::config(format!(
                    "compartment {ci}: model has {} synapses, cell has {}",
                    cm.synapses.len(),
                    comp.synapses().len()
                )));
            }
            for (si, (sm, syn)) in cm.synapses.iter().zip(comp.synapses()).enumerate() {
                let label = format!("compartment[{ci}].synapse[{si}]");
                let params = sm.params(syn.params());
                params.validate(&label)?;
                if !sm.w.is_finite() || !bounds.contains(sm.w) {
                    return Err(DendronError::config(format!(
                        "{label}.w = {} outside [{}, {}]",
                        sm.w, bounds.min, bounds.max
                    )));
                }
                staged.push((params, sm.w));
            }
        }

        // Commit
        self.replace_params(cell_params);
        let dendrite = self.dendrite_mut();
        dendrite.set_geometry(dm.length, dm.tao_eff);
        for (syn, (params, w)) in dendrite.synapses_mut().zip(staged) {
            syn.set_bounds(bounds);
            syn.replace_params(params);
            syn.replace_weight(w);
        }
        dendrite.refresh_efficacy();

        log::debug!(
            "Applied model to cell {} ({} synapses)",
            self.id(),
            self.dendrite().synapse_count()
        );
        Ok(())
    }
}
