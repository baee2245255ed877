use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::debug;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::errs::{GlomError, GlomResult};
use crate::germlines::sanitize_gene_name;
use crate::sequences::{AMBIG_DIGIT, N_NUKES};

const INIT_STATE: &str = "init";
const END_STATE: &str = "end";
const INSERT_PREFIX: &str = "insert";
const MAX_MUTE_FREQ: f64 = 0.95;

/// Ambiguous bases emit uniformly over the track alphabet.
pub(crate) const AMBIG_LN_EMIT: f64 = -1.3862943611198906; // ln(1/4)

#[derive(Debug, Deserialize)]
struct TransitionDoc {
    to: String,
    prob: f64,
}

#[derive(Debug, Deserialize)]
struct StateDoc {
    name: String,
    #[serde(default)]
    transitions: Vec<TransitionDoc>,
    #[serde(default)]
    emissions: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct ExtrasDoc {
    gene_prob: f64,
}

#[derive(Debug, Deserialize)]
struct ModelDoc {
    name: String,
    extras: ExtrasDoc,
    tracks: HashMap<String, Vec<String>>,
    states: Vec<StateDoc>,
}

/// One HMM state after name resolution: transitions are arena indices, all
/// probabilities are in log space.
#[derive(Debug, Clone)]
pub(crate) struct State {
    name: String,
    emissions: Vec<f64>,
    transitions: Vec<(usize, f64)>,
    end_ln_prob: f64,
    germline_pos: Option<usize>,
}

impl State {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn transitions(&self) -> &[(usize, f64)] {
        &self.transitions
    }

    pub(crate) fn end_ln_prob(&self) -> f64 {
        self.end_ln_prob
    }

    pub(crate) fn is_insert(&self) -> bool {
        self.name.starts_with(INSERT_PREFIX)
    }

    /// Germline position encoded in the state name, `<gene>_<pos>`.
    pub(crate) fn germline_pos(&self) -> Option<usize> {
        self.germline_pos
    }

    pub(crate) fn ln_emit(&self, digit: u8) -> f64 {
        if digit == AMBIG_DIGIT {
            AMBIG_LN_EMIT
        } else {
            self.emissions[digit as usize]
        }
    }

    fn germline_base(&self) -> Option<usize> {
        if self.germline_pos.is_none() {
            return None;
        }
        self.emissions
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
    }

    fn mute_freq(&self) -> Option<f64> {
        self.germline_base().map(|ib| 1.0 - self.emissions[ib].exp())
    }
}

/// A per-gene HMM with states in an arena and transitions resolved to
/// arena indices at parse time. The `init` state is held separately; `end`
/// is implicit in each state's end transition.
#[derive(Debug, Clone)]
pub(crate) struct Model {
    name: String,
    ln_gene_prob: f64,
    init_transitions: Vec<(usize, f64)>,
    states: Vec<State>,
}

impl Model {
    pub(crate) fn from_yaml(text: &str, gene: &str) -> GlomResult<Self> {
        let doc: ModelDoc =
            serde_yaml::from_str(text).map_err(|e| GlomError::MalformedHmmFile {
                gene: gene.to_owned(),
                reason: e.to_string(),
            })?;
        Self::finalize(doc)
    }

    pub(crate) fn from_file(fp: &Path, gene: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(fp)
            .with_context(|| format!("failed to read hmm file {fp:?}"))?;
        Ok(Self::from_yaml(&text, gene)?)
    }

    fn malformed(name: &str, reason: impl Into<String>) -> GlomError {
        GlomError::MalformedHmmFile { gene: name.to_owned(), reason: reason.into() }
    }

    fn finalize(doc: ModelDoc) -> GlomResult<Self> {
        let name = doc.name;
        if doc.tracks.len() != 1 {
            return Err(Self::malformed(&name, "expected exactly one track"));
        }
        let alphabet = doc.tracks.values().next().unwrap();
        let expected = ["A", "C", "G", "T"];
        if alphabet.len() != N_NUKES
            || alphabet.iter().zip(expected).any(|(a, b)| a.as_str() != b)
        {
            return Err(Self::malformed(&name, "track alphabet is not A,C,G,T"));
        }

        // index the non-init states, checking for duplicates
        let mut index_of: HashMap<&str, usize> = HashMap::new();
        for doc_state in doc.states.iter().filter(|s| s.name != INIT_STATE) {
            let i_next = index_of.len();
            if index_of.insert(doc_state.name.as_str(), i_next).is_some() {
                return Err(Self::malformed(
                    &name,
                    format!("two states named {}", doc_state.name),
                ));
            }
        }

        let resolve = |doc_state: &StateDoc| -> GlomResult<(Vec<(usize, f64)>, f64)> {
            let mut transitions = Vec::with_capacity(doc_state.transitions.len());
            let mut end_ln_prob = f64::NEG_INFINITY;
            for t in &doc_state.transitions {
                if t.to == END_STATE {
                    end_ln_prob = t.prob.ln();
                } else {
                    let &i_to = index_of.get(t.to.as_str()).ok_or_else(|| {
                        Self::malformed(
                            &name,
                            format!(
                                "state {} transitions to unknown state {}",
                                doc_state.name, t.to
                            ),
                        )
                    })?;
                    transitions.push((i_to, t.prob.ln()));
                }
            }
            Ok((transitions, end_ln_prob))
        };

        let mut init_transitions = None;
        let mut states = Vec::new();
        for doc_state in &doc.states {
            let (transitions, end_ln_prob) = resolve(doc_state)?;
            if doc_state.name == INIT_STATE {
                init_transitions = Some(transitions);
                continue;
            }
            if doc_state.emissions.len() != N_NUKES {
                return Err(Self::malformed(
                    &name,
                    format!("state {} needs 4 emissions", doc_state.name),
                ));
            }
            let germline_pos = if doc_state.name.starts_with(INSERT_PREFIX) {
                None
            } else {
                doc_state
                    .name
                    .rsplit_once('_')
                    .and_then(|(_, pos)| pos.parse::<usize>().ok())
            };
            states.push(State {
                name: doc_state.name.clone(),
                emissions: doc_state
                    .emissions
                    .iter()
                    .map(|p| p.ln())
                    .collect(),
                transitions,
                end_ln_prob,
                germline_pos,
            });
        }
        let init_transitions = init_transitions
            .ok_or_else(|| Self::malformed(&name, "no init state"))?;

        let model = Self {
            ln_gene_prob: doc.extras.gene_prob.ln(),
            name,
            init_transitions,
            states,
        };
        model.check_topology()?;
        Ok(model)
    }

    /// Orphaned states, dead ends, and a missing end state are all parse
    /// errors.
    fn check_topology(&self) -> GlomResult<()> {
        if !self.states.iter().any(|s| s.end_ln_prob != f64::NEG_INFINITY) {
            return Err(Self::malformed(&self.name, "no state reaches end"));
        }
        let mut visited = vec![false; self.states.len()];
        let mut stack = self
            .init_transitions
            .iter()
            .map(|&(i, _)| i)
            .collect::<Vec<usize>>();
        while let Some(i_state) = stack.pop() {
            if visited[i_state] {
                continue;
            }
            visited[i_state] = true;
            for &(i_to, _) in &self.states[i_state].transitions {
                stack.push(i_to);
            }
        }
        for (i_state, state) in self.states.iter().enumerate() {
            if !visited[i_state] {
                return Err(Self::malformed(
                    &self.name,
                    format!("state {} is unreachable from init", state.name),
                ));
            }
            if state.transitions.is_empty()
                && state.end_ln_prob == f64::NEG_INFINITY
            {
                return Err(Self::malformed(
                    &self.name,
                    format!("state {} is a dead end", state.name),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn ln_gene_prob(&self) -> f64 {
        self.ln_gene_prob
    }

    pub(crate) fn n_states(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn state(&self, i_state: usize) -> &State {
        &self.states[i_state]
    }

    pub(crate) fn init_transitions(&self) -> &[(usize, f64)] {
        &self.init_transitions
    }

    /// Mean mutation frequency implied by the germline states' emissions.
    pub(crate) fn overall_mute_freq(&self) -> f64 {
        let freqs = self
            .states
            .iter()
            .filter_map(|s| s.mute_freq())
            .collect::<Vec<f64>>();
        if freqs.is_empty() {
            0.0
        } else {
            freqs.iter().sum::<f64>() / freqs.len() as f64
        }
    }

    /// Scale each germline state's mutation probability by
    /// <target>/<current overall> so the model's implied overall mutation
    /// frequency matches <target>.
    fn rescale_mute_freq(&mut self, target: f64) {
        let current = self.overall_mute_freq();
        if current <= 0.0 || target <= 0.0 {
            return;
        }
        let factor = target / current;
        for state in &mut self.states {
            let Some(i_germ) = state.germline_base() else {
                continue;
            };
            let old_mute = 1.0 - state.emissions[i_germ].exp();
            if old_mute <= 0.0 {
                continue;
            }
            let new_mute = (old_mute * factor).min(MAX_MUTE_FREQ);
            let emission_factor = (new_mute / old_mute).ln();
            let mut total_mute = 0.0;
            for (i_base, ln_p) in state.emissions.iter_mut().enumerate() {
                if i_base != i_germ {
                    *ln_p += emission_factor;
                    total_mute += ln_p.exp();
                }
            }
            state.emissions[i_germ] = (1.0 - total_mute).ln();
        }
    }
}

/// Lazily-populated map of gene name to parsed model, living for the
/// process lifetime. Rescaling mutates emissions in place and stashes the
/// originals; every rescale must be paired with an unrescale before
/// unrelated input is processed.
pub struct HmmHolder {
    hmm_dir: PathBuf,
    models: FxHashMap<String, Model>,
    stashed_emissions: FxHashMap<String, Vec<Vec<f64>>>,
    rescaled: bool,
}

impl HmmHolder {
    pub fn new(hmm_dir: &Path) -> Self {
        Self {
            hmm_dir: hmm_dir.to_owned(),
            models: FxHashMap::default(),
            stashed_emissions: FxHashMap::default(),
            rescaled: false,
        }
    }

    pub(crate) fn get(&mut self, gene: &str) -> anyhow::Result<&Model> {
        if !self.models.contains_key(gene) {
            let fp = self
                .hmm_dir
                .join(format!("{}.yaml", sanitize_gene_name(gene)));
            debug!("parsing hmm file {fp:?}");
            let model = Model::from_file(&fp, gene)?;
            self.models.insert(gene.to_owned(), model);
        }
        Ok(self.models.get(gene).unwrap())
    }

    pub fn n_loaded(&self) -> usize {
        self.models.len()
    }

    /// Rescale every model in <only_genes> so its implied overall mutation
    /// frequency matches <target>.
    pub(crate) fn rescale_overall_mute_freq(
        &mut self,
        only_genes: &[String],
        target: f64,
    ) -> anyhow::Result<()> {
        if self.rescaled {
            return Err(GlomError::NestedRescale.into());
        }
        self.rescaled = true;
        for gene in only_genes {
            if self.stashed_emissions.contains_key(gene) {
                continue;
            }
            self.get(gene)?;
            let model = self.models.get_mut(gene).unwrap();
            let stash =
                model.states.iter().map(|s| s.emissions.clone()).collect();
            self.stashed_emissions.insert(gene.clone(), stash);
            model.rescale_mute_freq(target);
        }
        Ok(())
    }

    /// Restore the emissions stashed by the matching rescale call.
    pub(crate) fn unrescale_overall_mute_freq(&mut self) {
        for (gene, stash) in self.stashed_emissions.drain() {
            let model = self
                .models
                .get_mut(&gene)
                .expect("stashed emissions for an unloaded model");
            for (state, emissions) in model.states.iter_mut().zip(stash) {
                state.emissions = emissions;
            }
        }
        self.rescaled = false;
    }
}
