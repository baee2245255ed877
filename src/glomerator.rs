use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use derive_new::new;
use indexmap::IndexSet;
use itertools::Itertools;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::clusterpath::{ClusterPath, Partition};
use crate::dphandler::{Algorithm, DpHandler, DpResult, KBounds};
use crate::errs::{GlomError, GlomResult};
use crate::germlines::GermLines;
use crate::hmm::HmmHolder;
use crate::reco_event::RecoEvent;
use crate::sequences::{check_same_length, Sequence};
use crate::util::{
    add_with_minus_infinities, annotation_bar, contains_member,
    count_members, hamming_fraction, joint_key, merge_ticker, merged_key,
    subset_key, JOINT_DELIM, NAME_DELIM,
};

const STATUS_WRITE_INTERVAL_SECS: u64 = 30;
const BOUNDARY_ERROR: &str = "boundary";

/// Knobs for one clustering run. The lratio threshold is a monotone step
/// function of candidate cluster size, configured externally as
/// (size, threshold) pairs.
#[derive(Debug, Clone)]
pub struct GlomConfig {
    /// Tight hamming-fraction bound: pairs at or under it merge without an
    /// hmm evaluation.
    pub hfrac_bound_lo: f64,
    /// Loose bound: pairs above it are never merge candidates.
    pub hfrac_bound_hi: f64,
    pub lratio_thresholds: Vec<(usize, f64)>,
    /// Clusters bigger than this get subset/surrogate treatment for the
    /// expensive calculations.
    pub max_cluster_size: usize,
    pub asym_factor: f64,
    pub seed_unique_id: Option<String>,
    pub rng_seed: u64,
    pub n_best_events: usize,
    pub debug: u8,
    pub chunk_cache: bool,
    pub max_logprob_drop: f64,
    pub sentinel_fp: Option<PathBuf>,
    pub progress_fp: Option<PathBuf>,
}

impl Default for GlomConfig {
    fn default() -> Self {
        Self {
            hfrac_bound_lo: 0.015,
            hfrac_bound_hi: 0.08,
            lratio_thresholds: vec![(2, 8.0), (5, 12.0), (10, 18.0)],
            max_cluster_size: 20,
            asym_factor: 4.0,
            seed_unique_id: None,
            rng_seed: 1,
            n_best_events: 3,
            debug: 0,
            chunk_cache: false,
            max_logprob_drop: 1000.0,
            sentinel_fp: None,
            progress_fp: None,
        }
    }
}

impl GlomConfig {
    /// Minimum lratio for a merge of <size> total sequences: the value at
    /// the largest configured size at or under <size>.
    pub fn lratio_threshold(&self, size: usize) -> f64 {
        let mut threshold = self
            .lratio_thresholds
            .first()
            .map(|&(_, t)| t)
            .unwrap_or(0.0);
        for &(s, t) in &self.lratio_thresholds {
            if s <= size {
                threshold = t;
            }
        }
        threshold
    }
}

/// Per-cluster metadata as it arrives from the input file or is created by
/// a merge.
#[derive(Debug, Clone)]
pub struct Query {
    pub name: String,
    pub seqs: Vec<Sequence>,
    pub kbounds: KBounds,
    pub only_genes: Vec<String>,
    pub mean_mute_freq: f64,
    pub parents: Option<(String, String)>,
    pub cdr3_length: usize,
}

/// One annotated cluster, viterbi mode's output row.
#[derive(Debug)]
pub struct Annotation {
    pub unique_ids: String,
    pub seqs: String,
    pub logprob: f64,
    pub event: Option<RecoEvent>,
    pub errors: String,
}

/// The translation tables: every cache read resolves through here, every
/// substitution is recorded here, so a surrogate chain cannot fork.
#[derive(Debug, Default)]
pub(crate) struct Translator {
    naive_seq_name_translations: HashMap<String, String>,
    logprob_name_translations: HashMap<String, (String, String)>,
    logprob_asymmetric_translations: HashMap<String, String>,
    name_subsets: HashMap<String, String>,
}

impl Translator {
    pub(crate) fn resolve_naive<'a>(&'a self, key: &'a str) -> &'a str {
        let mut key = key;
        while let Some(next) = self.naive_seq_name_translations.get(key) {
            key = next;
        }
        key
    }

    pub(crate) fn resolve_asym<'a>(&'a self, key: &'a str) -> &'a str {
        let mut key = key;
        while let Some(next) = self.logprob_asymmetric_translations.get(key) {
            key = next;
        }
        key
    }

    /// Cluster key to read a cached log prob under: the key itself if it
    /// was calculated directly, otherwise through the recorded pair or
    /// asymmetric surrogates.
    pub(crate) fn resolve_logprob(
        &self,
        key: &str,
        log_probs: &HashMap<String, f64>,
    ) -> Option<String> {
        if log_probs.contains_key(key) {
            return Some(key.to_owned());
        }
        if let Some((a, b)) = self.logprob_name_translations.get(key) {
            return self.resolve_logprob(&merged_key(a, b), log_probs);
        }
        if let Some(surrogate) = self.logprob_asymmetric_translations.get(key) {
            return self.resolve_logprob(surrogate, log_probs);
        }
        None
    }

    /// Memoized choice of representative subset for an oversized cluster.
    pub(crate) fn subset_for(&mut self, key: &str, n_max: usize) -> String {
        if let Some(subset) = self.name_subsets.get(key) {
            return subset.clone();
        }
        let subset = subset_key(key, n_max);
        self.name_subsets.insert(key.to_owned(), subset.clone());
        subset
    }

    pub(crate) fn record_naive(&mut self, key: String, surrogate: String) {
        self.naive_seq_name_translations.insert(key, surrogate);
    }

    pub(crate) fn record_logprob_pair(
        &mut self,
        joint: String,
        pair: (String, String),
    ) {
        self.logprob_name_translations.insert(joint, pair);
    }

    pub(crate) fn record_asym(&mut self, key: String, surrogate: String) {
        self.logprob_asymmetric_translations.insert(key, surrogate);
    }

    pub(crate) fn n_asym(&self) -> usize {
        self.logprob_asymmetric_translations.len()
    }
}

/// What a DP run needs to know about a cluster besides its sequences.
#[derive(Debug, Clone, new)]
struct ClusterCtx {
    kbounds: KBounds,
    genes: Vec<String>,
    mute_freq: f64,
}

#[derive(Debug, Deserialize)]
struct CacheRow {
    unique_ids: String,
    logprob: Option<f64>,
    naive_seq: Option<String>,
    naive_hfrac: Option<f64>,
    errors: Option<String>,
}

/// Agglomerative clusterer: repeatedly merges the best pair of clusters,
/// cheap hamming-fraction merges first, likelihood-ratio merges when none
/// remain, until no pair qualifies or the partition score has dropped too
/// far below the best one seen.
pub struct Glomerator<'a> {
    gl: &'a GermLines,
    hmms: &'a mut HmmHolder,
    config: GlomConfig,
    vtb_dph: DpHandler,
    fwd_dph: DpHandler,

    // per-sequence info from the input, shared by every cluster key
    single_seqs: HashMap<String, Sequence>,
    member_origin: HashMap<String, String>,

    // per-cluster bookkeeping, kept for every cluster ever created
    current_partition: IndexSet<String>,
    only_genes: HashMap<String, Vec<String>>,
    kbinfo: HashMap<String, KBounds>,
    mute_freqs: HashMap<String, f64>,
    cdr3_lengths: HashMap<String, usize>,
    parents: HashMap<String, (String, String)>,

    // caches, persisted between runs through the cache file
    log_probs: HashMap<String, f64>,
    naive_seqs: HashMap<String, String>,
    naive_hfracs: HashMap<String, f64>,
    lratios: HashMap<String, f64>,
    errors: HashMap<String, String>,
    failed_queries: HashSet<String>,
    initial_log_probs: HashSet<String>,
    initial_naive_seqs: HashSet<String>,
    initial_naive_hfracs: HashSet<String>,
    initial_errors: HashSet<String>,

    translator: Translator,
    seed_missing: HashMap<String, bool>,

    rng: StdRng,
    n_hfrac_calculated: usize,
    n_hfrac_merges: usize,
    n_lratio_merges: usize,
    last_status_write: Instant,
}

impl<'a> Glomerator<'a> {
    pub fn new(
        gl: &'a GermLines,
        hmms: &'a mut HmmHolder,
        queries: Vec<Query>,
        config: GlomConfig,
        incachefile: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let rng = StdRng::seed_from_u64(config.rng_seed);
        let mut glom = Self {
            gl,
            hmms,
            vtb_dph: DpHandler::new(Algorithm::Viterbi, config.chunk_cache),
            fwd_dph: DpHandler::new(Algorithm::Forward, config.chunk_cache),
            config,
            single_seqs: HashMap::new(),
            member_origin: HashMap::new(),
            current_partition: IndexSet::new(),
            only_genes: HashMap::new(),
            kbinfo: HashMap::new(),
            mute_freqs: HashMap::new(),
            cdr3_lengths: HashMap::new(),
            parents: HashMap::new(),
            log_probs: HashMap::new(),
            naive_seqs: HashMap::new(),
            naive_hfracs: HashMap::new(),
            lratios: HashMap::new(),
            errors: HashMap::new(),
            failed_queries: HashSet::new(),
            initial_log_probs: HashSet::new(),
            initial_naive_seqs: HashSet::new(),
            initial_naive_hfracs: HashSet::new(),
            initial_errors: HashSet::new(),
            translator: Translator::default(),
            seed_missing: HashMap::new(),
            rng,
            n_hfrac_calculated: 0,
            n_hfrac_merges: 0,
            n_lratio_merges: 0,
            last_status_write: Instant::now(),
        };
        for query in queries {
            glom.add_query(query)?;
        }
        if let Some(fp) = incachefile {
            glom.read_cache_file(fp)?;
        }
        Ok(glom)
    }

    fn add_query(&mut self, query: Query) -> GlomResult<()> {
        check_same_length(&query.name, &query.seqs)?;
        if self.current_partition.contains(&query.name) {
            return Err(GlomError::MalformedInputRow(format!(
                "duplicate cluster {}",
                query.name
            )));
        }
        for seq in &query.seqs {
            self.member_origin
                .entry(seq.name().to_owned())
                .or_insert_with(|| query.name.clone());
            self.single_seqs.insert(seq.name().to_owned(), seq.clone());
        }
        self.current_partition.insert(query.name.clone());
        self.only_genes.insert(query.name.clone(), query.only_genes);
        self.kbinfo.insert(query.name.clone(), query.kbounds);
        self.mute_freqs.insert(query.name.clone(), query.mean_mute_freq);
        self.cdr3_lengths.insert(query.name.clone(), query.cdr3_length);
        if let Some(parents) = query.parents {
            self.parents.insert(query.name, parents);
        }
        Ok(())
    }

    pub fn config(&self) -> &GlomConfig {
        &self.config
    }

    pub fn n_vtb_calculated(&self) -> usize {
        self.vtb_dph.n_calculated()
    }

    pub fn n_fwd_calculated(&self) -> usize {
        self.fwd_dph.n_calculated()
    }

    pub fn n_hfrac_calculated(&self) -> usize {
        self.n_hfrac_calculated
    }

    pub fn n_hfrac_merges(&self) -> usize {
        self.n_hfrac_merges
    }

    pub fn n_lratio_merges(&self) -> usize {
        self.n_lratio_merges
    }

    pub fn partition(&self) -> Partition {
        self.current_partition.iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // the merge loop

    /// Run the full agglomeration and return the trajectory of visited
    /// partitions.
    pub fn cluster(&mut self) -> anyhow::Result<ClusterPath> {
        self.cache_naive_seqs()?;

        let initial = self.partition();
        let names = initial.clone();
        for name in &names {
            self.get_log_prob(name)?;
        }
        let logprob = self.log_prob_of_partition(&initial);
        if self.config.debug > 0 {
            self.print_partition(&initial, logprob, "initial");
        }
        let mut path = ClusterPath::new();
        path.add_partition(initial, logprob, 0.0);

        let ticker = merge_ticker();
        loop {
            ticker.set_message(format!(
                "{} clusters",
                self.current_partition.len()
            ));
            if self.sentinel_exists() {
                info!("sentinel file found, stopping cleanly");
                break;
            }
            self.write_status_maybe(&path);
            if !self.merge(&mut path)? {
                break;
            }
            ticker.inc(1);
        }
        ticker.finish_and_clear();

        if self.config.debug > 0 {
            if let (Some(best), Some(lp)) = (path.best(), path.best_logprob())
            {
                let best = best.clone();
                self.print_partition(&best, lp, "best");
            }
        }
        info!(
            "calculated:  vtb {}  fwd {}  hfrac {}    merged:  hfrac {}  \
             lratio {}",
            self.n_vtb_calculated(),
            self.n_fwd_calculated(),
            self.n_hfrac_calculated,
            self.n_hfrac_merges,
            self.n_lratio_merges
        );
        Ok(path)
    }

    /// Compute the viterbi naive sequence of every starting cluster up
    /// front, so the hamming pre-filter never interleaves with forward
    /// work.
    fn cache_naive_seqs(&mut self) -> anyhow::Result<()> {
        for name in self.partition() {
            self.get_naive_seq(&name)?;
        }
        Ok(())
    }

    /// One merge step. Returns false when the loop is finished.
    fn merge(&mut self, path: &mut ClusterPath) -> anyhow::Result<bool> {
        let chosen = match self.find_hfrac_merge()? {
            Some((hfrac, name_a, name_b)) => {
                self.n_hfrac_merges += 1;
                if self.config.debug > 0 {
                    info!(
                        "    hfrac merge {hfrac:.3}   {name_a}  {name_b}"
                    );
                }
                (name_a, name_b)
            }
            None => match self.find_lratio_merge()? {
                Some((lratio, name_a, name_b)) => {
                    self.n_lratio_merges += 1;
                    if self.config.debug > 0 {
                        info!(
                            "    lratio merge {lratio:.3}   {name_a}  \
                             {name_b}"
                        );
                    }
                    (name_a, name_b)
                }
                None => {
                    debug!("no merge candidates remain");
                    return Ok(false);
                }
            },
        };

        let (name_a, name_b) = chosen;
        self.commit_merge(&name_a, &name_b)?;

        let partition = self.partition();
        let logprob = self.log_prob_of_partition(&partition);
        if self.config.debug > 1 {
            self.print_partition(&partition, logprob, "current");
        }
        path.add_partition(partition, logprob, 0.0);

        if let Some(best) = path.best_logprob() {
            if logprob.is_finite()
                && best - logprob > self.config.max_logprob_drop
            {
                info!("stopping after drop {best:.2} --> {logprob:.2}");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Unordered candidate pairs from the current partition, in cluster
    /// creation order, with the seed and cdr3 restrictions applied.
    fn candidate_pairs(&mut self) -> Vec<(String, String)> {
        let names = self.partition();
        let mut pairs = Vec::new();
        for i_a in 0..names.len() {
            for i_b in i_a + 1..names.len() {
                let name_a = &names[i_a];
                let name_b = &names[i_b];
                if self.config.seed_unique_id.is_some()
                    && self.seed_missing(name_a)
                    && self.seed_missing(name_b)
                {
                    continue;
                }
                if self.cdr3_lengths[name_a] != self.cdr3_lengths[name_b] {
                    continue;
                }
                pairs.push((name_a.clone(), name_b.clone()));
            }
        }
        pairs
    }

    fn seed_missing(&mut self, name: &str) -> bool {
        let Some(seed) = self.config.seed_unique_id.clone() else {
            return false;
        };
        if let Some(&missing) = self.seed_missing.get(name) {
            return missing;
        }
        let missing = !contains_member(name, &seed);
        self.seed_missing.insert(name.to_owned(), missing);
        missing
    }

    /// Cheap phase: the pair with the smallest naive hamming fraction at
    /// or under the tight bound.
    fn find_hfrac_merge(
        &mut self,
    ) -> anyhow::Result<Option<(f64, String, String)>> {
        let mut potential = Vec::new();
        for (name_a, name_b) in self.candidate_pairs() {
            let hfrac = self.naive_hfrac(&name_a, &name_b)?;
            if hfrac <= self.config.hfrac_bound_lo {
                potential.push((hfrac, name_a, name_b));
            }
        }
        Ok(self.choose_merge(potential, true))
    }

    /// Expensive phase: the pair with the largest likelihood ratio, among
    /// pairs under the loose hamming bound, if it clears the
    /// size-dependent threshold.
    fn find_lratio_merge(
        &mut self,
    ) -> anyhow::Result<Option<(f64, String, String)>> {
        let mut potential = Vec::new();
        for (name_a, name_b) in self.candidate_pairs() {
            let hfrac = self.naive_hfrac(&name_a, &name_b)?;
            if hfrac > self.config.hfrac_bound_hi {
                continue;
            }
            if self.failed_queries.contains(&name_a)
                || self.failed_queries.contains(&name_b)
            {
                // a boundary failure means no usable forward score, which
                // reads as an lratio of -inf
                continue;
            }
            let lratio = self.get_log_prob_ratio(&name_a, &name_b)?;
            if lratio == f64::NEG_INFINITY {
                continue;
            }
            let size = count_members(&name_a) + count_members(&name_b);
            if lratio < self.config.lratio_threshold(size) {
                continue;
            }
            potential.push((lratio, name_a, name_b));
        }
        Ok(self.choose_merge(potential, false))
    }

    /// Pick the best candidate; exact ties are ordered by joint key and
    /// broken by the run-seeded rng.
    fn choose_merge(
        &mut self,
        potential: Vec<(f64, String, String)>,
        smaller_is_better: bool,
    ) -> Option<(f64, String, String)> {
        let best = potential
            .iter()
            .map(|&(score, _, _)| score)
            .reduce(|acc, s| {
                if smaller_is_better {
                    acc.min(s)
                } else {
                    acc.max(s)
                }
            })?;
        let mut ties = potential
            .into_iter()
            .filter(|&(score, _, _)| score == best)
            .collect::<Vec<_>>();
        ties.sort_by(|(_, xa, xb), (_, ya, yb)| {
            merged_key(xa, xb).cmp(&merged_key(ya, yb))
        });
        let i_chosen = if ties.len() == 1 {
            0
        } else {
            self.rng.gen_range(0..ties.len())
        };
        Some(ties.swap_remove(i_chosen))
    }

    fn commit_merge(
        &mut self,
        name_a: &str,
        name_b: &str,
    ) -> anyhow::Result<String> {
        let query = self.get_merged_query(name_a, name_b)?;
        let name = query.name.clone();
        self.current_partition.shift_remove(name_a);
        self.current_partition.shift_remove(name_b);
        self.add_query(query)?;
        self.update_logprob_translations_for_asymmetrics(
            &name, name_a, name_b,
        );
        Ok(name)
    }

    fn get_merged_query(
        &self,
        name_a: &str,
        name_b: &str,
    ) -> anyhow::Result<Query> {
        let name = merged_key(name_a, name_b);
        // sequence order follows the sorted key order
        let (first, second) =
            if name_a <= name_b { (name_a, name_b) } else { (name_b, name_a) };
        let mut seqs = self.seqs_for_key(first)?;
        seqs.extend(self.seqs_for_key(second)?);

        let mut only_genes = self.only_genes[name_a].clone();
        for gene in &self.only_genes[name_b] {
            if !only_genes.contains(gene) {
                only_genes.push(gene.clone());
            }
        }
        let kbounds =
            self.kbinfo[name_a].logical_or(&self.kbinfo[name_b]);
        let n_a = count_members(name_a) as f64;
        let n_b = count_members(name_b) as f64;
        let mean_mute_freq = (n_a * self.mute_freqs[name_a]
            + n_b * self.mute_freqs[name_b])
            / (n_a + n_b);
        if self.cdr3_lengths[name_a] != self.cdr3_lengths[name_b] {
            return Err(GlomError::MalformedInputRow(format!(
                "cdr3 lengths differ between {name_a} and {name_b}"
            ))
            .into());
        }
        Ok(Query {
            name,
            seqs,
            kbounds,
            only_genes,
            mean_mute_freq,
            parents: Some((name_a.to_owned(), name_b.to_owned())),
            cdr3_length: self.cdr3_lengths[name_a],
        })
    }

    fn first_parent_much_bigger(&self, name_a: &str, name_b: &str) -> bool {
        let n_a = count_members(name_a);
        let n_b = count_members(name_b);
        n_a > self.config.max_cluster_size
            && n_a as f64 > self.config.asym_factor * n_b as f64
    }

    /// After a lopsided merge, point the new monster cluster's log prob at
    /// its dominant parent so later lratios against it reuse the parent's
    /// cached forward score.
    fn update_logprob_translations_for_asymmetrics(
        &mut self,
        merged_name: &str,
        name_a: &str,
        name_b: &str,
    ) {
        let surrogate = if self.first_parent_much_bigger(name_a, name_b) {
            Some(self.translator.resolve_asym(name_a).to_owned())
        } else if self.first_parent_much_bigger(name_b, name_a) {
            Some(self.translator.resolve_asym(name_b).to_owned())
        } else {
            None
        };
        if let Some(surrogate) = surrogate {
            debug!(
                "asymmetric translation {merged_name} --> {surrogate}"
            );
            self.translator
                .record_asym(merged_name.to_owned(), surrogate);
        }
    }

    // ------------------------------------------------------------------
    // naive sequences and the hamming pre-filter

    fn seqs_for_key(&self, key: &str) -> anyhow::Result<Vec<Sequence>> {
        key.split(NAME_DELIM)
            .map(|member| {
                self.single_seqs.get(member).cloned().ok_or_else(|| {
                    GlomError::MalformedInputRow(format!(
                        "unknown sequence {member} in cluster {key}"
                    ))
                    .into()
                })
            })
            .collect()
    }

    /// Minimal hamming fraction between the two clusters' naive sequences,
    /// memoized on the canonical joint key.
    fn naive_hfrac(
        &mut self,
        name_a: &str,
        name_b: &str,
    ) -> anyhow::Result<f64> {
        let key = joint_key(name_a, name_b);
        if let Some(&hfrac) = self.naive_hfracs.get(&key) {
            return Ok(hfrac);
        }
        let naive_a = self.get_naive_seq(name_a)?;
        let naive_b = self.get_naive_seq(name_b)?;
        let hfrac = if naive_a.len() == naive_b.len() {
            hamming_fraction(&naive_a, &naive_b)?
        } else {
            // different lengths can't merge, and there's no alignment step
            1.0
        };
        self.n_hfrac_calculated += 1;
        self.naive_hfracs.insert(key, hfrac);
        Ok(hfrac)
    }

    /// The cluster's viterbi naive sequence, possibly calculated under a
    /// surrogate key: a dominant parent for lopsided merges, or a
    /// representative subset for oversized clusters.
    fn get_naive_seq(&mut self, name: &str) -> anyhow::Result<String> {
        let resolved = self.translator.resolve_naive(name).to_owned();
        if let Some(naive) = self.naive_seqs.get(&resolved) {
            return Ok(naive.clone());
        }

        let mut name_to_calc = resolved.clone();
        if let Some((parent_a, parent_b)) =
            self.parents.get(&resolved).cloned()
        {
            if self.first_parent_much_bigger(&parent_a, &parent_b) {
                name_to_calc =
                    self.translator.resolve_naive(&parent_a).to_owned();
            } else if self.first_parent_much_bigger(&parent_b, &parent_a) {
                name_to_calc =
                    self.translator.resolve_naive(&parent_b).to_owned();
            }
        }
        if name_to_calc == resolved
            && count_members(&resolved) > self.config.max_cluster_size
        {
            name_to_calc = self
                .translator
                .subset_for(&resolved, self.config.max_cluster_size);
        }
        if name_to_calc != resolved {
            debug!("naive seq translation {resolved} --> {name_to_calc}");
            self.translator
                .record_naive(resolved.clone(), name_to_calc.clone());
            if let Some(naive) = self.naive_seqs.get(&name_to_calc) {
                return Ok(naive.clone());
            }
        }

        let naive = self.calculate_naive_seq(&name_to_calc, &resolved)?;
        self.naive_seqs.insert(name_to_calc, naive.clone());
        Ok(naive)
    }

    fn calculate_naive_seq(
        &mut self,
        calc_key: &str,
        ctx_key: &str,
    ) -> anyhow::Result<String> {
        let seqs = self.seqs_for_key(calc_key)?;
        let ctx = self.cluster_ctx(ctx_key)?;
        let result = run_dp(
            &mut self.vtb_dph,
            self.hmms,
            self.gl,
            &seqs,
            ctx.kbounds,
            &ctx.genes,
            ctx.mute_freq,
            self.config.n_best_events,
        )?;
        if result.could_not_expand() {
            self.add_failed_query(ctx_key, BOUNDARY_ERROR);
        }
        let event = result.best_event().ok_or_else(|| {
            anyhow::anyhow!("no viterbi path found for {calc_key}")
        })?;
        Ok(event.naive_seq.clone())
    }

    // ------------------------------------------------------------------
    // log probs and the likelihood ratio

    /// logP(a u b) - logP(a) - logP(b), memoized on the canonical joint
    /// key, with both sides run through the asymmetric translations.
    fn get_log_prob_ratio(
        &mut self,
        name_a: &str,
        name_b: &str,
    ) -> anyhow::Result<f64> {
        let key = joint_key(name_a, name_b);
        if let Some(&lratio) = self.lratios.get(&key) {
            return Ok(lratio);
        }

        let calc_a = self.logprob_name_to_calculate(name_a);
        let calc_b = self.logprob_name_to_calculate(name_b);
        if calc_a != name_a || calc_b != name_b {
            self.translator.record_logprob_pair(
                merged_key(name_a, name_b),
                (calc_a.clone(), calc_b.clone()),
            );
        }

        let logprob_a = self.get_log_prob(&calc_a)?;
        let logprob_b = self.get_log_prob(&calc_b)?;
        let joint_name = merged_key(&calc_a, &calc_b);
        let logprob_ab =
            self.get_log_prob_for_merge(&joint_name, &calc_a, &calc_b)?;

        let lratio = if [logprob_a, logprob_b, logprob_ab]
            .iter()
            .any(|lp| *lp == f64::NEG_INFINITY)
        {
            f64::NEG_INFINITY
        } else {
            logprob_ab - logprob_a - logprob_b
        };
        if self.config.debug > 0 {
            info!(
                "    {lratio:8.3} = {logprob_ab:8.2} - {logprob_a:8.2} - \
                 {logprob_b:8.2}   {name_a}  {name_b}"
            );
        }
        self.lratios.insert(key, lratio);
        Ok(lratio)
    }

    /// The key whose forward score stands in for <name>: asymmetric
    /// surrogates first, then a representative subset if it is still over
    /// the size cap.
    fn logprob_name_to_calculate(&mut self, name: &str) -> String {
        let resolved = self.translator.resolve_asym(name).to_owned();
        if count_members(&resolved) > self.config.max_cluster_size {
            let subset = self
                .translator
                .subset_for(&resolved, self.config.max_cluster_size);
            debug!("logprob translation {resolved} --> {subset}");
            self.translator.record_asym(resolved, subset.clone());
            return subset;
        }
        resolved
    }

    /// Forward log prob of an existing cluster key, calculated on demand.
    fn get_log_prob(&mut self, name: &str) -> anyhow::Result<f64> {
        if let Some(&logprob) = self.log_probs.get(name) {
            return Ok(logprob);
        }
        if self.failed_queries.contains(name) {
            return Ok(f64::NEG_INFINITY);
        }
        let ctx = self.cluster_ctx(name)?;
        self.calculate_log_prob(name, ctx)
    }

    /// Forward log prob of a joint key that does not exist as a cluster
    /// yet: bounds, gene list, and mutation frequency are the merge of its
    /// two sides'.
    fn get_log_prob_for_merge(
        &mut self,
        joint_name: &str,
        name_a: &str,
        name_b: &str,
    ) -> anyhow::Result<f64> {
        if let Some(&logprob) = self.log_probs.get(joint_name) {
            return Ok(logprob);
        }
        let ctx_a = self.cluster_ctx(name_a)?;
        let ctx_b = self.cluster_ctx(name_b)?;
        let mut genes = ctx_a.genes.clone();
        for gene in &ctx_b.genes {
            if !genes.contains(gene) {
                genes.push(gene.clone());
            }
        }
        let n_a = count_members(name_a) as f64;
        let n_b = count_members(name_b) as f64;
        let ctx = ClusterCtx::new(
            ctx_a.kbounds.logical_or(&ctx_b.kbounds),
            genes,
            (n_a * ctx_a.mute_freq + n_b * ctx_b.mute_freq) / (n_a + n_b),
        );
        self.calculate_log_prob(joint_name, ctx)
    }

    fn calculate_log_prob(
        &mut self,
        name: &str,
        ctx: ClusterCtx,
    ) -> anyhow::Result<f64> {
        let seqs = self.seqs_for_key(name)?;
        let result = run_dp(
            &mut self.fwd_dph,
            self.hmms,
            self.gl,
            &seqs,
            ctx.kbounds,
            &ctx.genes,
            ctx.mute_freq,
            self.config.n_best_events,
        )?;
        if result.could_not_expand() {
            self.add_failed_query(name, BOUNDARY_ERROR);
        }
        let logprob = result.total_score();
        self.log_probs.insert(name.to_owned(), logprob);
        Ok(logprob)
    }

    fn add_failed_query(&mut self, name: &str, error_str: &str) {
        debug!("query {name} failed: {error_str}");
        let entry = self.errors.entry(name.to_owned()).or_default();
        if !entry.split(JOINT_DELIM).any(|e| e == error_str) {
            if !entry.is_empty() {
                entry.push(JOINT_DELIM);
            }
            entry.push_str(error_str);
            // a refined value gets written back out even if the key came
            // in through the input cache
            self.initial_errors.remove(name);
        }
        self.failed_queries.insert(name.to_owned());
    }

    /// Bounds, gene shortlist, and mutation frequency for any cluster
    /// key: straight from the bookkeeping maps for real clusters, derived
    /// from the members' original input clusters for subset keys.
    fn cluster_ctx(&self, name: &str) -> anyhow::Result<ClusterCtx> {
        if let (Some(&kbounds), Some(genes), Some(&mute_freq)) = (
            self.kbinfo.get(name),
            self.only_genes.get(name),
            self.mute_freqs.get(name),
        ) {
            return Ok(ClusterCtx::new(kbounds, genes.clone(), mute_freq));
        }
        let mut kbounds: Option<KBounds> = None;
        let mut genes: Vec<String> = Vec::new();
        let mut freqs = Vec::new();
        for member in name.split(NAME_DELIM) {
            let origin =
                self.member_origin.get(member).ok_or_else(|| {
                    GlomError::MissingCacheKey(format!(
                        "no origin cluster for {member}"
                    ))
                })?;
            let &kb = self.kbinfo.get(origin).ok_or_else(|| {
                GlomError::MissingCacheKey(format!(
                    "no k bounds for {origin}"
                ))
            })?;
            kbounds = Some(match kbounds {
                Some(acc) => acc.logical_or(&kb),
                None => kb,
            });
            for gene in &self.only_genes[origin] {
                if !genes.contains(gene) {
                    genes.push(gene.clone());
                }
            }
            freqs.push(self.mute_freqs[origin]);
        }
        let kbounds = kbounds.ok_or_else(|| {
            GlomError::MissingCacheKey(format!("no k bounds for {name}"))
        })?;
        let mute_freq = freqs.iter().sum::<f64>() / freqs.len() as f64;
        Ok(ClusterCtx::new(kbounds, genes, mute_freq))
    }

    /// Sum of the member clusters' cached log probs; a cluster with no
    /// cached (or surrogate-cached) value, which happens for fresh
    /// hamming-phase merges, makes the whole partition score -inf rather
    /// than forcing a forward calculation.
    pub fn log_prob_of_partition(&self, partition: &[String]) -> f64 {
        let mut total = 0.0;
        for name in partition {
            let Some(resolved) =
                self.translator.resolve_logprob(name, &self.log_probs)
            else {
                debug!("no cached log prob for {name}");
                return f64::NEG_INFINITY;
            };
            total = add_with_minus_infinities(
                total,
                self.log_probs[&resolved],
            );
        }
        total
    }

    fn print_partition(
        &self,
        partition: &[String],
        logprob: f64,
        extra_str: &str,
    ) {
        info!("    {logprob:8.2} {extra_str} partition");
        for name in partition {
            info!("          {name}");
        }
    }

    // ------------------------------------------------------------------
    // viterbi annotation

    /// Annotate every current cluster with its best viterbi event.
    pub fn annotate(&mut self) -> anyhow::Result<Vec<Annotation>> {
        let names = self.partition();
        let bar = annotation_bar(names.len() as u64);
        let mut annotations = Vec::with_capacity(names.len());
        for name in names {
            let seqs = self.seqs_for_key(&name)?;
            let ctx = self.cluster_ctx(&name)?;
            let result = run_dp(
                &mut self.vtb_dph,
                self.hmms,
                self.gl,
                &seqs,
                ctx.kbounds,
                &ctx.genes,
                ctx.mute_freq,
                self.config.n_best_events,
            )?;
            if result.could_not_expand() {
                self.add_failed_query(&name, BOUNDARY_ERROR);
            }
            if self.config.debug > 1 {
                if let Some(event) = result.best_event() {
                    info!("{}", event.print(&seqs));
                }
            }
            annotations.push(Annotation {
                unique_ids: name.clone(),
                seqs: seqs
                    .iter()
                    .map(|s| s.seq())
                    .join(&NAME_DELIM.to_string()),
                logprob: result.total_score(),
                event: result.best_event().cloned(),
                errors: self.errors.get(&name).cloned().unwrap_or_default(),
            });
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(annotations)
    }

    // ------------------------------------------------------------------
    // cache file i/o

    fn read_cache_file(&mut self, fp: &Path) -> anyhow::Result<()> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(fp)
            .with_context(|| format!("failed to open cache file {fp:?}"))?;
        let mut n_rows = 0usize;
        for row in reader.deserialize() {
            let row: CacheRow = row.map_err(|e| {
                GlomError::MalformedCacheLine(e.to_string())
            })?;
            n_rows += 1;
            if row.unique_ids.contains(JOINT_DELIM) {
                let (name_a, name_b) =
                    row.unique_ids.split_once(JOINT_DELIM).unwrap();
                let key = joint_key(name_a, name_b);
                if let Some(hfrac) = row.naive_hfrac {
                    self.naive_hfracs.insert(key.clone(), hfrac);
                    self.initial_naive_hfracs.insert(key);
                }
                continue;
            }
            if let Some(logprob) = row.logprob {
                self.log_probs.insert(row.unique_ids.clone(), logprob);
                self.initial_log_probs.insert(row.unique_ids.clone());
            }
            if let Some(naive_seq) = row.naive_seq {
                if !naive_seq.is_empty() {
                    self.naive_seqs
                        .insert(row.unique_ids.clone(), naive_seq);
                    self.initial_naive_seqs.insert(row.unique_ids.clone());
                }
            }
            if let Some(errors) = row.errors {
                if !errors.is_empty() {
                    self.errors.insert(row.unique_ids.clone(), errors);
                    self.initial_errors.insert(row.unique_ids.clone());
                    self.failed_queries.insert(row.unique_ids);
                }
            }
        }
        info!("read {n_rows} cached lines from {fp:?}");
        Ok(())
    }

    /// Write single-key rows (logprob, naive seq, errors) and joint-key
    /// rows (naive hfrac), skipping keys that came in unchanged from the
    /// input cache. Rows are sorted so reruns are byte identical.
    pub fn write_cache_file(&self, fp: &Path) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(fp)
            .with_context(|| format!("failed to make cache file {fp:?}"))?;
        writer.write_record([
            "unique_ids",
            "logprob",
            "naive_seq",
            "naive_hfrac",
            "errors",
        ])?;

        let single_keys = self
            .log_probs
            .keys()
            .chain(self.naive_seqs.keys())
            .chain(self.errors.keys())
            .unique()
            .sorted()
            .collect::<Vec<&String>>();
        for key in single_keys {
            let new_logprob = self.log_probs.contains_key(key)
                && !self.initial_log_probs.contains(key);
            let new_naive = self.naive_seqs.contains_key(key)
                && !self.initial_naive_seqs.contains(key);
            let new_errors = self.errors.contains_key(key)
                && !self.initial_errors.contains(key);
            if !new_logprob && !new_naive && !new_errors {
                continue;
            }
            writer.write_record([
                key.clone(),
                self.log_probs
                    .get(key)
                    .map(|lp| lp.to_string())
                    .unwrap_or_default(),
                self.naive_seqs.get(key).cloned().unwrap_or_default(),
                String::new(),
                self.errors.get(key).cloned().unwrap_or_default(),
            ])?;
        }

        for key in self.naive_hfracs.keys().sorted() {
            if self.initial_naive_hfracs.contains(key) {
                continue;
            }
            writer.write_record([
                key.clone(),
                String::new(),
                String::new(),
                self.naive_hfracs[key].to_string(),
                String::new(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // progress and cancellation

    fn sentinel_exists(&self) -> bool {
        self.config
            .sentinel_fp
            .as_ref()
            .map(|fp| fp.exists())
            .unwrap_or(false)
    }

    fn write_status_maybe(&mut self, path: &ClusterPath) {
        let Some(fp) = self.config.progress_fp.clone() else {
            return;
        };
        if self.last_status_write.elapsed().as_secs()
            < STATUS_WRITE_INTERVAL_SECS
        {
            return;
        }
        let status = format!(
            "n_clusters {}  n_partitions {}  logprob {}  cached: logprobs \
             {}  naive_seqs {}  hfracs {}  asym_translations {}\n",
            self.current_partition.len(),
            path.len(),
            path.current_logprob().unwrap_or(f64::NEG_INFINITY),
            self.log_probs.len(),
            self.naive_seqs.len(),
            self.naive_hfracs.len(),
            self.translator.n_asym(),
        );
        if let Err(e) = std::fs::write(&fp, status) {
            debug!("failed to write status file {fp:?}: {e}");
        }
        self.last_status_write = Instant::now();
    }
}


/// Rescale the models to the cluster's mutation frequency, run with
/// boundary expansion until the argmax is interior or the rectangle can't
/// grow, then restore the models.
fn run_dp(
    dph: &mut DpHandler,
    hmms: &mut HmmHolder,
    gl: &GermLines,
    seqs: &[Sequence],
    kbounds: KBounds,
    genes: &[String],
    mute_freq: f64,
    n_best_events: usize,
) -> anyhow::Result<DpResult> {
    if let Err(e) = hmms.rescale_overall_mute_freq(genes, mute_freq) {
        // restore whatever was stashed before the failure
        hmms.unrescale_overall_mute_freq();
        return Err(e);
    }
    let result = (|| {
        let mut kbounds = kbounds;
        loop {
            let result =
                dph.run(hmms, gl, seqs, kbounds, genes, n_best_events)?;
            if !result.boundary_error() || result.could_not_expand() {
                return Ok(result);
            }
            debug!("expanding k bounds to {}", result.better_kbounds());
            kbounds = result.better_kbounds();
        }
    })();
    hmms.unrescale_overall_mute_freq();
    result
}
