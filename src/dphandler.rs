use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use clap::ValueEnum;
use itertools::Itertools;
use log::debug;
use rustc_hash::FxHashMap;

use crate::errs::{GlomError, GlomResult};
use crate::germlines::{GermLines, Region, REGIONS};
use crate::hmm::HmmHolder;
use crate::reco_event::{sort_events_by_score, RecoEvent};
use crate::sequences::{check_same_length, Sequence};
use crate::trellis::{forward, viterbi, TracebackPath};
use crate::util::{add_with_minus_infinities, logsumexp2, NAME_DELIM};

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum Algorithm {
    Viterbi,
    Forward,
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::Viterbi => write!(f, "viterbi"),
            Algorithm::Forward => write!(f, "forward"),
        }
    }
}

/// One point in the k rectangle: k_v is the length of V plus the left
/// insert, k_d the length of D plus the middle insert.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct KSet {
    pub v: usize,
    pub d: usize,
}

/// Half-open rectangle [vmin, vmax) x [dmin, dmax) of k values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KBounds {
    pub vmin: usize,
    pub vmax: usize,
    pub dmin: usize,
    pub dmax: usize,
}

impl KBounds {
    pub fn new(vmin: usize, vmax: usize, dmin: usize, dmax: usize) -> Self {
        Self { vmin, vmax, dmin, dmax }
    }

    /// The widening a merged cluster inherits from its parents.
    pub fn logical_or(&self, other: &KBounds) -> KBounds {
        KBounds {
            vmin: self.vmin.min(other.vmin),
            vmax: self.vmax.max(other.vmax),
            dmin: self.dmin.min(other.dmin),
            dmax: self.dmax.max(other.dmax),
        }
    }
}

impl Display for KBounds {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}) x [{}, {})",
            self.vmin, self.vmax, self.dmin, self.dmax
        )
    }
}

#[derive(Debug, Clone)]
struct RegionDetail {
    best_gene: Option<String>,
    per_gene: Vec<(String, f64)>,
    window: (usize, usize),
}

type KsetDetail = HashMap<Region, RegionDetail>;

/// Everything one `DpHandler::run` call produced: candidate events (best
/// first, Viterbi only), the argmax kset, the total score, and the
/// boundary-expansion verdict.
#[derive(Debug)]
pub struct DpResult {
    events: Vec<RecoEvent>,
    best_kset: Option<KSet>,
    total_score: f64,
    boundary_error: bool,
    could_not_expand: bool,
    better_kbounds: KBounds,
}

impl DpResult {
    pub fn best_event(&self) -> Option<&RecoEvent> {
        self.events.first()
    }

    pub fn events(&self) -> &[RecoEvent] {
        &self.events
    }

    pub fn best_kset(&self) -> Option<KSet> {
        self.best_kset
    }

    pub fn total_score(&self) -> f64 {
        self.total_score
    }

    pub fn boundary_error(&self) -> bool {
        self.boundary_error
    }

    pub fn could_not_expand(&self) -> bool {
        self.could_not_expand
    }

    pub fn better_kbounds(&self) -> KBounds {
        self.better_kbounds
    }
}

#[derive(Debug, Clone)]
struct CachedDp {
    score: f64,
    path: Option<TracebackPath>,
}

/// Runs Viterbi or Forward for a set of same-length sequences over every
/// kset in a k rectangle. Per-gene trellises are memoized on
/// (gene, subsequence) so windows recurring across ksets are computed
/// once; the memo lives for one `run` unless chunk caching keeps it for
/// the handler's lifetime.
pub struct DpHandler {
    algorithm: Algorithm,
    chunk_cache: bool,
    cache: FxHashMap<(String, String), CachedDp>,
    n_calculated: usize,
}

impl DpHandler {
    pub fn new(algorithm: Algorithm, chunk_cache: bool) -> Self {
        Self {
            algorithm,
            chunk_cache,
            cache: FxHashMap::default(),
            n_calculated: 0,
        }
    }

    /// Trellises actually filled, as opposed to served from the memo.
    pub fn n_calculated(&self) -> usize {
        self.n_calculated
    }

    pub(crate) fn run(
        &mut self,
        hmms: &mut HmmHolder,
        gl: &GermLines,
        seqs: &[Sequence],
        kbounds: KBounds,
        only_genes: &[String],
        n_best_events: usize,
    ) -> anyhow::Result<DpResult> {
        let name_str = seqs.iter().map(|s| s.name()).join(&NAME_DELIM.to_string());
        let seq_len = check_same_length(&name_str, seqs)?;
        if !self.chunk_cache {
            self.cache.clear();
        }

        let heavy = gl.chain().is_heavy();
        let mut kbounds = kbounds;
        kbounds.vmin = kbounds.vmin.max(1);
        kbounds.dmin = kbounds.dmin.max(1);
        if !heavy {
            // light chains carry the synthetic one-base D, pinned at k_d 1
            kbounds.dmin = 1;
            kbounds.dmax = 2;
        }

        let region_genes = split_genes_by_region(gl, only_genes)?;

        let mut kset_scores: Vec<(KSet, f64)> = Vec::new();
        let mut kset_details: HashMap<KSet, KsetDetail> = HashMap::new();
        for k_v in kbounds.vmin..kbounds.vmax {
            for k_d in kbounds.dmin..kbounds.dmax {
                if k_v + k_d + 1 > seq_len {
                    continue;
                }
                let kset = KSet { v: k_v, d: k_d };
                let (score, detail) =
                    self.run_kset(hmms, seqs, kset, seq_len, &region_genes)?;
                kset_scores.push((kset, score));
                if self.algorithm == Algorithm::Viterbi
                    && score != f64::NEG_INFINITY
                {
                    kset_details.insert(kset, detail);
                }
            }
        }

        let mut best_kset = None;
        let mut best_score = f64::NEG_INFINITY;
        for &(kset, score) in &kset_scores {
            if score > best_score {
                best_score = score;
                best_kset = Some(kset);
            }
        }
        let total_score = match self.algorithm {
            Algorithm::Viterbi => best_score,
            Algorithm::Forward => kset_scores
                .iter()
                .fold(f64::NEG_INFINITY, |acc, &(_, s)| logsumexp2(acc, s)),
        };

        let mut events = Vec::new();
        if self.algorithm == Algorithm::Viterbi {
            for &(kset, score) in &kset_scores {
                let Some(detail) = kset_details.get(&kset) else {
                    continue;
                };
                events.push(self.build_event(hmms, gl, seqs, score, detail)?);
            }
            sort_events_by_score(&mut events);
            events.truncate(n_best_events.max(1));
            if let (Some(best), Some(kset)) = (events.first_mut(), best_kset) {
                let detail = &kset_details[&kset];
                for region in REGIONS {
                    best.per_gene_support
                        .insert(region, detail[&region].per_gene.clone());
                }
            }
        }

        let (boundary_error, could_not_expand, better_kbounds) =
            check_boundaries(best_kset, kbounds, seq_len, heavy);
        if boundary_error {
            debug!(
                "best kset for {name_str} on edge of {kbounds}, suggesting \
                 {better_kbounds}"
            );
        }

        Ok(DpResult {
            events,
            best_kset,
            total_score,
            boundary_error,
            could_not_expand,
            better_kbounds,
        })
    }

    fn run_kset(
        &mut self,
        hmms: &mut HmmHolder,
        seqs: &[Sequence],
        kset: KSet,
        seq_len: usize,
        region_genes: &HashMap<Region, Vec<String>>,
    ) -> anyhow::Result<(f64, KsetDetail)> {
        let mut total = 0.0;
        let mut detail = KsetDetail::new();
        for region in REGIONS {
            let window = region_window(kset, region, seq_len);
            let mut region_score = f64::NEG_INFINITY;
            let mut best_gene: Option<String> = None;
            let mut per_gene = Vec::new();
            for gene in &region_genes[&region] {
                let score = self.score_gene(hmms, seqs, gene, window)?;
                per_gene.push((gene.clone(), score));
                match self.algorithm {
                    Algorithm::Viterbi => {
                        if score > region_score {
                            region_score = score;
                            best_gene = Some(gene.clone());
                        }
                    }
                    Algorithm::Forward => {
                        region_score = logsumexp2(region_score, score);
                    }
                }
            }
            per_gene.sort_by(|(_, a), (_, b)| b.total_cmp(a));
            total = add_with_minus_infinities(total, region_score);
            detail.insert(region, RegionDetail { best_gene, per_gene, window });
        }
        Ok((total, detail))
    }

    /// Gene prior plus the trellis score for this window, memoized on
    /// (gene, subsequence string).
    fn score_gene(
        &mut self,
        hmms: &mut HmmHolder,
        seqs: &[Sequence],
        gene: &str,
        (start, end): (usize, usize),
    ) -> anyhow::Result<f64> {
        let window_str = window_key(seqs, start, end);
        let cache_key = (gene.to_owned(), window_str);
        if !self.cache.contains_key(&cache_key) {
            let model = hmms.get(gene)?;
            let windows =
                seqs.iter().map(|s| s.window(start, end)).collect::<Vec<_>>();
            let cached = match self.algorithm {
                Algorithm::Viterbi => {
                    let path = viterbi(model, &windows);
                    CachedDp {
                        score: path
                            .as_ref()
                            .map(|p| p.score())
                            .unwrap_or(f64::NEG_INFINITY),
                        path,
                    }
                }
                Algorithm::Forward => {
                    CachedDp { score: forward(model, &windows), path: None }
                }
            };
            self.n_calculated += 1;
            self.cache.insert(cache_key.clone(), cached);
        }
        let trellis_score = self.cache[&cache_key].score;
        let ln_gene_prob = hmms.get(gene)?.ln_gene_prob();
        Ok(add_with_minus_infinities(ln_gene_prob, trellis_score))
    }

    fn build_event(
        &self,
        hmms: &mut HmmHolder,
        gl: &GermLines,
        seqs: &[Sequence],
        score: f64,
        detail: &KsetDetail,
    ) -> anyhow::Result<RecoEvent> {
        let mut event = RecoEvent { score, ..Default::default() };
        let mut left_inserts = HashMap::new();
        let mut right_inserts = HashMap::new();
        for region in REGIONS {
            let rd = &detail[&region];
            let gene = rd.best_gene.as_ref().ok_or_else(|| {
                GlomError::UnknownGene(format!("no best {region} gene"))
            })?;
            let (start, end) = rd.window;
            let path = self
                .cache
                .get(&(gene.clone(), window_key(seqs, start, end)))
                .and_then(|c| c.path.as_ref())
                .ok_or_else(|| {
                    GlomError::MissingCacheKey(format!(
                        "no cached path for {gene}"
                    ))
                })?;
            let model = hmms.get(gene)?;
            let gene_len = gl.seq(gene)?.len();

            // the inserted bases come from the first sequence's window
            let window_chars = seqs[0].window_str(start, end);
            let mut first_pos = None;
            let mut last_pos = None;
            let mut left = String::new();
            let mut right = String::new();
            for (i_col, &i_state) in path.states().iter().enumerate() {
                let state = model.state(i_state);
                let ch = window_chars.as_bytes()[i_col] as char;
                match state.germline_pos() {
                    Some(pos) => {
                        if first_pos.is_none() {
                            first_pos = Some(pos);
                        }
                        last_pos = Some(pos);
                        right.clear();
                    }
                    None => {
                        if !state.is_insert() {
                            return Err(GlomError::MalformedHmmFile {
                                gene: gene.clone(),
                                reason: format!(
                                    "state {} is neither germline nor \
                                     insert",
                                    state.name()
                                ),
                            }
                            .into());
                        }
                        if first_pos.is_none() {
                            left.push(ch);
                        } else {
                            right.push(ch);
                        }
                    }
                }
            }
            let (del_5p, del_3p) = match (first_pos, last_pos) {
                (Some(first), Some(last)) => {
                    let del_3p =
                        gene_len.checked_sub(last + 1).ok_or_else(|| {
                            GlomError::MalformedHmmFile {
                                gene: gene.clone(),
                                reason: format!(
                                    "germline position {last} outside the \
                                     {gene_len}-base gene"
                                ),
                            }
                        })?;
                    (first, del_3p)
                }
                _ => (gene_len, 0),
            };
            match region {
                Region::V => {
                    event.v_gene = gene.clone();
                    event.v_5p_del = del_5p;
                    event.v_3p_del = del_3p;
                }
                Region::D => {
                    event.d_gene = gene.clone();
                    event.d_5p_del = del_5p;
                    event.d_3p_del = del_3p;
                }
                Region::J => {
                    event.j_gene = gene.clone();
                    event.j_5p_del = del_5p;
                    event.j_3p_del = del_3p;
                }
            }
            left_inserts.insert(region, left);
            right_inserts.insert(region, right);
        }
        event.fv_insertion = left_inserts.remove(&Region::V).unwrap();
        event.vd_insertion = format!(
            "{}{}",
            right_inserts.remove(&Region::V).unwrap(),
            left_inserts.remove(&Region::D).unwrap()
        );
        event.dj_insertion = format!(
            "{}{}",
            right_inserts.remove(&Region::D).unwrap(),
            left_inserts.remove(&Region::J).unwrap()
        );
        event.jf_insertion = right_inserts.remove(&Region::J).unwrap();
        event.set_naive_seq(gl)?;
        Ok(event)
    }
}

fn region_window(kset: KSet, region: Region, seq_len: usize) -> (usize, usize) {
    match region {
        Region::V => (0, kset.v),
        Region::D => (kset.v, kset.v + kset.d),
        Region::J => (kset.v + kset.d, seq_len),
    }
}

fn window_key(seqs: &[Sequence], start: usize, end: usize) -> String {
    seqs.iter()
        .map(|s| s.window_str(start, end))
        .join(&NAME_DELIM.to_string())
}

fn split_genes_by_region(
    gl: &GermLines,
    only_genes: &[String],
) -> GlomResult<HashMap<Region, Vec<String>>> {
    let mut region_genes: HashMap<Region, Vec<String>> =
        REGIONS.iter().map(|&r| (r, Vec::new())).collect();
    for gene in only_genes {
        gl.seq(gene)?;
        let region = Region::from_gene(gene)?;
        let genes = region_genes.get_mut(&region).unwrap();
        if !genes.contains(gene) {
            genes.push(gene.clone());
        }
    }
    // an empty shortlist for a region means every germline gene is in play
    for region in REGIONS {
        let genes = region_genes.get_mut(&region).unwrap();
        if genes.is_empty() {
            genes.extend(gl.genes(region).iter().cloned());
        }
    }
    Ok(region_genes)
}

/// Boundary check: the argmax kset sitting on an edge of the searched
/// rectangle means the real optimum may lie outside it. The suggested
/// rectangle shifts the offending edges by 2, clamped so the mins stay
/// positive and a non-empty J window survives.
fn check_boundaries(
    best_kset: Option<KSet>,
    kbounds: KBounds,
    seq_len: usize,
    heavy: bool,
) -> (bool, bool, KBounds) {
    let Some(best) = best_kset else {
        return (false, false, kbounds);
    };
    let mut boundary_error = false;
    let mut better = kbounds;
    if best.v == kbounds.vmin {
        boundary_error = true;
        better.vmin = kbounds.vmin.saturating_sub(2).max(1);
    }
    if best.v + 1 == kbounds.vmax {
        boundary_error = true;
        better.vmax = (kbounds.vmax + 2).min(seq_len.saturating_sub(better.dmin));
    }
    if heavy {
        if best.d == kbounds.dmin {
            boundary_error = true;
            better.dmin = kbounds.dmin.saturating_sub(2).max(1);
        }
        if best.d + 1 == kbounds.dmax {
            boundary_error = true;
            better.dmax =
                (kbounds.dmax + 2).min(seq_len.saturating_sub(better.vmin));
        }
    }
    let could_not_expand = boundary_error && better == kbounds;
    (boundary_error, could_not_expand, better)
}
