use std::path::PathBuf;

use anyhow::{anyhow, bail};
use clap::Parser;
use itertools::Itertools;
use log::info;

use crate::dphandler::Algorithm;
use crate::germlines::{Chain, GermLines};
use crate::glomerator::{GlomConfig, Glomerator};
use crate::hmm::HmmHolder;
use crate::input::read_query_clusters;
use crate::writers;

#[derive(Parser)]
#[command(
    name = "vdjglom",
    about = "Agglomerative clustering of B-cell receptor sequences by \
             per-cluster V(D)J hmm likelihoods"
)]
pub struct Cli {
    /// Algorithm to run: forward clusters and writes the partition
    /// trajectory, viterbi annotates each input cluster.
    #[arg(long, value_enum)]
    algorithm: Algorithm,
    /// Directory with one hmm parameter file per gene.
    #[arg(long)]
    hmm_dir: PathBuf,
    /// Directory with per-chain germline fastas and extras.csv.
    #[arg(long)]
    germline_dir: PathBuf,
    /// Which chain the input sequences come from.
    #[arg(long, value_enum)]
    chain: Chain,
    /// Input clusters CSV, one row per starting cluster.
    #[arg(long)]
    infile: PathBuf,
    /// Output CSV: partitions (forward) or annotations (viterbi).
    #[arg(long)]
    outfile: PathBuf,
    /// Cache file from a previous run to start from.
    #[arg(long)]
    incachefile: Option<PathBuf>,
    /// Where to write this run's cache entries.
    #[arg(long)]
    outcachefile: Option<PathBuf>,
    /// Loose hamming-fraction bound: pairs above it are never merge
    /// candidates.
    #[arg(long, default_value_t = 0.08)]
    hamming_fraction_cutoff: f64,
    /// Tight and loose hamming bounds as tight:loose, e.g. 0.015:0.08.
    /// Overrides --hamming-fraction-cutoff.
    #[arg(long)]
    hamming_fraction_bounds: Option<String>,
    /// Minimum likelihood ratio for a merge, as a comma list of
    /// size:threshold pairs applied as a step function of candidate
    /// cluster size, e.g. 2:8,5:12,10:18.
    #[arg(long, default_value = "2:8,5:12,10:18")]
    logprob_ratio_threshold: String,
    /// Clusters bigger than this get subset/surrogate treatment for the
    /// expensive hmm calculations.
    #[arg(long, default_value_t = 20)]
    max_cluster_size: usize,
    /// Size ratio beyond which a merge counts as lopsided and the bigger
    /// parent's cached score stands in for the result.
    #[arg(long, default_value_t = 4.0)]
    asym_factor: f64,
    /// Restrict clustering to clusters containing this sequence.
    #[arg(long)]
    seed_unique_id: Option<String>,
    /// Seed for breaking exact merge-score ties.
    #[arg(long, default_value_t = 1)]
    rng_seed: u64,
    /// How many candidate viterbi events to keep per cluster.
    #[arg(long, default_value_t = 3)]
    n_best_events: usize,
    /// Debug verbosity for the merge trace (0-2).
    #[arg(long, default_value_t = 0)]
    debug: u8,
    /// Keep per-gene trellises across dp invocations.
    #[arg(long, default_value_t = false)]
    chunk_cache: bool,
    /// Stop once the partition score has dropped this far below the best
    /// one seen.
    #[arg(long, default_value_t = 1000.0)]
    max_logprob_drop: f64,
    /// If this file appears, finish the current merge, flush caches, and
    /// exit cleanly.
    #[arg(long)]
    sentinel_file: Option<PathBuf>,
    /// Path to file to write run log.
    #[arg(long, alias = "log")]
    log_filepath: Option<PathBuf>,
}

/// Parse a comma list of size:threshold pairs into the step function the
/// merge loop consults, e.g. "2:8,5:12,10:18".
pub(crate) fn parse_lratio_thresholds(
    raw: &str,
) -> anyhow::Result<Vec<(usize, f64)>> {
    let mut thresholds = raw
        .split(',')
        .map(|part| {
            let (size, threshold) = part.split_once(':').ok_or_else(|| {
                anyhow!(
                    "encountered illegal lratio threshold: {part}. Should \
                     be size:threshold e.g. 5:12"
                )
            })?;
            let size = size
                .parse::<usize>()
                .map_err(|e| anyhow!("bad threshold size {size}, {e}"))?;
            let threshold = threshold
                .parse::<f64>()
                .map_err(|e| anyhow!("bad threshold value {threshold}, {e}"))?;
            Ok((size, threshold))
        })
        .collect::<anyhow::Result<Vec<(usize, f64)>>>()?;
    if thresholds.is_empty() {
        bail!("no lratio thresholds provided");
    }
    thresholds.sort_by_key(|&(size, _)| size);
    if thresholds.iter().map(|&(size, _)| size).duplicates().count() > 0 {
        bail!("repeated size in lratio thresholds {raw}");
    }
    Ok(thresholds)
}

/// Parse a tight:loose hamming-fraction bound pair, e.g. "0.015:0.08".
pub(crate) fn parse_hfrac_bounds(raw: &str) -> anyhow::Result<(f64, f64)> {
    let (lo, hi) = raw.split_once(':').ok_or_else(|| {
        anyhow!(
            "encountered illegal hamming bounds: {raw}. Should be \
             tight:loose e.g. 0.015:0.08"
        )
    })?;
    let lo = lo.parse::<f64>().map_err(|e| anyhow!("bad bound {lo}, {e}"))?;
    let hi = hi.parse::<f64>().map_err(|e| anyhow!("bad bound {hi}, {e}"))?;
    if lo > hi {
        bail!("tight hamming bound {lo} is above the loose bound {hi}");
    }
    Ok((lo, hi))
}

impl Cli {
    pub fn log_filepath(&self) -> Option<&PathBuf> {
        self.log_filepath.as_ref()
    }

    pub fn run(self) -> anyhow::Result<()> {
        let (hfrac_bound_lo, hfrac_bound_hi) =
            match &self.hamming_fraction_bounds {
                Some(raw) => parse_hfrac_bounds(raw)?,
                None => (
                    0.015f64.min(self.hamming_fraction_cutoff),
                    self.hamming_fraction_cutoff,
                ),
            };
        let lratio_thresholds =
            parse_lratio_thresholds(&self.logprob_ratio_threshold)?;

        let gl = GermLines::load(&self.germline_dir, self.chain)?;
        let mut hmms = HmmHolder::new(&self.hmm_dir);
        let queries = read_query_clusters(&self.infile)?;
        info!(
            "read {} clusters from {:?}, running {}",
            queries.len(),
            self.infile,
            self.algorithm
        );

        let progress_fp =
            PathBuf::from(format!("{}.progress", self.outfile.display()));
        let config = GlomConfig {
            hfrac_bound_lo,
            hfrac_bound_hi,
            lratio_thresholds,
            max_cluster_size: self.max_cluster_size,
            asym_factor: self.asym_factor,
            seed_unique_id: self.seed_unique_id.clone(),
            rng_seed: self.rng_seed,
            n_best_events: self.n_best_events,
            debug: self.debug,
            chunk_cache: self.chunk_cache,
            max_logprob_drop: self.max_logprob_drop,
            sentinel_fp: self.sentinel_file.clone(),
            progress_fp: Some(progress_fp),
        };

        let mut glom = Glomerator::new(
            &gl,
            &mut hmms,
            queries,
            config,
            self.incachefile.as_deref(),
        )?;
        match self.algorithm {
            Algorithm::Forward => {
                let path = glom.cluster()?;
                writers::write_partitions(&path, &self.outfile, 1)?;
                info!(
                    "wrote {} partitions to {:?}",
                    path.len(),
                    self.outfile
                );
            }
            Algorithm::Viterbi => {
                let annotations = glom.annotate()?;
                writers::write_annotations(&annotations, &self.outfile)?;
                info!(
                    "wrote {} annotations to {:?}",
                    annotations.len(),
                    self.outfile
                );
            }
        }
        if let Some(fp) = &self.outcachefile {
            glom.write_cache_file(fp)?;
            info!("wrote cache to {fp:?}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn test_parse_lratio_thresholds() {
        let thresholds = parse_lratio_thresholds("5:12,2:8,10:18").unwrap();
        assert_eq!(thresholds, vec![(2, 8.0), (5, 12.0), (10, 18.0)]);
        assert!(parse_lratio_thresholds("nope").is_err());
        assert!(parse_lratio_thresholds("2:8,2:9").is_err());
        assert!(parse_lratio_thresholds("2:x").is_err());
    }

    #[test]
    fn test_parse_hfrac_bounds() {
        assert_eq!(parse_hfrac_bounds("0.015:0.08").unwrap(), (0.015, 0.08));
        assert!(parse_hfrac_bounds("0.08").is_err());
        assert!(parse_hfrac_bounds("0.5:0.08").is_err());
    }

    #[test]
    fn test_cli_parses_a_full_command_line() {
        let cli = Cli::try_parse_from([
            "vdjglom",
            "--algorithm",
            "forward",
            "--hmm-dir",
            "/tmp/hmms",
            "--germline-dir",
            "/tmp/germlines",
            "--chain",
            "h",
            "--infile",
            "in.csv",
            "--outfile",
            "out.csv",
            "--hamming-fraction-bounds",
            "0.01:0.1",
            "--rng-seed",
            "42",
        ])
        .unwrap();
        assert_eq!(cli.rng_seed, 42);
        assert!(matches!(cli.algorithm, Algorithm::Forward));
        assert!(matches!(cli.chain, Chain::H));
    }
}
