use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;

use crate::errs::{GlomError, GlomResult};

pub(crate) const NAME_DELIM: char = ':';
pub(crate) const JOINT_DELIM: char = ';';
pub(crate) const PARTITION_DELIM: char = ';';

/// Ticker for the merge loop: counts committed merges, the message carries
/// the shrinking cluster count.
pub(crate) fn merge_ticker() -> ProgressBar {
    let ticker = ProgressBar::new_spinner();
    ticker.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} {pos} merges committed, {msg}",
        )
        .expect("merge ticker template should parse"),
    );
    ticker
}

/// Bar for the viterbi annotation pass, one tick per cluster.
pub(crate) fn annotation_bar(n_clusters: u64) -> ProgressBar {
    ProgressBar::new(n_clusters).with_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {pos}/{len} clusters annotated",
        )
        .expect("annotation bar template should parse"),
    )
}

/// Log-space addition, log(exp(a) + exp(b)), with the minus-infinity
/// absorbing rule so an empty accumulator can start at -inf.
pub(crate) fn logsumexp2(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Plain addition of log probs where either operand may be -inf.
pub(crate) fn add_with_minus_infinities(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        a + b
    }
}

/// Per-base disagreement rate between two equal-length sequences.
pub(crate) fn hamming_fraction(a: &str, b: &str) -> GlomResult<f64> {
    if a.len() != b.len() {
        return Err(GlomError::UnevenSequenceLengths(format!("{a} vs {b}")));
    }
    if a.is_empty() {
        return Ok(0.0);
    }
    let n_diff = a.chars().zip(b.chars()).filter(|(ca, cb)| ca != cb).count();
    Ok(n_diff as f64 / a.len() as f64)
}

/// Canonical joint key for a pair of cluster keys, used by the naive hfrac
/// and lratio caches. The two keys are sorted so either encounter order
/// probes the same entry.
pub(crate) fn joint_key(name_a: &str, name_b: &str) -> String {
    let (lo, hi) =
        if name_a <= name_b { (name_a, name_b) } else { (name_b, name_a) };
    format!("{lo}{JOINT_DELIM}{hi}")
}

/// Name of the cluster produced by merging <name_a> and <name_b>: the
/// colon-join of the two keys, sorted. The constituent names inside each
/// key keep their original order.
pub(crate) fn merged_key(name_a: &str, name_b: &str) -> String {
    let (lo, hi) =
        if name_a <= name_b { (name_a, name_b) } else { (name_b, name_a) };
    format!("{lo}{NAME_DELIM}{hi}")
}

pub(crate) fn count_members(name_str: &str) -> usize {
    name_str.split(NAME_DELIM).count()
}

pub(crate) fn contains_member(name_str: &str, member: &str) -> bool {
    name_str.split(NAME_DELIM).any(|n| n == member)
}

/// First <n_max> constituent names, in input order.
pub(crate) fn subset_key(name_str: &str, n_max: usize) -> String {
    name_str.split(NAME_DELIM).take(n_max).join(&NAME_DELIM.to_string())
}

#[cfg(test)]
mod util_tests {
    use assert_approx_eq::assert_approx_eq;

    use super::*;

    #[test]
    fn test_logsumexp2_minus_inf_identity() {
        assert_eq!(logsumexp2(f64::NEG_INFINITY, -3.0), -3.0);
        assert_eq!(logsumexp2(-3.0, f64::NEG_INFINITY), -3.0);
        assert_eq!(
            logsumexp2(f64::NEG_INFINITY, f64::NEG_INFINITY),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn test_logsumexp2_commutes() {
        let x = logsumexp2(-10.0, -11.5);
        let y = logsumexp2(-11.5, -10.0);
        assert_eq!(x, y);
        assert_approx_eq!(x, ((-10f64).exp() + (-11.5f64).exp()).ln());
    }

    #[test]
    fn test_add_with_minus_infinities() {
        assert_eq!(add_with_minus_infinities(-1.0, -2.0), -3.0);
        assert_eq!(
            add_with_minus_infinities(f64::NEG_INFINITY, -2.0),
            f64::NEG_INFINITY
        );
        assert_eq!(
            add_with_minus_infinities(-2.0, f64::NEG_INFINITY),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn test_hamming_fraction_identity_and_symmetry() {
        assert_eq!(hamming_fraction("ACGT", "ACGT").unwrap(), 0.0);
        let ab = hamming_fraction("ACGT", "ACGA").unwrap();
        let ba = hamming_fraction("ACGA", "ACGT").unwrap();
        assert_eq!(ab, ba);
        assert_approx_eq!(ab, 0.25);
        assert!(hamming_fraction("ACG", "ACGT").is_err());
    }

    #[test]
    fn test_joint_key_canonicalizes() {
        assert_eq!(joint_key("b", "a"), "a;b");
        assert_eq!(joint_key("a", "b"), "a;b");
        assert_eq!(joint_key("s1:s2", "q"), "q;s1:s2");
    }

    #[test]
    fn test_merged_key_sorts_pair_not_members() {
        assert_eq!(merged_key("s2:s1", "a"), "a:s2:s1");
        assert_eq!(count_members(&merged_key("s2:s1", "a")), 3);
    }

    #[test]
    fn test_subset_key() {
        assert_eq!(subset_key("a:b:c:d", 2), "a:b");
        assert_eq!(subset_key("a", 5), "a");
    }

    #[test]
    fn test_contains_member() {
        assert!(contains_member("s1:s22:s3", "s22"));
        assert!(!contains_member("s1:s22:s3", "s2"));
    }
}
