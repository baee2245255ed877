use crate::hmm::Model;
use crate::util::logsumexp2;

/// The two DP semirings: max-plus for Viterbi, log-sum-exp for Forward.
/// The trellis is parameterized by the semiring instead of branching per
/// cell.
pub(crate) trait Semiring {
    const TRACEBACK: bool;
    fn plus(a: f64, b: f64) -> f64;
}

pub(crate) struct MaxPlus;

impl Semiring for MaxPlus {
    const TRACEBACK: bool = true;

    fn plus(a: f64, b: f64) -> f64 {
        a.max(b)
    }
}

pub(crate) struct LogPlus;

impl Semiring for LogPlus {
    const TRACEBACK: bool = false;

    fn plus(a: f64, b: f64) -> f64 {
        logsumexp2(a, b)
    }
}

/// The single best path through a model, as arena state indices, one per
/// emitted column.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TracebackPath {
    states: Vec<usize>,
    score: f64,
}

impl TracebackPath {
    pub(crate) fn states(&self) -> &[usize] {
        &self.states
    }

    pub(crate) fn score(&self) -> f64 {
        self.score
    }
}

/// Joint emission of one column across every sequence in the cluster.
fn ln_emit(model: &Model, i_state: usize, windows: &[&[u8]], col: usize) -> f64 {
    windows
        .iter()
        .map(|w| model.state(i_state).ln_emit(w[col]))
        .sum::<f64>()
}

fn fill<S: Semiring>(
    model: &Model,
    windows: &[&[u8]],
    backpointers: &mut Vec<Vec<usize>>,
) -> (Vec<f64>, f64) {
    let n_states = model.n_states();
    let n_cols = windows[0].len();
    let mut cur = vec![f64::NEG_INFINITY; n_states];
    for &(i_state, ln_prob) in model.init_transitions() {
        cur[i_state] = S::plus(
            cur[i_state],
            ln_prob + ln_emit(model, i_state, windows, 0),
        );
    }

    for col in 1..n_cols {
        let mut next = vec![f64::NEG_INFINITY; n_states];
        let mut ptrs = vec![usize::MAX; n_states];
        for i_from in 0..n_states {
            if cur[i_from] == f64::NEG_INFINITY {
                continue;
            }
            for &(i_to, ln_prob) in model.state(i_from).transitions() {
                let candidate = cur[i_from] + ln_prob;
                if S::TRACEBACK {
                    if candidate > next[i_to] {
                        next[i_to] = candidate;
                        ptrs[i_to] = i_from;
                    }
                } else {
                    next[i_to] = S::plus(next[i_to], candidate);
                }
            }
        }
        for (i_state, cell) in next.iter_mut().enumerate() {
            if *cell != f64::NEG_INFINITY {
                *cell += ln_emit(model, i_state, windows, col);
            }
        }
        if S::TRACEBACK {
            backpointers.push(ptrs);
        }
        cur = next;
    }

    let mut score = f64::NEG_INFINITY;
    for (i_state, cell) in cur.iter().enumerate() {
        score =
            S::plus(score, cell + model.state(i_state).end_ln_prob());
    }
    (cur, score)
}

/// Forward log probability of the window set: log-sum over every path
/// ending in a state with an end transition.
pub(crate) fn forward(model: &Model, windows: &[&[u8]]) -> f64 {
    if windows.is_empty() || windows[0].is_empty() {
        return f64::NEG_INFINITY;
    }
    let mut unused = Vec::new();
    fill::<LogPlus>(model, windows, &mut unused).1
}

/// Best single path and its score, or None when no path reaches the end
/// state.
pub(crate) fn viterbi(
    model: &Model,
    windows: &[&[u8]],
) -> Option<TracebackPath> {
    if windows.is_empty() || windows[0].is_empty() {
        return None;
    }
    let mut backpointers = Vec::with_capacity(windows[0].len());
    let (last_cells, score) = fill::<MaxPlus>(model, windows, &mut backpointers);
    if score == f64::NEG_INFINITY {
        return None;
    }
    let mut i_state = 0;
    let mut best = f64::NEG_INFINITY;
    for (i, cell) in last_cells.iter().enumerate() {
        let total = cell + model.state(i).end_ln_prob();
        if total > best {
            best = total;
            i_state = i;
        }
    }
    let mut states = vec![i_state];
    for ptrs in backpointers.iter().rev() {
        i_state = ptrs[i_state];
        states.push(i_state);
    }
    states.reverse();
    Some(TracebackPath { states, score })
}

#[cfg(test)]
mod trellis_tests {
    use assert_approx_eq::assert_approx_eq;

    use super::*;
    use crate::hmm::hmm_tests::toy_model_yaml;
    use crate::sequences::Sequence;

    fn toy_model(gene: &str, germline: &str) -> Model {
        Model::from_yaml(&toy_model_yaml(gene, germline, false), gene).unwrap()
    }

    #[test]
    fn test_viterbi_exact_match_path() {
        let model = toy_model("IGHV1-1*01", "ACG");
        let seq = Sequence::new("s1", "ACG").unwrap();
        let windows = vec![seq.digits()];
        let path = viterbi(&model, &windows).unwrap();
        // forced through the three germline states, indices 1..=3
        assert_eq!(path.states(), &[1, 2, 3]);
        let expected = 0.9f64.ln() + 3.0 * 0.91f64.ln();
        assert_approx_eq!(path.score(), expected, 1e-9);
    }

    #[test]
    fn test_viterbi_takes_insert_states_for_long_window() {
        let model = toy_model("IGHV1-1*01", "ACG");
        let seq = Sequence::new("s1", "TACG").unwrap();
        let windows = vec![seq.digits()];
        let path = viterbi(&model, &windows).unwrap();
        assert_eq!(path.states(), &[0, 1, 2, 3]); // insert_left first
    }

    #[test]
    fn test_forward_upper_bounds_viterbi() {
        let model = toy_model("IGHV1-1*01", "ACGT");
        let seq = Sequence::new("s1", "ACGA").unwrap();
        let windows = vec![seq.digits()];
        let vtb = viterbi(&model, &windows).unwrap().score();
        let fwd = forward(&model, &windows);
        assert!(fwd >= vtb);
        assert!(fwd.is_finite());
    }

    #[test]
    fn test_forward_single_path_equals_viterbi() {
        // one-base germline, window of length one: only one path exists
        let model = toy_model("IGHD9-9*09", "G");
        let seq = Sequence::new("s1", "G").unwrap();
        let windows = vec![seq.digits()];
        let vtb = viterbi(&model, &windows).unwrap().score();
        let fwd = forward(&model, &windows);
        assert_approx_eq!(vtb, 0.9f64.ln() + 0.91f64.ln(), 1e-9);
        // forward also sums the insert-entry path, which can't finish in
        // one column, so the two agree
        assert_approx_eq!(fwd, vtb, 1e-9);
    }

    #[test]
    fn test_joint_emission_over_two_sequences() {
        let model = toy_model("IGHD9-9*09", "G");
        let s1 = Sequence::new("s1", "G").unwrap();
        let s2 = Sequence::new("s2", "G").unwrap();
        let both = vec![s1.digits(), s2.digits()];
        let fwd = forward(&model, &both);
        assert_approx_eq!(fwd, 0.9f64.ln() + 2.0 * 0.91f64.ln(), 1e-9);
    }

    #[test]
    fn test_no_path_returns_none() {
        let model = toy_model("IGHV1-1*01", "ACG");
        // a two-column window can't reach the end state, which only
        // follows the third germline position
        let seq = Sequence::new("s1", "AC").unwrap();
        let windows = vec![seq.digits()];
        assert!(viterbi(&model, &windows).is_none());
        assert_eq!(forward(&model, &windows), f64::NEG_INFINITY);
    }
}
