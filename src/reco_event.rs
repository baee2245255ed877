use std::collections::HashMap;

use itertools::Itertools;

use crate::errs::GlomResult;
use crate::germlines::{color_gene, color_mutants, GermLines, Region};
use crate::sequences::Sequence;

/// A single reconstructed V(D)J rearrangement: the gene choice per region,
/// the deletion lengths off each germline end, the untemplated insertions,
/// and the naive sequence they assemble into.
#[derive(Debug, Clone, Default)]
pub struct RecoEvent {
    pub v_gene: String,
    pub d_gene: String,
    pub j_gene: String,
    pub v_5p_del: usize,
    pub v_3p_del: usize,
    pub d_5p_del: usize,
    pub d_3p_del: usize,
    pub j_5p_del: usize,
    pub j_3p_del: usize,
    pub fv_insertion: String,
    pub vd_insertion: String,
    pub dj_insertion: String,
    pub jf_insertion: String,
    /// Ranked (gene, logprob) support per region, filled on the best event
    /// only.
    pub per_gene_support: HashMap<Region, Vec<(String, f64)>>,
    pub score: f64,
    pub naive_seq: String,
}

impl RecoEvent {
    pub fn gene(&self, region: Region) -> &str {
        match region {
            Region::V => &self.v_gene,
            Region::D => &self.d_gene,
            Region::J => &self.j_gene,
        }
    }

    /// Assemble the naive sequence:
    /// fv + V[del_v5p..|V|-del_v3p] + vd + D[..] + dj + J[..] + jf.
    pub fn set_naive_seq(&mut self, gl: &GermLines) -> GlomResult<()> {
        let mut naive = String::new();
        naive.push_str(&self.fv_insertion);
        let v_seq = gl.seq(&self.v_gene)?;
        naive.push_str(&v_seq[self.v_5p_del..v_seq.len() - self.v_3p_del]);
        naive.push_str(&self.vd_insertion);
        let d_seq = gl.seq(&self.d_gene)?;
        naive.push_str(&d_seq[self.d_5p_del..d_seq.len() - self.d_3p_del]);
        naive.push_str(&self.dj_insertion);
        let j_seq = gl.seq(&self.j_gene)?;
        naive.push_str(&j_seq[self.j_5p_del..j_seq.len() - self.j_3p_del]);
        naive.push_str(&self.jf_insertion);
        self.naive_seq = naive;
        Ok(())
    }

    /// Support list for one region as `gene:logprob` pairs joined with
    /// semicolons, descending by logprob.
    pub fn support_string(&self, region: Region) -> String {
        self.per_gene_support
            .get(&region)
            .map(|supports| {
                supports
                    .iter()
                    .map(|(gene, logprob)| format!("{gene}:{logprob}"))
                    .join(";")
            })
            .unwrap_or_default()
    }

    /// Human-readable event dump for the debug merge trace: the naive
    /// sequence, then each input sequence with its mutated bases
    /// highlighted.
    pub fn print(&self, seqs: &[Sequence]) -> String {
        let mut out = format!(
            "      {} {} {}  score {:.2}\n        naive {}\n",
            color_gene(&self.v_gene),
            color_gene(&self.d_gene),
            color_gene(&self.j_gene),
            self.score,
            self.naive_seq
        );
        for seq in seqs {
            out.push_str(&format!(
                "        {} {}\n",
                color_mutants(seq.seq(), &[self.naive_seq.as_str()], Some('N')),
                seq.name()
            ));
        }
        out
    }
}

/// Descending score order; ties keep the incoming order.
pub(crate) fn sort_events_by_score(events: &mut [RecoEvent]) {
    events.sort_by(|a, b| b.score.total_cmp(&a.score));
}
