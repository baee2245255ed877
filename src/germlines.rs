use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::Path;

use ansi_term::{Colour, Style};
use anyhow::Context;
use clap::ValueEnum;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::errs::{GlomError, GlomResult};

/// The synthetic single-base D gene shared by all non-heavy clusters. The
/// character at index 3 has to read as a d region.
pub(crate) const DUMMY_D_SEQ: &str = "A";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, ValueEnum)]
pub enum Chain {
    H,
    K,
    L,
}

impl Chain {
    pub fn is_heavy(&self) -> bool {
        matches!(self, Chain::H)
    }

    pub fn char(&self) -> char {
        match self {
            Chain::H => 'h',
            Chain::K => 'k',
            Chain::L => 'l',
        }
    }

    pub(crate) fn dummy_d_gene(&self) -> Option<String> {
        match self {
            Chain::H => None,
            Chain::K => Some("IGKDx-x*x".to_owned()),
            Chain::L => Some("IGLDx-x*x".to_owned()),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Region {
    V,
    D,
    J,
}

pub(crate) const REGIONS: [Region; 3] = [Region::V, Region::D, Region::J];

impl Region {
    /// Region from a gene name, e.g. IGHD1-1*01 -> d: the character at
    /// index 3, lowercased.
    pub fn from_gene(gene: &str) -> GlomResult<Self> {
        let ch = gene
            .chars()
            .nth(3)
            .ok_or_else(|| GlomError::MalformedGeneName(gene.to_owned()))?;
        match ch.to_ascii_lowercase() {
            'v' => Ok(Region::V),
            'd' => Ok(Region::D),
            'j' => Ok(Region::J),
            other => Err(GlomError::InvalidRegion(other.to_string())),
        }
    }

    pub fn char(&self) -> char {
        match self {
            Region::V => 'v',
            Region::D => 'd',
            Region::J => 'j',
        }
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.char())
    }
}

/// Replace the characters in a gene name that can't appear in a filename.
pub fn sanitize_gene_name(gene: &str) -> String {
    gene.replace('*', "_star_").replace('/', "_slash_")
}

#[derive(Debug, Deserialize)]
struct ExtrasRow {
    gene: String,
    cyst_position: Option<usize>,
    tryp_position: Option<usize>,
    phen_position: Option<usize>,
}

/// Germline V/D/J sequences for one chain, plus the conserved-codon
/// positions from extras.csv.
pub struct GermLines {
    chain: Chain,
    seqs: HashMap<String, String>,
    region_genes: HashMap<Region, Vec<String>>,
    cyst_positions: HashMap<String, usize>,
    tryp_positions: HashMap<String, usize>,
    phen_positions: HashMap<String, usize>,
}

impl GermLines {
    /// Read `<germline_dir>/<chain>/ig<chain>{v,d,j}.fasta` and
    /// `<germline_dir>/<chain>/extras.csv`. Non-heavy chains get the
    /// synthetic single-base D gene appended to the d region.
    pub fn load(germline_dir: &Path, chain: Chain) -> anyhow::Result<Self> {
        let chain_dir = germline_dir.join(chain.char().to_string());
        let mut seqs = HashMap::new();
        let mut region_genes: HashMap<Region, Vec<String>> =
            REGIONS.iter().map(|&r| (r, Vec::new())).collect();

        for region in REGIONS {
            let fasta_fp = chain_dir
                .join(format!("ig{}{}.fasta", chain.char(), region.char()));
            if !fasta_fp.exists() {
                if region == Region::D && !chain.is_heavy() {
                    continue;
                }
                return Err(GlomError::MissingGermlineFile(fasta_fp).into());
            }
            let reader = bio::io::fasta::Reader::from_file(&fasta_fp)
                .with_context(|| {
                    format!("failed to open germline fasta {fasta_fp:?}")
                })?;
            for record in reader.records() {
                let record = record.with_context(|| {
                    format!("failed to read record from {fasta_fp:?}")
                })?;
                let gene = record.id().to_owned();
                let seq = String::from_utf8(record.seq().to_vec())
                    .with_context(|| {
                        format!("non-utf8 germline sequence for {gene}")
                    })?
                    .to_ascii_uppercase();
                region_genes.get_mut(&region).unwrap().push(gene.clone());
                seqs.insert(gene, seq);
            }
        }

        if let Some(dummy_d) = chain.dummy_d_gene() {
            seqs.insert(dummy_d.clone(), DUMMY_D_SEQ.to_owned());
            region_genes.get_mut(&Region::D).unwrap().push(dummy_d);
        }

        let mut cyst_positions = HashMap::new();
        let mut tryp_positions = HashMap::new();
        let mut phen_positions = HashMap::new();
        let extras_fp = chain_dir.join("extras.csv");
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&extras_fp)
            .with_context(|| format!("failed to open {extras_fp:?}"))?;
        for row in reader.deserialize() {
            let row: ExtrasRow = row
                .with_context(|| format!("malformed row in {extras_fp:?}"))?;
            if let Some(pos) = row.cyst_position {
                cyst_positions.insert(row.gene.clone(), pos);
            }
            if let Some(pos) = row.tryp_position {
                tryp_positions.insert(row.gene.clone(), pos);
            }
            if let Some(pos) = row.phen_position {
                phen_positions.insert(row.gene.clone(), pos);
            }
        }

        Ok(Self {
            chain,
            seqs,
            region_genes,
            cyst_positions,
            tryp_positions,
            phen_positions,
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn seq(&self, gene: &str) -> GlomResult<&str> {
        self.seqs
            .get(gene)
            .map(|s| s.as_str())
            .ok_or_else(|| GlomError::UnknownGene(gene.to_owned()))
    }

    pub fn genes(&self, region: Region) -> &[String] {
        &self.region_genes[&region]
    }

    pub fn cyst_position(&self, v_gene: &str) -> Option<usize> {
        self.cyst_positions.get(v_gene).copied()
    }

    pub fn tryp_position(&self, j_gene: &str) -> Option<usize> {
        self.tryp_positions.get(j_gene).copied()
    }

    pub fn phen_position(&self, j_gene: &str) -> Option<usize> {
        self.phen_positions.get(j_gene).copied()
    }
}

lazy_static! {
    // e.g. IGHV1-18*01, IGKJ4*02, IGHJ6*02_F
    static ref GENE_REGEX: Regex = Regex::new(
        r"^IG[HKL][VDJvdj](?P<version>[^\-*]+)(-(?P<subversion>[^*]+))?\*(?P<allele>[^_]+)(?P<suffix>_.+)?$"
    )
    .unwrap();
}

/// Colorized gene name for the debug merge trace.
pub(crate) fn color_gene(gene: &str) -> String {
    let Some(caps) = GENE_REGEX.captures(gene) else {
        return gene.to_owned();
    };
    let region = Region::from_gene(gene)
        .map(|r| r.char().to_string())
        .unwrap_or_default();
    let mut out = Colour::Red.paint(region).to_string();
    out.push_str(
        &Colour::Purple.paint(caps.name("version").unwrap().as_str()).to_string(),
    );
    if let Some(sub) = caps.name("subversion") {
        out.push('-');
        out.push_str(&Colour::Purple.paint(sub.as_str()).to_string());
    }
    out.push_str(
        &Colour::Yellow.paint(caps.name("allele").unwrap().as_str()).to_string(),
    );
    if let Some(suffix) = caps.name("suffix") {
        out.push_str(suffix.as_str());
    }
    out
}

/// Return <seq> with bases differing from the references colorized: inserts
/// ('i') yellow, single-reference disagreements red, multi-reference
/// disagreements red in reverse video. Ambiguous bases never count as
/// mutated.
pub(crate) fn color_mutants(
    seq: &str,
    refs: &[&str],
    ambiguous_char: Option<char>,
) -> String {
    let mut out = String::new();
    let ref_chars =
        refs.iter().map(|r| r.chars().collect::<Vec<char>>()).collect::<Vec<_>>();
    for (inuc, ch) in seq.chars().enumerate() {
        if ch == 'i' {
            out.push_str(&Colour::Yellow.paint(ch.to_string()).to_string());
            continue;
        }
        let n_diff = ref_chars
            .iter()
            .filter(|r| {
                let rc = r.get(inuc).copied().unwrap_or(ch);
                if let Some(ambig) = ambiguous_char {
                    if rc == ambig || ch == ambig {
                        return false;
                    }
                }
                rc != ch
            })
            .count();
        match n_diff {
            0 => out.push(ch),
            1 => out.push_str(&Colour::Red.paint(ch.to_string()).to_string()),
            _ => out.push_str(
                &Style::new()
                    .reverse()
                    .fg(Colour::Red)
                    .paint(ch.to_string())
                    .to_string(),
            ),
        }
    }
    out
}
