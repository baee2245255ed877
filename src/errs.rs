use std::path::PathBuf;

pub type GlomResult<T> = Result<T, GlomError>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum GlomError {
    #[error("invalid nucleotide {0} in sequence {1}")]
    InvalidNucleotide(char, String),
    #[error("sequences in cluster {0} are not all the same length")]
    UnevenSequenceLengths(String),
    #[error("unknown gene {0}")]
    UnknownGene(String),
    #[error("gene name {0} too short to carry a region character")]
    MalformedGeneName(String),
    #[error("{0} is not a v, d, or j region")]
    InvalidRegion(String),
    #[error("germline file {0:?} is missing")]
    MissingGermlineFile(PathBuf),
    #[error("malformed input row: {0}")]
    MalformedInputRow(String),
    #[error("malformed cache line: {0}")]
    MalformedCacheLine(String),
    #[error("hmm file for {gene}: {reason}")]
    MalformedHmmFile { gene: String, reason: String },
    #[error("no cached log prob for {0} after it was calculated")]
    MissingCacheKey(String),
    #[error("rescale called while a rescale was already in effect")]
    NestedRescale,
}
