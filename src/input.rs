use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::dphandler::KBounds;
use crate::errs::GlomError;
use crate::glomerator::Query;
use crate::sequences::Sequence;
use crate::util::NAME_DELIM;

#[derive(Debug, Deserialize)]
struct QueryRow {
    names: String,
    seqs: String,
    k_v_min: usize,
    k_v_max: usize,
    k_d_min: usize,
    k_d_max: usize,
    mut_freqs: String,
    only_genes: String,
    cdr3_length: usize,
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(NAME_DELIM).filter(|part| !part.is_empty()).collect()
}

/// Read the input clusters file: one row per starting cluster, with
/// colon-delimited lists inside the list-valued fields. The k maxes are
/// exclusive, matching the half-open k rectangle.
pub fn read_query_clusters(fp: &Path) -> anyhow::Result<Vec<Query>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(fp)
        .with_context(|| format!("failed to open input file {fp:?}"))?;
    let mut queries = Vec::new();
    for row in reader.deserialize() {
        let row: QueryRow =
            row.map_err(|e| GlomError::MalformedInputRow(e.to_string()))?;
        let names = split_list(&row.names);
        let seq_strs = split_list(&row.seqs);
        if names.is_empty() || names.len() != seq_strs.len() {
            return Err(GlomError::MalformedInputRow(format!(
                "{} names but {} seqs in cluster {}",
                names.len(),
                seq_strs.len(),
                row.names
            ))
            .into());
        }
        let seqs = names
            .iter()
            .zip(seq_strs)
            .map(|(name, seq)| Sequence::new(name, seq))
            .collect::<Result<Vec<Sequence>, _>>()?;

        let mut_freqs = split_list(&row.mut_freqs)
            .iter()
            .map(|raw| {
                raw.parse::<f64>().map_err(|e| {
                    GlomError::MalformedInputRow(format!(
                        "bad mut freq {raw}: {e}"
                    ))
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        if mut_freqs.is_empty() {
            return Err(GlomError::MalformedInputRow(format!(
                "no mut freqs for cluster {}",
                row.names
            ))
            .into());
        }
        let mean_mute_freq =
            mut_freqs.iter().sum::<f64>() / mut_freqs.len() as f64;

        queries.push(Query {
            name: row.names,
            seqs,
            kbounds: KBounds::new(
                row.k_v_min,
                row.k_v_max,
                row.k_d_min,
                row.k_d_max,
            ),
            only_genes: split_list(&row.only_genes)
                .iter()
                .map(|g| g.to_string())
                .collect(),
            mean_mute_freq,
            parents: None,
            cdr3_length: row.cdr3_length,
        });
    }
    Ok(queries)
}

#[cfg(test)]
mod input_tests {
    use std::fs;

    use assert_approx_eq::assert_approx_eq;

    use super::*;

    #[test]
    fn test_read_query_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let fp = dir.path().join("clusters.csv");
        fs::write(
            &fp,
            "names,seqs,k_v_min,k_v_max,k_d_min,k_d_max,mut_freqs,\
             only_genes,cdr3_length\n\
             s1,ACGTACGT,2,5,1,4,0.05,IGHV1-1*01:IGHJ1*01,3\n\
             s2:s3,AAGTACGT:ACGTACGT,3,6,1,3,0.04:0.06,,3\n",
        )
        .unwrap();
        let queries = read_query_clusters(&fp).unwrap();
        assert_eq!(queries.len(), 2);

        assert_eq!(queries[0].name, "s1");
        assert_eq!(queries[0].seqs.len(), 1);
        assert_eq!(queries[0].kbounds, KBounds::new(2, 5, 1, 4));
        assert_eq!(
            queries[0].only_genes,
            vec!["IGHV1-1*01".to_owned(), "IGHJ1*01".to_owned()]
        );

        assert_eq!(queries[1].name, "s2:s3");
        assert_eq!(queries[1].seqs.len(), 2);
        assert_eq!(queries[1].seqs[1].name(), "s3");
        assert!(queries[1].only_genes.is_empty());
        assert_approx_eq!(queries[1].mean_mute_freq, 0.05);
    }

    #[test]
    fn test_mismatched_names_and_seqs_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fp = dir.path().join("clusters.csv");
        fs::write(
            &fp,
            "names,seqs,k_v_min,k_v_max,k_d_min,k_d_max,mut_freqs,\
             only_genes,cdr3_length\n\
             s1:s2,ACGTACGT,2,5,1,4,0.05,,3\n",
        )
        .unwrap();
        assert!(read_query_clusters(&fp).is_err());
    }

    #[test]
    fn test_bad_nucleotide_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fp = dir.path().join("clusters.csv");
        fs::write(
            &fp,
            "names,seqs,k_v_min,k_v_max,k_d_min,k_d_max,mut_freqs,\
             only_genes,cdr3_length\n\
             s1,ACGTACGX,2,5,1,4,0.05,,3\n",
        )
        .unwrap();
        assert!(read_query_clusters(&fp).is_err());
    }
}
