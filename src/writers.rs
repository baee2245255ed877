use std::path::Path;

use anyhow::Context;
use itertools::Itertools;

use crate::clusterpath::ClusterPath;
use crate::germlines::Region;
use crate::glomerator::Annotation;
use crate::util::PARTITION_DELIM;

/// Write the trajectory of visited partitions: one row each, clusters
/// semicolon-joined, the best row carrying the path's log weight.
pub fn write_partitions(
    path: &ClusterPath,
    fp: &Path,
    n_procs: usize,
) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(fp)
        .with_context(|| format!("failed to make partition file {fp:?}"))?;
    writer.write_record(["logprob", "n_procs", "partition", "logweight"])?;
    for (i_row, (partition, logprob, logweight)) in path.iter().enumerate() {
        let partition_str =
            partition.iter().join(&PARTITION_DELIM.to_string());
        let logweight_str = if path.i_best() == Some(i_row) {
            logweight.to_string()
        } else {
            String::new()
        };
        writer.write_record([
            &logprob.to_string(),
            &n_procs.to_string(),
            &partition_str,
            &logweight_str,
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub(crate) fn annotation_header() -> [&'static str; 20] {
    [
        "unique_ids",
        "v_gene",
        "d_gene",
        "j_gene",
        "fv_insertion",
        "vd_insertion",
        "dj_insertion",
        "jf_insertion",
        "v_5p_del",
        "v_3p_del",
        "d_5p_del",
        "d_3p_del",
        "j_5p_del",
        "j_3p_del",
        "logprob",
        "seqs",
        "v_per_gene_support",
        "d_per_gene_support",
        "j_per_gene_support",
        "errors",
    ]
}

/// Write one row per annotated cluster. A cluster whose decoding failed
/// keeps its row, with empty event fields and its errors string.
pub fn write_annotations(
    annotations: &[Annotation],
    fp: &Path,
) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(fp)
        .with_context(|| format!("failed to make annotation file {fp:?}"))?;
    writer.write_record(annotation_header())?;
    for annotation in annotations {
        let row = match &annotation.event {
            Some(event) => [
                annotation.unique_ids.clone(),
                event.v_gene.clone(),
                event.d_gene.clone(),
                event.j_gene.clone(),
                event.fv_insertion.clone(),
                event.vd_insertion.clone(),
                event.dj_insertion.clone(),
                event.jf_insertion.clone(),
                event.v_5p_del.to_string(),
                event.v_3p_del.to_string(),
                event.d_5p_del.to_string(),
                event.d_3p_del.to_string(),
                event.j_5p_del.to_string(),
                event.j_3p_del.to_string(),
                annotation.logprob.to_string(),
                annotation.seqs.clone(),
                event.support_string(Region::V),
                event.support_string(Region::D),
                event.support_string(Region::J),
                annotation.errors.clone(),
            ],
            None => {
                let mut row =
                    std::array::from_fn::<String, 20, _>(|_| String::new());
                row[0] = annotation.unique_ids.clone();
                row[14] = annotation.logprob.to_string();
                row[15] = annotation.seqs.clone();
                row[19] = annotation.errors.clone();
                row
            }
        };
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod writers_tests {
    use std::collections::HashMap;
    use std::fs;

    use super::*;
    use crate::reco_event::RecoEvent;

    #[test]
    fn test_write_partitions_marks_the_best_row() {
        let dir = tempfile::tempdir().unwrap();
        let fp = dir.path().join("partitions.csv");
        let mut path = ClusterPath::new();
        path.add_partition(
            vec!["s1".to_owned(), "s2".to_owned()],
            -22.0,
            0.0,
        );
        path.add_partition(vec!["s1:s2".to_owned()], -20.0, -0.5);
        write_partitions(&path, &fp, 1).unwrap();

        let text = fs::read_to_string(&fp).unwrap();
        let lines = text.lines().collect::<Vec<&str>>();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "logprob,n_procs,partition,logweight");
        assert_eq!(lines[1], "-22,1,s1;s2,");
        assert_eq!(lines[2], "-20,1,s1:s2,-0.5");
    }

    #[test]
    fn test_write_annotations_round_trips_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let fp = dir.path().join("annotations.csv");
        let mut event = RecoEvent {
            v_gene: "IGHV1-1*01".to_owned(),
            d_gene: "IGHD1-1*01".to_owned(),
            j_gene: "IGHJ1*01".to_owned(),
            v_3p_del: 1,
            vd_insertion: "AA".to_owned(),
            score: -35.5,
            per_gene_support: HashMap::new(),
            ..Default::default()
        };
        event.per_gene_support.insert(
            Region::V,
            vec![
                ("IGHV1-1*01".to_owned(), -35.5),
                ("IGHV2-2*01".to_owned(), -40.0),
            ],
        );
        let annotations = vec![
            Annotation {
                unique_ids: "s1:s2".to_owned(),
                seqs: "ACGT:ACGT".to_owned(),
                logprob: -35.5,
                event: Some(event),
                errors: String::new(),
            },
            Annotation {
                unique_ids: "s3".to_owned(),
                seqs: "ACGT".to_owned(),
                logprob: f64::NEG_INFINITY,
                event: None,
                errors: "boundary".to_owned(),
            },
        ];
        write_annotations(&annotations, &fp).unwrap();

        let mut reader = csv::Reader::from_path(&fp).unwrap();
        let rows = reader
            .records()
            .collect::<Result<Vec<csv::StringRecord>, csv::Error>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "s1:s2");
        assert_eq!(&rows[0][1], "IGHV1-1*01");
        assert_eq!(&rows[0][5], "AA");
        assert_eq!(&rows[0][9], "1");
        assert_eq!(
            &rows[0][16],
            "IGHV1-1*01:-35.5;IGHV2-2*01:-40"
        );
        assert_eq!(&rows[1][0], "s3");
        assert_eq!(&rows[1][1], "");
        assert_eq!(&rows[1][19], "boundary");
    }
}
