use std::fs;

use crate::common::{
    check_legal_csv, run_vdjglom, write_fixtures, write_input_csv, TOY_D,
    TOY_J, TOY_V,
};

mod common;

#[test]
fn test_cluster_helps() {
    let _ = run_vdjglom(&["--help"]).expect("failed to run vdjglom help");
}

#[test]
fn test_forward_collapses_identical_singletons() {
    let tmp = tempfile::tempdir().unwrap();
    let (germline_dir, hmm_dir) = write_fixtures(tmp.path());
    let infile = tmp.path().join("clusters.csv");
    // two identical reads that are an exact germline composition
    write_input_csv(&infile, &[("s1", "ACGGGTTA"), ("s2", "ACGGGTTA")]);
    let outfile = tmp.path().join("partitions.csv");
    let cachefile = tmp.path().join("cache.csv");

    run_vdjglom(&[
        "--algorithm",
        "forward",
        "--hmm-dir",
        hmm_dir.to_str().unwrap(),
        "--germline-dir",
        germline_dir.to_str().unwrap(),
        "--chain",
        "h",
        "--infile",
        infile.to_str().unwrap(),
        "--outfile",
        outfile.to_str().unwrap(),
        "--outcachefile",
        cachefile.to_str().unwrap(),
        "--hamming-fraction-bounds",
        "0.05:0.5",
    ])
    .expect("failed to run vdjglom forward");

    check_legal_csv(&outfile).unwrap();
    let text = fs::read_to_string(&outfile).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert_eq!(lines[0], "logprob,n_procs,partition,logweight");
    // initial two-cluster partition, then the single merged cluster
    assert_eq!(lines.len(), 3);
    assert!(lines[1].contains("s1;s2") || lines[1].contains("s2;s1"));
    assert!(lines[2].contains("s1:s2"));

    // identical naive sequences collapse through the hamming phase, so
    // the merged cluster never gets a forward score
    assert!(lines[2].starts_with("-inf"));

    let cache = fs::read_to_string(&cachefile).unwrap();
    assert!(cache.starts_with("unique_ids,logprob,naive_seq,naive_hfrac,errors"));
    // per-cluster forward scores, viterbi naive seqs, and the pair hfrac
    assert!(cache.contains("\ns1,-"));
    assert!(cache.contains("\ns2,-"));
    assert!(cache.contains("ACGGGTTA"));
    assert!(cache.contains("\ns1;s2,,,0,"));
}

#[test]
fn test_cache_replay_is_byte_identical() {
    let tmp = tempfile::tempdir().unwrap();
    let (germline_dir, hmm_dir) = write_fixtures(tmp.path());
    let infile = tmp.path().join("clusters.csv");
    write_input_csv(
        &infile,
        &[("s1", "ACGGGTTA"), ("s2", "ACGGGTTA"), ("s3", "ACGGGTAA")],
    );

    let run = |out_name: &str, cache_name: &str, incache: Option<&str>| {
        let outfile = tmp.path().join(out_name);
        let cachefile = tmp.path().join(cache_name);
        let mut args = vec![
            "--algorithm".to_owned(),
            "forward".to_owned(),
            "--hmm-dir".to_owned(),
            hmm_dir.to_str().unwrap().to_owned(),
            "--germline-dir".to_owned(),
            germline_dir.to_str().unwrap().to_owned(),
            "--chain".to_owned(),
            "h".to_owned(),
            "--infile".to_owned(),
            infile.to_str().unwrap().to_owned(),
            "--outfile".to_owned(),
            outfile.to_str().unwrap().to_owned(),
            "--outcachefile".to_owned(),
            cachefile.to_str().unwrap().to_owned(),
            "--hamming-fraction-bounds".to_owned(),
            "0.05:0.5".to_owned(),
            "--rng-seed".to_owned(),
            "7".to_owned(),
        ];
        if let Some(incache) = incache {
            args.push("--incachefile".to_owned());
            args.push(tmp.path().join(incache).to_str().unwrap().to_owned());
        }
        let args = args.iter().map(|a| a.as_str()).collect::<Vec<&str>>();
        run_vdjglom(&args).expect("failed to run vdjglom forward");
        fs::read_to_string(&outfile).unwrap()
    };

    let first = run("partitions_1.csv", "cache_1.csv", None);
    let replay =
        run("partitions_2.csv", "cache_2.csv", Some("cache_1.csv"));
    similar_asserts::assert_eq!(first, replay);

    // everything the replay needed came in through the cache
    let second_cache =
        fs::read_to_string(tmp.path().join("cache_2.csv")).unwrap();
    assert_eq!(second_cache.lines().count(), 1, "{second_cache}");

    // identical seeds reproduce the cache file too
    let third = run("partitions_3.csv", "cache_3.csv", None);
    similar_asserts::assert_eq!(first, third);
    let first_cache =
        fs::read_to_string(tmp.path().join("cache_1.csv")).unwrap();
    let third_cache =
        fs::read_to_string(tmp.path().join("cache_3.csv")).unwrap();
    similar_asserts::assert_eq!(first_cache, third_cache);
}

#[test]
fn test_viterbi_annotates_exact_germline_composition() {
    let tmp = tempfile::tempdir().unwrap();
    let (germline_dir, hmm_dir) = write_fixtures(tmp.path());
    let infile = tmp.path().join("clusters.csv");
    write_input_csv(&infile, &[("s1", "ACGGGTTA"), ("s2", "TCGGGTTA")]);
    let outfile = tmp.path().join("annotations.csv");

    run_vdjglom(&[
        "--algorithm",
        "viterbi",
        "--hmm-dir",
        hmm_dir.to_str().unwrap(),
        "--germline-dir",
        germline_dir.to_str().unwrap(),
        "--chain",
        "h",
        "--infile",
        infile.to_str().unwrap(),
        "--outfile",
        outfile.to_str().unwrap(),
    ])
    .expect("failed to run vdjglom viterbi");

    check_legal_csv(&outfile).unwrap();
    let mut reader = csv::Reader::from_path(&outfile).unwrap();
    let rows = reader
        .records()
        .collect::<Result<Vec<csv::StringRecord>, csv::Error>>()
        .unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(&row[1], TOY_V.0);
        assert_eq!(&row[2], TOY_D.0);
        assert_eq!(&row[3], TOY_J.0);
        // no deletions, no insertions for these reads
        for i_col in 4..=7 {
            assert_eq!(&row[i_col], "");
        }
        for i_col in 8..=13 {
            assert_eq!(&row[i_col], "0");
        }
        assert_eq!(&row[19], "");
        // ranked per-gene support carries the chosen gene
        assert!(row[16].contains(TOY_V.0));
        assert!(row[18].contains(TOY_J.0));
    }
    assert_eq!(&rows[0][0], "s1");
    assert_eq!(&rows[0][15], "ACGGGTTA");
    assert_eq!(&rows[1][0], "s2");
}
