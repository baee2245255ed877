use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::anyhow;

pub const TOY_V: (&str, &str) = ("IGHV1-1*01", "ACG");
pub const TOY_D: (&str, &str) = ("IGHD1-1*01", "GG");
pub const TOY_J: (&str, &str) = ("IGHJ1*01", "TTA");

pub fn run_vdjglom(args: &[&str]) -> anyhow::Result<Output> {
    let exe = Path::new(env!("CARGO_BIN_EXE_vdjglom"));
    assert!(exe.exists());

    let output = std::process::Command::new(exe)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?
        .wait_with_output()?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(anyhow!("failed to run {:?}", args.join(" ")))
    }
}

fn sanitize_gene_name(gene: &str) -> String {
    gene.replace('*', "_star_").replace('/', "_slash_")
}

/// A minimal but complete hmm parameter file: init feeds insert_left and
/// the first germline state, each germline state emits its base at 0.91,
/// the last one (and, for J models, insert_right) feeds end.
pub fn toy_model_yaml(
    gene: &str,
    germline: &str,
    with_insert_right: bool,
) -> String {
    let bases = germline.chars().collect::<Vec<char>>();
    let n = bases.len();
    let mut doc = format!(
        "name: {gene}\n\
         extras:\n  gene_prob: 0.5\n\
         tracks:\n  nukes: [A, C, G, T]\n\
         states:\n"
    );
    doc.push_str(&format!(
        "- name: init\n  transitions:\n  - to: insert_left\n    prob: 0.1\n  - to: {gene}_0\n    prob: 0.9\n"
    ));
    doc.push_str(&format!(
        "- name: insert_left\n  emissions: [0.25, 0.25, 0.25, 0.25]\n  transitions:\n  - to: insert_left\n    prob: 0.1\n  - to: {gene}_0\n    prob: 0.9\n"
    ));
    for (i_base, base) in bases.iter().enumerate() {
        let mut emissions = vec![0.03; 4];
        let i_emit = match base {
            'A' => 0,
            'C' => 1,
            'G' => 2,
            _ => 3,
        };
        emissions[i_emit] = 0.91;
        let emissions = emissions
            .iter()
            .map(|p| format!("{p}"))
            .collect::<Vec<String>>()
            .join(", ");
        doc.push_str(&format!(
            "- name: {gene}_{i_base}\n  emissions: [{emissions}]\n  transitions:\n"
        ));
        if i_base + 1 < n {
            doc.push_str(&format!(
                "  - to: {gene}_{}\n    prob: 1.0\n",
                i_base + 1
            ));
        } else if with_insert_right {
            doc.push_str(
                "  - to: insert_right\n    prob: 0.1\n  - to: end\n    prob: 0.9\n",
            );
        } else {
            doc.push_str("  - to: end\n    prob: 1.0\n");
        }
    }
    if with_insert_right {
        doc.push_str(
            "- name: insert_right\n  emissions: [0.25, 0.25, 0.25, 0.25]\n  transitions:\n  - to: insert_right\n    prob: 0.1\n  - to: end\n    prob: 0.9\n",
        );
    }
    doc
}

/// Lay out a germline directory and an hmm directory under <dir> for the
/// three toy genes, and return their paths.
pub fn write_fixtures(dir: &Path) -> (PathBuf, PathBuf) {
    let germline_dir = dir.join("germlines");
    let chain_dir = germline_dir.join("h");
    fs::create_dir_all(&chain_dir).unwrap();
    fs::write(
        chain_dir.join("ighv.fasta"),
        format!(">{}\n{}\n", TOY_V.0, TOY_V.1),
    )
    .unwrap();
    fs::write(
        chain_dir.join("ighd.fasta"),
        format!(">{}\n{}\n", TOY_D.0, TOY_D.1),
    )
    .unwrap();
    fs::write(
        chain_dir.join("ighj.fasta"),
        format!(">{}\n{}\n", TOY_J.0, TOY_J.1),
    )
    .unwrap();
    fs::write(
        chain_dir.join("extras.csv"),
        format!(
            "gene,cyst_position,tryp_position,phen_position\n\
             {},1,,\n{},,,\n{},,1,\n",
            TOY_V.0, TOY_D.0, TOY_J.0
        ),
    )
    .unwrap();

    let hmm_dir = dir.join("hmms");
    fs::create_dir_all(&hmm_dir).unwrap();
    for ((gene, germline), with_right) in
        [(TOY_V, false), (TOY_D, false), (TOY_J, true)]
    {
        fs::write(
            hmm_dir.join(format!("{}.yaml", sanitize_gene_name(gene))),
            toy_model_yaml(gene, germline, with_right),
        )
        .unwrap();
    }
    (germline_dir, hmm_dir)
}

/// One singleton cluster per (name, seq) pair, all with the same toy gene
/// shortlist and k bounds wide enough that the argmax kset is interior.
pub fn write_input_csv(fp: &Path, clusters: &[(&str, &str)]) {
    let only_genes = [TOY_V.0, TOY_D.0, TOY_J.0].join(":");
    let mut text = "names,seqs,k_v_min,k_v_max,k_d_min,k_d_max,mut_freqs,\
                    only_genes,cdr3_length\n"
        .to_owned();
    for (name, seq) in clusters {
        text.push_str(&format!(
            "{name},{seq},2,5,1,4,0.05,{only_genes},3\n"
        ));
    }
    fs::write(fp, text).unwrap();
}

pub fn check_legal_csv(fp: &Path) -> anyhow::Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .from_reader(fs::File::open(fp).expect("should open file"));
    for (i_record, record) in reader.records().enumerate() {
        if let Err(e) = record {
            return Err(anyhow!("failed to parse line at {i_record}, {e}"));
        }
    }
    Ok(())
}
