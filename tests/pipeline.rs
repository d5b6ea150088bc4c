use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fml_core::config::{Config, IndelMethod};
use fml_core::mutations::{map_mutations, read_mutations, Mutation};
use fml_core::reference::MemoryGenome;
use fml_core::regions::{read_regions, RegionTree, Regions};
use fml_core::sampling::SamplingStatus;
use fml_core::scores::MemorySource;
use fml_core::store::{read_results, write_results, OutputPaths};
use fml_core::{analyze, finalize, ElementResult, Sources};

fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    path
}

fn config(sampling: u64) -> Config {
    let mut config = Config::default();
    config.statistic.indels.include = false;
    config.statistic.sampling = sampling;
    config.statistic.sampling_max = sampling;
    config.settings.seed = Some(2024);
    config.settings.silent = true;
    config
}

fn load(dir: &Path, regions: &str, mutations: &str) -> (Regions, BTreeMap<String, Vec<Mutation>>) {
    let regions = read_regions(&write_file(dir, "regions.tsv", regions)).unwrap();
    let mutations = read_mutations(&write_file(dir, "muts.tsv", mutations), "SIGNATURE", &HashSet::new()).unwrap();
    let tree = RegionTree::build(&regions);
    let by_element = map_mutations(&mutations, &regions, &tree);
    (regions, by_element)
}

fn find<'a>(results: &'a [ElementResult], id: &str) -> &'a ElementResult {
    results.iter().find(|r| r.element_id == id).unwrap()
}

const HEADER: &str = "CHROMOSOME\tPOSITION\tREF\tALT\tSAMPLE\n";

#[test]
fn scenario_a_single_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let (regions, by_element) = load(
        dir.path(),
        "1\t100\t200\tGENE1\n",
        &format!("{}1\t150\tA\tG\tS1\n", HEADER),
    );
    let source = MemorySource::from_lines(&["1\t105\tA\tT\t2.0", "1\t150\tA\tG\t5.0"], 0, 1);
    let sources = Sources::new(Arc::new(source));

    let results = analyze(&config(1000), &sources, None, &regions, &by_element).unwrap();
    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert_eq!(r.element_id, "GENE1");
    assert_eq!(r.muts, 1);
    assert_eq!(r.samples_mut, 1);
    assert_eq!(r.scores, vec![5.0]);
    assert_eq!(r.sampling_size, 1000);
    assert_eq!(r.status, Some(SamplingStatus::Converged));
    assert!((r.pvalue - 0.5).abs() < 0.06, "pvalue {} should be near 0.5", r.pvalue);
    assert!(r.pvalue > 0.0 && r.pvalue <= 1.0);
}

#[test]
fn scenario_b_low_sample_elements_are_masked() {
    let dir = tempfile::tempdir().unwrap();
    let (regions, by_element) = load(
        dir.path(),
        "1\t100\t200\tLOW\n1\t300\t400\tHIGH\n1\t500\t600\tMID\n",
        &format!(
            "{}1\t150\tA\tG\tS1\n1\t350\tC\tT\tS1\n1\t350\tC\tT\tS2\n1\t351\tC\tT\tS3\n1\t550\tG\tA\tS1\n1\t551\tG\tA\tS2\n",
            HEADER
        ),
    );
    let source = MemorySource::from_lines(
        &[
            "1\t150\tA\tG\t5.0",
            "1\t160\tA\tT\t1.0",
            "1\t350\tC\tT\t4.0",
            "1\t351\tC\tT\t3.0",
            "1\t352\tC\tA\t0.5",
            "1\t550\tG\tA\t2.0",
            "1\t551\tG\tA\t2.5",
            "1\t552\tG\tC\t0.1",
        ],
        0,
        1,
    );
    let sources = Sources::new(Arc::new(source));
    let results = analyze(&config(500), &sources, None, &regions, &by_element).unwrap();

    let only_two: Vec<ElementResult> = results.iter().filter(|r| r.element_id != "MID").cloned().collect();
    let (corrected, _) = finalize(only_two, None, 2);
    assert!(find(&corrected, "LOW").qvalue.is_nan());
    assert!(find(&corrected, "HIGH").qvalue.is_nan(), "sole eligible element");

    let (corrected, groups) = finalize(results, None, 2);
    assert!(groups.is_empty());
    let low = find(&corrected, "LOW");
    assert_eq!(low.samples_mut, 1);
    assert!(low.qvalue.is_nan());
    assert!(!low.pvalue.is_nan());
    let high = find(&corrected, "HIGH");
    assert_eq!(high.samples_mut, 3);
    assert!(!high.qvalue.is_nan());
    assert!(high.qvalue >= high.pvalue);
    assert!(!find(&corrected, "MID").qvalue.is_nan());

    for w in corrected.windows(2) {
        assert!(w[0].pvalue <= w[1].pvalue, "sorted by p-value");
    }
}

#[test]
fn scenario_c_repeat_indel_is_not_scored() {
    let dir = tempfile::tempdir().unwrap();
    let (regions, by_element) = load(
        dir.path(),
        "1\t100\t200\tGENE1\n",
        &format!("{}1\t150\tA\tG\tS1\n1\t146\t-\tCA\tS2\n", HEADER),
    );
    // CACACACACA spans 141-150
    let chrom = format!("{}{}{}", "G".repeat(140), "CA".repeat(5), "G".repeat(150));
    let genome = MemoryGenome::new([("1", chrom.as_str())]);
    let source = MemorySource::from_lines(&["1\t105\tG\tT\t2.0", "1\t150\tA\tG\t5.0"], 0, 1);
    let mut sources = Sources::new(Arc::new(source));
    sources.genome = Some(Arc::new(genome));

    let mut config = config(200);
    config.statistic.indels.include = true;
    config.statistic.indels.method = IndelMethod::Pattern;
    config.statistic.indels.max_repeats = 3;

    let results = analyze(&config, &sources, None, &regions, &by_element).unwrap();
    let r = find(&results, "GENE1");
    assert_eq!(r.indels, 1);
    assert_eq!(r.snps, 1);
    assert_eq!(r.muts, 1, "the repeat indel is excluded from the scored mutations");
    assert_eq!(r.scores, vec![5.0]);
    assert_eq!(r.samples_mut, 1);
}

#[test]
fn written_results_reload_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (regions, by_element) = load(
        dir.path(),
        "CHROMOSOME\tSTART\tEND\tELEMENT\n1\t100\t200\tGENE1\n1\t300\t400\tGENE2\n",
        &format!("{}1\t150\tA\tG\tS1\n1\t150\tA\tG\tS2\n1\t305\tC\tT\tS1\n", HEADER),
    );
    let source = MemorySource::from_lines(
        &["1\t105\tA\tT\t2.0", "1\t150\tA\tG\t5.0", "1\t305\tC\tT\t1.0", "1\t306\tC\tA\t9.0"],
        0,
        1,
    );
    let sources = Sources::new(Arc::new(source));
    let results = analyze(&config(300), &sources, None, &regions, &by_element).unwrap();
    let (corrected, _) = finalize(results, None, 1);

    let paths = OutputPaths::new(&dir.path().join("out"), &dir.path().join("muts.tsv"));
    assert_eq!(write_results(&paths.results, &corrected, false).unwrap(), 2);
    let reloaded = read_results(&paths.results).unwrap();
    assert_eq!(reloaded.len(), corrected.len());
    for (a, b) in corrected.iter().zip(&reloaded) {
        assert_eq!(a.element_id, b.element_id);
        assert_eq!((a.muts, a.muts_recurrence, a.samples_mut), (b.muts, b.muts_recurrence, b.samples_mut));
        assert_eq!(a.pvalue.to_bits(), b.pvalue.to_bits());
        assert_eq!(a.qvalue.to_bits(), b.qvalue.to_bits());
        assert_eq!(a.pvalue_neg.to_bits(), b.pvalue_neg.to_bits());
        assert_eq!(a.qvalue_neg.to_bits(), b.qvalue_neg.to_bits());
    }
    assert_eq!(find(&reloaded, "GENE1").muts_recurrence, 1);
}

#[test]
fn second_chromosome_segment_is_not_scored_with_first_chromosome_scores() {
    let dir = tempfile::tempdir().unwrap();
    let (regions, by_element) = load(
        dir.path(),
        "1\t100\t200\tGENE1\n2\t100\t200\tGENE1\n",
        &format!("{}chr2\t150\tA\tG\tS1\n1\t150\tA\tG\tS2\n", HEADER),
    );
    assert_eq!(by_element["GENE1"].len(), 2);
    let source = MemorySource::from_lines(&["1\t105\tA\tT\t2.0", "1\t150\tA\tG\t5.0"], 0, 1);
    let sources = Sources::new(Arc::new(source));

    let results = analyze(&config(500), &sources, None, &regions, &by_element).unwrap();
    let r = find(&results, "GENE1");
    assert_eq!(r.snps, 2);
    assert_eq!(r.muts, 1, "only the chromosome 1 mutation is scored");
    assert_eq!(r.scores, vec![5.0]);
    assert_eq!(r.samples_mut, 1);
}

#[test]
fn non_finite_score_rows_never_yield_a_pvalue() {
    let dir = tempfile::tempdir().unwrap();
    let (regions, by_element) = load(
        dir.path(),
        "1\t100\t200\tGENE1\n",
        &format!("{}1\t150\tA\tG\tS1\n", HEADER),
    );
    let source = MemorySource::from_lines(&["1\t105\tA\tT\t2.0", "1\t150\tA\tG\tnan"], 0, 1);
    let sources = Sources::new(Arc::new(source));

    let results = analyze(&config(1000), &sources, None, &regions, &by_element).unwrap();
    let r = find(&results, "GENE1");
    assert_eq!(r.snps, 1);
    assert_eq!(r.muts, 0);
    assert!(r.pvalue.is_nan() && r.pvalue_neg.is_nan());
    assert_eq!(r.sampling_size, 0);
}
