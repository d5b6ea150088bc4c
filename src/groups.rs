//! Gene-set grouping of element results.
//!
//! A group reuses the statistics already computed for its members; no new
//! sampling is done. The group null distribution is the mutation-weighted
//! average of the members' background means.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::correction::ElementResult;
use crate::io::get_reader;

/// Group name to member element ids.
pub type GeneGroups = BTreeMap<String, Vec<String>>;

/// Read a JSON document `{group: [element ids]}`.
pub fn load_groups(path: &Path) -> Result<GeneGroups> {
    let reader = get_reader(path)?;
    let groups: GeneGroups =
        serde_json::from_reader(reader).with_context(|| format!("Invalid grouping file: {:?}", path))?;
    info!("Loaded {} gene groups from {:?}", groups.len(), path);
    Ok(groups)
}

fn group_result(name: &str, members: &[&ElementResult]) -> Option<ElementResult> {
    let n = members.iter().map(|m| m.back_means.len()).min()?;
    let total_muts: usize = members.iter().map(|m| m.muts).sum();
    if n == 0 || total_muts == 0 {
        return None;
    }

    let scores: Vec<f64> = members.iter().flat_map(|m| m.scores.iter().copied()).collect();
    let observed = scores.iter().sum::<f64>() / scores.len() as f64;

    let null: Vec<f64> = (0..n)
        .map(|i| members.iter().map(|m| m.muts as f64 * m.back_means[i]).sum::<f64>() / total_muts as f64)
        .collect();
    let obs = null.iter().filter(|v| **v > observed).count();
    let neg_obs = null.iter().filter(|v| **v < observed).count();

    let mut genes: Vec<String> = members.iter().map(|m| m.element_id.clone()).collect();
    genes.sort();

    Some(ElementResult {
        element_id: name.to_string(),
        symbol: None,
        muts: total_muts,
        muts_recurrence: members.iter().map(|m| m.muts_recurrence).sum(),
        samples_mut: members.iter().map(|m| m.samples_mut).max().unwrap_or(0),
        snps: members.iter().map(|m| m.snps).sum(),
        mnps: members.iter().map(|m| m.mnps).sum(),
        indels: members.iter().map(|m| m.indels).sum(),
        pvalue: obs.max(1) as f64 / n as f64,
        qvalue: f64::NAN,
        pvalue_neg: neg_obs.max(1) as f64 / n as f64,
        qvalue_neg: f64::NAN,
        observed,
        scores,
        sampling_size: n as u64,
        status: None,
        back_means: null,
        genes_in_group: Some(genes),
    })
}

/// One result per group with at least one sampled member.
pub fn group_results(groups: &GeneGroups, results: &[ElementResult]) -> Vec<ElementResult> {
    let by_id: HashMap<&str, &ElementResult> = results
        .iter()
        .filter(|r| !r.is_group() && !r.pvalue.is_nan() && !r.back_means.is_empty())
        .map(|r| (r.element_id.as_str(), r))
        .collect();

    let mut out = Vec::new();
    for (name, ids) in groups {
        let members: Vec<&ElementResult> = ids.iter().filter_map(|id| by_id.get(id.as_str()).copied()).collect();
        match group_result(name, &members) {
            Some(r) => out.push(r),
            None => debug!("Group {} has no sampled members", name),
        }
    }
    out
}
