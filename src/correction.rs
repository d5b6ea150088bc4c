//! Per-element results and multiple-testing correction.
//!
//! Results are split in two tiers. Elements with enough mutated samples and a
//! defined p-value are corrected together with Benjamini-Hochberg; the rest
//! keep their p-value (if any) and get undefined q-values.

use std::cmp::Ordering;

use log::debug;

use crate::observed::ObservedStatistics;
use crate::sampling::{SamplingState, SamplingStatus};

/// One row of the result table: an element or a gene-set group.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementResult {
    pub element_id: String,
    pub symbol: Option<String>,
    pub muts: usize,
    pub muts_recurrence: usize,
    pub samples_mut: usize,
    pub snps: usize,
    pub mnps: usize,
    pub indels: usize,
    pub pvalue: f64,
    pub qvalue: f64,
    pub pvalue_neg: f64,
    pub qvalue_neg: f64,
    pub observed: f64,
    /// Observed scores, kept for gene-set grouping
    pub scores: Vec<f64>,
    pub sampling_size: u64,
    pub status: Option<SamplingStatus>,
    pub back_means: Vec<f64>,
    /// Member elements when the row is a gene-set group
    pub genes_in_group: Option<Vec<String>>,
}

impl ElementResult {
    /// Row for an element that was never sampled.
    pub fn unsampled(element_id: &str, stats: &ObservedStatistics) -> Self {
        Self {
            element_id: element_id.to_string(),
            symbol: None,
            muts: stats.muts,
            muts_recurrence: stats.muts_recurrence,
            samples_mut: stats.samples_mut,
            snps: stats.snps,
            mnps: stats.mnps,
            indels: stats.indels,
            pvalue: f64::NAN,
            qvalue: f64::NAN,
            pvalue_neg: f64::NAN,
            qvalue_neg: f64::NAN,
            observed: f64::NAN,
            scores: stats.scores.clone(),
            sampling_size: 0,
            status: None,
            back_means: Vec::new(),
            genes_in_group: None,
        }
    }

    pub fn sampled(element_id: &str, stats: &ObservedStatistics, observed: f64, state: SamplingState) -> Self {
        let (pvalue, pvalue_neg) = state.pvalues();
        Self {
            pvalue,
            pvalue_neg,
            observed,
            sampling_size: state.sampling_size(),
            status: Some(state.status),
            back_means: state.counts.back_means,
            ..Self::unsampled(element_id, stats)
        }
    }

    pub fn is_group(&self) -> bool {
        self.genes_in_group.is_some()
    }
}

/// Benjamini-Hochberg adjusted p-values, in input order.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let n = p_values.len();
    if n == 0 {
        return Vec::new();
    }

    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let n_f = n as f64;
    let mut adjusted = vec![0.0; n];

    // Right to left so adjusted values stay monotone in rank
    let mut prev = f64::INFINITY;
    for i in (0..n).rev() {
        let rank = (i + 1) as f64;
        let adj = (p_values[indices[i]] * n_f / rank).min(1.0).min(prev);
        adjusted[indices[i]] = adj;
        prev = adj;
    }
    adjusted
}

fn cmp_pvalue(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.total_cmp(&b),
    }
}

/// Ascending p-value, undefined p-values last, ties by id.
pub fn sort_by_pvalue(results: &mut [ElementResult]) {
    results.sort_by(|a, b| cmp_pvalue(a.pvalue, b.pvalue).then_with(|| a.element_id.cmp(&b.element_id)));
}

/// Fill q-values and return every result sorted by p-value.
pub fn correct(results: Vec<ElementResult>, min_samples_for_significance: usize) -> Vec<ElementResult> {
    let (mut eligible, mut masked): (Vec<_>, Vec<_>) = results
        .into_iter()
        .partition(|r| r.samples_mut >= min_samples_for_significance && !r.pvalue.is_nan());
    debug!("Correcting {} eligible results, {} masked", eligible.len(), masked.len());

    if eligible.len() >= 2 {
        let p: Vec<f64> = eligible.iter().map(|r| r.pvalue).collect();
        let p_neg: Vec<f64> = eligible.iter().map(|r| r.pvalue_neg).collect();
        let q = benjamini_hochberg(&p);
        let q_neg = benjamini_hochberg(&p_neg);
        for ((r, q), q_neg) in eligible.iter_mut().zip(q).zip(q_neg) {
            r.qvalue = q;
            r.qvalue_neg = q_neg;
        }
    } else {
        for r in &mut eligible {
            r.qvalue = f64::NAN;
            r.qvalue_neg = f64::NAN;
        }
    }
    for r in &mut masked {
        r.qvalue = f64::NAN;
        r.qvalue_neg = f64::NAN;
    }

    eligible.append(&mut masked);
    sort_by_pvalue(&mut eligible);
    eligible
}
