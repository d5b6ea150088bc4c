//! Per-site adjustment of background probabilities.
//!
//! Two optional tracks are supported. A depth track gives one value per
//! position and multiplies the probability of every substitution there. A
//! mutability track gives one value per position (or per position and
//! alternate base) and replaces the signature probability. In a per-allele
//! track, a row without an alternate base (or with `.`) covers every base at
//! its position unless a row for the specific base exists. Sites absent from
//! a track get weight 0 so that unsequenced or unmutable sites are never drawn.

use std::collections::HashMap;

use log::{debug, warn};

use crate::config::SiteWeightConfig;
use crate::regions::{normalize_chrom, Element};
use crate::scores::RangeQuery;

#[derive(Debug, Clone, Default)]
pub struct SiteTrack {
    values: HashMap<(u64, Option<u8>), f64>,
    per_allele: bool,
}

impl SiteTrack {
    pub fn load(element: &Element, query: &mut dyn RangeQuery, config: &SiteWeightConfig) -> Self {
        let mut track = SiteTrack { per_allele: config.alt.is_some(), ..SiteTrack::default() };
        let mut undecodable = 0usize;
        for segment in &element.segments {
            let chrom = format!("{}{}", config.chr_prefix, normalize_chrom(&segment.chrom));
            let mut rows = Vec::new();
            if let Err(e) = query.query(&chrom, segment.start - 1, segment.stop, &mut rows) {
                warn!("{}: site weight query {}:{}-{} failed: {:#}", element.id, chrom, segment.start, segment.stop, e);
            }
            for row in rows {
                let pos = row.get(config.pos).and_then(|p| p.trim().parse::<u64>().ok());
                let value = row.get(config.value).and_then(|v| v.trim().parse::<f64>().ok());
                let alt = config
                    .alt
                    .and_then(|c| row.get(c))
                    .and_then(|a| a.trim().bytes().next())
                    .filter(|a| *a != b'.');
                match (pos, value) {
                    (Some(pos), Some(value)) if value.is_finite() && value >= 0.0 => {
                        track.values.insert((pos, alt.map(|a| a.to_ascii_uppercase())), value);
                    }
                    _ => undecodable += 1,
                }
            }
        }
        if undecodable > 0 {
            debug!("{}: {} undecodable site weight rows", element.id, undecodable);
        }
        track
    }

    pub fn weight(&self, pos: u64, alt: u8) -> f64 {
        let allele = if self.per_allele { self.values.get(&(pos, Some(alt.to_ascii_uppercase()))) } else { None };
        allele.or_else(|| self.values.get(&(pos, None))).copied().unwrap_or(0.0)
    }
}

/// Tracks in effect for one element.
#[derive(Debug, Clone, Default)]
pub struct SiteWeights {
    pub depth: Option<SiteTrack>,
    pub mutability: Option<SiteTrack>,
}

impl SiteWeights {
    /// Weight of substitution `alt` at `pos`, given its signature probability
    /// (`None` without a signature).
    pub fn adjust(&self, pos: u64, alt: u8, signature_prob: Option<f64>) -> Option<f64> {
        let base = match &self.mutability {
            Some(track) => Some(track.weight(pos, alt)),
            None => signature_prob,
        };
        match &self.depth {
            Some(track) => Some(base.unwrap_or(1.0) * track.weight(pos, alt)),
            None => base,
        }
    }

    pub fn is_active(&self) -> bool {
        self.depth.is_some() || self.mutability.is_some()
    }
}
