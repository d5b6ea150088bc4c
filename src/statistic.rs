//! Reduction of score vectors to a single statistic and comparison of an
//! observed value against simulated replicates.

use crate::config::StatisticMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    ArithmeticMean,
    /// `exp(mean(ln(x + 1))) - 1`, tolerant of zero scores
    GeometricMean,
    /// Max within a sample group, arithmetic mean across groups
    MaxMean,
}

impl From<StatisticMethod> for Statistic {
    fn from(method: StatisticMethod) -> Self {
        match method {
            StatisticMethod::Amean => Statistic::ArithmeticMean,
            StatisticMethod::Gmean => Statistic::GeometricMean,
            StatisticMethod::Maxmean => Statistic::MaxMean,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

impl Statistic {
    /// Statistic of a full score vector. NaN for an empty vector.
    pub fn reduce(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }
        match self {
            Statistic::ArithmeticMean | Statistic::MaxMean => mean(values),
            Statistic::GeometricMean => {
                let log_mean = values.iter().map(|x| (x + 1.0).ln()).sum::<f64>() / values.len() as f64;
                log_mean.exp() - 1.0
            }
        }
    }

    /// Collapse the scores of one sample to a single representative value.
    pub fn reduce_group(&self, values: &[f64]) -> f64 {
        match self {
            Statistic::MaxMean => values.iter().copied().fold(f64::NAN, f64::max),
            _ => self.reduce(values),
        }
    }

    /// Reduce every group of cells and then reduce the group values.
    pub fn reduce_grouped(&self, row: &[f64], groups: &[Vec<usize>]) -> f64 {
        let mut per_group = Vec::with_capacity(groups.len());
        let mut buffer = Vec::new();
        for group in groups {
            buffer.clear();
            buffer.extend(group.iter().map(|&i| row[i]));
            per_group.push(self.reduce_group(&buffer));
        }
        self.reduce(&per_group)
    }

    /// Count replicates whose statistic is `>=` and `<=` the observed one.
    /// A tie counts towards both.
    pub fn compare(&self, replicate_values: &[f64], observed: f64) -> (u64, u64) {
        replicate_values.iter().fold((0, 0), |(ge, le), &v| {
            (ge + (v >= observed) as u64, le + (v <= observed) as u64)
        })
    }
}
