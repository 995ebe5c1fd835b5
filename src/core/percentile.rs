use rayon::prelude::*;
use tracing::debug;

use super::error::{ProjectionError, Result};
use super::types::{MonthPoint, PathHistory, PercentileTrajectory, TrajectoryPoint};

/// Linear interpolation between order statistics of an ascending slice,
/// at rank `p / 100 * (n - 1)`.
pub fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let w = rank - lower as f64;
        sorted[lower] * (1.0 - w) + sorted[upper] * w
    }
}

pub fn percentile_label(p: f64) -> String {
    format!("p{p}")
}

/// One month's values across the ensemble, sorted, with their mean.
struct Column {
    sorted: Vec<f64>,
    mean: f64,
}

impl Column {
    fn new(mut values: Vec<f64>) -> Self {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        values.sort_by(|a, b| a.total_cmp(b));
        Self {
            sorted: values,
            mean,
        }
    }

    fn at(&self, p: f64) -> f64 {
        percentile_of_sorted(&self.sorted, p)
    }
}

struct MonthSummary {
    balances: Column,
    loans: Column,
    payouts: Column,
    invested: Column,
}

impl MonthSummary {
    fn point(&self, month: usize, p: Option<f64>) -> TrajectoryPoint {
        let value = |c: &Column| p.map_or(c.mean, |p| c.at(p));
        TrajectoryPoint {
            payout: value(&self.payouts),
            invested: value(&self.invested),
            ..TrajectoryPoint::new(month, value(&self.balances), value(&self.loans))
        }
    }
}

/// Ranks every month independently across the ensemble. Returns one
/// trajectory per requested percentile, ascending, plus the ensemble mean.
pub fn aggregate(
    histories: &[PathHistory],
    percentiles: &[f64],
) -> Result<(Vec<PercentileTrajectory>, Vec<TrajectoryPoint>)> {
    let Some(first) = histories.first() else {
        return Err(ProjectionError::configuration(
            "ensemble",
            "cannot aggregate an empty ensemble",
        ));
    };
    let months = first.len();
    if let Some(idx) = histories.iter().position(|h| h.len() != months) {
        return Err(ProjectionError::configuration(
            "ensemble",
            format!(
                "path {idx} has {} months, expected {months}",
                histories[idx].len()
            ),
        ));
    }

    let mut requested = percentiles.to_vec();
    requested.sort_by(|a, b| a.total_cmp(b));
    requested.dedup();

    let summaries: Vec<MonthSummary> = (0..months)
        .into_par_iter()
        .map(|month| summarize_month(histories, month))
        .collect();

    let trajectories = requested
        .iter()
        .map(|&p| PercentileTrajectory {
            percentile: p,
            label: percentile_label(p),
            points: summaries
                .iter()
                .enumerate()
                .map(|(month, s)| s.point(month, Some(p)))
                .collect(),
        })
        .collect();

    let mean = summaries
        .iter()
        .enumerate()
        .map(|(month, s)| s.point(month, None))
        .collect();

    debug!(
        target: "holdco::percentile",
        paths = histories.len(),
        months,
        percentiles = requested.len(),
        "aggregated ensemble"
    );
    Ok((trajectories, mean))
}

fn summarize_month(histories: &[PathHistory], month: usize) -> MonthSummary {
    let column = |field: fn(&MonthPoint) -> f64| {
        Column::new(histories.iter().map(|h| field(&h.points[month])).collect())
    };
    MonthSummary {
        balances: column(|p| p.balance),
        loans: column(|p| p.total_loans),
        payouts: column(|p| p.payout),
        invested: column(|p| p.invested),
    }
}
