use std::collections::BTreeMap;

use chrono::{Months, NaiveDate};
use serde::Serialize;
use tracing::{debug, info};

use super::error::{ProjectionError, Result};
use super::types::{PortfolioAllocation, ReturnStatistics};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingFrequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl SamplingFrequency {
    pub fn periods_per_year(self) -> usize {
        match self {
            SamplingFrequency::Daily => 252,
            SamplingFrequency::Weekly => 52,
            SamplingFrequency::Monthly => 12,
        }
    }

    /// Fewest prices accepted: one year of returns, and never fewer than two prices.
    pub fn minimum_observations(self) -> usize {
        (self.periods_per_year() + 1).max(2)
    }

    /// Guesses the sampling frequency from the median gap between dates.
    /// `None` when there are too few points or the spacing fits no frequency.
    pub fn infer(points: &[PricePoint]) -> Option<Self> {
        let mut gaps: Vec<i64> = points
            .windows(2)
            .map(|w| (w[1].date - w[0].date).num_days())
            .collect();
        if gaps.is_empty() {
            return None;
        }
        gaps.sort_unstable();
        match gaps[gaps.len() / 2] {
            1..=5 => Some(SamplingFrequency::Daily),
            6..=10 => Some(SamplingFrequency::Weekly),
            20..=40 => Some(SamplingFrequency::Monthly),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub price: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PriceSeries {
    pub identifier: String,
    pub frequency: SamplingFrequency,
    pub points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Observations within `years` of the last one (inclusive).
    pub fn trailing_years(&self, years: u32) -> PriceSeries {
        let cutoff = self
            .points
            .last()
            .and_then(|last| last.date.checked_sub_months(Months::new(years.saturating_mul(12))));
        let points = match cutoff {
            Some(cutoff) => self
                .points
                .iter()
                .copied()
                .filter(|p| p.date >= cutoff)
                .collect(),
            None => self.points.clone(),
        };
        PriceSeries {
            identifier: self.identifier.clone(),
            frequency: self.frequency,
            points,
        }
    }
}

/// Supplies historical prices to the estimator. Implementations resolve
/// human-entered identifiers themselves; a failed resolution is reported as
/// missing data.
pub trait PriceSeriesProvider {
    fn fetch_price_series(&self, identifier: &str, lookback_years: u32) -> Result<PriceSeries>;
}

impl PriceSeriesProvider for BTreeMap<String, PriceSeries> {
    fn fetch_price_series(&self, identifier: &str, lookback_years: u32) -> Result<PriceSeries> {
        self.get(identifier)
            .map(|series| series.trailing_years(lookback_years))
            .ok_or_else(|| ProjectionError::asset_unavailable(identifier, "no price series loaded"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStatistics {
    pub identifier: String,
    pub annual_mean: f64,
    pub annual_volatility: f64,
    pub observations: usize,
}

impl AssetStatistics {
    /// Figures supplied by the caller instead of estimated from prices.
    pub fn from_annual(identifier: impl Into<String>, annual_mean: f64, annual_volatility: f64) -> Self {
        Self {
            identifier: identifier.into(),
            annual_mean,
            annual_volatility,
            observations: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioEstimate {
    pub statistics: ReturnStatistics,
    pub assets: Vec<AssetStatistics>,
}

pub fn asset_statistics(series: &PriceSeries) -> Result<AssetStatistics> {
    let required = series.frequency.minimum_observations();
    if series.points.len() < required {
        return Err(ProjectionError::insufficient_data(
            &series.identifier,
            required,
            series.points.len(),
        ));
    }

    if let Some(bad) = series
        .points
        .iter()
        .find(|p| !p.price.is_finite() || p.price <= 0.0)
    {
        return Err(ProjectionError::asset_unavailable(
            &series.identifier,
            format!("non-positive price {} on {}", bad.price, bad.date),
        ));
    }

    let returns: Vec<f64> = series
        .points
        .windows(2)
        .map(|w| w[1].price / w[0].price - 1.0)
        .collect();

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let periods = series.frequency.periods_per_year() as f64;

    let stats = AssetStatistics {
        identifier: series.identifier.clone(),
        annual_mean: mean * periods,
        annual_volatility: variance.sqrt() * periods.sqrt(),
        observations: series.points.len(),
    };
    debug!(
        target: "holdco::stats",
        asset = %stats.identifier,
        observations = stats.observations,
        annual_mean = stats.annual_mean,
        annual_volatility = stats.annual_volatility,
        "estimated asset statistics"
    );
    Ok(stats)
}

/// Blends per-asset figures with the allocation weights. Every pair of assets
/// shares one `correlation`; 0 treats the assets as independent, so the
/// portfolio variance is the weight-squared sum of asset variances.
pub fn blend(
    allocation: &PortfolioAllocation,
    assets: &[AssetStatistics],
    correlation: f64,
) -> Result<ReturnStatistics> {
    if !correlation.is_finite() || !(0.0..=1.0).contains(&correlation) {
        return Err(ProjectionError::configuration(
            "correlation",
            "must be between 0 and 1",
        ));
    }

    let mut weighted = Vec::with_capacity(allocation.entries().len());
    for entry in allocation.entries() {
        let asset = assets
            .iter()
            .find(|a| a.identifier.eq_ignore_ascii_case(&entry.ticker_or_isin))
            .ok_or_else(|| {
                ProjectionError::asset_unavailable(&entry.ticker_or_isin, "no statistics estimated")
            })?;
        weighted.push((entry.weight, asset.annual_mean, asset.annual_volatility));
    }

    let annual_mean: f64 = weighted.iter().map(|(w, mean, _)| w * mean).sum();
    let mut variance = 0.0;
    for (i, (wi, _, vi)) in weighted.iter().enumerate() {
        for (j, (wj, _, vj)) in weighted.iter().enumerate() {
            let rho = if i == j { 1.0 } else { correlation };
            variance += rho * wi * wj * vi * vj;
        }
    }

    Ok(ReturnStatistics::from_annual(annual_mean, variance.sqrt()))
}

/// Fetches every allocated asset, estimates it and blends the result.
/// `overrides` short-circuits the fetch for assets whose figures are known.
pub fn estimate_portfolio<P: PriceSeriesProvider + ?Sized>(
    allocation: &PortfolioAllocation,
    provider: &P,
    lookback_years: u32,
    correlation: f64,
    overrides: &[AssetStatistics],
) -> Result<PortfolioEstimate> {
    let mut assets = Vec::with_capacity(allocation.entries().len());
    for entry in allocation.entries() {
        let id = &entry.ticker_or_isin;
        if let Some(known) = overrides
            .iter()
            .find(|o| o.identifier.eq_ignore_ascii_case(id))
        {
            assets.push(known.clone());
            continue;
        }
        let series = provider.fetch_price_series(id, lookback_years)?;
        let mut stats = asset_statistics(&series)?;
        stats.identifier = id.clone();
        assets.push(stats);
    }

    let statistics = blend(allocation, &assets, correlation)?;
    info!(
        target: "holdco::stats",
        assets = assets.len(),
        annual_mean = statistics.annual_mean,
        annual_volatility = statistics.annual_volatility,
        "portfolio statistics ready"
    );
    Ok(PortfolioEstimate { statistics, assets })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AllocationEntry;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn monthly_series(id: &str, prices: &[f64]) -> PriceSeries {
        let start = date(2015, 1, 31);
        PriceSeries {
            identifier: id.to_string(),
            frequency: SamplingFrequency::Monthly,
            points: prices
                .iter()
                .enumerate()
                .map(|(i, &price)| PricePoint {
                    date: start
                        .checked_add_months(Months::new(i as u32))
                        .expect("in range"),
                    price,
                })
                .collect(),
        }
    }

    fn alternating(id: &str, months: usize, up: f64, down: f64) -> PriceSeries {
        let mut prices = vec![100.0];
        for i in 0..months {
            let last = prices[prices.len() - 1];
            let r = if i % 2 == 0 { up } else { down };
            prices.push(last * (1.0 + r));
        }
        monthly_series(id, &prices)
    }

    #[test]
    fn rejects_series_shorter_than_one_year() {
        let series = monthly_series("SHORT", &[100.0; 12]);
        let err = asset_statistics(&series).expect_err("12 prices give only 11 returns");
        assert_eq!(err, ProjectionError::insufficient_data("SHORT", 13, 12));
    }

    #[test]
    fn rejects_single_point_series() {
        let series = monthly_series("ONE", &[100.0]);
        assert!(asset_statistics(&series).expect_err("too short").is_insufficient_data());
    }

    #[test]
    fn rejects_non_positive_prices() {
        let mut prices = vec![100.0; 13];
        prices[5] = 0.0;
        let err = asset_statistics(&monthly_series("ZERO", &prices)).expect_err("zero price");
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn constant_growth_has_zero_volatility() {
        let prices: Vec<f64> = (0..25).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let stats = asset_statistics(&monthly_series("GROW", &prices)).expect("enough data");
        assert!((stats.annual_mean - 0.12).abs() < 1e-9);
        assert!(stats.annual_volatility.abs() < 1e-9);
        assert_eq!(stats.observations, 25);
    }

    #[test]
    fn alternating_returns_annualize_mean_and_volatility() {
        let stats = asset_statistics(&alternating("ALT", 24, 0.03, -0.01)).expect("enough data");
        // mean 0.01/month, sample std of +-0.02 over 24 returns = 0.02 * sqrt(24/23)
        assert!((stats.annual_mean - 0.12).abs() < 1e-9);
        let expected_vol = 0.02 * (24.0f64 / 23.0).sqrt() * 12f64.sqrt();
        assert!((stats.annual_volatility - expected_vol).abs() < 1e-9);
    }

    #[test]
    fn blend_independent_assets_uses_weight_squared_variance() {
        let allocation = PortfolioAllocation::new(vec![
            AllocationEntry {
                ticker_or_isin: "A".to_string(),
                weight: 0.6,
            },
            AllocationEntry {
                ticker_or_isin: "B".to_string(),
                weight: 0.4,
            },
        ])
        .expect("valid weights");
        let assets = vec![
            AssetStatistics::from_annual("A", 0.08, 0.15),
            AssetStatistics::from_annual("B", 0.04, 0.05),
        ];

        let stats = blend(&allocation, &assets, 0.0).expect("blend");
        assert!((stats.annual_mean - 0.064).abs() < 1e-12);
        let expected = (0.36f64 * 0.0225 + 0.16 * 0.0025).sqrt();
        assert!((stats.annual_volatility - expected).abs() < 1e-12);

        let correlated = blend(&allocation, &assets, 1.0).expect("blend");
        assert!((correlated.annual_volatility - (0.6 * 0.15 + 0.4 * 0.05)).abs() < 1e-12);
    }

    #[test]
    fn blend_rejects_out_of_range_correlation() {
        let allocation = PortfolioAllocation::single("A");
        let assets = vec![AssetStatistics::from_annual("A", 0.08, 0.15)];
        assert!(blend(&allocation, &assets, -0.5).expect_err("negative").is_configuration());
    }

    #[test]
    fn estimate_portfolio_reports_unknown_asset_as_insufficient_data() {
        let provider: BTreeMap<String, PriceSeries> = BTreeMap::new();
        let err = estimate_portfolio(&PortfolioAllocation::single("MISSING"), &provider, 10, 0.0, &[])
            .expect_err("nothing loaded");
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn estimate_portfolio_prefers_overrides() {
        let provider: BTreeMap<String, PriceSeries> = BTreeMap::new();
        let overrides = vec![AssetStatistics::from_annual("TRIGON", 0.125, 0.15)];
        let estimate = estimate_portfolio(
            &PortfolioAllocation::single("TRIGON"),
            &provider,
            10,
            0.0,
            &overrides,
        )
        .expect("override used");
        assert!((estimate.statistics.annual_mean - 0.125).abs() < 1e-12);
        assert!((estimate.statistics.monthly_volatility - 0.15 / 12f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn estimate_portfolio_blends_fetched_series() {
        let mut provider = BTreeMap::new();
        provider.insert("ALT".to_string(), alternating("ALT", 24, 0.03, -0.01));
        let estimate =
            estimate_portfolio(&PortfolioAllocation::single("ALT"), &provider, 10, 0.0, &[])
                .expect("estimate");
        assert_eq!(estimate.assets.len(), 1);
        assert!((estimate.statistics.monthly_mean - 0.01).abs() < 1e-9);
    }

    fn spaced(days: &[u64]) -> Vec<PricePoint> {
        let start = date(2024, 1, 1);
        days.iter()
            .map(|&d| PricePoint {
                date: start.checked_add_days(chrono::Days::new(d)).expect("in range"),
                price: 100.0,
            })
            .collect()
    }

    #[test]
    fn infers_frequency_from_date_spacing() {
        // Trading days: weekday gaps of 1 with a weekend gap of 3.
        let daily = spaced(&[0, 1, 2, 3, 4, 7, 8, 9, 10, 11, 14]);
        assert_eq!(SamplingFrequency::infer(&daily), Some(SamplingFrequency::Daily));
        let weekly = spaced(&[0, 7, 14, 21, 28]);
        assert_eq!(SamplingFrequency::infer(&weekly), Some(SamplingFrequency::Weekly));
        let monthly = monthly_series("M", &[100.0; 13]).points;
        assert_eq!(SamplingFrequency::infer(&monthly), Some(SamplingFrequency::Monthly));
    }

    #[test]
    fn infer_gives_up_on_sparse_or_irregular_spacing() {
        assert_eq!(SamplingFrequency::infer(&spaced(&[0])), None);
        assert_eq!(SamplingFrequency::infer(&spaced(&[0, 365, 730])), None);
        assert_eq!(SamplingFrequency::infer(&spaced(&[0, 15, 30, 45])), None);
    }

    #[test]
    fn trailing_years_keeps_window_ending_at_last_point() {
        let series = monthly_series("X", &vec![100.0; 49]);
        let trimmed = series.trailing_years(2);
        assert_eq!(trimmed.points.len(), 25);
        assert_eq!(trimmed.points.last(), series.points.last());
    }
}
