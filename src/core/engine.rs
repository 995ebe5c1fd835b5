use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use tracing::info;

use super::error::{ProjectionError, Result};
use super::percentile::aggregate;
use super::rules::{CashFlowRules, MonthFlows, MonthParams, PathState};
use super::stats::{AssetStatistics, PortfolioEstimate, PriceSeriesProvider, estimate_portfolio};
use super::types::{
    MonthPoint, PathHistory, PortfolioAllocation, ProjectionResult, ReturnStatistics,
    SimulationConfig, TracePoint,
};

/// Bounds on a single monthly draw. Keeps compounding finite however extreme
/// the tail sample.
pub const MIN_MONTHLY_RETURN: f64 = -0.95;
pub const MAX_MONTHLY_RETURN: f64 = 2.5;

/// Source of monthly returns for one path.
pub trait ReturnSampler {
    fn next_return(&mut self) -> f64;
}

pub struct NormalSampler<R> {
    rng: R,
    dist: Normal<f64>,
}

impl<R: Rng> NormalSampler<R> {
    pub fn new(rng: R, stats: &ReturnStatistics) -> Result<Self> {
        let dist = Normal::new(stats.monthly_mean, stats.monthly_volatility).map_err(|e| {
            ProjectionError::configuration("statistics", format!("invalid return distribution: {e}"))
        })?;
        Ok(Self { rng, dist })
    }
}

impl<R: Rng> ReturnSampler for NormalSampler<R> {
    fn next_return(&mut self) -> f64 {
        self.dist
            .sample(&mut self.rng)
            .clamp(MIN_MONTHLY_RETURN, MAX_MONTHLY_RETURN)
    }
}

/// Zero-variance sampler: the same return every month.
#[derive(Copy, Clone, Debug)]
pub struct FixedReturn(pub f64);

impl ReturnSampler for FixedReturn {
    fn next_return(&mut self) -> f64 {
        self.0
    }
}

pub fn path_seed(base_seed: u64, path_index: usize) -> u64 {
    base_seed.wrapping_add(path_index as u64)
}

/// Runs one path across the horizon. The history holds the opening state
/// followed by the state after each simulated month.
pub fn simulate_path<S: ReturnSampler>(
    config: &SimulationConfig,
    rules: &CashFlowRules,
    path_index: usize,
    sampler: &mut S,
    mut trace: Option<&mut Vec<TracePoint>>,
) -> Result<PathHistory> {
    let months = config.horizon_months();
    let mut points = Vec::with_capacity(months);
    let mut state = rules.initial_state(config);

    let opening = MonthFlows::default();
    points.push(snapshot(&state, &opening));
    if let Some(rows) = trace.as_deref_mut() {
        rows.push(trace_point(rules, 0, &state, &opening));
    }

    let mut monthly_withdrawal = 0.0;
    for month in 1..months {
        let (year, calendar_month) = config.horizon.calendar_month(month);
        // The payout is fixed per calendar year from the balance it opens with.
        if month == 1 || calendar_month == 1 {
            monthly_withdrawal = if config.withdrawals_active(year) {
                rules.withdrawal_budget(state.balance)
            } else {
                0.0
            };
        }
        let params = MonthParams {
            return_rate: sampler.next_return(),
            contributions_active: config.contributions_active(year),
            withdrawal: monthly_withdrawal,
        };
        let transition = rules.step(state, params);
        state = transition.state;
        check_finite(&state, path_index, month)?;

        points.push(snapshot(&state, &transition.flows));
        if let Some(rows) = trace.as_deref_mut() {
            rows.push(trace_point(rules, month, &state, &transition.flows));
        }
    }

    Ok(PathHistory { points })
}

fn snapshot(state: &PathState, flows: &MonthFlows) -> MonthPoint {
    MonthPoint {
        balance: state.balance,
        total_loans: state.total_loans(),
        payout: flows.payout,
        invested: state.invested,
    }
}

fn trace_point(
    rules: &CashFlowRules,
    month: usize,
    state: &PathState,
    flows: &MonthFlows,
) -> TracePoint {
    let total_loans = state.total_loans();
    TracePoint {
        month,
        balance: state.balance,
        total_loans,
        profit: state.balance - total_loans,
        mortgage_balance: state.mortgage_balance,
        rental_income: flows.rental_income,
        costs: flows.costs,
        payout: flows.payout,
        invested: state.invested,
        loans: rules
            .people()
            .iter()
            .cloned()
            .zip(state.loans.iter().copied())
            .collect::<BTreeMap<_, _>>(),
    }
}

fn check_finite(state: &PathState, path: usize, month: usize) -> Result<()> {
    let numerical = |field: &str, value: f64| ProjectionError::Numerical {
        path,
        month,
        field: field.to_string(),
        value,
    };

    if !state.balance.is_finite() {
        return Err(numerical("balance", state.balance));
    }
    if !state.mortgage_balance.is_finite() {
        return Err(numerical("mortgage_balance", state.mortgage_balance));
    }
    if let Some(loan) = state.loans.iter().find(|l| !l.is_finite()) {
        return Err(numerical("loans", *loan));
    }
    Ok(())
}

/// Simulates `num_paths` independent paths in parallel. Path `i` draws from
/// its own ChaCha stream seeded with `base_seed + i`; the first failing path
/// aborts the whole ensemble.
pub fn run_ensemble(
    config: &SimulationConfig,
    rules: &CashFlowRules,
    stats: &ReturnStatistics,
    base_seed: u64,
) -> Result<Vec<PathHistory>> {
    (0..config.num_paths as usize)
        .into_par_iter()
        .map(|path_index| {
            let rng = ChaCha20Rng::seed_from_u64(path_seed(base_seed, path_index));
            let mut sampler = NormalSampler::new(rng, stats)?;
            simulate_path(config, rules, path_index, &mut sampler, None)
        })
        .collect()
}

/// The average-return reference path, with its month-by-month trace.
pub fn run_deterministic(
    config: &SimulationConfig,
    rules: &CashFlowRules,
    stats: &ReturnStatistics,
) -> Result<(PathHistory, Vec<TracePoint>)> {
    let mut trace = Vec::with_capacity(config.horizon_months());
    let mut sampler = FixedReturn(stats.monthly_mean);
    let history = simulate_path(config, rules, 0, &mut sampler, Some(&mut trace))?;
    Ok((history, trace))
}

pub fn run_projection(config: &SimulationConfig, stats: &ReturnStatistics) -> Result<ProjectionResult> {
    config.validate()?;
    stats.validate()?;

    let base_seed = config.seed.unwrap_or_else(|| rand::rng().random());
    let rules = CashFlowRules::from_config(config);
    info!(
        target: "holdco::engine",
        paths = config.num_paths,
        months = config.horizon_months(),
        seed = base_seed,
        monthly_mean = stats.monthly_mean,
        monthly_volatility = stats.monthly_volatility,
        "starting projection"
    );

    let (_, deterministic) = run_deterministic(config, &rules, stats)?;
    let histories = run_ensemble(config, &rules, stats, base_seed)?;
    let (percentiles, mean) = aggregate(&histories, &config.percentiles)?;

    let result = ProjectionResult {
        seed: base_seed,
        num_paths: config.num_paths,
        horizon_months: config.horizon_months(),
        statistics: *stats,
        percentiles,
        mean,
        deterministic,
    };
    if let Some(last) = result.trajectory(50.0).and_then(|t| t.points.last()) {
        info!(
            target: "holdco::engine",
            final_median_balance = last.balance,
            final_median_profit = last.profit,
            "projection finished"
        );
    }
    Ok(result)
}

/// How portfolio statistics are estimated before a projection.
#[derive(Clone, Debug, PartialEq)]
pub struct EstimationOptions {
    pub lookback_years: u32,
    pub correlation: f64,
    pub overrides: Vec<AssetStatistics>,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            lookback_years: 10,
            correlation: 0.0,
            overrides: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PortfolioProjection {
    pub estimate: PortfolioEstimate,
    pub result: ProjectionResult,
}

/// Validates the configuration, estimates the portfolio from the provider,
/// then projects. Price data is fetched in full before any path runs.
pub fn project_portfolio<P: PriceSeriesProvider + ?Sized>(
    config: &SimulationConfig,
    allocation: &PortfolioAllocation,
    provider: &P,
    options: &EstimationOptions,
) -> Result<PortfolioProjection> {
    config.validate()?;
    let estimate = estimate_portfolio(
        allocation,
        provider,
        options.lookback_years,
        options.correlation,
        &options.overrides,
    )?;
    let result = run_projection(config, &estimate.statistics)?;
    Ok(PortfolioProjection { estimate, result })
}
