mod engine;
mod error;
mod percentile;
mod rules;
mod stats;
mod types;

pub use engine::{
    EstimationOptions, FixedReturn, MAX_MONTHLY_RETURN, MIN_MONTHLY_RETURN, NormalSampler,
    PortfolioProjection, ReturnSampler, path_seed, project_portfolio, run_deterministic,
    run_ensemble, run_projection, simulate_path,
};
pub use error::{ProjectionError, Result};
pub use percentile::{aggregate, percentile_label, percentile_of_sorted};
pub use rules::{CashFlowRules, MonthFlows, MonthParams, PathState, Transition, amortize};
pub use stats::{
    AssetStatistics, PortfolioEstimate, PricePoint, PriceSeries, PriceSeriesProvider,
    SamplingFrequency, asset_statistics, blend, estimate_portfolio,
};
pub use types::{
    ALLOCATION_EPSILON, AllocationEntry, Contribution, ContributionKind, DEFAULT_NUM_PATHS,
    DEFAULT_PERCENTILES, Horizon, MAX_ENSEMBLE_POINTS, MAX_HORIZON_YEARS, MAX_NUM_PATHS,
    MONTHS_PER_YEAR, MonthPoint, PathHistory, PercentileTrajectory, PortfolioAllocation,
    ProjectionResult, RentalMode, RentalParams, ReturnStatistics, SimulationConfig, TracePoint,
    TrajectoryPoint, WithdrawalMode, WithdrawalParams,
};
