use std::collections::{BTreeMap, BTreeSet};

use chrono::{Months, NaiveDate};
use serde::Serialize;

use super::error::{ProjectionError, Result};

pub const DEFAULT_NUM_PATHS: u32 = 10_000;
pub const DEFAULT_PERCENTILES: [f64; 5] = [2.0, 10.0, 50.0, 90.0, 98.0];
pub const ALLOCATION_EPSILON: f64 = 1e-6;
pub const MONTHS_PER_YEAR: u32 = 12;
pub const MAX_HORIZON_YEARS: i64 = 100;
pub const MAX_NUM_PATHS: u32 = 100_000;
/// Upper bound on `num_paths * horizon_months` kept in memory for aggregation.
pub const MAX_ENSEMBLE_POINTS: usize = 25_000_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContributionKind {
    /// Paid in as capital; no loan is tracked.
    Equity,
    /// The person lends the amount to the company; their loan balance grows.
    ShareholderLoan,
    /// The person pays down what they owe; their loan balance shrinks, floored at 0.
    LoanRepayment,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Contribution {
    pub person: String,
    pub monthly_amount: f64,
    pub kind: ContributionKind,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RentalMode {
    /// Rent and mortgage are settled privately, outside the company.
    PersonalPay,
    /// The rent services the mortgage; once it is repaid the rent flows to the company.
    CompanyRepay,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RentalParams {
    pub mortgage_balance: f64,
    pub monthly_payment: f64,
    pub monthly_income: f64,
    pub annual_rate: f64,
    pub mode: RentalMode,
}

impl RentalParams {
    pub fn monthly_rate(&self) -> f64 {
        self.annual_rate / MONTHS_PER_YEAR as f64
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WithdrawalMode {
    /// Payouts repay shareholder loans, split in proportion to what each person is owed.
    LoanRepayment,
    /// Payouts leave the loans untouched.
    Dividend,
}

/// Yearly payout plan. From `start_year` on, each calendar year's budget is
/// `annual_rate` of the balance when that year opens, paid out in twelve equal parts.
#[derive(Clone, Debug, PartialEq)]
pub struct WithdrawalParams {
    pub annual_rate: f64,
    pub start_year: i32,
    pub mode: WithdrawalMode,
}

impl WithdrawalParams {
    pub fn monthly_budget(&self, opening_balance: f64) -> f64 {
        opening_balance.max(0.0) * self.annual_rate / MONTHS_PER_YEAR as f64
    }
}

/// Calendar span of a projection. The first year may start mid-year; the
/// projection always runs through December of `end_year`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Horizon {
    pub start_year: i32,
    pub start_month: u32,
    pub end_year: i32,
}

impl Horizon {
    pub fn new(start_year: i32, end_year: i32) -> Self {
        Self {
            start_year,
            start_month: 1,
            end_year,
        }
    }

    /// Calendar months simulated, from `start_month` of the first year
    /// through December of the last.
    pub fn simulated_months(&self) -> usize {
        let years = (i64::from(self.end_year) - i64::from(self.start_year) + 1).max(0);
        let months = years * i64::from(MONTHS_PER_YEAR) - (i64::from(self.start_month) - 1);
        usize::try_from(months.max(0)).unwrap_or(usize::MAX)
    }

    /// Calendar years covered, counting a partial first year.
    pub fn span_years(&self) -> i64 {
        i64::from(self.end_year) - i64::from(self.start_year) + 1
    }

    /// Number of monthly snapshots: the opening snapshot plus one per simulated month.
    pub fn months(&self) -> usize {
        self.simulated_months().saturating_add(1)
    }

    /// Calendar (year, month) in which transition `step` (1-based) takes place.
    pub fn calendar_month(&self, step: usize) -> (i32, u32) {
        let offset = self.start_month as usize - 1 + step.saturating_sub(1);
        let year = self.start_year + (offset / MONTHS_PER_YEAR as usize) as i32;
        let month = (offset % MONTHS_PER_YEAR as usize) as u32 + 1;
        (year, month)
    }

    /// Date a snapshot describes: the first day of the month following the
    /// last simulated month, so snapshot 0 is the first day of `start_month`.
    pub fn snapshot_date(&self, snapshot: usize) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.start_year, self.start_month, 1)?
            .checked_add_months(Months::new(u32::try_from(snapshot).ok()?))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    pub starting_capital: f64,
    pub contributions: Vec<Contribution>,
    pub starting_loans: BTreeMap<String, f64>,
    pub horizon: Horizon,
    pub rental: Option<RentalParams>,
    pub annual_costs: f64,
    pub contribution_end_year: Option<i32>,
    pub withdrawal: Option<WithdrawalParams>,
    pub num_paths: u32,
    pub percentiles: Vec<f64>,
    pub seed: Option<u64>,
}

impl SimulationConfig {
    pub fn new(starting_capital: f64, horizon: Horizon) -> Self {
        Self {
            starting_capital,
            contributions: Vec::new(),
            starting_loans: BTreeMap::new(),
            horizon,
            rental: None,
            annual_costs: 0.0,
            contribution_end_year: None,
            withdrawal: None,
            num_paths: DEFAULT_NUM_PATHS,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            seed: None,
        }
    }

    pub fn horizon_months(&self) -> usize {
        self.horizon.months()
    }

    /// Everyone who holds a loan or contributes, in a stable order.
    pub fn people(&self) -> Vec<String> {
        let mut names: BTreeSet<&str> = self.starting_loans.keys().map(String::as_str).collect();
        names.extend(self.contributions.iter().map(|c| c.person.as_str()));
        names.into_iter().map(str::to_string).collect()
    }

    pub fn contributions_active(&self, year: i32) -> bool {
        self.contribution_end_year.is_none_or(|end| year < end)
    }

    pub fn withdrawals_active(&self, year: i32) -> bool {
        self.withdrawal.as_ref().is_some_and(|w| year >= w.start_year)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.starting_capital.is_finite() {
            return Err(ProjectionError::configuration(
                "starting_capital",
                "must be a finite amount",
            ));
        }

        for contribution in &self.contributions {
            if contribution.person.trim().is_empty() {
                return Err(ProjectionError::configuration(
                    "contributions",
                    "every contribution needs a person",
                ));
            }
            if !contribution.monthly_amount.is_finite() || contribution.monthly_amount < 0.0 {
                return Err(ProjectionError::configuration(
                    format!("contributions.{}", contribution.person),
                    "monthly amount must be >= 0",
                ));
            }
        }

        for (person, loan) in &self.starting_loans {
            if !loan.is_finite() || *loan < 0.0 {
                return Err(ProjectionError::configuration(
                    format!("starting_loans.{person}"),
                    "loan balance must be >= 0",
                ));
            }
        }

        if !(1..=MONTHS_PER_YEAR).contains(&self.horizon.start_month) {
            return Err(ProjectionError::configuration(
                "horizon.start_month",
                "must be between 1 and 12",
            ));
        }

        if self.horizon.end_year < self.horizon.start_year {
            return Err(ProjectionError::configuration(
                "horizon",
                format!(
                    "end year {} is before start year {}",
                    self.horizon.end_year, self.horizon.start_year
                ),
            ));
        }

        if self.horizon.span_years() > MAX_HORIZON_YEARS {
            return Err(ProjectionError::configuration(
                "horizon",
                format!(
                    "spans {} years, at most {MAX_HORIZON_YEARS} are supported",
                    self.horizon.span_years()
                ),
            ));
        }

        if let Some(rental) = &self.rental {
            validate_rental(rental)?;
        }

        if !self.annual_costs.is_finite() || self.annual_costs < 0.0 {
            return Err(ProjectionError::configuration(
                "annual_costs",
                "must be >= 0",
            ));
        }

        if let Some(withdrawal) = &self.withdrawal {
            if !withdrawal.annual_rate.is_finite() || !(0.0..=1.0).contains(&withdrawal.annual_rate) {
                return Err(ProjectionError::configuration(
                    "withdrawal.annual_rate",
                    "must be a fraction in 0..=1",
                ));
            }
        }

        if self.num_paths == 0 {
            return Err(ProjectionError::configuration("num_paths", "must be > 0"));
        }

        if self.num_paths > MAX_NUM_PATHS {
            return Err(ProjectionError::configuration(
                "num_paths",
                format!("must be at most {MAX_NUM_PATHS}"),
            ));
        }

        let points = (self.num_paths as usize).saturating_mul(self.horizon_months());
        if points > MAX_ENSEMBLE_POINTS {
            return Err(ProjectionError::configuration(
                "num_paths",
                format!(
                    "{} paths over {} months exceed {MAX_ENSEMBLE_POINTS} stored points",
                    self.num_paths,
                    self.horizon_months()
                ),
            ));
        }

        if self.percentiles.is_empty() {
            return Err(ProjectionError::configuration(
                "percentiles",
                "at least one percentile is required",
            ));
        }

        for p in &self.percentiles {
            if !p.is_finite() || !(0.0..=100.0).contains(p) {
                return Err(ProjectionError::configuration(
                    "percentiles",
                    format!("{p} is outside 0..=100"),
                ));
            }
        }

        Ok(())
    }
}

fn validate_rental(rental: &RentalParams) -> Result<()> {
    for (field, value) in [
        ("rental.mortgage_balance", rental.mortgage_balance),
        ("rental.monthly_payment", rental.monthly_payment),
        ("rental.monthly_income", rental.monthly_income),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(ProjectionError::configuration(field, "must be >= 0"));
        }
    }

    if !rental.annual_rate.is_finite() || !(0.0..1.0).contains(&rental.annual_rate) {
        return Err(ProjectionError::configuration(
            "rental.annual_rate",
            "must be a fraction in 0..1",
        ));
    }

    if rental.mode == RentalMode::CompanyRepay
        && rental.mortgage_balance > 0.0
        && rental.monthly_payment <= 0.0
    {
        return Err(ProjectionError::configuration(
            "rental.monthly_payment",
            "must be > 0 while a mortgage is outstanding in company-repay mode",
        ));
    }

    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationEntry {
    pub ticker_or_isin: String,
    pub weight: f64,
}

/// Portfolio weights, checked on construction. Weights are never renormalized.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortfolioAllocation {
    entries: Vec<AllocationEntry>,
}

impl PortfolioAllocation {
    pub fn new(entries: Vec<AllocationEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(ProjectionError::configuration(
                "allocation",
                "at least one asset is required",
            ));
        }

        let mut seen = BTreeSet::new();
        for entry in &entries {
            let id = entry.ticker_or_isin.trim();
            if id.is_empty() {
                return Err(ProjectionError::configuration(
                    "allocation",
                    "asset identifier must not be empty",
                ));
            }
            if !seen.insert(id.to_uppercase()) {
                return Err(ProjectionError::configuration(
                    "allocation",
                    format!("{id} is listed more than once"),
                ));
            }
            if !entry.weight.is_finite() || entry.weight <= 0.0 {
                return Err(ProjectionError::configuration(
                    format!("allocation.{id}"),
                    "weight must be > 0",
                ));
            }
        }

        let total: f64 = entries.iter().map(|e| e.weight).sum();
        if (total - 1.0).abs() > ALLOCATION_EPSILON {
            return Err(ProjectionError::configuration(
                "allocation",
                format!("weights sum to {total}, expected 1.0"),
            ));
        }

        Ok(Self { entries })
    }

    pub fn single(ticker_or_isin: impl Into<String>) -> Self {
        Self {
            entries: vec![AllocationEntry {
                ticker_or_isin: ticker_or_isin.into(),
                weight: 1.0,
            }],
        }
    }

    pub fn entries(&self) -> &[AllocationEntry] {
        &self.entries
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnStatistics {
    pub annual_mean: f64,
    pub annual_volatility: f64,
    pub monthly_mean: f64,
    pub monthly_volatility: f64,
}

impl ReturnStatistics {
    /// Arithmetic convention: mean / 12, volatility / sqrt(12).
    pub fn from_annual(annual_mean: f64, annual_volatility: f64) -> Self {
        let months = MONTHS_PER_YEAR as f64;
        Self {
            annual_mean,
            annual_volatility,
            monthly_mean: annual_mean / months,
            monthly_volatility: annual_volatility / months.sqrt(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.monthly_mean.is_finite() {
            return Err(ProjectionError::configuration(
                "statistics.monthly_mean",
                "must be finite",
            ));
        }
        if !self.monthly_volatility.is_finite() || self.monthly_volatility < 0.0 {
            return Err(ProjectionError::configuration(
                "statistics.monthly_volatility",
                "must be finite and >= 0",
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MonthPoint {
    pub balance: f64,
    pub total_loans: f64,
    /// Paid out during the month.
    pub payout: f64,
    /// Starting capital plus every contribution so far.
    pub invested: f64,
}

/// One completed path: a `MonthPoint` per horizon snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct PathHistory {
    pub points: Vec<MonthPoint>,
}

impl PathHistory {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryPoint {
    pub month: usize,
    pub balance: f64,
    pub total_loans: f64,
    pub profit: f64,
    pub payout: f64,
    pub invested: f64,
}

impl TrajectoryPoint {
    pub fn new(month: usize, balance: f64, total_loans: f64) -> Self {
        Self {
            month,
            balance,
            total_loans,
            profit: balance - total_loans,
            payout: 0.0,
            invested: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileTrajectory {
    pub percentile: f64,
    pub label: String,
    pub points: Vec<TrajectoryPoint>,
}

/// Detailed month of the deterministic path.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracePoint {
    pub month: usize,
    pub balance: f64,
    pub total_loans: f64,
    pub profit: f64,
    pub mortgage_balance: f64,
    pub rental_income: f64,
    pub costs: f64,
    pub payout: f64,
    pub invested: f64,
    pub loans: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionResult {
    pub seed: u64,
    pub num_paths: u32,
    pub horizon_months: usize,
    pub statistics: ReturnStatistics,
    pub percentiles: Vec<PercentileTrajectory>,
    pub mean: Vec<TrajectoryPoint>,
    pub deterministic: Vec<TracePoint>,
}

impl ProjectionResult {
    pub fn trajectory(&self, percentile: f64) -> Option<&PercentileTrajectory> {
        self.percentiles
            .iter()
            .find(|t| (t.percentile - percentile).abs() < 1e-9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> SimulationConfig {
        let mut config = SimulationConfig::new(50_000.0, Horizon::new(2026, 2030));
        config.contributions.push(Contribution {
            person: "Adult1".to_string(),
            monthly_amount: 500.0,
            kind: ContributionKind::ShareholderLoan,
        });
        config.starting_loans.insert("Adult2".to_string(), 1_000.0);
        config
    }

    #[test]
    fn full_years_have_one_snapshot_per_month_plus_opening() {
        let horizon = Horizon::new(2026, 2040);
        assert_eq!(horizon.simulated_months(), 180);
        assert_eq!(horizon.months(), 181);
    }

    #[test]
    fn partial_first_year_drops_elapsed_months() {
        let horizon = Horizon {
            start_year: 2026,
            start_month: 4,
            end_year: 2026,
        };
        assert_eq!(horizon.simulated_months(), 9);
        assert_eq!(horizon.calendar_month(1), (2026, 4));
        assert_eq!(horizon.calendar_month(9), (2026, 12));
    }

    #[test]
    fn calendar_month_rolls_into_next_year() {
        let horizon = Horizon {
            start_year: 2026,
            start_month: 11,
            end_year: 2027,
        };
        assert_eq!(horizon.calendar_month(2), (2026, 12));
        assert_eq!(horizon.calendar_month(3), (2027, 1));
    }

    #[test]
    fn snapshot_dates_start_on_first_of_start_month() {
        let horizon = Horizon {
            start_year: 2026,
            start_month: 4,
            end_year: 2026,
        };
        assert_eq!(horizon.snapshot_date(0), NaiveDate::from_ymd_opt(2026, 4, 1));
        assert_eq!(horizon.snapshot_date(9), NaiveDate::from_ymd_opt(2027, 1, 1));
    }

    #[test]
    fn people_merges_loans_and_contributors() {
        assert_eq!(sample_config().people(), vec!["Adult1", "Adult2"]);
    }

    #[test]
    fn validate_accepts_sample_config() {
        sample_config().validate().expect("valid config");
    }

    #[test]
    fn validate_rejects_inverted_horizon() {
        let mut config = sample_config();
        config.horizon = Horizon::new(2030, 2029);
        let err = config.validate().expect_err("must reject");
        assert!(matches!(err, ProjectionError::Configuration { ref field, .. } if field == "horizon"));
    }

    #[test]
    fn validate_rejects_zero_paths_and_bad_percentiles() {
        let mut config = sample_config();
        config.num_paths = 0;
        assert!(config.validate().expect_err("zero paths").is_configuration());

        let mut config = sample_config();
        config.percentiles = vec![50.0, 101.0];
        assert!(config.validate().expect_err("bad percentile").is_configuration());
    }

    #[test]
    fn validate_requires_payment_for_company_repay_mortgage() {
        let mut config = sample_config();
        config.rental = Some(RentalParams {
            mortgage_balance: 100_000.0,
            monthly_payment: 0.0,
            monthly_income: 1_000.0,
            annual_rate: 0.04,
            mode: RentalMode::CompanyRepay,
        });
        let err = config.validate().expect_err("must reject");
        assert!(err.to_string().contains("rental.monthly_payment"));
    }

    #[test]
    fn extreme_year_span_is_rejected_without_overflow() {
        let config = SimulationConfig::new(1_000.0, Horizon::new(i32::MIN, i32::MAX));
        assert!(config.horizon.simulated_months() > 0);
        let err = config.validate().expect_err("span far above the maximum");
        assert!(matches!(err, ProjectionError::Configuration { ref field, .. } if field == "horizon"));

        let mut config = sample_config();
        config.horizon = Horizon::new(0, 1_000_000);
        assert!(config.validate().expect_err("million years").is_configuration());

        config.horizon = Horizon::new(2026, 2026 + MAX_HORIZON_YEARS as i32 - 1);
        config.num_paths = 10;
        config.validate().expect("longest supported span");
    }

    #[test]
    fn path_count_is_capped() {
        let mut config = sample_config();
        config.num_paths = MAX_NUM_PATHS + 1;
        let err = config.validate().expect_err("too many paths");
        assert!(err.to_string().contains("num_paths"));

        config.num_paths = MAX_NUM_PATHS;
        config.horizon = Horizon::new(2026, 2100);
        assert!(config.validate().expect_err("too many stored points").is_configuration());
    }

    #[test]
    fn withdrawal_rate_must_be_a_fraction() {
        let mut config = sample_config();
        config.withdrawal = Some(WithdrawalParams {
            annual_rate: 1.5,
            start_year: 2028,
            mode: WithdrawalMode::Dividend,
        });
        assert!(config.validate().expect_err("150%").is_configuration());
    }

    #[test]
    fn withdrawals_start_in_start_year() {
        let mut config = sample_config();
        assert!(!config.withdrawals_active(2100));
        config.withdrawal = Some(WithdrawalParams {
            annual_rate: 0.04,
            start_year: 2028,
            mode: WithdrawalMode::LoanRepayment,
        });
        assert!(!config.withdrawals_active(2027));
        assert!(config.withdrawals_active(2028));
    }

    #[test]
    fn monthly_budget_ignores_negative_balance() {
        let plan = WithdrawalParams {
            annual_rate: 0.06,
            start_year: 2026,
            mode: WithdrawalMode::Dividend,
        };
        assert!((plan.monthly_budget(120_000.0) - 600.0).abs() < 1e-9);
        assert_eq!(plan.monthly_budget(-5_000.0), 0.0);
    }

    #[test]
    fn contributions_stop_in_end_year() {
        let mut config = sample_config();
        assert!(config.contributions_active(2100));
        config.contribution_end_year = Some(2028);
        assert!(config.contributions_active(2027));
        assert!(!config.contributions_active(2028));
    }

    #[test]
    fn allocation_rejects_weights_not_summing_to_one() {
        let err = PortfolioAllocation::new(vec![
            AllocationEntry {
                ticker_or_isin: "IE00BK5BQT80".to_string(),
                weight: 0.5,
            },
            AllocationEntry {
                ticker_or_isin: "IE00B4L5Y983".to_string(),
                weight: 0.3,
            },
        ])
        .expect_err("0.5 + 0.3 must be rejected");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("0.8"));
    }

    #[test]
    fn allocation_rejects_duplicates() {
        let entry = AllocationEntry {
            ticker_or_isin: "VWCE.DE".to_string(),
            weight: 0.5,
        };
        let err = PortfolioAllocation::new(vec![entry.clone(), entry]).expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn allocation_accepts_weights_within_epsilon() {
        let allocation = PortfolioAllocation::new(vec![
            AllocationEntry {
                ticker_or_isin: "A".to_string(),
                weight: 0.6,
            },
            AllocationEntry {
                ticker_or_isin: "B".to_string(),
                weight: 0.4 + 1e-9,
            },
        ])
        .expect("within epsilon");
        assert_eq!(allocation.entries().len(), 2);
    }

    #[test]
    fn monthly_statistics_use_arithmetic_convention() {
        let stats = ReturnStatistics::from_annual(0.12, 0.12 * 12f64.sqrt());
        assert!((stats.monthly_mean - 0.01).abs() < 1e-12);
        assert!((stats.monthly_volatility - 0.12).abs() < 1e-12);
    }

    #[test]
    fn trajectory_point_profit_is_balance_minus_loans() {
        let point = TrajectoryPoint::new(3, 1_500.0, 2_000.0);
        assert_eq!(point.profit, -500.0);
    }
}
