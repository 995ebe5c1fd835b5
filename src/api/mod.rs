mod prices;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{
    AllocationEntry, AssetStatistics, Contribution, ContributionKind, DEFAULT_NUM_PATHS,
    DEFAULT_PERCENTILES, EstimationOptions, Horizon, PercentileTrajectory, PortfolioAllocation,
    PriceSeries, PriceSeriesProvider, ProjectionError, ProjectionResult, RentalMode, RentalParams,
    Result, ReturnStatistics, SamplingFrequency, SimulationConfig, TracePoint, TrajectoryPoint,
    WithdrawalMode, WithdrawalParams, estimate_portfolio, project_portfolio, run_projection,
};

pub use prices::{CsvPriceDirectory, known_asset_statistics, read_price_csv, ticker_for_isin};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl From<CliFrequency> for SamplingFrequency {
    fn from(value: CliFrequency) -> Self {
        match value {
            CliFrequency::Daily => SamplingFrequency::Daily,
            CliFrequency::Weekly => SamplingFrequency::Weekly,
            CliFrequency::Monthly => SamplingFrequency::Monthly,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiFrequency {
    #[serde(alias = "day", alias = "1d")]
    Daily,
    #[serde(alias = "week", alias = "1wk")]
    Weekly,
    #[serde(alias = "month", alias = "1mo")]
    Monthly,
}

impl From<ApiFrequency> for SamplingFrequency {
    fn from(value: ApiFrequency) -> Self {
        match value {
            ApiFrequency::Daily => SamplingFrequency::Daily,
            ApiFrequency::Weekly => SamplingFrequency::Weekly,
            ApiFrequency::Monthly => SamplingFrequency::Monthly,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiContributionKind {
    Equity,
    #[serde(alias = "shareholderLoan", alias = "shareholder_loan", alias = "loan")]
    ShareholderLoan,
    #[serde(alias = "loanRepayment", alias = "loan_repayment", alias = "repayment")]
    LoanRepayment,
}

impl From<ApiContributionKind> for ContributionKind {
    fn from(value: ApiContributionKind) -> Self {
        match value {
            ApiContributionKind::Equity => ContributionKind::Equity,
            ApiContributionKind::ShareholderLoan => ContributionKind::ShareholderLoan,
            ApiContributionKind::LoanRepayment => ContributionKind::LoanRepayment,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiRentalMode {
    #[serde(alias = "personalPay", alias = "personal_pay", alias = "personal")]
    PersonalPay,
    #[serde(alias = "companyRepay", alias = "company_repay", alias = "company")]
    CompanyRepay,
}

impl From<ApiRentalMode> for RentalMode {
    fn from(value: ApiRentalMode) -> Self {
        match value {
            ApiRentalMode::PersonalPay => RentalMode::PersonalPay,
            ApiRentalMode::CompanyRepay => RentalMode::CompanyRepay,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiWithdrawalMode {
    #[serde(alias = "loan", alias = "loanRepayment", alias = "loan_repayment")]
    LoanRepayment,
    #[serde(alias = "dividends")]
    Dividend,
}

impl From<ApiWithdrawalMode> for WithdrawalMode {
    fn from(value: ApiWithdrawalMode) -> Self {
        match value {
            ApiWithdrawalMode::LoanRepayment => WithdrawalMode::LoanRepayment,
            ApiWithdrawalMode::Dividend => WithdrawalMode::Dividend,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "holdco",
    about = "Monte Carlo projection of a holding company's balance and shareholder loans"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a projection from a JSON request file
    Project(ProjectArgs),
    /// Estimate portfolio return statistics from local price files
    Stats(StatsArgs),
}

#[derive(Debug, Args)]
struct ProjectArgs {
    #[arg(long, help = "Path to the JSON projection request")]
    request: PathBuf,
    #[arg(long, help = "Directory of <ISIN or ticker>.csv price files")]
    prices_dir: Option<PathBuf>,
    #[arg(long, help = "Number of simulated paths, overrides the request")]
    paths: Option<u32>,
    #[arg(long, help = "Base random seed, overrides the request")]
    seed: Option<u64>,
    #[arg(long, help = "Pretty-print the JSON output")]
    pretty: bool,
}

#[derive(Debug, Args)]
struct StatsArgs {
    #[arg(long)]
    prices_dir: PathBuf,
    #[arg(
        long = "asset",
        required = true,
        value_parser = parse_asset_weight,
        help = "Asset and allocation in percent, e.g. IE00BK5BQT80=75"
    )]
    assets: Vec<(String, f64)>,
    #[arg(long, value_enum, default_value_t = CliFrequency::Daily)]
    frequency: CliFrequency,
    #[arg(long, default_value_t = 10)]
    lookback_years: u32,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Pairwise return correlation between assets, 0 to 1"
    )]
    correlation: f64,
    #[arg(long, help = "Pretty-print the JSON output")]
    pretty: bool,
}

fn parse_asset_weight(raw: &str) -> std::result::Result<(String, f64), String> {
    let (id, weight) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=PERCENT, got `{raw}`"))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("missing asset identifier in `{raw}`"));
    }
    let weight = weight
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid allocation in `{raw}`: {e}"))?;
    Ok((id.to_string(), weight))
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PersonPayload {
    name: String,
    monthly_amount: f64,
    starting_loan: f64,
    kind: Option<ApiContributionKind>,
}

/// One allocated fund. Percent units; `annualReturn` and `annualVolatility`
/// replace estimation from prices for this fund.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EtfPayload {
    isin: String,
    allocation: f64,
    annual_return: Option<f64>,
    annual_volatility: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RentalPayload {
    mortgage_balance: Option<f64>,
    monthly_payment: Option<f64>,
    monthly_income: Option<f64>,
    mortgage_rate: Option<f64>,
    mode: Option<ApiRentalMode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ProjectionPayload {
    starting_capital: Option<f64>,
    persons: Option<Vec<PersonPayload>>,
    etfs: Option<Vec<EtfPayload>>,
    annual_return: Option<f64>,
    annual_volatility: Option<f64>,
    include_rental: Option<bool>,
    rental: Option<RentalPayload>,
    start_year: Option<i32>,
    start_month: Option<u32>,
    end_year: Option<i32>,
    contribution_end_year: Option<i32>,
    annual_costs: Option<f64>,
    withdrawal_rate: Option<f64>,
    withdrawal_start_year: Option<i32>,
    withdrawal_mode: Option<ApiWithdrawalMode>,
    simulations: Option<u32>,
    percentiles: Option<Vec<f64>>,
    seed: Option<u64>,
    lookback_years: Option<u32>,
    frequency: Option<ApiFrequency>,
    correlation: Option<f64>,
}

/// A request with every default filled in.
#[derive(Clone, Debug)]
struct Settings {
    starting_capital: f64,
    persons: Vec<PersonPayload>,
    etfs: Vec<EtfPayload>,
    annual_return: Option<f64>,
    annual_volatility: Option<f64>,
    include_rental: bool,
    rental: Option<RentalPayload>,
    start_year: i32,
    start_month: u32,
    end_year: i32,
    contribution_end_year: Option<i32>,
    annual_costs: f64,
    /// Percent of the opening balance paid out per year; 0 disables payouts.
    withdrawal_rate: f64,
    withdrawal_start_year: i32,
    withdrawal_mode: WithdrawalMode,
    simulations: u32,
    percentiles: Vec<f64>,
    seed: Option<u64>,
    lookback_years: u32,
    frequency: SamplingFrequency,
    correlation: f64,
}

fn default_settings() -> Settings {
    Settings {
        starting_capital: 12_000.0,
        persons: Vec::new(),
        etfs: vec![EtfPayload {
            isin: "IE00BK5BQT80".to_string(),
            allocation: 100.0,
            annual_return: None,
            annual_volatility: None,
        }],
        annual_return: None,
        annual_volatility: None,
        include_rental: false,
        rental: None,
        start_year: 2026,
        start_month: 1,
        end_year: 2040,
        contribution_end_year: None,
        annual_costs: 50.0,
        withdrawal_rate: 0.0,
        withdrawal_start_year: 2035,
        withdrawal_mode: WithdrawalMode::LoanRepayment,
        simulations: DEFAULT_NUM_PATHS,
        percentiles: DEFAULT_PERCENTILES.to_vec(),
        seed: None,
        lookback_years: 10,
        frequency: SamplingFrequency::Daily,
        correlation: 0.0,
    }
}

fn settings_from_payload(payload: ProjectionPayload) -> Settings {
    let mut s = default_settings();

    if let Some(v) = payload.starting_capital {
        s.starting_capital = v;
    }
    if let Some(v) = payload.persons {
        s.persons = v;
    }
    if let Some(v) = payload.etfs {
        s.etfs = v;
    }
    if payload.annual_return.is_some() {
        s.annual_return = payload.annual_return;
    }
    if payload.annual_volatility.is_some() {
        s.annual_volatility = payload.annual_volatility;
    }
    if let Some(v) = payload.include_rental {
        s.include_rental = v;
    }
    if payload.rental.is_some() {
        s.rental = payload.rental;
    }
    if let Some(v) = payload.start_year {
        s.start_year = v;
    }
    if let Some(v) = payload.start_month {
        s.start_month = v;
    }
    if let Some(v) = payload.end_year {
        s.end_year = v;
    }
    if payload.contribution_end_year.is_some() {
        s.contribution_end_year = payload.contribution_end_year;
    }
    if let Some(v) = payload.annual_costs {
        s.annual_costs = v;
    }
    if let Some(v) = payload.withdrawal_rate {
        s.withdrawal_rate = v;
    }
    if let Some(v) = payload.withdrawal_start_year {
        s.withdrawal_start_year = v;
    }
    if let Some(v) = payload.withdrawal_mode {
        s.withdrawal_mode = v.into();
    }
    if let Some(v) = payload.simulations {
        s.simulations = v;
    }
    if let Some(v) = payload.percentiles {
        s.percentiles = v;
    }
    if payload.seed.is_some() {
        s.seed = payload.seed;
    }
    if let Some(v) = payload.lookback_years {
        s.lookback_years = v;
    }
    if let Some(v) = payload.frequency {
        s.frequency = v.into();
    }
    if let Some(v) = payload.correlation {
        s.correlation = v;
    }

    s
}

/// Where the projection's return statistics come from.
#[derive(Clone, Debug)]
enum ReturnSource {
    Fixed(ReturnStatistics),
    Portfolio {
        allocation: PortfolioAllocation,
        options: EstimationOptions,
        frequency: SamplingFrequency,
    },
}

#[derive(Clone, Debug)]
struct ProjectionRequest {
    config: SimulationConfig,
    returns: ReturnSource,
}

fn required(value: Option<f64>, field: &str) -> Result<f64> {
    value.ok_or_else(|| ProjectionError::configuration(field, "is required"))
}

fn build_rental(s: &Settings) -> Result<Option<RentalParams>> {
    if !s.include_rental {
        return Ok(None);
    }
    let Some(rental) = &s.rental else {
        return Err(ProjectionError::configuration(
            "rental",
            "includeRental is set but no rental parameters were given",
        ));
    };

    let mode = rental.mode.map(RentalMode::from).unwrap_or(RentalMode::CompanyRepay);
    let params = match mode {
        RentalMode::CompanyRepay => RentalParams {
            mortgage_balance: required(rental.mortgage_balance, "rental.mortgageBalance")?,
            monthly_payment: required(rental.monthly_payment, "rental.monthlyPayment")?,
            monthly_income: required(rental.monthly_income, "rental.monthlyIncome")?,
            annual_rate: required(rental.mortgage_rate, "rental.mortgageRate")? / 100.0,
            mode,
        },
        RentalMode::PersonalPay => RentalParams {
            mortgage_balance: rental.mortgage_balance.unwrap_or(0.0),
            monthly_payment: rental.monthly_payment.unwrap_or(0.0),
            monthly_income: rental.monthly_income.unwrap_or(0.0),
            annual_rate: rental.mortgage_rate.unwrap_or(0.0) / 100.0,
            mode,
        },
    };
    Ok(Some(params))
}

fn build_config(s: &Settings) -> Result<SimulationConfig> {
    let horizon = Horizon {
        start_year: s.start_year,
        start_month: s.start_month,
        end_year: s.end_year,
    };
    let mut config = SimulationConfig::new(s.starting_capital, horizon);

    for person in &s.persons {
        let name = person.name.trim();
        if name.is_empty() {
            return Err(ProjectionError::configuration(
                "persons",
                "every person needs a name",
            ));
        }
        if person.monthly_amount != 0.0 {
            config.contributions.push(Contribution {
                person: name.to_string(),
                monthly_amount: person.monthly_amount,
                kind: person
                    .kind
                    .map(ContributionKind::from)
                    .unwrap_or(ContributionKind::ShareholderLoan),
            });
        }
        *config.starting_loans.entry(name.to_string()).or_insert(0.0) += person.starting_loan;
    }

    config.rental = build_rental(s)?;
    config.annual_costs = s.annual_costs;
    config.contribution_end_year = s.contribution_end_year;
    if s.withdrawal_rate != 0.0 {
        config.withdrawal = Some(WithdrawalParams {
            annual_rate: s.withdrawal_rate / 100.0,
            start_year: s.withdrawal_start_year,
            mode: s.withdrawal_mode,
        });
    }
    config.num_paths = s.simulations;
    config.percentiles = s.percentiles.clone();
    config.seed = s.seed;

    config.validate()?;
    Ok(config)
}

fn build_returns(s: &Settings) -> Result<ReturnSource> {
    if let Some(annual_return) = s.annual_return {
        let volatility = required(s.annual_volatility, "annualVolatility")?;
        let stats = ReturnStatistics::from_annual(annual_return / 100.0, volatility / 100.0);
        stats.validate()?;
        return Ok(ReturnSource::Fixed(stats));
    }

    if s.etfs.is_empty() {
        return Err(ProjectionError::configuration(
            "etfs",
            "give at least one ETF or a portfolio annualReturn",
        ));
    }

    let mut entries = Vec::with_capacity(s.etfs.len());
    let mut overrides = Vec::new();
    for etf in &s.etfs {
        let id = etf.isin.trim().to_string();
        if let Some(annual_return) = etf.annual_return {
            let field = format!("etfs.{id}.annualVolatility");
            let volatility = required(etf.annual_volatility, &field)?;
            overrides.push(AssetStatistics::from_annual(
                &id,
                annual_return / 100.0,
                volatility / 100.0,
            ));
        }
        entries.push(AllocationEntry {
            ticker_or_isin: id,
            weight: etf.allocation / 100.0,
        });
    }

    Ok(ReturnSource::Portfolio {
        allocation: PortfolioAllocation::new(entries)?,
        options: EstimationOptions {
            lookback_years: s.lookback_years,
            correlation: s.correlation,
            overrides,
        },
        frequency: s.frequency,
    })
}

fn request_from_payload(payload: ProjectionPayload) -> Result<ProjectionRequest> {
    let settings = settings_from_payload(payload);
    let config = build_config(&settings)?;
    let returns = build_returns(&settings)?;
    Ok(ProjectionRequest { config, returns })
}

fn request_from_json(json: &str) -> Result<ProjectionRequest> {
    let payload = serde_json::from_str::<ProjectionPayload>(json)
        .map_err(|e| ProjectionError::configuration("request", format!("invalid JSON: {e}")))?;
    request_from_payload(payload)
}

/// Known-fund figures for allocated assets that have neither caller-supplied
/// statistics nor a price file.
fn known_fallbacks(
    allocation: &PortfolioAllocation,
    directory: Option<&CsvPriceDirectory>,
    supplied: &[AssetStatistics],
) -> Vec<AssetStatistics> {
    allocation
        .entries()
        .iter()
        .map(|e| e.ticker_or_isin.as_str())
        .filter(|id| !supplied.iter().any(|o| o.identifier.eq_ignore_ascii_case(id)))
        .filter(|id| !directory.is_some_and(|d| d.contains(id)))
        .filter_map(|id| {
            let known = known_asset_statistics(id)?;
            warn!(
                target: "holdco::api",
                asset = id,
                annual_mean = known.annual_mean,
                annual_volatility = known.annual_volatility,
                "no price file, using known fund figures"
            );
            Some(known)
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectionResponse {
    seed: u64,
    simulations: u32,
    horizon_months: usize,
    labels: Vec<String>,
    statistics: ReturnStatistics,
    assets: Vec<AssetStatistics>,
    percentiles: Vec<PercentileTrajectory>,
    mean: Vec<TrajectoryPoint>,
    deterministic: Vec<TracePoint>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    statistics: ReturnStatistics,
    assets: Vec<AssetStatistics>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn snapshot_labels(horizon: &Horizon) -> Vec<String> {
    (0..horizon.months())
        .map(|k| {
            horizon
                .snapshot_date(k)
                .map(|d| d.format("%Y-%m").to_string())
                .unwrap_or_default()
        })
        .collect()
}

fn build_projection_response(
    config: &SimulationConfig,
    result: ProjectionResult,
    assets: Vec<AssetStatistics>,
) -> ProjectionResponse {
    ProjectionResponse {
        seed: result.seed,
        simulations: result.num_paths,
        horizon_months: result.horizon_months,
        labels: snapshot_labels(&config.horizon),
        statistics: result.statistics,
        assets,
        percentiles: result.percentiles,
        mean: result.mean,
        deterministic: result.deterministic,
    }
}

fn execute_projection(
    request: ProjectionRequest,
    prices_dir: Option<&Path>,
) -> Result<ProjectionResponse> {
    let ProjectionRequest { config, returns } = request;

    match returns {
        ReturnSource::Fixed(stats) => {
            let result = run_projection(&config, &stats)?;
            Ok(build_projection_response(&config, result, Vec::new()))
        }
        ReturnSource::Portfolio {
            allocation,
            mut options,
            frequency,
        } => {
            let directory = prices_dir.map(|dir| CsvPriceDirectory::new(dir, frequency));
            let fallbacks = known_fallbacks(&allocation, directory.as_ref(), &options.overrides);
            options.overrides.extend(fallbacks);

            let empty = BTreeMap::<String, PriceSeries>::new();
            let provider: &dyn PriceSeriesProvider = match &directory {
                Some(d) => d,
                None => &empty,
            };
            let projection = project_portfolio(&config, &allocation, provider, &options)?;
            Ok(build_projection_response(
                &config,
                projection.result,
                projection.estimate.assets,
            ))
        }
    }
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> Result<String> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    rendered.map_err(|e| ProjectionError::configuration("response", e.to_string()))
}

fn run_project(args: &ProjectArgs) -> Result<String> {
    let json = fs::read_to_string(&args.request).map_err(|e| {
        ProjectionError::configuration(
            "request",
            format!("cannot read {}: {e}", args.request.display()),
        )
    })?;
    let mut request = request_from_json(&json)?;
    if let Some(paths) = args.paths {
        request.config.num_paths = paths;
    }
    if args.seed.is_some() {
        request.config.seed = args.seed;
    }

    info!(
        target: "holdco::api",
        request = %args.request.display(),
        paths = request.config.num_paths,
        months = request.config.horizon_months(),
        "running projection request"
    );
    let response = execute_projection(request, args.prices_dir.as_deref())?;
    to_json(&response, args.pretty)
}

fn run_stats(args: &StatsArgs) -> Result<String> {
    let entries = args
        .assets
        .iter()
        .map(|(id, percent)| AllocationEntry {
            ticker_or_isin: id.clone(),
            weight: percent / 100.0,
        })
        .collect();
    let allocation = PortfolioAllocation::new(entries)?;
    let directory = CsvPriceDirectory::new(&args.prices_dir, args.frequency.into());
    let overrides = known_fallbacks(&allocation, Some(&directory), &[]);

    let estimate = estimate_portfolio(
        &allocation,
        &directory,
        args.lookback_years,
        args.correlation,
        &overrides,
    )?;
    to_json(
        &StatsResponse {
            statistics: estimate.statistics,
            assets: estimate.assets,
        },
        args.pretty,
    )
}

/// Runs the parsed command and returns its JSON output.
pub fn run(cli: &Cli) -> Result<String> {
    match &cli.command {
        Command::Project(args) => run_project(args),
        Command::Stats(args) => run_stats(args),
    }
}

pub fn error_json(err: &ProjectionError) -> String {
    let body = ErrorResponse {
        error: err.to_string(),
    };
    serde_json::to_string(&body).unwrap_or_else(|_| format!("{{\"error\":{:?}}}", body.error))
}
