use super::types::{
    ContributionKind, MONTHS_PER_YEAR, RentalMode, RentalParams, SimulationConfig, WithdrawalMode,
    WithdrawalParams,
};

/// Working state of one path. Never shared between paths.
#[derive(Clone, Debug, PartialEq)]
pub struct PathState {
    pub balance: f64,
    pub mortgage_balance: f64,
    /// Indexed like `CashFlowRules::people`.
    pub loans: Vec<f64>,
    pub invested: f64,
}

impl PathState {
    pub fn total_loans(&self) -> f64 {
        self.loans.iter().sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MonthParams {
    pub return_rate: f64,
    pub contributions_active: bool,
    /// Payout due this month; 0 outside the withdrawal phase.
    pub withdrawal: f64,
}

/// Money that moved during a month, kept for the deterministic trace.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MonthFlows {
    pub contributions: f64,
    pub rental_income: f64,
    pub costs: f64,
    pub payout: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: PathState,
    pub flows: MonthFlows,
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct ResolvedContribution {
    person: usize,
    amount: f64,
    kind: ContributionKind,
}

/// Monthly cash-flow rules of a configuration, with people resolved to
/// indices so stepping does no lookups.
#[derive(Clone, Debug)]
pub struct CashFlowRules {
    people: Vec<String>,
    contributions: Vec<ResolvedContribution>,
    rental: Option<RentalParams>,
    withdrawal: Option<WithdrawalParams>,
    monthly_costs: f64,
}

impl CashFlowRules {
    pub fn from_config(config: &SimulationConfig) -> Self {
        let people = config.people();
        let index_of = |name: &str| people.iter().position(|p| p == name).unwrap_or(0);
        let contributions = config
            .contributions
            .iter()
            .map(|c| ResolvedContribution {
                person: index_of(&c.person),
                amount: c.monthly_amount,
                kind: c.kind,
            })
            .collect();

        Self {
            contributions,
            rental: config.rental.clone(),
            withdrawal: config.withdrawal.clone(),
            monthly_costs: config.annual_costs / MONTHS_PER_YEAR as f64,
            people,
        }
    }

    pub fn people(&self) -> &[String] {
        &self.people
    }

    pub fn initial_state(&self, config: &SimulationConfig) -> PathState {
        PathState {
            balance: config.starting_capital,
            mortgage_balance: self
                .rental
                .as_ref()
                .map(|r| r.mortgage_balance)
                .unwrap_or(0.0),
            loans: self
                .people
                .iter()
                .map(|p| config.starting_loans.get(p).copied().unwrap_or(0.0))
                .collect(),
            invested: config.starting_capital,
        }
    }

    /// Monthly payout for a year that opens with `opening_balance`.
    pub fn withdrawal_budget(&self, opening_balance: f64) -> f64 {
        self.withdrawal
            .as_ref()
            .map(|w| w.monthly_budget(opening_balance))
            .unwrap_or(0.0)
    }

    /// One month: market return, contributions, rental, running costs, payout.
    pub fn step(&self, mut state: PathState, params: MonthParams) -> Transition {
        let mut flows = MonthFlows::default();

        apply_market_return(&mut state, params.return_rate);
        if params.contributions_active {
            flows.contributions = self.apply_contributions(&mut state);
        }
        if let Some(rental) = &self.rental {
            flows.rental_income = apply_rental(&mut state, rental);
        }
        flows.costs = apply_costs(&mut state, self.monthly_costs);
        if let Some(withdrawal) = &self.withdrawal {
            flows.payout = apply_withdrawal(&mut state, params.withdrawal, withdrawal.mode);
        }

        Transition { state, flows }
    }

    fn apply_contributions(&self, state: &mut PathState) -> f64 {
        let mut total = 0.0;
        for c in &self.contributions {
            state.balance += c.amount;
            state.invested += c.amount;
            total += c.amount;
            let loan = &mut state.loans[c.person];
            match c.kind {
                ContributionKind::Equity => {}
                ContributionKind::ShareholderLoan => *loan += c.amount,
                ContributionKind::LoanRepayment => *loan = (*loan - c.amount).max(0.0),
            }
        }
        total
    }
}

fn apply_market_return(state: &mut PathState, return_rate: f64) {
    state.balance *= 1.0 + return_rate;
}

/// Returns rental income credited to the company this month.
fn apply_rental(state: &mut PathState, rental: &RentalParams) -> f64 {
    match rental.mode {
        RentalMode::PersonalPay => 0.0,
        RentalMode::CompanyRepay => {
            if state.mortgage_balance <= 0.0 {
                state.balance += rental.monthly_income;
                rental.monthly_income
            } else {
                state.mortgage_balance = amortize(
                    state.mortgage_balance,
                    rental.monthly_payment,
                    rental.monthly_rate(),
                );
                0.0
            }
        }
    }
}

/// Remaining principal after one payment. A payment that does not cover the
/// interest leaves the balance unchanged rather than growing it.
pub fn amortize(balance: f64, payment: f64, monthly_rate: f64) -> f64 {
    let interest = balance * monthly_rate;
    let principal = payment - interest;
    if principal <= 0.0 {
        return balance;
    }
    (balance - principal).max(0.0)
}

/// Deducts running costs, never taking a positive balance below zero.
fn apply_costs(state: &mut PathState, monthly_costs: f64) -> f64 {
    if monthly_costs <= 0.0 {
        return 0.0;
    }
    let paid = monthly_costs.min(state.balance.max(0.0));
    state.balance -= paid;
    paid
}

/// Pays `amount` out of the balance when the balance covers it. In loan mode
/// the payout repays loans in proportion to each balance, never below 0.
fn apply_withdrawal(state: &mut PathState, amount: f64, mode: WithdrawalMode) -> f64 {
    if amount <= 0.0 || state.balance < amount {
        return 0.0;
    }
    state.balance -= amount;

    if mode == WithdrawalMode::LoanRepayment {
        let owed = state.total_loans();
        if owed > 0.0 {
            let repaid = amount.min(owed);
            for loan in &mut state.loans {
                *loan = (*loan - repaid * (*loan / owed)).max(0.0);
            }
        }
    }
    amount
}
