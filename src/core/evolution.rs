use super::bootstrap::SampledPath;
use super::policy::WithdrawalPolicy;
use super::types::{
    AssetAllocation, CashFlowItem, ExpenseRatios, ReturnRecord, SimulationTrial, net_cash_flow,
};

#[derive(Debug, Clone, Copy)]
pub struct PortfolioPlan<'a> {
    pub initial_balance: f64,
    pub allocation: AssetAllocation,
    pub expense_ratios: ExpenseRatios,
    pub cash_flows: &'a [CashFlowItem],
    /// Retirement length the policy plans against. May exceed the path
    /// length when a historical replay runs out of data.
    pub horizon: u32,
}

impl PortfolioPlan<'_> {
    pub fn net_return(&self, record: &ReturnRecord) -> f64 {
        self.allocation.blended_return(record) - self.expense_ratios.blended_drag(&self.allocation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YearContext {
    pub year: u32,
    pub horizon: u32,
    pub start_balance: f64,
    /// Cumulative inflation index through the previous year.
    pub start_index: f64,
    /// Cumulative inflation index through this year.
    pub end_index: f64,
    pub prior_real_return: Option<f64>,
}

impl YearContext {
    pub fn remaining_years(&self) -> u32 {
        (self.horizon + 1).saturating_sub(self.year)
    }

    pub fn start_real_balance(&self) -> f64 {
        self.start_balance / self.start_index
    }
}

/// Each year the start balance grows at the net return, then the withdrawal
/// is taken and cash flows are added. A balance at or below zero depletes.
pub fn evolve(
    path: SampledPath,
    plan: &PortfolioPlan<'_>,
    policy: &mut WithdrawalPolicy<'_>,
) -> SimulationTrial {
    let years = path.records.len();
    let mut nominal_balances = Vec::with_capacity(years + 1);
    let mut real_balances = Vec::with_capacity(years + 1);
    let mut nominal_withdrawals = Vec::with_capacity(years);
    let mut real_withdrawals = Vec::with_capacity(years);
    nominal_balances.push(plan.initial_balance);
    real_balances.push(plan.initial_balance);

    let mut balance = plan.initial_balance;
    let mut index = 1.0;
    let mut prior_real_return = None;
    let mut depletion_year = None;

    for (offset, record) in path.records.iter().enumerate() {
        let year = offset as u32 + 1;
        let start_index = index;
        index *= 1.0 + record.inflation_rate;
        let net = plan.net_return(record);

        if depletion_year.is_some() {
            nominal_balances.push(0.0);
            real_balances.push(0.0);
            nominal_withdrawals.push(0.0);
            real_withdrawals.push(0.0);
            continue;
        }

        let ctx = YearContext {
            year,
            horizon: plan.horizon,
            start_balance: balance,
            start_index,
            end_index: index,
            prior_real_return,
        };
        let withdrawal = policy.next_withdrawal(&ctx).max(0.0);
        let cash_flow = net_cash_flow(plan.cash_flows, year, index);

        balance = balance * (1.0 + net) - withdrawal + cash_flow;
        if balance <= 0.0 {
            balance = 0.0;
            depletion_year = Some(year);
        }

        nominal_balances.push(balance);
        real_balances.push(balance / index);
        nominal_withdrawals.push(withdrawal);
        real_withdrawals.push(withdrawal / index);
        prior_real_return = Some((1.0 + net) / (1.0 + record.inflation_rate) - 1.0);
    }

    SimulationTrial {
        path: path.records,
        block_lengths: path.block_lengths,
        nominal_balances,
        real_balances,
        nominal_withdrawals,
        real_withdrawals,
        depletion_year,
    }
}

/// Allocation-free `evolve` under a fixed real withdrawal.
pub fn survives_fixed(path: &[ReturnRecord], plan: &PortfolioPlan<'_>, withdrawal: f64) -> bool {
    let mut balance = plan.initial_balance;
    let mut index = 1.0;
    for (offset, record) in path.iter().enumerate() {
        index *= 1.0 + record.inflation_rate;
        let year = offset as u32 + 1;
        balance = balance * (1.0 + plan.net_return(record)) - withdrawal * index
            + net_cash_flow(plan.cash_flows, year, index);
        if balance <= 0.0 {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_record(year: i32, stock: f64, bond: f64, inflation: f64) -> ReturnRecord {
        ReturnRecord {
            year,
            us_stock_return: stock,
            intl_stock_return: stock,
            us_bond_return: bond,
            inflation_rate: inflation,
        }
    }

    fn path_of(records: Vec<ReturnRecord>) -> SampledPath {
        let len = records.len() as u32;
        SampledPath {
            records,
            block_lengths: vec![len],
        }
    }

    fn plan(cash_flows: &[CashFlowItem], horizon: u32) -> PortfolioPlan<'_> {
        PortfolioPlan {
            initial_balance: 1_000.0,
            allocation: AssetAllocation::new(0.5, 0.0, 0.5),
            expense_ratios: ExpenseRatios::default(),
            cash_flows,
            horizon,
        }
    }

    #[test]
    fn applies_return_withdrawal_and_cash_flow_in_order() {
        let records = vec![
            flat_record(2000, 0.10, 0.10, 0.0),
            flat_record(2001, 0.10, 0.10, 0.0),
        ];
        let cash = [CashFlowItem {
            name: "rent".to_string(),
            amount: 50.0,
            start_year: 2,
            duration: 1,
            inflation_adjusted: true,
        }];
        let plan = plan(&cash, 2);
        let mut policy = WithdrawalPolicy::fixed(100.0);
        let trial = evolve(path_of(records), &plan, &mut policy);

        assert_eq!(trial.nominal_balances.len(), 3);
        assert!((trial.nominal_balances[1] - 1_000.0).abs() < 1e-9);
        assert!((trial.nominal_balances[2] - 1_050.0).abs() < 1e-9);
        assert_eq!(trial.nominal_withdrawals, vec![100.0, 100.0]);
        assert!(!trial.depleted());
    }

    #[test]
    fn real_series_divides_by_cumulative_inflation() {
        let records = vec![
            flat_record(2000, 0.0, 0.0, 0.10),
            flat_record(2001, 0.0, 0.0, 0.10),
        ];
        let plan = plan(&[], 2);
        let mut policy = WithdrawalPolicy::fixed(100.0);
        let trial = evolve(path_of(records), &plan, &mut policy);

        assert!((trial.nominal_withdrawals[1] - 121.0).abs() < 1e-9);
        for w in &trial.real_withdrawals {
            assert!((w - 100.0).abs() < 1e-9);
        }
        let expected = (1_000.0 - 110.0 - 121.0) / 1.21;
        assert!((trial.real_balances[2] - expected).abs() < 1e-9);
    }

    #[test]
    fn depletion_records_zero_thereafter() {
        let records = (0..5).map(|i| flat_record(2000 + i, -0.5, -0.5, 0.0)).collect();
        let plan = plan(&[], 5);
        let mut policy = WithdrawalPolicy::fixed(300.0);
        let trial = evolve(path_of(records), &plan, &mut policy);

        assert_eq!(trial.depletion_year, Some(2));
        assert_eq!(trial.nominal_balances.len(), 6);
        assert!(trial.nominal_balances[2..].iter().all(|&b| b == 0.0));
        assert!(trial.nominal_withdrawals[2..].iter().all(|&w| w == 0.0));
        assert_eq!(trial.final_real_balance(), 0.0);
    }

    #[test]
    fn survives_fixed_agrees_with_evolve() {
        let records: Vec<ReturnRecord> = (0..20)
            .map(|i| flat_record(1980 + i, if i % 3 == 0 { -0.2 } else { 0.08 }, 0.03, 0.03))
            .collect();
        let plan = plan(&[], 20);
        for withdrawal in [20.0, 60.0, 90.0, 140.0] {
            let mut policy = WithdrawalPolicy::fixed(withdrawal);
            let trial = evolve(path_of(records.clone()), &plan, &mut policy);
            assert_eq!(survives_fixed(&records, &plan, withdrawal), !trial.depleted());
        }
    }
}
