//! Deterministic synthetic return table and a baseline config for tests.

use std::f64::consts::PI;

use rand::Rng;

use super::history::{HistoricalReturns, INTL_PROXY_BEFORE};
use super::rng::stream_rng;
use super::types::{
    AssetAllocation, ExpenseRatios, ReturnRecord, SimulationConfig, WithdrawalStrategy,
};

pub const FIRST_YEAR: i32 = 1926;
pub const LAST_YEAR: i32 = 2023;

fn normal<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let u1: f64 = 1.0 - rng.gen_range(0.0..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
    mean + std_dev * z
}

/// 1926..=2023 with stock ~ N(10%, 18%), bonds ~ N(5%, 6%), inflation
/// ~ N(3%, 2%). International equals US stock before 1970.
pub fn synthetic_history() -> HistoricalReturns {
    let mut rng = stream_rng(1926, 0, 0);
    let records = (FIRST_YEAR..=LAST_YEAR)
        .map(|year| {
            let us = normal(&mut rng, 0.10, 0.18).max(-0.6);
            let intl_own = normal(&mut rng, 0.09, 0.20).max(-0.6);
            ReturnRecord {
                year,
                us_stock_return: us,
                intl_stock_return: if year < INTL_PROXY_BEFORE { us } else { intl_own },
                us_bond_return: normal(&mut rng, 0.05, 0.06),
                inflation_rate: normal(&mut rng, 0.03, 0.02).max(-0.05),
            }
        })
        .collect();
    match HistoricalReturns::from_records(records) {
        Ok(history) => history,
        Err(err) => panic!("synthetic history must be valid: {err}"),
    }
}

pub fn sample_config() -> SimulationConfig {
    SimulationConfig {
        initial_portfolio: 1_000_000.0,
        annual_withdrawal: 40_000.0,
        allocation: AssetAllocation::new(0.4, 0.4, 0.2),
        expense_ratios: ExpenseRatios::uniform(0.0005),
        retirement_years: 30,
        min_block: 1,
        max_block: 10,
        num_simulations: 400,
        data_start_year: FIRST_YEAR,
        strategy: WithdrawalStrategy::Fixed,
        cash_flows: Vec::new(),
        seed: 42,
    }
}
