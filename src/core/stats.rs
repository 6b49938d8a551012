use super::types::{
    BAND_PERCENTILES, FINAL_PERCENTILES, FinalDistribution, PercentileTrajectories,
    PercentileValue,
};

pub fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(f64::total_cmp);
    values
}

/// Linear-interpolation percentile on `p` in [0, 100] of an ascending slice.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    match values.len() {
        0 => 0.0,
        1 => values[0],
        n => {
            let rank = (p / 100.0) * (n as f64 - 1.0);
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let w = rank - lower as f64;
            values[lower] * (1.0 - w) + values[upper] * w
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Each row of `series` is one trial.
pub fn trajectory_bands<'a, I>(series: I, years: usize) -> PercentileTrajectories
where
    I: IntoIterator<Item = &'a [f64]>,
{
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); years];
    for row in series {
        for (column, value) in columns.iter_mut().zip(row) {
            column.push(*value);
        }
    }

    let mut bands: [Vec<f64>; 5] = Default::default();
    for column in &mut columns {
        column.sort_by(f64::total_cmp);
        for (band, p) in bands.iter_mut().zip(BAND_PERCENTILES) {
            band.push(percentile(column, p));
        }
    }

    let [p10, p25, p50, p75, p90] = bands;
    PercentileTrajectories {
        p10,
        p25,
        p50,
        p75,
        p90,
    }
}

pub fn column_means<'a, I>(series: I, years: usize) -> Vec<f64>
where
    I: IntoIterator<Item = &'a [f64]>,
{
    let mut sums = vec![0.0; years];
    let mut count = 0usize;
    for row in series {
        count += 1;
        for (sum, value) in sums.iter_mut().zip(row) {
            *sum += value;
        }
    }
    if count > 0 {
        for sum in &mut sums {
            *sum /= count as f64;
        }
    }
    sums
}

pub fn final_distribution(values: Vec<f64>) -> FinalDistribution {
    let values = sorted(values);
    FinalDistribution {
        min: values.first().copied().unwrap_or(0.0),
        mean: mean(&values),
        median: percentile(&values, 50.0),
        max: values.last().copied().unwrap_or(0.0),
        percentiles: FINAL_PERCENTILES
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value: percentile(&values, p as f64),
            })
            .collect(),
    }
}

/// 95% normal-approximation half-width of a binomial proportion.
pub fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}
