/// Rate at which a success curve, sampled on ascending `rates`, crosses
/// `target`.
///
/// The first adjacent pair with `s[i] >= target > s[i + 1]` brackets the
/// crossing and the rate is interpolated linearly between them. `None` when
/// even the lowest rate misses the target; the last rate when the curve
/// never drops below it.
pub fn invert_success_curve(rates: &[f64], successes: &[f64], target: f64) -> Option<f64> {
    let n = rates.len().min(successes.len());
    if n == 0 || successes[0] < target {
        return None;
    }
    for i in 0..n - 1 {
        if successes[i] >= target && target > successes[i + 1] {
            return Some(interpolate(
                rates[i],
                successes[i],
                rates[i + 1],
                successes[i + 1],
                target,
            ));
        }
    }
    Some(rates[n - 1])
}

/// Same rule as [`invert_success_curve`] for a curve known to be
/// non-increasing, evaluated lazily by bisection over the grid indices.
pub fn invert_monotone<F>(rates: &[f64], target: f64, mut success_at: F) -> Option<f64>
where
    F: FnMut(f64) -> f64,
{
    let last = rates.len().checked_sub(1)?;
    let first_success = success_at(rates[0]);
    if first_success < target {
        return None;
    }
    let last_success = success_at(rates[last]);
    if last_success >= target {
        return Some(rates[last]);
    }

    // s[lo] >= target > s[hi]
    let (mut lo, mut hi) = (0, last);
    let (mut s_lo, mut s_hi) = (first_success, last_success);
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        let s_mid = success_at(rates[mid]);
        if s_mid >= target {
            lo = mid;
            s_lo = s_mid;
        } else {
            hi = mid;
            s_hi = s_mid;
        }
    }
    Some(interpolate(rates[lo], s_lo, rates[hi], s_hi, target))
}

fn interpolate(r0: f64, s0: f64, r1: f64, s1: f64, target: f64) -> f64 {
    if s0 == s1 {
        return r0;
    }
    r0 + (s0 - target) / (s0 - s1) * (r1 - r0)
}
