//! Periodic cash-flow returns used to summarise each trial.
//!
//! Trial cash flows are converted to `f64` before root finding; the ledger
//! itself stays in `Decimal`.

const TOLERANCE: f64 = 1e-10;
const MAX_ITERATIONS: u32 = 1000;
const MIN_PERIODIC_RATE: f64 = -0.99;
const MAX_PERIODIC_RATE: f64 = 10.0;

/// Net present value of equally spaced cash flows at a periodic rate.
pub fn npv(cash_flows: &[f64], rate: f64) -> f64 {
    cash_flows
        .iter()
        .enumerate()
        .map(|(t, &cf)| cf / (1.0 + rate).powi(t as i32))
        .sum()
}

fn npv_and_derivative(cash_flows: &[f64], rate: f64) -> (f64, f64) {
    let mut value = 0.0;
    let mut derivative = 0.0;
    for (t, &cf) in cash_flows.iter().enumerate() {
        value += cf / (1.0 + rate).powi(t as i32);
        if t > 0 {
            derivative -= t as f64 * cf / (1.0 + rate).powi(t as i32 + 1);
        }
    }
    (value, derivative)
}

/// Periodic IRR by Newton-Raphson, falling back to bisection.
///
/// Returns `None` when the flows never change sign or no root lies in
/// `[-99%, 1000%]` per period.
pub fn periodic_irr(cash_flows: &[f64]) -> Option<f64> {
    if cash_flows.len() < 2 {
        return None;
    }
    let has_positive = cash_flows.iter().any(|&cf| cf > TOLERANCE);
    let has_negative = cash_flows.iter().any(|&cf| cf < -TOLERANCE);
    if !has_positive || !has_negative {
        return None;
    }

    let mut rate = 0.01;
    for _ in 0..MAX_ITERATIONS {
        let (value, derivative) = npv_and_derivative(cash_flows, rate);
        if derivative.abs() < 1e-20 || !derivative.is_finite() {
            return bisection(cash_flows);
        }
        let next = (rate - value / derivative).clamp(MIN_PERIODIC_RATE, MAX_PERIODIC_RATE);
        if (next - rate).abs() < TOLERANCE {
            return Some(next);
        }
        rate = next;
    }
    bisection(cash_flows)
}

fn bisection(cash_flows: &[f64]) -> Option<f64> {
    let mut low = MIN_PERIODIC_RATE;
    let mut high = MAX_PERIODIC_RATE;
    let mut npv_low = npv(cash_flows, low);
    if npv_low * npv(cash_flows, high) > 0.0 {
        return None;
    }
    for _ in 0..MAX_ITERATIONS {
        let mid = (low + high) / 2.0;
        let npv_mid = npv(cash_flows, mid);
        if npv_mid.abs() < TOLERANCE || (high - low) / 2.0 < TOLERANCE {
            return Some(mid);
        }
        if npv_mid * npv_low < 0.0 {
            high = mid;
        } else {
            low = mid;
            npv_low = npv_mid;
        }
    }
    None
}

/// Annualised IRR: `(1 + r)^periods_per_year - 1`.
pub fn irr(cash_flows: &[f64], periods_per_year: u32) -> Option<f64> {
    periodic_irr(cash_flows)
        .map(|r| (1.0 + r).powi(periods_per_year as i32) - 1.0)
        .filter(|r| r.is_finite())
}

/// Total distributions over total contributions.
pub fn multiple(cash_flows: &[f64]) -> f64 {
    let paid_in: f64 = cash_flows.iter().filter(|&&cf| cf < 0.0).map(|cf| -cf).sum();
    let distributed: f64 = cash_flows.iter().filter(|&&cf| cf > 0.0).sum();
    if paid_in <= 0.0 {
        0.0
    } else {
        distributed / paid_in
    }
}
