use serde::{Deserialize, Serialize};

/// One outer trial placed in mean-IRR / IRR-volatility space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub outer: u32,
    pub leverage: f64,
    pub mean_irr: f64,
    pub irr_volatility: f64,
}

impl FrontierPoint {
    /// At least as good on both axes and strictly better on one.
    fn dominates(&self, other: &FrontierPoint) -> bool {
        self.mean_irr >= other.mean_irr
            && self.irr_volatility <= other.irr_volatility
            && (self.mean_irr > other.mean_irr || self.irr_volatility < other.irr_volatility)
    }
}

/// Non-dominated candidates with leverage at most `max_leverage`, ordered
/// by increasing volatility.
pub fn efficient_frontier(candidates: &[FrontierPoint], max_leverage: Option<f64>) -> Vec<FrontierPoint> {
    let eligible: Vec<&FrontierPoint> = candidates
        .iter()
        .filter(|p| p.mean_irr.is_finite() && p.irr_volatility.is_finite())
        .filter(|p| max_leverage.map_or(true, |max| p.leverage <= max))
        .collect();

    let mut frontier: Vec<FrontierPoint> = eligible
        .iter()
        .filter(|p| !eligible.iter().any(|q| q.dominates(p)))
        .map(|p| (*p).clone())
        .collect();
    frontier.sort_by(|a, b| {
        a.irr_volatility
            .total_cmp(&b.irr_volatility)
            .then(b.mean_irr.total_cmp(&a.mean_irr))
            .then(a.outer.cmp(&b.outer))
    });
    frontier
}
