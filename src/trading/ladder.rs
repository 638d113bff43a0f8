use crate::models::ExitTarget;

/// Fixed split of the post-recovery contracts across the remaining
/// targets, by remaining-target count.
fn proportions(count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![1.0],
        2 => vec![0.7, 0.3],
        3 => vec![0.6, 0.3, 0.1],
        4 => vec![0.5, 0.25, 0.15, 0.1],
        n => vec![1.0 / n as f64; n],
    }
}

/// Compute the take-profit ladder once at submit. The first rung recovers
/// the initial cost (smallest quantity whose proceeds at the first target
/// cover it); the rest split by fixed proportions; zero rungs are pruned
/// and the last surviving rung is the runner, held until the EMA-13 break.
pub fn compute_exit_ladder(
    entry_price: f64,
    quantity: u32,
    take_profit_percentages: &[f64],
) -> Vec<ExitTarget> {
    if quantity == 0 || take_profit_percentages.is_empty() || entry_price <= 0.0 {
        return Vec::new();
    }

    let prices: Vec<f64> = take_profit_percentages
        .iter()
        .map(|pct| entry_price * (1.0 + pct / 100.0))
        .collect();
    let cost = entry_price * quantity as f64 * 100.0;

    // smallest i with i * first_target * 100 >= cost
    let first_proceeds = prices[0] * 100.0;
    let mut first_qty = (cost / first_proceeds).ceil() as u32;
    if (first_qty as f64) * first_proceeds < cost {
        first_qty += 1;
    }
    let first_qty = first_qty.clamp(1, quantity);

    let remaining = quantity - first_qty;
    let props = proportions(take_profit_percentages.len() - 1);

    // largest-remainder rounding so the split sums exactly to remaining
    let mut split: Vec<u32> = props
        .iter()
        .map(|p| (p * remaining as f64).floor() as u32)
        .collect();
    let mut leftover = remaining - split.iter().sum::<u32>();
    let mut order: Vec<usize> = (0..props.len()).collect();
    order.sort_by(|&a, &b| {
        let fa = props[a] * remaining as f64 - (props[a] * remaining as f64).floor();
        let fb = props[b] * remaining as f64 - (props[b] * remaining as f64).floor();
        fb.partial_cmp(&fa).unwrap()
    });
    for idx in order {
        if leftover == 0 {
            break;
        }
        split[idx] += 1;
        leftover -= 1;
    }

    let mut targets: Vec<ExitTarget> = Vec::new();
    targets.push(ExitTarget {
        target_pct: take_profit_percentages[0],
        target_price: prices[0],
        quantity: first_qty,
        runner: false,
        hit: false,
    });
    for (i, qty) in split.into_iter().enumerate() {
        if qty == 0 {
            continue;
        }
        targets.push(ExitTarget {
            target_pct: take_profit_percentages[i + 1],
            target_price: prices[i + 1],
            quantity: qty,
            runner: false,
            hit: false,
        });
    }
    if let Some(last) = targets.last_mut() {
        last.runner = true;
    }
    targets
}
