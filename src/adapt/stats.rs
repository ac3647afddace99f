//! Small statistics kit for the nightly batch.

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

/// Population standard deviation (ddof 0).
pub fn std_pop(xs: &[f64]) -> Option<f64> {
    let m = mean(xs)?;
    Some((xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt())
}

/// Linear-interpolated quantile of a sample, `q` in [0, 1].
pub fn quantile(xs: &[f64], q: f64) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Clip every value into the `[lower, upper]` quantile band.
pub fn winsorize(xs: &[f64], lower: f64, upper: f64) -> Vec<f64> {
    match (quantile(xs, lower), quantile(xs, upper)) {
        (Some(lo), Some(hi)) => xs.iter().map(|x| x.clamp(lo, hi)).collect(),
        _ => Vec::new(),
    }
}

/// Pearson correlation. `None` when either side is constant or lengths
/// differ.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let mx = mean(xs)?;
    let my = mean(ys)?;
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx < 1e-18 || vy < 1e-18 {
        return None;
    }
    Some((cov / (vx.sqrt() * vy.sqrt())).clamp(-1.0, 1.0))
}

/// Mean `y` of the top fifth of `x` minus mean `y` of the bottom fifth.
pub fn quintile_spread(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 5 {
        return None;
    }
    let mut pairs: Vec<(f64, f64)> = xs.iter().copied().zip(ys.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let k = (pairs.len() / 5).max(1);
    let bottom: Vec<f64> = pairs[..k].iter().map(|p| p.1).collect();
    let top: Vec<f64> = pairs[pairs.len() - k..].iter().map(|p| p.1).collect();
    Some(mean(&top)? - mean(&bottom)?)
}

/// Number of distinct values (exact float equality).
pub fn unique_count(xs: &[f64]) -> usize {
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    sorted.len()
}
