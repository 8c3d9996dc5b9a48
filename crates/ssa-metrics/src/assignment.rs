//! Optimal linear-sum assignment (Hungarian algorithm with potentials).

use nalgebra::DMatrix;

/// Minimum-cost assignment of rows to distinct columns.
///
/// Works for rectangular matrices; the smaller side is fully assigned.
/// Returns `(row, col)` pairs sorted by row. Runs in `O(n²·m)`.
///
/// A matrix holding NaN or infinite costs has no well-defined optimum and
/// yields no pairs.
pub fn min_cost_assignment(cost: &DMatrix<f64>) -> Vec<(usize, usize)> {
    if cost.nrows() == 0 || cost.ncols() == 0 {
        return Vec::new();
    }
    if cost.iter().any(|c| !c.is_finite()) {
        return Vec::new();
    }
    if cost.nrows() > cost.ncols() {
        let mut pairs: Vec<(usize, usize)> = min_cost_assignment(&cost.transpose())
            .into_iter()
            .map(|(r, c)| (c, r))
            .collect();
        pairs.sort_unstable();
        return pairs;
    }

    let n = cost.nrows();
    let m = cost.ncols();
    // 1-based potentials; column 0 is a virtual root.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        owner[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[(i0 - 1, j - 1)] - u[i0] - v[j];
                if reduced < minv[j] {
                    minv[j] = reduced;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| owner[j] != 0)
        .map(|j| (owner[j] - 1, j - 1))
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Maximum-score assignment; see [`min_cost_assignment`].
pub fn max_score_assignment(score: &DMatrix<f64>) -> Vec<(usize, usize)> {
    min_cost_assignment(&score.map(|s| -s))
}
