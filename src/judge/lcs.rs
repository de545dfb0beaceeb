//! Longest common subsequence over arbitrary slices.
//!
//! The equality predicate is supplied by the caller, so the same routines
//! serve byte tokens, parsed numbers and anything else the comparators
//! throw at them.

/// Length of a longest common subsequence of `a` and `b`.
///
/// Runs the classic two-row dynamic program; the shorter sequence indexes
/// the inner dimension so memory stays `O(min(|a|, |b|))`.
pub fn lcs_length<A, B, F>(a: &[A], b: &[B], eq: F) -> usize
where
    F: Fn(&A, &B) -> bool,
{
    if a.len() < b.len() {
        lcs_length_impl(b, a, &|x, y| eq(y, x))
    } else {
        lcs_length_impl(a, b, &eq)
    }
}

// Bounded by `&dyn Fn` rather than a generic `F` so the `a.len() < b.len()`
// swap above can't recurse into ever-growing closure types and blow the
// compiler's monomorphization recursion limit.
fn lcs_length_impl<A, B>(a: &[A], b: &[B], eq: &dyn Fn(&A, &B) -> bool) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut row = vec![0usize; b.len()];
    for r in 0..a.len() {
        let mut last_upper_left = 0;
        let mut last_left = 0;
        for (i, cell) in row.iter_mut().enumerate() {
            let upper = *cell;
            *cell = if eq(&a[r], &b[i]) {
                last_upper_left + 1
            } else {
                last_left.max(upper)
            };
            last_left = *cell;
            last_upper_left = upper;
        }
    }
    row[b.len() - 1]
}

/// One maximum-length common subsequence as explicit `(i, j)` index pairs.
///
/// Materialises the full DP matrix and reconstructs by walking it back,
/// preferring the upper cell on ties, which yields the pair set a standard
/// row-by-row DP produces.
pub fn lcs_pairs<A, B, F>(a: &[A], b: &[B], eq: F) -> Vec<(usize, usize)>
where
    F: Fn(&A, &B) -> bool,
{
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return Vec::new();
    }

    let mut dp = vec![0usize; (n + 1) * (m + 1)];
    let at = |i: usize, j: usize| i * (m + 1) + j;
    for i in 1..=n {
        for j in 1..=m {
            dp[at(i, j)] = if eq(&a[i - 1], &b[j - 1]) {
                dp[at(i - 1, j - 1)] + 1
            } else {
                dp[at(i - 1, j)].max(dp[at(i, j - 1)])
            };
        }
    }

    let mut pairs = Vec::with_capacity(dp[at(n, m)]);
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        if eq(&a[i - 1], &b[j - 1]) && dp[at(i, j)] == dp[at(i - 1, j - 1)] + 1 {
            pairs.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if dp[at(i - 1, j)] >= dp[at(i, j - 1)] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    pairs.reverse();
    pairs
}

/// LCS length restricted to index pairs with `|i - j| <= window`.
///
/// Only the band diagonals are evaluated, bounding the cost to
/// `O(window * (|a| + |b|))`. The result never exceeds the exact LCS
/// length; it is used as a fallback when the exact DP would be too
/// expensive.
pub fn lcs_approx_length<A, B, F>(a: &[A], b: &[B], eq: F, window: usize) -> usize
where
    F: Fn(&A, &B) -> bool,
{
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return 0;
    }

    // Cells outside the band are column-constant (below) or row-constant
    // (right of it), so carrying the band edges one cell outward keeps the
    // recurrence exact within the band.
    let mut prev = vec![0usize; m + 1];
    let mut cur = vec![0usize; m + 1];
    for r in 1..=n {
        let lo = r.saturating_sub(window).max(1);
        let hi = (r + window).min(m);
        if lo > hi {
            // Window shifted past the end of `b`; the row degenerates.
            cur[m] = prev[m];
            std::mem::swap(&mut prev, &mut cur);
            continue;
        }
        cur[lo - 1] = prev[lo - 1];
        for j in lo..=hi {
            cur[j] = if eq(&a[r - 1], &b[j - 1]) {
                prev[j - 1] + 1
            } else {
                prev[j].max(cur[j - 1])
            };
        }
        if hi < m {
            cur[hi + 1] = cur[hi];
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[(n + window).min(m)]
}
