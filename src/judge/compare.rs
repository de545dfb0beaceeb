//! Token and line comparators of the output judge.
//!
//! Lines are compared either in order (common prefix/suffix shortcut and
//! an LCS over the trimmed interior, with a banded approximation for
//! pathological inputs) or as multisets of tokens bucketed by inferred
//! type (integer, float, string).

use super::lcs::{lcs_approx_length, lcs_length, lcs_pairs};
use super::reader::Line;
use std::collections::BTreeMap;

/// Numbers longer than this are never treated as numeric tokens.
const MAX_NUMERIC_LEN: usize = 32;

/// Parse `token` as a signed integer; the entire content must match.
fn try_get_int(token: &str) -> Option<i64> {
    token.parse::<i64>().ok()
}

/// Parse `token` as a finite double; the entire content must match.
fn try_get_double(token: &str) -> Option<f64> {
    match token.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

/// Reclassify a float whose value is exactly integral and fits the
/// integer range.
fn integral_float(v: f64) -> Option<i64> {
    if v.trunc() == v && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

/// Token equality under configurable case, numeric and tolerance rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenComparator {
    pub ignore_case: bool,
    pub numeric: bool,
    pub float_tolerance: f64,
}

impl TokenComparator {
    pub fn new(ignore_case: bool, numeric: bool, float_tolerance: f64) -> Self {
        TokenComparator {
            ignore_case,
            numeric,
            float_tolerance,
        }
    }

    /// Relative float equality; the divisor floor prevents a zero
    /// denominator when both values are zero.
    pub fn floats_equal(&self, x: f64, y: f64) -> bool {
        let divisor = (x.abs() + y.abs()).max(self.float_tolerance.max(0.0001));
        (x - y).abs() / divisor <= self.float_tolerance
    }

    pub fn compare(&self, t1: &str, t2: &str) -> bool {
        if self.numeric && t1.len() < MAX_NUMERIC_LEN && t2.len() < MAX_NUMERIC_LEN {
            if let (Some(i1), Some(i2)) = (try_get_int(t1), try_get_int(t2)) {
                return i1 == i2;
            }
            if let (Some(d1), Some(d2)) = (try_get_double(t1), try_get_double(t2)) {
                return self.floats_equal(d1, d2);
            }
        }

        if self.ignore_case {
            t1.eq_ignore_ascii_case(t2)
        } else {
            t1 == t2
        }
    }
}

/// Inferred type of a token in shuffled mode.
#[derive(Debug, Clone, PartialEq)]
enum TokenValue {
    Int(i64),
    Float(f64),
    Str(String),
}

fn classify(token: &str, numeric: bool) -> TokenValue {
    if numeric && token.len() < MAX_NUMERIC_LEN {
        if let Some(i) = try_get_int(token) {
            return TokenValue::Int(i);
        }
        if let Some(d) = try_get_double(token) {
            return match integral_float(d) {
                Some(i) => TokenValue::Int(i),
                None => TokenValue::Float(d),
            };
        }
    }
    TokenValue::Str(token.to_owned())
}

/// A mismatching token reported in logging mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// Token text (or numeric rendering).
    pub token: String,
    /// Negative: unexpected in the candidate; positive: missing from it.
    pub diff: i64,
    /// 1-based line of the reference line being compared.
    pub line: u32,
    /// 1-based column, when a concrete token position is known.
    pub column: Option<u32>,
}

/// Outcome of comparing one pair of lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineScore {
    /// Raw error count.
    pub errors: usize,
    /// Total number of tokens on both lines.
    pub total: usize,
    /// The ordered comparison fell back to the banded LCS.
    pub approx: bool,
    /// Filled only in logging mode.
    pub mismatches: Vec<Mismatch>,
}

impl LineScore {
    /// Scale the error count into the judge's integer result range.
    pub fn result(&self) -> u32 {
        scale_result(self.errors, self.total)
    }
}

pub(crate) fn scale_result(errors: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let res = u32::MAX as f64 * errors as f64 / total as f64;
    res.round() as u32
}

/// Compares two lines of tokens.
pub struct LineComparator {
    token_cmp: TokenComparator,
    shuffled: bool,
    approx_window: usize,
}

impl LineComparator {
    pub fn new(token_cmp: TokenComparator, shuffled: bool, approx_window: usize) -> Self {
        LineComparator {
            token_cmp,
            shuffled,
            approx_window,
        }
    }

    pub fn compare(&self, reference: &Line, candidate: &Line) -> LineScore {
        self.compare_impl(reference, candidate, false)
    }

    /// Like [`compare`](Self::compare), but collects per-token mismatch
    /// records for diagnostics.
    pub fn compare_and_log(&self, reference: &Line, candidate: &Line) -> LineScore {
        self.compare_impl(reference, candidate, true)
    }

    fn compare_impl(&self, reference: &Line, candidate: &Line, log: bool) -> LineScore {
        if self.shuffled {
            self.compare_unordered(reference, candidate, log)
        } else {
            self.compare_ordered(reference, candidate, log)
        }
    }

    fn compare_ordered(&self, reference: &Line, candidate: &Line, log: bool) -> LineScore {
        let a = reference.tokens();
        let b = candidate.tokens();
        let eq = |i: usize, j: usize| {
            self.token_cmp
                .compare(&reference.token_str(i), &candidate.token_str(j))
        };

        // Longest common prefix and suffix are matched outright; only the
        // interior goes through the LCS.
        let max_common = a.len().min(b.len());
        let mut prefix = 0;
        while prefix < max_common && eq(prefix, prefix) {
            prefix += 1;
        }
        let mut suffix = 0;
        while suffix < max_common - prefix && eq(a.len() - 1 - suffix, b.len() - 1 - suffix) {
            suffix += 1;
        }

        let inner_a: Vec<usize> = (prefix..a.len() - suffix).collect();
        let inner_b: Vec<usize> = (prefix..b.len() - suffix).collect();
        let idx_eq = |x: &usize, y: &usize| eq(*x, *y);

        let approx =
            self.approx_window > 0 && inner_a.len().min(inner_b.len()) > self.approx_window;
        let mut mismatches = Vec::new();
        let lcs = if approx {
            lcs_approx_length(&inner_a, &inner_b, idx_eq, self.approx_window)
        } else if log {
            let pairs = lcs_pairs(&inner_a, &inner_b, idx_eq);
            let mut matched_a = vec![false; inner_a.len()];
            let mut matched_b = vec![false; inner_b.len()];
            for &(x, y) in &pairs {
                matched_a[x] = true;
                matched_b[y] = true;
            }
            for (x, &i) in inner_a.iter().enumerate() {
                if !matched_a[x] {
                    mismatches.push(Mismatch {
                        token: reference.token_str(i).into_owned(),
                        diff: 1,
                        line: reference.line_number(),
                        column: Some(a[i].column),
                    });
                }
            }
            for (y, &j) in inner_b.iter().enumerate() {
                if !matched_b[y] {
                    mismatches.push(Mismatch {
                        token: candidate.token_str(j).into_owned(),
                        diff: -1,
                        line: reference.line_number(),
                        column: Some(b[j].column),
                    });
                }
            }
            pairs.len()
        } else {
            lcs_length(&inner_a, &inner_b, idx_eq)
        };

        let errors = (inner_a.len() - lcs) + (inner_b.len() - lcs);
        LineScore {
            errors,
            total: a.len() + b.len(),
            approx,
            mismatches,
        }
    }

    fn compare_unordered(&self, reference: &Line, candidate: &Line, log: bool) -> LineScore {
        let numeric = self.token_cmp.numeric;
        let mut strings: BTreeMap<String, i64> = BTreeMap::new();
        let mut ints: BTreeMap<i64, i64> = BTreeMap::new();
        let mut floats: Vec<(f64, i64)> = Vec::new();

        let mut add = |line: &Line, sign: i64| {
            for i in 0..line.len() {
                match classify(&line.token_str(i), numeric) {
                    TokenValue::Int(v) => *ints.entry(v).or_default() += sign,
                    TokenValue::Str(v) => *strings.entry(v).or_default() += sign,
                    TokenValue::Float(v) => {
                        match floats.iter_mut().find(|(f, _)| *f == v) {
                            Some((_, c)) => *c += sign,
                            None => floats.push((v, sign)),
                        }
                    }
                }
            }
        };
        add(reference, 1);
        add(candidate, -1);
        floats.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        if numeric && self.token_cmp.float_tolerance > 0.0 {
            self.match_floats(&mut floats);
            self.match_ints_to_floats(&mut ints, &mut floats);
        }

        let mut errors = 0usize;
        let mut mismatches = Vec::new();
        let mut account = |token: String, count: i64| {
            errors += count.unsigned_abs() as usize;
            if log && count != 0 {
                mismatches.push(Mismatch {
                    token,
                    diff: count,
                    line: reference.line_number(),
                    column: None,
                });
            }
        };
        for (token, count) in &strings {
            account(token.clone(), *count);
        }
        for (value, count) in &ints {
            account(value.to_string(), *count);
        }
        for (value, count) in &floats {
            account(value.to_string(), *count);
        }

        LineScore {
            errors,
            total: reference.len() + candidate.len(),
            approx: false,
            mismatches,
        }
    }

    /// Greedy tolerance matching of leftover floats against each other,
    /// in value order.
    fn match_floats(&self, floats: &mut [(f64, i64)]) {
        for i in 0..floats.len() {
            if floats[i].1 <= 0 {
                continue;
            }
            for j in 0..floats.len() {
                if floats[i].1 == 0 {
                    break;
                }
                if floats[j].1 >= 0 || !self.token_cmp.floats_equal(floats[i].0, floats[j].0) {
                    continue;
                }
                let matched = floats[i].1.min(-floats[j].1);
                floats[i].1 -= matched;
                floats[j].1 += matched;
            }
        }
    }

    /// Greedy tolerance matching of leftover integers against leftover
    /// floats, searching the interval the tolerance rule admits.
    fn match_ints_to_floats(&self, ints: &mut BTreeMap<i64, i64>, floats: &mut [(f64, i64)]) {
        let eps = self.token_cmp.float_tolerance;
        for (&k, count) in ints.iter_mut() {
            if *count == 0 {
                continue;
            }
            let kf = k as f64;
            let bounds = (kf * (1.0 - eps) / (1.0 + eps), kf * (1.0 + eps) / (1.0 - eps));
            let (lo, hi) = if bounds.0 <= bounds.1 {
                bounds
            } else {
                (bounds.1, bounds.0)
            };

            // Closest candidate first.
            let mut candidates: Vec<usize> = (0..floats.len())
                .filter(|&j| {
                    let (v, c) = floats[j];
                    v >= lo && v <= hi && c.signum() == -count.signum()
                })
                .collect();
            candidates
                .sort_by(|&x, &y| (floats[x].0 - kf).abs().partial_cmp(&(floats[y].0 - kf).abs()).unwrap());

            for j in candidates {
                if *count == 0 {
                    break;
                }
                let matched = count.abs().min(floats[j].1.abs());
                *count -= matched * count.signum();
                floats[j].1 -= matched * floats[j].1.signum();
            }
        }
    }
}
