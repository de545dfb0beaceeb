//! Token-based output judge.
//!
//! Compares a candidate output file against a reference file line by
//! line and produces an error score scaled into the judge's integer
//! result range.

pub mod compare;
pub mod lcs;
pub mod reader;

pub use compare::{LineComparator, LineScore, Mismatch, TokenComparator};
pub use reader::{Reader, ReaderError, ReaderOptions, TokenRef};

use std::path::Path;

/// Switches of a judge run.
#[derive(Debug, Clone, Copy)]
pub struct JudgeOptions {
    /// Compare lines as token multisets instead of sequences.
    pub shuffled: bool,
    /// Compare numeric tokens by value.
    pub numeric: bool,
    /// Relative tolerance for float comparison.
    pub float_tolerance: f64,
    /// Case-insensitive token comparison.
    pub ignore_case: bool,
    /// Skip empty lines on both sides.
    pub ignore_empty_lines: bool,
    /// Elide lines starting with `#`.
    pub allow_comments: bool,
    /// Treat the whole file as one line of tokens.
    pub ignore_line_ends: bool,
    /// Interior size above which the ordered comparison switches to the
    /// banded LCS.
    pub approx_lcs_max_window: usize,
    /// Collect per-token mismatch records.
    pub log: bool,
}

impl Default for JudgeOptions {
    fn default() -> Self {
        JudgeOptions {
            shuffled: false,
            numeric: false,
            float_tolerance: 0.0,
            ignore_case: false,
            ignore_empty_lines: true,
            allow_comments: false,
            ignore_line_ends: false,
            approx_lcs_max_window: 2048,
            log: false,
        }
    }
}

/// Aggregated verdict over both files.
#[derive(Debug, Clone, Default)]
pub struct JudgeVerdict {
    /// Total error count over all compared lines.
    pub errors: usize,
    /// Total token count over both files.
    pub total: usize,
    /// Any line comparison fell back to the banded LCS.
    pub approx: bool,
    /// Mismatch records of all lines (logging mode only).
    pub mismatches: Vec<Mismatch>,
}

impl JudgeVerdict {
    pub fn matches(&self) -> bool {
        self.errors == 0
    }

    /// Error score scaled to the judge's integer result range.
    pub fn result(&self) -> u32 {
        compare::scale_result(self.errors, self.total)
    }
}

/// Judge `candidate` against `reference`, comparing line by line.
///
/// When the files have different line counts, every token on a leftover
/// line counts as one error.
pub fn judge_files(
    reference: &Path,
    candidate: &Path,
    opts: &JudgeOptions,
) -> Result<JudgeVerdict, ReaderError> {
    let reader_opts = ReaderOptions {
        ignore_empty_lines: opts.ignore_empty_lines,
        allow_comments: opts.allow_comments,
        ignore_line_ends: opts.ignore_line_ends,
    };
    let mut ref_reader = Reader::open(reference, reader_opts)?;
    let mut cand_reader = Reader::open(candidate, reader_opts)?;
    ref_reader.populate();
    cand_reader.populate();

    let token_cmp = TokenComparator::new(opts.ignore_case, opts.numeric, opts.float_tolerance);
    let line_cmp = LineComparator::new(token_cmp, opts.shuffled, opts.approx_lcs_max_window);

    let mut verdict = JudgeVerdict::default();
    loop {
        let ref_line = ref_reader.read_line();
        let cand_line = cand_reader.read_line();
        let score = match (&ref_line, &cand_line) {
            (None, None) => break,
            (Some(line), None) | (None, Some(line)) => {
                // Leftover line on one side only.
                let mut score = LineScore {
                    errors: line.len(),
                    total: line.len(),
                    ..Default::default()
                };
                if opts.log {
                    let diff = if ref_line.is_some() { 1 } else { -1 };
                    for i in 0..line.len() {
                        score.mismatches.push(Mismatch {
                            token: line.token_str(i).into_owned(),
                            diff,
                            line: line.line_number(),
                            column: Some(line.tokens()[i].column),
                        });
                    }
                }
                score
            }
            (Some(r), Some(c)) => {
                if opts.log {
                    line_cmp.compare_and_log(r, c)
                } else {
                    line_cmp.compare(r, c)
                }
            }
        };

        verdict.errors += score.errors;
        verdict.total += score.total;
        verdict.approx |= score.approx;
        verdict.mismatches.extend(score.mismatches);
    }
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn identical_files_match() {
        let a = write_file("1 2 3\nfoo bar\n");
        let b = write_file("1 2 3\nfoo bar\n");
        let verdict = judge_files(a.path(), b.path(), &JudgeOptions::default()).unwrap();
        assert!(verdict.matches());
        assert_eq!(verdict.result(), 0);
    }

    #[test]
    fn leftover_lines_count_all_tokens() {
        let a = write_file("a b\nc d\n");
        let b = write_file("a b\n");
        let verdict = judge_files(a.path(), b.path(), &JudgeOptions::default()).unwrap();
        assert_eq!(verdict.errors, 2);
        assert_eq!(verdict.total, 6);
        assert!(!verdict.matches());
    }

    #[test]
    fn shuffled_numeric_end_to_end() {
        let a = write_file("3 4 hello 2.0\n");
        let b = write_file("2 4 hello 3.00\n");
        let opts = JudgeOptions {
            shuffled: true,
            numeric: true,
            ..Default::default()
        };
        let verdict = judge_files(a.path(), b.path(), &opts).unwrap();
        assert!(verdict.matches());
    }

    #[test]
    fn logging_collects_mismatches_across_lines() {
        let a = write_file("a\nb\n");
        let b = write_file("a\nc\nd\n");
        let opts = JudgeOptions {
            log: true,
            ..Default::default()
        };
        let verdict = judge_files(a.path(), b.path(), &opts).unwrap();
        assert_eq!(verdict.errors, 3);
        assert_eq!(verdict.mismatches.len(), 3);
        assert_eq!(verdict.mismatches[2].token, "d");
        assert_eq!(verdict.mismatches[2].diff, -1);
    }
}
