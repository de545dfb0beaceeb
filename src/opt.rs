use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "grader-worker", version, about)]
pub struct Opts {
    #[command(subcommand)]
    pub cmd: SubCmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCmd {
    /// Run as a long-lived worker connected to the broker
    #[command(name = "connect")]
    Connect(ConnectSubCmd),

    /// Judge a candidate output file against a reference file
    #[command(name = "judge")]
    Judge(JudgeSubCmd),
}

#[derive(Args, Debug, Clone)]
pub struct ConnectSubCmd {
    /// Worker configuration file.
    #[arg(long, short, default_value = "config.yml")]
    pub config: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct JudgeSubCmd {
    /// Reference output file.
    pub reference: PathBuf,

    /// Candidate output file produced by the judged program.
    pub candidate: PathBuf,

    /// Compare lines as unordered token multisets.
    #[arg(long, short)]
    pub shuffled: bool,

    /// Compare numeric tokens by value.
    #[arg(long, short)]
    pub numeric: bool,

    /// Relative tolerance for float comparison; implies --numeric.
    #[arg(long, default_value_t = 0.0)]
    pub float_tolerance: f64,

    /// Case-insensitive token comparison.
    #[arg(long, short)]
    pub ignore_case: bool,

    /// Treat lines starting with '#' as comments.
    #[arg(long)]
    pub allow_comments: bool,

    /// Treat newlines as regular whitespace.
    #[arg(long)]
    pub ignore_line_ends: bool,

    /// Compare empty lines too instead of skipping them.
    #[arg(long)]
    pub keep_empty_lines: bool,

    /// Interior size above which the ordered comparison approximates.
    #[arg(long, default_value_t = 2048)]
    pub approx_window: usize,

    /// Print a per-token mismatch report.
    #[arg(long, short)]
    pub verbose: bool,
}
