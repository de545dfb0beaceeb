//! Sandbox limits, results and the supervisor driving the external
//! isolation binary.

pub mod isolate;

pub use isolate::IsolateSandbox;

use err_derive::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(display = "sandbox error: {}", _0)]
    Failed(String),

    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),
}

/// Permission flags of a bound directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirPerm(u8);

impl DirPerm {
    pub const RW: DirPerm = DirPerm(1);
    pub const NOEXEC: DirPerm = DirPerm(1 << 1);
    pub const FS: DirPerm = DirPerm(1 << 2);
    pub const MAYBE: DirPerm = DirPerm(1 << 3);
    pub const DEV: DirPerm = DirPerm(1 << 4);

    pub fn contains(self, other: DirPerm) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: DirPerm) -> DirPerm {
        DirPerm(self.0 | other.0)
    }

    /// Flag suffix in the canonical order the sandbox binary expects.
    pub fn mode_suffix(self) -> String {
        let mut out = String::new();
        for (flag, name) in [
            (DirPerm::RW, ":rw"),
            (DirPerm::NOEXEC, ":noexec"),
            (DirPerm::FS, ":fs"),
            (DirPerm::MAYBE, ":maybe"),
            (DirPerm::DEV, ":dev"),
        ] {
            if self.contains(flag) {
                out.push_str(name);
            }
        }
        out
    }
}

impl FromStr for DirPerm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut perm = DirPerm::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            perm = perm.union(match part.to_ascii_uppercase().as_str() {
                "RW" => DirPerm::RW,
                "NOEXEC" => DirPerm::NOEXEC,
                "FS" => DirPerm::FS,
                "MAYBE" => DirPerm::MAYBE,
                "DEV" => DirPerm::DEV,
                other => return Err(format!("unknown directory permission: {other}")),
            });
        }
        Ok(perm)
    }
}

impl<'de> Deserialize<'de> for DirPerm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for DirPerm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let names: Vec<&str> = [
            (DirPerm::RW, "RW"),
            (DirPerm::NOEXEC, "NOEXEC"),
            (DirPerm::FS, "FS"),
            (DirPerm::MAYBE, "MAYBE"),
            (DirPerm::DEV, "DEV"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        serializer.serialize_str(&names.join(","))
    }
}

/// A directory mapped into the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundDir {
    /// Path outside the sandbox.
    pub src: PathBuf,
    /// Path inside the sandbox.
    pub dst: String,
    #[serde(default)]
    pub mode: DirPerm,
}

/// Resource limits and I/O setup of one sandboxed execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SandboxLimits {
    /// CPU time in seconds.
    #[serde(rename = "time")]
    pub cpu_time: f64,
    /// Wall clock time in seconds.
    pub wall_time: f64,
    /// Extra time the sandbox grants past the limit before killing.
    pub extra_time: f64,
    /// Memory limit in KiB.
    #[serde(rename = "memory")]
    pub memory_usage: u64,
    /// Extra memory in KiB added on top of the limit.
    pub extra_memory: u64,
    /// Stack size in KiB; 0 means unlimited.
    pub stack_size: u64,
    /// Maximum size of files the program may create, in KiB; 0 disables
    /// the limit.
    pub files_size: u64,
    /// Maximum number of processes; 0 means unlimited.
    #[serde(rename = "parallel")]
    pub processes: u64,
    /// Disk quota in KiB blocks; 0 disables the quota flag entirely.
    pub disk_size: u64,
    /// Disk quota in inodes.
    pub disk_files: u64,
    /// Give the sandboxed program access to the host network.
    pub share_net: bool,
    /// Environment variables set inside the sandbox.
    #[serde(rename = "environ-variable")]
    pub environ: BTreeMap<String, String>,
    /// Directories bound into the sandbox.
    #[serde(rename = "bound-directories")]
    pub bound_dirs: Vec<BoundDir>,
    /// Standard stream redirection file names (relative to the sandbox
    /// working directory); empty means no redirection.
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    /// Working directory override inside the sandbox.
    pub chdir: String,
}

/// Partial limits of a task recipe; unset fields fall back to the
/// worker-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LimitsOverride {
    #[serde(rename = "time")]
    pub cpu_time: Option<f64>,
    pub wall_time: Option<f64>,
    pub extra_time: Option<f64>,
    #[serde(rename = "memory")]
    pub memory_usage: Option<u64>,
    pub extra_memory: Option<u64>,
    pub stack_size: Option<u64>,
    pub files_size: Option<u64>,
    #[serde(rename = "parallel")]
    pub processes: Option<u64>,
    pub disk_size: Option<u64>,
    pub disk_files: Option<u64>,
    pub share_net: Option<bool>,
    #[serde(rename = "environ-variable")]
    pub environ: Option<BTreeMap<String, String>>,
    #[serde(rename = "bound-directories")]
    pub bound_dirs: Option<Vec<BoundDir>>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub chdir: Option<String>,
}

impl LimitsOverride {
    /// Merge these overrides over the worker defaults.
    pub fn resolve(&self, defaults: &SandboxLimits) -> SandboxLimits {
        let d = defaults.clone();
        SandboxLimits {
            cpu_time: self.cpu_time.unwrap_or(d.cpu_time),
            wall_time: self.wall_time.unwrap_or(d.wall_time),
            extra_time: self.extra_time.unwrap_or(d.extra_time),
            memory_usage: self.memory_usage.unwrap_or(d.memory_usage),
            extra_memory: self.extra_memory.unwrap_or(d.extra_memory),
            stack_size: self.stack_size.unwrap_or(d.stack_size),
            files_size: self.files_size.unwrap_or(d.files_size),
            processes: self.processes.unwrap_or(d.processes),
            disk_size: self.disk_size.unwrap_or(d.disk_size),
            disk_files: self.disk_files.unwrap_or(d.disk_files),
            share_net: self.share_net.unwrap_or(d.share_net),
            environ: self.environ.clone().unwrap_or(d.environ),
            bound_dirs: self.bound_dirs.clone().unwrap_or(d.bound_dirs),
            stdin: self.stdin.clone().unwrap_or(d.stdin),
            stdout: self.stdout.clone().unwrap_or(d.stdout),
            stderr: self.stderr.clone().unwrap_or(d.stderr),
            chdir: self.chdir.clone().unwrap_or(d.chdir),
        }
    }
}

/// Final status reported by the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SandboxStatus {
    /// Program finished normally.
    Ok,
    /// Runtime error (nonzero exit code).
    #[serde(rename = "RE")]
    RuntimeError,
    /// Died by signal.
    #[serde(rename = "SG")]
    Signal,
    /// Exceeded a time limit.
    #[serde(rename = "TO")]
    Timeout,
    /// Internal sandbox error.
    #[serde(rename = "XX")]
    Internal,
    /// No status was reported.
    #[default]
    NotSet,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxStatus::Ok => "OK",
            SandboxStatus::RuntimeError => "RE",
            SandboxStatus::Signal => "SG",
            SandboxStatus::Timeout => "TO",
            SandboxStatus::Internal => "XX",
            SandboxStatus::NotSet => "NOTSET",
        };
        f.write_str(s)
    }
}

/// Measurements and status of one sandboxed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    /// Consumed CPU time in seconds.
    pub time: f64,
    /// Consumed wall clock time in seconds.
    pub wall_time: f64,
    /// Consumed memory in KiB.
    pub memory: u64,
    /// Peak resident set size in KiB.
    pub max_rss: u64,
    /// The program was killed by the sandbox or the supervisor.
    pub killed: bool,
    /// Signal the program died by, if any.
    pub exitsig: i32,
    /// Exit code of the program.
    pub exitcode: i32,
    pub status: SandboxStatus,
    /// Free-text status message from the sandbox.
    pub message: String,
}

impl SandboxResult {
    /// Parse the newline-separated `key:value` meta report written by the
    /// sandbox binary. Unknown keys are ignored; missing fields keep
    /// their defaults.
    pub fn parse_meta(content: &str) -> SandboxResult {
        let mut result = SandboxResult::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                "time" => result.time = value.parse().unwrap_or(0.0),
                "time-wall" => result.wall_time = value.parse().unwrap_or(0.0),
                "killed" => result.killed = true,
                "status" => {
                    result.status = match value {
                        "RE" => SandboxStatus::RuntimeError,
                        "SG" => SandboxStatus::Signal,
                        "TO" => SandboxStatus::Timeout,
                        "XX" => SandboxStatus::Internal,
                        _ => result.status,
                    }
                }
                "message" => result.message = value.to_owned(),
                "exitsig" => result.exitsig = value.parse().unwrap_or(0),
                "exitcode" => result.exitcode = value.parse().unwrap_or(0),
                "cg-mem" => result.memory = value.parse().unwrap_or(0),
                "max-rss" => result.max_rss = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        if result.status == SandboxStatus::NotSet {
            result.status = SandboxStatus::Ok;
        }
        // The killed flag tracks the statuses that imply a forced stop.
        result.killed = matches!(
            result.status,
            SandboxStatus::Timeout | SandboxStatus::Signal
        );
        result
    }

    /// Render the result in the meta report format.
    pub fn to_meta(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("time:{}\n", self.time));
        out.push_str(&format!("time-wall:{}\n", self.wall_time));
        if self.killed {
            out.push_str("killed:1\n");
        }
        if self.status != SandboxStatus::Ok && self.status != SandboxStatus::NotSet {
            out.push_str(&format!("status:{}\n", self.status));
        }
        if !self.message.is_empty() {
            out.push_str(&format!("message:{}\n", self.message));
        }
        if self.exitsig != 0 {
            out.push_str(&format!("exitsig:{}\n", self.exitsig));
        }
        out.push_str(&format!("exitcode:{}\n", self.exitcode));
        out.push_str(&format!("cg-mem:{}\n", self.memory));
        out.push_str(&format!("max-rss:{}\n", self.max_rss));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_meta_full() {
        let meta = "time:0.125\ntime-wall:0.333\nkilled:1\nstatus:TO\n\
                    message:Time limit exceeded\nexitsig:9\nexitcode:0\n\
                    cg-mem:10240\nmax-rss:8192\n";
        let result = SandboxResult::parse_meta(meta);
        assert_eq!(result.time, 0.125);
        assert_eq!(result.wall_time, 0.333);
        assert!(result.killed);
        assert_eq!(result.status, SandboxStatus::Timeout);
        assert_eq!(result.message, "Time limit exceeded");
        assert_eq!(result.exitsig, 9);
        assert_eq!(result.memory, 10240);
        assert_eq!(result.max_rss, 8192);
    }

    #[test]
    fn parse_meta_defaults_and_unknown_keys() {
        let result = SandboxResult::parse_meta("some-future-key:whatever\nexitcode:0\n");
        assert_eq!(result.status, SandboxStatus::Ok);
        assert_eq!(result.time, 0.0);
        assert!(!result.killed);
        assert_eq!(result.message, "");
    }

    #[test]
    fn meta_round_trip() {
        let original = SandboxResult {
            time: 1.5,
            wall_time: 2.25,
            memory: 4096,
            max_rss: 2048,
            killed: true,
            exitsig: 11,
            exitcode: 0,
            status: SandboxStatus::Signal,
            message: "Caught fatal signal 11".into(),
        };
        let parsed = SandboxResult::parse_meta(&original.to_meta());
        assert_eq!(parsed, original);
    }

    #[test]
    fn killed_follows_status() {
        // A stray killed flag without a forced-stop status is dropped.
        let result = SandboxResult::parse_meta("killed:1\nstatus:RE\nexitcode:2\n");
        assert!(!result.killed);
        assert_eq!(result.status, SandboxStatus::RuntimeError);

        let result = SandboxResult::parse_meta("status:SG\nexitsig:9\n");
        assert!(result.killed);
    }

    #[test]
    fn dir_perm_parse_and_suffix() {
        let perm: DirPerm = "RW,MAYBE".parse().unwrap();
        assert!(perm.contains(DirPerm::RW));
        assert!(perm.contains(DirPerm::MAYBE));
        assert!(!perm.contains(DirPerm::DEV));
        assert_eq!(perm.mode_suffix(), ":rw:maybe");
        assert_eq!("".parse::<DirPerm>().unwrap(), DirPerm::default());
        assert!("JUNK".parse::<DirPerm>().is_err());
    }

    #[test]
    fn limits_override_resolution() {
        let defaults = SandboxLimits {
            cpu_time: 5.0,
            wall_time: 6.0,
            memory_usage: 60000,
            ..Default::default()
        };
        let over = LimitsOverride {
            cpu_time: Some(1.0),
            stdout: Some("out.txt".into()),
            ..Default::default()
        };
        let resolved = over.resolve(&defaults);
        assert_eq!(resolved.cpu_time, 1.0);
        assert_eq!(resolved.wall_time, 6.0);
        assert_eq!(resolved.memory_usage, 60000);
        assert_eq!(resolved.stdout, "out.txt");
    }
}
