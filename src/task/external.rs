//! Sandboxed task execution.
//!
//! An external task resolves its limits against the worker defaults,
//! binds the job working directory into the sandbox and hands the
//! command to the supervisor. Afterwards the redirected output files are
//! captured (bounded) for the task result and carbon-copied into the
//! results directory.

use super::TaskDef;
use crate::sandbox::{BoundDir, DirPerm, IsolateSandbox, SandboxError, SandboxLimits, SandboxResult};
use crate::util;
use std::path::{Path, PathBuf};

/// Name under which the job working directory is bound into the sandbox.
pub const EVAL_DIR: &str = "evals";

/// Size caps for captured and carbon-copied output.
#[derive(Debug, Clone, Copy)]
pub struct OutputLimits {
    pub max_output_length: usize,
    pub max_carboncopy_length: usize,
}

/// What a finished sandboxed task left behind.
pub struct ExternalOutput {
    pub result: SandboxResult,
    /// Bounded stdout/stderr prefix for the task result record.
    pub output: String,
}

/// Resolve the effective limits of `def`, with the working directory
/// bound read-write inside the sandbox and the working directory as the
/// default chdir.
pub fn effective_limits(def: &TaskDef, defaults: &SandboxLimits, work_dir: &Path) -> SandboxLimits {
    let mut limits = def
        .sandbox
        .as_ref()
        .map(|o| o.resolve(defaults))
        .unwrap_or_else(|| defaults.clone());
    limits.bound_dirs.push(BoundDir {
        src: work_dir.to_owned(),
        dst: EVAL_DIR.to_owned(),
        mode: DirPerm::RW,
    });
    if limits.chdir.is_empty() {
        limits.chdir = EVAL_DIR.to_owned();
    }
    limits
}

/// Locate a redirect file outside the sandbox.
///
/// Files are written relative to the sandbox working directory, which is
/// the bound job directory unless the task chose another chdir; fall back
/// to the box root tree for the latter.
fn redirect_path(name: &str, work_dir: &Path, box_dir: &Path) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    let in_work = work_dir.join(name);
    if in_work.exists() {
        return Some(in_work);
    }
    let in_box = box_dir.join(name);
    in_box.exists().then_some(in_box)
}

/// Run one sandboxed task.
pub async fn run_external(
    def: &TaskDef,
    defaults: &SandboxLimits,
    sandbox: &mut IsolateSandbox,
    work_dir: &Path,
    results_dir: &Path,
    caps: OutputLimits,
) -> Result<ExternalOutput, SandboxError> {
    let limits = effective_limits(def, defaults, work_dir);
    let result = sandbox.run(&def.cmd.bin, &def.cmd.args, &limits).await?;

    let box_dir = sandbox.box_dir();
    let mut output = String::new();
    for name in [&limits.stdout, &limits.stderr] {
        let Some(path) = redirect_path(name, work_dir, &box_dir) else {
            continue;
        };
        let remaining = caps.max_output_length.saturating_sub(output.len());
        output.push_str(&util::read_prefix(&path, remaining).await);

        // Carbon copy for the result bundle, truncated independently.
        let copy = util::read_prefix(&path, caps.max_carboncopy_length).await;
        let target = results_dir.join(format!("{}.{}", def.task_id, name.replace('/', "_")));
        if let Err(e) = tokio::fs::write(&target, copy).await {
            tracing::warn!(task_id = %def.task_id, "cannot carbon-copy {name}: {e}");
        }
    }

    Ok(ExternalOutput { result, output })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CommandSpec, TaskKind};
    use pretty_assertions::assert_eq;

    fn execute_def(stdout: &str) -> TaskDef {
        TaskDef {
            task_id: "run".into(),
            kind: TaskKind::Execute,
            cmd: CommandSpec {
                bin: "/usr/bin/solution".into(),
                args: vec![],
            },
            dependencies: vec![],
            priority: 0,
            fatal_failure: false,
            sandbox: Some(crate::sandbox::LimitsOverride {
                cpu_time: Some(2.0),
                stdout: Some(stdout.to_owned()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn effective_limits_bind_the_working_directory() {
        let defaults = SandboxLimits {
            cpu_time: 5.0,
            wall_time: 6.0,
            ..Default::default()
        };
        let def = execute_def("out.txt");
        let limits = effective_limits(&def, &defaults, Path::new("/jobs/42"));
        assert_eq!(limits.cpu_time, 2.0);
        assert_eq!(limits.wall_time, 6.0);
        assert_eq!(limits.stdout, "out.txt");
        assert_eq!(limits.chdir, EVAL_DIR);
        let bind = limits.bound_dirs.last().unwrap();
        assert_eq!(bind.src, Path::new("/jobs/42"));
        assert_eq!(bind.dst, EVAL_DIR);
        assert!(bind.mode.contains(DirPerm::RW));
    }

    #[test]
    fn explicit_chdir_is_kept() {
        let def = TaskDef {
            sandbox: Some(crate::sandbox::LimitsOverride {
                chdir: Some("box".into()),
                ..Default::default()
            }),
            ..execute_def("")
        };
        let limits = effective_limits(&def, &SandboxLimits::default(), Path::new("/w"));
        assert_eq!(limits.chdir, "box");
    }

    #[test]
    fn redirect_path_prefers_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let boxd = dir.path().join("box");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::create_dir_all(&boxd).unwrap();
        std::fs::write(work.join("out.txt"), b"w").unwrap();
        std::fs::write(boxd.join("out.txt"), b"b").unwrap();
        std::fs::write(boxd.join("only-box.txt"), b"b").unwrap();

        assert_eq!(
            redirect_path("out.txt", &work, &boxd).unwrap(),
            work.join("out.txt")
        );
        assert_eq!(
            redirect_path("only-box.txt", &work, &boxd).unwrap(),
            boxd.join("only-box.txt")
        );
        assert!(redirect_path("missing.txt", &work, &boxd).is_none());
        assert!(redirect_path("", &work, &boxd).is_none());
    }
}
