//! Supervisor around the external isolation binary.
//!
//! One supervisor instance owns one sandbox slot (`box-id`). The slot is
//! initialized eagerly on construction and released on drop, whatever
//! happened in between.

use super::{SandboxError, SandboxLimits, SandboxResult, SandboxStatus};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub struct IsolateSandbox {
    box_id: u64,
    isolate_bin: String,
    temp_dir: PathBuf,
    meta_file: PathBuf,
    /// Root directory reported by the sandbox binary on init.
    box_root: PathBuf,
    /// Outer watchdog override used by tests.
    watchdog_override: Option<Duration>,
    cleaned: bool,
}

impl IsolateSandbox {
    /// Initialize the sandbox slot `box_id`.
    ///
    /// Creates the per-box temp directory and runs the init command of
    /// the sandbox binary. On failure the temp directory is scrubbed
    /// before the error propagates.
    pub async fn new(
        box_id: u64,
        isolate_bin: &str,
        temp_root: &Path,
    ) -> Result<IsolateSandbox, SandboxError> {
        let temp_dir = temp_root.join(box_id.to_string());
        tokio::fs::create_dir_all(&temp_dir).await.map_err(|e| {
            SandboxError::Failed(format!(
                "failed to create directory for the sandbox meta file: {e}"
            ))
        })?;

        let mut sandbox = IsolateSandbox {
            box_id,
            isolate_bin: isolate_bin.to_owned(),
            meta_file: temp_dir.join("meta.log"),
            temp_dir,
            box_root: PathBuf::new(),
            watchdog_override: None,
            cleaned: false,
        };

        match sandbox.init().await {
            Ok(()) => Ok(sandbox),
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&sandbox.temp_dir).await;
                sandbox.cleaned = true;
                Err(e)
            }
        }
    }

    async fn init(&mut self) -> Result<(), SandboxError> {
        tracing::debug!(box_id = self.box_id, "initializing sandbox");
        let output = Command::new(&self.isolate_bin)
            .arg("--cg")
            .arg(format!("--box-id={}", self.box_id))
            .arg("--init")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(SandboxError::Failed(format!(
                "sandbox init failed with {}",
                output.status
            )));
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if path.is_empty() {
            return Err(SandboxError::Failed(
                "sandbox init did not report its box directory".into(),
            ));
        }
        self.box_root = PathBuf::from(path);
        tracing::debug!(box_id = self.box_id, box_root = %self.box_root.display(), "sandbox initialized");
        Ok(())
    }

    pub fn box_id(&self) -> u64 {
        self.box_id
    }

    /// Directory the sandboxed program sees as its working tree.
    pub fn box_dir(&self) -> PathBuf {
        self.box_root.join("box")
    }

    #[cfg(test)]
    pub(crate) fn set_watchdog(&mut self, timeout: Duration) {
        self.watchdog_override = Some(timeout);
    }

    /// Outer kill timeout: generously above the sandbox's own limits so
    /// it only fires when the sandbox itself is stuck.
    fn watchdog_timeout(&self, limits: &SandboxLimits) -> Duration {
        if let Some(t) = self.watchdog_override {
            return t;
        }
        let base = limits.cpu_time.max(limits.wall_time);
        Duration::from_secs((1.2 * (base + 300.0)).ceil() as u64)
    }

    /// Command line for one run, mirroring the sandbox binary's flag
    /// grammar.
    fn build_args(&self, binary: &str, args: &[String], limits: &SandboxLimits) -> Vec<String> {
        let mut vargs: Vec<String> = vec![
            "--cg".into(),
            "--cg-timing".into(),
            format!("--box-id={}", self.box_id),
            format!("--cg-mem={}", limits.memory_usage + limits.extra_memory),
            format!("--time={}", limits.cpu_time),
            format!("--wall-time={}", limits.wall_time),
            format!("--extra-time={}", limits.extra_time),
        ];
        if limits.stack_size != 0 {
            vargs.push(format!("--stack={}", limits.stack_size));
        }
        if limits.files_size != 0 {
            vargs.push(format!("--fsize={}", limits.files_size));
        }
        if limits.disk_size != 0 {
            vargs.push(format!("--quota={},{}", limits.disk_size, limits.disk_files));
        }
        if !limits.stdin.is_empty() {
            vargs.push(format!("--stdin={}", limits.stdin));
        }
        if !limits.stdout.is_empty() {
            vargs.push(format!("--stdout={}", limits.stdout));
        }
        if !limits.stderr.is_empty() {
            vargs.push(format!("--stderr={}", limits.stderr));
        }
        if !limits.chdir.is_empty() {
            // The nominal box root sits one level below the process root.
            vargs.push(format!("--chdir=../{}", limits.chdir));
        }
        if limits.processes == 0 {
            vargs.push("--processes".into());
        } else {
            vargs.push(format!("--processes={}", limits.processes));
        }
        if limits.share_net {
            vargs.push("--share-net".into());
        }
        for (key, value) in &limits.environ {
            vargs.push(format!("--env={key}={value}"));
        }
        for dir in &limits.bound_dirs {
            vargs.push(format!(
                "--dir={}={}{}",
                dir.dst,
                dir.src.display(),
                dir.mode.mode_suffix()
            ));
        }
        vargs.push("--dir=etc/alternatives=/etc/alternatives:maybe".into());
        vargs.push(format!("--meta={}", self.meta_file.display()));
        vargs.push("--run".into());
        vargs.push("--".into());
        vargs.push(binary.to_owned());
        vargs.extend(args.iter().cloned());
        vargs
    }

    /// Run `binary` with `args` inside the sandbox under `limits`.
    ///
    /// A watchdog timer guards against the sandbox itself hanging; when
    /// it fires the sandbox process is killed and the run reports a
    /// timeout. Exit code 1 means the supervised program failed (details
    /// are in the meta report); other nonzero codes are internal sandbox
    /// errors.
    pub async fn run(
        &mut self,
        binary: &str,
        args: &[String],
        limits: &SandboxLimits,
    ) -> Result<SandboxResult, SandboxError> {
        let vargs = self.build_args(binary, args, limits);
        tracing::debug!(box_id = self.box_id, "running sandbox");
        tracing::trace!("sandbox argv: {}", vargs.iter().join(" "));

        let mut child = Command::new(&self.isolate_bin)
            .args(&vargs)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let timeout = self.watchdog_timeout(limits);
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(box_id = self.box_id, "watchdog fired, killing the sandbox");
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Ok(SandboxResult {
                    killed: true,
                    status: SandboxStatus::Timeout,
                    message: format!(
                        "sandbox did not finish within {} s and was killed",
                        timeout.as_secs()
                    ),
                    ..Default::default()
                });
            }
        };

        match status.code() {
            Some(0) | Some(1) => {}
            Some(code) => {
                return Err(SandboxError::Failed(format!(
                    "sandbox ran into an internal error, exit code {code}"
                )));
            }
            None => {
                return Err(SandboxError::Failed(
                    "sandbox process was killed by a signal".into(),
                ));
            }
        }

        let meta = tokio::fs::read_to_string(&self.meta_file)
            .await
            .map_err(|e| {
                SandboxError::Failed(format!(
                    "cannot read sandbox meta file {}: {e}",
                    self.meta_file.display()
                ))
            })?;
        tracing::debug!(box_id = self.box_id, "sandbox run finished");
        Ok(SandboxResult::parse_meta(&meta))
    }

    /// Release the sandbox slot and remove the per-box temp directory.
    /// Errors are logged and swallowed; cleanup must not poison the
    /// caller's error path.
    pub async fn close(mut self) {
        tracing::debug!(box_id = self.box_id, "cleaning up sandbox");
        let result = Command::new(&self.isolate_bin)
            .arg("--cg")
            .arg(format!("--box-id={}", self.box_id))
            .arg("--cleanup")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!(box_id = self.box_id, "sandbox cleanup failed: {e}");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.temp_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(box_id = self.box_id, "failed to remove sandbox temp dir: {e}");
            }
        }
        self.cleaned = true;
    }
}

impl Drop for IsolateSandbox {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        // Last resort for paths that never reached `close`.
        let _ = std::process::Command::new(&self.isolate_bin)
            .arg("--cg")
            .arg(format!("--box-id={}", self.box_id))
            .arg("--cleanup")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        let _ = std::fs::remove_dir_all(&self.temp_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// Writes a shell script standing in for the sandbox binary.
    fn fake_isolate(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-isolate");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        f.write_all(body.as_bytes()).unwrap();
        drop(f);
        let mut perm = std::fs::metadata(&path).unwrap().permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(&path, perm).unwrap();
        path.display().to_string()
    }

    /// Fake that answers `--init` with a box path and writes a meta file
    /// on `--run`.
    fn scripted_isolate(dir: &Path, meta_body: &str, exit_code: i32) -> String {
        let box_root = dir.join("boxes");
        std::fs::create_dir_all(box_root.join("box")).unwrap();
        let body = format!(
            r#"
case "$*" in
*--init*) echo {box_root}; exit 0 ;;
*--cleanup*) exit 0 ;;
*)
  meta=""
  for arg in "$@"; do
    case "$arg" in --meta=*) meta="${{arg#--meta=}}" ;; esac
  done
  printf '{meta_body}' > "$meta"
  exit {exit_code} ;;
esac
"#,
            box_root = box_root.display(),
        );
        fake_isolate(dir, &body)
    }

    fn limits() -> SandboxLimits {
        SandboxLimits {
            cpu_time: 1.0,
            wall_time: 2.0,
            extra_time: 0.5,
            memory_usage: 60000,
            extra_memory: 4000,
            ..Default::default()
        }
    }

    #[test]
    fn args_basic_shape() {
        let sandbox = IsolateSandbox {
            box_id: 7,
            isolate_bin: "isolate".into(),
            temp_dir: PathBuf::from("/tmp/worker/7"),
            meta_file: PathBuf::from("/tmp/worker/7/meta.log"),
            box_root: PathBuf::from("/var/lib/isolate/7"),
            watchdog_override: None,
            cleaned: true,
        };
        let args = sandbox.build_args("/usr/bin/env", &["true".into()], &limits());
        assert_eq!(
            args,
            vec![
                "--cg",
                "--cg-timing",
                "--box-id=7",
                "--cg-mem=64000",
                "--time=1",
                "--wall-time=2",
                "--extra-time=0.5",
                "--processes",
                "--dir=etc/alternatives=/etc/alternatives:maybe",
                "--meta=/tmp/worker/7/meta.log",
                "--run",
                "--",
                "/usr/bin/env",
                "true",
            ]
        );
    }

    #[test]
    fn args_full_shape() {
        let sandbox = IsolateSandbox {
            box_id: 0,
            isolate_bin: "isolate".into(),
            temp_dir: PathBuf::from("/tmp/worker/0"),
            meta_file: PathBuf::from("/tmp/worker/0/meta.log"),
            box_root: PathBuf::from("/var/lib/isolate/0"),
            watchdog_override: None,
            cleaned: true,
        };
        let mut l = limits();
        l.stack_size = 50000;
        l.files_size = 1024;
        l.disk_size = 50;
        l.disk_files = 7;
        l.processes = 4;
        l.share_net = true;
        l.stdin = "input.txt".into();
        l.stdout = "output.txt".into();
        l.stderr = "error.txt".into();
        l.chdir = "evals".into();
        l.environ.insert("PATH".into(), "/usr/bin".into());
        l.bound_dirs.push(super::super::BoundDir {
            src: "/usr/share".into(),
            dst: "share".into(),
            mode: "MAYBE,RW".parse().unwrap(),
        });

        let args = sandbox.build_args("prog", &[], &l);
        assert!(args.contains(&"--stack=50000".to_string()));
        assert!(args.contains(&"--fsize=1024".to_string()));
        assert!(args.contains(&"--quota=50,7".to_string()));
        assert!(args.contains(&"--stdin=input.txt".to_string()));
        assert!(args.contains(&"--stdout=output.txt".to_string()));
        assert!(args.contains(&"--stderr=error.txt".to_string()));
        assert!(args.contains(&"--chdir=../evals".to_string()));
        assert!(args.contains(&"--processes=4".to_string()));
        assert!(args.contains(&"--share-net".to_string()));
        assert!(args.contains(&"--env=PATH=/usr/bin".to_string()));
        // Flag order within a bound dir is canonical.
        assert!(args.contains(&"--dir=share=/usr/share:rw:maybe".to_string()));
    }

    #[test]
    fn args_zero_quota_omitted() {
        let sandbox = IsolateSandbox {
            box_id: 1,
            isolate_bin: "isolate".into(),
            temp_dir: PathBuf::from("/tmp/worker/1"),
            meta_file: PathBuf::from("/tmp/worker/1/meta.log"),
            box_root: PathBuf::new(),
            watchdog_override: None,
            cleaned: true,
        };
        let args = sandbox.build_args("prog", &[], &limits());
        assert!(!args.iter().any(|a| a.starts_with("--quota")));
        assert!(args.contains(&"--processes".to_string()));
    }

    #[tokio::test]
    async fn init_run_and_meta_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let bin = scripted_isolate(
            dir.path(),
            "time:0.1\\ntime-wall:0.2\\nstatus:RE\\nexitcode:3\\n",
            1,
        );
        let mut sandbox = IsolateSandbox::new(3, &bin, dir.path()).await.unwrap();
        let result = sandbox.run("prog", &[], &limits()).await.unwrap();
        assert_eq!(result.status, SandboxStatus::RuntimeError);
        assert_eq!(result.exitcode, 3);
        assert!(!result.killed);
        sandbox.close().await;
    }

    #[tokio::test]
    async fn internal_error_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let bin = scripted_isolate(dir.path(), "exitcode:0\\n", 2);
        let mut sandbox = IsolateSandbox::new(4, &bin, dir.path()).await.unwrap();
        let err = sandbox.run("prog", &[], &limits()).await;
        assert!(matches!(err, Err(SandboxError::Failed(_))));
        sandbox.close().await;
    }

    #[tokio::test]
    async fn watchdog_kills_hung_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let box_root = dir.path().join("boxes");
        std::fs::create_dir_all(box_root.join("box")).unwrap();
        let body = format!(
            r#"
case "$*" in
*--init*) echo {}; exit 0 ;;
*--cleanup*) exit 0 ;;
*) sleep 60 ;;
esac
"#,
            box_root.display()
        );
        let bin = fake_isolate(dir.path(), &body);
        let mut sandbox = IsolateSandbox::new(5, &bin, dir.path()).await.unwrap();
        sandbox.set_watchdog(Duration::from_millis(200));
        let result = sandbox.run("prog", &[], &limits()).await.unwrap();
        assert_eq!(result.status, SandboxStatus::Timeout);
        assert!(result.killed);
        sandbox.close().await;
    }

    #[tokio::test]
    async fn temp_dir_removed_on_close_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let bin = scripted_isolate(dir.path(), "exitcode:0\\n", 0);

        let sandbox = IsolateSandbox::new(6, &bin, dir.path()).await.unwrap();
        let temp = sandbox.temp_dir.clone();
        assert!(temp.exists());
        sandbox.close().await;
        assert!(!temp.exists());

        let sandbox = IsolateSandbox::new(6, &bin, dir.path()).await.unwrap();
        let temp = sandbox.temp_dir.clone();
        assert!(temp.exists());
        drop(sandbox);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn failed_init_scrubs_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_isolate(dir.path(), "exit 1");
        let err = IsolateSandbox::new(8, &bin, dir.path()).await;
        assert!(err.is_err());
        assert!(!dir.path().join("8").exists());
    }

    #[test]
    fn watchdog_timeout_formula() {
        let sandbox = IsolateSandbox {
            box_id: 0,
            isolate_bin: "isolate".into(),
            temp_dir: PathBuf::new(),
            meta_file: PathBuf::new(),
            box_root: PathBuf::new(),
            watchdog_override: None,
            cleaned: true,
        };
        let mut l = SandboxLimits::default();
        l.cpu_time = 1.0;
        l.wall_time = 1.0;
        assert_eq!(sandbox.watchdog_timeout(&l), Duration::from_secs(362));
        l.wall_time = 100.0;
        assert_eq!(sandbox.watchdog_timeout(&l), Duration::from_secs(480));
    }
}
