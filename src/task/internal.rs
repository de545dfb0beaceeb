//! Trusted in-process task operations.
//!
//! These run directly in the worker with the job working directory as
//! their root; every path argument is resolved inside it and may not
//! escape.

use super::{TaskDef, TaskKind};
use crate::util::{self, archive};
use anyhow::{bail, Context, Result};
use std::path::Path;

/// Run one internal task inside `work_dir`.
pub async fn run_internal(def: &TaskDef, work_dir: &Path) -> Result<()> {
    let args = &def.cmd.args;
    match def.kind {
        TaskKind::Copy => {
            let (src, dst) = two_args(args)?;
            let src = util::resolve_inside(work_dir, src)?;
            let dst = util::resolve_inside(work_dir, dst)?;
            let meta = tokio::fs::metadata(&src)
                .await
                .with_context(|| format!("cannot stat {}", src.display()))?;
            if meta.is_dir() {
                util::copy_dir_all(&src, &dst).await?;
            } else {
                if let Some(parent) = dst.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&src, &dst).await?;
            }
        }
        TaskKind::Mkdir => {
            let path = one_arg(args)?;
            let path = util::resolve_inside(work_dir, path)?;
            tokio::fs::create_dir_all(&path).await?;
        }
        TaskKind::Rename => {
            let (from, to) = two_args(args)?;
            let from = util::resolve_inside(work_dir, from)?;
            let to = util::resolve_inside(work_dir, to)?;
            tokio::fs::rename(&from, &to)
                .await
                .with_context(|| format!("cannot rename {} to {}", from.display(), to.display()))?;
        }
        TaskKind::Remove => {
            let path = one_arg(args)?;
            let path = util::resolve_inside(work_dir, path)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await?,
                Ok(_) => tokio::fs::remove_file(&path).await?,
                // A missing target is already removed.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        TaskKind::Archive => {
            let (dir, archive_name) = two_args(args)?;
            let dir = util::resolve_inside(work_dir, dir)?;
            let dst = util::resolve_inside(work_dir, archive_name)?;
            archive::pack_tar_gz(&dir, &dst)
                .await
                .with_context(|| format!("cannot archive {}", dir.display()))?;
        }
        TaskKind::Extract => {
            let (archive_name, dir) = two_args(args)?;
            let src = util::resolve_inside(work_dir, archive_name)?;
            let dst = util::resolve_inside(work_dir, dir)?;
            archive::unpack_tar_gz(&src, &dst)
                .await
                .with_context(|| format!("cannot extract {}", src.display()))?;
        }
        TaskKind::Execute => bail!("sandboxed tasks are not internal"),
    }
    Ok(())
}

fn one_arg(args: &[String]) -> Result<&str> {
    match args {
        [a] => Ok(a),
        _ => bail!("expected exactly 1 argument, got {}", args.len()),
    }
}

fn two_args(args: &[String]) -> Result<(&str, &str)> {
    match args {
        [a, b] => Ok((a, b)),
        _ => bail!("expected exactly 2 arguments, got {}", args.len()),
    }
}
