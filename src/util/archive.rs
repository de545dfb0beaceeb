//! Gzipped tar archives for submissions and result bundles.
//!
//! The tar machinery is synchronous, so both operations run on the
//! blocking thread pool.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Pack the contents of `src_dir` into a `.tar.gz` file at `dst_file`.
pub async fn pack_tar_gz(src_dir: &Path, dst_file: &Path) -> io::Result<()> {
    let src_dir = src_dir.to_owned();
    let dst_file = dst_file.to_owned();
    tokio::task::spawn_blocking(move || {
        let file = File::create(&dst_file)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &src_dir)?;
        builder.into_inner()?.finish()?;
        Ok(())
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Unpack a `.tar.gz` (or plain `.tar`) archive into `dst_dir`.
///
/// Entries with absolute paths or `..` components are rejected by the
/// unpacker, so a hostile archive cannot write outside `dst_dir`.
pub async fn unpack_tar_gz(archive: &Path, dst_dir: &Path) -> io::Result<()> {
    let archive = archive.to_owned();
    let dst_dir = dst_dir.to_owned();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dst_dir)?;
        let file = File::open(&archive)?;
        if is_gzip(&archive)? {
            tar::Archive::new(GzDecoder::new(file)).unpack(&dst_dir)
        } else {
            tar::Archive::new(file).unpack(&dst_dir)
        }
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn is_gzip(path: &Path) -> io::Result<bool> {
    use std::io::Read;
    let mut magic = [0u8; 2];
    let n = File::open(path)?.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

/// File name of the archive a URL points at; falls back to `name`.
pub fn archive_name_from_url(url: &str, fallback: &str) -> PathBuf {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let name = trimmed.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        PathBuf::from(fallback)
    } else {
        PathBuf::from(name)
    }
}
