//! Tar helpers for moving file trees in and out of containers.

pub use tar;

use crate::log::trace;
use crate::{err, ErrContext, Error, Result};

use std::io::Read;
use std::path::Path;

/// Creates a tar archive from an iterator of entries consisting of a path and
/// the content of the entry corresponding to the path.
pub fn create_tarball<'archive, E, P>(entries: E) -> Result<Vec<u8>>
where
    E: Iterator<Item = (P, &'archive [u8])>,
    P: AsRef<Path>,
{
    let archive_buf = Vec::new();
    let mut archive = tar::Builder::new(archive_buf);

    for entry in entries {
        let path = entry.0.as_ref();
        let size = entry.1.len() as u64;
        trace!("adding '{}' to archive, size: {}", path.display(), size);
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_cksum();
        archive.append_data(&mut header, path, entry.1)?;
    }

    archive.finish()?;

    archive.into_inner().context("failed to create tar archive")
}

/// Archives a directory tree rooted at `dir`, entry paths relative to it.
pub fn tar_directory(dir: &Path) -> Result<Vec<u8>> {
    let archive_buf = Vec::new();
    let mut archive = tar::Builder::new(archive_buf);
    archive
        .append_dir_all(".", dir)
        .with_context(|| format!("failed to archive `{}`", dir.display()))?;
    archive.finish()?;
    archive.into_inner().context("failed to create tar archive")
}

/// Unpacks a given tar archive to the path specified by `output_dir`.
pub fn unpack_tarball<T: Read, P: AsRef<Path>>(
    archive: &mut tar::Archive<T>,
    output_dir: P,
) -> Result<()> {
    let output_dir = output_dir.as_ref();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if let tar::EntryType::Regular = entry.header().entry_type() {
            let path = entry.header().path()?.to_path_buf();
            trace!("unpacking {}", path.display());
            let name = path.file_name().unwrap_or_default();

            entry.unpack(output_dir.join(name))?;
        }
    }

    Ok(())
}

/// Reads the first regular file of a tar stream as a UTF-8 string. Both
/// daemons return single-file copies wrapped in a tar archive.
pub fn first_entry_as_string(tar_bytes: &[u8]) -> Result<String> {
    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if let tar::EntryType::Regular = entry.header().entry_type() {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .context("file content is not valid utf-8")?;
            return Ok(content);
        }
    }
    err!("archive contains no regular file")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tarball_roundtrip() {
        let entries: Vec<(&Path, &[u8])> = vec![
            (Path::new("script.sh"), b"echo hello\n".as_ref()),
            (Path::new("secrets.sh"), b"export TOKEN=t\n".as_ref()),
        ];
        let tarball = create_tarball(entries.into_iter()).unwrap();

        let content = first_entry_as_string(&tarball).unwrap();
        assert_eq!(content, "echo hello\n");
    }

    #[test]
    fn first_entry_fails_on_empty_archive() {
        let mut builder = tar::Builder::new(Vec::new());
        builder.finish().unwrap();
        let bytes = builder.into_inner().unwrap();
        assert!(first_entry_as_string(&bytes).is_err());
    }
}
