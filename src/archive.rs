//! In-memory tar archives for moving files in and out of containers.

use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SandboxError};

/// A file to place in the sandbox working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    /// Path relative to the working directory; may contain subdirectories.
    pub name: String,
    pub content: Vec<u8>,
}

impl SandboxFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Build a tar archive holding every file.
pub fn create_archive(files: &[SandboxFile]) -> Result<Vec<u8>> {
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;
    let mut builder = tar::Builder::new(Vec::new());

    for file in files {
        let name = validate_entry_name(&file.name)?;
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(file.content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        builder.append_data(&mut header, name, file.content.as_slice())?;
    }

    Ok(builder.into_inner()?)
}

/// Read local files into an archive, storing each under its remote name.
pub fn archive_local_files(paths: &[(PathBuf, String)]) -> Result<Vec<u8>> {
    create_archive(&read_local_files(paths)?)
}

/// Load local files, naming each after its remote path.
///
/// A missing local file fails with an `Io` error of kind `NotFound`.
pub fn read_local_files(paths: &[(PathBuf, String)]) -> Result<Vec<SandboxFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for (local, remote) in paths {
        let content = std::fs::read(local).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("local file {}: {}", local.display(), e),
            )
        })?;
        files.push(SandboxFile::new(remote.clone(), content));
    }
    Ok(files)
}

/// Extract exactly one regular file from a tar archive.
pub fn extract_file(archive: &[u8], name: &str) -> Result<Vec<u8>> {
    let wanted = normalize(name);
    let not_found = || SandboxError::FileNotFoundInArchive {
        path: name.to_string(),
    };

    let mut reader = tar::Archive::new(archive);
    for entry in reader.entries()? {
        let mut entry = entry?;
        if normalize(&entry.path()?.to_string_lossy()) != wanted {
            continue;
        }
        if !entry.header().entry_type().is_file() {
            return Err(not_found());
        }
        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        return Ok(content);
    }

    Err(not_found())
}

/// List entry names in an archive.
pub fn entry_names(archive: &[u8]) -> Result<Vec<String>> {
    let mut reader = tar::Archive::new(archive);
    let mut names = Vec::new();
    for entry in reader.entries()? {
        names.push(normalize(&entry?.path()?.to_string_lossy()));
    }
    Ok(names)
}

fn validate_entry_name(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if valid {
        Ok(path)
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("archive entry '{}' must be a relative path without '..'", name),
        )
        .into())
    }
}

fn normalize(name: &str) -> String {
    let trimmed = name.trim_start_matches("./").trim_end_matches('/');
    trimmed.to_string()
}
