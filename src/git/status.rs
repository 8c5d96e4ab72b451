use anyhow::{anyhow, Context, Result};
use git2::Repository;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Answer of a yes/no path query. The exit codes follow the classic
/// `is-versioned`/`is-ignored` commands: 1 for yes, 0 for no.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Yes,
    No,
}

impl StatusOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            StatusOutcome::Yes => 1,
            StatusOutcome::No => 0,
        }
    }
}

impl From<bool> for StatusOutcome {
    fn from(value: bool) -> Self {
        if value {
            StatusOutcome::Yes
        } else {
            StatusOutcome::No
        }
    }
}

/// Exit code for anything that prevented an answer.
pub const ERROR_EXIT_CODE: u8 = 3;

/// Opens the working tree containing `path` and returns it with the path
/// relative to the working tree root.
fn open_containing(path: &Path) -> Result<(Repository, PathBuf)> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let absolute = normalize(&absolute);
    let start = absolute
        .ancestors()
        .find(|dir| dir.is_dir())
        .ok_or_else(|| anyhow!("no existing directory above {}", absolute.display()))?;

    let repo = Repository::discover(start)
        .with_context(|| format!("{} is not inside a working tree", path.display()))?;
    let workdir = repo
        .workdir()
        .ok_or_else(|| anyhow!("repository at {} has no working tree", repo.path().display()))?;
    let workdir = normalize(&workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf()));
    let absolute = match absolute.canonicalize() {
        Ok(resolved) => resolved,
        Err(_) => start
            .canonicalize()
            .map(|dir| dir.join(absolute.strip_prefix(start).unwrap_or(Path::new(""))))
            .unwrap_or(absolute.clone()),
    };
    let relative = absolute
        .strip_prefix(&workdir)
        .with_context(|| format!("{} is outside {}", absolute.display(), workdir.display()))?
        .to_path_buf();
    debug!("Resolved {} to {} in {}", path.display(), relative.display(), workdir.display());
    Ok((repo, relative))
}

/// Drops `.` and folds `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn index_key(relative: &Path) -> String {
    relative.to_string_lossy().replace('\\', "/")
}

/// A path is versioned when the index tracks it, or tracks anything below
/// it for directories. The working tree root always is.
pub fn is_versioned(path: &Path) -> Result<StatusOutcome> {
    let (repo, relative) = open_containing(path)?;
    let key = index_key(&relative);
    if key.is_empty() {
        return Ok(StatusOutcome::Yes);
    }
    let index = repo.index()?;
    let prefix = format!("{}/", key);
    let tracked = index.iter().any(|entry| {
        let entry_path = String::from_utf8_lossy(&entry.path);
        entry_path == key || entry_path.starts_with(&prefix)
    });
    Ok(tracked.into())
}

/// Applies the repository's ignore rules to `path`.
pub fn is_ignored(path: &Path) -> Result<StatusOutcome> {
    let (repo, relative) = open_containing(path)?;
    if relative.as_os_str().is_empty() {
        return Ok(StatusOutcome::No);
    }
    Ok(repo.is_path_ignored(&relative)?.into())
}
