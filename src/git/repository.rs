use crate::models::{BranchTip, BranchTipSet, Revision, RevisionId};
use crate::provider::{ProviderError, RevisionProvider};
use anyhow::{anyhow, Result};
use git2::{BranchType, Commit, ErrorCode, Oid, Repository, RepositoryOpenFlags};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// A git repository exposed as a [`RevisionProvider`]. Revision ids are the
/// raw object id bytes.
pub struct GitRepository {
    repo: Repository,
    tags: HashMap<Oid, BTreeSet<String>>,
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("path", &self.repo.path())
            .field("tagged_commits", &self.tags.len())
            .finish()
    }
}

impl GitRepository {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let repo = Repository::open_ext(
            path.as_ref(),
            RepositoryOpenFlags::NO_SEARCH,
            &[] as &[&std::ffi::OsStr],
        )?;
        Self::from_repo(repo)
    }

    /// Opens the repository containing `path`, searching parent directories.
    pub fn discover<P: AsRef<Path>>(path: P) -> Result<Self> {
        let repo = Repository::open_ext(
            path.as_ref(),
            RepositoryOpenFlags::empty(),
            &[] as &[&std::ffi::OsStr],
        )?;
        Self::from_repo(repo)
    }

    fn from_repo(repo: Repository) -> Result<Self> {
        let tags = collect_tags(&repo)?;
        debug!(
            "Opened repository at {} ({} tagged commits)",
            repo.path().display(),
            tags.len()
        );
        Ok(Self { repo, tags })
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.repo.workdir()
    }

    /// Local branches as tips: the checked-out branch first (or `HEAD` when
    /// detached), the rest newest first.
    pub fn branch_tips(&self) -> Result<BranchTipSet> {
        let head = match self.repo.head() {
            Ok(head) => Some(head),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let head_branch = head
            .as_ref()
            .filter(|h| h.is_branch())
            .and_then(|h| h.shorthand().map(str::to_string));

        let mut tips = BranchTipSet::new();
        if let Some(head) = &head {
            if head_branch.is_none() {
                let commit = head.peel_to_commit()?;
                tips.add(BranchTip::new("HEAD", revision_id(commit.id())).with_sort_key(commit.time().seconds()));
            }
        }

        let mut others = Vec::new();
        for branch in self.repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            let Some(name) = branch.name()?.map(str::to_string) else {
                continue;
            };
            let commit = branch.get().peel_to_commit()?;
            let tip = BranchTip::new(name.clone(), revision_id(commit.id())).with_sort_key(commit.time().seconds());
            if Some(&name) == head_branch.as_ref() {
                others.insert(0, tip);
            } else {
                others.push(tip);
            }
        }
        if head_branch.is_some() && !others.is_empty() {
            tips.add(others.remove(0));
        }
        others.sort_by(|a, b| b.sort_key.cmp(&a.sort_key).then_with(|| a.label.cmp(&b.label)));
        for tip in others {
            tips.add(tip);
        }

        if tips.is_empty() {
            return Err(anyhow!("repository has no commits"));
        }
        Ok(tips)
    }

    fn find_commit(&self, id: &RevisionId) -> Result<Commit<'_>, ProviderError> {
        let oid = Oid::from_bytes(id.as_bytes()).map_err(|_| ProviderError::UnknownRevision(id.clone()))?;
        self.repo.find_commit(oid).map_err(|e| match e.code() {
            ErrorCode::NotFound => ProviderError::UnknownRevision(id.clone()),
            _ => ProviderError::git(e),
        })
    }
}

fn revision_id(oid: Oid) -> RevisionId {
    RevisionId::new(oid.as_bytes())
}

fn signature_text(signature: &git2::Signature<'_>) -> String {
    format!(
        "{} <{}>",
        signature.name().unwrap_or(""),
        signature.email().unwrap_or("")
    )
}

/// Tag names by the commit they peel to.
fn collect_tags(repo: &Repository) -> Result<HashMap<Oid, BTreeSet<String>>> {
    let mut tags: HashMap<Oid, BTreeSet<String>> = HashMap::new();
    let names = repo.tag_names(None)?;
    for name in names.iter().flatten() {
        let target = repo
            .revparse_single(&format!("refs/tags/{}", name))
            .and_then(|object| object.peel_to_commit());
        match target {
            Ok(commit) => {
                tags.entry(commit.id()).or_default().insert(name.to_string());
            }
            Err(e) => warn!("Skipping tag {}: {}", name, e),
        }
    }
    Ok(tags)
}

impl RevisionProvider for GitRepository {
    fn parents(&self, id: &RevisionId) -> Result<Vec<RevisionId>, ProviderError> {
        let commit = self.find_commit(id)?;
        Ok(commit.parent_ids().map(revision_id).collect())
    }

    fn metadata(&self, id: &RevisionId) -> Result<Revision, ProviderError> {
        let commit = self.find_commit(id)?;
        let author = commit.author();
        let committer = commit.committer();
        let revision = Revision {
            id: id.clone(),
            parents: commit.parent_ids().map(revision_id).collect(),
            timestamp: commit.time().seconds(),
            author: signature_text(&author),
            committer: Some(signature_text(&committer)),
            message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
            tags: self.tags.get(&commit.id()).cloned().unwrap_or_default(),
            branch_nick: None,
        };
        Ok(revision)
    }

    fn heads(&self) -> Result<Vec<(RevisionId, String)>, ProviderError> {
        let tips = self.branch_tips().map_err(ProviderError::git)?;
        Ok(tips.iter().map(|tip| (tip.id.clone(), tip.label.clone())).collect())
    }

    fn supports_changed_paths(&self) -> bool {
        true
    }

    fn changed_paths(&self, id: &RevisionId) -> Result<Vec<String>, ProviderError> {
        let commit = self.find_commit(id)?;
        let tree = commit.tree().map_err(ProviderError::git)?;
        let parent_tree = if commit.parent_count() > 0 {
            Some(
                commit
                    .parent(0)
                    .and_then(|parent| parent.tree())
                    .map_err(ProviderError::git)?,
            )
        } else {
            None
        };

        let diff = self
            .repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)
            .map_err(ProviderError::git)?;

        Ok(diff
            .deltas()
            .filter_map(|delta| delta.new_file().path().or_else(|| delta.old_file().path()))
            .map(|path| path.to_string_lossy().replace('\\', "/"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use git2::{Signature, Time};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn create_test_repo() -> anyhow::Result<(TempDir, Repository)> {
        let temp_dir = TempDir::new()?;
        let repo = Repository::init(temp_dir.path())?;
        Ok((temp_dir, repo))
    }

    /// Commit the first parent's tree with `file` set to `content`
    fn create_test_commit(
        repo: &Repository,
        file: &str,
        content: &str,
        message: &str,
        parents: &[Oid],
        time: i64,
    ) -> anyhow::Result<Oid> {
        let parents: Vec<Commit<'_>> = parents
            .iter()
            .map(|oid| repo.find_commit(*oid))
            .collect::<Result<_, _>>()?;
        let mut index = git2::Index::new()?;
        if let Some(first) = parents.first() {
            index.read_tree(&first.tree()?)?;
        }
        let blob = repo.blob(content.as_bytes())?;
        index.add(&git2::IndexEntry {
            ctime: git2::IndexTime::new(0, 0),
            mtime: git2::IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: content.len() as u32,
            id: blob,
            flags: 0,
            flags_extended: 0,
            path: file.as_bytes().to_vec(),
        })?;
        let tree = repo.find_tree(index.write_tree_to(repo)?)?;
        let signature = Signature::new("Test User", "test@example.com", &Time::new(time, 0))?;
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        Ok(repo.commit(None, &signature, &signature, message, &tree, &parent_refs)?)
    }

    fn set_branch(repo: &Repository, name: &str, oid: Oid) -> anyhow::Result<()> {
        repo.reference(&format!("refs/heads/{}", name), oid, true, "test")?;
        Ok(())
    }

    /// main: base <- fix <- merge(fix, feature); feature: base <- feature
    fn merge_history(repo: &Repository) -> anyhow::Result<(Oid, Oid, Oid, Oid)> {
        let base = create_test_commit(repo, "README", "hello\n", "Initial commit", &[], 1_000)?;
        let feature = create_test_commit(repo, "src/lib.rs", "// lib\n", "Add library", &[base], 2_000)?;
        let fix = create_test_commit(repo, "README", "hello, world\n", "Fix greeting", &[base], 3_000)?;
        let merge = create_test_commit(repo, "src/lib.rs", "// lib\n", "Merge feature", &[fix, feature], 4_000)?;
        set_branch(repo, "main", merge)?;
        set_branch(repo, "feature", feature)?;
        repo.set_head("refs/heads/main")?;
        Ok((base, feature, fix, merge))
    }

    #[test]
    fn test_open_rejects_non_repository() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(GitRepository::open(temp_dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_discover_from_subdirectory() -> anyhow::Result<()> {
        let (temp_dir, repo) = create_test_repo()?;
        merge_history(&repo)?;
        let nested = temp_dir.path().join("src");
        std::fs::create_dir_all(&nested)?;
        let repository = GitRepository::discover(&nested)?;
        assert!(repository.workdir().is_some());
        Ok(())
    }

    #[test]
    fn test_branch_tips_put_head_first() -> anyhow::Result<()> {
        let (_temp_dir, repo) = create_test_repo()?;
        let (_, feature, _, merge) = merge_history(&repo)?;
        let late = create_test_commit(&repo, "notes.txt", "x\n", "Notes", &[feature], 5_000)?;
        set_branch(&repo, "notes", late)?;

        let repository = GitRepository::discover(repo.workdir().unwrap())?;
        let tips = repository.branch_tips()?;
        let labels: Vec<&str> = tips.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["main", "notes", "feature"]);
        assert_eq!(tips.get("main").unwrap().id, revision_id(merge));
        Ok(())
    }

    #[test]
    fn test_metadata_maps_commit_fields() -> anyhow::Result<()> {
        let (_temp_dir, repo) = create_test_repo()?;
        let (_, feature, fix, merge) = merge_history(&repo)?;
        let commit = repo.find_commit(fix)?;
        repo.tag_lightweight("v1.0", commit.as_object(), false)?;

        let repository = GitRepository::discover(repo.workdir().unwrap())?;
        let revision = repository.metadata(&revision_id(merge))?;
        assert_eq!(revision.parents, vec![revision_id(fix), revision_id(feature)]);
        assert_eq!(revision.timestamp, 4_000);
        assert_eq!(revision.author, "Test User <test@example.com>");
        assert_eq!(revision.committer.as_deref(), Some("Test User <test@example.com>"));
        assert_eq!(revision.summary(), "Merge feature");

        let tagged = repository.metadata(&revision_id(fix))?;
        assert!(tagged.tags.contains("v1.0"));
        Ok(())
    }

    #[test]
    fn test_unknown_revision() -> anyhow::Result<()> {
        let (_temp_dir, repo) = create_test_repo()?;
        merge_history(&repo)?;
        let repository = GitRepository::discover(repo.workdir().unwrap())?;

        let missing = RevisionId::new(vec![0xab; 20]);
        assert_eq!(
            repository.metadata(&missing),
            Err(ProviderError::UnknownRevision(missing.clone()))
        );
        let garbage = RevisionId::from("not-an-oid");
        assert!(matches!(
            repository.parents(&garbage),
            Err(ProviderError::UnknownRevision(_))
        ));
        Ok(())
    }

    #[test]
    fn test_changed_paths_against_first_parent() -> anyhow::Result<()> {
        let (_temp_dir, repo) = create_test_repo()?;
        let (base, feature, fix, merge) = merge_history(&repo)?;
        let repository = GitRepository::discover(repo.workdir().unwrap())?;

        assert_eq!(repository.changed_paths(&revision_id(base))?, vec!["README"]);
        assert_eq!(repository.changed_paths(&revision_id(feature))?, vec!["src/lib.rs"]);
        assert_eq!(repository.changed_paths(&revision_id(fix))?, vec!["README"]);
        assert_eq!(repository.changed_paths(&revision_id(merge))?, vec!["src/lib.rs"]);
        Ok(())
    }

    #[test]
    fn test_builds_graph_from_repository() -> anyhow::Result<()> {
        let (_temp_dir, repo) = create_test_repo()?;
        let (base, feature, fix, merge) = merge_history(&repo)?;
        let repository = GitRepository::discover(repo.workdir().unwrap())?;
        let tips = repository.branch_tips()?;

        let map = GraphBuilder::new(&repository).build(&tips)?;
        let order: Vec<RevisionId> = map.rows().iter().map(|r| r.id.clone()).collect();
        assert_eq!(
            order,
            vec![revision_id(merge), revision_id(fix), revision_id(feature), revision_id(base)]
        );
        assert_eq!(map.row(2).unwrap().labels, vec!["feature".to_string()]);
        assert!(!map.more_available());
        Ok(())
    }
}
