//! Local Git repository operations via `git2`.
//!
//! One [`GitClient`] wraps either the primary repository (read-only use) or
//! the shadow repository. Session worktrees are opened as their own clients.

use std::path::{Path, PathBuf};

use git2::{
    BranchType, ErrorCode, IndexAddOption, Oid, Repository, RepositoryInitOptions, Signature,
    Sort, WorktreeAddOptions,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;

/// Notes ref holding the shadow annotations.
pub const NOTES_REF: &str = "refs/notes/shadowsync";

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

/// Information about a single Git commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitInfo {
    pub sha: String,
    pub summary: String,
    pub message: String,
    pub author_name: String,
    pub author_time: i64,
}

impl GitClient {
    /// Open an existing Git repository (or worktree) at `repo_path`.
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        debug!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Initialize a new repository whose unborn HEAD points at `initial_branch`.
    #[instrument(fields(path = %path.display()))]
    pub fn init(path: &Path, initial_branch: &str) -> Result<Self, GitError> {
        std::fs::create_dir_all(path)?;
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(initial_branch);
        let repo = Repository::init_opts(path, &opts)?;
        info!(branch = initial_branch, "initialized repository");
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Root of the working tree.
    pub fn workdir(&self) -> Result<&Path, GitError> {
        self.repo
            .workdir()
            .ok_or_else(|| GitError::RefNotFound(format!("{} is bare", self.repo_path.display())))
    }

    /// Return the SHA of HEAD.
    pub fn get_head_sha(&self) -> Result<String, GitError> {
        let head = self.repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Return the SHA of HEAD, or `None` while HEAD is unborn.
    pub fn head_sha_opt(&self) -> Result<Option<String>, GitError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a revision (full or short SHA, branch, `HEAD~2`) to a commit.
    pub fn resolve_commit(&self, rev: &str) -> Result<String, GitError> {
        let object = match self.repo.revparse_single(rev) {
            Ok(object) => object,
            Err(e) if e.code() == ErrorCode::NotFound || e.code() == ErrorCode::Ambiguous => {
                return Err(GitError::RefNotFound(rev.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(object.peel_to_commit()?.id().to_string())
    }

    /// Tip of a local branch, if it exists.
    pub fn branch_tip(&self, name: &str) -> Result<Option<String>, GitError> {
        match self.repo.find_branch(name, BranchType::Local) {
            Ok(branch) => Ok(Some(branch.get().peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a new branch pointing at `from_sha`.
    #[instrument(skip(self))]
    pub fn create_branch(&self, name: &str, from_sha: &str) -> Result<(), GitError> {
        let oid = Oid::from_str(from_sha)?;
        let commit = self.repo.find_commit(oid)?;
        self.repo.branch(name, &commit, false)?;
        info!(name, from_sha, "created branch");
        Ok(())
    }

    /// Check out `branch` into a new linked worktree at `path`.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn add_worktree(&self, name: &str, path: &Path, branch: &str) -> Result<(), GitError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let reference = self
            .repo
            .find_branch(branch, BranchType::Local)
            .map_err(|_| GitError::RefNotFound(branch.to_string()))?
            .into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        self.repo.worktree(name, path, Some(&opts))?;
        info!(name, branch, "added worktree");
        Ok(())
    }

    /// Stage changes and commit on HEAD.
    ///
    /// With `paths = None` every change in the working tree is staged; with
    /// `Some(paths)` only those paths are (missing files are staged as
    /// deletions). Returns `None` if the resulting tree equals the parent's.
    #[instrument(skip(self, paths, message))]
    pub fn commit_paths(
        &self,
        paths: Option<&[String]>,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<Option<Oid>, GitError> {
        let mut index = self.repo.index()?;
        // Another process may have committed since this handle last looked.
        index.read(false)?;
        match paths {
            None => {
                index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
                index.update_all(["*"].iter(), None)?;
            }
            Some(paths) => {
                let workdir = self.workdir()?.to_path_buf();
                for path in paths {
                    if workdir.join(path).is_file() {
                        index.add_path(Path::new(path))?;
                    } else if let Err(e) = index.remove_path(Path::new(path)) {
                        warn!(path, error = %e, "could not unstage missing path");
                    }
                }
            }
        }
        index.write()?;
        let tree_oid = index.write_tree()?;

        let parent_commit = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        if let Some(parent) = &parent_commit {
            if parent.tree_id() == tree_oid {
                debug!("tree unchanged, skipping commit");
                return Ok(None);
            }
        }

        let tree = self.repo.find_tree(tree_oid)?;
        let signature = Signature::now(author_name, author_email)?;
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(Some(oid))
    }

    /// Attach (or overwrite) the shadowsync note on a commit.
    #[instrument(skip(self, note))]
    pub fn write_note(
        &self,
        sha: &str,
        note: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<(), GitError> {
        let oid = Oid::from_str(sha)?;
        let signature = Signature::now(author_name, author_email)?;
        self.repo
            .note(&signature, &signature, Some(NOTES_REF), oid, note, true)?;
        debug!(sha, "wrote note");
        Ok(())
    }

    /// Read the shadowsync note on a commit.
    pub fn read_note(&self, sha: &str) -> Result<Option<String>, GitError> {
        let oid = Oid::from_str(sha)?;
        match self.repo.find_note(Some(NOTES_REF), oid) {
            Ok(note) => Ok(note.message().map(str::to_string)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every commit reachable from any local branch, oldest first.
    pub fn all_branch_commits(&self) -> Result<Vec<String>, GitError> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        let mut pushed = false;
        for branch_result in self.repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch_result?;
            if let Some(oid) = branch.get().target() {
                revwalk.push(oid)?;
                pushed = true;
            }
        }
        if !pushed {
            return Ok(Vec::new());
        }
        let mut commits = Vec::new();
        for oid in revwalk {
            commits.push(oid?.to_string());
        }
        debug!(count = commits.len(), "walked shadow log");
        Ok(commits)
    }

    /// Commits reachable from `to` but not from `from`, oldest first.
    pub fn commits_between(&self, from: &str, to: &str) -> Result<Vec<String>, GitError> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        revwalk.push(Oid::from_str(to)?)?;
        revwalk.hide(Oid::from_str(from)?)?;
        let mut commits = Vec::new();
        for oid in revwalk {
            commits.push(oid?.to_string());
        }
        Ok(commits)
    }

    /// Paths that differ between two commits.
    pub fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>, GitError> {
        let old_tree = self.repo.find_commit(Oid::from_str(from)?)?.tree()?;
        let new_tree = self.repo.find_commit(Oid::from_str(to)?)?.tree()?;
        let diff = self
            .repo
            .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;
        let mut paths = Vec::new();
        for delta in diff.deltas() {
            let file = delta.new_file().path().or_else(|| delta.old_file().path());
            if let Some(p) = file {
                paths.push(p.to_string_lossy().replace('\\', "/"));
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Content of `path` as of commit `sha`, or `None` if absent there.
    pub fn file_at(&self, sha: &str, path: &str) -> Result<Option<Vec<u8>>, GitError> {
        let tree = self.repo.find_commit(Oid::from_str(sha)?)?.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let object = entry.to_object(&self.repo)?;
        Ok(object.as_blob().map(|blob| blob.content().to_vec()))
    }

    /// Full message of a commit.
    pub fn commit_message(&self, sha: &str) -> Result<String, GitError> {
        let commit = self.repo.find_commit(Oid::from_str(sha)?)?;
        Ok(commit.message().unwrap_or("").to_string())
    }

    /// Walk back from a branch tip, newest first.
    pub fn log(&self, branch: &str, limit: usize) -> Result<Vec<GitCommitInfo>, GitError> {
        let tip = self
            .branch_tip(branch)?
            .ok_or_else(|| GitError::RefNotFound(branch.to_string()))?;
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(Oid::from_str(&tip)?)?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        let mut commits = Vec::new();
        for oid_result in revwalk.take(limit) {
            let oid = oid_result?;
            let commit = self.repo.find_commit(oid)?;
            commits.push(GitCommitInfo {
                sha: oid.to_string(),
                summary: commit.summary().unwrap_or("").to_string(),
                message: commit.message().unwrap_or("").to_string(),
                author_name: commit.author().name().unwrap_or("").to_string(),
                author_time: commit.author().when().seconds(),
            });
        }
        Ok(commits)
    }
}
