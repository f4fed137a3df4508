//! Minimal wrapper around the `git` executable, used once at boot to
//! resolve the repository this daemon will watch and to read its
//! configuration. Everything here is blocking and runs before the runtime
//! starts.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not inside a git working tree")]
    NotAWorkTree,
    #[error("bare repositories are not supported")]
    BareRepository,
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git {args} failed: {stderr}")]
    Failed { args: String, stderr: String },
    #[error("git produced unexpected output for {args}")]
    UnexpectedOutput { args: String },
}

/// The resolved repository: where the working tree is and where its
/// metadata lives.
#[derive(Debug, Clone)]
pub struct Repo {
    pub worktree: Utf8PathBuf,
    pub gitdir: Utf8PathBuf,
}

impl Repo {
    /// Resolve the repository containing the current directory. Bare
    /// repositories have no working tree to watch and are refused.
    pub fn discover() -> Result<Self, GitError> {
        Self::discover_from(None)
    }

    pub fn discover_from(cwd: Option<&Utf8Path>) -> Result<Self, GitError> {
        // Asked separately: `--show-toplevel` errors out in a bare repo
        // before `--is-bare-repository` would get a chance to print.
        let bare = run_git(cwd, &["rev-parse", "--is-bare-repository"])?;
        if bare.trim_end() == "true" {
            return Err(GitError::BareRepository);
        }

        let args = &["rev-parse", "--show-toplevel", "--absolute-git-dir"];
        let output = run_git(cwd, args)?;
        let mut lines = output.lines();
        let worktree = lines.next().ok_or_else(|| unexpected(args))?;
        let gitdir = lines.next().ok_or_else(|| unexpected(args))?;
        Ok(Self {
            worktree: Utf8PathBuf::from(worktree),
            gitdir: Utf8PathBuf::from(gitdir),
        })
    }

    /// Whether the metadata directory needs its own watch root, i.e. it is
    /// not the plain `<worktree>/.git` directory.
    pub fn has_external_gitdir(&self) -> bool {
        !self.worktree.join(fsmonitor_filewatch::DOT_GIT).is_dir()
    }

    /// Read a single config value; `Ok(None)` when the key is unset.
    pub fn config_get(&self, key: &str) -> Result<Option<String>, GitError> {
        let args = &["config", "--get", key];
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.worktree)
            .output()?;
        if output.status.success() {
            let value = String::from_utf8(output.stdout)
                .map_err(|_| unexpected(args))?
                .trim_end()
                .to_owned();
            return Ok(Some(value));
        }
        // `git config --get` exits 1, silently, for an unset key.
        if output.stderr.is_empty() {
            return Ok(None);
        }
        Err(failed(args, &output.stderr))
    }
}

fn run_git(cwd: Option<&Utf8Path>, args: &[&str]) -> Result<String, GitError> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not a git repository") {
            return Err(GitError::NotAWorkTree);
        }
        return Err(failed(args, &output.stderr));
    }
    String::from_utf8(output.stdout).map_err(|_| unexpected(args))
}

fn failed(args: &[&str], stderr: &[u8]) -> GitError {
    GitError::Failed {
        args: args.join(" "),
        stderr: String::from_utf8_lossy(stderr).trim_end().to_owned(),
    }
}

fn unexpected(args: &[&str]) -> GitError {
    GitError::UnexpectedOutput {
        args: args.join(" "),
    }
}

#[cfg(test)]
mod test {
    use camino::Utf8PathBuf;

    use super::{GitError, Repo};

    fn git(dir: &Utf8PathBuf, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn discover_finds_worktree_and_gitdir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().canonicalize().unwrap()).unwrap();
        git(&root, &["init", "--quiet"]);

        let repo = Repo::discover_from(Some(root.as_path())).unwrap();
        assert_eq!(repo.worktree, root);
        assert_eq!(repo.gitdir, root.join(".git"));
        assert!(!repo.has_external_gitdir());
    }

    #[test]
    fn discover_refuses_bare_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().canonicalize().unwrap()).unwrap();
        git(&root, &["init", "--quiet", "--bare"]);

        let result = Repo::discover_from(Some(root.as_path()));
        assert!(matches!(result, Err(GitError::BareRepository)));
    }

    #[test]
    fn separate_gitdir_needs_second_watch_root() {
        let tmp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(tmp.path().canonicalize().unwrap()).unwrap();
        let root = base.join("worktree");
        let gitdir = base.join("metadata.git");
        std::fs::create_dir(&root).unwrap();
        git(
            &root,
            &["init", "--quiet", "--separate-git-dir", gitdir.as_str()],
        );

        let repo = Repo::discover_from(Some(root.as_path())).unwrap();
        assert_eq!(repo.worktree, root);
        assert_eq!(repo.gitdir, gitdir);
        assert!(repo.has_external_gitdir());
    }

    #[test]
    fn config_get_returns_none_for_unset_key() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().canonicalize().unwrap()).unwrap();
        git(&root, &["init", "--quiet"]);
        let repo = Repo::discover_from(Some(root.as_path())).unwrap();

        assert_eq!(repo.config_get("fsmonitor.ipcthreads").unwrap(), None);
        git(&root, &["config", "fsmonitor.ipcthreads", "4"]);
        assert_eq!(
            repo.config_get("fsmonitor.ipcthreads").unwrap().as_deref(),
            Some("4")
        );
    }
}
