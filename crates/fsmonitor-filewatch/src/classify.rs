//! Classifies absolute paths coming off the kernel event stream against the
//! roots the daemon watches. Classification decides whether an event is
//! reportable to clients, private repository metadata, or one of our own
//! sync cookies.

use camino::{Utf8Path, Utf8PathBuf};

/// Name of the repository metadata directory at the top of a working tree.
pub const DOT_GIT: &str = ".git";

/// Filename prefix of the cookie files the daemon drops into the metadata
/// directory to synchronize with the event stream.
pub const COOKIE_PREFIX: &str = ".fsmonitor-daemon-";

/// What an absolute path means to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Inside the working tree and reportable to clients.
    WorkdirPath,
    /// The `.git` entry at the top of the working tree itself.
    DotGit,
    /// Private metadata below `<worktree>/.git`.
    InsideDotGit,
    /// One of our cookie files below `<worktree>/.git`.
    InsideDotGitWithCookiePrefix,
    /// The external metadata directory itself.
    Gitdir,
    /// Private metadata below the external metadata directory.
    InsideGitdir,
    /// One of our cookie files below the external metadata directory.
    InsideGitdirWithCookiePrefix,
    /// Unrelated to any watched root.
    OutsideCone,
}

/// The directories the daemon watches: the working tree, and a second root
/// for the metadata directory when it is not `<worktree>/.git`.
#[derive(Debug, Clone)]
pub struct WatchRoots {
    worktree: Utf8PathBuf,
    dot_git: Utf8PathBuf,
    gitdir: Option<Utf8PathBuf>,
}

impl WatchRoots {
    /// `gitdir` is `Some` only when the metadata directory lives outside the
    /// working tree, which requires a second watch root.
    pub fn new(worktree: Utf8PathBuf, gitdir: Option<Utf8PathBuf>) -> Self {
        let dot_git = worktree.join(DOT_GIT);
        Self {
            worktree,
            dot_git,
            gitdir,
        }
    }

    pub fn worktree(&self) -> &Utf8Path {
        &self.worktree
    }

    /// Where repository metadata (and our cookie files) live.
    pub fn metadata_dir(&self) -> &Utf8Path {
        self.gitdir.as_deref().unwrap_or(&self.dot_git)
    }

    /// The roots handed to the notification backend.
    pub fn watch_paths(&self) -> Vec<Utf8PathBuf> {
        let mut paths = vec![self.worktree.clone()];
        if let Some(gitdir) = &self.gitdir {
            paths.push(gitdir.clone());
        }
        paths
    }

    /// Classify an absolute path. The working tree is tried first; only a
    /// path outside it is matched against the external metadata root.
    pub fn classify(&self, path: &Utf8Path) -> PathKind {
        match classify_worktree(self.worktree.as_str(), path.as_str()) {
            PathKind::OutsideCone => match &self.gitdir {
                Some(gitdir) => classify_gitdir(gitdir.as_str(), path.as_str()),
                None => PathKind::OutsideCone,
            },
            kind => kind,
        }
    }

    /// The worktree-relative, forward-slash form of a `WorkdirPath`. Returns
    /// `None` for the root itself and for paths outside the working tree.
    pub fn worktree_relative<'a>(&self, path: &'a Utf8Path) -> Option<&'a str> {
        let rel = path.as_str().strip_prefix(self.worktree.as_str())?;
        rel.strip_prefix('/').filter(|rel| !rel.is_empty())
    }
}

fn classify_worktree(root: &str, path: &str) -> PathKind {
    let Some(rel) = path.strip_prefix(root) else {
        return PathKind::OutsideCone;
    };
    if rel.is_empty() {
        // The working tree root itself.
        return PathKind::WorkdirPath;
    }
    let Some(rel) = rel.strip_prefix('/') else {
        // Accidental prefix match, e.g. `/wt-other` against root `/wt`.
        return PathKind::OutsideCone;
    };
    let Some(in_git) = rel.strip_prefix(DOT_GIT) else {
        return PathKind::WorkdirPath;
    };
    if in_git.is_empty() {
        return PathKind::DotGit;
    }
    let Some(in_git) = in_git.strip_prefix('/') else {
        // `.gitignore` and friends.
        return PathKind::WorkdirPath;
    };
    if in_git.starts_with(COOKIE_PREFIX) {
        PathKind::InsideDotGitWithCookiePrefix
    } else {
        PathKind::InsideDotGit
    }
}

fn classify_gitdir(root: &str, path: &str) -> PathKind {
    let Some(rel) = path.strip_prefix(root) else {
        return PathKind::OutsideCone;
    };
    if rel.is_empty() {
        return PathKind::Gitdir;
    }
    let Some(rel) = rel.strip_prefix('/') else {
        return PathKind::OutsideCone;
    };
    if rel.starts_with(COOKIE_PREFIX) {
        PathKind::InsideGitdirWithCookiePrefix
    } else {
        PathKind::InsideGitdir
    }
}

#[cfg(test)]
mod test {
    use camino::{Utf8Path, Utf8PathBuf};
    use test_case::test_case;

    use super::{PathKind, WatchRoots};

    fn single_root() -> WatchRoots {
        WatchRoots::new(Utf8PathBuf::from("/w"), None)
    }

    #[test_case("/w", PathKind::WorkdirPath ; "worktree root itself")]
    #[test_case("/w/a.txt", PathKind::WorkdirPath ; "regular file")]
    #[test_case("/w/sub/dir/b", PathKind::WorkdirPath ; "nested file")]
    #[test_case("/w/.git", PathKind::DotGit ; "metadata root")]
    #[test_case("/w/.gitignore", PathKind::WorkdirPath ; "dot git prefix only")]
    #[test_case("/w/.gitfoo", PathKind::WorkdirPath ; "dot gitfoo")]
    #[test_case("/w/.git/HEAD", PathKind::InsideDotGit ; "metadata file")]
    #[test_case("/w/.git/objects/ab/cd", PathKind::InsideDotGit ; "deep metadata")]
    #[test_case(
        "/w/.git/.fsmonitor-daemon-X",
        PathKind::InsideDotGitWithCookiePrefix ; "cookie file"
    )]
    #[test_case("/other/x", PathKind::OutsideCone ; "unrelated path")]
    #[test_case("/wx", PathKind::OutsideCone ; "accidental prefix")]
    fn classify_single_root(path: &str, expected: PathKind) {
        assert_eq!(single_root().classify(Utf8Path::new(path)), expected);
    }

    #[test_case("/meta/repo.git", PathKind::Gitdir ; "gitdir root itself")]
    #[test_case("/meta/repo.git/HEAD", PathKind::InsideGitdir ; "gitdir file")]
    #[test_case(
        "/meta/repo.git/.fsmonitor-daemon-7",
        PathKind::InsideGitdirWithCookiePrefix ; "gitdir cookie"
    )]
    #[test_case("/meta/repo.gitx", PathKind::OutsideCone ; "gitdir accidental prefix")]
    #[test_case("/w/a.txt", PathKind::WorkdirPath ; "worktree still wins")]
    fn classify_two_roots(path: &str, expected: PathKind) {
        let roots = WatchRoots::new(
            Utf8PathBuf::from("/w"),
            Some(Utf8PathBuf::from("/meta/repo.git")),
        );
        assert_eq!(roots.classify(Utf8Path::new(path)), expected);
    }

    #[test]
    fn worktree_relative_strips_root() {
        let roots = single_root();
        assert_eq!(
            roots.worktree_relative(Utf8Path::new("/w/sub/a.txt")),
            Some("sub/a.txt")
        );
        assert_eq!(roots.worktree_relative(Utf8Path::new("/w")), None);
        assert_eq!(roots.worktree_relative(Utf8Path::new("/other")), None);
    }

    #[test]
    fn metadata_dir_prefers_external_gitdir() {
        let roots = WatchRoots::new(
            Utf8PathBuf::from("/w"),
            Some(Utf8PathBuf::from("/meta/repo.git")),
        );
        assert_eq!(roots.metadata_dir(), Utf8Path::new("/meta/repo.git"));
        assert_eq!(single_root().metadata_dir(), Utf8Path::new("/w/.git"));
        assert_eq!(roots.watch_paths().len(), 2);
    }
}
