//! Shared state for the subcommand front-end.

use fsmonitor_filewatch::WatchRoots;

use crate::{
    cli::{Args, Error},
    config::DaemonConfig,
    daemon::Paths,
    git::Repo,
};

pub mod daemon;

/// Everything a subcommand needs: the resolved repository, the effective
/// configuration, and the daemon's filesystem locations.
pub struct CommandBase {
    pub repo: Repo,
    pub config: DaemonConfig,
    pub paths: Paths,
}

impl CommandBase {
    pub fn new(args: &Args) -> Result<Self, Error> {
        let repo = Repo::discover()?;
        let config = DaemonConfig::resolve(&repo, args.ipc_threads, args.start_timeout)?;
        let paths = Paths::from_gitdir(&repo.gitdir);
        Ok(Self {
            repo,
            config,
            paths,
        })
    }

    /// The watch roots for this repository: the working tree, plus the
    /// metadata directory as a second root when it lives outside it.
    pub fn watch_roots(&self) -> WatchRoots {
        let gitdir = self
            .repo
            .has_external_gitdir()
            .then(|| self.repo.gitdir.clone());
        WatchRoots::new(self.repo.worktree.clone(), gitdir)
    }
}
