use core::fmt;
use core::fmt::{Debug, Display};
use std::ffi::OsStr;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Context};
use colored::control::SHOULD_COLORIZE;
use futures::future::BoxFuture;
use futures::FutureExt;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::process::{CommandExt, OutputExt};
use crate::util::ResultExt as _;

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Hash(String);

// A Hash is an ID for referring to an object in a git repository. Note that
// construction is infallible: having a Hash doesn't guarantee the ID refers
// to an object in an actual repo, and even if we checked at construction
// time it couldn't be enforced going forward. Error handling happens
// whenever you actually dereference one, like with any mutable database.
impl Hash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn abbrev(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CommitHash(Hash);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }
}

impl From<CommitHash> for Hash {
    fn from(h: CommitHash) -> Hash {
        h.0
    }
}

impl Deref for CommitHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// The main checkout, where docs commits land and worktrees get created from.
// Workers never run git here; the orchestrator never runs git anywhere else.
#[derive(Debug)]
pub struct Repo {
    pub path: PathBuf,
    pub git_binary: PathBuf,
}

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

// Wrapper for a Command, that holds a semaphore for as long as the process
// exists. Just delegates enough methods to allow you to use it without
// letting you drop the semaphore until the process has terminated (which
// hopefully implies the stdio pipes have been closed...).
// This exists to try and avoid running into file descriptor exhaustion,
// without needing any retry logic that would risk creating livelocks.
#[derive(Debug)]
pub struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut GitCommand {
        self.command.arg(arg);
        self
    }

    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        self.command.execute().await
    }

    pub async fn output(&mut self) -> io::Result<process::Output> {
        self.command.output().await
    }
}

// Traits can't have private methods, this is a workaround for that, to avoid
// linter warnings from having a public method return a private type.
trait WorktreePriv: Worktree {
    // Convenience function to create a git command with some pre-filled args.
    // Returns a BoxFuture as an utterly mysterious workaround for what I
    // believe is a compiler bug:
    // https://stackoverflow.com/questions/79350718/one-type-is-more-general-than-the-other-for-osstr-and-tokiospawn?noredirect=1#comment139931420_79350718
    fn git<'a, I, S>(&'a self, args: I) -> BoxFuture<'a, GitCommand>
    where
        I: IntoIterator<Item = S> + Send + 'a,
        S: AsRef<OsStr>,
    {
        (async {
            let mut cmd = Command::new(self.git_binary());
            cmd.current_dir(self.path());
            cmd.args([
                "-c",
                &format!("color.ui={}", SHOULD_COLORIZE.should_colorize()),
            ]);
            cmd.args(args);
            // Separate process group means the child doesn't get SIGINT if the
            // user Ctrl-C's the terminal. We are trusting that git won't get
            // stuck and prevent us from shutting down. The benefit is that we
            // don't get annoying confusing errors on shut down.
            cmd.process_group(0);
            GitCommand {
                _permit: COMMAND_SEM.acquire().await.unwrap(),
                command: cmd,
            }
        })
        .boxed()
    }
}

impl<W: Worktree + ?Sized> WorktreePriv for W {}

// Checkout of a git repository that git commands can be run in. Implemented
// by the main repo and by test fixtures.
pub trait Worktree: Debug + Sync {
    // Directory where git commands should be run.
    fn path(&self) -> &Path;
    // Path to Git binary.
    fn git_binary(&self) -> &Path;

    // Name of the branch HEAD points at. The orchestrator requires a local
    // branch; detached HEAD is an error because docs commits would become
    // unreachable as soon as anything else gets checked out.
    async fn current_branch(&self) -> anyhow::Result<String> {
        let output = self
            .git(["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .execute()
            .await
            .context("'git rev-parse --abbrev-ref HEAD' failed")?;
        let branch = String::from_utf8(output.stdout)
            .context("non utf-8 branch name")?
            .trim()
            .to_owned();
        if branch == "HEAD" {
            bail!("HEAD is detached; check out a local branch first");
        }
        Ok(branch)
    }

    // None means we successfully looked it up but it didn't exist.
    async fn rev_parse(&self, rev: &str) -> anyhow::Result<Option<CommitHash>> {
        let output = self
            .git(["rev-parse", "--verify", "--quiet"])
            .await
            .arg(rev)
            .output()
            .await
            .context("failed to run 'git rev-parse'")?;
        // --quiet means a nonexistent rev exits 1 without noise on stderr;
        // anything else (e.g. 128 for not-a-repo) is a real failure.
        match output.code_not_killed()? {
            0 => {
                let hash = String::from_utf8(output.stdout)
                    .context("non utf-8 rev-parse output")?
                    .trim()
                    .to_owned();
                Ok(Some(CommitHash::new(hash)))
            }
            1 => Ok(None),
            code => bail!("'git rev-parse {rev}' failed with code {code}"),
        }
    }

    async fn branch_exists(&self, branch: &str) -> anyhow::Result<bool> {
        let output = self
            .git(["show-ref", "--verify", "--quiet"])
            .await
            .arg(format!("refs/heads/{branch}"))
            .output()
            .await
            .context("failed to run 'git show-ref'")?;
        match output.code_not_killed()? {
            0 => Ok(true),
            1 => Ok(false),
            code => bail!("'git show-ref' failed with code {code}"),
        }
    }

    // Stage exactly the given paths and commit them, returning whether a
    // commit was actually created. A no-op add must not produce an empty
    // commit, so the staged diff gets checked first.
    async fn commit_paths(
        &self,
        paths: impl IntoIterator<Item = impl AsRef<Path>> + Send,
        message: &str,
    ) -> anyhow::Result<bool> {
        let mut add = self.git(["add", "--"]).await;
        for path in paths {
            add.arg(path.as_ref());
        }
        add.execute().await.context("'git add' failed")?;
        let staged = self
            .git(["diff", "--cached", "--quiet"])
            .await
            .output()
            .await
            .context("failed to run 'git diff --cached'")?;
        match staged.code_not_killed()? {
            0 => return Ok(false),
            1 => (),
            code => bail!("'git diff --cached' failed with code {code}"),
        }
        self.git(["commit", "-m"])
            .await
            .arg(message)
            .execute()
            .await
            .context(format!("committing {message:?}"))?;
        Ok(true)
    }
}

// A worktree pinned to a task branch. This is deliberately inert: the
// orchestrator only ever needs its location (to spawn the worker in) and its
// branch name (to inspect the tip from the main repo). All mutation inside
// it belongs to the worker.
#[derive(Debug, Clone)]
pub struct TaskWorktree {
    pub path: PathBuf,
    pub branch: String,
}

// Branch names are the basename of the worktree subdirectory.
pub fn branch_for_worktree(subdir: &str) -> anyhow::Result<String> {
    let name = Path::new(subdir)
        .file_name()
        .ok_or_else(|| anyhow!("worktree path {subdir:?} has no basename"))?;
    Ok(name
        .to_str()
        .ok_or_else(|| anyhow!("worktree path {subdir:?} is not valid UTF-8"))?
        .to_owned())
}

impl Repo {
    // Get the worktree for a task, creating it if necessary. An existing
    // directory is only accepted if it already is a git worktree (has a .git
    // entry, file or directory). An existing local branch gets reattached;
    // otherwise the worktree starts a new branch from base_branch.
    pub async fn ensure_worktree(
        &self,
        base_branch: &str,
        subdir: &str,
    ) -> anyhow::Result<TaskWorktree> {
        let path = self.path.join(subdir);
        let branch = branch_for_worktree(subdir)?;
        if path.exists() {
            if !path.join(".git").exists() {
                bail!("worktree path {path:?} exists but is not a git worktree");
            }
            return Ok(TaskWorktree { path, branch });
        }
        if self.branch_exists(&branch).await? {
            self.git(["worktree", "add"])
                .await
                .arg(&path)
                .arg(&branch)
                .execute()
                .await
                .context(format!("attaching worktree to existing branch {branch:?}"))?;
        } else {
            self.git(["worktree", "add", "-b"])
                .await
                .arg(&branch)
                .arg(&path)
                .arg(base_branch)
                .execute()
                .await
                .context(format!(
                    "creating worktree on new branch {branch:?} from {base_branch:?}"
                ))?;
        }
        Ok(TaskWorktree { path, branch })
    }

    // Force-remove a task worktree. Idempotent, and never errors: by the
    // time this gets called the task outcome is already recorded, so a
    // leftover directory is only worth a log line. The branch survives.
    pub async fn remove_worktree(&self, subdir: &str) {
        let path = self.path.join(subdir);
        if !path.exists() {
            return;
        }
        self.git(["worktree", "remove", "--force"])
            .await
            .arg(&path)
            .execute()
            .await
            .or_log_error(&format!("removing worktree {path:?}"));
    }

    // Check out the base branch in the main repo and fast-forward it to the
    // integration branch. Only ever fast-forward: divergence is the task's
    // problem, not something to paper over with a merge commit.
    pub async fn fast_forward_merge(
        &self,
        base_branch: &str,
        integration_branch: &str,
    ) -> anyhow::Result<()> {
        self.git(["checkout"])
            .await
            .arg(base_branch)
            .execute()
            .await
            .context(format!("checking out base branch {base_branch:?}"))?;
        self.git(["merge", "--ff-only"])
            .await
            .arg(integration_branch)
            .execute()
            .await
            .context(format!(
                "fast-forward merging {integration_branch:?} into {base_branch:?}"
            ))?;
        Ok(())
    }
}

impl Worktree for Repo {
    fn path(&self) -> &Path {
        &self.path
    }

    fn git_binary(&self) -> &Path {
        &self.git_binary
    }
}

#[cfg(test)]
pub mod test_utils {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[derive(Debug)]
    pub struct TempRepo {
        temp_dir: TempDir,
        git_binary: PathBuf,
    }

    // Repository in a temporary directory, torn down on drop.
    impl TempRepo {
        pub async fn new() -> anyhow::Result<Self> {
            let zelf = Self {
                temp_dir: TempDir::with_prefix("fixture-").expect("couldn't make tempdir"),
                git_binary: PathBuf::from("git"),
            };
            zelf.git(["init", "-b", "main"]).await.execute().await?;
            // Commits need an identity regardless of the host's git config.
            zelf.git(["config", "user.email", "drover@example.com"])
                .await
                .execute()
                .await?;
            zelf.git(["config", "user.name", "drover tests"])
                .await
                .execute()
                .await?;
            Ok(zelf)
        }

        pub fn repo(&self) -> Repo {
            Repo {
                path: self.path().to_owned(),
                git_binary: self.git_binary().to_owned(),
            }
        }
    }

    impl Worktree for TempRepo {
        fn path(&self) -> &Path {
            self.temp_dir.path()
        }

        fn git_binary(&self) -> &Path {
            &self.git_binary
        }
    }

    pub trait WorktreeExt: Worktree {
        async fn commit<S>(&self, message: S) -> anyhow::Result<CommitHash>
        where
            S: AsRef<OsStr> + Send,
        {
            self.git(["commit", "-m"])
                .await
                .arg(message)
                .arg("--allow-empty")
                .execute()
                .await
                .context("'git commit' failed")?;
            // Doesn't seem like there's a safer way to do this than commit and
            // then retroactively parse HEAD and hope nobody else is messing
            // with us.
            self.rev_parse("HEAD")
                .await?
                .ok_or(anyhow!("no HEAD after committing"))
        }

        // Write a file and commit it, for tests that need branch tips to
        // actually move.
        async fn commit_file(&self, name: &str, content: &str) -> anyhow::Result<CommitHash> {
            fs::write(self.path().join(name), content)?;
            self.git(["add"]).await.arg(name).execute().await?;
            self.commit(format!("add {name}")).await
        }
    }

    impl<W: Worktree> WorktreeExt for W {}
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::test_utils::{TempRepo, WorktreeExt as _};
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_ensure_worktree_creates_branch() {
        let fixture = TempRepo::new().await.unwrap();
        fixture.commit("base").await.unwrap();
        let repo = fixture.repo();

        let wt = repo.ensure_worktree("main", "work/feat-a").await.unwrap();
        assert_eq!(wt.branch, "feat-a");
        assert!(wt.path.join(".git").exists());
        assert!(repo.branch_exists("feat-a").await.unwrap());

        // Same call again must hand back the existing worktree unchanged.
        let again = repo.ensure_worktree("main", "work/feat-a").await.unwrap();
        assert_eq!(again.path, wt.path);
    }

    #[test_log::test(tokio::test)]
    async fn test_ensure_worktree_rejects_plain_dir() {
        let fixture = TempRepo::new().await.unwrap();
        fixture.commit("base").await.unwrap();
        let repo = fixture.repo();

        fs::create_dir_all(repo.path.join("work/not-a-worktree")).unwrap();
        assert!(repo
            .ensure_worktree("main", "work/not-a-worktree")
            .await
            .is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_remove_worktree_preserves_branch() {
        let fixture = TempRepo::new().await.unwrap();
        fixture.commit("base").await.unwrap();
        let repo = fixture.repo();

        let wt = repo.ensure_worktree("main", "work/feat-b").await.unwrap();
        repo.remove_worktree("work/feat-b").await;
        assert!(!wt.path.exists());
        assert!(repo.branch_exists("feat-b").await.unwrap());
        // Removing again is a no-op.
        repo.remove_worktree("work/feat-b").await;
    }

    #[test_log::test(tokio::test)]
    async fn test_fast_forward_merge_advances_base() {
        let fixture = TempRepo::new().await.unwrap();
        fixture.commit("base").await.unwrap();
        let repo = fixture.repo();

        let wt = repo.ensure_worktree("main", "work/int").await.unwrap();
        let wt_checkout = Repo {
            path: wt.path.clone(),
            git_binary: repo.git_binary.clone(),
        };
        let tip = wt_checkout.commit_file("int.txt", "hello").await.unwrap();

        repo.fast_forward_merge("main", "int").await.unwrap();
        assert_eq!(repo.rev_parse("main").await.unwrap(), Some(tip));
    }

    #[test_log::test(tokio::test)]
    async fn test_fast_forward_merge_refuses_divergence() {
        let fixture = TempRepo::new().await.unwrap();
        fixture.commit("base").await.unwrap();
        let repo = fixture.repo();

        let wt = repo.ensure_worktree("main", "work/div").await.unwrap();
        let wt_checkout = Repo {
            path: wt.path.clone(),
            git_binary: repo.git_binary.clone(),
        };
        wt_checkout.commit_file("a.txt", "theirs").await.unwrap();
        // Diverge the base branch so no fast-forward is possible.
        let base_before = fixture.commit("diverge").await.unwrap();

        assert!(repo.fast_forward_merge("main", "div").await.is_err());
        assert_eq!(repo.rev_parse("main").await.unwrap(), Some(base_before));
    }

    #[test_log::test(tokio::test)]
    async fn test_commit_paths_skips_empty() {
        let fixture = TempRepo::new().await.unwrap();
        fixture.commit("base").await.unwrap();
        let repo = fixture.repo();

        let tracked = repo.path.join("tasks.json");
        fs::write(&tracked, "[]\n").unwrap();
        assert!(repo
            .commit_paths([&tracked], "docs: start T1")
            .await
            .unwrap());
        // Nothing changed, so no commit this time.
        assert!(!repo
            .commit_paths([&tracked], "docs: start T1")
            .await
            .unwrap());
    }
}
