use std::process::Output;

use anyhow::{anyhow, bail};
use tokio::process::Command;

pub trait OutputExt {
    // Exit code of the process, or an error if it was killed by a signal.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
    // Error unless the process terminated with exit code 0. The error message
    // includes both output streams, since by the time you see it the process
    // is long gone and that's all the evidence there will ever be.
    fn ok(&self) -> anyhow::Result<()>;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .ok_or_else(|| anyhow!("process killed by signal"))
    }

    fn ok(&self) -> anyhow::Result<()> {
        let code = self.code_not_killed()?;
        if code != 0 {
            bail!(
                "failed with exit code {}. stderr:\n{}\nstdout:\n{}",
                code,
                String::from_utf8_lossy(&self.stderr),
                String::from_utf8_lossy(&self.stdout)
            );
        }
        Ok(())
    }
}

pub trait CommandExt {
    // Run the command to completion and capture its output, treating a
    // non-zero exit code as an error. Use plain .output() plus
    // code_not_killed() when you care about the code itself.
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self
            .output()
            .await
            .map_err(|e| anyhow!("spawning {:?}: {}", self.as_std(), e))?;
        output.ok()?;
        Ok(output)
    }
}
