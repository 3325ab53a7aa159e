use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("unable to spawn '{argv}': {source}")]
    Spawn {
        argv: String,
        source: std::io::Error,
    },

    #[error("'{argv}' exited with {status}, output:\n{output}")]
    Failed {
        argv: String,
        status: std::process::ExitStatus,
        output: String,
    },
}

/// Narrow subprocess capability used to reach the image manager and the
/// stack runtime. Tests substitute a fake so no real process runs.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command to completion, capturing its standard output.
    async fn output(
        &self,
        dir: Option<&Path>,
        argv: &[&str],
        envs: &[(&str, &str)],
    ) -> Result<String, CmdError>;

    /// Run a command to completion, streaming output to the caller's
    /// stdio. Used for long-running pulls and deploys.
    async fn stream(
        &self,
        dir: Option<&Path>,
        argv: &[&str],
        envs: &[(&str, &str)],
    ) -> Result<(), CmdError>;
}

/// Real [`Runner`] backed by [`tokio::process`].
pub struct Exec;

fn command(dir: Option<&Path>, argv: &[&str], envs: &[(&str, &str)]) -> Command {
    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..]);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd
}

#[async_trait]
impl Runner for Exec {
    async fn output(
        &self,
        dir: Option<&Path>,
        argv: &[&str],
        envs: &[(&str, &str)],
    ) -> Result<String, CmdError> {
        debug!("running {argv:?}");
        let out = command(dir, argv, envs)
            .output()
            .await
            .map_err(|source| CmdError::Spawn {
                argv: argv.join(" "),
                source,
            })?;

        if !out.status.success() {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            return Err(CmdError::Failed {
                argv: argv.join(" "),
                status: out.status,
                output,
            });
        }

        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn stream(
        &self,
        dir: Option<&Path>,
        argv: &[&str],
        envs: &[(&str, &str)],
    ) -> Result<(), CmdError> {
        debug!("running {argv:?}");
        let status = command(dir, argv, envs)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| CmdError::Spawn {
                argv: argv.join(" "),
                source,
            })?;

        if !status.success() {
            return Err(CmdError::Failed {
                argv: argv.join(" "),
                status,
                output: String::new(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// One recorded subprocess invocation.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Invocation {
        pub dir: Option<PathBuf>,
        pub argv: Vec<String>,
        pub envs: Vec<(String, String)>,
    }

    impl Invocation {
        pub fn line(&self) -> String {
            self.argv.join(" ")
        }
    }

    /// Scripted [`Runner`] recording every invocation.
    #[derive(Default)]
    pub struct FakeRunner {
        calls: Mutex<Vec<Invocation>>,
        outputs: Mutex<HashMap<String, String>>,
        failures: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Stdout returned when `program` is invoked via `output`.
        pub fn with_output(self, program: &str, out: &str) -> Self {
            self.outputs
                .lock()
                .unwrap()
                .insert(program.to_owned(), out.to_owned());
            self
        }

        /// Fail any invocation whose argv line contains `needle`.
        pub fn fail_when(self, needle: &str) -> Self {
            self.failures.lock().unwrap().push(needle.to_owned());
            self
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        /// Argv lines of every recorded invocation, for compact asserts.
        pub fn lines(&self) -> Vec<String> {
            self.calls().iter().map(Invocation::line).collect()
        }

        fn respond(
            &self,
            dir: Option<&Path>,
            argv: &[&str],
            envs: &[(&str, &str)],
        ) -> Result<String, CmdError> {
            let invocation = Invocation {
                dir: dir.map(Path::to_path_buf),
                argv: argv.iter().map(|s| s.to_string()).collect(),
                envs: envs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            };
            let line = invocation.line();
            self.calls.lock().unwrap().push(invocation);

            if self
                .failures
                .lock()
                .unwrap()
                .iter()
                .any(|needle| line.contains(needle.as_str()))
            {
                use std::os::unix::process::ExitStatusExt;
                return Err(CmdError::Failed {
                    argv: line,
                    status: std::process::ExitStatus::from_raw(256),
                    output: "scripted failure".to_owned(),
                });
            }

            Ok(self
                .outputs
                .lock()
                .unwrap()
                .get(argv[0])
                .cloned()
                .unwrap_or_default())
        }
    }

    #[async_trait]
    impl Runner for FakeRunner {
        async fn output(
            &self,
            dir: Option<&Path>,
            argv: &[&str],
            envs: &[(&str, &str)],
        ) -> Result<String, CmdError> {
            self.respond(dir, argv, envs)
        }

        async fn stream(
            &self,
            dir: Option<&Path>,
            argv: &[&str],
            envs: &[(&str, &str)],
        ) -> Result<(), CmdError> {
            self.respond(dir, argv, envs).map(|_| ())
        }
    }
}
