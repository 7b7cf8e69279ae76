//! `run` subcommand: one command in a throwaway sandbox.

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Args;

use crate::archive::read_local_files;
use crate::daemon::ExecutionResult;
use crate::manager::SandboxManager;
use crate::session::ExecOptions;

/// Exit code reported when the command hit its wall-clock limit.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// A local file and the path it gets inside the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    pub local: PathBuf,
    pub remote: String,
}

impl FromStr for FileMapping {
    type Err = String;

    /// Parses `LOCAL[:REMOTE]`; without `REMOTE` the local file name is used.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (local, remote) = match raw.split_once(':') {
            Some((local, remote)) => (local, Some(remote)),
            None => (raw, None),
        };
        if local.is_empty() {
            return Err(format!("missing local path in '{}'", raw));
        }

        let local = PathBuf::from(local);
        let remote = match remote {
            Some(remote) if !remote.is_empty() => remote.to_string(),
            Some(_) => return Err(format!("missing remote path in '{}'", raw)),
            None => local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| format!("'{}' has no file name", raw))?,
        };
        Ok(Self { local, remote })
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Profile name
    pub profile: String,

    /// Copy a local file into the working directory (LOCAL[:REMOTE]); repeatable
    #[arg(short, long = "file", value_name = "LOCAL[:REMOTE]")]
    pub files: Vec<FileMapping>,

    /// Feed this file to the command's stdin
    #[arg(long, value_name = "PATH")]
    pub stdin_file: Option<PathBuf>,

    /// Wall-clock limit in seconds
    #[arg(short, long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Shell command to run
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

/// Map an execution result to a process exit code.
pub fn exit_code_for(result: &ExecutionResult) -> i32 {
    if result.timed_out {
        return TIMEOUT_EXIT_CODE;
    }
    match i32::try_from(result.exit_code) {
        Ok(code) if code >= 0 => code,
        _ => 1,
    }
}

/// Quote argv words into one `/bin/sh -c` script that runs them unchanged.
pub fn shell_command(words: &[String]) -> anyhow::Result<String> {
    shlex::try_join(words.iter().map(String::as_str))
        .map_err(|e| anyhow::anyhow!("Cannot quote command for the shell: {}", e))
}

/// Run the `run` subcommand and return the exit code.
pub async fn run_run_command(manager: &SandboxManager, args: RunArgs) -> anyhow::Result<i32> {
    let mappings: Vec<(PathBuf, String)> = args
        .files
        .iter()
        .map(|m| (m.local.clone(), m.remote.clone()))
        .collect();
    let files = read_local_files(&mappings)?;

    let mut options = ExecOptions::new();
    if let Some(path) = &args.stdin_file {
        let stdin = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read stdin file {}: {}", path.display(), e))?;
        options = options.stdin(stdin);
    }
    if let Some(secs) = args.timeout {
        options = options.timeout(Duration::from_secs(secs));
    }

    let command = shell_command(&args.command)?;
    let result = manager
        .run_ephemeral(&args.profile, &command, &files, options)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result_json(&result))?);
    } else {
        std::io::stdout().write_all(&result.stdout)?;
        std::io::stderr().write_all(&result.stderr)?;
        if result.timed_out {
            eprintln!(
                "agentic-sandbox: command timed out after {:.1}s",
                result.duration.as_secs_f64()
            );
        }
        if result.oom_killed {
            eprintln!("agentic-sandbox: command was killed for exceeding its memory limit");
        }
    }

    Ok(exit_code_for(&result))
}

fn result_json(result: &ExecutionResult) -> serde_json::Value {
    serde_json::json!({
        "stdout": result.stdout_text(),
        "stderr": result.stderr_text(),
        "exit_code": result.exit_code,
        "timed_out": result.timed_out,
        "oom_killed": result.oom_killed,
        "duration_ms": result.duration.as_millis() as u64,
    })
}
