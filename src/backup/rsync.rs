use anyhow::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::supervisor::CommandSpec;
use super::SyncRequest;
use crate::utils::config::Config;

const DRY_RUN_FLAGS: &[&str] = &[
    "--dry-run",
    "--archive",
    "--delete",
    "--stats",
    "--itemize-changes",
    "--verbose",
];

const SYNC_FLAGS: &[&str] = &["--archive", "--delete", "--itemize-changes", "--verbose"];

/// Builds rsync argument vectors for both passes of a mirror operation.
#[derive(Debug, Clone)]
pub struct RsyncCommand {
    program: PathBuf,
    excludes: Vec<String>,
}

impl RsyncCommand {
    pub fn new(program: impl Into<PathBuf>, excludes: Vec<String>) -> Self {
        Self {
            program: program.into(),
            excludes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.rsync_path, config.rsync_excludes.clone())
    }

    pub fn dry_run(&self, request: &SyncRequest) -> CommandSpec {
        self.build(DRY_RUN_FLAGS, request)
    }

    pub fn sync(&self, request: &SyncRequest) -> CommandSpec {
        self.build(SYNC_FLAGS, request)
    }

    fn build(&self, flags: &[&str], request: &SyncRequest) -> CommandSpec {
        let mut args: Vec<OsString> = flags.iter().map(OsString::from).collect();

        // Add excludes
        for exclude in &self.excludes {
            args.push(format!("--exclude={}", exclude).into());
        }

        args.push(with_trailing_separator(&request.source));
        args.push(without_trailing_separator(&request.target));

        CommandSpec {
            program: self.program.clone(),
            args,
        }
    }
}

/// Copies the contents of the directory rather than the directory itself.
fn with_trailing_separator(path: &Path) -> OsString {
    let mut raw = path.as_os_str().to_os_string();
    if !raw.to_string_lossy().ends_with(std::path::MAIN_SEPARATOR) {
        raw.push(std::path::MAIN_SEPARATOR_STR);
    }
    raw
}

fn without_trailing_separator(path: &Path) -> OsString {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim_end_matches(std::path::MAIN_SEPARATOR);
    if trimmed.is_empty() {
        // Root stays as the separator itself.
        OsString::from(std::path::MAIN_SEPARATOR_STR)
    } else if trimmed.len() == raw.len() {
        path.as_os_str().to_os_string()
    } else {
        OsString::from(trimmed)
    }
}

/// Check if rsync is available
pub async fn check_rsync(program: &Path) -> Result<String> {
    let output = Command::new(program).arg("--version").output().await?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("{} --version failed", program.display()));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    Ok(version.lines().next().unwrap_or("unknown").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(spec: &CommandSpec) -> Vec<String> {
        spec.args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn dry_run_is_simulated_and_itemized() {
        let command = RsyncCommand::new("/usr/bin/rsync", vec![".DS_Store".into(), "*.tmp".into()]);
        let request = SyncRequest::new("/data/photos", "/mnt/backup/photos/").unwrap();
        let spec = command.dry_run(&request);

        assert_eq!(spec.program, PathBuf::from("/usr/bin/rsync"));
        assert_eq!(
            args(&spec),
            vec![
                "--dry-run",
                "--archive",
                "--delete",
                "--stats",
                "--itemize-changes",
                "--verbose",
                "--exclude=.DS_Store",
                "--exclude=*.tmp",
                "/data/photos/",
                "/mnt/backup/photos",
            ]
        );
    }

    #[test]
    fn real_pass_drops_simulation_flags() {
        let command = RsyncCommand::new("rsync", Vec::new());
        let request = SyncRequest::new("/data/photos/", "/mnt/backup").unwrap();
        let spec = command.sync(&request);

        assert!(!spec.has_arg("--dry-run"));
        assert!(!spec.has_arg("--stats"));
        assert!(spec.has_arg("--delete"));
        assert_eq!(
            args(&spec)[SYNC_FLAGS.len()..],
            ["/data/photos/".to_string(), "/mnt/backup".to_string()]
        );
    }

    #[test]
    fn trailing_separator_normalisation() {
        assert_eq!(with_trailing_separator(Path::new("/a/b")), OsString::from("/a/b/"));
        assert_eq!(with_trailing_separator(Path::new("/a/b/")), OsString::from("/a/b/"));
        assert_eq!(without_trailing_separator(Path::new("/a/b//")), OsString::from("/a/b"));
        assert_eq!(without_trailing_separator(Path::new("/")), OsString::from("/"));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        assert!(check_rsync(Path::new("/nonexistent/rsync-binary")).await.is_err());
    }
}
