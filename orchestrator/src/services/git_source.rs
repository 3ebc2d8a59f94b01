//! Source provider backed by the `git` command line
//!
//! Every remote gets a bare mirror under the mirror directory. Metadata,
//! diffs and blob hashes are read from the mirror; only the cheap head check
//! (`ls-remote`) talks to the remote directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{process_debug, CommitInfo, ProcessId, RepoRef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::traits::{LatestCommit, SourceProvider};

/// Field separator for `git log --format`
const FIELD_SEP: char = '\u{1f}';

pub struct GitCliSource {
    /// Directory holding one bare mirror per remote
    mirror_dir: PathBuf,
}

impl GitCliSource {
    pub fn new(mirror_dir: PathBuf) -> Self {
        Self { mirror_dir }
    }

    /// Mirror location for a remote
    pub fn mirror_path(&self, repo: &RepoRef) -> PathBuf {
        let name: String = repo
            .remote
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.mirror_dir.join(format!("{name}.git"))
    }

    /// Clone the mirror on first use
    pub async fn ensure_mirror(&self, repo: &RepoRef) -> OrchestratorResult<PathBuf> {
        let path = self.mirror_path(repo);
        if !path.exists() {
            tokio::fs::create_dir_all(&self.mirror_dir).await?;
            let target = path.to_string_lossy().to_string();
            run_git(None, &["clone", "--mirror", "--quiet", &repo.remote, &target], "clone").await?;
            process_debug!(ProcessId::current(), "🪞 Created mirror of {} at {}", repo, path.display());
        }
        Ok(path)
    }

    /// Clone or update the mirror
    pub async fn sync_mirror(&self, repo: &RepoRef) -> OrchestratorResult<PathBuf> {
        let existed = self.mirror_path(repo).exists();
        let path = self.ensure_mirror(repo).await?;
        if existed {
            run_git(Some(&path), &["remote", "update", "--prune"], "fetch").await?;
        }
        Ok(path)
    }

    async fn remote_head(&self, repo: &RepoRef, branch: &str) -> OrchestratorResult<String> {
        let refname = format!("refs/heads/{branch}");
        let out = run_git(None, &["ls-remote", &repo.remote, &refname], "ls-remote").await?;
        out.split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::source("ls-remote", format!("branch {branch} not found on {repo}")))
    }
}

#[async_trait]
impl SourceProvider for GitCliSource {
    async fn fetch_latest_commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        known_hash: Option<String>,
    ) -> OrchestratorResult<LatestCommit> {
        if let Some(known) = known_hash {
            let head = self.remote_head(repo, branch).await?;
            if head == known {
                return Ok(LatestCommit {
                    commit: CommitInfo::sha_only(head),
                    unchanged: true,
                });
            }
        }

        let mirror = self.sync_mirror(repo).await?;
        let format = format!("--format=%H{FIELD_SEP}%an{FIELD_SEP}%aI{FIELD_SEP}%s");
        let refname = format!("refs/heads/{branch}");
        let out = run_git(Some(&mirror), &["log", "-1", &format, &refname], "log").await?;
        Ok(LatestCommit {
            commit: parse_commit_line(out.trim())?,
            unchanged: false,
        })
    }

    async fn fetch_changed_files(&self, repo: &RepoRef, base: &str, head: &str) -> OrchestratorResult<Vec<String>> {
        let mirror = self.ensure_mirror(repo).await?;
        let out = run_git(Some(&mirror), &["diff", "--name-only", base, head], "diff").await?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    async fn fetch_content_hashes(
        &self,
        repo: &RepoRef,
        git_ref: &str,
        paths: Vec<String>,
    ) -> OrchestratorResult<HashMap<String, Option<String>>> {
        let mirror = self.ensure_mirror(repo).await?;
        let mut args = vec!["ls-tree", "-r", git_ref, "--"];
        args.extend(paths.iter().map(String::as_str));
        let out = run_git(Some(&mirror), &args, "ls-tree").await?;

        let found = parse_ls_tree(&out);
        Ok(paths
            .into_iter()
            .map(|path| {
                let hash = found.get(&path).cloned();
                (path, hash)
            })
            .collect())
    }
}

/// Run git and return stdout, mapping a non-zero exit to a source error
pub(crate) async fn run_git(dir: Option<&Path>, args: &[&str], operation: &str) -> OrchestratorResult<String> {
    let output = run_git_raw(dir, args, operation).await?;
    Ok(String::from_utf8_lossy(&output).into_owned())
}

/// Run git and return raw stdout bytes
pub(crate) async fn run_git_raw(dir: Option<&Path>, args: &[&str], operation: &str) -> OrchestratorResult<Vec<u8>> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");

    let output = cmd
        .output()
        .await
        .map_err(|e| OrchestratorError::source(operation, format!("failed to run git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OrchestratorError::source(operation, stderr.trim()));
    }
    Ok(output.stdout)
}

fn parse_commit_line(line: &str) -> OrchestratorResult<CommitInfo> {
    let mut fields = line.split(FIELD_SEP);
    let sha = fields
        .next()
        .filter(|sha| !sha.is_empty())
        .ok_or_else(|| OrchestratorError::source("log", "empty commit output"))?;
    let author = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
    let date = fields
        .next()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));
    let message = fields.next().filter(|s| !s.is_empty()).map(str::to_string);

    Ok(CommitInfo {
        sha: sha.to_string(),
        message,
        author,
        date,
    })
}

/// Map path to blob hash from `ls-tree -r` output
pub(crate) fn parse_ls_tree(out: &str) -> HashMap<String, String> {
    out.lines()
        .filter_map(|line| {
            let (meta, path) = line.split_once('\t')?;
            let mut meta = meta.split_whitespace();
            let _mode = meta.next()?;
            let kind = meta.next()?;
            let hash = meta.next()?;
            (kind == "blob").then(|| (path.to_string(), hash.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commit_line() {
        let line = format!("abc123{FIELD_SEP}Ada{FIELD_SEP}2024-03-01T10:00:00+01:00{FIELD_SEP}Fix proof");
        let commit = parse_commit_line(&line).unwrap();
        assert_eq!(commit.sha, "abc123");
        assert_eq!(commit.author.as_deref(), Some("Ada"));
        assert_eq!(commit.message.as_deref(), Some("Fix proof"));
        assert_eq!(commit.date.unwrap().to_rfc3339(), "2024-03-01T09:00:00+00:00");
    }

    #[test]
    fn test_parse_ls_tree_keeps_blobs() {
        let out = "100644 blob aaa111\tmain.tex\n040000 tree bbb222\tfigures\n100644 blob ccc333\tfigures/plot.png\n";
        let hashes = parse_ls_tree(out);
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes.get("main.tex").map(String::as_str), Some("aaa111"));
        assert_eq!(hashes.get("figures/plot.png").map(String::as_str), Some("ccc333"));
    }

    #[test]
    fn test_mirror_path_is_flat() {
        let source = GitCliSource::new(PathBuf::from("/var/mirrors"));
        let path = source.mirror_path(&RepoRef::new("https://host/team/paper.git"));
        assert_eq!(path, PathBuf::from("/var/mirrors/https___host_team_paper_git.git"));
    }
}
