//! Artifact producer running git and an external build command
//!
//! Committed files are read straight from the mirror. Compile mode exports
//! the tree at the requested commit into a scratch directory, runs the
//! configured command there and stores the resulting PDF together with the
//! blob hashes of the source files it was built from.

use async_trait::async_trait;
use shared::{process_debug, DependencyHash, ProcessId, ProductionMode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::services::git_source::{parse_ls_tree, run_git, run_git_raw, GitCliSource};
use crate::traits::{ArtifactProducer, ArtifactStore, ProduceRequest, ProducedArtifact};

/// Extensions recorded as compile inputs
const SOURCE_EXTENSIONS: &[&str] = &["tex", "bib", "bst", "cls", "sty", "png", "jpg", "jpeg", "eps", "svg", "pdf"];

/// Placeholder in the build command replaced by the tracked path
pub const PATH_PLACEHOLDER: &str = "{path}";

pub struct CommandProducer<A>
where
    A: ArtifactStore + 'static,
{
    git: Arc<GitCliSource>,
    artifacts: Arc<A>,
    /// Program and arguments of the compile command
    command: Vec<String>,
}

impl<A> CommandProducer<A>
where
    A: ArtifactStore + 'static,
{
    pub fn new(git: Arc<GitCliSource>, artifacts: Arc<A>, command: Vec<String>) -> Self {
        Self { git, artifacts, command }
    }

    /// Default command: `latexmk -pdf -interaction=nonstopmode {path}`
    pub fn latexmk(git: Arc<GitCliSource>, artifacts: Arc<A>) -> Self {
        let command = ["latexmk", "-pdf", "-interaction=nonstopmode", PATH_PLACEHOLDER]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self::new(git, artifacts, command)
    }

    async fn ensure_exists(&self, mirror: &Path, request: &ProduceRequest) -> OrchestratorResult<()> {
        let object = format!("{}:{}", request.commit_sha, request.path);
        match run_git(Some(mirror), &["cat-file", "-e", &object], "cat-file").await {
            Ok(_) => Ok(()),
            Err(_) => Err(OrchestratorError::SourceNotFound {
                path: request.path.clone(),
            }),
        }
    }

    async fn fetch_committed(&self, mirror: &Path, request: &ProduceRequest) -> OrchestratorResult<ProducedArtifact> {
        let object = format!("{}:{}", request.commit_sha, request.path);
        let bytes = run_git_raw(Some(mirror), &["cat-file", "blob", &object], "cat-file").await?;
        let blob_hash = run_git(Some(mirror), &["rev-parse", &object], "rev-parse").await?;

        let size_bytes = bytes.len() as u64;
        let artifact = self.artifacts.store(bytes).await?;
        Ok(ProducedArtifact {
            artifact,
            size_bytes,
            dependencies: None,
            blob_hash: Some(blob_hash.trim().to_string()),
        })
    }

    async fn compile(&self, mirror: &Path, request: &ProduceRequest) -> OrchestratorResult<ProducedArtifact> {
        let workdir = tempfile::tempdir()?;
        let archive = workdir.path().join("source.tar");
        let archive_arg = archive.to_string_lossy().to_string();
        run_git(
            Some(mirror),
            &["archive", "--format=tar", "-o", &archive_arg, &request.commit_sha],
            "archive",
        )
        .await?;
        let tree = workdir.path().join("tree");
        tokio::fs::create_dir_all(&tree).await?;
        run_tool("tar", &["-xf", &archive_arg, "-C", &tree.to_string_lossy()], &tree, &request.path).await?;

        let (program, args) = self.command.split_first().ok_or_else(|| OrchestratorError::Producer {
            path: request.path.clone(),
            message: "no build command configured".to_string(),
        })?;
        let args: Vec<String> = args.iter().map(|a| a.replace(PATH_PLACEHOLDER, &request.path)).collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        process_debug!(ProcessId::current(), "🔨 Compiling {} at {}", request.path, request.commit_sha);
        run_tool(program, &args, &tree, &request.path).await?;

        let pdf = output_path(&tree, &request.path);
        let bytes = tokio::fs::read(&pdf).await.map_err(|e| OrchestratorError::Producer {
            path: request.path.clone(),
            message: format!("build produced no {}: {e}", pdf.display()),
        })?;

        let listing = run_git(Some(mirror), &["ls-tree", "-r", &request.commit_sha], "ls-tree").await?;
        let dependencies = source_fingerprints(&listing, &request.path);

        let size_bytes = bytes.len() as u64;
        let artifact = self.artifacts.store(bytes).await?;
        Ok(ProducedArtifact {
            artifact,
            size_bytes,
            dependencies: Some(dependencies),
            blob_hash: None,
        })
    }
}

#[async_trait]
impl<A> ArtifactProducer for CommandProducer<A>
where
    A: ArtifactStore + 'static,
{
    async fn compile_or_fetch(&self, request: ProduceRequest) -> OrchestratorResult<ProducedArtifact> {
        let mirror = self.git.ensure_mirror(&request.repo).await?;
        self.ensure_exists(&mirror, &request).await?;
        match request.mode {
            ProductionMode::Committed => self.fetch_committed(&mirror, &request).await,
            ProductionMode::Compile => self.compile(&mirror, &request).await,
        }
    }
}

async fn run_tool(program: &str, args: &[&str], dir: &Path, path: &str) -> OrchestratorResult<()> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| OrchestratorError::Producer {
            path: path.to_string(),
            message: format!("failed to run {program}: {e}"),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(5)..].join("\n");
        return Err(OrchestratorError::Producer {
            path: path.to_string(),
            message: format!("{program} exited with {}: {tail}", output.status),
        });
    }
    Ok(())
}

/// PDF written next to the main source file
fn output_path(tree: &Path, source: &str) -> PathBuf {
    tree.join(Path::new(source).with_extension("pdf"))
}

/// Blob hashes of every source-like file, excluding the build output
fn source_fingerprints(ls_tree: &str, source: &str) -> Vec<DependencyHash> {
    let output = Path::new(source).with_extension("pdf");
    let mut deps: Vec<DependencyHash> = parse_ls_tree(ls_tree)
        .into_iter()
        .filter(|(path, _)| {
            let p = Path::new(path);
            p != output
                && p
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .map(|(path, hash)| DependencyHash::new(path, hash))
        .collect();
    deps.sort_by(|a, b| a.path.cmp(&b.path));
    deps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprints_cover_sources_but_not_output() {
        let listing = "100644 blob a1\tpaper/main.tex\n\
                       100644 blob a2\tpaper/main.pdf\n\
                       100644 blob a3\tpaper/refs.bib\n\
                       100644 blob a4\tREADME.md\n\
                       100644 blob a5\tfigs/Plot.PNG\n";
        let deps = source_fingerprints(listing, "paper/main.tex");
        assert_eq!(
            deps,
            vec![
                DependencyHash::new("figs/Plot.PNG", "a5"),
                DependencyHash::new("paper/main.tex", "a1"),
                DependencyHash::new("paper/refs.bib", "a3"),
            ]
        );
    }

    #[test]
    fn test_output_next_to_source() {
        assert_eq!(
            output_path(Path::new("/tmp/x"), "paper/main.tex"),
            PathBuf::from("/tmp/x/paper/main.pdf")
        );
    }
}
