// Static site build step: the generator run and the optional search index

pub mod command;
pub mod pagefind;

pub use command::CommandSiteBuilder;
pub use pagefind::PagefindIndexer;

use async_trait::async_trait;
use sitedeploy_core::{CancellationToken, DeployOutcome};
use std::fs;
use std::io;
use std::path::Path;

/// Options for a single generator run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOptions {
    pub clean: bool,
    pub base_url_override: Option<String>,
}

/// Produces the artifact directory from the site sources.
///
/// A successful outcome carries the artifact path in `data.publicDir` and the
/// captured generator log in `data.output`.
#[async_trait]
pub trait SiteBuilder: Send + Sync {
    async fn build(
        &self,
        source_root: &Path,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> DeployOutcome;
}

/// Secondary build step that indexes an already built site for search
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    fn name(&self) -> &str;

    async fn index(&self, public_dir: &Path, cancel: &CancellationToken) -> DeployOutcome;
}

/// Remove everything inside `dir`, keeping the directory itself.
/// Returns the number of top-level entries removed; a missing dir is a no-op.
pub fn clean_dir(dir: &Path) -> io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Count regular files below `dir`
pub fn count_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}
