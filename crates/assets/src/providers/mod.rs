use std::path::{Path, PathBuf};

use anyhow::Result;

mod hugging_face;

pub use hugging_face::HuggingFaceProvider;

/// A remote model hub that can materialise a repository snapshot on local disk.
pub trait AssetProvider {
    fn display_name(&self) -> &'static str;

    /// Top-level file names published in `repo_id`.
    fn list_files(&self, repo_id: &str) -> Result<Vec<String>>;

    /// Download one file and return its path inside the local snapshot directory.
    fn fetch(&self, repo_id: &str, remote_name: &str) -> Result<PathBuf>;
}

pub(crate) fn announce_provider(provider: &dyn AssetProvider, repo_id: &str, files: usize) {
    tracing::info!(
        "Fetching {files} files from {repo_id} via {}",
        provider.display_name()
    );
}

pub(crate) fn snapshot_dir_of(path: &Path) -> Option<PathBuf> {
    path.parent().map(Path::to_path_buf)
}
