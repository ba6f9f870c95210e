//! Resolve a model reference (local directory or hub repo id) to a snapshot directory
//! holding `config.json` and the `*.safetensors` archives.

mod providers;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail, ensure};
use tracing::{debug, info};

pub use providers::{AssetProvider, HuggingFaceProvider};

pub const DEFAULT_REPO_ID: &str = "Qwen/Qwen2.5-VL-3B-Instruct";

/// Files fetched from a hub snapshot. Python sources are never downloaded.
pub const SNAPSHOT_PATTERNS: [&str; 4] =
    ["*.json", "*.safetensors", "tokenizer.model", "*.tiktoken"];

pub fn resolve_snapshot(path_or_repo: &str) -> Result<PathBuf> {
    resolve_snapshot_in(path_or_repo, None)
}

/// Like [`resolve_snapshot`], downloading into `cache_dir` instead of the default hub cache.
pub fn resolve_snapshot_in(path_or_repo: &str, cache_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(local) = local_snapshot(path_or_repo)? {
        return Ok(local);
    }
    let provider = HuggingFaceProvider::new(cache_dir.map(Path::to_path_buf))?;
    fetch_snapshot(&provider, path_or_repo)
}

/// An existing directory is used as is; an existing file resolves to its directory.
fn local_snapshot(path_or_repo: &str) -> Result<Option<PathBuf>> {
    let path = Path::new(path_or_repo);
    if path.is_dir() {
        debug!(dir = %path.display(), "using local snapshot");
        return Ok(Some(path.to_path_buf()));
    }
    if path.is_file() {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        return Ok(Some(parent.to_path_buf()));
    }
    Ok(None)
}

pub fn fetch_snapshot(provider: &dyn AssetProvider, repo_id: &str) -> Result<PathBuf> {
    validate_repo_id(repo_id)?;
    let wanted: Vec<String> = provider
        .list_files(repo_id)?
        .into_iter()
        .filter(|name| is_snapshot_file(name))
        .collect();
    if wanted.is_empty() {
        bail!("{repo_id} publishes no config or weight files");
    }
    providers::announce_provider(provider, repo_id, wanted.len());

    let mut snapshot: Option<PathBuf> = None;
    for name in &wanted {
        let local = provider
            .fetch(repo_id, name)
            .with_context(|| format!("failed to fetch {name} from {repo_id}"))?;
        let dir = providers::snapshot_dir_of(&local)
            .ok_or_else(|| anyhow!("downloaded file {} has no parent", local.display()))?;
        match &snapshot {
            Some(existing) if existing != &dir => bail!(
                "files of {repo_id} landed in different directories: {} and {}",
                existing.display(),
                dir.display()
            ),
            Some(_) => {}
            None => snapshot = Some(dir),
        }
    }
    let dir = snapshot.ok_or_else(|| anyhow!("no files fetched for {repo_id}"))?;
    info!(repo = repo_id, dir = %dir.display(), files = wanted.len(), "resolved snapshot");
    Ok(dir)
}

fn validate_repo_id(repo_id: &str) -> Result<()> {
    let mut parts = repo_id.split('/');
    let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        bail!("{repo_id} is neither an existing path nor an owner/name repo id");
    };
    ensure!(
        !owner.is_empty() && !name.is_empty(),
        "{repo_id} is neither an existing path nor an owner/name repo id"
    );
    Ok(())
}

/// Top-level files matching [`SNAPSHOT_PATTERNS`].
pub fn is_snapshot_file(name: &str) -> bool {
    !name.contains('/')
        && SNAPSHOT_PATTERNS.iter().any(|pattern| match pattern.strip_prefix('*') {
            Some(suffix) => name.ends_with(suffix),
            None => name == *pattern,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, fs};

    struct DirProvider {
        root: PathBuf,
        files: Vec<&'static str>,
        fetched: RefCell<Vec<String>>,
    }

    impl AssetProvider for DirProvider {
        fn display_name(&self) -> &'static str {
            "directory"
        }

        fn list_files(&self, _repo_id: &str) -> Result<Vec<String>> {
            Ok(self.files.iter().map(|f| f.to_string()).collect())
        }

        fn fetch(&self, _repo_id: &str, remote_name: &str) -> Result<PathBuf> {
            self.fetched.borrow_mut().push(remote_name.to_string());
            let path = self.root.join(remote_name);
            fs::write(&path, b"{}")?;
            Ok(path)
        }
    }

    #[test]
    fn filters_snapshot_files() {
        assert!(is_snapshot_file("config.json"));
        assert!(is_snapshot_file("model-00001-of-00002.safetensors"));
        assert!(is_snapshot_file("tokenizer.model"));
        assert!(is_snapshot_file("qwen.tiktoken"));
        assert!(!is_snapshot_file("modeling_qwen.py"));
        assert!(!is_snapshot_file("onnx/model.json"));
        assert!(!is_snapshot_file("README.md"));
    }

    #[test]
    fn local_directories_and_files_resolve_in_place() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = dir.path().join("config.json");
        fs::write(&config, b"{}")?;
        let as_dir = resolve_snapshot(dir.path().to_str().expect("utf-8 path"))?;
        assert_eq!(as_dir, dir.path());
        let as_file = resolve_snapshot(config.to_str().expect("utf-8 path"))?;
        assert_eq!(as_file, dir.path());
        Ok(())
    }

    #[test]
    fn fetches_only_matching_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = DirProvider {
            root: dir.path().to_path_buf(),
            files: vec!["config.json", "model.safetensors", "modeling.py", "README.md"],
            fetched: RefCell::new(Vec::new()),
        };
        let snapshot = fetch_snapshot(&provider, "Qwen/Qwen2-VL-2B-Instruct")?;
        assert_eq!(snapshot, dir.path());
        assert_eq!(
            provider.fetched.into_inner(),
            vec!["config.json".to_string(), "model.safetensors".to_string()]
        );
        Ok(())
    }

    #[test]
    fn rejects_malformed_repo_ids() {
        let provider = DirProvider {
            root: PathBuf::from("."),
            files: Vec::new(),
            fetched: RefCell::new(Vec::new()),
        };
        for bad in ["no-slash", "a/b/c", "/name"] {
            let err = fetch_snapshot(&provider, bad).expect_err("malformed id");
            assert!(err.to_string().contains("owner/name"));
        }
    }
}
