pub mod cache;

pub use cache::{load_parsed, save_parsed, ParsedRecord};

use std::path::{Path, PathBuf};

/// 单篇论文的工作目录：下载、源码、解析缓存、图片各一个子目录。
///
/// 同一缓存根下按 key 隔离，重复运行可直接复用下载产物。
#[derive(Debug, Clone)]
pub struct PaperWorkspace {
    root: PathBuf,
    key: String,
}

impl PaperWorkspace {
    pub fn new(cache_root: &Path, paper_key: &str) -> Self {
        let key = safe_key(paper_key);
        Self {
            root: cache_root.join(&key),
            key,
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.downloads_dir())?;
        std::fs::create_dir_all(self.sources_dir())?;
        std::fs::create_dir_all(self.parsed_dir())?;
        std::fs::create_dir_all(self.images_dir())?;
        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.root.join("sources")
    }

    pub fn parsed_dir(&self) -> PathBuf {
        self.root.join("parsed")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }
}

/// 把论文标识转成可做目录名的 key。
pub fn safe_key(value: &str) -> String {
    let cleaned = value.trim().replace('/', "_");
    if cleaned.is_empty() {
        "paper".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_key_replaces_slashes() {
        assert_eq!(safe_key("cs/0112017"), "cs_0112017");
        assert_eq!(safe_key("2401.00001"), "2401.00001");
        assert_eq!(safe_key(""), "paper");
    }

    #[test]
    fn workspace_paths_are_nested_under_key() {
        let ws = PaperWorkspace::new(Path::new("/tmp/cache"), "cs/0112017");
        assert_eq!(ws.images_dir(), PathBuf::from("/tmp/cache/cs_0112017/images"));
        assert_eq!(ws.key(), "cs_0112017");
    }
}
