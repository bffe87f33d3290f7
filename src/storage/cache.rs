use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use super::PaperWorkspace;
use crate::parser::Paper;
use crate::utils::WxError;

/// 解析结果的落盘记录：Paper 全量字段加保存时间戳。
/// 纯写透缓存，存在且可读时可跳过重新抓取，坏了删掉重来即可。
#[derive(Debug, Serialize, Deserialize)]
pub struct ParsedRecord {
    #[serde(flatten)]
    pub paper: Paper,
    pub saved_at: DateTime<Utc>,
}

fn cache_path(workspace: &PaperWorkspace) -> PathBuf {
    workspace.parsed_dir().join(format!("{}.json", workspace.key()))
}

/// 把解析结果写进工作目录的 parsed/ 下。
pub fn save_parsed(paper: &Paper, workspace: &PaperWorkspace) -> Result<PathBuf> {
    let record = ParsedRecord {
        paper: paper.clone(),
        saved_at: Utc::now(),
    };
    let path = cache_path(workspace);
    let payload = serde_json::to_string_pretty(&record).map_err(WxError::from)?;
    std::fs::create_dir_all(workspace.parsed_dir())?;
    std::fs::write(&path, payload)?;
    info!("解析缓存已写入: {}", path.display());
    Ok(path)
}

/// 读取已有的解析缓存；不存在或解析失败返回 None。
pub fn load_parsed(workspace: &PaperWorkspace) -> Option<Paper> {
    let path = cache_path(workspace);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<ParsedRecord>(&content) {
        Ok(record) => {
            debug!("命中解析缓存: {}", path.display());
            Some(record.paper)
        }
        Err(e) => {
            debug!("解析缓存损坏，忽略: {} ({})", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Section;
    use std::path::Path;
    use tempfile::TempDir;

    fn sample_paper() -> Paper {
        Paper {
            title: "A Study".to_string(),
            authors: vec!["Alice".to_string()],
            affiliations: vec![],
            abstract_text: "Short abstract.".to_string(),
            published_date: None,
            arxiv_id: Some("2401.00001".to_string()),
            pdf_url: None,
            url: None,
            sections: vec![Section {
                title: "Main Content".to_string(),
                content: "body".to_string(),
                level: 2,
            }],
            images: vec![],
        }
    }

    #[test]
    fn parsed_cache_round_trip() {
        let dir = TempDir::new().unwrap();
        let workspace = PaperWorkspace::new(dir.path(), "2401.00001");
        workspace.ensure().unwrap();

        let paper = sample_paper();
        let path = save_parsed(&paper, &workspace).unwrap();
        assert!(path.exists());

        let loaded = load_parsed(&workspace).unwrap();
        assert_eq!(loaded.title, paper.title);
        assert_eq!(loaded.sections.len(), 1);
    }

    #[test]
    fn missing_cache_returns_none() {
        let workspace = PaperWorkspace::new(Path::new("/nonexistent/cache"), "x");
        assert!(load_parsed(&workspace).is_none());
    }
}
