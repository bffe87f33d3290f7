//! 文章骨架生成：把解析结果排成公众号风格的 markdown 草稿。
//! 正文改写由下游接手，这里只负责结构与图注。

use std::path::Path;

use crate::parser::{ImageInfo, Paper};

/// 单节正文在草稿里的最大字符数，超出截断。
const SECTION_PREVIEW_CHARS: usize = 2000;

/// 生成 markdown 文章骨架。图片路径按相对 `images/` 引用，
/// 与工作目录里的落盘位置对应。
pub fn generate_article_markdown(paper: &Paper, include_images: bool, max_images: usize) -> String {
    let mut out = String::new();

    out.push_str(&format!("# {}\n\n", paper.title.trim()));

    if !paper.authors.is_empty() {
        out.push_str(&format!("**作者**: {}\n\n", paper.authors.join(", ")));
    }
    if !paper.affiliations.is_empty() {
        out.push_str(&format!("**单位**: {}\n\n", paper.affiliations.join("; ")));
    }
    if let Some(date) = paper.published_date {
        out.push_str(&format!("**发表**: {}\n\n", date.format("%Y-%m-%d")));
    }
    if let Some(url) = &paper.url {
        out.push_str(&format!("**原文**: {}\n\n", url));
    }

    if !paper.abstract_text.is_empty() {
        out.push_str("> ");
        out.push_str(paper.abstract_text.trim());
        out.push_str("\n\n");
    }

    for section in &paper.sections {
        out.push_str(&format!("## {}\n\n", section.title.trim()));
        let content = section.content.trim();
        if content.chars().count() > SECTION_PREVIEW_CHARS {
            let truncated: String = content.chars().take(SECTION_PREVIEW_CHARS).collect();
            out.push_str(&truncated);
            out.push_str("...\n\n");
        } else {
            out.push_str(content);
            out.push_str("\n\n");
        }
    }

    if include_images && !paper.images.is_empty() {
        out.push_str("## 图表\n\n");
        for image in paper.images.iter().take(max_images) {
            out.push_str(&format!(
                "![{}]({})\n\n*{}*\n\n",
                image.caption.replace('[', "(").replace(']', ")"),
                image_ref(image),
                image.caption
            ));
        }
    }

    out
}

/// 文章放在论文工作目录根上，图片引用写成相对路径。
fn image_ref(image: &ImageInfo) -> String {
    Path::new(&image.url)
        .file_name()
        .map(|name| format!("images/{}", name.to_string_lossy()))
        .unwrap_or_else(|| image.url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Section;

    fn sample_paper() -> Paper {
        Paper {
            title: "Sample Paper".to_string(),
            authors: vec!["Alice".to_string(), "Bob".to_string()],
            affiliations: vec!["Some University".to_string()],
            abstract_text: "We study things.".to_string(),
            published_date: None,
            arxiv_id: None,
            pdf_url: None,
            url: Some("https://arxiv.org/abs/2401.00001".to_string()),
            sections: vec![Section {
                title: "Introduction".to_string(),
                content: "Intro body.".to_string(),
                level: 2,
            }],
            images: vec![ImageInfo {
                url: "/cache/p/images/page_001_001.png".to_string(),
                caption: "Figure 1: Overview".to_string(),
                position: 1,
                relevance_score: 0.9,
                is_selected: true,
            }],
        }
    }

    #[test]
    fn markdown_contains_all_parts() {
        let md = generate_article_markdown(&sample_paper(), true, 10);
        assert!(md.starts_with("# Sample Paper"));
        assert!(md.contains("**作者**: Alice, Bob"));
        assert!(md.contains("> We study things."));
        assert!(md.contains("## Introduction"));
        assert!(md.contains("![Figure 1: Overview](images/page_001_001.png)"));
    }

    #[test]
    fn images_omitted_when_disabled() {
        let md = generate_article_markdown(&sample_paper(), false, 10);
        assert!(!md.contains("images/page_001_001.png"));
    }

    #[test]
    fn image_count_capped() {
        let mut paper = sample_paper();
        let base = paper.images[0].clone();
        for i in 2..=6 {
            let mut img = base.clone();
            img.url = format!("/cache/p/images/page_00{}_001.png", i);
            img.position = i;
            paper.images.push(img);
        }
        let md = generate_article_markdown(&paper, true, 3);
        assert_eq!(md.matches("![").count(), 3);
    }
}
