pub mod captions;
pub mod embedded;
pub mod geom;
pub mod layout;
pub mod raster;
pub mod region;
pub mod source_tex;
pub mod text;
pub mod words;

use anyhow::Result;
use chrono::{DateTime, Utc};
use lopdf::{Document, Object};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::storage::PaperWorkspace;
use captions::Caption;
use geom::Rect;
use raster::{PageRenderer, MIN_LARGEST_PIXELS, MIN_RENDER_PIXELS, RENDER_SCALE};
use region::PageSize;

/// 超过该体积的 PDF 在 auto 策略下跳过源码包提取。
pub const AUTO_SKIP_SOURCE_PDF_BYTES: u64 = 30 * 1024 * 1024;
/// 超过该页数同样跳过。
pub const AUTO_SKIP_SOURCE_PDF_PAGES: usize = 50;

/// 论文章节
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub content: String,
    pub level: u8,
}

/// 提取出的一张图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    /// 落盘文件路径
    pub url: String,
    pub caption: String,
    /// 1 基，发现顺序即序号
    pub position: u32,
    /// [0,1] 的启发式相关度，供下游选图用
    pub relevance_score: f32,
    #[serde(default)]
    pub is_selected: bool,
}

/// 论文元数据与内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub title: String,
    pub authors: Vec<String>,
    pub affiliations: Vec<String>,
    pub abstract_text: String,
    pub published_date: Option<DateTime<Utc>>,
    pub arxiv_id: Option<String>,
    pub pdf_url: Option<String>,
    pub url: Option<String>,
    pub sections: Vec<Section>,
    pub images: Vec<ImageInfo>,
}

/// 是否尝试 arXiv 源码包。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePolicy {
    Auto,
    Always,
    Never,
}

impl SourcePolicy {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "always" | "yes" | "true" | "1" => SourcePolicy::Always,
            "never" | "no" | "false" | "0" => SourcePolicy::Never,
            _ => SourcePolicy::Auto,
        }
    }
}

/// 图注锚定裁剪图的相关度：越靠前的页、越高的图得分越高。
pub fn estimate_caption_relevance(page_index: usize, clip_height: f64) -> f32 {
    let page_bonus = (0.75 - page_index as f64 * 0.04).max(0.0);
    let height_bonus = (clip_height / 900.0).min(1.0) * 0.25;
    let score = (0.35 + page_bonus + height_bonus).min(1.0);
    (score * 1000.0).round() as f32 / 1000.0
}

/// 嵌入图片流的相关度：体积、页位置、页内序号综合。
pub fn estimate_embedded_relevance(page_index: usize, image_index: usize, byte_len: usize) -> f32 {
    let size_bonus = (byte_len as f64 / (512.0 * 1024.0)).min(1.0) * 0.3;
    let page_bonus = (0.8 - page_index as f64 * 0.05).max(0.0);
    let position_bonus = (0.2 - image_index as f64 * 0.02).max(0.0);
    let score = (0.2 + size_bonus + page_bonus + position_bonus).min(1.0);
    (score * 1000.0).round() as f32 / 1000.0
}

fn hash_file(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(format!("{:x}", md5::compute(bytes)))
}

/// 按内容哈希去重；后出现的重复图连文件一起删掉。
pub fn deduplicate_images(images: Vec<ImageInfo>) -> Vec<ImageInfo> {
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut deduped: Vec<ImageInfo> = Vec::new();

    for image in images {
        let path = PathBuf::from(&image.url);
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            continue;
        }
        let Some(digest) = hash_file(&path) else {
            continue;
        };
        if !seen.insert(digest) {
            debug!("重复图片，删除: {}", image.url);
            let _ = std::fs::remove_file(&path);
            continue;
        }
        deduped.push(image);
    }
    deduped
}

fn prepare_image_dir(dir: &Path, reset: bool) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    if reset {
        for entry in std::fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            if path.is_file() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
    Ok(())
}

/// 统一后的单页几何视图：两个访问层都折算成这个形态。
struct PageView {
    size: PageSize,
    captions: Vec<Caption>,
    objects: Vec<Rect>,
}

/// 文档元数据 Info 字典里的字符串（UTF-16BE BOM 或逐字节）。
fn pdf_text_string(object: &Object, doc: &Document) -> Option<String> {
    let resolved = match object {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    let Object::String(bytes, _) = resolved else {
        return None;
    };
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks(2)
            .filter(|c| c.len() == 2)
            .map(|c| ((c[0] as u16) << 8) | c[1] as u16)
            .collect();
        return String::from_utf16(&units).ok();
    }
    Some(bytes.iter().map(|&b| b as char).collect())
}

fn document_metadata(doc: &Document) -> (Option<String>, Option<String>) {
    let info = doc
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| match obj {
            Object::Reference(id) => doc.get_object(*id).ok(),
            other => Some(other),
        })
        .and_then(|obj| obj.as_dict().ok());

    let Some(info) = info else {
        return (None, None);
    };
    let title = info
        .get(b"Title")
        .ok()
        .and_then(|t| pdf_text_string(t, doc))
        .map(|t| text::clean_text(&t))
        .filter(|t| !t.is_empty());
    let author = info
        .get(b"Author")
        .ok()
        .and_then(|a| pdf_text_string(a, doc))
        .map(|a| text::clean_text(&a))
        .filter(|a| !a.is_empty());
    (title, author)
}

/// 词级页面拼回行文本，供切分与过滤用。
fn page_text_from_words(page: &words::PageWords) -> String {
    let mut lines: BTreeMap<i64, Vec<&words::Word>> = BTreeMap::new();
    for word in &page.words {
        let key = (word.bbox.y0 / 3.0).round() as i64;
        lines.entry(key).or_default().push(word);
    }
    let mut out: Vec<String> = Vec::new();
    for line_words in lines.values() {
        let mut sorted: Vec<&words::Word> = line_words.clone();
        sorted.sort_by(|a, b| {
            a.bbox
                .x0
                .partial_cmp(&b.bbox.x0)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let line = sorted
            .iter()
            .map(|w| w.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !line.is_empty() {
            out.push(line);
        }
    }
    out.join("\n")
}

/// 提取管道：文本结构化加上图片后端级联。
///
/// 级联顺序固定：源码包 → 图注锚定（内容流几何）→ 图注锚定（词级
/// 布局）→ 最大图形区域 → 嵌入图片流。前一级产出非空即停。
pub struct ExtractionPipeline {
    source_policy: SourcePolicy,
    /// 最终成功的后端名，仅用于日志与诊断
    pub last_image_backend: String,
    /// 源码包路径的诊断信息
    pub last_source_status: String,
    pub last_source_figure_blocks: usize,
}

impl ExtractionPipeline {
    pub fn new(source_policy: SourcePolicy) -> Self {
        Self {
            source_policy,
            last_image_backend: "none".to_string(),
            last_source_status: String::new(),
            last_source_figure_blocks: 0,
        }
    }

    /// 处理一篇论文的 PDF（可带已下载的源码包载荷），返回完整提取结果。
    pub fn process(
        &mut self,
        pdf_path: &Path,
        paper_key: &str,
        workspace: &PaperWorkspace,
        source_payload: Option<&Path>,
    ) -> Result<Paper> {
        info!("开始提取: {}", pdf_path.display());
        self.last_image_backend = "none".to_string();
        self.last_source_status.clear();
        self.last_source_figure_blocks = 0;

        let doc = Document::load(pdf_path).map_err(|e| {
            crate::utils::WxError::PdfError(format!("PDF 读取失败 {}: {}", pdf_path.display(), e))
        })?;
        let page_count = doc.get_pages().len();
        let pdf_bytes = std::fs::metadata(pdf_path).map(|m| m.len()).unwrap_or(0);
        info!("PDF 共 {} 页, {:.1}MB", page_count, pdf_bytes as f64 / 1e6);

        // 几何与词级两套布局都先扫出来，后端级联与文本结构化共用
        let layouts = layout::scan_document(&doc);
        let word_pages = match words::collect_words(&doc) {
            Ok(pages) => Some(pages),
            Err(e) => {
                warn!("词级布局提取失败: {}", e);
                None
            }
        };

        let page_lines = self.collect_page_lines(&layouts, word_pages.as_deref());
        let full_text = text::filter_noise_pages(&page_lines);
        if full_text.is_empty() {
            return Err(crate::utils::WxError::ParseError(format!(
                "PDF 中没有可提取的文本: {}",
                pdf_path.display()
            ))
            .into());
        }

        let (meta_title, meta_author) = document_metadata(&doc);
        let title = meta_title.unwrap_or_else(|| {
            pdf_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "Untitled".to_string())
        });
        let authors = meta_author
            .map(|a| text::parse_authors(&a))
            .unwrap_or_default();

        let sections = text::split_sections(&full_text);
        let abstract_text = text::extract_abstract(&full_text);
        let affiliations = text::extract_affiliations(&full_text, 6);
        info!("切出 {} 个章节", sections.len());

        let images_dir = workspace.images_dir();
        let mut images: Vec<ImageInfo> = Vec::new();

        if let Some(payload) = source_payload {
            if self.should_try_source(pdf_bytes, page_count) {
                info!("尝试源码包图片提取...");
                images = self
                    .extract_from_source(payload, workspace, pdf_path, &doc, &layouts, word_pages.as_deref())
                    .unwrap_or_else(|e| {
                        warn!("源码包提取失败: {}", e);
                        Vec::new()
                    });
                if !images.is_empty() && self.last_image_backend == "none" {
                    self.last_image_backend = "tex-source".to_string();
                }
            }
        }

        if images.is_empty() {
            info!("尝试图注锚定提取（内容流几何）...");
            images = self.caption_backend_layout(pdf_path, &layouts, &images_dir);
            if !images.is_empty() {
                self.last_image_backend = "pdf-caption".to_string();
            }
        }

        if images.is_empty() {
            if let Some(word_pages) = word_pages.as_deref() {
                info!("尝试图注锚定提取（词级布局）...");
                images =
                    self.caption_backend_words(pdf_path, word_pages, &layouts, &images_dir);
                if !images.is_empty() {
                    self.last_image_backend = "pdf-words".to_string();
                }
            }
        }

        if images.is_empty() {
            info!("尝试最大图形区域提取...");
            images = self.largest_backend(pdf_path, &layouts, &images_dir);
            if !images.is_empty() {
                self.last_image_backend = "pdf-largest".to_string();
            }
        }

        if images.is_empty() {
            info!("尝试嵌入图片流提取...");
            let _ = prepare_image_dir(&images_dir, true);
            images = match embedded::extract_embedded_images(&doc, paper_key, &images_dir) {
                Ok(extracted) => deduplicate_images(extracted),
                Err(e) => {
                    warn!("嵌入图片提取失败: {}", e);
                    Vec::new()
                }
            };
            if !images.is_empty() {
                self.last_image_backend = "pdf-embedded".to_string();
            }
        }

        info!(
            "图片后端: {} (共 {} 张)",
            self.last_image_backend,
            images.len()
        );

        Ok(Paper {
            title,
            authors,
            affiliations,
            abstract_text,
            published_date: None,
            arxiv_id: None,
            pdf_url: Some(pdf_path.to_string_lossy().to_string()),
            url: None,
            sections,
            images,
        })
    }

    fn should_try_source(&mut self, pdf_bytes: u64, page_count: usize) -> bool {
        match self.source_policy {
            SourcePolicy::Never => false,
            SourcePolicy::Always => true,
            SourcePolicy::Auto => {
                let mut reasons: Vec<String> = Vec::new();
                if pdf_bytes >= AUTO_SKIP_SOURCE_PDF_BYTES {
                    reasons.push(format!(
                        "体积 {:.1}MB >= {}MB",
                        pdf_bytes as f64 / 1e6,
                        AUTO_SKIP_SOURCE_PDF_BYTES / (1024 * 1024)
                    ));
                }
                if page_count >= AUTO_SKIP_SOURCE_PDF_PAGES {
                    reasons.push(format!("页数 {} >= {}", page_count, AUTO_SKIP_SOURCE_PDF_PAGES));
                }
                if reasons.is_empty() {
                    true
                } else {
                    let reason = reasons.join(", ");
                    self.last_source_status = format!("auto 跳过源码包 ({})", reason);
                    info!("跳过源码包提取: {}", reason);
                    false
                }
            }
        }
    }

    fn collect_page_lines(
        &self,
        layouts: &[layout::PageLayout],
        word_pages: Option<&[words::PageWords]>,
    ) -> Vec<Vec<String>> {
        let mut pages: Vec<Vec<String>> = Vec::new();

        if let Some(word_pages) = word_pages {
            for page in word_pages {
                let normalized = text::normalize_page_text(&page_text_from_words(page));
                let lines: Vec<String> = normalized.lines().map(String::from).collect();
                if !lines.is_empty() {
                    pages.push(lines);
                }
            }
        }
        if !pages.is_empty() {
            return pages;
        }

        // 词级提取整体失败时退回内容流扫描的文本块
        for page in layouts {
            let joined = page
                .text_blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let normalized = text::normalize_page_text(&joined);
            let lines: Vec<String> = normalized.lines().map(String::from).collect();
            if !lines.is_empty() {
                pages.push(lines);
            }
        }
        pages
    }

    /// 图注锚定的共享渲染循环：逐页逐图注求解区域并裁剪落盘。
    fn render_caption_pages(
        &self,
        pdf_path: &Path,
        pages: &[PageView],
        images_dir: &Path,
    ) -> Vec<ImageInfo> {
        if pages.iter().all(|p| p.captions.is_empty()) {
            return Vec::new();
        }
        if prepare_image_dir(images_dir, true).is_err() {
            return Vec::new();
        }
        let Ok(mut renderer) = PageRenderer::new(pdf_path, RENDER_SCALE) else {
            return Vec::new();
        };

        let mut extracted: Vec<ImageInfo> = Vec::new();
        let mut seq: u32 = 0;

        for (page_index, page) in pages.iter().enumerate() {
            for caption in &page.captions {
                let Some(mut clip) = region::resolve_caption_region(
                    &caption.bbox,
                    &caption.text,
                    &page.size,
                    &page.objects,
                ) else {
                    continue;
                };

                let mut rendered =
                    renderer.crop_region(page_index, &clip, page.size.width, page.size.height);
                let too_small = rendered
                    .as_ref()
                    .map(|img| raster::pixel_area(img) < MIN_RENDER_PIXELS)
                    .unwrap_or(true);
                if too_small {
                    // 裁得太小就对宽窗口再试一次
                    let alt = region::wide_window(
                        &page.size,
                        caption.bbox.y0,
                        page.size.header_guard(),
                    );
                    if alt.width() < region::MIN_CLIP_WIDTH
                        || alt.height() < region::MIN_CLIP_HEIGHT
                    {
                        continue;
                    }
                    let alt_rendered =
                        renderer.crop_region(page_index, &alt, page.size.width, page.size.height);
                    match alt_rendered {
                        Some(img) if raster::pixel_area(&img) >= MIN_RENDER_PIXELS => {
                            clip = alt;
                            rendered = Some(img);
                        }
                        _ => continue,
                    }
                }
                let Some(rendered) = rendered else {
                    continue;
                };

                seq += 1;
                let output = images_dir.join(format!("page_{:03}_{:03}.png", page_index + 1, seq));
                if rendered.save(&output).is_err() {
                    seq -= 1;
                    continue;
                }

                extracted.push(ImageInfo {
                    url: output.to_string_lossy().to_string(),
                    caption: caption.text.clone(),
                    position: seq,
                    relevance_score: estimate_caption_relevance(page_index, clip.height()),
                    is_selected: false,
                });
            }
        }

        deduplicate_images(extracted)
    }

    fn caption_backend_layout(
        &self,
        pdf_path: &Path,
        layouts: &[layout::PageLayout],
        images_dir: &Path,
    ) -> Vec<ImageInfo> {
        let pages: Vec<PageView> = layouts
            .iter()
            .map(|page| PageView {
                size: PageSize {
                    width: page.width,
                    height: page.height,
                },
                captions: captions::find_captions_in_blocks(&page.text_blocks),
                objects: page.graphic_objects(),
            })
            .collect();
        self.render_caption_pages(pdf_path, &pages, images_dir)
    }

    fn caption_backend_words(
        &self,
        pdf_path: &Path,
        word_pages: &[words::PageWords],
        layouts: &[layout::PageLayout],
        images_dir: &Path,
    ) -> Vec<ImageInfo> {
        let pages: Vec<PageView> = word_pages
            .iter()
            .enumerate()
            .map(|(index, page)| PageView {
                size: PageSize {
                    width: page.width,
                    height: page.height,
                },
                captions: captions::find_captions_in_words(&page.words),
                // 词级访问层只有文字，图形矩形借内容流扫描的图片位置
                objects: layouts
                    .get(index)
                    .map(|l| l.image_rects.clone())
                    .unwrap_or_default(),
            })
            .collect();
        self.render_caption_pages(pdf_path, &pages, images_dir)
    }

    /// 不依赖图注：取整篇里最大的几个图形区域直接裁。
    fn largest_backend(
        &self,
        pdf_path: &Path,
        layouts: &[layout::PageLayout],
        images_dir: &Path,
    ) -> Vec<ImageInfo> {
        const MAX_IMAGES: usize = 8;

        let mut candidates: Vec<(f64, usize, Rect)> = Vec::new();
        for (page_index, page) in layouts.iter().enumerate() {
            let cutoff = page.height * region::HEADER_CUTOFF_RATIO;
            for rect in &page.image_rects {
                if rect.y0 < cutoff {
                    continue;
                }
                if rect.width() < page.width * 0.20 || rect.height() < page.height * 0.06 {
                    continue;
                }
                candidates.push((rect.area(), page_index, *rect));
            }
        }
        if candidates.is_empty() {
            return Vec::new();
        }
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(MAX_IMAGES * 2);

        if prepare_image_dir(images_dir, true).is_err() {
            return Vec::new();
        }
        let Ok(mut renderer) = PageRenderer::new(pdf_path, RENDER_SCALE) else {
            return Vec::new();
        };

        let mut extracted: Vec<ImageInfo> = Vec::new();
        let mut seq: u32 = 0;
        for (_, page_index, rect) in candidates {
            let page = &layouts[page_index];
            let cutoff = page.height * region::HEADER_CUTOFF_RATIO;
            let pad_x = (page.width * 0.01).max(rect.width() * 0.02);
            let pad_y = (page.height * 0.01).max(rect.height() * 0.03);
            let clip = Rect::new(
                (rect.x0 - pad_x).max(0.0),
                (rect.y0 - pad_y).max(cutoff),
                (rect.x1 + pad_x).min(page.width),
                (rect.y1 + pad_y).min(page.height),
            );

            let Some(rendered) = renderer.crop_region(page_index, &clip, page.width, page.height)
            else {
                continue;
            };
            if raster::pixel_area(&rendered) < MIN_LARGEST_PIXELS {
                continue;
            }

            seq += 1;
            let output = images_dir.join(format!("page_{:03}_{:03}.png", page_index + 1, seq));
            if rendered.save(&output).is_err() {
                seq -= 1;
                continue;
            }
            extracted.push(ImageInfo {
                url: output.to_string_lossy().to_string(),
                caption: format!("Figure (page {})", page_index + 1),
                position: seq,
                relevance_score: estimate_caption_relevance(page_index, clip.height()),
                is_selected: false,
            });
            if extracted.len() >= MAX_IMAGES {
                break;
            }
        }

        deduplicate_images(extracted)
    }

    /// 源码包路径：解包、解析 figure 环境、落图，不足时用 PDF 图注
    /// 提取补齐缺口。
    #[allow(clippy::too_many_arguments)]
    fn extract_from_source(
        &mut self,
        payload: &Path,
        workspace: &PaperWorkspace,
        pdf_path: &Path,
        _doc: &Document,
        layouts: &[layout::PageLayout],
        word_pages: Option<&[words::PageWords]>,
    ) -> Result<Vec<ImageInfo>> {
        let source_dir = workspace.sources_dir();
        if source_dir.exists() {
            std::fs::remove_dir_all(&source_dir)?;
        }
        std::fs::create_dir_all(&source_dir)?;

        if !source_tex::unpack_source_archive(payload, &source_dir)? {
            self.last_source_status = "源码包解包失败".to_string();
            return Ok(Vec::new());
        }

        let (entries, block_count) = source_tex::parse_figure_entries(&source_dir);
        self.last_source_figure_blocks = block_count;
        if entries.is_empty() {
            self.last_source_status = if block_count > 0 {
                "找到 figure 环境但没有可用的 includegraphics 资源".to_string()
            } else {
                "源码里没有 figure 环境".to_string()
            };
        }
        let (by_name, by_stem) = source_tex::index_source_files(&source_dir);

        let scratch = tempfile::TempDir::new()?;
        let mut materialized: Vec<(PathBuf, String)> = Vec::new();
        let mut seen_sources: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();

        for entry in &entries {
            if materialized.len() >= source_tex::MAX_SOURCE_IMAGES {
                break;
            }
            let Some(resolved) = source_tex::resolve_graphic_path(
                &entry.include,
                &entry.tex_dir,
                &source_dir,
                &by_name,
                &by_stem,
            ) else {
                continue;
            };
            let canonical = resolved.canonicalize().unwrap_or(resolved.clone());
            if !seen_sources.insert(canonical) {
                continue;
            }
            let Some(output) = source_tex::materialize_source_image(
                &resolved,
                scratch.path(),
                materialized.len() + 1,
            ) else {
                continue;
            };
            let caption = if entry.caption.is_empty() {
                format!("Figure {}", materialized.len() + 1)
            } else {
                entry.caption.clone()
            };
            materialized.push((output, caption));
        }

        if materialized.is_empty() {
            for candidate in source_tex::collect_fallback_images(&source_dir) {
                if materialized.len() >= source_tex::MAX_SOURCE_IMAGES {
                    break;
                }
                let canonical = candidate.canonicalize().unwrap_or(candidate.clone());
                if !seen_sources.insert(canonical) {
                    continue;
                }
                let Some(output) = source_tex::materialize_source_image(
                    &candidate,
                    scratch.path(),
                    materialized.len() + 1,
                ) else {
                    continue;
                };
                materialized.push((output, format!("Figure {}", materialized.len() + 1)));
            }
        }

        if materialized.is_empty() {
            self.last_source_status = "源码里有图形引用但落图全部失败".to_string();
            return Ok(Vec::new());
        }

        let images_dir = workspace.images_dir();
        prepare_image_dir(&images_dir, true)?;
        let mut extracted: Vec<ImageInfo> = Vec::new();
        for (index, (source_image, caption)) in materialized.iter().enumerate() {
            let mut ext = source_image
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "png".to_string());
            if ext == "jpeg" {
                ext = "jpg".to_string();
            }
            let output = images_dir.join(format!("src_{:03}.{}", index + 1, ext));
            if std::fs::copy(source_image, &output).is_err() {
                continue;
            }
            let relevance = (0.98_f64 - index as f64 * 0.018).max(0.72);
            extracted.push(ImageInfo {
                url: output.to_string_lossy().to_string(),
                caption: caption.clone(),
                position: extracted.len() as u32 + 1,
                relevance_score: ((relevance * 1000.0).round() / 1000.0) as f32,
                is_selected: false,
            });
        }

        let mut deduped = deduplicate_images(extracted);
        self.last_source_status = if block_count > deduped.len() {
            format!(
                "源码包出图 {}/{}; 剩余 figure 多半是 tikz/forest 直接绘制",
                deduped.len(),
                block_count
            )
        } else {
            format!("源码包出图 {}", deduped.len())
        };

        // 还有 figure 没落成图时，用 PDF 图注提取补齐
        if block_count > deduped.len() && !deduped.is_empty() {
            deduped = self.supplement_with_pdf_captions(
                deduped,
                pdf_path,
                layouts,
                word_pages,
                &images_dir,
                block_count,
            );
        }

        Ok(deduped)
    }

    /// 用 PDF 图注提取结果补齐源码包缺口，按图注相似度挡掉重复图。
    fn supplement_with_pdf_captions(
        &mut self,
        source_images: Vec<ImageInfo>,
        pdf_path: &Path,
        layouts: &[layout::PageLayout],
        word_pages: Option<&[words::PageWords]>,
        images_dir: &Path,
        required_count: usize,
    ) -> Vec<ImageInfo> {
        let Ok(scratch) = tempfile::TempDir::new() else {
            return source_images;
        };
        let mut pdf_images = self.caption_backend_layout(pdf_path, layouts, scratch.path());
        if pdf_images.is_empty() {
            if let Some(word_pages) = word_pages {
                pdf_images =
                    self.caption_backend_words(pdf_path, word_pages, layouts, scratch.path());
            }
        }
        if pdf_images.is_empty() {
            return source_images;
        }

        let mut signatures: Vec<String> = source_images
            .iter()
            .map(|image| source_tex::caption_signature(&image.caption))
            .collect();
        let mut merged = source_images;
        let need = required_count.saturating_sub(merged.len());
        let mut added = 0usize;

        for image in pdf_images {
            if need > 0 && added >= need {
                break;
            }
            if source_tex::caption_is_duplicate(&image.caption, &signatures) {
                continue;
            }
            let source_path = PathBuf::from(&image.url);
            if !source_path.exists() {
                continue;
            }
            let mut ext = source_path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "png".to_string());
            if ext == "jpeg" {
                ext = "jpg".to_string();
            }
            let output = images_dir.join(format!("pdfsupp_{:03}.{}", added + 1, ext));
            if std::fs::copy(&source_path, &output).is_err() {
                continue;
            }

            signatures.push(source_tex::caption_signature(&image.caption));
            merged.push(ImageInfo {
                url: output.to_string_lossy().to_string(),
                caption: image.caption,
                position: merged.len() as u32 + 1,
                relevance_score: image.relevance_score,
                is_selected: false,
            });
            added += 1;
        }

        if added > 0 {
            self.last_source_status =
                format!("{}; 另从 PDF 兜底补了 {} 张", self.last_source_status, added);
            self.last_image_backend = "tex-source+pdf-supplement".to_string();
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn relevance_scores_stay_in_unit_range() {
        for page in 0..30 {
            let score = estimate_caption_relevance(page, 5000.0);
            assert!((0.0..=1.0).contains(&score));
        }
        let early = estimate_caption_relevance(0, 400.0);
        let late = estimate_caption_relevance(10, 400.0);
        assert!(early > late);
    }

    #[test]
    fn duplicate_content_hash_keeps_one_and_deletes_file() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.png");
        let second = dir.path().join("b.png");
        let third = dir.path().join("c.png");
        std::fs::write(&first, b"identical bytes").unwrap();
        std::fs::write(&second, b"identical bytes").unwrap();
        std::fs::write(&third, b"different bytes").unwrap();

        let images = vec![
            ImageInfo {
                url: first.to_string_lossy().to_string(),
                caption: "Figure 1".into(),
                position: 1,
                relevance_score: 0.9,
                is_selected: false,
            },
            ImageInfo {
                url: second.to_string_lossy().to_string(),
                caption: "Figure 2".into(),
                position: 2,
                relevance_score: 0.8,
                is_selected: false,
            },
            ImageInfo {
                url: third.to_string_lossy().to_string(),
                caption: "Figure 3".into(),
                position: 3,
                relevance_score: 0.7,
                is_selected: false,
            },
        ];

        let deduped = deduplicate_images(images);
        assert_eq!(deduped.len(), 2);
        assert!(first.exists());
        assert!(!second.exists(), "重复文件应被删除");
        assert!(third.exists());
        assert_eq!(deduped[0].caption, "Figure 1");
        assert_eq!(deduped[1].caption, "Figure 3");
    }

    #[test]
    fn source_policy_parsing() {
        assert_eq!(SourcePolicy::parse("always"), SourcePolicy::Always);
        assert_eq!(SourcePolicy::parse("NEVER"), SourcePolicy::Never);
        assert_eq!(SourcePolicy::parse("auto"), SourcePolicy::Auto);
        assert_eq!(SourcePolicy::parse("anything"), SourcePolicy::Auto);
    }

    #[test]
    fn auto_policy_skips_oversized_pdf() {
        let mut pipeline = ExtractionPipeline::new(SourcePolicy::Auto);
        assert!(pipeline.should_try_source(1024 * 1024, 12));
        assert!(!pipeline.should_try_source(AUTO_SKIP_SOURCE_PDF_BYTES, 12));
        assert!(!pipeline.should_try_source(1024, AUTO_SKIP_SOURCE_PDF_PAGES));

        let mut always = ExtractionPipeline::new(SourcePolicy::Always);
        assert!(always.should_try_source(AUTO_SKIP_SOURCE_PDF_BYTES * 2, 500));
        let mut never = ExtractionPipeline::new(SourcePolicy::Never);
        assert!(!never.should_try_source(0, 1));
    }
}
