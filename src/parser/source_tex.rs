//! LaTeX 源码包图片提取。
//!
//! arXiv 的源码包能拿到矢量原图，质量远好于 PDF 截图，所以级联里
//! 排第一。流程：解包（tar → zip → 裸 gzip → 裸 TeX 启发式）、
//! 去注释、抽取 figure 环境、解析 \includegraphics 与 \caption、
//! 按路径与文件名索引定位图形文件、栅格化矢量源。
//!
//! 解包一律走防路径穿越的 API，越界成员直接丢弃。

use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::raster::rasterize_vector_pdf;

/// 源码包最多产出的图片数。
pub const MAX_SOURCE_IMAGES: usize = 12;
/// 位图文件小于该字节数视为占位图。
pub const SOURCE_MIN_BYTES: u64 = 12 * 1024;

pub const RASTER_EXTENSIONS: [&str; 8] = ["png", "jpg", "jpeg", "webp", "bmp", "gif", "tif", "tiff"];
pub const VECTOR_EXTENSIONS: [&str; 1] = ["pdf"];
pub const GRAPHIC_EXTENSIONS: [&str; 12] = [
    "png", "jpg", "jpeg", "webp", "bmp", "gif", "tif", "tiff", "pdf", "eps", "ps", "svg",
];

/// 一条 figure 环境里的图形引用。
#[derive(Debug, Clone)]
pub struct FigureEntry {
    pub tex_dir: PathBuf,
    pub include: String,
    pub caption: String,
}

fn ext_lower(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn is_raster_ext(ext: &str) -> bool {
    RASTER_EXTENSIONS.contains(&ext)
}

fn is_vector_ext(ext: &str) -> bool {
    VECTOR_EXTENSIONS.contains(&ext)
}

fn is_graphic_ext(ext: &str) -> bool {
    GRAPHIC_EXTENSIONS.contains(&ext)
}

/// 载荷是否像 HTML（下载被重定向到错误页时常见）。
pub fn looks_like_html_payload(payload: &[u8]) -> bool {
    let sample = payload
        .iter()
        .take(512)
        .map(|b| b.to_ascii_lowercase())
        .collect::<Vec<u8>>();
    let trimmed: &[u8] = {
        let start = sample
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(0);
        &sample[start..]
    };
    trimmed.starts_with(b"<!doctype html") || trimmed.starts_with(b"<html")
}

/// 载荷开头是否有 LaTeX 特征。
pub fn contains_latex_markers(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let head = &payload[..payload.len().min(8192)];
    let contains = |needle: &[u8]| head.windows(needle.len()).any(|w| w == needle);
    contains(b"\\documentclass") || contains(b"\\begin{document}") || contains(b"\\begin{figure")
}

fn try_untar(payload: &Path, dest: &Path) -> bool {
    let Ok(mut file) = File::open(payload) else {
        return false;
    };
    let mut magic = [0u8; 2];
    let gzipped = file
        .read_exact(&mut magic)
        .map(|_| magic == [0x1f, 0x8b])
        .unwrap_or(false);
    let Ok(file) = File::open(payload) else {
        return false;
    };

    let mut unpacked = 0usize;
    let result: std::io::Result<()> = (|| {
        if gzipped {
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
            for entry in archive.entries()? {
                let mut entry = entry?;
                // unpack_in 拒绝落在目标目录之外的成员
                if entry.unpack_in(dest)? {
                    unpacked += 1;
                }
            }
        } else {
            let mut archive = tar::Archive::new(file);
            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.unpack_in(dest)? {
                    unpacked += 1;
                }
            }
        }
        Ok(())
    })();

    result.is_ok() && unpacked > 0
}

fn try_unzip(payload: &Path, dest: &Path) -> bool {
    let Ok(file) = File::open(payload) else {
        return false;
    };
    let Ok(mut archive) = zip::ZipArchive::new(file) else {
        return false;
    };

    let mut unpacked = 0usize;
    for index in 0..archive.len() {
        let Ok(mut entry) = archive.by_index(index) else {
            continue;
        };
        // enclosed_name 已做穿越校验，None 的成员直接丢弃
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            let _ = std::fs::create_dir_all(&out_path);
            continue;
        }
        if let Some(parent) = out_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let Ok(mut out_file) = File::create(&out_path) else {
            continue;
        };
        if std::io::copy(&mut entry, &mut out_file).is_ok() {
            unpacked += 1;
        }
    }
    unpacked > 0
}

/// 解包源码载荷。容器格式逐个试，最后按裸 TeX 文件兜底。
pub fn unpack_source_archive(payload: &Path, dest: &Path) -> Result<bool> {
    let size = std::fs::metadata(payload)?.len();
    if size == 0 {
        return Ok(false);
    }

    if try_untar(payload, dest) {
        return Ok(true);
    }
    if try_unzip(payload, dest) {
        return Ok(true);
    }

    let bytes = std::fs::read(payload)?;
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
        let mut decompressed = Vec::new();
        if decoder.read_to_end(&mut decompressed).is_ok() && !decompressed.is_empty() {
            let inner = dest.join("_decompressed.bin");
            std::fs::write(&inner, &decompressed)?;
            let ok = unpack_source_archive(&inner, dest)?;
            let _ = std::fs::remove_file(&inner);
            if ok {
                return Ok(true);
            }
            if contains_latex_markers(&decompressed) {
                std::fs::write(dest.join("main.tex"), &decompressed)?;
                return Ok(true);
            }
        }
    }

    if contains_latex_markers(&bytes) {
        std::fs::write(dest.join("main.tex"), &bytes)?;
        return Ok(true);
    }

    Ok(walk_files(dest).iter().any(|p| ext_lower(p) == "tex"))
}

/// 递归列出目录下的全部文件。
pub fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files
}

/// 去掉 TeX 注释，保留转义的 `\%`。
pub fn strip_tex_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        let mut cut = line.len();
        let bytes = line.as_bytes();
        for (i, &b) in bytes.iter().enumerate() {
            if b == b'%' && (i == 0 || bytes[i - 1] != b'\\') {
                cut = i;
                break;
            }
        }
        out.push_str(&line[..cut]);
        out.push('\n');
    }
    out
}

fn figure_env_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)\\begin\{figure\*?\}(.*?)\\end\{figure\*?\}").unwrap()
    })
}

/// 抽取全部 figure / figure* 环境体。
pub fn extract_figure_blocks(tex_content: &str) -> Vec<String> {
    figure_env_re()
        .captures_iter(tex_content)
        .map(|cap| cap[1].to_string())
        .collect()
}

fn include_res() -> &'static [Regex; 2] {
    static RES: OnceLock<[Regex; 2]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"(?i)\\includegraphics(?:\s*\[[^\]]*\])?\s*\{([^{}]+)\}").unwrap(),
            Regex::new(r"(?i)\\includesvg(?:\s*\[[^\]]*\])?\s*\{([^{}]+)\}").unwrap(),
        ]
    })
}

/// figure 环境里全部 \includegraphics / \includesvg 的路径参数。
pub fn extract_include_paths(figure_block: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for re in include_res() {
        for cap in re.captures_iter(figure_block) {
            let value = cap[1].trim().to_string();
            if !value.is_empty() {
                paths.push(value);
            }
        }
    }
    paths
}

/// 从开括号位置按深度计数截取花括号内容。
/// 正则无法配平嵌套括号，caption 里嵌宏很常见，必须显式数。
fn extract_braced_text(text: &str, open_brace_index: usize) -> String {
    let bytes = text.as_bytes();
    if open_brace_index >= bytes.len() || bytes[open_brace_index] != b'{' {
        return String::new();
    }
    let mut depth = 0usize;
    let mut end = open_brace_index;
    for (offset, &b) in bytes[open_brace_index..].iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = open_brace_index + offset;
                    break;
                }
            }
            _ => {}
        }
    }
    if end <= open_brace_index {
        return String::new();
    }
    text[open_brace_index + 1..end].trim().to_string()
}

fn caption_head_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\\caption(?:\[[^\]]*\])?\s*\{").unwrap())
}

/// figure 环境里的 \caption 文本（已清洗）。
pub fn extract_caption(figure_block: &str) -> String {
    let Some(head) = caption_head_re().find(figure_block) else {
        return String::new();
    };
    let raw = extract_braced_text(figure_block, head.end() - 1);
    sanitize_caption(&raw)
}

/// 清洗 LaTeX caption：去 \label/\ref/\cite，塌掉单参数宏（最多 3 轮），
/// 抹掉残余命令与花括号，截断到 260 字符。
pub fn sanitize_caption(caption: &str) -> String {
    static LABEL_RE: OnceLock<Regex> = OnceLock::new();
    static REF_RE: OnceLock<Regex> = OnceLock::new();
    static CITE_RE: OnceLock<Regex> = OnceLock::new();
    static MACRO_RE: OnceLock<Regex> = OnceLock::new();
    static BARE_RE: OnceLock<Regex> = OnceLock::new();

    let label_re = LABEL_RE.get_or_init(|| Regex::new(r"\\label\{[^{}]*\}").unwrap());
    let ref_re = REF_RE.get_or_init(|| Regex::new(r"\\(?:eq|auto)?ref\{[^{}]*\}").unwrap());
    let cite_re = CITE_RE.get_or_init(|| Regex::new(r"\\cite\w*\{[^{}]*\}").unwrap());
    let macro_re =
        MACRO_RE.get_or_init(|| Regex::new(r"\\[a-zA-Z]+\*?(?:\[[^\]]*\])?\{([^{}]*)\}").unwrap());
    let bare_re = BARE_RE.get_or_init(|| Regex::new(r"\\[a-zA-Z]+\*?(?:\[[^\]]*\])?").unwrap());

    let mut value = caption.to_string();
    value = label_re.replace_all(&value, "").to_string();
    value = ref_re.replace_all(&value, "").to_string();
    value = cite_re.replace_all(&value, "").to_string();
    for _ in 0..3 {
        let collapsed = macro_re.replace_all(&value, "$1").to_string();
        if collapsed == value {
            break;
        }
        value = collapsed;
    }
    value = bare_re.replace_all(&value, "").to_string();
    value = value.replace(['{', '}'], "");
    let cleaned = value.split_whitespace().collect::<Vec<_>>().join(" ");
    cleaned.chars().take(260).collect()
}

/// 扫描源码树里的 .tex 文件，返回全部图形引用与 figure 环境总数。
pub fn parse_figure_entries(source_root: &Path) -> (Vec<FigureEntry>, usize) {
    let mut entries: Vec<FigureEntry> = Vec::new();
    let mut block_count = 0usize;

    let mut tex_files: Vec<PathBuf> = walk_files(source_root)
        .into_iter()
        .filter(|p| ext_lower(p) == "tex")
        .collect();
    // 浅层目录优先，主文件一般在根上
    tex_files.sort_by_key(|p| (p.components().count(), p.to_string_lossy().to_string()));

    for tex_path in tex_files {
        let Ok(raw) = std::fs::read_to_string(&tex_path) else {
            continue;
        };
        let content = strip_tex_comments(&raw);
        let blocks = extract_figure_blocks(&content);
        block_count += blocks.len();
        let tex_dir = tex_path.parent().unwrap_or(source_root).to_path_buf();

        for block in blocks {
            let includes = extract_include_paths(&block);
            if includes.is_empty() {
                continue;
            }
            let caption = extract_caption(&block);
            for include in includes {
                entries.push(FigureEntry {
                    tex_dir: tex_dir.clone(),
                    include,
                    caption: caption.clone(),
                });
            }
        }
    }
    (entries, block_count)
}

/// 文件名与文件名词干两套索引（全小写）。
pub fn index_source_files(
    source_root: &Path,
) -> (HashMap<String, Vec<PathBuf>>, HashMap<String, Vec<PathBuf>>) {
    let mut by_name: HashMap<String, Vec<PathBuf>> = HashMap::new();
    let mut by_stem: HashMap<String, Vec<PathBuf>> = HashMap::new();
    for path in walk_files(source_root) {
        if let Some(name) = path.file_name() {
            by_name
                .entry(name.to_string_lossy().to_lowercase())
                .or_default()
                .push(path.clone());
        }
        if let Some(stem) = path.file_stem() {
            by_stem
                .entry(stem.to_string_lossy().to_lowercase())
                .or_default()
                .push(path.clone());
        }
    }
    (by_name, by_stem)
}

/// 候选文件打分：大文件好，名字带 fig 加分，logo/icon 扣分，
/// 位图优于矢量。
fn source_file_rank(path: &Path) -> f64 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let ext = ext_lower(path);
    let size = std::fs::metadata(path).map(|m| m.len() as f64).unwrap_or(0.0);

    let mut score = (size / (256.0 * 1024.0)).min(12.0);
    if name.contains("fig") || name.contains("figure") {
        score += 3.5;
    }
    if name.contains("logo") || name.contains("icon") || name.contains("banner") {
        score -= 3.0;
    }
    if is_raster_ext(&ext) {
        score += 2.0;
    }
    if is_vector_ext(&ext) {
        score += 1.0;
    }
    score
}

/// 解析 include 路径：先按字面路径（相对所在 .tex 目录），
/// 无后缀时逐个补全已知图形后缀；都落空时查全项目文件名/词干索引。
pub fn resolve_graphic_path(
    include_token: &str,
    tex_dir: &Path,
    source_root: &Path,
    by_name: &HashMap<String, Vec<PathBuf>>,
    by_stem: &HashMap<String, Vec<PathBuf>>,
) -> Option<PathBuf> {
    let token = include_token
        .trim()
        .trim_matches(['"', '\''])
        .replace('\\', "/");
    if token.is_empty()
        || token.starts_with("http://")
        || token.starts_with("https://")
        || token.contains(['$', '{', '}'])
    {
        return None;
    }
    let token = token.split('#').next().unwrap_or("").trim().to_string();
    if token.is_empty() {
        return None;
    }

    let token_path = PathBuf::from(&token);
    let mut candidates: Vec<PathBuf> = vec![tex_dir.join(&token_path)];
    if token_path.extension().is_none() {
        for ext in GRAPHIC_EXTENSIONS {
            candidates.push(tex_dir.join(format!("{}.{}", token, ext)));
        }
    }

    for candidate in &candidates {
        if candidate.is_file() && is_graphic_ext(&ext_lower(candidate)) {
            return Some(candidate.clone());
        }
    }

    let file_key = token_path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())?;
    let stem_key = token_path
        .file_stem()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| file_key.clone());

    let mut options: Vec<PathBuf> = Vec::new();
    if let Some(paths) = by_name.get(&file_key) {
        options.extend(paths.iter().cloned());
    }
    if let Some(paths) = by_stem.get(&stem_key) {
        options.extend(paths.iter().cloned());
    }
    options.retain(|p| is_graphic_ext(&ext_lower(p)));
    options.sort();
    options.dedup();
    if options.is_empty() {
        return None;
    }

    options.sort_by(|a, b| {
        source_file_rank(b)
            .partial_cmp(&source_file_rank(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let best = options.into_iter().next()?;
    // 索引不应指到源码树之外
    if !best.starts_with(source_root) {
        return None;
    }
    Some(best)
}

/// figure 环境一个都没解析出来时，按打分捡源码树里的散图。
pub fn collect_fallback_images(source_root: &Path) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = walk_files(source_root)
        .into_iter()
        .filter(|p| {
            let ext = ext_lower(p);
            is_raster_ext(&ext) || is_vector_ext(&ext)
        })
        .filter(|p| {
            std::fs::metadata(p)
                .map(|m| m.len() >= SOURCE_MIN_BYTES)
                .unwrap_or(false)
        })
        .collect();
    candidates.sort_by(|a, b| {
        source_file_rank(b)
            .partial_cmp(&source_file_rank(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(MAX_SOURCE_IMAGES);
    candidates
}

/// 把一个源文件落成可用的图片：位图直拷（过小的丢弃），
/// 矢量 PDF 走栅格化链。其余格式不处理。
pub fn materialize_source_image(
    source_path: &Path,
    output_dir: &Path,
    sequence: usize,
) -> Option<PathBuf> {
    let ext = ext_lower(source_path);

    if is_raster_ext(&ext) {
        let size = std::fs::metadata(source_path).ok()?.len();
        if size < SOURCE_MIN_BYTES {
            debug!("位图太小，跳过: {}", source_path.display());
            return None;
        }
        let final_ext = if ext == "jpeg" { "jpg" } else { &ext };
        let output = output_dir.join(format!("source_{:03}.{}", sequence, final_ext));
        if std::fs::copy(source_path, &output).is_err() {
            return None;
        }
        return Some(output);
    }

    if is_vector_ext(&ext) {
        let output = output_dir.join(format!("source_{:03}.png", sequence));
        if rasterize_vector_pdf(source_path, &output) {
            return Some(output);
        }
        warn!("矢量源栅格化失败: {}", source_path.display());
    }

    None
}

/// 图注签名：去掉 "Figure N" 前缀，取长度大于 2 的字母数字词，
/// 最多 24 个，小写拼接。
pub fn caption_signature(caption: &str) -> String {
    static PREFIX_RE: OnceLock<Regex> = OnceLock::new();
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    let prefix_re = PREFIX_RE
        .get_or_init(|| Regex::new(r"(?i)^\s*(figure|fig\.?)\s*\d+\s*[:.\-]?\s*").unwrap());
    let token_re = TOKEN_RE.get_or_init(|| Regex::new(r"[a-z0-9]+").unwrap());

    let text = prefix_re.replace(&caption.to_lowercase(), "").to_string();
    token_re
        .find_iter(&text)
        .map(|m| m.as_str())
        .filter(|t| t.len() > 2)
        .take(24)
        .collect::<Vec<_>>()
        .join(" ")
}

/// 词重叠率：2 × 共同词数 / 词数之和。
fn token_overlap_ratio(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let set_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let common = set_a.intersection(&set_b).count();
    2.0 * common as f64 / (set_a.len() + set_b.len()) as f64
}

/// 判断图注是否与已有签名重复：完全相等、长前缀包含（双方都够长），
/// 或词重叠率达到 0.72。
pub fn caption_is_duplicate(caption: &str, signatures: &[String]) -> bool {
    let candidate = caption_signature(caption);
    if candidate.is_empty() {
        return false;
    }
    for signature in signatures {
        if signature.is_empty() {
            continue;
        }
        if &candidate == signature {
            return true;
        }
        if (candidate.contains(signature.as_str()) || signature.contains(candidate.as_str()))
            && candidate.len().min(signature.len()) >= 26
        {
            return true;
        }
        if token_overlap_ratio(&candidate, signature) >= 0.72 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn comments_stripped_but_escaped_percent_kept() {
        let tex = "real content % trailing comment\nvalue is 50\\% here\n% whole line";
        let stripped = strip_tex_comments(tex);
        assert!(stripped.contains("real content"));
        assert!(!stripped.contains("trailing comment"));
        assert!(stripped.contains("50\\% here"));
        assert!(!stripped.contains("whole line"));
    }

    #[test]
    fn figure_blocks_extracted_including_starred() {
        let tex = r"\begin{figure}[t]\includegraphics{a}\end{figure} text \begin{figure*}\includegraphics{b}\end{figure*}";
        let blocks = extract_figure_blocks(tex);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("{a}"));
        assert!(blocks[1].contains("{b}"));
    }

    #[test]
    fn include_paths_with_options_parsed() {
        let block = r"\centering \includegraphics[width=0.9\linewidth]{figs/model.pdf} \includesvg{diagram}";
        let paths = extract_include_paths(block);
        assert_eq!(paths, vec!["figs/model.pdf", "diagram"]);
    }

    #[test]
    fn caption_with_nested_braces_parsed_by_depth() {
        let block = r"\caption{Results of \textbf{our method} on \emph{both} splits.\label{fig:r}}";
        let caption = extract_caption(block);
        assert_eq!(caption, "Results of our method on both splits.");
    }

    #[test]
    fn caption_sanitization_removes_refs_and_cites() {
        let raw = r"Comparison with \cite{smith2020} (see \ref{fig:a}). \label{fig:b} Best viewed \textit{zoomed in}.";
        let cleaned = sanitize_caption(raw);
        assert!(!cleaned.contains("smith2020"));
        assert!(!cleaned.contains("fig:"));
        assert!(cleaned.contains("Best viewed zoomed in."));
    }

    #[test]
    fn include_token_resolves_via_stem_index_across_directories() {
        // \includegraphics{fig_3} 无后缀，实际文件在另一个子目录里
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let tex_dir = root.join("sections");
        let fig_dir = root.join("graphics");
        std::fs::create_dir_all(&tex_dir).unwrap();
        std::fs::create_dir_all(&fig_dir).unwrap();
        std::fs::write(fig_dir.join("fig_3.pdf"), vec![0u8; 2048]).unwrap();

        let (by_name, by_stem) = index_source_files(root);
        let resolved = resolve_graphic_path("fig_3", &tex_dir, root, &by_name, &by_stem);
        assert_eq!(resolved, Some(fig_dir.join("fig_3.pdf")));
    }

    #[test]
    fn literal_path_preferred_over_index() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("model.png"), vec![0u8; 1024]).unwrap();
        let (by_name, by_stem) = index_source_files(root);
        let resolved = resolve_graphic_path("model.png", root, root, &by_name, &by_stem);
        assert_eq!(resolved, Some(root.join("model.png")));
    }

    #[test]
    fn dynamic_tokens_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (by_name, by_stem) = index_source_files(dir.path());
        assert!(
            resolve_graphic_path("${DIR}/plot", dir.path(), dir.path(), &by_name, &by_stem)
                .is_none()
        );
        assert!(resolve_graphic_path(
            "https://example.com/x.png",
            dir.path(),
            dir.path(),
            &by_name,
            &by_stem
        )
        .is_none());
    }

    #[test]
    fn tar_member_escaping_destination_is_dropped() {
        let dir = TempDir::new().unwrap();
        let payload_path = dir.path().join("payload.tar");
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let content = b"\\documentclass{article}";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "main.tex", content.as_slice())
            .unwrap();
        let mut evil_header = tar::Header::new_gnu();
        evil_header.set_size(4);
        // Newer `tar` versions reject `..` in `append_data`/`set_path`, so write
        // the escaping member name straight into the header and use `append`,
        // which does not validate the path — keeping the malicious fixture intact.
        {
            let gnu = evil_header.as_gnu_mut().unwrap();
            let name = b"../evil.txt";
            gnu.name[..name.len()].copy_from_slice(name);
        }
        evil_header.set_cksum();
        builder.append(&evil_header, b"oops".as_slice()).unwrap();
        let bytes = builder.into_inner().unwrap();
        std::fs::write(&payload_path, bytes).unwrap();

        assert!(unpack_source_archive(&payload_path, &dest).unwrap());
        assert!(dest.join("main.tex").exists());
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn bare_latex_payload_becomes_main_tex() {
        let dir = TempDir::new().unwrap();
        let payload = dir.path().join("payload.bin");
        std::fs::write(&payload, b"\\documentclass{article}\\begin{document}x\\end{document}")
            .unwrap();
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        assert!(unpack_source_archive(&payload, &dest).unwrap());
        assert!(dest.join("main.tex").exists());
    }

    #[test]
    fn caption_similarity_detects_duplicates() {
        let sig = caption_signature("Figure 3: Overview of the proposed dual-branch architecture");
        let sigs = vec![sig];
        assert!(caption_is_duplicate(
            "Fig. 3 - Overview of the proposed dual-branch architecture",
            &sigs
        ));
        assert!(!caption_is_duplicate(
            "Figure 9: Ablation on learning rate schedules and batch sizes",
            &sigs
        ));
    }

    #[test]
    fn figure_entries_parsed_from_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(
            root.join("main.tex"),
            r"intro \begin{figure}\includegraphics{fig1.png}\caption{First figure}\end{figure} % \begin{figure}commented\end{figure}
\begin{figure*}\includegraphics[width=\textwidth]{fig2}\caption{Second}\end{figure*}",
        )
        .unwrap();
        let (entries, blocks) = parse_figure_entries(root);
        assert_eq!(blocks, 2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].include, "fig1.png");
        assert_eq!(entries[0].caption, "First figure");
    }
}
