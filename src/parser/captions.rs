//! 图注定位。
//!
//! 在页面文本布局中找 "Figure N" / "Fig. N" 样式的图注行。两种输入
//! 形态共用一个契约：结构化文本块（内容流扫描产出）或按纵向量化
//! 分组的单词行（词级访问层产出），输出都按页面自上而下排序。

use regex::Regex;
use std::sync::OnceLock;

use super::geom::Rect;
use super::layout::TextBlock;
use super::words::Word;

/// 图注匹配允许出现的最大起始字符位（含）。正文里 "see Figure 3"
/// 之类的引用都出现在行中段，用这个界限挡掉。
const MAX_MATCH_START_CHARS: usize = 18;
/// 图注文本截断长度（字符数）。
const MAX_CAPTION_CHARS: usize = 160;
/// 单词按纵坐标归并到行的量化桶高。
const LINE_BUCKET_UNITS: f64 = 3.0;

/// 一条定位到的图注：截断后的文本与包围盒。
#[derive(Debug, Clone)]
pub struct Caption {
    pub text: String,
    pub bbox: Rect,
}

fn caption_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(figure|fig\.?)\s*\d+[\s:.\-]+").unwrap())
}

fn word_caption_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(figure|fig\.?)\s*\d+[\s:._\-]+").unwrap())
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space && !out.is_empty() {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

/// 从匹配处截取图注文本（按字符数截断）。
fn caption_text_at(clean: &str, match_start: usize) -> String {
    clean[match_start..]
        .chars()
        .take(MAX_CAPTION_CHARS)
        .collect()
}

fn match_near_line_start(clean: &str, re: &Regex) -> Option<usize> {
    let m = re.find(clean)?;
    let chars_before = clean[..m.start()].chars().count();
    if chars_before > MAX_MATCH_START_CHARS {
        return None;
    }
    Some(m.start())
}

/// 在结构化文本块里找图注。
pub fn find_captions_in_blocks(blocks: &[TextBlock]) -> Vec<Caption> {
    let re = caption_re();
    let mut captions: Vec<Caption> = Vec::new();

    for block in blocks {
        let clean = collapse_whitespace(&block.text);
        if clean.is_empty() {
            continue;
        }
        let Some(start) = match_near_line_start(&clean, re) else {
            continue;
        };
        captions.push(Caption {
            text: caption_text_at(&clean, start),
            bbox: block.bbox,
        });
    }

    captions.sort_by(|a, b| a.bbox.y0.partial_cmp(&b.bbox.y0).unwrap_or(std::cmp::Ordering::Equal));
    captions
}

/// 在词级布局里找图注：先按纵坐标量化分行，再在行文本上匹配。
pub fn find_captions_in_words(words: &[Word]) -> Vec<Caption> {
    if words.is_empty() {
        return Vec::new();
    }
    let re = word_caption_re();

    let mut lines: std::collections::BTreeMap<i64, Vec<&Word>> = std::collections::BTreeMap::new();
    for word in words {
        let key = (word.bbox.y0 / LINE_BUCKET_UNITS).round() as i64;
        lines.entry(key).or_default().push(word);
    }

    let mut captions: Vec<Caption> = Vec::new();
    for line_words in lines.values() {
        let mut sorted: Vec<&Word> = line_words.clone();
        sorted.sort_by(|a, b| a.bbox.x0.partial_cmp(&b.bbox.x0).unwrap_or(std::cmp::Ordering::Equal));

        let joined = sorted
            .iter()
            .map(|w| w.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let clean = collapse_whitespace(&joined);
        if clean.is_empty() {
            continue;
        }
        let Some(start) = match_near_line_start(&clean, re) else {
            continue;
        };

        let x0 = sorted.iter().map(|w| w.bbox.x0).fold(f64::INFINITY, f64::min);
        let x1 = sorted.iter().map(|w| w.bbox.x1).fold(f64::NEG_INFINITY, f64::max);
        let top = sorted.iter().map(|w| w.bbox.y0).fold(f64::INFINITY, f64::min);
        let bottom = sorted.iter().map(|w| w.bbox.y1).fold(f64::NEG_INFINITY, f64::max);

        captions.push(Caption {
            text: caption_text_at(&clean, start),
            bbox: Rect::new(x0, top, x1, bottom),
        });
    }

    captions.sort_by(|a, b| a.bbox.y0.partial_cmp(&b.bbox.y0).unwrap_or(std::cmp::Ordering::Equal));
    captions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(text: &str, y0: f64) -> TextBlock {
        TextBlock {
            text: text.to_string(),
            bbox: Rect::new(50.0, y0, 400.0, y0 + 12.0),
        }
    }

    #[test]
    fn caption_at_line_start_is_detected() {
        let blocks = vec![block("Figure 3: Results on the benchmark suite.", 500.0)];
        let captions = find_captions_in_blocks(&blocks);
        assert_eq!(captions.len(), 1);
        assert!(captions[0].text.starts_with("Figure 3"));
    }

    #[test]
    fn caption_mention_beyond_position_bound_is_ignored() {
        // "Figure 3" 出现在第 18 个字符之后，是正文引用而非图注
        let blocks = vec![block(
            "As clearly shown above in Figure 3: Results improve with depth.",
            500.0,
        )];
        assert!(find_captions_in_blocks(&blocks).is_empty());
    }

    #[test]
    fn fig_abbreviation_matches() {
        let blocks = vec![block("Fig. 12 - Qualitative comparison.", 300.0)];
        let captions = find_captions_in_blocks(&blocks);
        assert_eq!(captions.len(), 1);
        assert!(captions[0].text.starts_with("Fig. 12"));
    }

    #[test]
    fn captions_sorted_top_to_bottom() {
        let blocks = vec![
            block("Figure 2: Second one.", 600.0),
            block("Figure 1: First one.", 200.0),
        ];
        let captions = find_captions_in_blocks(&blocks);
        assert_eq!(captions.len(), 2);
        assert!(captions[0].text.starts_with("Figure 1"));
        assert!(captions[1].text.starts_with("Figure 2"));
    }

    #[test]
    fn caption_text_truncated_to_limit() {
        let long_tail = "x".repeat(400);
        let blocks = vec![block(&format!("Figure 4: {}", long_tail), 100.0)];
        let captions = find_captions_in_blocks(&blocks);
        assert_eq!(captions[0].text.chars().count(), 160);
    }

    #[test]
    fn words_grouped_into_lines_by_quantized_top() {
        let mk = |text: &str, x0: f64, y0: f64| Word {
            text: text.to_string(),
            bbox: Rect::new(x0, y0, x0 + 30.0, y0 + 10.0),
        };
        // 同一行的词 top 相差 1 单位以内，量化后合并
        let words = vec![
            mk("Figure", 50.0, 400.0),
            mk("5:", 90.0, 400.8),
            mk("Attention", 110.0, 400.3),
            mk("maps.", 160.0, 400.5),
            // 另一行普通正文
            mk("The", 50.0, 430.0),
            mk("model", 75.0, 430.0),
        ];
        let captions = find_captions_in_words(&words);
        assert_eq!(captions.len(), 1);
        assert!(captions[0].text.starts_with("Figure 5"));
        assert!((captions[0].bbox.y0 - 400.0).abs() < 1.0);
    }

    #[test]
    fn body_text_line_without_caption_is_skipped() {
        let mk = |text: &str, x0: f64| Word {
            text: text.to_string(),
            bbox: Rect::new(x0, 100.0, x0 + 30.0, 110.0),
        };
        let words = vec![mk("We", 50.0), mk("train", 80.0), mk("for", 120.0)];
        assert!(find_captions_in_words(&words).is_empty());
    }
}
