//! 文本结构化：页面文本清洗、页眉页脚过滤、章节切分与摘要提取。
//!
//! 页眉页脚过滤要先对全部页面统计一遍行频，再做第二遍过滤，
//! 频次表是不可变的派生值，不做全局可变状态。

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::Section;

/// 摘要按词数截断的上限。
const ABSTRACT_MAX_WORDS: usize = 220;
/// 兜底时取文档开头的词数。
const FALLBACK_HEAD_WORDS: usize = 180;
/// 参与行频统计的最大行长。
const NOISE_LINE_MAX_LEN: usize = 90;
/// 行出现页数达到该值即视为页眉页脚。
const NOISE_MIN_FREQUENCY: usize = 3;

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(\d+(\.\d+)*)?\s*(abstract|introduction|background|related work|method|methods|approach|experiments?|results?|discussion|conclusion|conclusions)\s*$",
        )
        .unwrap()
    })
}

fn heading_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(\d+(\.\d+)*)?\s*(introduction|background|related work|method|methods|approach|experiments?|results?|discussion|conclusion|references?)\b",
        )
        .unwrap()
    })
}

fn page_stamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(\d+|Page \d+|arXiv:.*)$").unwrap())
}

fn banner_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(arxiv|proceedings|copyright|acm)\b").unwrap())
}

fn noise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(copyright|permission|acm|isbn|doi)\b").unwrap())
}

fn numeral_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(\.\d+)*\s*").unwrap())
}

/// 把空白折叠成单个空格。
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 单页文本规范化：接回连字符断行、折叠空白、去掉页码与 arXiv 戳。
pub fn normalize_page_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let normalized = text.replace('\r', "\n").replace("-\n", "");

    let mut lines: Vec<String> = Vec::new();
    for raw_line in normalized.lines() {
        let line = clean_text(raw_line);
        if line.is_empty() {
            continue;
        }
        if page_stamp_re().is_match(&line) {
            continue;
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// 全部页面的行频统计（只统计短行，每页同一行计一次）。
pub fn count_line_frequencies(pages: &[Vec<String>]) -> HashMap<String, usize> {
    let mut counter: HashMap<String, usize> = HashMap::new();
    for lines in pages {
        let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for line in lines {
            if line.chars().count() > NOISE_LINE_MAX_LEN {
                continue;
            }
            if seen.insert(line.as_str()) {
                *counter.entry(line.clone()).or_insert(0) += 1;
            }
        }
    }
    counter
}

/// 高频重复的短行视为页眉页脚噪声。
pub fn is_repeated_noise_line(line: &str, frequency: usize) -> bool {
    if frequency < NOISE_MIN_FREQUENCY {
        return false;
    }
    if banner_re().is_match(line) {
        return true;
    }
    line.chars().count() < 80
}

/// 两遍过滤：统计行频后丢弃重复噪声行，拼出全文。
pub fn filter_noise_pages(pages: &[Vec<String>]) -> String {
    let frequencies = count_line_frequencies(pages);
    let mut page_texts: Vec<String> = Vec::new();
    for lines in pages {
        let filtered: Vec<&str> = lines
            .iter()
            .filter(|line| {
                let freq = frequencies.get(line.as_str()).copied().unwrap_or(0);
                !is_repeated_noise_line(line, freq)
            })
            .map(String::as_str)
            .collect();
        if !filtered.is_empty() {
            page_texts.push(filtered.join("\n"));
        }
    }
    page_texts.join("\n\n")
}

fn is_noise_line(line: &str) -> bool {
    noise_re().is_match(line)
}

fn looks_like_section_heading(line: &str) -> bool {
    heading_prefix_re().is_match(line)
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// 按标题词表切分章节。一个标题行结束上一节；全文无标题时
/// 整体归入 "Main Content"。
pub fn split_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut current_title = "Main Content".to_string();
    let mut current_lines: Vec<&str> = Vec::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if heading_re().is_match(line) {
            if !current_lines.is_empty() {
                sections.push(Section {
                    title: title_case(&current_title),
                    content: current_lines.join("\n").trim().to_string(),
                    level: 2,
                });
            }
            current_title = numeral_prefix_re().replace(line, "").trim().to_string();
            current_lines.clear();
            continue;
        }
        current_lines.push(line);
    }

    if !current_lines.is_empty() {
        sections.push(Section {
            title: title_case(&current_title),
            content: current_lines.join("\n").trim().to_string(),
            level: 2,
        });
    }

    if sections.is_empty() {
        sections.push(Section {
            title: "Main Content".to_string(),
            content: text.trim().to_string(),
            level: 2,
        });
    }
    sections
}

/// 提取摘要。优先找独立的 "Abstract" 行并顺序收集正文；找不到时用
/// abstract…introduction 的跨行正则；再不行取文档开头。永不失败。
pub fn extract_abstract(text: &str) -> String {
    static ABSTRACT_LINE_RE: OnceLock<Regex> = OnceLock::new();
    let abstract_line_re =
        ABSTRACT_LINE_RE.get_or_init(|| Regex::new(r"(?i)^abstract[:\s]*$").unwrap());

    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    for (idx, line) in lines.iter().enumerate() {
        if !abstract_line_re.is_match(line) {
            continue;
        }
        let mut collected: Vec<&str> = Vec::new();
        for inner in &lines[idx + 1..] {
            if inner.is_empty() {
                if !collected.is_empty() {
                    break;
                }
                continue;
            }
            if looks_like_section_heading(inner) {
                break;
            }
            if is_noise_line(inner) {
                continue;
            }
            collected.push(inner);
            let words: usize = collected.iter().map(|l| l.split_whitespace().count()).sum();
            if words >= ABSTRACT_MAX_WORDS {
                break;
            }
        }
        if !collected.is_empty() {
            return clean_text(&collected.join(" "));
        }
    }

    static SPAN_RE: OnceLock<Regex> = OnceLock::new();
    let span_re = SPAN_RE.get_or_init(|| {
        Regex::new(r"(?is)\babstract\b[:\s]*(.+?)(?:\n\s*(?:1|i)\.?\s+introduction\b|\bintroduction\b|$)")
            .unwrap()
    });
    if let Some(cap) = span_re.captures(text) {
        let cleaned = clean_text(&cap[1]);
        if !cleaned.is_empty() {
            return cleaned.chars().take(1200).collect();
        }
    }

    text.split_whitespace()
        .take(FALLBACK_HEAD_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// 从 PDF 元数据的作者字段切出作者列表。
pub fn parse_authors(author_field: &str) -> Vec<String> {
    if author_field.is_empty() {
        return Vec::new();
    }
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r",| and ").unwrap());
    re.split(author_field)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// 从正文前部（摘要之前）提取作者单位。机构关键词命中才收，
/// 邮箱域名映射成机构名作补充，保序去重。
pub fn extract_affiliations(text: &str, max_items: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    static KEYWORD_RE: OnceLock<Regex> = OnceLock::new();
    let keyword_re = KEYWORD_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(university|institute|college|school|department|faculty|laboratory|lab|research\s+center|research\s+lab|research\s+institute|center|centre|academy|hospital|corp(?:oration)?|inc\.?|ltd\.?|llc|company|team)\b|大学|学院|研究所|实验室|研究院|中心|公司|团队",
        )
        .unwrap()
    });
    static STOP_RE: OnceLock<Regex> = OnceLock::new();
    let stop_re = STOP_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(figure|table|abstract|introduction|keywords?|references?)\b").unwrap()
    });
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    let email_re = EMAIL_RE
        .get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@([A-Za-z0-9.-]+\.[A-Za-z]{2,})").unwrap());
    static ABSTRACT_RE: OnceLock<Regex> = OnceLock::new();
    let abstract_re = ABSTRACT_RE.get_or_init(|| Regex::new(r"(?i)^abstract[:\s]*$").unwrap());

    let mut front_lines: Vec<String> = Vec::new();
    for raw_line in text.replace('\r', "\n").lines() {
        let line = clean_text(raw_line);
        if line.is_empty() {
            continue;
        }
        if abstract_re.is_match(&line) || looks_like_section_heading(&line) {
            break;
        }
        front_lines.push(line);
        if front_lines.len() >= 80 {
            break;
        }
    }

    let mut candidates: Vec<String> = Vec::new();
    for line in &front_lines {
        let char_count = line.chars().count();
        if !(4..=180).contains(&char_count) {
            continue;
        }
        if stop_re.is_match(line) {
            continue;
        }
        if !keyword_re.is_match(line) {
            continue;
        }
        let digits = line.chars().filter(|c| c.is_ascii_digit()).count();
        if digits > 6.max(char_count / 5) {
            continue;
        }
        for chunk in line.split([';', '｜', '|']) {
            let cleaned = normalize_affiliation(chunk);
            if !cleaned.is_empty() && keyword_re.is_match(&cleaned) {
                candidates.push(cleaned);
            }
        }
    }

    let front_blob = front_lines.join("\n");
    for cap in email_re.captures_iter(&front_blob) {
        if let Some(label) = domain_to_org_label(&cap[1]) {
            candidates.push(label);
        }
    }

    dedupe_preserve_order(candidates)
        .into_iter()
        .take(max_items)
        .collect()
}

fn normalize_affiliation(text: &str) -> String {
    static LEAD_RE: OnceLock<Regex> = OnceLock::new();
    let lead_re = LEAD_RE.get_or_init(|| Regex::new(r"^\(?\d+\)?\s*[:：-]?\s*").unwrap());
    static EMAIL_PAREN_RE: OnceLock<Regex> = OnceLock::new();
    let email_paren_re = EMAIL_PAREN_RE.get_or_init(|| Regex::new(r"\s*\([^)]*@[^)]*\)").unwrap());

    let mut cleaned = clean_text(text);
    cleaned = lead_re.replace(&cleaned, "").to_string();
    cleaned = email_paren_re.replace_all(&cleaned, "").to_string();
    cleaned = cleaned
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .trim_end_matches([';', ',', '.', '，', '。', ':', '：', ' '])
        .to_string();
    if cleaned.chars().count() < 4 {
        return String::new();
    }
    cleaned
}

fn domain_to_org_label(domain: &str) -> Option<String> {
    let value = domain.trim().to_lowercase();
    const PUBLIC_DOMAINS: [&str; 9] = [
        "gmail.com",
        "outlook.com",
        "hotmail.com",
        "qq.com",
        "163.com",
        "126.com",
        "yahoo.com",
        "proton.me",
        "icloud.com",
    ];
    if PUBLIC_DOMAINS.contains(&value.as_str()) {
        return None;
    }

    let parts: Vec<&str> = value.split('.').filter(|s| !s.is_empty()).collect();
    if parts.len() < 2 {
        return None;
    }
    let token = parts[parts.len() - 2];
    const GENERIC: [&str; 10] = [
        "mail", "email", "cs", "ece", "dept", "ac", "edu", "org", "net", "com",
    ];
    if token.len() <= 2 || GENERIC.contains(&token) {
        return None;
    }
    let token = token.replace('-', " ");
    if token.len() <= 4 {
        Some(token.to_uppercase())
    } else {
        Some(title_case(&token))
    }
}

fn dedupe_preserve_order(values: Vec<String>) -> Vec<String> {
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut out = Vec::new();
    for value in values {
        let key = value.trim().to_lowercase();
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        out.push(value.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_joins_hyphen_breaks_and_drops_stamps() {
        let text = "neural net-\nworks are\n3\narXiv:2401.00001v1\nuseful";
        let normalized = normalize_page_text(text);
        assert!(normalized.contains("networks"));
        assert!(!normalized.contains("arXiv:"));
        assert!(!normalized.lines().any(|l| l == "3"));
    }

    #[test]
    fn repeated_short_lines_are_noise() {
        let pages: Vec<Vec<String>> = (0..4)
            .map(|i| {
                vec![
                    "Conference Preprint 2024".to_string(),
                    format!("unique content line number {}", i),
                ]
            })
            .collect();
        let text = filter_noise_pages(&pages);
        assert!(!text.contains("Conference Preprint 2024"));
        assert!(text.contains("unique content line number 2"));
    }

    #[test]
    fn low_frequency_lines_survive() {
        assert!(!is_repeated_noise_line("some header", 2));
        assert!(is_repeated_noise_line("some header", 3));
    }

    #[test]
    fn sections_split_on_headings() {
        let text = "preamble text\n1 Introduction\nintro body\n2.1 Methods\nmethod body";
        let sections = split_sections(text);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].title, "Main Content");
        assert_eq!(sections[1].title, "Introduction");
        assert_eq!(sections[2].title, "Methods");
        assert_eq!(sections[2].content, "method body");
    }

    #[test]
    fn headingless_text_becomes_single_main_content() {
        let text = "  just a plain paragraph\nwith two lines  ";
        let sections = split_sections(text);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Main Content");
        assert_eq!(sections[0].content, text.trim());
    }

    #[test]
    fn abstract_extracted_from_dedicated_line() {
        let text = "Title line\nAbstract\nThis paper studies something interesting.\nIt works well.\n\n1 Introduction\nbody";
        let abstract_text = extract_abstract(text);
        assert!(abstract_text.starts_with("This paper studies"));
        assert!(abstract_text.contains("works well"));
        assert!(!abstract_text.contains("Introduction"));
    }

    #[test]
    fn abstract_falls_back_to_document_head() {
        let text = "no marker here at all just words ".repeat(50);
        let abstract_text = extract_abstract(&text);
        assert_eq!(abstract_text.split_whitespace().count(), FALLBACK_HEAD_WORDS);
    }

    #[test]
    fn authors_split_on_comma_and_and() {
        let authors = parse_authors("Alice Chen, Bob Li and Carol Wang");
        assert_eq!(authors, vec!["Alice Chen", "Bob Li", "Carol Wang"]);
    }

    #[test]
    fn affiliations_found_by_keyword_and_email_domain() {
        let text = "Great Paper\nAlice Chen\nTsinghua University\nalice@tsinghua.edu.cn\nAbstract\nbody";
        let affiliations = extract_affiliations(text, 6);
        assert!(affiliations.iter().any(|a| a.contains("Tsinghua University")));
    }
}
