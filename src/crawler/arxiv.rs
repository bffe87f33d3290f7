use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::storage::PaperWorkspace;
use crate::utils::{WxError, WxResult};

/// 这些状态码重试，其余 4xx/5xx 直接报错。
const RETRY_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];
/// 单个请求的最大尝试次数。
const MAX_ATTEMPTS: u32 = 4;
/// 线性退避基数。
const BACKOFF_BASE_MS: u64 = 1400;

fn arxiv_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d{4}\.\d{4,5}|[a-z\-]+/\d{7})(v\d+)?").unwrap())
}

fn arxiv_id_full_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(\d{4}\.\d{4,5}|[a-z\-]+/\d{7})(v\d+)?$").unwrap())
}

/// 从裸 ID 或 arxiv.org 链接里解析论文 ID。
pub fn parse_arxiv_id(input: &str) -> WxResult<String> {
    let value = input.trim();
    if value.is_empty() {
        return Err(WxError::InvalidInput("arXiv 链接/ID 不能为空".to_string()));
    }

    if arxiv_id_full_re().is_match(value) {
        return Ok(value.to_string());
    }

    if value.contains("arxiv.org") {
        if let Some(m) = arxiv_id_re().find(value) {
            let id = m.as_str().trim_end_matches(".pdf");
            return Ok(id.to_string());
        }
    }

    Err(WxError::InvalidInput(format!(
        "无法识别的 arXiv 链接或 ID: {}",
        input
    )))
}

/// arXiv 元数据（API 或 abs 页面解析所得）。
#[derive(Debug, Clone, Default)]
pub struct ArxivMetadata {
    pub title: String,
    pub abstract_text: String,
    pub authors: Vec<String>,
    pub affiliations: Vec<String>,
    pub published_date: Option<DateTime<Utc>>,
    pub pdf_url: Option<String>,
}

pub struct ArxivClient {
    client: Client,
}

impl ArxivClient {
    pub fn new(timeout_secs: u64, user_agent: &str) -> WxResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(user_agent.to_string())
            .build()?;
        Ok(Self { client })
    }

    /// 抓取元数据。API 两个镜像各试一次（它们限流很紧，重试意义不大），
    /// 都不行再解析 abs 页面的 HTML。全失败返回错误，调用方降级为纯
    /// PDF 解析。
    pub async fn fetch_metadata(&self, arxiv_id: &str) -> WxResult<ArxivMetadata> {
        let api_urls = [
            format!("https://export.arxiv.org/api/query?id_list={}", arxiv_id),
            format!("https://arxiv.org/api/query?id_list={}", arxiv_id),
        ];

        for api_url in &api_urls {
            match self.http_get(api_url, 1).await {
                Ok(body) => {
                    let xml = String::from_utf8_lossy(&body);
                    if let Some(metadata) = parse_atom_metadata(&xml) {
                        return Ok(metadata);
                    }
                }
                Err(e) => {
                    warn!("API 请求失败: {} ({})", api_url, e);
                }
            }
        }

        let abs_url = format!("https://arxiv.org/abs/{}", arxiv_id);
        if let Ok(body) = self.http_get(&abs_url, MAX_ATTEMPTS).await {
            let html = String::from_utf8_lossy(&body);
            if let Some(metadata) = parse_abs_page_metadata(&html, arxiv_id) {
                return Ok(metadata);
            }
        }

        Err(WxError::FetchError(format!(
            "arXiv 元数据获取失败: {}",
            arxiv_id
        )))
    }

    /// 下载 PDF。缓存文件校验 %PDF 魔数且不是 HTML 错误页才复用。
    pub async fn download_pdf(
        &self,
        pdf_url: &str,
        workspace: &PaperWorkspace,
    ) -> WxResult<PathBuf> {
        let output = workspace
            .downloads_dir()
            .join(format!("{}.pdf", workspace.key()));

        if let Ok(head) = std::fs::read(&output).map(|b| b[..b.len().min(512)].to_vec()) {
            if head.starts_with(b"%PDF") && !crate::parser::source_tex::looks_like_html_payload(&head)
            {
                info!("PDF 已缓存: {}", output.display());
                return Ok(output);
            }
            if !head.is_empty() {
                info!("PDF 缓存无效，重新下载");
                let _ = std::fs::remove_file(&output);
            }
        }

        self.download_to_file(pdf_url, &output).await?;
        Ok(output)
    }

    /// 下载源码包载荷。拿不到（很多论文不放源码）返回 None，不算错误。
    pub async fn download_source(
        &self,
        arxiv_id: &str,
        workspace: &PaperWorkspace,
    ) -> Option<PathBuf> {
        let output = workspace
            .downloads_dir()
            .join(format!("{}-source.bin", workspace.key()));

        if let Ok(bytes) = std::fs::read(&output) {
            if !bytes.is_empty() && !crate::parser::source_tex::looks_like_html_payload(&bytes) {
                info!("源码包已缓存: {}", output.display());
                return Some(output);
            }
            let _ = std::fs::remove_file(&output);
        }

        let source_urls = [
            format!("https://arxiv.org/src/{}", arxiv_id),
            format!("https://export.arxiv.org/src/{}", arxiv_id),
        ];
        for url in &source_urls {
            if self.download_to_file(url, &output).await.is_err() {
                continue;
            }
            let Ok(bytes) = std::fs::read(&output) else {
                continue;
            };
            if bytes.is_empty() || crate::parser::source_tex::looks_like_html_payload(&bytes) {
                let _ = std::fs::remove_file(&output);
                continue;
            }
            return Some(output);
        }
        None
    }

    /// 先写 .part 再原子改名，避免半截文件被当缓存。
    async fn download_to_file(&self, url: &str, output: &Path) -> WxResult<()> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let part = output.with_extension("part");

        let bytes = self.http_get(url, MAX_ATTEMPTS).await?;
        if bytes.is_empty() {
            return Err(WxError::FetchError(format!("下载内容为空: {}", url)));
        }
        std::fs::write(&part, &bytes)?;
        std::fs::rename(&part, output)?;
        info!("下载完成: {} ({} 字节)", output.display(), bytes.len());
        Ok(())
    }

    /// 带重试的 GET。可重试状态码按 Retry-After 或线性退避等待，
    /// 其余错误立即失败。
    async fn http_get(&self, url: &str, max_attempts: u32) -> WxResult<Vec<u8>> {
        let max_attempts = max_attempts.max(1);
        let mut last_error: Option<WxError> = None;

        for attempt in 1..=max_attempts {
            info!("HTTP GET ({}/{}): {}", attempt, max_attempts, url);
            let response = match self.client.get(url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("请求失败 ({}/{}): {}", attempt, max_attempts, e);
                    last_error = Some(WxError::NetworkError(e));
                    if attempt < max_attempts {
                        tokio::time::sleep(retry_delay(attempt, None)).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let bytes = response.bytes().await?;
                return Ok(bytes.to_vec());
            }

            if RETRY_STATUS_CODES.contains(&status.as_u16()) && attempt < max_attempts {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                warn!("HTTP {}，退避后重试: {}", status, url);
                tokio::time::sleep(retry_delay(attempt, retry_after)).await;
                last_error = Some(WxError::FetchError(format!("HTTP {}: {}", status, url)));
                continue;
            }

            return Err(WxError::FetchError(format!("HTTP {}: {}", status, url)));
        }

        Err(last_error.unwrap_or_else(|| WxError::FetchError(format!("请求失败: {}", url))))
    }
}

fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    if let Some(secs) = retry_after_secs {
        return Duration::from_millis((secs * 1000).max(300));
    }
    Duration::from_millis(BACKOFF_BASE_MS * attempt as u64)
}

fn append_ws(target: &mut String, value: &str) {
    if target.is_empty() {
        *target = collapse_ws(value);
    } else {
        *target = collapse_ws(&format!("{} {}", target, value));
    }
}

/// 解析 Atom 响应里的第一条 entry。
fn parse_atom_metadata(xml: &str) -> Option<ArxivMetadata> {
    let mut reader = Reader::from_str(xml);

    let mut metadata = ArxivMetadata::default();
    let mut in_entry = false;
    let mut in_author = false;
    let mut saw_entry = false;
    let mut current_tag: Vec<u8> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"entry" => {
                        in_entry = true;
                        saw_entry = true;
                    }
                    b"author" if in_entry => in_author = true,
                    b"link" if in_entry => read_link_attrs(&e, &mut metadata),
                    _ => {}
                }
                current_tag = name;
            }
            Ok(Event::Empty(e)) => {
                if in_entry && e.name().as_ref() == b"link" {
                    read_link_attrs(&e, &mut metadata);
                }
            }
            Ok(Event::Text(t)) => {
                if !in_entry {
                    continue;
                }
                let Ok(value) = t.unescape() else {
                    continue;
                };
                let value = value.trim().to_string();
                if value.is_empty() {
                    continue;
                }
                match current_tag.as_slice() {
                    b"title" => append_ws(&mut metadata.title, &value),
                    b"summary" => append_ws(&mut metadata.abstract_text, &value),
                    b"published" => metadata.published_date = parse_published_date(&value),
                    b"name" if in_author => metadata.authors.push(collapse_ws(&value)),
                    b"arxiv:affiliation" if in_author => {
                        metadata.affiliations.push(collapse_ws(&value))
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"entry" => break,
                b"author" => in_author = false,
                _ => current_tag.clear(),
            },
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    if !saw_entry {
        return None;
    }
    metadata.affiliations = dedupe_keep_order(std::mem::take(&mut metadata.affiliations));
    Some(metadata)
}

fn read_link_attrs(e: &quick_xml::events::BytesStart<'_>, metadata: &mut ArxivMetadata) {
    let mut href = String::new();
    let mut content_type = String::new();
    let mut title = String::new();
    for attr in e.attributes().flatten() {
        let value = attr.unescape_value().unwrap_or_default().to_string();
        match attr.key.as_ref() {
            b"href" => href = value,
            b"type" => content_type = value,
            b"title" => title = value,
            _ => {}
        }
    }
    if metadata.pdf_url.is_none()
        && (content_type == "application/pdf"
            || title.eq_ignore_ascii_case("pdf")
            || href.ends_with(".pdf"))
        && !href.is_empty()
    {
        metadata.pdf_url = Some(href);
    }
}

/// 抽取指定 name 的 meta 标签 content（可能多个）。
fn meta_contents(document: &Html, name: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(&format!(r#"meta[name="{}"]"#, name)) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(collapse_ws)
        .filter(|s| !s.is_empty())
        .collect()
}

/// abs 页面兜底：citation_* meta 标签加标题/摘要节点。
fn parse_abs_page_metadata(html: &str, arxiv_id: &str) -> Option<ArxivMetadata> {
    let document = Html::parse_document(html);
    let select_meta = |name: &str| meta_contents(&document, name);

    let mut title = select_meta("citation_title").into_iter().next().unwrap_or_default();
    if title.is_empty() {
        if let Ok(selector) = Selector::parse("h1.title") {
            if let Some(node) = document.select(&selector).next() {
                let raw = node.text().collect::<String>();
                title = collapse_ws(raw.trim_start_matches("Title:"));
            }
        }
    }

    let mut abstract_text = String::new();
    if let Ok(selector) = Selector::parse("blockquote.abstract") {
        if let Some(node) = document.select(&selector).next() {
            let raw = node.text().collect::<String>();
            let raw = raw.trim();
            let raw = raw.strip_prefix("Abstract:").unwrap_or(raw);
            abstract_text = collapse_ws(raw);
        }
    }
    if abstract_text.is_empty() {
        abstract_text = select_meta("description").into_iter().next().unwrap_or_default();
        if let Some(stripped) = abstract_text.strip_prefix("Abstract:") {
            abstract_text = collapse_ws(stripped);
        }
    }

    let authors = select_meta("citation_author");
    let mut affiliations = select_meta("citation_author_institution");
    affiliations.extend(select_meta("citation_author_affiliation"));

    let published_date = select_meta("citation_date")
        .into_iter()
        .next()
        .and_then(|raw| parse_published_date(&raw));

    let pdf_url = select_meta("citation_pdf_url")
        .into_iter()
        .next()
        .or_else(|| Some(format!("https://arxiv.org/pdf/{}.pdf", arxiv_id)));

    if title.is_empty() && abstract_text.is_empty() && authors.is_empty() {
        return None;
    }

    Some(ArxivMetadata {
        title,
        abstract_text,
        authors,
        affiliations: dedupe_keep_order(affiliations),
        published_date,
        pdf_url,
    })
}

/// ISO 8601 或 YYYY/MM/DD、YYYY-MM-DD 都接受。
pub fn parse_published_date(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&value.replace('Z', "+00:00")) {
        return Some(parsed.with_timezone(&Utc));
    }
    static DATE_RE: OnceLock<Regex> = OnceLock::new();
    let date_re =
        DATE_RE.get_or_init(|| Regex::new(r"(\d{4})[-/](\d{1,2})[-/](\d{1,2})").unwrap());
    let cap = date_re.captures(value)?;
    let date = NaiveDate::from_ymd_opt(
        cap[1].parse().ok()?,
        cap[2].parse().ok()?,
        cap[3].parse().ok()?,
    )?;
    Some(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0)?,
        Utc,
    ))
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn dedupe_keep_order(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.trim().to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ids_accepted() {
        assert_eq!(parse_arxiv_id("2401.00001").unwrap(), "2401.00001");
        assert_eq!(parse_arxiv_id("2401.00001v2").unwrap(), "2401.00001v2");
        assert_eq!(parse_arxiv_id("cs/0112017").unwrap(), "cs/0112017");
    }

    #[test]
    fn urls_accepted_and_pdf_suffix_stripped() {
        assert_eq!(
            parse_arxiv_id("https://arxiv.org/abs/2401.00001").unwrap(),
            "2401.00001"
        );
        assert_eq!(
            parse_arxiv_id("https://arxiv.org/pdf/2401.00001.pdf").unwrap(),
            "2401.00001"
        );
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!(parse_arxiv_id("").is_err());
        assert!(parse_arxiv_id("not an id").is_err());
        assert!(parse_arxiv_id("https://example.com/paper").is_err());
    }

    #[test]
    fn atom_entry_parsed() {
        let xml = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <entry>
    <title>Deep  Paper
 Title</title>
    <summary>An abstract.</summary>
    <published>2024-01-15T00:00:00Z</published>
    <author><name>Alice Chen</name><arxiv:affiliation>Some University</arxiv:affiliation></author>
    <author><name>Bob Li</name></author>
    <link href="https://arxiv.org/pdf/2401.00001v1" type="application/pdf"/>
  </entry>
</feed>"#;
        let metadata = parse_atom_metadata(xml).unwrap();
        assert_eq!(metadata.title, "Deep Paper Title");
        assert_eq!(metadata.authors, vec!["Alice Chen", "Bob Li"]);
        assert_eq!(metadata.affiliations, vec!["Some University"]);
        assert!(metadata.pdf_url.unwrap().contains("pdf"));
        assert!(metadata.published_date.is_some());
    }

    #[test]
    fn empty_feed_yields_none() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"></feed>"#;
        assert!(parse_atom_metadata(xml).is_none());
    }

    #[test]
    fn abs_page_metadata_from_meta_tags() {
        let html = r#"<html><head>
<meta name="citation_title" content="A Study of Things"/>
<meta name="citation_author" content="Chen, Alice"/>
<meta name="citation_author" content="Li, Bob"/>
<meta name="citation_date" content="2024/01/15"/>
<meta name="citation_pdf_url" content="https://arxiv.org/pdf/2401.00001"/>
</head><body>
<blockquote class="abstract">Abstract: We study things carefully.</blockquote>
</body></html>"#;
        let metadata = parse_abs_page_metadata(html, "2401.00001").unwrap();
        assert_eq!(metadata.title, "A Study of Things");
        assert_eq!(metadata.authors.len(), 2);
        assert_eq!(metadata.abstract_text, "We study things carefully.");
        assert!(metadata.published_date.is_some());
    }

    #[test]
    fn date_formats_parsed() {
        assert!(parse_published_date("2024-01-15T12:30:00Z").is_some());
        assert!(parse_published_date("2024/01/15").is_some());
        assert!(parse_published_date("garbage").is_none());
    }

    #[test]
    fn retry_delay_uses_retry_after_when_present() {
        assert_eq!(retry_delay(1, Some(5)), Duration::from_secs(5));
        assert_eq!(retry_delay(2, None), Duration::from_millis(2 * BACKOFF_BASE_MS));
    }
}
