mod config;
mod crawler;
mod generator;
mod parser;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use config::AppConfig;
use crawler::ArxivClient;
use parser::{ExtractionPipeline, Paper, SourcePolicy};
use storage::PaperWorkspace;
use utils::logger;

#[derive(Parser)]
#[command(name = "wxpaper")]
#[command(about = "论文转公众号文章工具", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 初始化默认配置
    Init,
    /// 抓取并解析一篇论文 (arXiv 链接/ID 或本地 PDF)
    Fetch {
        /// arXiv 链接、ID，或本地 PDF 路径
        input: String,
        /// 源码包策略: auto / always / never（覆盖配置文件）
        #[arg(long)]
        source: Option<String>,
        /// 忽略已有解析缓存，强制重新解析
        #[arg(long)]
        force: bool,
    },
    /// 清理缓存目录
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logger();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init => init_command().await,
        Commands::Fetch {
            input,
            source,
            force,
        } => fetch_command(&input, source.as_deref(), force).await,
        Commands::Clean => clean_command().await,
    }
}

async fn init_command() -> Result<()> {
    let app_config = AppConfig::default();
    app_config.save("config/settings.toml")?;
    info!("已生成配置文件: config/settings.toml");
    info!("下一步: 运行 'wxpaper fetch <arXiv链接或PDF>' 开始解析");
    Ok(())
}

/// 输入可以是 arXiv 标识，也可以是本地 PDF。
enum FetchInput {
    Arxiv(String),
    Pdf(PathBuf),
}

fn parse_fetch_input(raw: &str) -> Result<FetchInput> {
    let value = raw.trim();
    if value.is_empty() {
        anyhow::bail!("输入不能为空");
    }

    let path = PathBuf::from(value);
    if path.is_file() {
        let is_pdf = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if !is_pdf {
            anyhow::bail!("本地输入只支持 PDF 文件: {}", value);
        }
        return Ok(FetchInput::Pdf(path.canonicalize()?));
    }

    if value.to_lowercase().ends_with(".pdf") && !value.contains("://") {
        anyhow::bail!("PDF 文件不存在: {}", value);
    }

    Ok(FetchInput::Arxiv(crawler::parse_arxiv_id(value)?))
}

async fn fetch_command(input: &str, source_override: Option<&str>, force: bool) -> Result<()> {
    let app_config = AppConfig::load()?;
    let policy_text = source_override.unwrap_or(&app_config.fetcher.source_policy);
    let policy = SourcePolicy::parse(policy_text);
    let cache_root = PathBuf::from(&app_config.storage.cache_dir);

    let fetch_input = parse_fetch_input(input)?;
    let mut pipeline = ExtractionPipeline::new(policy);

    let paper = match fetch_input {
        FetchInput::Arxiv(arxiv_id) => {
            info!("输入: arXiv {}", arxiv_id);
            let workspace = PaperWorkspace::new(&cache_root, &arxiv_id);
            workspace.ensure()?;

            if !force {
                if let Some(cached) = storage::load_parsed(&workspace) {
                    info!("命中解析缓存，跳过抓取 (--force 可强制重抓)");
                    finish(&cached, &workspace, &app_config, &pipeline)?;
                    return Ok(());
                }
            }

            let client = ArxivClient::new(
                app_config.fetcher.timeout_secs,
                &app_config.fetcher.user_agent,
            )?;

            // 元数据失败不致命，降级为纯 PDF 解析
            let metadata = match client.fetch_metadata(&arxiv_id).await {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    warn!("元数据获取失败，继续用 PDF 解析: {}", e);
                    None
                }
            };

            let pdf_url = metadata
                .as_ref()
                .and_then(|m| m.pdf_url.clone())
                .unwrap_or_else(|| format!("https://arxiv.org/pdf/{}.pdf", arxiv_id));
            let pdf_path = client.download_pdf(&pdf_url, &workspace).await?;

            // 体积超限时连下载都省掉；页数门限由管道再核一遍
            let pdf_bytes = std::fs::metadata(&pdf_path).map(|m| m.len()).unwrap_or(0);
            let source_payload = if policy != SourcePolicy::Never
                && (policy == SourcePolicy::Always || pdf_bytes < parser::AUTO_SKIP_SOURCE_PDF_BYTES)
            {
                client.download_source(&arxiv_id, &workspace).await
            } else {
                None
            };

            let mut paper = pipeline.process(
                &pdf_path,
                workspace.key(),
                &workspace,
                source_payload.as_deref(),
            )?;

            if let Some(metadata) = metadata {
                if !metadata.title.is_empty() {
                    paper.title = metadata.title;
                }
                if !metadata.abstract_text.is_empty() {
                    paper.abstract_text = metadata.abstract_text;
                }
                if !metadata.authors.is_empty() {
                    paper.authors = metadata.authors;
                }
                if !metadata.affiliations.is_empty() {
                    paper.affiliations = metadata.affiliations;
                }
                paper.published_date = metadata.published_date.or(paper.published_date);
            }
            paper.arxiv_id = Some(arxiv_id.clone());
            paper.pdf_url = Some(pdf_url);
            paper.url = Some(format!("https://arxiv.org/abs/{}", arxiv_id));

            finish(&paper, &workspace, &app_config, &pipeline)?;
            paper
        }
        FetchInput::Pdf(pdf_path) => {
            info!("输入: 本地 PDF {}", pdf_path.display());
            let key = pdf_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "paper".to_string());
            let workspace = PaperWorkspace::new(&cache_root, &key);
            workspace.ensure()?;

            if !force {
                if let Some(cached) = storage::load_parsed(&workspace) {
                    info!("命中解析缓存，跳过解析 (--force 可强制重解析)");
                    finish(&cached, &workspace, &app_config, &pipeline)?;
                    return Ok(());
                }
            }

            let paper = pipeline.process(&pdf_path, workspace.key(), &workspace, None)?;
            finish(&paper, &workspace, &app_config, &pipeline)?;
            paper
        }
    };

    info!("✅ 完成: {}", paper.title);
    Ok(())
}

/// 写缓存与文章骨架，打印一行式摘要。
fn finish(
    paper: &Paper,
    workspace: &PaperWorkspace,
    app_config: &AppConfig,
    pipeline: &ExtractionPipeline,
) -> Result<()> {
    let parsed_path = storage::save_parsed(paper, workspace)?;

    let markdown = generator::generate_article_markdown(
        paper,
        app_config.extractor.include_images,
        app_config.extractor.max_images,
    );
    let article_path = workspace.root().join("article.md");
    std::fs::write(&article_path, markdown)?;

    info!("标题: {}", paper.title);
    info!("章节数: {}", paper.sections.len());
    info!("图片数: {}", paper.images.len());
    info!("图片后端: {}", pipeline.last_image_backend);
    if !pipeline.last_source_status.is_empty() {
        info!("源码包状态: {}", pipeline.last_source_status);
    }

    println!("解析缓存: {}", parsed_path.display());
    println!("文章骨架: {}", article_path.display());
    println!("图片目录: {}", workspace.images_dir().display());
    Ok(())
}

async fn clean_command() -> Result<()> {
    let app_config = AppConfig::load()?;
    let cache_root = Path::new(&app_config.storage.cache_dir);

    if !cache_root.exists() {
        info!("缓存目录不存在，跳过: {}", cache_root.display());
        return Ok(());
    }

    let mut removed = 0u64;
    for entry in std::fs::read_dir(cache_root)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        removed += 1;
    }

    info!("✅ 清理完成，共删除 {} 项: {}", removed, cache_root.display());
    Ok(())
}
