pub mod logger;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WxError {
    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("输入无效: {0}")]
    InvalidInput(String),

    #[error("网络请求错误: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("抓取失败: {0}")]
    FetchError(String),

    #[error("解析错误: {0}")]
    ParseError(String),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("PDF处理错误: {0}")]
    PdfError(String),
}

pub type WxResult<T> = Result<T, WxError>;
