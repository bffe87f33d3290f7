pub mod arxiv;

pub use arxiv::{parse_arxiv_id, ArxivClient, ArxivMetadata};
