//! 词级布局访问层（pdf-extract 后端）。
//!
//! 主扫描层直接解释内容流，遇到字体数据损坏或编码不可逆的文档会
//! 拿不到可匹配的文本；pdf-extract 自带完整的字体解码，这里借它的
//! `OutputDev` 回调收集带包围盒的单词，作为图注定位的备选输入。
//! 坐标同样转换为左上原点、y 向下。

use lopdf::Document;
use pdf_extract::{MediaBox, OutputDev, OutputError, Transform};
use tracing::debug;

use super::geom::Rect;

/// 一个带包围盒的单词。
#[derive(Debug, Clone)]
pub struct Word {
    pub text: String,
    pub bbox: Rect,
}

/// 单页的词级布局。
#[derive(Debug, Default)]
pub struct PageWords {
    pub width: f64,
    pub height: f64,
    pub words: Vec<Word>,
}

/// 累积中的单词。
struct PendingWord {
    text: String,
    x0: f64,
    x1: f64,
    y_top: f64,
    y_bottom: f64,
}

/// OutputDev 实现：按 begin_word/end_word 归组字符。
struct WordCollector {
    pages: Vec<PageWords>,
    page_ury: f64,
    page_llx: f64,
    pending: Option<PendingWord>,
}

impl WordCollector {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            page_ury: 0.0,
            page_llx: 0.0,
            pending: None,
        }
    }

    fn flush_word(&mut self) {
        if let Some(word) = self.pending.take() {
            if word.text.trim().is_empty() {
                return;
            }
            if let Some(page) = self.pages.last_mut() {
                page.words.push(Word {
                    text: word.text,
                    bbox: Rect::new(word.x0, word.y_top, word.x1, word.y_bottom),
                });
            }
        }
    }
}

/// 变换矩阵的等效缩放因子。
fn transform_scale(trm: &Transform) -> f64 {
    (trm.m11 * trm.m22 - trm.m12 * trm.m21).abs().sqrt().max(1e-6)
}

impl OutputDev for WordCollector {
    fn begin_page(
        &mut self,
        _page_num: u32,
        media_box: &MediaBox,
        _art_box: Option<(f64, f64, f64, f64)>,
    ) -> Result<(), OutputError> {
        self.page_ury = media_box.ury;
        self.page_llx = media_box.llx;
        self.pages.push(PageWords {
            width: media_box.urx - media_box.llx,
            height: media_box.ury - media_box.lly,
            words: Vec::new(),
        });
        Ok(())
    }

    fn end_page(&mut self) -> Result<(), OutputError> {
        self.flush_word();
        Ok(())
    }

    fn output_character(
        &mut self,
        trm: &Transform,
        width: f64,
        spacing: f64,
        font_size: f64,
        char: &str,
    ) -> Result<(), OutputError> {
        let scale = transform_scale(trm);
        let x = trm.m31 - self.page_llx;
        let y_baseline = self.page_ury - trm.m32;
        let size = font_size * scale;
        let advance = (width * font_size + spacing) * scale;

        let y_top = y_baseline - size * 0.8;
        let y_bottom = y_baseline + size * 0.25;

        match &mut self.pending {
            Some(word) => {
                word.text.push_str(char);
                word.x1 = word.x1.max(x + advance);
                word.y_top = word.y_top.min(y_top);
                word.y_bottom = word.y_bottom.max(y_bottom);
            }
            None => {
                self.pending = Some(PendingWord {
                    text: char.to_string(),
                    x0: x,
                    x1: x + advance,
                    y_top,
                    y_bottom,
                });
            }
        }
        Ok(())
    }

    fn begin_word(&mut self) -> Result<(), OutputError> {
        self.flush_word();
        Ok(())
    }

    fn end_word(&mut self) -> Result<(), OutputError> {
        self.flush_word();
        Ok(())
    }

    fn end_line(&mut self) -> Result<(), OutputError> {
        self.flush_word();
        Ok(())
    }
}

/// 对整个文档跑一遍词级收集。页序与文档一致。
pub fn collect_words(doc: &Document) -> Result<Vec<PageWords>, String> {
    let mut collector = WordCollector::new();
    pdf_extract::output_doc(doc, &mut collector).map_err(|e| e.to_string())?;
    for (index, page) in collector.pages.iter().enumerate() {
        debug!("第 {} 页词数: {}", index + 1, page.words.len());
    }
    Ok(collector.pages)
}
