//! 基于 lopdf 的页面几何扫描。
//!
//! 逐条解释页面内容流，维护 CTM 与文本矩阵，产出三类几何信息：
//! 带包围盒的文本块、嵌入图片的放置矩形、矢量路径绘制的包围盒。
//! 坐标统一转换为左上原点、y 向下，后续的图注定位与区域求解只
//! 认这套坐标。
//!
//! 字形宽度不做精确计算（不解析字体度量），文本只用于图注行匹配，
//! 位置精度在几个单位以内即可。复合字体优先走 ToUnicode 映射，
//! 没有映射的编码会产生匹配不上的乱码，由词级访问层兜底。

use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::geom::Rect;

/// 无字体度量时采用的单字宽度（em 比例）。
const APPROX_CHAR_EM: f64 = 0.5;
/// Form XObject 递归深度上限。
const MAX_FORM_DEPTH: u32 = 3;

/// 一段带包围盒的文本（相邻行已合并成块）。
#[derive(Debug, Clone)]
pub struct TextBlock {
    pub text: String,
    pub bbox: Rect,
}

/// 单页扫描结果。
#[derive(Debug, Default)]
pub struct PageLayout {
    pub width: f64,
    pub height: f64,
    pub text_blocks: Vec<TextBlock>,
    /// 嵌入图片（Image XObject）的放置矩形
    pub image_rects: Vec<Rect>,
    /// 矢量路径绘制的包围盒
    pub drawing_rects: Vec<Rect>,
}

impl PageLayout {
    /// 参与区域求解的全部图形对象。
    pub fn graphic_objects(&self) -> Vec<Rect> {
        let mut all = self.image_rects.clone();
        all.extend(self.drawing_rects.iter().copied());
        all
    }
}

/// 2x3 仿射矩阵，PDF 习惯的 [a b c d e f]。
#[derive(Debug, Clone, Copy)]
struct Matrix {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
}

impl Matrix {
    fn identity() -> Self {
        Self { a: 1.0, b: 0.0, c: 0.0, d: 1.0, e: 0.0, f: 0.0 }
    }

    fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    fn translation(tx: f64, ty: f64) -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    /// 先应用 self 再应用 other。
    fn then(&self, other: &Matrix) -> Matrix {
        Matrix {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            e: self.e * other.a + self.f * other.c + other.e,
            f: self.e * other.b + self.f * other.d + other.f,
        }
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    /// 行列式开方，作为等效缩放因子。
    fn scale_factor(&self) -> f64 {
        (self.a * self.d - self.b * self.c).abs().sqrt()
    }
}

#[derive(Clone)]
struct TextState {
    font_size: f64,
    char_spacing: f64,
    word_spacing: f64,
    horizontal_scaling: f64,
    leading: f64,
    tm: Matrix,
    tlm: Matrix,
    font_key: Option<Vec<u8>>,
}

impl TextState {
    fn new() -> Self {
        Self {
            font_size: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            horizontal_scaling: 1.0,
            leading: 0.0,
            tm: Matrix::identity(),
            tlm: Matrix::identity(),
            font_key: None,
        }
    }
}

#[derive(Clone)]
struct GraphicsState {
    ctm: Matrix,
    text: TextState,
}

/// 当前字体的解码信息。
#[derive(Debug, Clone, Default)]
struct FontInfo {
    /// Type0 复合字体按双字节取码
    two_byte: bool,
    to_unicode: Option<HashMap<u32, String>>,
}

/// 逐行累积的文本运行，flush 时转为左上坐标的行矩形。
struct TextRun {
    text: String,
    x0: f64,
    x1: f64,
    baseline: f64,
    size: f64,
}

fn as_num(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some((*f).into()),
        _ => None,
    }
}

fn operand_num(operands: &[Object], index: usize) -> f64 {
    operands.get(index).and_then(as_num).unwrap_or(0.0)
}

fn maybe_deref<'a>(doc: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(object),
        _ => object,
    }
}

fn dict_of<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    let resolved = maybe_deref(doc, object);
    resolved
        .as_dict()
        .ok()
        .or_else(|| resolved.as_stream().ok().map(|s| &s.dict))
}

/// 页面属性允许挂在祖先节点上，这里沿 Parent 链找。
fn inherited_attr<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = page_id;
    for _ in 0..16 {
        let dict = doc.get_object(current).ok()?.as_dict().ok()?;
        if let Ok(value) = dict.get(key) {
            return Some(maybe_deref(doc, value));
        }
        match dict.get(b"Parent") {
            Ok(Object::Reference(parent)) => current = *parent,
            _ => break,
        }
    }
    None
}

fn media_box(doc: &Document, page_id: ObjectId) -> (f64, f64, f64, f64) {
    if let Some(Object::Array(values)) = inherited_attr(doc, page_id, b"MediaBox") {
        let nums: Vec<f64> = values
            .iter()
            .map(|v| as_num(maybe_deref(doc, v)).unwrap_or(0.0))
            .collect();
        if nums.len() == 4 {
            return (nums[0], nums[1], nums[2], nums[3]);
        }
    }
    // 缺省按 US Letter
    (0.0, 0.0, 612.0, 792.0)
}

fn page_resources<'a>(doc: &'a Document, page_id: ObjectId) -> Option<&'a Dictionary> {
    inherited_attr(doc, page_id, b"Resources").and_then(|obj| obj.as_dict().ok())
}

fn hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([0-9A-Fa-f]+)>").unwrap())
}

fn bfchar_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)beginbfchar(.*?)endbfchar").unwrap())
}

fn bfrange_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)beginbfrange(.*?)endbfrange").unwrap())
}

fn hex_to_u32(hex: &str) -> Option<u32> {
    u32::from_str_radix(hex, 16).ok()
}

fn hex_to_utf16_string(hex: &str) -> Option<String> {
    if hex.len() % 4 != 0 || hex.is_empty() {
        // 单字节目标值按码点处理
        return hex_to_u32(hex).and_then(char::from_u32).map(String::from);
    }
    let mut units = Vec::with_capacity(hex.len() / 4);
    for chunk in hex.as_bytes().chunks(4) {
        let s = std::str::from_utf8(chunk).ok()?;
        units.push(u16::from_str_radix(s, 16).ok()?);
    }
    String::from_utf16(&units).ok()
}

/// 解析 ToUnicode CMap 里的 bfchar/bfrange（常见形态，不求完备）。
fn parse_to_unicode(data: &[u8]) -> HashMap<u32, String> {
    let text = String::from_utf8_lossy(data);
    let mut map = HashMap::new();

    for block in bfchar_re().captures_iter(&text) {
        let tokens: Vec<&str> = hex_re()
            .captures_iter(&block[1])
            .map(|c| c.get(1).map(|m| m.as_str()).unwrap_or(""))
            .collect();
        for pair in tokens.chunks(2) {
            if pair.len() != 2 {
                continue;
            }
            if let (Some(code), Some(value)) = (hex_to_u32(pair[0]), hex_to_utf16_string(pair[1])) {
                map.insert(code, value);
            }
        }
    }

    for block in bfrange_re().captures_iter(&text) {
        // 只处理 <lo> <hi> <start> 形态；数组形态逐项对应
        for line in block[1].lines() {
            let tokens: Vec<&str> = hex_re()
                .captures_iter(line)
                .map(|c| c.get(1).map(|m| m.as_str()).unwrap_or(""))
                .collect();
            if tokens.len() < 3 {
                continue;
            }
            let (Some(lo), Some(hi)) = (hex_to_u32(tokens[0]), hex_to_u32(tokens[1])) else {
                continue;
            };
            if hi < lo || hi - lo > 0xFFFF {
                continue;
            }
            if line.contains('[') {
                for (offset, token) in tokens[2..].iter().enumerate() {
                    let code = lo + offset as u32;
                    if code > hi {
                        break;
                    }
                    if let Some(value) = hex_to_utf16_string(token) {
                        map.insert(code, value);
                    }
                }
            } else if let Some(start) = hex_to_u32(tokens[2]) {
                for offset in 0..=(hi - lo) {
                    if let Some(ch) = char::from_u32(start + offset) {
                        map.insert(lo + offset, ch.to_string());
                    }
                }
            }
        }
    }

    map
}

fn load_font_info(doc: &Document, resources: &Dictionary, name: &[u8]) -> FontInfo {
    let mut info = FontInfo::default();
    let Some(fonts) = resources.get(b"Font").ok().and_then(|f| dict_of(doc, f)) else {
        return info;
    };
    let Some(font_dict) = fonts.get(name).ok().and_then(|f| dict_of(doc, f)) else {
        return info;
    };

    if let Ok(subtype) = font_dict.get(b"Subtype").and_then(|s| s.as_name()) {
        info.two_byte = subtype == b"Type0";
    }
    if let Ok(to_unicode) = font_dict.get(b"ToUnicode") {
        let resolved = maybe_deref(doc, to_unicode);
        if let Ok(stream) = resolved.as_stream() {
            let data = stream
                .decompressed_content()
                .unwrap_or_else(|_| stream.content.clone());
            let map = parse_to_unicode(&data);
            if !map.is_empty() {
                info.to_unicode = Some(map);
            }
        }
    }
    info
}

/// 按字体信息把 PDF 字符串解码成可读文本。
fn decode_string(bytes: &[u8], font: &FontInfo) -> String {
    let mut out = String::new();
    if font.two_byte {
        for chunk in bytes.chunks(2) {
            let code = if chunk.len() == 2 {
                ((chunk[0] as u32) << 8) | chunk[1] as u32
            } else {
                chunk[0] as u32
            };
            if let Some(map) = &font.to_unicode {
                if let Some(s) = map.get(&code) {
                    out.push_str(s);
                    continue;
                }
            }
            // 无映射的 CID 没有可逆文本，占位即可
            out.push('\u{FFFD}');
        }
    } else {
        for &byte in bytes {
            if let Some(map) = &font.to_unicode {
                if let Some(s) = map.get(&(byte as u32)) {
                    out.push_str(s);
                    continue;
                }
            }
            if (0x20..0x7F).contains(&byte) {
                out.push(byte as char);
            } else {
                out.push('\u{FFFD}');
            }
        }
    }
    out
}

/// 字符串里的字符数（按解码后字符计费横向推进）。
fn code_count(bytes: &[u8], font: &FontInfo) -> usize {
    if font.two_byte {
        (bytes.len() + 1) / 2
    } else {
        bytes.len()
    }
}

struct PageScanner<'a> {
    doc: &'a Document,
    page_llx: f64,
    page_ury: f64,
    layout: PageLayout,
    font_cache: HashMap<Vec<u8>, FontInfo>,
    runs: Vec<TextRun>,
    current: Option<TextRun>,
}

impl<'a> PageScanner<'a> {
    fn to_top_left(&self, x: f64, y: f64) -> (f64, f64) {
        (x - self.page_llx, self.page_ury - y)
    }

    fn flush_run(&mut self) {
        if let Some(run) = self.current.take() {
            if !run.text.trim().is_empty() {
                self.runs.push(run);
            }
        }
    }

    /// 输出一段已定位的文本。position 为基线左端的设备坐标（PDF 方向）。
    fn emit_text(&mut self, text: &str, x: f64, y: f64, advance: f64, size: f64) {
        if text.is_empty() {
            return;
        }
        let same_line = self
            .current
            .as_ref()
            .map(|run| (run.baseline - y).abs() < size.max(1.0) * 0.4)
            .unwrap_or(false);

        if same_line {
            let run = self.current.as_mut().unwrap();
            let gap = x - run.x1;
            if gap > size * 0.25 {
                run.text.push(' ');
            }
            if gap > -size {
                run.text.push_str(text);
                run.x1 = run.x1.max(x + advance);
                run.size = run.size.max(size);
                return;
            }
            // 光标大幅回退视为新行
        }

        self.flush_run();
        self.current = Some(TextRun {
            text: text.to_string(),
            x0: x,
            x1: x + advance,
            baseline: y,
            size,
        });
    }

    fn record_image_rect(&mut self, ctm: &Matrix) {
        // 图片绘制在单位正方形内，四角过 CTM 后取包围盒
        let corners = [
            ctm.apply(0.0, 0.0),
            ctm.apply(1.0, 0.0),
            ctm.apply(0.0, 1.0),
            ctm.apply(1.0, 1.0),
        ];
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }
        let (x0, y1) = self.to_top_left(min_x, min_y);
        let (x1, y0) = self.to_top_left(max_x, max_y);
        let rect = Rect::new(x0, y0, x1, y1);
        if rect.is_valid() {
            self.layout.image_rects.push(rect);
        }
    }

    fn record_drawing_bbox(&mut self, points: &[(f64, f64)]) {
        if points.is_empty() {
            return;
        }
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &(x, y) in points {
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }
        let (x0, y1) = self.to_top_left(min_x, min_y);
        let (x1, y0) = self.to_top_left(max_x, max_y);
        let rect = Rect::new(x0, y0, x1, y1);
        if rect.width() > 0.5 || rect.height() > 0.5 {
            self.layout.drawing_rects.push(rect);
        }
    }

    fn show_text(&mut self, bytes: &[u8], gs: &mut GraphicsState, resources: &Dictionary) {
        let font = match &gs.text.font_key {
            Some(key) => self
                .font_cache
                .entry(key.clone())
                .or_insert_with(|| load_font_info(self.doc, resources, key))
                .clone(),
            None => FontInfo::default(),
        };

        let decoded = decode_string(bytes, &font);
        let codes = code_count(bytes, &font) as f64;
        let spaces = bytes.iter().filter(|&&b| b == b' ').count() as f64;

        let trm = gs.text.tm.then(&gs.ctm);
        let (dev_x, dev_y) = (trm.e, trm.f);
        let dev_size = (gs.text.font_size * trm.scale_factor()).max(1.0);

        // 近似推进：每个码元按固定 em 比例加上字符间距，空格计入词间距
        let advance_text_units = (codes
            * (APPROX_CHAR_EM * gs.text.font_size + gs.text.char_spacing)
            + spaces * gs.text.word_spacing)
            * gs.text.horizontal_scaling;
        let advance_dev = advance_text_units * trm.scale_factor();

        let (x, y) = self.to_top_left(dev_x, dev_y);
        // 注意此处 y 是基线行位置的近似，emit_text 只按基线分行
        self.emit_text(&decoded, x, y, advance_dev, dev_size);

        gs.text.tm = Matrix::translation(advance_text_units, 0.0).then(&gs.text.tm);
    }

    fn process_content(
        &mut self,
        content: &[u8],
        resources: &Dictionary,
        base_ctm: Matrix,
        depth: u32,
    ) {
        let operations = match Content::decode(content) {
            Ok(content) => content.operations,
            Err(e) => {
                debug!("内容流解码失败: {}", e);
                return;
            }
        };

        let mut gs = GraphicsState {
            ctm: base_ctm,
            text: TextState::new(),
        };
        let mut stack: Vec<GraphicsState> = Vec::new();
        let mut path_points: Vec<(f64, f64)> = Vec::new();
        let mut pending_clip = false;

        for op in &operations {
            let operands = &op.operands;
            match op.operator.as_str() {
                "q" => stack.push(gs.clone()),
                "Q" => {
                    if let Some(saved) = stack.pop() {
                        gs = saved;
                    }
                }
                "cm" => {
                    let m = Matrix::new(
                        operand_num(operands, 0),
                        operand_num(operands, 1),
                        operand_num(operands, 2),
                        operand_num(operands, 3),
                        operand_num(operands, 4),
                        operand_num(operands, 5),
                    );
                    gs.ctm = m.then(&gs.ctm);
                }
                "BT" => {
                    gs.text.tm = Matrix::identity();
                    gs.text.tlm = Matrix::identity();
                }
                "ET" => {
                    self.flush_run();
                }
                "Tf" => {
                    if let Some(Object::Name(name)) = operands.first() {
                        gs.text.font_key = Some(name.clone());
                    }
                    gs.text.font_size = operand_num(operands, 1);
                }
                "Tc" => gs.text.char_spacing = operand_num(operands, 0),
                "Tw" => gs.text.word_spacing = operand_num(operands, 0),
                "Tz" => gs.text.horizontal_scaling = operand_num(operands, 0) / 100.0,
                "TL" => gs.text.leading = operand_num(operands, 0),
                "Tm" => {
                    let m = Matrix::new(
                        operand_num(operands, 0),
                        operand_num(operands, 1),
                        operand_num(operands, 2),
                        operand_num(operands, 3),
                        operand_num(operands, 4),
                        operand_num(operands, 5),
                    );
                    gs.text.tlm = m;
                    gs.text.tm = m;
                }
                "Td" => {
                    let m = Matrix::translation(operand_num(operands, 0), operand_num(operands, 1));
                    gs.text.tlm = m.then(&gs.text.tlm);
                    gs.text.tm = gs.text.tlm;
                }
                "TD" => {
                    gs.text.leading = -operand_num(operands, 1);
                    let m = Matrix::translation(operand_num(operands, 0), operand_num(operands, 1));
                    gs.text.tlm = m.then(&gs.text.tlm);
                    gs.text.tm = gs.text.tlm;
                }
                "T*" => {
                    let m = Matrix::translation(0.0, -gs.text.leading);
                    gs.text.tlm = m.then(&gs.text.tlm);
                    gs.text.tm = gs.text.tlm;
                }
                "Tj" => {
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        let bytes = bytes.clone();
                        self.show_text(&bytes, &mut gs, resources);
                    }
                }
                "'" => {
                    let m = Matrix::translation(0.0, -gs.text.leading);
                    gs.text.tlm = m.then(&gs.text.tlm);
                    gs.text.tm = gs.text.tlm;
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        let bytes = bytes.clone();
                        self.show_text(&bytes, &mut gs, resources);
                    }
                }
                "\"" => {
                    gs.text.word_spacing = operand_num(operands, 0);
                    gs.text.char_spacing = operand_num(operands, 1);
                    let m = Matrix::translation(0.0, -gs.text.leading);
                    gs.text.tlm = m.then(&gs.text.tlm);
                    gs.text.tm = gs.text.tlm;
                    if let Some(Object::String(bytes, _)) = operands.get(2) {
                        let bytes = bytes.clone();
                        self.show_text(&bytes, &mut gs, resources);
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = operands.first() {
                        let items = items.clone();
                        for item in &items {
                            match item {
                                Object::String(bytes, _) => {
                                    self.show_text(bytes, &mut gs, resources);
                                }
                                Object::Integer(_) | Object::Real(_) => {
                                    let adjust = as_num(item).unwrap_or(0.0);
                                    let tx = -adjust / 1000.0
                                        * gs.text.font_size
                                        * gs.text.horizontal_scaling;
                                    gs.text.tm = Matrix::translation(tx, 0.0).then(&gs.text.tm);
                                }
                                _ => {}
                            }
                        }
                    }
                }
                // 路径构造，入点即做 CTM 变换
                "m" | "l" => {
                    let p = gs.ctm.apply(operand_num(operands, 0), operand_num(operands, 1));
                    path_points.push(p);
                }
                "c" => {
                    for i in 0..3 {
                        let p = gs
                            .ctm
                            .apply(operand_num(operands, i * 2), operand_num(operands, i * 2 + 1));
                        path_points.push(p);
                    }
                }
                "v" | "y" => {
                    for i in 0..2 {
                        let p = gs
                            .ctm
                            .apply(operand_num(operands, i * 2), operand_num(operands, i * 2 + 1));
                        path_points.push(p);
                    }
                }
                "re" => {
                    let x = operand_num(operands, 0);
                    let y = operand_num(operands, 1);
                    let w = operand_num(operands, 2);
                    let h = operand_num(operands, 3);
                    path_points.push(gs.ctm.apply(x, y));
                    path_points.push(gs.ctm.apply(x + w, y));
                    path_points.push(gs.ctm.apply(x, y + h));
                    path_points.push(gs.ctm.apply(x + w, y + h));
                }
                "W" | "W*" => pending_clip = true,
                "S" | "s" | "f" | "F" | "f*" | "B" | "B*" | "b" | "b*" => {
                    if !pending_clip {
                        let points = std::mem::take(&mut path_points);
                        self.record_drawing_bbox(&points);
                    } else {
                        path_points.clear();
                        pending_clip = false;
                    }
                }
                "n" => {
                    // 裁剪路径或空操作，不算绘制
                    path_points.clear();
                    pending_clip = false;
                }
                "Do" => {
                    let Some(Object::Name(name)) = operands.first() else {
                        continue;
                    };
                    let Some(xobjects) = resources
                        .get(b"XObject")
                        .ok()
                        .and_then(|x| dict_of(self.doc, x))
                    else {
                        continue;
                    };
                    let Some(stream_obj) = xobjects.get(name).ok() else {
                        continue;
                    };
                    let resolved = maybe_deref(self.doc, stream_obj);
                    let Ok(stream) = resolved.as_stream() else {
                        continue;
                    };
                    let subtype = stream
                        .dict
                        .get(b"Subtype")
                        .ok()
                        .and_then(|s| s.as_name().ok());
                    match subtype {
                        Some(name) if name == b"Image" => self.record_image_rect(&gs.ctm),
                        Some(name) if name == b"Form" && depth < MAX_FORM_DEPTH => {
                            let form_matrix = match stream.dict.get(b"Matrix") {
                                Ok(Object::Array(values)) if values.len() == 6 => Matrix::new(
                                    as_num(&values[0]).unwrap_or(1.0),
                                    as_num(&values[1]).unwrap_or(0.0),
                                    as_num(&values[2]).unwrap_or(0.0),
                                    as_num(&values[3]).unwrap_or(1.0),
                                    as_num(&values[4]).unwrap_or(0.0),
                                    as_num(&values[5]).unwrap_or(0.0),
                                ),
                                _ => Matrix::identity(),
                            };
                            let inner_resources = stream
                                .dict
                                .get(b"Resources")
                                .ok()
                                .and_then(|r| dict_of(self.doc, r))
                                .unwrap_or(resources);
                            let data = stream
                                .decompressed_content()
                                .unwrap_or_else(|_| stream.content.clone());
                            let inner_ctm = form_matrix.then(&gs.ctm);
                            self.process_content(&data, inner_resources, inner_ctm, depth + 1);
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        self.flush_run();
    }

    /// 行运行合并为文本块：左端对齐、行距不超过 1.6 倍字号的相邻行并为一块。
    fn build_blocks(&mut self) {
        let mut runs = std::mem::take(&mut self.runs);
        runs.sort_by(|a, b| {
            (a.baseline, a.x0)
                .partial_cmp(&(b.baseline, b.x0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut blocks: Vec<TextBlock> = Vec::new();
        let mut pending: Option<(String, Rect, f64)> = None;

        for run in runs {
            let line_rect = Rect::new(
                run.x0,
                run.baseline - run.size * 0.8,
                run.x1,
                run.baseline + run.size * 0.25,
            );
            match pending.take() {
                Some((mut text, rect, size)) => {
                    let gap = line_rect.y0 - rect.y1;
                    let x_aligned = (line_rect.x0 - rect.x0).abs() < size * 2.0;
                    if gap >= -2.0 && gap <= size * 1.6 && x_aligned {
                        text.push(' ');
                        text.push_str(&run.text);
                        pending = Some((text, rect.union(&line_rect), size.max(run.size)));
                    } else {
                        blocks.push(TextBlock { text, bbox: rect });
                        pending = Some((run.text, line_rect, run.size));
                    }
                }
                None => {
                    pending = Some((run.text, line_rect, run.size));
                }
            }
        }
        if let Some((text, rect, _)) = pending {
            blocks.push(TextBlock { text, bbox: rect });
        }
        self.layout.text_blocks = blocks;
    }
}

/// 扫描整个文档，返回每页的几何布局（页序与文档一致）。
///
/// 单页失败只降级为空布局，不中断整篇处理。
pub fn scan_document(doc: &Document) -> Vec<PageLayout> {
    let mut layouts = Vec::new();

    for (page_num, page_id) in doc.get_pages() {
        let (llx, lly, urx, ury) = media_box(doc, page_id);
        let mut scanner = PageScanner {
            doc,
            page_llx: llx,
            page_ury: ury,
            layout: PageLayout {
                width: urx - llx,
                height: ury - lly,
                ..PageLayout::default()
            },
            font_cache: HashMap::new(),
            runs: Vec::new(),
            current: None,
        };

        match doc.get_page_content(page_id) {
            Ok(content) => {
                if let Some(resources) = page_resources(doc, page_id) {
                    scanner.process_content(&content, resources, Matrix::identity(), 0);
                } else {
                    // 没有资源字典时仍可收集路径几何
                    let empty = Dictionary::new();
                    scanner.process_content(&content, &empty, Matrix::identity(), 0);
                }
            }
            Err(e) => {
                warn!("第 {} 页内容流读取失败: {}", page_num, e);
            }
        }

        scanner.build_blocks();
        debug!(
            "第 {} 页: 文本块 {}, 图片 {}, 矢量 {}",
            page_num,
            scanner.layout.text_blocks.len(),
            scanner.layout.image_rects.len(),
            scanner.layout.drawing_rects.len()
        );
        layouts.push(scanner.layout);
    }

    layouts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_translation_composes() {
        let m = Matrix::translation(10.0, 5.0).then(&Matrix::identity());
        assert_eq!(m.apply(0.0, 0.0), (10.0, 5.0));

        let scaled = Matrix::new(2.0, 0.0, 0.0, 2.0, 0.0, 0.0);
        let combined = Matrix::translation(10.0, 5.0).then(&scaled);
        // 平移先行，再整体放大
        assert_eq!(combined.apply(0.0, 0.0), (20.0, 10.0));
    }

    #[test]
    fn to_unicode_bfchar_parsing() {
        let cmap = b"
/CIDInit /ProcSet findresource begin
begincmap
beginbfchar
<0041> <0041>
<0042> <0062>
endbfchar
endcmap
";
        let map = parse_to_unicode(cmap);
        assert_eq!(map.get(&0x41).map(String::as_str), Some("A"));
        assert_eq!(map.get(&0x42).map(String::as_str), Some("b"));
    }

    #[test]
    fn to_unicode_bfrange_parsing() {
        let cmap = b"
beginbfrange
<0020> <0025> <0020>
endbfrange
";
        let map = parse_to_unicode(cmap);
        assert_eq!(map.get(&0x20).map(String::as_str), Some(" "));
        assert_eq!(map.get(&0x25).map(String::as_str), Some("%"));
    }

    #[test]
    fn decode_simple_font_ascii_passthrough() {
        let font = FontInfo::default();
        assert_eq!(decode_string(b"Figure 1", &font), "Figure 1");
    }

    #[test]
    fn decode_two_byte_uses_to_unicode() {
        let mut map = HashMap::new();
        map.insert(0x0102u32, "F".to_string());
        map.insert(0x0103u32, "i".to_string());
        let font = FontInfo {
            two_byte: true,
            to_unicode: Some(map),
        };
        assert_eq!(decode_string(&[0x01, 0x02, 0x01, 0x03], &font), "Fi");
    }

    /// 用 lopdf 现场拼一个单页 PDF：一张 300x200 的图摆在图注上方，
    /// 扫描层应还原出两者的几何关系，区域求解落在图注上沿之上。
    #[test]
    fn synthetic_page_scans_into_caption_and_image_geometry() {
        use crate::parser::{captions, region};
        use lopdf::content::Operation;
        use lopdf::{dictionary, Stream, StringFormat};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 100,
                "Height" => 80,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            vec![0u8; 100 * 80 * 3],
        ));

        let operations = vec![
            Operation::new("q", vec![]),
            // 图片占位: x 150..450, y(PDF) 400..600
            Operation::new(
                "cm",
                vec![
                    300.into(),
                    0.into(),
                    0.into(),
                    200.into(),
                    150.into(),
                    400.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im1".to_vec())]),
            Operation::new("Q", vec![]),
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), 12.into()]),
            Operation::new(
                "Tm",
                vec![1.into(), 0.into(), 0.into(), 1.into(), 150.into(), 360.into()],
            ),
            Operation::new(
                "Tj",
                vec![Object::String(
                    b"Figure 1: Overview of the framework".to_vec(),
                    StringFormat::Literal,
                )],
            ),
            Operation::new("ET", vec![]),
        ];
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("content encodes"),
        ));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
                "XObject" => dictionary! { "Im1" => image_id },
            },
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let layouts = scan_document(&doc);
        assert_eq!(layouts.len(), 1);
        let page = &layouts[0];
        assert_eq!(page.width, 612.0);
        assert_eq!(page.height, 792.0);

        assert_eq!(page.image_rects.len(), 1);
        let image = page.image_rects[0];
        assert!((image.x0 - 150.0).abs() < 1.0 && (image.x1 - 450.0).abs() < 1.0);
        assert!((image.y0 - 192.0).abs() < 1.0 && (image.y1 - 392.0).abs() < 1.0);

        let found = captions::find_captions_in_blocks(&page.text_blocks);
        assert_eq!(found.len(), 1, "文本块: {:?}", page.text_blocks);
        assert!(found[0].text.starts_with("Figure 1: Overview"));
        // 图注在图片下方
        assert!(found[0].bbox.y0 > image.y1);

        let size = region::PageSize {
            width: page.width,
            height: page.height,
        };
        let resolved = region::resolve_caption_region(
            &found[0].bbox,
            &found[0].text,
            &size,
            &page.graphic_objects(),
        )
        .expect("区域可解析");
        assert!(resolved.y1 < found[0].bbox.y0);
        assert!(resolved.x0 <= image.x0 && resolved.x1 >= image.x1);
    }
}
