//! 图注锚定的图形区域求解。
//!
//! 输入是一条图注的包围盒加上页面上全部图形对象（嵌入图片与矢量绘制
//! 片段）的包围盒，输出一个可供裁剪渲染的矩形。所有函数都是纯函数，
//! 只操作 [`Rect`]，不接触任何 PDF 库对象。
//!
//! 求解顺序：直接匹配 → 簇合并 → 碎片并集（带覆盖率门限）→ 固定窗口
//! 兜底。之后经过邻接扩展、宽图提升和留白收尾。阈值都是经验调参值，
//! 按命名常量保留。

use regex::Regex;
use std::sync::OnceLock;

use super::geom::{union_all, Rect};

/// 页眉硬保护带占页高比例，落在其中的对象一律不参与匹配。
pub const HEADER_GUARD_RATIO: f64 = 0.03;
/// 常规页眉裁剪线占页高比例。
pub const HEADER_CUTOFF_RATIO: f64 = 0.06;
/// 非宽图留白时允许向上放松的额外比例。
pub const RELAXED_HEADER_EXTRA_RATIO: f64 = 0.04;
/// 兜底窗口的左右边距比例。
pub const ALT_SIDE_MARGIN_RATIO: f64 = 0.02;
/// 兜底窗口向图注上方伸展的最大页高比例。
pub const ALT_TOP_WINDOW_RATIO: f64 = 0.68;
/// 宽窗口的左右边距比例。
pub const WIDE_SIDE_MARGIN_RATIO: f64 = 0.015;
/// 宽窗口向图注上方伸展的最大页高比例。
pub const WIDE_TOP_WINDOW_RATIO: f64 = 0.80;
/// 宽度比低于此值的区域才考虑宽窗口提升。
pub const WIDE_FIGURE_MIN_WIDTH_RATIO: f64 = 0.74;
/// 簇合并允许的横向间隙占页宽比例。
pub const CLUSTER_X_GAP_RATIO: f64 = 0.28;
/// 邻接扩展的横向搜索范围占页宽比例。
pub const NEIGHBOR_X_EXPAND_RATIO: f64 = 0.42;
/// 碎片并集的面积覆盖率门限，低于它判定为零散噪声。
pub const FRAGMENT_COVERAGE_THRESHOLD: f64 = 0.10;
/// 宽图注且宽度比不超过此值时无条件换用宽窗口。
pub const FORCE_WIDE_NARROW_RATIO: f64 = 0.86;
/// 宽图留白的顶部下限占页高比例。
pub const BROAD_TOP_FLOOR_RATIO: f64 = 0.008;
/// 宽图留白的侧边比例与尺寸缩放系数。
pub const BROAD_SIDE_PAD_RATIO: f64 = 0.028;
pub const BROAD_PAD_X_SCALE: f64 = 0.055;
pub const BROAD_PAD_Y_SCALE: f64 = 0.045;

/// 裁剪区域的最小宽高（页面单位），再小就放弃该图注。
pub const MIN_CLIP_WIDTH: f64 = 120.0;
pub const MIN_CLIP_HEIGHT: f64 = 80.0;

/// 页面尺寸（用户空间单位）。
#[derive(Debug, Clone, Copy)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    pub fn header_guard(&self) -> f64 {
        self.height * HEADER_GUARD_RATIO
    }

    fn relaxed_header_cutoff(&self) -> f64 {
        let cutoff = self.height * HEADER_CUTOFF_RATIO;
        self.header_guard()
            .max(cutoff - self.height * RELAXED_HEADER_EXTRA_RATIO)
    }
}

fn figure_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:figure|fig\.?)\s*(\d+)").unwrap())
}

/// 判断图注是否描述横贯版面的总览/多面板图。
///
/// 命中子图标记、总览类关键词，或者图号很小（前两张图统计上
/// 多为整体框架图）都算。这类图最怕裁剪过窄，提升策略会偏向
/// 过度包含。
pub fn is_broad_figure_caption(caption_text: &str) -> bool {
    let text = caption_text.to_lowercase();
    const BROAD_TOKENS: [&str; 12] = [
        "(a)",
        "(b)",
        "(c)",
        "overview",
        "framework",
        "taxonomy",
        "task suite",
        "pipeline",
        "architecture",
        "system diagram",
        "left:",
        "right:",
    ];
    if BROAD_TOKENS.iter().any(|token| text.contains(token)) {
        return true;
    }

    if let Some(cap) = figure_number_re().captures(&text) {
        if let Ok(number) = cap[1].parse::<u32>() {
            if (1..=2).contains(&number) {
                return true;
            }
        }
    }
    false
}

/// 第一阶段：从页面对象里为图注挑选初始区域。
///
/// 依次尝试直接匹配（图注正上方最近的单个大对象，距离优先、面积
/// 破平）、围绕它的簇合并（并排多面板）、小碎片的覆盖率并集，最后
/// 是固定几何窗口。全部失败返回 None。
pub fn select_figure_region(caption: &Rect, page: &PageSize, objects: &[Rect]) -> Option<Rect> {
    let cap_top = caption.y0;
    let guard = page.header_guard();

    let mut candidates: Vec<(f64, f64, usize)> = Vec::new();
    for (idx, rect) in objects.iter().enumerate() {
        if rect.y1 > cap_top + 4.0 {
            continue;
        }
        if rect.y0 < guard {
            continue;
        }
        if rect.width() < page.width * 0.16 {
            continue;
        }
        if rect.height() < page.height * 0.06 {
            continue;
        }
        let distance = cap_top - rect.y1;
        if distance < -2.0 {
            continue;
        }
        candidates.push((distance, -rect.area(), idx));
    }

    if !candidates.is_empty() {
        // 排序稳定，得分相同的按对象在内容流中的出现顺序取先者
        candidates.sort_by(|a, b| (a.0, a.1).partial_cmp(&(b.0, b.1)).unwrap_or(std::cmp::Ordering::Equal));
        let best_idx = candidates[0].2;
        let mut best = objects[best_idx];

        let mut cluster: Vec<Rect> = vec![best];
        let x_gap = page.width * CLUSTER_X_GAP_RATIO;
        for (idx, rect) in objects.iter().enumerate() {
            if idx == best_idx {
                continue;
            }
            if rect.y1 > cap_top + 4.0 || rect.y0 < guard {
                continue;
            }
            if rect.width() < page.width * 0.10 || rect.height() < page.height * 0.04 {
                continue;
            }
            if rect.x1 < best.x0 - x_gap || rect.x0 > best.x1 + x_gap {
                continue;
            }
            let overlap = rect.vertical_overlap(&best);
            let aligned = overlap >= rect.height().min(best.height()) * 0.12
                || (rect.y0 - best.y0).abs() <= page.height * 0.06;
            if !aligned {
                continue;
            }
            cluster.push(*rect);
        }

        if cluster.len() >= 2 {
            if let Some(union) = union_all(&cluster) {
                // 并集必须明显更大，且不能吞掉大半页（避免卷入无关内容）
                if union.area() >= best.area() * 1.20 && union.height() <= page.height * 0.72 {
                    best = union;
                }
            }
        }

        let pad_x = page.width * 0.01;
        let pad_y = page.height * 0.01;
        return Some(Rect::new(
            (best.x0 - pad_x).max(0.0),
            (best.y0 - pad_y).max(guard),
            (best.x1 + pad_x).min(page.width),
            (best.y1 + pad_y).min(cap_top - 2.0),
        ));
    }

    // 矢量图常被拆成几十个路径碎片，这里按覆盖率收编
    let mut fragments: Vec<Rect> = Vec::new();
    for rect in objects {
        if rect.y1 > cap_top + 4.0 || rect.y0 < guard {
            continue;
        }
        if cap_top - rect.y1 > page.height * 0.62 {
            continue;
        }
        if rect.width() < page.width * 0.04 {
            continue;
        }
        if rect.height() < page.height * 0.025 {
            continue;
        }
        if rect.area() < page.width * page.height * 0.0004 {
            continue;
        }
        fragments.push(*rect);
    }

    if fragments.len() >= 2 {
        if let Some(union) = union_all(&fragments) {
            if union.width() >= page.width * 0.28 && union.height() >= page.height * 0.10 {
                let covered: f64 = fragments.iter().map(Rect::area).sum();
                let coverage = covered / union.area().max(1.0);
                if coverage >= FRAGMENT_COVERAGE_THRESHOLD {
                    let pad_x = page.width * 0.01;
                    let pad_y = page.height * 0.01;
                    return Some(Rect::new(
                        (union.x0 - pad_x).max(0.0),
                        (union.y0 - pad_y).max(guard),
                        (union.x1 + pad_x).min(page.width),
                        (union.y1 + pad_y).min(cap_top - 2.0),
                    ));
                }
            }
        }
    }

    // 什么对象都绑不上时退回固定窗口（纯矢量图常见）
    let top = guard.max(cap_top - page.height * ALT_TOP_WINDOW_RATIO);
    let bottom = cap_top - 2.0;
    if bottom - top < 90.0 {
        return None;
    }
    Some(Rect::new(
        page.width * ALT_SIDE_MARGIN_RATIO,
        top,
        page.width * (1.0 - ALT_SIDE_MARGIN_RATIO),
        bottom,
    ))
}

/// 第二阶段：把与当前区域左右对齐的邻接对象并进来。
///
/// 并排子图若分属独立的嵌入图片，直接匹配只会取到其中一块，
/// 这一步负责补全另一侧。
pub fn expand_by_neighbors(
    clip: Rect,
    page: &PageSize,
    objects: &[Rect],
    caption_top: f64,
    top_guard: f64,
) -> Rect {
    let mut neighbors: Vec<Rect> = Vec::new();
    for rect in objects {
        if rect.y1 > caption_top + 6.0 || rect.y0 < top_guard {
            continue;
        }
        if rect.width() < page.width * 0.03 || rect.height() < page.height * 0.02 {
            continue;
        }
        let reach = page.width * NEIGHBOR_X_EXPAND_RATIO;
        if rect.x1 < clip.x0 - reach || rect.x0 > clip.x1 + reach {
            continue;
        }
        let overlap = rect.vertical_overlap(&clip);
        let aligned = overlap >= rect.height().min(clip.height()) * 0.08
            || (rect.y0 - clip.y0).abs() <= page.height * 0.04
            || (rect.y1 - clip.y1).abs() <= page.height * 0.04;
        if !aligned {
            continue;
        }
        neighbors.push(*rect);
    }

    if neighbors.is_empty() {
        return clip;
    }

    neighbors.push(clip);
    let union = match union_all(&neighbors) {
        Some(u) => u,
        None => return clip,
    };
    let pad_x = page.width * 0.012;
    let pad_y = page.height * 0.012;
    Rect::new(
        (union.x0 - pad_x).max(0.0),
        (union.y0 - pad_y).max(top_guard),
        (union.x1 + pad_x).min(page.width),
        (union.y1 + pad_y).min(caption_top - 2.0),
    )
}

/// 图注上方的宽窗口（兜底与重试共用）。
pub fn wide_window(page: &PageSize, caption_top: f64, top_guard: f64) -> Rect {
    Rect::new(
        page.width * WIDE_SIDE_MARGIN_RATIO,
        top_guard.max(caption_top - page.height * WIDE_TOP_WINDOW_RATIO),
        page.width * (1.0 - WIDE_SIDE_MARGIN_RATIO),
        (caption_top - 2.0).min(page.height),
    )
}

/// 第三阶段：窄区域换成宽窗口。
///
/// 总览类图注无条件换（宽度比不超过 [`FORCE_WIDE_NARROW_RATIO`] 时）；
/// 普通图注只有宽窗口面积明显更大时才换。
pub fn promote_to_wide_window(
    clip: Rect,
    page: &PageSize,
    caption_top: f64,
    top_guard: f64,
    caption_text: &str,
) -> Rect {
    let width_ratio = clip.width() / page.width.max(1e-6);
    let broad_hint = is_broad_figure_caption(caption_text);
    if width_ratio >= WIDE_FIGURE_MIN_WIDTH_RATIO && !broad_hint {
        return clip;
    }

    let wide = wide_window(page, caption_top, top_guard);
    if wide.width() < MIN_CLIP_WIDTH || wide.height() < MIN_CLIP_HEIGHT {
        return clip;
    }
    if broad_hint && width_ratio <= FORCE_WIDE_NARROW_RATIO {
        return wide;
    }
    if wide.area() > clip.area() * 1.15 {
        return wide;
    }
    clip
}

/// 第四阶段：最终留白与尺寸校验。
///
/// 留白按区域自身尺寸缩放，宽图注给更深的留白和更低的顶部下限；
/// 下边界始终压在图注上沿之上。校验失败返回 None（调用方跳过该图注）。
pub fn finalize_clip(
    clip: Rect,
    page: &PageSize,
    caption_top: f64,
    caption_text: &str,
) -> Option<Rect> {
    let top_guard = page.header_guard();
    let broad = is_broad_figure_caption(caption_text);

    let mut clip = clip;
    let width_ratio = clip.width() / page.width.max(1e-6);
    if broad && width_ratio < 0.95 {
        clip = Rect::new(
            clip.x0.min(page.width * WIDE_SIDE_MARGIN_RATIO),
            clip.y0,
            clip.x1.max(page.width * (1.0 - WIDE_SIDE_MARGIN_RATIO)),
            clip.y1,
        );
    }

    if clip.width() < MIN_CLIP_WIDTH || clip.height() < MIN_CLIP_HEIGHT {
        let alt = wide_window(page, caption_top, top_guard);
        if alt.width() < MIN_CLIP_WIDTH || alt.height() < MIN_CLIP_HEIGHT {
            return None;
        }
        clip = alt;
    }

    let bottom_limit = caption_top - (page.height * 0.003).max(2.0);
    let (pad_x, pad_y, top_floor) = if broad {
        (
            (page.width * BROAD_SIDE_PAD_RATIO).max(clip.width() * BROAD_PAD_X_SCALE),
            (page.height * 0.018).max(clip.height() * BROAD_PAD_Y_SCALE),
            page.height * BROAD_TOP_FLOOR_RATIO,
        )
    } else {
        (
            (page.width * 0.020).max(clip.width() * 0.040),
            (page.height * 0.016).max(clip.height() * 0.040),
            page.relaxed_header_cutoff(),
        )
    };

    let padded = Rect::new(
        (clip.x0 - pad_x).max(0.0),
        (clip.y0 - pad_y).max(top_floor),
        (clip.x1 + pad_x).min(page.width),
        (clip.y1 + pad_y).min(bottom_limit),
    );
    if padded.width() < MIN_CLIP_WIDTH || padded.height() < MIN_CLIP_HEIGHT {
        return None;
    }
    Some(padded)
}

/// 完整求解：初选、邻接扩展、宽图提升、留白收尾。
pub fn resolve_caption_region(
    caption_rect: &Rect,
    caption_text: &str,
    page: &PageSize,
    objects: &[Rect],
) -> Option<Rect> {
    let top_guard = page.header_guard();
    let clip = select_figure_region(caption_rect, page, objects)?;
    let clip = expand_by_neighbors(clip, page, objects, caption_rect.y0, top_guard);
    let clip = promote_to_wide_window(clip, page, caption_rect.y0, top_guard, caption_text);
    finalize_clip(clip, page, caption_rect.y0, caption_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: PageSize = PageSize {
        width: 1000.0,
        height: 1000.0,
    };

    fn caption_at(top: f64) -> Rect {
        Rect::new(100.0, top, 500.0, top + 20.0)
    }

    #[test]
    fn broad_caption_detection() {
        assert!(is_broad_figure_caption(
            "Figure 1: Overview of the proposed framework (a) encoder (b) decoder"
        ));
        assert!(is_broad_figure_caption("Fig. 2: training pipeline"));
        assert!(is_broad_figure_caption("Figure 7: Left: input. Right: output."));
        assert!(!is_broad_figure_caption("Figure 5: Accuracy on the test split."));
    }

    #[test]
    fn direct_match_prefers_nearest_object() {
        let caption = caption_at(700.0);
        let near = Rect::new(200.0, 450.0, 700.0, 660.0);
        let far = Rect::new(200.0, 100.0, 700.0, 300.0);
        let clip = select_figure_region(&caption, &PAGE, &[far, near]).unwrap();
        // 选中靠近图注的对象，而不是更高处的那个
        assert!(clip.y0 > 300.0);
        assert!(clip.y1 < caption.y0);
    }

    #[test]
    fn cluster_merges_side_by_side_panels() {
        // 两个 120 宽的面板相距 0.2 倍页宽，垂直对齐，必须并成一块
        let caption = caption_at(700.0);
        let left = Rect::new(100.0, 500.0, 220.0, 640.0);
        let right = Rect::new(420.0, 500.0, 540.0, 640.0);
        let clip = select_figure_region(&caption, &PAGE, &[left, right]).unwrap();
        assert!(clip.width() >= 240.0, "合并后宽度 {} 不够", clip.width());
        assert!(clip.x0 <= left.x0 && clip.x1 >= right.x1);
        assert!(clip.y1 < caption.y0);
    }

    #[test]
    fn cluster_merge_absorbs_second_image_next_to_direct_match() {
        let caption = caption_at(760.0);
        let main = Rect::new(80.0, 460.0, 460.0, 740.0);
        let side = Rect::new(520.0, 470.0, 900.0, 735.0);
        let clip = select_figure_region(&caption, &PAGE, &[main, side]).unwrap();
        assert!(clip.x1 >= side.x1);
        assert!(clip.y1 < caption.y0);
    }

    #[test]
    fn fragment_union_rejected_below_coverage_threshold() {
        // 5 个碎片只盖住并集面积的 ~4%，必须拒绝并落到固定窗口
        let caption = caption_at(700.0);
        let fragments = [
            Rect::new(100.0, 300.0, 145.0, 330.0),
            Rect::new(650.0, 300.0, 695.0, 330.0),
            Rect::new(100.0, 570.0, 145.0, 600.0),
            Rect::new(650.0, 570.0, 695.0, 600.0),
            Rect::new(380.0, 440.0, 425.0, 470.0),
        ];
        let clip = select_figure_region(&caption, &PAGE, &fragments).unwrap();
        // 固定窗口的特征：侧边距为 ALT_SIDE_MARGIN_RATIO
        assert!((clip.x0 - PAGE.width * ALT_SIDE_MARGIN_RATIO).abs() < 1e-6);
        assert!((clip.x1 - PAGE.width * (1.0 - ALT_SIDE_MARGIN_RATIO)).abs() < 1e-6);
    }

    #[test]
    fn fragment_union_accepted_above_coverage_threshold() {
        // 8 块 140x50 的碎片铺满并集的大部分，逐个都到不了直接匹配的
        // 尺寸门限，但覆盖率远超 0.10，应并成一个区域
        let caption = caption_at(700.0);
        let mut fragments = Vec::new();
        for &y in &[400.0, 500.0] {
            for &x in &[150.0, 310.0, 470.0, 630.0] {
                fragments.push(Rect::new(x, y, x + 140.0, y + 50.0));
            }
        }
        let clip = select_figure_region(&caption, &PAGE, &fragments).unwrap();
        assert!(clip.x0 < 160.0 && clip.x1 > 750.0);
        assert!(clip.y1 < caption.y0);
        // 不是兜底窗口
        assert!((clip.x0 - PAGE.width * ALT_SIDE_MARGIN_RATIO).abs() > 1e-6);
    }

    #[test]
    fn fallback_window_when_no_objects() {
        let caption = caption_at(700.0);
        let clip = select_figure_region(&caption, &PAGE, &[]).unwrap();
        assert!(clip.y1 < caption.y0);
        assert!(clip.y0 >= PAGE.header_guard());
    }

    #[test]
    fn fallback_rejected_when_caption_too_high() {
        // 图注紧贴页眉，窗口高度不足 90 时放弃
        let caption = caption_at(100.0);
        assert!(select_figure_region(&caption, &PAGE, &[]).is_none());
    }

    #[test]
    fn resolved_region_never_crosses_caption() {
        let caption = caption_at(720.0);
        let cases: Vec<Vec<Rect>> = vec![
            // 直接匹配
            vec![Rect::new(200.0, 400.0, 700.0, 680.0)],
            // 碎片并集
            vec![
                Rect::new(150.0, 400.0, 450.0, 560.0),
                Rect::new(470.0, 400.0, 760.0, 560.0),
            ],
            // 兜底窗口
            vec![],
        ];
        for objects in cases {
            if let Some(clip) =
                resolve_caption_region(&caption, "Figure 4: Ablation results.", &PAGE, &objects)
            {
                assert!(
                    clip.y1 < caption.y0,
                    "区域下边 {} 越过了图注上沿 {}",
                    clip.y1,
                    caption.y0
                );
            }
        }
    }

    #[test]
    fn broad_caption_promotes_narrow_region_to_wide() {
        let page = PageSize {
            width: 1000.0,
            height: 800.0,
        };
        let caption = Rect::new(150.0, 600.0, 850.0, 620.0);
        // 直接匹配宽度只有 60% 页宽
        let object = Rect::new(200.0, 300.0, 800.0, 580.0);
        let text = "Figure 1: Overview of the proposed framework (a) encoder (b) decoder";
        let clip = resolve_caption_region(&caption, text, &page, &[object]).unwrap();
        let min_width = 0.95 * page.width * (1.0 - 2.0 * WIDE_SIDE_MARGIN_RATIO);
        assert!(
            clip.width() >= min_width,
            "宽度 {} 未达到提升要求 {}",
            clip.width(),
            min_width
        );
        assert!(clip.y1 < caption.y0);
    }

    #[test]
    fn ordinary_caption_keeps_wide_enough_region() {
        let caption = caption_at(700.0);
        let object = Rect::new(100.0, 400.0, 900.0, 660.0);
        let clip =
            resolve_caption_region(&caption, "Figure 6: Loss curves.", &PAGE, &[object]).unwrap();
        // 宽度比已超过 0.74，普通图注不做提升，区域仍围绕原对象
        assert!(clip.y0 >= 300.0);
        assert!(clip.y1 < caption.y0);
    }
}
