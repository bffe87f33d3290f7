//! 区域栅格化。
//!
//! 进程内没有 PDF 渲染器，整页位图交给外部工具生成（pdftoppm 优先，
//! mutool 兜底），再用 image crate 做像素级裁剪。每页只渲染一次，
//! 同页多条图注共享缓存。矢量源文件（单页 PDF 图）按更高 DPI 单独
//! 栅格化，链路是 pdftoppm → mutool → sips。

use image::DynamicImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::geom::Rect;

/// PDF 裁剪路径的渲染倍率（72dpi 的倍数）。
pub const RENDER_SCALE: f64 = 2.2;
/// 源码包矢量图的渲染 DPI。
pub const SOURCE_VECTOR_DPI: u32 = 360;
/// 裁剪渲染的最小像素面积，低于它视为废片。
pub const MIN_RENDER_PIXELS: u64 = 180_000;
/// 最大区域后端使用的更严格像素门限。
pub const MIN_LARGEST_PIXELS: u64 = 220_000;
/// 矢量图渲染结果的最小宽高（像素）。
pub const MIN_VECTOR_PIXELS: (u32, u32) = (120, 80);

/// 整页渲染 + 裁剪，带页级缓存。
pub struct PageRenderer {
    pdf_path: PathBuf,
    dpi: u32,
    cache: HashMap<usize, DynamicImage>,
    scratch: TempDir,
}

impl PageRenderer {
    pub fn new(pdf_path: &Path, scale: f64) -> std::io::Result<Self> {
        Ok(Self {
            pdf_path: pdf_path.to_path_buf(),
            dpi: (72.0 * scale).round() as u32,
            cache: HashMap::new(),
            scratch: TempDir::new()?,
        })
    }

    /// 渲染指定页（0 基）为整页位图。
    fn full_page(&mut self, page_index: usize) -> Option<&DynamicImage> {
        if !self.cache.contains_key(&page_index) {
            let prefix = self.scratch.path().join(format!("page_{}", page_index));
            let png_path = prefix.with_extension("png");
            let ok = run_pdftoppm_page(&self.pdf_path, page_index + 1, self.dpi, &prefix)
                || run_mutool_page(&self.pdf_path, page_index + 1, self.dpi, &png_path);
            if !ok {
                warn!("第 {} 页整页渲染失败", page_index + 1);
                return None;
            }
            match image::open(&png_path) {
                Ok(img) => {
                    self.cache.insert(page_index, img);
                }
                Err(e) => {
                    warn!("第 {} 页位图读取失败: {}", page_index + 1, e);
                    return None;
                }
            }
        }
        self.cache.get(&page_index)
    }

    /// 裁剪页面上的一个区域（页面单位），返回裁剪位图。
    /// 区域无效或渲染不可用时返回 None。
    pub fn crop_region(
        &mut self,
        page_index: usize,
        clip: &Rect,
        page_width: f64,
        page_height: f64,
    ) -> Option<DynamicImage> {
        if !clip.is_valid() || page_width <= 0.0 || page_height <= 0.0 {
            return None;
        }
        let page = self.full_page(page_index)?;
        let (img_w, img_h) = (page.width() as f64, page.height() as f64);
        let sx = img_w / page_width;
        let sy = img_h / page_height;

        let x = (clip.x0 * sx).floor().max(0.0) as u32;
        let y = (clip.y0 * sy).floor().max(0.0) as u32;
        let x1 = (clip.x1 * sx).ceil().min(img_w) as u32;
        let y1 = (clip.y1 * sy).ceil().min(img_h) as u32;
        if x1 <= x || y1 <= y {
            return None;
        }

        let cropped = page.crop_imm(x, y, x1 - x, y1 - y);
        debug!(
            "裁剪第 {} 页: {}x{} px",
            page_index + 1,
            cropped.width(),
            cropped.height()
        );
        Some(cropped)
    }
}

/// 裁剪结果的像素面积。
pub fn pixel_area(img: &DynamicImage) -> u64 {
    img.width() as u64 * img.height() as u64
}

fn run_command_quiet(cmd: &mut Command) -> bool {
    cmd.stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn run_pdftoppm_page(pdf: &Path, page: usize, dpi: u32, out_prefix: &Path) -> bool {
    let page_arg = page.to_string();
    let dpi_arg = dpi.to_string();
    let ok = run_command_quiet(
        Command::new("pdftoppm")
            .arg("-png")
            .arg("-singlefile")
            .args(["-f", page_arg.as_str(), "-l", page_arg.as_str()])
            .args(["-r", dpi_arg.as_str()])
            .arg(pdf)
            .arg(out_prefix),
    );
    ok && out_prefix.with_extension("png").exists()
}

fn run_mutool_page(pdf: &Path, page: usize, dpi: u32, out_path: &Path) -> bool {
    let dpi_arg = dpi.to_string();
    let ok = run_command_quiet(
        Command::new("mutool")
            .arg("draw")
            .args(["-r", dpi_arg.as_str()])
            .arg("-o")
            .arg(out_path)
            .arg(pdf)
            .arg(page.to_string()),
    );
    ok && out_path.exists()
}

fn output_big_enough(path: &Path, min_bytes: u64) -> bool {
    std::fs::metadata(path)
        .map(|m| m.len() > min_bytes)
        .unwrap_or(false)
}

/// 把单页矢量 PDF 栅格化成 PNG（源码包路径用）。
/// 依次尝试 pdftoppm（高 DPI、裁剪框）、mutool、sips。
pub fn rasterize_vector_pdf(source: &Path, output: &Path) -> bool {
    let prefix = output.with_extension("");
    let dpi_arg = SOURCE_VECTOR_DPI.to_string();
    let ok = run_command_quiet(
        Command::new("pdftoppm")
            .arg("-png")
            .arg("-singlefile")
            .args(["-f", "1", "-l", "1"])
            .arg("-cropbox")
            .args(["-r", dpi_arg.as_str()])
            .arg(source)
            .arg(&prefix),
    );
    if ok && output.exists() && output_big_enough(output, 4096) {
        return true;
    }

    if run_mutool_page(source, 1, SOURCE_VECTOR_DPI, output) && output_big_enough(output, 4096) {
        if vector_output_usable(output) {
            return true;
        }
    }

    let ok = run_command_quiet(
        Command::new("sips")
            .args(["-s", "format", "png"])
            .arg(source)
            .arg("--out")
            .arg(output),
    );
    ok && output.exists() && output_big_enough(output, 1024)
}

/// 渲染出的矢量图至少要有最小可读尺寸。
fn vector_output_usable(path: &Path) -> bool {
    match image::image_dimensions(path) {
        Ok((w, h)) => w >= MIN_VECTOR_PIXELS.0 && h >= MIN_VECTOR_PIXELS.1,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_scale_maps_to_dpi() {
        let renderer_dpi = (72.0 * RENDER_SCALE).round() as u32;
        assert_eq!(renderer_dpi, 158);
    }

    #[test]
    fn pixel_area_multiplies_dimensions() {
        let img = DynamicImage::new_rgb8(640, 480);
        assert_eq!(pixel_area(&img), 307_200);
        assert!(pixel_area(&img) >= MIN_RENDER_PIXELS);
    }
}
