//! 嵌入图片流提取（级联的最后一级）。
//!
//! 不做任何几何推断，直接把文档里的 Image XObject 流解码落盘。
//! 页面树先建立 对象→页码 的索引，输出按页码排序，位置号即发现序。

use anyhow::Result;
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::HashMap;
use std::io::Read as IoRead;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{estimate_embedded_relevance, ImageInfo};

/// 小于该边长的图当作图标/项目符号跳过。
const MIN_DIMENSION: u32 = 10;
/// 小于该字节数的流跳过。
const MIN_STREAM_BYTES: usize = 2048;

/// 提取文档内全部嵌入图片，写入 `images_dir`，文件名带 `paper_key` 前缀。
pub fn extract_embedded_images(
    doc: &Document,
    paper_key: &str,
    images_dir: &Path,
) -> Result<Vec<ImageInfo>> {
    std::fs::create_dir_all(images_dir)?;

    let page_index = build_page_index(doc);
    let mut entries: Vec<(usize, ObjectId)> = Vec::new();
    for (&object_id, object) in doc.objects.iter() {
        let Ok(stream) = object.as_stream() else {
            continue;
        };
        let subtype = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|s| s.as_name().ok());
        if !matches!(subtype, Some(name) if name == b"Image") {
            continue;
        }
        let page = page_index.get(&object_id).copied().unwrap_or(0);
        entries.push((page, object_id));
    }
    entries.sort();
    info!("文档内发现 {} 个 Image 对象", entries.len());

    let mut images: Vec<ImageInfo> = Vec::new();
    let mut seq: u32 = 0;

    for (page, object_id) in entries {
        let Ok(object) = doc.get_object(object_id) else {
            continue;
        };
        let Ok(stream) = object.as_stream() else {
            continue;
        };

        let width = dict_i64(&stream.dict, b"Width").unwrap_or(0) as u32;
        let height = dict_i64(&stream.dict, b"Height").unwrap_or(0) as u32;
        if width < MIN_DIMENSION || height < MIN_DIMENSION {
            debug!("跳过小图 {}x{} (obj {:?})", width, height, object_id);
            continue;
        }

        let saved = match filter_name(&stream.dict).as_deref() {
            Some("DCTDecode") => {
                let data = stream
                    .decompressed_content()
                    .unwrap_or_else(|_| stream.content.clone());
                save_raw(&data, images_dir, paper_key, seq, "jpg")
            }
            Some("JPXDecode") => {
                let data = stream
                    .decompressed_content()
                    .unwrap_or_else(|_| stream.content.clone());
                save_raw(&data, images_dir, paper_key, seq, "jp2")
            }
            Some("FlateDecode") => {
                let data = match stream.decompressed_content() {
                    Ok(d) => d,
                    Err(_) => match manual_inflate(&stream.content) {
                        Ok(d) => d,
                        Err(e) => {
                            warn!("FlateDecode 解压失败 (obj {:?}): {}", object_id, e);
                            continue;
                        }
                    },
                };
                save_pixel_data(doc, &stream.dict, &data, width, height, images_dir, paper_key, seq)
            }
            Some(other) => {
                debug!("不支持的编码 {} (obj {:?})", other, object_id);
                None
            }
            None => {
                save_pixel_data(
                    doc,
                    &stream.dict,
                    &stream.content,
                    width,
                    height,
                    images_dir,
                    paper_key,
                    seq,
                )
            }
        };

        let Some((filename, byte_len)) = saved else {
            continue;
        };
        if byte_len < MIN_STREAM_BYTES {
            let _ = std::fs::remove_file(&filename);
            continue;
        }

        seq += 1;
        images.push(ImageInfo {
            url: filename,
            caption: format!("Figure {} (page {})", seq, page.max(1)),
            position: seq,
            relevance_score: estimate_embedded_relevance(
                page.saturating_sub(1),
                seq as usize - 1,
                byte_len,
            ),
            is_selected: false,
        });
    }

    info!("嵌入图片提取完成，共 {} 张", images.len());
    Ok(images)
}

/// 建立 图片对象 → 页码(1 基) 的索引：沿每页资源的 XObject 表，
/// Form 递归两层。
fn build_page_index(doc: &Document) -> HashMap<ObjectId, usize> {
    let mut index: HashMap<ObjectId, usize> = HashMap::new();
    for (page_num, page_id) in doc.get_pages() {
        let Ok(page_obj) = doc.get_object(page_id) else {
            continue;
        };
        let Ok(page_dict) = page_obj.as_dict() else {
            continue;
        };
        collect_xobject_refs(doc, page_dict, page_num as usize, 0, &mut index);
    }
    index
}

fn collect_xobject_refs(
    doc: &Document,
    dict: &Dictionary,
    page_num: usize,
    depth: u32,
    index: &mut HashMap<ObjectId, usize>,
) {
    if depth > 2 {
        return;
    }
    let Some(resources) = dict
        .get(b"Resources")
        .ok()
        .and_then(|r| resolve_dict(doc, r))
    else {
        return;
    };
    let Some(xobjects) = resources
        .get(b"XObject")
        .ok()
        .and_then(|x| resolve_dict(doc, x))
    else {
        return;
    };

    for (_, value) in xobjects.iter() {
        let Ok(ref_id) = value.as_reference() else {
            continue;
        };
        index.entry(ref_id).or_insert(page_num);
        // Form XObject 里还可能嵌着图片
        if let Ok(obj) = doc.get_object(ref_id) {
            if let Ok(stream) = obj.as_stream() {
                let subtype = stream
                    .dict
                    .get(b"Subtype")
                    .ok()
                    .and_then(|s| s.as_name().ok());
                if matches!(subtype, Some(name) if name == b"Form") {
                    collect_xobject_refs(doc, &stream.dict, page_num, depth + 1, index);
                }
            }
        }
    }
}

fn resolve_dict<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match object {
        Object::Reference(id) => {
            let resolved = doc.get_object(*id).ok()?;
            resolved
                .as_dict()
                .ok()
                .or_else(|| resolved.as_stream().ok().map(|s| &s.dict))
        }
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

fn dict_i64(dict: &Dictionary, key: &[u8]) -> Option<i64> {
    dict.get(key).ok().and_then(|v| v.as_i64().ok())
}

/// Filter 可能是单名或数组，数组时取真正的图像编码名。
fn filter_name(dict: &Dictionary) -> Option<String> {
    let filter = dict.get(b"Filter").ok()?;
    if let Ok(name) = filter.as_name() {
        return std::str::from_utf8(name).ok().map(String::from);
    }
    if let Ok(arr) = filter.as_array() {
        for item in arr.iter().rev() {
            if let Ok(name) = item.as_name() {
                if let Ok(name) = std::str::from_utf8(name) {
                    if matches!(name, "DCTDecode" | "JPXDecode" | "CCITTFaxDecode") {
                        return Some(name.to_string());
                    }
                }
            }
        }
        if let Some(first) = arr.first() {
            if let Ok(name) = first.as_name() {
                return std::str::from_utf8(name).ok().map(String::from);
            }
        }
    }
    None
}

fn save_raw(
    data: &[u8],
    images_dir: &Path,
    paper_key: &str,
    seq: u32,
    ext: &str,
) -> Option<(String, usize)> {
    if data.is_empty() {
        return None;
    }
    let path = images_dir.join(format!("{}_emb_{:03}.{}", paper_key, seq, ext));
    if let Err(e) = std::fs::write(&path, data) {
        warn!("写入图片失败: {}", e);
        return None;
    }
    Some((path.to_string_lossy().to_string(), data.len()))
}

#[allow(clippy::too_many_arguments)]
fn save_pixel_data(
    doc: &Document,
    dict: &Dictionary,
    data: &[u8],
    width: u32,
    height: u32,
    images_dir: &Path,
    paper_key: &str,
    seq: u32,
) -> Option<(String, usize)> {
    let bits = dict_i64(dict, b"BitsPerComponent").unwrap_or(8) as u32;

    // Indexed（调色板）色彩空间先展开成 RGB
    if let Some(rgb) = decode_indexed(dict, doc, data, width, height, bits) {
        let expected = (width * height * 3) as usize;
        if rgb.len() >= expected {
            let img = image::RgbImage::from_raw(width, height, rgb[..expected].to_vec())?;
            let path = images_dir.join(format!("{}_emb_{:03}.png", paper_key, seq));
            if image::DynamicImage::ImageRgb8(img).save(&path).is_err() {
                return None;
            }
            let len = std::fs::metadata(&path).map(|m| m.len() as usize).unwrap_or(0);
            return Some((path.to_string_lossy().to_string(), len));
        }
    }

    let channels = color_channels(dict, doc);
    let expected = (width as usize) * (height as usize) * (channels as usize) * (bits as usize) / 8;
    if data.len() < expected || expected == 0 {
        debug!(
            "图片数据长度不符: {} < {} ({}x{}, ch={}, bits={})",
            data.len(),
            expected,
            width,
            height,
            channels,
            bits
        );
        return None;
    }

    let pixels = data[..expected].to_vec();
    let img = match channels {
        1 => image::GrayImage::from_raw(width, height, pixels).map(image::DynamicImage::ImageLuma8),
        3 => image::RgbImage::from_raw(width, height, pixels).map(image::DynamicImage::ImageRgb8),
        4 => image::RgbaImage::from_raw(width, height, pixels).map(image::DynamicImage::ImageRgba8),
        _ => None,
    }?;

    let path = images_dir.join(format!("{}_emb_{:03}.png", paper_key, seq));
    if img.save(&path).is_err() {
        return None;
    }
    let len = std::fs::metadata(&path).map(|m| m.len() as usize).unwrap_or(0);
    Some((path.to_string_lossy().to_string(), len))
}

/// zlib 头和裸 deflate 两种形态都试一遍。
fn manual_inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    let mut decoder = flate2::read::ZlibDecoder::new(compressed);
    if decoder.read_to_end(&mut result).is_ok() {
        return Ok(result);
    }

    result.clear();
    let mut decoder = flate2::read::DeflateDecoder::new(compressed);
    decoder.read_to_end(&mut result)?;
    Ok(result)
}

/// Indexed 色彩空间: [/Indexed base hival lookup]，逐像素查表展开。
fn decode_indexed(
    dict: &Dictionary,
    doc: &Document,
    data: &[u8],
    width: u32,
    height: u32,
    bits: u32,
) -> Option<Vec<u8>> {
    let cs = dict.get(b"ColorSpace").ok()?;
    let arr = cs.as_array().ok()?;
    let first = arr.first()?.as_name().ok()?;
    if first != b"Indexed" {
        return None;
    }

    let hival = arr.get(2)?.as_i64().ok()? as usize;
    let base_channels = arr
        .get(1)
        .and_then(|base| base.as_name().ok())
        .map(|name| channels_from_name(std::str::from_utf8(name).unwrap_or("DeviceRGB")) as usize)
        .unwrap_or(3);

    let lookup: Vec<u8> = match arr.get(3)? {
        Object::String(bytes, _) => bytes.clone(),
        Object::Stream(stream) => stream
            .decompressed_content()
            .unwrap_or_else(|_| stream.content.clone()),
        Object::Reference(id) => match doc.get_object(*id).ok()? {
            Object::String(bytes, _) => bytes.clone(),
            Object::Stream(stream) => stream
                .decompressed_content()
                .unwrap_or_else(|_| stream.content.clone()),
            _ => return None,
        },
        _ => return None,
    };

    if lookup.len() < (hival + 1) * base_channels {
        return None;
    }

    let bytes_per_row = ((width * bits + 7) / 8) as usize;
    if data.len() < bytes_per_row * height as usize {
        return None;
    }

    let pixel_count = (width * height) as usize;
    let mut rgb = Vec::with_capacity(pixel_count * base_channels);
    for i in 0..pixel_count {
        let idx = (*data.get(i)? as usize).min(hival);
        let offset = idx * base_channels;
        rgb.extend_from_slice(&lookup[offset..offset + base_channels]);
    }
    Some(rgb)
}

fn color_channels(dict: &Dictionary, doc: &Document) -> u32 {
    let Ok(cs) = dict.get(b"ColorSpace") else {
        return 3;
    };

    if let Ok(name) = cs.as_name() {
        return channels_from_name(std::str::from_utf8(name).unwrap_or(""));
    }

    if let Ok(arr) = cs.as_array() {
        if let Some(first) = arr.first() {
            if let Ok(name) = first.as_name() {
                let name = std::str::from_utf8(name).unwrap_or("");
                return match name {
                    "ICCBased" => icc_channels(arr.get(1), doc).unwrap_or(3),
                    "Indexed" | "CalRGB" | "Lab" => 3,
                    "CalGray" => 1,
                    "DeviceN" => arr
                        .get(1)
                        .and_then(|names| names.as_array().ok())
                        .map(|names| names.len() as u32)
                        .unwrap_or(3),
                    _ => channels_from_name(name),
                };
            }
        }
    }

    if let Ok(id) = cs.as_reference() {
        if let Ok(resolved) = doc.get_object(id) {
            if let Ok(name) = resolved.as_name() {
                return channels_from_name(std::str::from_utf8(name).unwrap_or(""));
            }
        }
    }
    3
}

fn icc_channels(obj: Option<&Object>, doc: &Document) -> Option<u32> {
    let id = obj?.as_reference().ok()?;
    let stream = doc.get_object(id).ok()?.as_stream().ok()?;
    let n = stream.dict.get(b"N").ok()?.as_i64().ok()?;
    Some(n as u32)
}

fn channels_from_name(name: &str) -> u32 {
    match name {
        "DeviceGray" | "CalGray" | "G" => 1,
        "DeviceRGB" | "CalRGB" | "RGB" => 3,
        "DeviceCMYK" | "CMYK" => 4,
        _ => 3,
    }
}
