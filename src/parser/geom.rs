//! 页面几何基础类型。
//!
//! 坐标系：原点在页面左上角，y 轴向下（与 PDF 用户空间相反，
//! 各访问层负责翻转）。所有矩形运算都是无状态的自由函数，
//! 不绑定任何 PDF 库的页面/矩形类型。

use serde::{Deserialize, Serialize};

/// 轴对齐矩形，单位为 PDF 用户空间单位。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f64 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// 宽高都为正才视为有效区域。
    pub fn is_valid(&self) -> bool {
        self.x1 > self.x0 && self.y1 > self.y0
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// 垂直方向重叠长度，无重叠时为 0。
    pub fn vertical_overlap(&self, other: &Rect) -> f64 {
        (self.y1.min(other.y1) - self.y0.max(other.y0)).max(0.0)
    }

    /// 把矩形夹到另一个矩形内部。
    pub fn clamp_to(&self, bounds: &Rect) -> Rect {
        Rect {
            x0: self.x0.max(bounds.x0),
            y0: self.y0.max(bounds.y0),
            x1: self.x1.min(bounds.x1),
            y1: self.y1.min(bounds.y1),
        }
    }
}

/// 一组矩形的并集包围盒。空集合返回 None。
pub fn union_all(rects: &[Rect]) -> Option<Rect> {
    let mut iter = rects.iter();
    let first = *iter.next()?;
    Some(iter.fold(first, |acc, r| acc.union(r)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_covers_both() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 5.0, 30.0, 25.0);
        let u = a.union(&b);
        assert_eq!(u, Rect::new(0.0, 0.0, 30.0, 25.0));
    }

    #[test]
    fn vertical_overlap_disjoint_is_zero() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(0.0, 20.0, 10.0, 30.0);
        assert_eq!(a.vertical_overlap(&b), 0.0);
        let c = Rect::new(0.0, 5.0, 10.0, 15.0);
        assert_eq!(a.vertical_overlap(&c), 5.0);
    }

    #[test]
    fn union_all_empty_is_none() {
        assert!(union_all(&[]).is_none());
        let rects = [
            Rect::new(1.0, 1.0, 2.0, 2.0),
            Rect::new(0.0, 3.0, 5.0, 4.0),
        ];
        assert_eq!(union_all(&rects), Some(Rect::new(0.0, 1.0, 5.0, 4.0)));
    }

    #[test]
    fn clamp_stays_inside() {
        let r = Rect::new(-5.0, -5.0, 120.0, 50.0);
        let page = Rect::new(0.0, 0.0, 100.0, 100.0);
        let c = r.clamp_to(&page);
        assert_eq!(c, Rect::new(0.0, 0.0, 100.0, 50.0));
    }
}
