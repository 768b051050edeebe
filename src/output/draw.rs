// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测框绘制

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detection::{ClassCatalog, Detection};

const BRIGHT_COLORS: [(u8, u8, u8); 11] = [
    (255, 0, 0),     // 红色
    (0, 255, 0),     // 绿色
    (0, 0, 255),     // 蓝色
    (255, 255, 0),   // 黄色
    (255, 0, 255),   // 品红
    (0, 255, 255),   // 青色
    (255, 128, 0),   // 橙色
    (255, 0, 128),   // 粉红
    (128, 255, 0),   // 黄绿
    (0, 128, 255),   // 天蓝
    (255, 255, 255), // 白色
];

/// 每个类别一种颜色, 按类别表顺序
pub fn color_palette(catalog: &ClassCatalog) -> Vec<Rgb<u8>> {
    (0..catalog.len())
        .map(|i| {
            let (r, g, b) = BRIGHT_COLORS[i % BRIGHT_COLORS.len()];
            Rgb([r, g, b])
        })
        .collect()
}

/// 复制一份图片并画上检测框 (线宽 2)
pub fn annotate(image: &RgbImage, detections: &[Detection], catalog: &ClassCatalog) -> RgbImage {
    let mut canvas = image.clone();
    let palette = color_palette(catalog);
    for d in detections {
        let bbox = d.bbox();
        let (w, h) = (bbox.width().round() as u32, bbox.height().round() as u32);
        if w == 0 || h == 0 {
            continue;
        }
        let color = catalog
            .iter()
            .position(|e| e.name == d.label())
            .and_then(|i| palette.get(i).copied())
            .unwrap_or(Rgb([255, 255, 255]));

        let (x, y) = (bbox.xmin().round() as i32, bbox.ymin().round() as i32);
        draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(w, h), color);
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(&mut canvas, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), color);
        }
    }
    canvas
}
