//! Watermark settings shared by the image and video watermarking paths.

use std::path::Path;

use filegate_core::Options;

/// Distance from the edge for non-centered placements, in pixels.
pub const EDGE_MARGIN: i64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizontal {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vertical {
    Top,
    Middle,
    Bottom,
}

/// Watermark position, parsed from names like `top-left` or `middle-center`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub horizontal: Horizontal,
    pub vertical: Vertical,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            horizontal: Horizontal::Center,
            vertical: Vertical::Middle,
        }
    }
}

impl Position {
    /// Lenient parse: any of `left`/`center`/`right` and `top`/`middle`/`bottom`
    /// may appear in any order. Missing parts default to the center.
    pub fn parse(s: &str) -> Self {
        let s = s.to_lowercase();
        let horizontal = if s.contains("left") {
            Horizontal::Left
        } else if s.contains("right") {
            Horizontal::Right
        } else {
            Horizontal::Center
        };
        let vertical = if s.contains("top") {
            Vertical::Top
        } else if s.contains("bottom") || s.contains("lower") {
            Vertical::Bottom
        } else {
            Vertical::Middle
        };
        Self {
            horizontal,
            vertical,
        }
    }

    /// Top-left corner of `content` placed inside `container`.
    pub fn coords(&self, container: (u32, u32), content: (u32, u32)) -> (i64, i64) {
        let (cw, ch) = (container.0 as i64, container.1 as i64);
        let (w, h) = (content.0 as i64, content.1 as i64);
        let x = match self.horizontal {
            Horizontal::Left => EDGE_MARGIN,
            Horizontal::Center => (cw - w) / 2,
            Horizontal::Right => cw - w - EDGE_MARGIN,
        };
        let y = match self.vertical {
            Vertical::Top => EDGE_MARGIN,
            Vertical::Middle => (ch - h) / 2,
            Vertical::Bottom => ch - h - EDGE_MARGIN,
        };
        (x.max(0), y.max(0))
    }

    /// ffmpeg position expressions in terms of the container (`outer_w`,
    /// `outer_h`) and content (`inner_w`, `inner_h`) variable names.
    pub fn ffmpeg_expr(&self, outer: (&str, &str), inner: (&str, &str)) -> (String, String) {
        let x = match self.horizontal {
            Horizontal::Left => EDGE_MARGIN.to_string(),
            Horizontal::Center => format!("({}-{})/2", outer.0, inner.0),
            Horizontal::Right => format!("{}-{}-{}", outer.0, inner.0, EDGE_MARGIN),
        };
        let y = match self.vertical {
            Vertical::Top => EDGE_MARGIN.to_string(),
            Vertical::Middle => format!("({}-{})/2", outer.1, inner.1),
            Vertical::Bottom => format!("{}-{}-{}", outer.1, inner.1, EDGE_MARGIN),
        };
        (x, y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkSettings {
    pub kind: WatermarkKind,
    pub text: String,
    pub font_size: u32,
    pub bold: bool,
    pub position: Position,
    /// 0.0 (invisible) to 1.0 (opaque).
    pub opacity: f32,
    /// Degrees, counter-clockwise.
    pub rotation: f32,
}

impl WatermarkSettings {
    /// Reads the `watermark-imgvideo` options. `transparency` is the
    /// percentage of the watermark that stays visible.
    pub fn from_options(options: &Options) -> Result<Self, String> {
        let kind = match options.get_keyword("type").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("text") => WatermarkKind::Text,
            Some("image") => WatermarkKind::Image,
            Some(other) => return Err(format!("Unknown watermark type '{}'", other)),
        };
        let text = options.get_str("text").unwrap_or_else(|| "SAMPLE".to_string());
        if kind == WatermarkKind::Text && text.trim().is_empty() {
            return Err("Watermark text must not be empty".to_string());
        }
        let transparency = options.get_f32("transparency").unwrap_or(50.0).clamp(0.0, 100.0);

        Ok(Self {
            kind,
            text,
            font_size: options.get_u32("font_size").unwrap_or(48).clamp(8, 512),
            bold: options.get_bool("bold").unwrap_or(false),
            position: Position::parse(&options.get_keyword("position").unwrap_or_default()),
            opacity: transparency / 100.0,
            rotation: options.get_f32("rotation").unwrap_or(0.0),
        })
    }

    /// ffmpeg `drawtext` filter reading the text from `text_file`, so the
    /// text itself never needs filtergraph escaping.
    pub fn drawtext_filter(&self, text_file: &Path) -> String {
        let (x, y) = self.position.ffmpeg_expr(("w", "h"), ("text_w", "text_h"));
        let font = if self.bold { "Sans\\:style=Bold" } else { "Sans" };
        format!(
            "drawtext=textfile='{}':font='{}':fontsize={}:fontcolor=white@{:.2}:borderw=2:bordercolor=black@{:.2}:x={}:y={}",
            escape_filter_path(text_file),
            font,
            self.font_size,
            self.opacity,
            self.opacity,
            x,
            y
        )
    }
}

fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace(':', "\\:")
}
