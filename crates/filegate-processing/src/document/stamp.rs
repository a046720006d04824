//! `watermark-files`: a text stamp drawn over every page of a PDF.
//!
//! The page's own content is wrapped in `q`/`Q` so whatever graphics state it
//! leaves behind cannot move or recolor the stamp.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use filegate_core::ProcessingOutcome;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};

use super::office::Office;
use crate::batch::{collect_items, read_item, run_batch, run_blocking, BatchItem, ItemError, OutputFile};
use crate::tools::ExternalTool;
use crate::traits::{CapabilityHandler, HandlerJob};
use crate::watermark::{Horizontal, Position, Vertical, EDGE_MARGIN};

pub const STAMP_EXTENSIONS: &[&str] = &["pdf", "docx"];

const FONT_RESOURCE: &str = "FgStampFont";
const STATE_RESOURCE: &str = "FgStampGs";
/// US Letter, used when a page declares no MediaBox anywhere in its tree.
const DEFAULT_MEDIA_BOX: [f32; 4] = [0.0, 0.0, 612.0, 792.0];
/// Average Helvetica glyph width as a fraction of the font size.
const AVERAGE_GLYPH_WIDTH: f32 = 0.55;
const MAX_TREE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct StampSettings {
    pub text: String,
    pub font_size: f32,
    /// 0.0 to 1.0
    pub opacity: f32,
    /// Degrees, counter-clockwise.
    pub rotation: f32,
    pub position: Position,
}

impl StampSettings {
    pub fn from_options(options: &filegate_core::Options) -> Result<Self, String> {
        let text = options.get_str("text").unwrap_or_else(|| "CONFIDENTIAL".to_string());
        if text.trim().is_empty() {
            return Err("Watermark text must not be empty".to_string());
        }
        let opacity = options.get_f32("opacity").unwrap_or(0.3);
        if !(0.0..=1.0).contains(&opacity) {
            return Err("Invalid opacity. Allowed values: 0.0-1.0".to_string());
        }
        Ok(Self {
            text,
            font_size: options.get_f32("font_size").unwrap_or(48.0).clamp(4.0, 400.0),
            opacity,
            rotation: options.get_f32("rotation").unwrap_or(45.0),
            position: Position::parse(&options.get_keyword("position").unwrap_or_default()),
        })
    }

    /// Content stream for one page. Starts by closing the `q` that wraps the
    /// page's original content.
    fn content(&self, media_box: [f32; 4]) -> Vec<u8> {
        let [x0, y0, x1, y1] = media_box;
        let (width, height) = (x1 - x0, y1 - y0);
        let text_width = self.text.chars().count() as f32 * self.font_size * AVERAGE_GLYPH_WIDTH;
        let margin = EDGE_MARGIN as f32;

        // PDF space grows upwards, so `top` is measured from the upper edge.
        let x = match self.position.horizontal {
            Horizontal::Left => margin,
            Horizontal::Center => (width - text_width) / 2.0,
            Horizontal::Right => width - text_width - margin,
        };
        let y = match self.position.vertical {
            Vertical::Top => height - margin - self.font_size,
            Vertical::Middle => (height - self.font_size) / 2.0,
            Vertical::Bottom => margin,
        };
        // Rotation is about the center of the text box.
        let (cx, cy) = (x0 + x + text_width / 2.0, y0 + y + self.font_size / 2.0);
        let theta = self.rotation.to_radians();
        let (sin, cos) = (theta.sin(), theta.cos());

        let mut content = format!(
            "Q\nq\n/{gs} gs\n0.5 0.5 0.5 rg\n{cos:.4} {sin:.4} {nsin:.4} {cos:.4} {cx:.2} {cy:.2} cm\nBT\n/{font} {size:.2} Tf\n{tx:.2} {ty:.2} Td\n(",
            gs = STATE_RESOURCE,
            font = FONT_RESOURCE,
            nsin = -sin,
            size = self.font_size,
            tx = -text_width / 2.0,
            ty = -self.font_size / 2.0,
        )
        .into_bytes();
        content.extend(escape_pdf_text(&self.text));
        content.extend_from_slice(b") Tj\nET\nQ\n");
        content
    }
}

/// WinAnsi string literal body. Characters outside Latin-1 become `?`.
fn escape_pdf_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' | '(' | ')' => {
                out.push(b'\\');
                out.push(c as u8);
            }
            c if (c as u32) < 0x20 => out.push(b' '),
            c if (c as u32) <= 0xFF => out.push(c as u8),
            _ => out.push(b'?'),
        }
    }
    out
}

/// Stamps every page of the PDF in `data`.
pub fn stamp_pdf(data: &[u8], settings: &StampSettings) -> Result<Vec<u8>, ItemError> {
    let mut doc = Document::load_mem(data).map_err(|_| ItemError::Rejected("Not a valid PDF".to_string()))?;
    if doc.is_encrypted() {
        return Err(ItemError::Rejected(
            "The PDF is password protected. Unlock it first".to_string(),
        ));
    }
    let pages: Vec<ObjectId> = doc.get_pages().values().copied().collect();
    if pages.is_empty() {
        return Err(ItemError::Rejected("The PDF has no pages".to_string()));
    }

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let state_id = doc.add_object(dictionary! {
        "Type" => "ExtGState",
        "ca" => Object::Real(settings.opacity),
        "CA" => Object::Real(settings.opacity),
    });
    let open_id = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));

    for page_id in pages {
        let media_box = media_box(&doc, page_id);
        let stamp_id = doc.add_object(Stream::new(Dictionary::new(), settings.content(media_box)));
        add_resource(&mut doc, page_id, "Font", FONT_RESOURCE, font_id)?;
        add_resource(&mut doc, page_id, "ExtGState", STATE_RESOURCE, state_id)?;
        wrap_contents(&mut doc, page_id, open_id, stamp_id)?;
    }

    let mut out = Vec::new();
    doc.save_to(&mut out).context("Failed to write stamped PDF")?;
    Ok(out)
}

/// Walks from the page up its `Parent` chain for an inheritable attribute.
fn inherited(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut node = Some(page_id);
    for _ in 0..MAX_TREE_DEPTH {
        let dict = doc.get_dictionary(node?).ok()?;
        if let Ok(value) = dict.get(key) {
            return match value {
                Object::Reference(id) => doc.get_object(*id).ok().cloned(),
                other => Some(other.clone()),
            };
        }
        node = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    let Some(Object::Array(values)) = inherited(doc, page_id, b"MediaBox") else {
        return DEFAULT_MEDIA_BOX;
    };
    let numbers: Vec<f32> = values.iter().filter_map(|v| v.as_float().ok()).collect();
    match numbers.as_slice() {
        [x0, y0, x1, y1] if x1 > x0 && y1 > y0 => [*x0, *y0, *x1, *y1],
        _ => DEFAULT_MEDIA_BOX,
    }
}

#[derive(Clone, Copy)]
enum ResourcesSlot {
    Shared(ObjectId),
    Inline,
}

/// Where the page's resource dictionary lives. Inherited resources are
/// copied onto the page first, so adding to them never affects siblings
/// that do not get stamped.
fn resources_slot(doc: &mut Document, page_id: ObjectId) -> Result<ResourcesSlot> {
    let page = doc.get_dictionary(page_id)?;
    match page.get(b"Resources") {
        Ok(Object::Reference(id)) => return Ok(ResourcesSlot::Shared(*id)),
        Ok(Object::Dictionary(_)) => return Ok(ResourcesSlot::Inline),
        _ => {}
    }
    let resources = match inherited(doc, page_id, b"Resources") {
        Some(Object::Dictionary(dict)) => dict,
        _ => Dictionary::new(),
    };
    doc.get_dictionary_mut(page_id)?
        .set("Resources", Object::Dictionary(resources));
    Ok(ResourcesSlot::Inline)
}

fn resources_mut(doc: &mut Document, page_id: ObjectId, slot: ResourcesSlot) -> Result<&mut Dictionary> {
    match slot {
        ResourcesSlot::Shared(id) => Ok(doc.get_dictionary_mut(id)?),
        ResourcesSlot::Inline => Ok(doc
            .get_dictionary_mut(page_id)?
            .get_mut(b"Resources")?
            .as_dict_mut()?),
    }
}

fn add_resource(
    doc: &mut Document,
    page_id: ObjectId,
    category: &str,
    name: &str,
    target: ObjectId,
) -> Result<()> {
    let slot = resources_slot(doc, page_id)?;
    let existing = resources_mut(doc, page_id, slot)?
        .get(category.as_bytes())
        .ok()
        .cloned();
    let mut entries = match existing {
        Some(Object::Reference(id)) => doc.get_dictionary(id)?.clone(),
        Some(Object::Dictionary(dict)) => dict,
        _ => Dictionary::new(),
    };
    entries.set(name, Object::Reference(target));
    resources_mut(doc, page_id, slot)?.set(category, Object::Dictionary(entries));
    Ok(())
}

/// `Contents` becomes `[open, ...original, stamp]`.
fn wrap_contents(doc: &mut Document, page_id: ObjectId, open_id: ObjectId, stamp_id: ObjectId) -> Result<()> {
    let current = doc.get_dictionary(page_id)?.get(b"Contents").ok().cloned();
    let mut parts = vec![Object::Reference(open_id)];
    match current {
        Some(Object::Reference(id)) => match doc.get_object(id)? {
            Object::Array(items) => parts.extend(items.iter().cloned()),
            _ => parts.push(Object::Reference(id)),
        },
        Some(Object::Array(items)) => parts.extend(items),
        None => {}
        Some(other) => return Err(anyhow!("Unexpected page contents: {:?}", other.enum_variant())),
    }
    parts.push(Object::Reference(stamp_id));
    doc.get_dictionary_mut(page_id)?
        .set("Contents", Object::Array(parts));
    Ok(())
}

/// Handler for `watermark-files`. Word documents are converted to PDF first.
pub struct WatermarkPdfHandler {
    office: Office,
}

impl WatermarkPdfHandler {
    pub fn new(soffice: ExternalTool) -> Self {
        Self {
            office: Office::new(soffice),
        }
    }
}

#[async_trait]
impl CapabilityHandler for WatermarkPdfHandler {
    #[tracing::instrument(skip(self, job), fields(capability = %job.capability, inputs = job.inputs.len()))]
    async fn process(&self, job: HandlerJob) -> Result<ProcessingOutcome> {
        let settings = match StampSettings::from_options(&job.options) {
            Ok(settings) => settings,
            Err(msg) => return Ok(filegate_core::ProcessingFailure::invalid_input(msg).into()),
        };
        let profile = job.work_dir.join("office-profile");
        let items = collect_items(&job, None, STAMP_EXTENSIONS).await?;
        run_batch(&job, items, "watermarked", |item, out_dir| {
            stamp_one(&self.office, item, out_dir, settings.clone(), profile.clone())
        })
        .await
    }
}

async fn stamp_one(
    office: &Office,
    item: BatchItem,
    out_dir: PathBuf,
    settings: StampSettings,
    profile: PathBuf,
) -> Result<Vec<OutputFile>, ItemError> {
    let data = if item.extension == "docx" {
        let pdf = office.convert(&item.path, &out_dir, "pdf", None, &profile).await?;
        let data = tokio::fs::read(&pdf).await.context("Failed to read converted PDF")?;
        tokio::fs::remove_file(&pdf).await.ok();
        data
    } else {
        read_item(&item).await?
    };

    let output = OutputFile::named(&out_dir, &item.stem, "watermarked", "pdf");
    let path = output.path.clone();
    let name = item.file_name.clone();
    run_blocking(move || {
        let stamped = stamp_pdf(&data, &settings).map_err(|err| match err {
            ItemError::Rejected(msg) => ItemError::Rejected(format!("{}: {}", name, msg)),
            other => other,
        })?;
        std::fs::write(&path, stamped).map_err(anyhow::Error::from)?;
        Ok(())
    })
    .await?;

    Ok(vec![output])
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};

    fn settings() -> StampSettings {
        StampSettings {
            text: "CONFIDENTIAL".to_string(),
            font_size: 48.0,
            opacity: 0.3,
            rotation: 45.0,
            position: Position::default(),
        }
    }

    /// Two pages sharing resources inherited from the page tree.
    fn sample_pdf() -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let mut kids = Vec::new();
        for text in ["page one", "page two"] {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(Dictionary::new(), content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => 2,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
                "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    #[test]
    fn every_page_is_stamped() {
        let stamped = stamp_pdf(&sample_pdf(), &settings()).unwrap();
        let doc = Document::load_mem(&stamped).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 2);

        for page_id in pages.values() {
            let content = String::from_utf8_lossy(&doc.get_page_content(*page_id).unwrap()).into_owned();
            assert!(content.starts_with("q\n"), "{content}");
            assert!(content.contains("(CONFIDENTIAL) Tj"));
            assert!(content.contains("/FgStampGs gs"));

            let page = doc.get_dictionary(*page_id).unwrap();
            let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
            let fonts = resources.get(b"Font").unwrap().as_dict().unwrap();
            // Inherited fonts survive next to the stamp font.
            assert!(fonts.has(b"F1"));
            assert!(fonts.has(FONT_RESOURCE.as_bytes()));
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            stamp_pdf(b"not a pdf", &settings()),
            Err(ItemError::Rejected(_))
        ));
    }

    #[test]
    fn text_is_escaped() {
        assert_eq!(escape_pdf_text(r"a(b)\c"), br"a\(b\)\\c".to_vec());
        assert_eq!(escape_pdf_text("é✓"), vec![0xE9, b'?']);
    }

    #[test]
    fn centered_stamp_rotates_about_page_center() {
        let content = String::from_utf8_lossy(&settings().content([0.0, 0.0, 600.0, 800.0])).into_owned();
        assert!(content.contains("0.7071 0.7071 -0.7071 0.7071 300.00 400.00 cm"), "{content}");
    }
}
