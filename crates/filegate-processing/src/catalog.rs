//! The built-in capability catalog.
//!
//! Which capabilities exist depends on the enabled features; which binaries
//! they run comes from [`ToolPaths`].

use std::sync::Arc;

use filegate_core::{CapabilityGroup, InputPolicy, OptionSchema, ToolPaths};
use serde_json::Value;

use crate::capability::CapabilityDescriptor;
use crate::registry::{CapabilityRegistry, RegistryError};
#[allow(unused_imports)]
use crate::tools::ExternalTool;

const ZIP: &str = "zip";

/// `base` plus the archive extension.
#[allow(dead_code)]
fn with_zip(base: &[&'static str]) -> Vec<&'static str> {
    base.iter().copied().chain([ZIP]).collect()
}

/// Builds the registry for this build. Any registration error is a
/// programming mistake and aborts startup.
#[allow(unused_variables, unused_mut)]
pub fn default_registry(tools: &ToolPaths) -> Result<CapabilityRegistry, RegistryError> {
    let mut registry = CapabilityRegistry::new();

    #[cfg(feature = "image")]
    register_image(&mut registry, tools)?;
    #[cfg(feature = "video")]
    register_video(&mut registry, tools)?;
    #[cfg(feature = "audio")]
    register_audio(&mut registry, tools)?;
    #[cfg(feature = "document")]
    register_documents(&mut registry, tools)?;
    #[cfg(feature = "image")]
    registry.register(
        CapabilityDescriptor::new(
            "compress",
            CapabilityGroup::Conversion,
            Arc::new(crate::compress::CompressHandler::new(ExternalTool::new("gs", &tools.gs))),
        )
        .accepts(crate::compress::COMPRESS_EXTENSIONS)
        .options(OptionSchema::new().with("option", "medium")),
    )?;

    tracing::info!(capabilities = registry.len(), "Capability registry ready");
    Ok(registry)
}

#[cfg(feature = "image")]
fn register_image(registry: &mut CapabilityRegistry, tools: &ToolPaths) -> Result<(), RegistryError> {
    use crate::image::codec::OutputFormat;
    use crate::image::{
        CompressImageHandler, ConvertImageHandler, RemoveBackgroundHandler, UpscaleImageHandler,
        IMAGE_EXTENSIONS,
    };
    use crate::media_watermark::WatermarkMediaHandler;
    use crate::mime::VIDEO_EXTENSIONS;

    let images = with_zip(IMAGE_EXTENSIONS);

    registry.register(
        CapabilityDescriptor::new("img-compress", CapabilityGroup::Image, Arc::new(CompressImageHandler))
            .accepts(&images)
            .options(OptionSchema::new().with("quality", 85)),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "img-jpg",
            CapabilityGroup::Image,
            Arc::new(ConvertImageHandler::new(OutputFormat::Jpeg)),
        )
        .accepts(&images)
        .options(OptionSchema::new().with("quality", 85).with("format", "jpg")),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "img-png",
            CapabilityGroup::Image,
            Arc::new(ConvertImageHandler::new(OutputFormat::Png)),
        )
        .accepts(&images),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "img-webp",
            CapabilityGroup::Image,
            Arc::new(ConvertImageHandler::new(OutputFormat::WebP)),
        )
        .accepts(&images)
        .options(OptionSchema::new().with("quality", 80)),
    )?;
    registry.register(
        CapabilityDescriptor::new("upscale", CapabilityGroup::Image, Arc::new(UpscaleImageHandler))
            .accepts(["jpg", "jpeg", "png", "webp", "bmp", "tiff", ZIP])
            .options(OptionSchema::new().with("scale", 2)),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "remove-imgbg",
            CapabilityGroup::Image,
            Arc::new(RemoveBackgroundHandler::new(ExternalTool::new("rembg", &tools.rembg))),
        )
        .accepts(with_zip(RemoveBackgroundHandler::EXTENSIONS)),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "watermark-imgvideo",
            CapabilityGroup::Image,
            Arc::new(WatermarkMediaHandler::new(ExternalTool::new("ffmpeg", &tools.ffmpeg))),
        )
        .accepts(&images)
        .accepts(VIDEO_EXTENSIONS)
        .options(
            OptionSchema::new()
                .with("type", "text")
                .with("text", "SAMPLE")
                .with("font_size", 48)
                .with("position", "middle-center")
                .with("transparency", 50)
                .with("rotation", 0)
                .with("bold", false),
        ),
    )?;
    Ok(())
}

#[cfg(feature = "video")]
fn register_video(registry: &mut CapabilityRegistry, tools: &ToolPaths) -> Result<(), RegistryError> {
    use crate::download::URL_LIST_EXTENSIONS;
    use crate::mime::VIDEO_EXTENSIONS;
    use crate::video::{DownloadVideoHandler, VideoUpscaleHandler};

    registry.register(
        CapabilityDescriptor::new(
            "video-upscale",
            CapabilityGroup::Video,
            Arc::new(VideoUpscaleHandler::new(
                ExternalTool::new("ffmpeg", &tools.ffmpeg),
                ExternalTool::new("ffprobe", &tools.ffprobe),
            )),
        )
        .accepts(with_zip(VIDEO_EXTENSIONS))
        .options(OptionSchema::new().with("scale", "2x").with("crf", 18)),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "download-video-batch",
            CapabilityGroup::Video,
            Arc::new(DownloadVideoHandler::new(
                ExternalTool::new("yt-dlp", &tools.ytdlp),
                ExternalTool::new("ffmpeg", &tools.ffmpeg),
            )),
        )
        .accepts(URL_LIST_EXTENSIONS)
        .options(OptionSchema::new().with("url", Value::Null))
        .input(InputPolicy::Optional),
    )?;
    Ok(())
}

#[cfg(feature = "audio")]
fn register_audio(registry: &mut CapabilityRegistry, tools: &ToolPaths) -> Result<(), RegistryError> {
    use crate::audio::DownloadAudioHandler;
    use crate::download::URL_LIST_EXTENSIONS;
    use crate::mime::VIDEO_EXTENSIONS;

    registry.register(
        CapabilityDescriptor::new(
            "download-audio-batch",
            CapabilityGroup::Audio,
            Arc::new(DownloadAudioHandler::new(
                ExternalTool::new("yt-dlp", &tools.ytdlp),
                ExternalTool::new("ffmpeg", &tools.ffmpeg),
            )),
        )
        .accepts(URL_LIST_EXTENSIONS)
        .accepts(with_zip(VIDEO_EXTENSIONS))
        .options(OptionSchema::new().with("url", Value::Null).with("format", "mp3"))
        .input(InputPolicy::Optional),
    )?;
    Ok(())
}

#[cfg(feature = "document")]
fn register_documents(registry: &mut CapabilityRegistry, tools: &ToolPaths) -> Result<(), RegistryError> {
    use crate::document::{
        ConvertToPptHandler, FileToPdfHandler, PdfToWordHandler, ProtectPdfHandler, UnlockPdfHandler,
        WatermarkPdfHandler, FILE_PDF_EXTENSIONS, PDF_EXTENSIONS, PPT_SOURCE_EXTENSIONS,
        STAMP_EXTENSIONS,
    };

    let qpdf = ExternalTool::new("qpdf", &tools.qpdf);
    let soffice = ExternalTool::new("soffice", &tools.soffice);
    let pdfs = with_zip(PDF_EXTENSIONS);

    registry.register(
        CapabilityDescriptor::new("protect-pdf", CapabilityGroup::Pdf, Arc::new(ProtectPdfHandler::new(qpdf.clone())))
            .accepts(&pdfs)
            .options(OptionSchema::new().with("password", Value::Null)),
    )?;
    registry.register(
        CapabilityDescriptor::new("unlock-pdf", CapabilityGroup::Pdf, Arc::new(UnlockPdfHandler::new(qpdf)))
            .accepts(&pdfs)
            .options(OptionSchema::new().with("password", Value::Null)),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "pdf-to-word",
            CapabilityGroup::Pdf,
            Arc::new(PdfToWordHandler::new(soffice.clone())),
        )
        .accepts(&pdfs),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "watermark-files",
            CapabilityGroup::Pdf,
            Arc::new(WatermarkPdfHandler::new(soffice.clone())),
        )
        .accepts(with_zip(STAMP_EXTENSIONS))
        .options(
            OptionSchema::new()
                .with("text", "CONFIDENTIAL")
                .with("font_size", 48)
                .with("opacity", 0.3)
                .with("rotation", 45)
                .with("position", "middle-center"),
        ),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "file-pdf",
            CapabilityGroup::Conversion,
            Arc::new(FileToPdfHandler::new(soffice.clone())),
        )
        .accepts(with_zip(FILE_PDF_EXTENSIONS)),
    )?;
    registry.register(
        CapabilityDescriptor::new(
            "convert-all-to-ppt",
            CapabilityGroup::Conversion,
            Arc::new(ConvertToPptHandler::new(soffice)),
        )
        .accepts(with_zip(PPT_SOURCE_EXTENSIONS)),
    )?;
    Ok(())
}
