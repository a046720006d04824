//! PDF and office document capabilities. qpdf handles encryption, LibreOffice
//! handles format conversion, and text watermarks are drawn with lopdf.

mod office;
mod pdf;
mod stamp;

pub use office::{ConvertToPptHandler, FileToPdfHandler, Office, FILE_PDF_EXTENSIONS, PPT_SOURCE_EXTENSIONS};
pub use pdf::{PdfToWordHandler, ProtectPdfHandler, UnlockPdfHandler};
pub use stamp::{stamp_pdf, StampSettings, WatermarkPdfHandler, STAMP_EXTENSIONS};

pub const PDF_EXTENSIONS: &[&str] = &["pdf"];
