use std::path::PathBuf;

use bytes::Bytes;

/// One uploaded file as received from the client. Owned by the dispatcher for
/// the duration of a single request.
#[derive(Debug, Clone)]
pub struct UploadedArtifact {
    /// Multipart field the file arrived in (`file`, `image_file`, ...).
    pub field: String,
    /// Filename exactly as the client sent it. Never used on disk.
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl UploadedArtifact {
    pub fn new(field: impl Into<String>, file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A file written into a request-scoped staging directory. It lives exactly as
/// long as that directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub field: String,
    /// Absolute path inside the staging directory.
    pub path: PathBuf,
    /// Sanitized filename (the final path component of `path`).
    pub file_name: String,
    /// Lower-case extension without the dot; empty if there is none.
    pub extension: String,
    pub size: u64,
}

impl StagedFile {
    /// Filename without its extension, used to derive output names.
    pub fn stem(&self) -> &str {
        if self.extension.is_empty() {
            &self.file_name
        } else {
            let cut = self.file_name.len() - self.extension.len() - 1;
            &self.file_name[..cut]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(name: &str, ext: &str) -> StagedFile {
        StagedFile {
            field: "file".to_string(),
            path: PathBuf::from("/tmp").join(name),
            file_name: name.to_string(),
            extension: ext.to_string(),
            size: 0,
        }
    }

    #[test]
    fn stem_drops_extension() {
        assert_eq!(staged("photo.JPG", "jpg").stem(), "photo");
        assert_eq!(staged("archive.tar.gz", "gz").stem(), "archive.tar");
    }

    #[test]
    fn stem_without_extension_is_whole_name() {
        assert_eq!(staged("README", "").stem(), "README");
    }
}
