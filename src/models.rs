use bytes::Bytes;

const IMAGE_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".webp"];

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug)]
pub struct ChatRequest {
    pub prompt: String,
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Txt,
}

impl DocumentKind {
    /// Expects an already lowercased filename.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.ends_with(".pdf") {
            Some(Self::Pdf)
        } else if filename.ends_with(".docx") {
            Some(Self::Docx)
        } else if filename.ends_with(".txt") {
            Some(Self::Txt)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Document(DocumentKind),
    Unsupported,
}

impl AttachmentKind {
    pub fn classify(filename: &str) -> Self {
        if IMAGE_SUFFIXES.iter().any(|s| filename.ends_with(s)) {
            return Self::Image;
        }
        match DocumentKind::from_filename(filename) {
            Some(kind) => Self::Document(kind),
            None => Self::Unsupported,
        }
    }
}

/// Image payload handed to the model untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePart {
    pub mime_type: String,
    pub data: Bytes,
}

impl ImagePart {
    pub fn from_upload(file: &UploadedFile) -> Self {
        let mime_type = file
            .content_type
            .clone()
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| {
                mime_guess::from_path(&file.filename)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });
        Self {
            mime_type,
            data: file.bytes.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptBundle {
    pub text: String,
    pub images: Vec<ImagePart>,
}
