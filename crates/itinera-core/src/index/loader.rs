use std::path::Path;

use tracing::debug;

use crate::error::IndexError;

/// A source document reduced to its text.
#[derive(Debug, Clone)]
pub struct Document {
    pub source: String,
    pub text: String,
}

impl Document {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }

    /// Read a text, Markdown or PDF file. The type is guessed from the
    /// extension; unknown types are read as UTF-8 text.
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let source = path.display().to_string();
        let mime = mime_guess::from_path(path).first_or_text_plain();
        debug!("Loading {source} as {mime}");

        let text = match (mime.type_().as_str(), mime.subtype().as_str()) {
            ("application", "pdf") => extract_pdf(path, &source)?,
            ("text", _) => {
                std::fs::read_to_string(path).map_err(|e| IndexError::load(&source, e))?
            }
            _ => {
                let bytes = std::fs::read(path).map_err(|e| IndexError::load(&source, e))?;
                String::from_utf8(bytes)
                    .map_err(|_| {
                        IndexError::load(&source, format!("unsupported file type {mime}"))
                    })?
            }
        };

        if text.trim().is_empty() {
            return Err(IndexError::load(&source, "no extractable text"));
        }

        Ok(Self { source, text })
    }
}

#[cfg(feature = "pdf")]
fn extract_pdf(path: &Path, source: &str) -> Result<String, IndexError> {
    pdf_extract::extract_text(path).map_err(|e| IndexError::load(source, e))
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(_path: &Path, source: &str) -> Result<String, IndexError> {
    Err(IndexError::load(
        source,
        "PDF support not compiled in (enable the `pdf` feature)",
    ))
}
