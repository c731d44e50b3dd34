//! Cheap structural features of a PDF, computed without rendering.

use lopdf::{Dictionary, Document as PdfDocument, Object, ObjectId};
use schemars::JsonSchema;

use super::UnclassifiableDocumentError;
use crate::{pdf::load_pdf, prelude::*};

/// Never look at more than this many objects while walking the page tree.
const MAX_PARENT_DEPTH: usize = 32;

/// Features used to score a PDF. All of these are derived from at most
/// `max_pages_sampled` pages, except for `num_pages`.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PdfFeatures {
    /// Total number of pages in the document.
    pub num_pages: usize,
    /// Does the document have interactive form fields?
    pub is_form: bool,
    /// Is the document encrypted?
    pub is_encrypted: bool,
    /// How many pages we actually looked at.
    pub sampled_pages: usize,
    /// Mean non-whitespace characters per sampled page.
    pub chars_per_page: f64,
    /// Share of sampled pages with no extractable text.
    pub textless_page_ratio: f64,
    /// Share of extracted characters which look like decoding garbage.
    pub garbled_char_ratio: f64,
    /// Mean image XObjects per sampled page.
    pub images_per_page: f64,
    /// Mean fonts per sampled page.
    pub fonts_per_page: f64,
}

impl PdfFeatures {
    /// Names accepted by [`PdfFeatures::get`].
    pub const NAMES: &[&str] = &[
        "log_chars_per_page",
        "textless_page_ratio",
        "garbled_char_ratio",
        "images_per_page",
        "fonts_per_page",
        "is_form",
        "is_encrypted",
        "log_num_pages",
    ];

    /// Look up a model input by name.
    pub fn get(&self, name: &str) -> Option<f64> {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        Some(match name {
            "log_chars_per_page" => self.chars_per_page.ln_1p(),
            "textless_page_ratio" => self.textless_page_ratio,
            "garbled_char_ratio" => self.garbled_char_ratio,
            "images_per_page" => self.images_per_page.min(5.0),
            "fonts_per_page" => self.fonts_per_page.min(10.0),
            "is_form" => flag(self.is_form),
            "is_encrypted" => flag(self.is_encrypted),
            "log_num_pages" => (self.num_pages as f64).ln_1p(),
            _ => return None,
        })
    }

    /// Parse `bytes` and compute features. This runs `lopdf` on untrusted
    /// input, so call it from
    /// [`run_isolated`](crate::async_utils::isolated::run_isolated).
    pub fn from_pdf_bytes(
        bytes: &[u8],
        max_pages_sampled: usize,
    ) -> Result<Self, UnclassifiableDocumentError> {
        let pdf = load_pdf(bytes)
            .map_err(|err| UnclassifiableDocumentError::new(format!("{err:#}")))?;
        let pages = pdf.get_pages();
        if pages.is_empty() {
            return Err(UnclassifiableDocumentError::new("PDF has no pages"));
        }

        let is_encrypted = pdf.trailer.get(b"Encrypt").is_ok();
        let mut features = PdfFeatures {
            num_pages: pages.len(),
            is_form: has_form_fields(&pdf),
            is_encrypted,
            ..PdfFeatures::default()
        };

        let mut total_chars = 0usize;
        let mut garbled_chars = 0usize;
        let mut textless_pages = 0usize;
        let mut images = 0usize;
        let mut fonts = 0usize;
        for (&page_number, &page_id) in pages.iter().take(max_pages_sampled.max(1)) {
            features.sampled_pages += 1;

            // Text from encrypted documents is unreliable, so treat it as
            // missing.
            let text = if is_encrypted {
                String::new()
            } else {
                match pdf.extract_text(&[page_number]) {
                    Ok(text) => text,
                    Err(err) => {
                        trace!(page_number, "cannot extract text: {err}");
                        String::new()
                    }
                }
            };
            let mut page_chars = 0;
            for c in text.chars().filter(|c| !c.is_whitespace()) {
                page_chars += 1;
                if is_garbled(c) {
                    garbled_chars += 1;
                }
            }
            if page_chars == 0 {
                textless_pages += 1;
            }
            total_chars += page_chars;

            if let Some(resources) = page_resources(&pdf, page_id) {
                images += count_images(&pdf, resources);
                fonts += resolve_dict(&pdf, resources.get(b"Font").ok())
                    .map(|fonts| fonts.len())
                    .unwrap_or(0);
            }
        }

        let sampled = features.sampled_pages as f64;
        features.chars_per_page = total_chars as f64 / sampled;
        features.textless_page_ratio = textless_pages as f64 / sampled;
        features.garbled_char_ratio = if total_chars == 0 {
            0.0
        } else {
            garbled_chars as f64 / total_chars as f64
        };
        features.images_per_page = images as f64 / sampled;
        features.fonts_per_page = fonts as f64 / sampled;
        Ok(features)
    }
}

/// Characters that usually mean a font had no usable encoding.
fn is_garbled(c: char) -> bool {
    c == char::REPLACEMENT_CHARACTER
        || c.is_control()
        || ('\u{E000}'..='\u{F8FF}').contains(&c)
}

/// Follow a reference, if needed.
fn resolve<'a>(pdf: &'a PdfDocument, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => pdf.get_object(*id).ok(),
        other => Some(other),
    }
}

/// Follow a reference to a dictionary, if needed.
fn resolve_dict<'a>(pdf: &'a PdfDocument, obj: Option<&'a Object>) -> Option<&'a Dictionary> {
    resolve(pdf, obj?)?.as_dict().ok()
}

/// Find a page's resources, which may be inherited from the page tree.
fn page_resources(pdf: &PdfDocument, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = pdf.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_PARENT_DEPTH {
        if let Some(resources) = resolve_dict(pdf, node.get(b"Resources").ok()) {
            return Some(resources);
        }
        node = resolve_dict(pdf, node.get(b"Parent").ok())?;
    }
    None
}

/// Count image XObjects in a resource dictionary.
fn count_images(pdf: &PdfDocument, resources: &Dictionary) -> usize {
    let Some(xobjects) = resolve_dict(pdf, resources.get(b"XObject").ok()) else {
        return 0;
    };
    xobjects
        .iter()
        .filter_map(|(_, obj)| resolve(pdf, obj))
        .filter(|obj| match obj {
            Object::Stream(stream) => matches!(
                stream.dict.get(b"Subtype"),
                Ok(Object::Name(name)) if name == b"Image"
            ),
            _ => false,
        })
        .count()
}

/// Does the catalog have a non-empty `/AcroForm /Fields` array?
fn has_form_fields(pdf: &PdfDocument) -> bool {
    let fields = resolve_dict(pdf, pdf.trailer.get(b"Root").ok())
        .and_then(|root| resolve_dict(pdf, root.get(b"AcroForm").ok()))
        .and_then(|form| form.get(b"Fields").ok())
        .and_then(|fields| resolve(pdf, fields))
        .and_then(|fields| fields.as_array().ok());
    matches!(fields, Some(fields) if !fields.is_empty())
}
