//! The document record that flows through every stage of the pipeline.
//!
//! A [`Document`] is persisted as one JSONL record per stage. Its raw PDF
//! content lives in [`Media`] entries, either inline (base64 in JSON) or as a
//! pointer to a file, optionally restricted to a byte range.

use std::{borrow::Cow, fmt, io::SeekFrom};

use schemars::JsonSchema;
use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncSeekExt as _},
};

use crate::{async_utils::io::JsonObject, inference::InferenceOutput, prelude::*};

/// Well-known metadata keys.
pub mod keys {
    /// Where the document came from.
    pub const SOURCE: &str = "source";
    /// The route label chosen by the router.
    pub const PROCESSING_ROUTE: &str = "processing_route";
    /// The classifier's OCR probability.
    pub const OCR_PROB: &str = "ocr_prob";
    /// Page count, as seen by the classifier.
    pub const NUM_PAGES: &str = "num_pages";
    /// Does the PDF contain an interactive form?
    pub const IS_FORM: &str = "is_form";
    /// Failure marker written when a document could not be classified.
    pub const CLASSIFICATION_ERROR: &str = "classification_error";
    /// Failure marker written when extraction failed or timed out.
    pub const EXTRACTION_ERROR: &str = "extraction_error";
    /// Name of the backend that produced `text`.
    pub const EXTRACTOR: &str = "extractor";
    /// Pages that were not sent to OCR because of `max_pages`.
    pub const TRUNCATED_PAGES: &str = "truncated_pages";
}

/// What kind of payload a [`Media`] entry holds.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// A whole document, normally a PDF.
    Document,
    /// A single image.
    Image,
}

/// A binary blob attached to a document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Media {
    /// The ID of this blob. Usually the same as the document ID.
    pub id: String,

    /// What kind of data this is.
    #[serde(rename = "type")]
    pub media_type: MediaType,

    /// Inline bytes, stored as base64 in JSON.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    #[schemars(with = "Option<String>")]
    pub media_bytes: Option<Vec<u8>>,

    /// Where the bytes came from, or where to read them. `file://` URLs and
    /// plain paths are supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Start of the byte range within `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,

    /// Length of the byte range within `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl Media {
    /// A PDF held in memory.
    #[cfg(test)]
    pub fn inline_pdf(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            media_type: MediaType::Document,
            media_bytes: Some(bytes),
            url: None,
            offset: None,
            length: None,
        }
    }

    /// A PDF stored on disk, read lazily.
    pub fn pdf_file(id: impl Into<String>, path: &Path) -> Self {
        Self {
            id: id.into(),
            media_type: MediaType::Document,
            media_bytes: None,
            url: Some(format!("file://{}", path.display())),
            offset: None,
            length: None,
        }
    }

    /// Load our bytes, either from memory or from `url`.
    pub async fn load_bytes(&self) -> Result<Cow<'_, [u8]>> {
        if let Some(bytes) = &self.media_bytes {
            return Ok(Cow::Borrowed(bytes.as_slice()));
        }
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("media {:?} has neither bytes nor a URL", self.id))?;
        let path = local_path_for_url(url)?;
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("failed to open {:?}", path))?;
        let mut data = vec![];
        match (self.offset, self.length) {
            (None, None) => {
                file.read_to_end(&mut data)
                    .await
                    .with_context(|| format!("failed to read {:?}", path))?;
            }
            (offset, length) => {
                file.seek(SeekFrom::Start(offset.unwrap_or(0)))
                    .await
                    .with_context(|| format!("failed to seek in {:?}", path))?;
                match length {
                    Some(length) => {
                        data.resize(usize::try_from(length)?, 0);
                        file.read_exact(&mut data).await.with_context(|| {
                            format!("failed to read {} bytes from {:?}", length, path)
                        })?;
                    }
                    None => {
                        file.read_to_end(&mut data)
                            .await
                            .with_context(|| format!("failed to read {:?}", path))?;
                    }
                }
            }
        }
        Ok(Cow::Owned(data))
    }
}

/// Convert a `file://` URL or a bare path into a local path.
fn local_path_for_url(url: &str) -> Result<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        Ok(PathBuf::from(path))
    } else if url.contains("://") {
        Err(anyhow!("unsupported URL scheme in {:?}", url))
    } else {
        Ok(PathBuf::from(url))
    }
}

/// A metadata key that a step tried to overwrite with a different value.
#[derive(Debug)]
pub struct MetadataConflict {
    /// The conflicting key.
    pub key: String,
    /// The value already present.
    pub existing: Value,
    /// The value we refused to write.
    pub rejected: Value,
}

impl fmt::Display for MetadataConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "refusing to overwrite metadata key {:?} ({} -> {})",
            self.key, self.existing, self.rejected
        )
    }
}

impl std::error::Error for MetadataConflict {}

/// A document flowing through the pipeline.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct Document {
    /// Unique within a run, and stable across stages.
    pub id: String,

    /// Extracted text. Empty until an extraction stage runs.
    #[serde(default)]
    pub text: String,

    /// Arbitrary metadata, including routing decisions and failure markers.
    #[serde(default)]
    pub metadata: JsonObject,

    /// Attached blobs. The first [`MediaType::Document`] entry is the
    /// document's raw content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<Media>,

    /// Raw inference responses, handed from the inference dispatcher to its
    /// post-processing steps. Never persisted.
    #[serde(skip)]
    pub inference: Option<InferenceOutput>,
}

impl Document {
    /// Create an empty document.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: String::new(),
            metadata: JsonObject::new(),
            media: vec![],
            inference: None,
        }
    }

    /// Create a document holding an in-memory PDF.
    #[cfg(test)]
    pub fn from_pdf_bytes(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        let id = id.into();
        let mut doc = Self::new(id.clone());
        doc.media.push(Media::inline_pdf(id, bytes));
        doc
    }

    /// Create a document pointing at a PDF on disk. The ID is the file stem.
    pub fn from_pdf_path(path: &Path) -> Result<Self> {
        let id = path
            .file_stem()
            .with_context(|| format!("no file name in {:?}", path))?
            .to_string_lossy()
            .into_owned();
        let mut doc = Self::new(id.clone());
        doc.media.push(Media::pdf_file(id, path));
        doc.metadata.insert(
            keys::SOURCE.to_owned(),
            Value::String(path.display().to_string()),
        );
        Ok(doc)
    }

    /// The media entry holding our raw content.
    pub fn content_media(&self) -> Result<&Media> {
        self.media
            .iter()
            .find(|m| m.media_type == MediaType::Document)
            .ok_or_else(|| anyhow!("document {:?} has no content", self.id))
    }

    /// Load our raw content.
    pub async fn load_content(&self) -> Result<Cow<'_, [u8]>> {
        self.content_media()?.load_bytes().await
    }

    /// Make sure our content is held inline, so it can be embedded in output.
    pub async fn inline_content(&mut self) -> Result<()> {
        let bytes = match self.content_media()? {
            media if media.media_bytes.is_some() => return Ok(()),
            media => media.load_bytes().await?.into_owned(),
        };
        if let Some(media) = self
            .media
            .iter_mut()
            .find(|m| m.media_type == MediaType::Document)
        {
            media.media_bytes = Some(bytes);
        }
        Ok(())
    }

    /// Get a metadata value as a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Insert a metadata value, failing if a different value is already
    /// present under `key`. Writing the same value twice is allowed.
    pub fn insert_metadata(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), MetadataConflict> {
        let key = key.into();
        match self.metadata.get(&key) {
            Some(existing) if *existing != value => Err(MetadataConflict {
                key,
                existing: existing.clone(),
                rejected: value,
            }),
            _ => {
                self.metadata.insert(key, value);
                Ok(())
            }
        }
    }

    /// Overwrite a metadata value on purpose, returning the old value.
    pub fn replace_metadata(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Option<Value> {
        self.metadata.insert(key.into(), value)
    }

    /// Merge metadata produced by a backend. Conflicting keys keep their
    /// original values and are logged.
    pub fn merge_metadata(&mut self, metadata: JsonObject) {
        for (key, value) in metadata {
            if let Err(conflict) = self.insert_metadata(key, value) {
                warn!(id = %self.id, "{}", conflict);
            }
        }
    }

    /// Convert to a JSON record, dropping inline media bytes unless asked to
    /// keep them.
    pub fn to_record(&self, save_media_bytes: bool) -> Result<Value> {
        let mut value = serde_json::to_value(self)
            .with_context(|| format!("failed to serialize document {:?}", self.id))?;
        if !save_media_bytes {
            if let Some(media) = value.get_mut("media").and_then(|m| m.as_array_mut()) {
                for entry in media {
                    if let Some(entry) = entry.as_object_mut() {
                        entry.remove("media_bytes");
                    }
                }
            }
        }
        Ok(value)
    }
}

/// Serialize `Option<Vec<u8>>` as base64.
mod base64_bytes {
    use base64::{Engine as _, prelude::BASE64_STANDARD};
    use serde::{Deserialize as _, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&BASE64_STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| BASE64_STANDARD.decode(s.as_bytes()).map_err(D::Error::custom))
            .transpose()
    }
}
