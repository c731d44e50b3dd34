//! Finding the PDFs to process.

use std::{collections::HashMap, fs};

use futures::TryStreamExt as _;

use crate::{
    async_utils::io::{JsonObject, read_jsonl_or_csv},
    document::{Document, keys},
    prelude::*,
};

/// One line of a JSONL or CSV manifest.
#[derive(Clone, Debug, Deserialize)]
pub struct ManifestRecord {
    /// Document ID. Defaults to the file stem of `path`.
    #[serde(default)]
    pub id: Option<String>,

    /// Path to the PDF, relative to the manifest.
    pub path: PathBuf,

    /// Any other fields are copied into document metadata.
    #[serde(flatten)]
    pub extra: JsonObject,
}

/// Load input documents from a directory of PDFs, a single PDF, or a manifest.
/// Documents point at their files and are read lazily.
pub async fn load_input_documents(input: &Path) -> Result<Vec<Document>> {
    let documents = if input.is_dir() {
        load_pdf_dir(input)?
    } else if input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
    {
        vec![Document::from_pdf_path(input)?]
    } else {
        load_manifest(input).await?
    };
    if documents.is_empty() {
        return Err(anyhow!("no PDFs found in {}", input.display()));
    }
    check_unique_ids(&documents)?;
    info!(count = documents.len(), input = %input.display(), "loaded input documents");
    Ok(documents)
}

/// Output records and artifacts are keyed by document ID, so two inputs with
/// the same ID would clobber each other.
fn check_unique_ids(documents: &[Document]) -> Result<()> {
    let mut seen = HashMap::<&str, &Document>::with_capacity(documents.len());
    for doc in documents {
        if let Some(first) = seen.insert(&doc.id, doc) {
            return Err(anyhow!(
                "duplicate document id {:?}: {} and {}",
                doc.id,
                first.metadata_str(keys::SOURCE).unwrap_or("?"),
                doc.metadata_str(keys::SOURCE).unwrap_or("?"),
            ));
        }
    }
    Ok(())
}

/// Every `*.pdf` file directly inside `dir`, sorted by name.
fn load_pdf_dir(dir: &Path) -> Result<Vec<Document>> {
    let mut paths = vec![];
    for entry in fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        {
            paths.push(path);
        }
    }
    paths.sort();
    paths.iter().map(|path| Document::from_pdf_path(path)).collect()
}

/// Read a JSONL or CSV manifest.
async fn load_manifest(manifest: &Path) -> Result<Vec<Document>> {
    let base = manifest.parent().unwrap_or(Path::new("."));
    let records = read_jsonl_or_csv(Some(manifest))
        .await?
        .try_collect::<Vec<_>>()
        .await?;
    records
        .into_iter()
        .map(|value| {
            let record: ManifestRecord = serde_json::from_value(value)
                .with_context(|| format!("bad record in {}", manifest.display()))?;
            let path = base.join(&record.path);
            let mut doc = Document::from_pdf_path(&path)?;
            if let Some(id) = record.id {
                doc.id = id.clone();
                doc.media[0].id = id;
            }
            doc.merge_metadata(record.extra);
            Ok(doc)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pdfs::text_pdf;

    #[tokio::test]
    async fn reads_sorted_pdf_directories() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.pdf", "a.PDF", "notes.txt"] {
            fs::write(dir.path().join(name), text_pdf(&["x"])).unwrap();
        }
        let docs = load_input_documents(dir.path()).await.unwrap();
        let ids = docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(docs[0].metadata_str(keys::SOURCE).unwrap().ends_with("a.PDF"));
        assert_eq!(docs[0].load_content().await.unwrap().len(), text_pdf(&["x"]).len());
    }

    #[tokio::test]
    async fn reads_manifests_with_extra_fields() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one.pdf"), text_pdf(&["x"])).unwrap();
        let manifest = dir.path().join("input.csv");
        fs::write(&manifest, "id,path,court\ncase-1,one.pdf,9th Cir.\n").unwrap();
        let docs = load_input_documents(&manifest).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "case-1");
        assert_eq!(docs[0].metadata_str("court"), Some("9th Cir."));
        assert!(docs[0].load_content().await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.pdf", "a.PDF"] {
            fs::write(dir.path().join(name), text_pdf(&["x"])).unwrap();
        }
        let err = load_input_documents(dir.path()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate document id \"a\""), "{msg}");
        assert!(msg.contains("a.pdf") && msg.contains("a.PDF"), "{msg}");

        let manifest = dir.path().join("input.jsonl");
        fs::write(
            &manifest,
            "{\"id\": \"x\", \"path\": \"a.pdf\"}\n{\"id\": \"x\", \"path\": \"a.PDF\"}\n",
        )
        .unwrap();
        let err = load_input_documents(&manifest).await.unwrap_err();
        assert!(err.to_string().contains("duplicate document id \"x\""), "{err}");
    }

    #[tokio::test]
    async fn empty_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_input_documents(dir.path()).await.is_err());
    }
}
