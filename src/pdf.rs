//! Loading untrusted PDFs with `lopdf`.

use std::collections::HashSet;

use lopdf::{Document as PdfDocument, Object, ObjectId};

use crate::{async_utils::isolated::run_isolated, prelude::*};

/// Parse a PDF, rejecting page trees that `lopdf` can't walk safely. Call
/// this from [`run_isolated`], never from an async task.
pub fn load_pdf(bytes: &[u8]) -> Result<PdfDocument> {
    let pdf = PdfDocument::load_mem(bytes).context("cannot parse PDF")?;
    check_parent_links(&pdf)?;
    Ok(pdf)
}

/// `lopdf` follows each page's `/Parent` chain recursively when it looks up
/// fonts and resources, with no limit, so a cycle there recurses until the
/// stack overflows. Follow the same links it does and refuse cycles.
fn check_parent_links(pdf: &PdfDocument) -> Result<()> {
    // Nodes whose chain is known to end.
    let mut acyclic = HashSet::<ObjectId>::new();
    for page_id in pdf.page_iter() {
        let mut chain = vec![];
        let mut next = Some(page_id);
        while let Some(id) = next {
            if acyclic.contains(&id) {
                break;
            }
            if chain.contains(&id) {
                return Err(anyhow!(
                    "page tree has a /Parent cycle through object {} {}",
                    id.0,
                    id.1
                ));
            }
            chain.push(id);
            next = pdf
                .get_dictionary(id)
                .and_then(|node| node.get(b"Parent"))
                .and_then(Object::as_reference)
                .ok();
        }
        acyclic.extend(chain);
    }
    Ok(())
}

/// Count the pages in a PDF, in-process.
pub async fn count_pages(pdf: &[u8]) -> Result<usize> {
    let owned = pdf.to_vec();
    run_isolated("pdf-page-count", move || Ok(load_pdf(&owned)?.get_pages().len())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pdfs::{PdfSpec, build_pdf, text_pdf};

    #[test]
    fn loads_ordinary_pdfs() {
        let pdf = load_pdf(&text_pdf(&["one", "two"])).unwrap();
        assert_eq!(pdf.get_pages().len(), 2);
    }

    #[test]
    fn rejects_parent_cycles() {
        let bytes = build_pdf(PdfSpec {
            pages: vec!["looping"],
            parent_cycle: true,
            ..PdfSpec::default()
        });
        // lopdf itself is happy to load this.
        assert_eq!(PdfDocument::load_mem(&bytes).unwrap().get_pages().len(), 1);
        let err = load_pdf(&bytes).unwrap_err();
        assert!(err.to_string().contains("/Parent cycle"), "{err}");
    }

    #[tokio::test]
    async fn counts_pdf_pages() {
        assert_eq!(count_pages(&text_pdf(&["a", "b", "c"])).await.unwrap(), 3);
        assert!(count_pages(b"not a pdf").await.is_err());
    }
}
