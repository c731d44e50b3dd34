//! Small PDFs built in memory for tests.

use lopdf::{Document, Object, Stream, dictionary};

/// Options for [`build_pdf`].
#[derive(Default)]
pub struct PdfSpec<'a> {
    /// Text for each page. An empty string gives a page with no text.
    pub pages: Vec<&'a str>,
    /// Put a full-page image on every page.
    pub scanned: bool,
    /// Add an AcroForm with one field.
    pub form: bool,
    /// Make every page its own `/Parent`.
    pub parent_cycle: bool,
}

/// A PDF with one line of text per page.
pub fn text_pdf(pages: &[&str]) -> Vec<u8> {
    build_pdf(PdfSpec {
        pages: pages.to_vec(),
        ..PdfSpec::default()
    })
}

/// A PDF whose pages only contain an image, like a scan.
pub fn scanned_pdf(page_count: usize) -> Vec<u8> {
    build_pdf(PdfSpec {
        pages: vec![""; page_count],
        scanned: true,
        ..PdfSpec::default()
    })
}

/// Build a PDF.
pub fn build_pdf(spec: PdfSpec<'_>) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 8,
            "Height" => 8,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        vec![128u8; 64],
    ));

    let mut kids: Vec<Object> = vec![];
    for text in &spec.pages {
        let mut content = String::new();
        if spec.scanned {
            content.push_str("q 612 0 0 792 0 0 cm /Im1 Do Q ");
        }
        if !text.is_empty() {
            content.push_str(&format!("BT /F1 12 Tf 72 700 Td ({text}) Tj ET"));
        }
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let mut resources = dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        };
        if spec.scanned {
            resources.set("XObject", dictionary! { "Im1" => image_id });
        }
        let page_id = doc.new_object_id();
        let parent_id = if spec.parent_cycle { page_id } else { pages_id };
        doc.objects.insert(
            page_id,
            Object::Dictionary(dictionary! {
                "Type" => "Page",
                "Parent" => parent_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Contents" => content_id,
                "Resources" => resources,
            }),
        );
        kids.push(page_id.into());
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );

    let mut catalog = dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    };
    if spec.form {
        let field_id = doc.add_object(dictionary! {
            "FT" => "Tx",
            "T" => Object::string_literal("name"),
        });
        catalog.set(
            "AcroForm",
            dictionary! { "Fields" => vec![Object::from(field_id)] },
        );
    }
    let catalog_id = doc.add_object(catalog);
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).expect("in-memory PDF should save");
    buf
}
