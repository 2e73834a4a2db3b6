//! Output document authoring: a brand-new PDF holding one JPEG per page.
//!
//! Nothing from the source document is copied. Each page is a single image
//! XObject drawn to fill a MediaBox sized to the image, so the result has no
//! fonts, scripts, annotations, forms or embedded files by construction.

use crate::error::SanitizeError;
use crate::pipeline::encode::EncodedPage;
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

/// Pixels → millimetres at 96 DPI.
pub const PX_TO_MM: f32 = 0.264583;
/// Millimetres → PDF points.
pub const MM_TO_PT: f32 = 72.0 / 25.4;

/// Physical page size in points for an image of `width_px` × `height_px`.
pub fn page_size_points(width_px: u32, height_px: u32) -> (f32, f32) {
    (
        width_px as f32 * PX_TO_MM * MM_TO_PT,
        height_px as f32 * PX_TO_MM * MM_TO_PT,
    )
}

/// Creates empty output documents.
pub trait PdfAuthor: Send + Sync {
    fn create(&self) -> Box<dyn AuthoredDocument>;
}

/// A document under construction.
pub trait AuthoredDocument: Send {
    /// Append a page showing `page` edge to edge.
    fn add_page(&mut self, page: &EncodedPage) -> Result<(), SanitizeError>;

    fn page_count(&self) -> usize;

    /// Serialise to PDF bytes.
    fn save(self: Box<Self>) -> Result<Vec<u8>, SanitizeError>;
}

/// Authoring service backed by `lopdf`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LopdfAuthor;

impl PdfAuthor for LopdfAuthor {
    fn create(&self) -> Box<dyn AuthoredDocument> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Box::new(LopdfDocument {
            doc,
            pages_id,
            kids: Vec::new(),
        })
    }
}

struct LopdfDocument {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
}

impl AuthoredDocument for LopdfDocument {
    fn add_page(&mut self, page: &EncodedPage) -> Result<(), SanitizeError> {
        let (w, h) = page_size_points(page.width_px, page.height_px);

        let image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => Object::Integer(page.width_px as i64),
                "Height" => Object::Integer(page.height_px as i64),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => Object::Integer(8),
                "Filter" => "DCTDecode",
            },
            page.jpeg.clone(),
        )
        // Already JPEG; deflating it again only costs time.
        .with_compression(false);
        let image_id = self.doc.add_object(image);

        let content = format!("q {w:.4} 0 0 {h:.4} 0 0 cm /Im0 Do Q");
        let content_id = self
            .doc
            .add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(self.pages_id),
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(w),
                Object::Real(h),
            ],
            "Contents" => Object::Reference(content_id),
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => Object::Reference(image_id) },
            },
        });
        self.kids.push(Object::Reference(page_id));
        Ok(())
    }

    fn page_count(&self) -> usize {
        self.kids.len()
    }

    fn save(self: Box<Self>) -> Result<Vec<u8>, SanitizeError> {
        let LopdfDocument {
            mut doc,
            pages_id,
            kids,
        } = *self;

        if kids.is_empty() {
            return Err(SanitizeError::AuthoringFailed("document has no pages".into()));
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => Object::Integer(count),
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));
        doc.compress();

        let mut buf = Vec::new();
        doc.save_to(&mut buf)
            .map_err(|e| SanitizeError::AuthoringFailed(e.to_string()))?;
        Ok(buf)
    }
}
