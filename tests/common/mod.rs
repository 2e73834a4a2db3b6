//! Shared fakes for the integration tests.
//!
//! `FakeRenderer` stands in for PDFium: a "PDF" is the text
//! `%PDF-FAKE <pages>` and page N renders as a solid colour from
//! [`PALETTE`], so the authored output can be checked page by page.

#![allow(dead_code)]

use image::{DynamicImage, Rgb, RgbImage};
use pdf_sanitizer::dom::ElementId;
use pdf_sanitizer::pipeline::assemble::{LopdfAuthor, PdfAuthor};
use pdf_sanitizer::pipeline::render::{LibraryHandles, RenderService, RenderedDocument};
use pdf_sanitizer::{
    CandidateFile, Dom, ProgressHandle, ProgressPresenter, SanitizeError, Sanitizer, SanitizerConfig,
    SettingsSource, PDF_MEDIA_TYPE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PALETTE: [[u8; 3]; 5] = [
    [220, 30, 30],
    [30, 200, 30],
    [30, 30, 220],
    [230, 230, 30],
    [30, 220, 220],
];

const PAGE_SIDE: f32 = 24.0;

/// A fake document with `pages` pages.
pub fn fake_pdf(name: &str, pages: usize) -> CandidateFile {
    CandidateFile::new(name, PDF_MEDIA_TYPE, format!("%PDF-FAKE {pages}").into_bytes())
}

#[derive(Debug, Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub renders: AtomicUsize,
    /// Documents open right now, and the most ever open at once.
    pub open_now: AtomicUsize,
    pub peak_open: AtomicUsize,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }
}

pub struct FakeRenderer {
    pub counters: Arc<Counters>,
    pub fail_on_page: Option<usize>,
    pub page_delay: Duration,
}

impl FakeRenderer {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            fail_on_page: None,
            page_delay: Duration::ZERO,
        }
    }
}

struct FakeDocument<'a> {
    renderer: &'a FakeRenderer,
    pages: usize,
}

impl RenderService for FakeRenderer {
    fn open<'a>(&'a self, bytes: &'a [u8]) -> Result<Box<dyn RenderedDocument + 'a>, SanitizeError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let pages = std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.strip_prefix("%PDF-FAKE "))
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(|| SanitizeError::CorruptPdf {
                name: String::new(),
                detail: "not a fake document".into(),
            })?;
        let now = self.counters.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_open.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(FakeDocument { renderer: self, pages }))
    }
}

impl Drop for FakeDocument<'_> {
    fn drop(&mut self) {
        self.renderer.counters.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RenderedDocument for FakeDocument<'_> {
    fn page_count(&self) -> usize {
        self.pages
    }

    fn render_page(&self, page: usize, scale: f32) -> Result<DynamicImage, SanitizeError> {
        self.renderer.counters.renders.fetch_add(1, Ordering::SeqCst);
        if !self.renderer.page_delay.is_zero() {
            std::thread::sleep(self.renderer.page_delay);
        }
        if self.renderer.fail_on_page == Some(page) {
            return Err(SanitizeError::RasterisationFailed {
                page,
                detail: "injected failure".into(),
            });
        }
        let side = (PAGE_SIDE * scale).round() as u32;
        let colour = PALETTE[(page - 1) % PALETTE.len()];
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(side, side, Rgb(colour))))
    }
}

pub fn handles(renderer: FakeRenderer) -> Arc<LibraryHandles> {
    Arc::new(LibraryHandles::with_services(
        Arc::new(renderer),
        Arc::new(LopdfAuthor) as Arc<dyn PdfAuthor>,
    ))
}

/// Everything a presenter was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Shown {
    Show(String),
    Update(String, Option<u8>),
    Hide,
}

#[derive(Default)]
pub struct RecordingPresenter {
    pub events: Mutex<Vec<Shown>>,
}

impl RecordingPresenter {
    pub fn events(&self) -> Vec<Shown> {
        self.events.lock().unwrap().clone()
    }

    pub fn percentages(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Shown::Update(_, p) => p,
                _ => None,
            })
            .collect()
    }
}

impl ProgressPresenter for RecordingPresenter {
    fn show(&self, input: ElementId, message: &str) -> Option<ProgressHandle> {
        self.events.lock().unwrap().push(Shown::Show(message.to_string()));
        Some(ProgressHandle::detached(input))
    }

    fn update(&self, _handle: &ProgressHandle, message: &str, percent: Option<u8>) {
        self.events
            .lock()
            .unwrap()
            .push(Shown::Update(message.to_string(), percent));
    }

    fn hide(&self, _handle: &ProgressHandle) {
        self.events.lock().unwrap().push(Shown::Hide);
    }
}

/// Test harness: one coordinator over a fresh document.
pub struct Harness {
    pub sanitizer: Arc<Sanitizer>,
    pub counters: Arc<Counters>,
    pub presenter: Arc<RecordingPresenter>,
}

impl Harness {
    pub fn new(config: SanitizerConfig) -> Self {
        Self::with_renderer(config, |r| r)
    }

    pub fn with_renderer(config: SanitizerConfig, tweak: impl FnOnce(FakeRenderer) -> FakeRenderer) -> Self {
        let counters = Arc::new(Counters::default());
        let presenter = Arc::new(RecordingPresenter::default());
        let sanitizer = Sanitizer::builder()
            .dom(Dom::new())
            .settings(SettingsSource::from_config(config))
            .handles(handles(tweak(FakeRenderer::new(Arc::clone(&counters)))))
            .presenter(Arc::clone(&presenter) as Arc<dyn ProgressPresenter>)
            .build();
        Self {
            sanitizer,
            counters,
            presenter,
        }
    }

    pub fn dom(&self) -> &Dom {
        self.sanitizer.dom()
    }

    /// A file input attached under `<body>`.
    pub fn input(&self, name: &str, marked: bool) -> ElementId {
        let dom = self.dom();
        let input = dom.create_file_input(name, marked);
        dom.append_child(dom.body(), input);
        input
    }
}

/// Centre-pixel colour of each page image in an authored document.
pub fn page_colours(pdf: &[u8]) -> Vec<[u8; 3]> {
    let doc = lopdf::Document::load_mem(pdf).expect("output should parse");
    doc.get_pages()
        .values()
        .map(|page_id| {
            let page = doc.get_dictionary(*page_id).unwrap();
            let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
            let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
            let image_id = xobjects.get(b"Im0").unwrap().as_reference().unwrap();
            let stream = doc.get_object(image_id).unwrap().as_stream().unwrap();
            let img = image::load_from_memory(&stream.content).unwrap().to_rgb8();
            let px = img.get_pixel(img.width() / 2, img.height() / 2);
            px.0
        })
        .collect()
}

/// Per-channel distance within `tolerance` (JPEG is lossy).
pub fn close_to(actual: [u8; 3], expected: [u8; 3], tolerance: u8) -> bool {
    actual
        .iter()
        .zip(expected.iter())
        .all(|(a, e)| a.abs_diff(*e) <= tolerance)
}

/// Poll `cond` every 10 ms for up to two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
