//! Upload-path interception.
//!
//! The host routes its uploads through a [`HostTransport`] instead of a bare
//! HTTP client. Once an [`UploadInterceptor`] is registered on it, every
//! outgoing request that looks like an upload has its PDF form entries
//! swapped for sanitised copies before the inner transport sees it.
//!
//! Both request surfaces share one async contract:
//!
//! ```text
//!   transport.send(request)           ──┐
//!                                       ├──▶ substitute ──▶ inner.send
//!   transport.request()                 │
//!       .open("POST", url)              │
//!       .send(body)                   ──┘
//! ```
//!
//! Substitution is fail-open. If it panics, the original request goes out
//! unchanged.

use crate::config::{SanitizerConfig, MARKER_ATTRIBUTE};
use crate::coordinator::Sanitizer;
use crate::dom::ElementId;
use crate::error::SanitizeError;
use crate::file::CandidateFile;
use crate::guard;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

// ── Request model ────────────────────────────────────────────────────────

/// One multipart form value.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    File(CandidateFile),
}

/// Ordered multipart form. Repeated names are allowed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartForm {
    entries: Vec<(String, FormValue)>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.append(name, FormValue::Text(value.into()));
        self
    }

    pub fn file(mut self, name: impl Into<String>, file: CandidateFile) -> Self {
        self.append(name, FormValue::File(file));
        self
    }

    pub fn append(&mut self, name: impl Into<String>, value: FormValue) {
        self.entries.push((name.into(), value));
    }

    pub fn entries(&self) -> &[(String, FormValue)] {
        &self.entries
    }

    /// Every file entry, in form order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &CandidateFile)> {
        self.entries.iter().filter_map(|(name, value)| match value {
            FormValue::File(f) => Some((name.as_str(), f)),
            FormValue::Text(_) => None,
        })
    }

    pub fn has_pdf(&self) -> bool {
        self.files().any(|(_, f)| guard::is_pdf(f))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Multipart(MultipartForm),
}

/// An outgoing request as the host hands it to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl UploadRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn multipart(self, form: MultipartForm) -> Self {
        self.body(RequestBody::Multipart(form))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests somewhere.
pub trait Transport: Send + Sync {
    fn send(&self, request: UploadRequest) -> BoxFuture<'_, Result<TransportResponse, SanitizeError>>;
}

// ── Interceptor ──────────────────────────────────────────────────────────

/// Rewrites upload requests so PDFs from marked inputs go out sanitised.
#[derive(Debug, Clone)]
pub struct UploadInterceptor {
    sanitizer: Arc<Sanitizer>,
}

impl UploadInterceptor {
    pub fn new(sanitizer: Arc<Sanitizer>) -> Self {
        Self { sanitizer }
    }

    /// Endpoint substring match, or any multipart body at all.
    pub fn is_upload_request(request: &UploadRequest, config: &SanitizerConfig) -> bool {
        config
            .upload_endpoints
            .iter()
            .any(|endpoint| !endpoint.is_empty() && request.url.contains(endpoint.as_str()))
            || matches!(request.body, RequestBody::Multipart(_))
    }

    /// The input a form field most likely came from: a file input with the
    /// same `name`, else the first marked file input.
    pub fn input_for_field(&self, field: &str) -> Option<ElementId> {
        let dom = self.sanitizer.dom();
        let root = dom.document_element();
        dom.query_first(root, |el| el.is_file_input() && el.attribute("name") == Some(field))
            .or_else(|| {
                dom.query_first(root, |el| {
                    el.is_file_input() && el.attribute(MARKER_ATTRIBUTE) == Some("true")
                })
            })
    }

    /// Return `request` with every eligible PDF entry replaced.
    pub async fn substitute(&self, request: UploadRequest) -> UploadRequest {
        let config = self.sanitizer.settings().resolve();
        if !config.enabled || !Self::is_upload_request(&request, &config) {
            return request;
        }
        let form = match &request.body {
            RequestBody::Multipart(form) if form.has_pdf() => form,
            _ => return request,
        };

        match AssertUnwindSafe(self.substitute_form(form)).catch_unwind().await {
            Ok(Some(rebuilt)) => UploadRequest {
                body: RequestBody::Multipart(rebuilt),
                ..request
            },
            Ok(None) => request,
            Err(_) => {
                warn!(url = %request.url, "Upload substitution panicked; sending original request");
                request
            }
        }
    }

    /// `None` when no entry was eligible.
    async fn substitute_form(&self, form: &MultipartForm) -> Option<MultipartForm> {
        let targets: Vec<Option<ElementId>> = form
            .entries()
            .iter()
            .map(|(name, value)| match value {
                FormValue::File(file) if guard::is_pdf(file) => {
                    let input = self
                        .input_for_field(name)
                        .filter(|input| self.sanitizer.is_marked(*input));
                    if input.is_none() {
                        debug!(field = name.as_str(), "PDF entry has no marked input; left as is");
                    }
                    input
                }
                _ => None,
            })
            .collect();
        if targets.iter().all(Option::is_none) {
            return None;
        }

        let entries = join_all(form.entries().iter().zip(targets).map(|((name, value), input)| async move {
            match (value, input) {
                (FormValue::File(file), Some(input)) => (
                    name.clone(),
                    FormValue::File(self.sanitizer.sanitize_one(file, Some(input)).await),
                ),
                _ => (name.clone(), value.clone()),
            }
        }))
        .await;

        Some(MultipartForm { entries })
    }
}

// ── Host transport ───────────────────────────────────────────────────────

/// The hook point hosts route uploads through.
pub struct HostTransport<T> {
    inner: T,
    interceptor: OnceLock<UploadInterceptor>,
}

impl<T: Transport> HostTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            interceptor: OnceLock::new(),
        }
    }

    /// Install the interceptor. Only the first registration takes effect;
    /// later calls return `false` and change nothing.
    pub fn register_interceptor(&self, sanitizer: Arc<Sanitizer>) -> bool {
        let installed = self.interceptor.set(UploadInterceptor::new(sanitizer)).is_ok();
        if installed {
            debug!("Upload interceptor registered");
        }
        installed
    }

    pub fn is_intercepting(&self) -> bool {
        self.interceptor.get().is_some()
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Start a request object; call [`RequestObject::open`] before sending.
    pub fn request(&self) -> RequestObject<'_, T> {
        RequestObject {
            transport: self,
            target: None,
            headers: Vec::new(),
        }
    }

    async fn dispatch(&self, request: UploadRequest) -> Result<TransportResponse, SanitizeError> {
        let request = match self.interceptor.get() {
            Some(interceptor) => interceptor.substitute(request).await,
            None => request,
        };
        self.inner.send(request).await
    }
}

impl<T: Transport> Transport for HostTransport<T> {
    fn send(&self, request: UploadRequest) -> BoxFuture<'_, Result<TransportResponse, SanitizeError>> {
        self.dispatch(request).boxed()
    }
}

/// Open-then-send request surface.
pub struct RequestObject<'a, T> {
    transport: &'a HostTransport<T>,
    target: Option<(String, String)>,
    headers: Vec<(String, String)>,
}

impl<T: Transport> RequestObject<'_, T> {
    /// Record the method and target URL.
    pub fn open(&mut self, method: impl Into<String>, url: impl Into<String>) -> &mut Self {
        self.target = Some((method.into(), url.into()));
        self
    }

    pub fn set_request_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Substitute (awaiting any conversion) and send.
    pub async fn send(self, body: RequestBody) -> Result<TransportResponse, SanitizeError> {
        let (method, url) = self
            .target
            .ok_or_else(|| SanitizeError::Transport("request sent before open".into()))?;
        let request = UploadRequest {
            method,
            url,
            headers: self.headers,
            body,
        };
        self.transport.dispatch(request).await
    }
}

// ── reqwest transport ────────────────────────────────────────────────────

/// [`Transport`] over a `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn execute(&self, request: UploadRequest) -> Result<TransportResponse, SanitizeError> {
        let transport_err = |e: reqwest::Error| SanitizeError::Transport(e.to_string());

        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| SanitizeError::Transport(format!("invalid method {:?}: {}", request.method, e)))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Multipart(form) => {
                let mut multipart = reqwest::multipart::Form::new();
                for (name, value) in form.entries {
                    multipart = match value {
                        FormValue::Text(text) => multipart.text(name, text),
                        FormValue::File(file) => {
                            let part = reqwest::multipart::Part::bytes(file.bytes().to_vec())
                                .file_name(file.name().to_string());
                            let part = if file.media_type().is_empty() {
                                part
                            } else {
                                part.mime_str(file.media_type()).map_err(transport_err)?
                            };
                            multipart.part(name, part)
                        }
                    };
                }
                builder.multipart(multipart)
            }
        };

        let response = builder.send().await.map_err(transport_err)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(transport_err)?.to_vec();
        debug!(status, bytes = body.len(), "Upload response received");
        Ok(TransportResponse { status, body })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: UploadRequest) -> BoxFuture<'_, Result<TransportResponse, SanitizeError>> {
        self.execute(request).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsSource;
    use crate::file::PDF_MEDIA_TYPE;
    use crate::pipeline::assemble::{LopdfAuthor, PdfAuthor};
    use crate::pipeline::render::{LibraryHandles, RenderService};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<UploadRequest>>,
    }

    impl Transport for Recording {
        fn send(&self, request: UploadRequest) -> BoxFuture<'_, Result<TransportResponse, SanitizeError>> {
            self.sent.lock().unwrap().push(request);
            futures::future::ready(Ok(TransportResponse {
                status: 200,
                body: Vec::new(),
            }))
            .boxed()
        }
    }

    fn sanitizer(loads: Arc<AtomicUsize>) -> Arc<Sanitizer> {
        let handles = LibraryHandles::with_loaders(
            Arc::new(move |_: &str| -> Result<Arc<dyn RenderService>, SanitizeError> {
                loads.fetch_add(1, Ordering::SeqCst);
                Err(SanitizeError::LibraryLoad {
                    service: "rendering".into(),
                    detail: "unavailable".into(),
                })
            }),
            Arc::new(|| -> Result<Arc<dyn PdfAuthor>, SanitizeError> { Ok(Arc::new(LopdfAuthor)) }),
        );
        Sanitizer::builder()
            .settings(SettingsSource::new())
            .handles(Arc::new(handles))
            .build()
    }

    fn pdf() -> CandidateFile {
        CandidateFile::new("a.pdf", PDF_MEDIA_TYPE, b"%PDF-1.4".to_vec())
    }

    #[test]
    fn test_upload_detection() {
        let cfg = SanitizerConfig::default();
        assert!(UploadInterceptor::is_upload_request(
            &UploadRequest::new("POST", "https://app.test/livewire/upload-file?expires=1"),
            &cfg
        ));
        assert!(UploadInterceptor::is_upload_request(
            &UploadRequest::new("POST", "https://app.test/other").multipart(MultipartForm::new()),
            &cfg
        ));
        assert!(!UploadInterceptor::is_upload_request(
            &UploadRequest::new("POST", "https://app.test/api").body(RequestBody::Bytes(vec![1])),
            &cfg
        ));
    }

    #[test]
    fn test_field_lookup_prefers_name_then_marker() {
        let s = sanitizer(Arc::new(AtomicUsize::new(0)));
        let dom = s.dom();
        let plain = dom.create_file_input("avatar", false);
        let marked = dom.create_file_input("docs", true);
        dom.append_child(dom.body(), plain);
        dom.append_child(dom.body(), marked);

        let interceptor = UploadInterceptor::new(Arc::clone(&s));
        assert_eq!(interceptor.input_for_field("avatar"), Some(plain));
        assert_eq!(interceptor.input_for_field("files[]"), Some(marked));
    }

    #[tokio::test]
    async fn test_unmarked_input_is_never_rasterised() {
        let loads = Arc::new(AtomicUsize::new(0));
        let s = sanitizer(Arc::clone(&loads));
        let dom = s.dom();
        let input = dom.create_file_input("doc", false);
        dom.append_child(dom.body(), input);

        let transport = HostTransport::new(Recording::default());
        assert!(transport.register_interceptor(Arc::clone(&s)));

        let file = pdf();
        let request = UploadRequest::new("POST", "/livewire/upload-file")
            .multipart(MultipartForm::new().file("doc", file.clone()));
        transport.send(request.clone()).await.unwrap();

        let sent = transport.inner().sent.lock().unwrap();
        assert_eq!(sent[0], request);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_upload_passes_through() {
        let s = sanitizer(Arc::new(AtomicUsize::new(0)));
        let transport = HostTransport::new(Recording::default());
        transport.register_interceptor(s);

        let request = UploadRequest::new("GET", "/api/users").header("Accept", "application/json");
        transport.send(request.clone()).await.unwrap();
        assert_eq!(transport.inner().sent.lock().unwrap()[0], request);
    }

    #[tokio::test]
    async fn test_second_registration_is_ignored() {
        let transport = HostTransport::new(Recording::default());
        assert!(!transport.is_intercepting());
        assert!(transport.register_interceptor(sanitizer(Arc::new(AtomicUsize::new(0)))));
        assert!(!transport.register_interceptor(sanitizer(Arc::new(AtomicUsize::new(0)))));
        assert!(transport.is_intercepting());
    }

    #[tokio::test]
    async fn test_request_object_requires_open() {
        let transport = HostTransport::new(Recording::default());
        let err = transport.request().send(RequestBody::Empty).await.unwrap_err();
        assert!(matches!(err, SanitizeError::Transport(_)));

        let mut req = transport.request();
        req.open("POST", "/upload").set_request_header("X-Test", "1");
        req.send(RequestBody::Bytes(b"x".to_vec())).await.unwrap();
        let sent = transport.inner().sent.lock().unwrap();
        assert_eq!(sent[0].url, "/upload");
        assert_eq!(sent[0].headers, vec![("X-Test".to_string(), "1".to_string())]);
    }
}
