//! DOM observation: find file inputs and wire change-triggered sanitisation.
//!
//! Inputs present when [`DomObserver::start`] runs are handled by an
//! initial scan. Inputs inserted later arrive through an
//! [`ElementDiscovery`]: either raw subtree mutations or the host
//! framework's "patch finished" events, as selected by
//! [`DiscoveryMode`]. Each input gets exactly one capture-phase handler,
//! tracked by the `data-sanitize-attached` attribute.

use crate::config::DiscoveryMode;
use crate::coordinator::Sanitizer;
use crate::dom::{Dom, ElementId, EventPhase, MutationRecord, PatchEvent};
use crate::error::SanitizeError;
use crate::guard;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// Set on inputs that already carry the change handler.
pub const HANDLER_ATTACHED: &str = "data-sanitize-attached";

/// Per-input Sanitizing Flag.
pub const SANITIZING: &str = "data-sanitizing";

/// `<input type="file">` whose `accept` is absent or mentions PDF.
pub fn accepts_pdf(dom: &Dom, input: ElementId) -> bool {
    dom.is_file_input(input)
        && dom
            .attribute(input, "accept")
            .is_none_or(|accept| accept.to_ascii_lowercase().contains("pdf"))
}

// ── Discovery ────────────────────────────────────────────────────────────

/// Source of subtree roots that may contain new file inputs.
pub trait ElementDiscovery: Send {
    /// Next batch of roots to scan; `None` once the source is closed.
    fn next_batch(&mut self) -> BoxFuture<'_, Option<Vec<ElementId>>>;
}

/// Reacts to every node insertion.
pub struct MutationDiscovery {
    dom: Dom,
    records: BroadcastStream<MutationRecord>,
}

impl MutationDiscovery {
    pub fn new(dom: Dom) -> Self {
        let records = BroadcastStream::new(dom.subscribe_mutations());
        Self { dom, records }
    }
}

impl ElementDiscovery for MutationDiscovery {
    fn next_batch(&mut self) -> BoxFuture<'_, Option<Vec<ElementId>>> {
        async move {
            match self.records.next().await? {
                Ok(record) => Some(record.added),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "Mutation notifications dropped; rescanning document");
                    Some(vec![self.dom.document_element()])
                }
            }
        }
        .boxed()
    }
}

/// Reacts to the host framework's patch-completion events.
pub struct LifecycleDiscovery {
    dom: Dom,
    patches: BroadcastStream<PatchEvent>,
}

impl LifecycleDiscovery {
    pub fn new(dom: Dom) -> Self {
        let patches = BroadcastStream::new(dom.subscribe_patches());
        Self { dom, patches }
    }
}

impl ElementDiscovery for LifecycleDiscovery {
    fn next_batch(&mut self) -> BoxFuture<'_, Option<Vec<ElementId>>> {
        async move {
            match self.patches.next().await? {
                Ok(event) => Some(vec![event.root]),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "Patch notifications dropped; rescanning document");
                    Some(vec![self.dom.document_element()])
                }
            }
        }
        .boxed()
    }
}

/// Discovery variant for `mode`, subscribed from this point on.
pub fn discovery_for(mode: DiscoveryMode, dom: Dom) -> Box<dyn ElementDiscovery> {
    match mode {
        DiscoveryMode::Observer => Box::new(MutationDiscovery::new(dom)),
        DiscoveryMode::Lifecycle => Box::new(LifecycleDiscovery::new(dom)),
    }
}

// ── Observer ─────────────────────────────────────────────────────────────

/// Attaches sanitisation handlers to file inputs.
#[derive(Debug, Clone)]
pub struct DomObserver {
    sanitizer: Arc<Sanitizer>,
    runtime: Handle,
}

impl DomObserver {
    /// Observer spawning its work on the current Tokio runtime.
    pub fn new(sanitizer: Arc<Sanitizer>) -> Result<Self, SanitizeError> {
        let runtime = Handle::try_current()
            .map_err(|e| SanitizeError::Internal(format!("DOM observer needs a Tokio runtime: {}", e)))?;
        Ok(Self::with_runtime(sanitizer, runtime))
    }

    pub fn with_runtime(sanitizer: Arc<Sanitizer>, runtime: Handle) -> Self {
        Self { sanitizer, runtime }
    }

    pub fn sanitizer(&self) -> &Arc<Sanitizer> {
        &self.sanitizer
    }

    /// Attach to every file input under `root`. Returns how many were new.
    pub fn scan(&self, root: ElementId) -> usize {
        let dom = self.sanitizer.dom();
        dom.file_inputs(root)
            .into_iter()
            .filter(|input| self.attach(*input))
            .count()
    }

    /// Attach the change handler to `input` unless it already has one.
    pub fn attach(&self, input: ElementId) -> bool {
        let dom = self.sanitizer.dom();
        if !dom.is_file_input(input) || dom.has_attribute(input, HANDLER_ATTACHED) {
            return false;
        }
        dom.set_attribute(input, HANDLER_ATTACHED, "true");

        let sanitizer = Arc::downgrade(&self.sanitizer);
        let runtime = self.runtime.clone();
        dom.add_listener(
            input,
            EventPhase::Capture,
            Arc::new(move |dom: &Dom, target: ElementId| {
                on_change(&sanitizer, &runtime, dom, target);
            }),
        );
        debug!(input = input.raw(), "Change handler attached");

        if self.sanitizer.is_marked(input) && accepts_pdf(dom, input) {
            self.warm_up();
        }
        true
    }

    /// Load the rendering libraries in the background.
    fn warm_up(&self) {
        let sanitizer = Arc::clone(&self.sanitizer);
        self.runtime.spawn(async move {
            if let Err(e) = sanitizer.preload().await {
                debug!(error = %e, "Library preload failed; first sanitisation will retry");
            }
        });
    }

    /// Scan the document, then keep attaching to inputs as they appear.
    ///
    /// The discovery variant comes from the current settings. The returned
    /// task runs until the notification source closes or is aborted.
    pub fn start(&self) -> JoinHandle<()> {
        let mode = self.sanitizer.settings().resolve().discovery;
        self.start_with(discovery_for(mode, self.sanitizer.dom().clone()))
    }

    /// Like [`start`](Self::start) with an explicit discovery source.
    pub fn start_with(&self, mut discovery: Box<dyn ElementDiscovery>) -> JoinHandle<()> {
        let attached = self.scan(self.sanitizer.dom().document_element());
        debug!(attached, "Initial file input scan complete");

        let observer = self.clone();
        self.runtime.spawn(async move {
            while let Some(roots) = discovery.next_batch().await {
                let dom = observer.sanitizer.dom();
                for root in roots.into_iter().filter(|r| dom.is_connected(*r)) {
                    observer.scan(root);
                }
            }
        })
    }
}

fn on_change(sanitizer: &Weak<Sanitizer>, runtime: &Handle, dom: &Dom, input: ElementId) {
    if dom.attribute(input, SANITIZING).as_deref() == Some("true") {
        dom.set_attribute(input, SANITIZING, "false");
        return;
    }
    let Some(sanitizer) = sanitizer.upgrade() else {
        return;
    };
    if !sanitizer.is_marked(input) || !dom.files(input).iter().any(guard::is_pdf) {
        return;
    }

    dom.set_attribute(input, SANITIZING, "true");
    let dom = dom.clone();
    runtime.spawn(async move {
        sanitizer.sanitize_input_files(input).await;
        dom.set_attribute(input, SANITIZING, "false");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SanitizerConfig, SettingsSource};
    use crate::file::{CandidateFile, PDF_MEDIA_TYPE};
    use crate::pipeline::assemble::{LopdfAuthor, PdfAuthor};
    use crate::pipeline::render::{LibraryHandles, RenderService};
    use std::time::Duration;

    fn sanitizer() -> Arc<Sanitizer> {
        let handles = LibraryHandles::with_loaders(
            Arc::new(|_: &str| -> Result<Arc<dyn RenderService>, SanitizeError> {
                Err(SanitizeError::LibraryLoad {
                    service: "rendering".into(),
                    detail: "unavailable".into(),
                })
            }),
            Arc::new(|| -> Result<Arc<dyn PdfAuthor>, SanitizeError> { Ok(Arc::new(LopdfAuthor)) }),
        );
        Sanitizer::builder()
            .settings(SettingsSource::from_config(
                SanitizerConfig::builder().log_errors(false).build().unwrap(),
            ))
            .handles(Arc::new(handles))
            .build()
    }

    #[test]
    fn test_accept_attribute_filter() {
        let dom = Dom::new();
        let any = dom.create_file_input("a", true);
        let pdf = dom.create_file_input("b", true);
        dom.set_attribute(pdf, "accept", "application/PDF,.pdf");
        let images = dom.create_file_input("c", true);
        dom.set_attribute(images, "accept", "image/*");
        let text = dom.create_element("input");

        assert!(accepts_pdf(&dom, any));
        assert!(accepts_pdf(&dom, pdf));
        assert!(!accepts_pdf(&dom, images));
        assert!(!accepts_pdf(&dom, text));
    }

    #[tokio::test]
    async fn test_scan_attaches_once() {
        let s = sanitizer();
        let dom = s.dom().clone();
        let input = dom.create_file_input("doc", true);
        dom.append_child(dom.body(), input);

        let observer = DomObserver::new(Arc::clone(&s)).unwrap();
        assert_eq!(observer.scan(dom.document_element()), 1);
        assert_eq!(observer.scan(dom.document_element()), 0);
        assert_eq!(dom.listener_count(input), 1);
        assert_eq!(dom.attribute(input, HANDLER_ATTACHED).as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_inputs_inserted_later_are_discovered() {
        let s = sanitizer();
        let dom = s.dom().clone();
        let observer = DomObserver::new(Arc::clone(&s)).unwrap();
        let task = observer.start_with(discovery_for(DiscoveryMode::Observer, dom.clone()));

        let wrapper = dom.create_element("div");
        let input = dom.create_file_input("late", true);
        dom.append_child(wrapper, input);
        dom.append_child(dom.body(), wrapper);

        for _ in 0..50 {
            if dom.listener_count(input) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dom.listener_count(input), 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_lifecycle_discovery_scans_patched_root() {
        let s = sanitizer();
        let dom = s.dom().clone();
        let observer = DomObserver::new(Arc::clone(&s)).unwrap();
        let task = observer.start_with(discovery_for(DiscoveryMode::Lifecycle, dom.clone()));

        let input = dom.create_file_input("patched", false);
        dom.append_child(dom.body(), input);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dom.listener_count(input), 0);

        dom.notify_patched(dom.body());
        for _ in 0..50 {
            if dom.listener_count(input) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dom.listener_count(input), 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_sanitizing_flag_swallows_one_event() {
        let s = sanitizer();
        let dom = s.dom().clone();
        let input = dom.create_file_input("doc", true);
        dom.append_child(dom.body(), input);
        DomObserver::new(Arc::clone(&s)).unwrap().scan(dom.body());

        dom.set_attribute(input, SANITIZING, "true");
        let pdf = CandidateFile::new("a.pdf", PDF_MEDIA_TYPE, b"%PDF".to_vec());
        dom.select_files(input, vec![pdf.clone()]);

        assert_eq!(dom.attribute(input, SANITIZING).as_deref(), Some("false"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(s.cache_len(), 0);
        assert!(dom.files(input)[0].same_blob(&pdf));
    }
}
