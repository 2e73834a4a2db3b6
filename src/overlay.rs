//! The in-page progress overlay.
//!
//! Finds the upload widget wrapping an input (or wraps the input itself),
//! lays a dark full-cover panel with a message line and a spinner over it,
//! and dims the widget while rasterisation runs. Elements are created once
//! per widget and reused by later runs.

use crate::dom::{Dom, ElementId};
use crate::progress::{ProgressHandle, ProgressPresenter};

/// Wrapper classes tried in order; the first ancestor match wins.
pub const WRAPPER_CLASSES: [&str; 4] = [
    "fi-fo-file-upload-wrapper",
    "filament-forms-file-upload-component",
    "fi-input-wrp",
    "fi-input",
];

pub const OVERLAY_CLASS: &str = "pdf-sanitizer-progress";
pub const MESSAGE_CLASS: &str = "pdf-sanitizer-message";
pub const SPINNER_CLASS: &str = "pdf-sanitizer-spinner";
pub const STYLES_ID: &str = "pdf-sanitizer-styles";

const CONTAINER_CSS: &str = "position: relative; display: inline-block; width: 100%";
const OVERLAY_CSS: &str = "position: absolute; top: 0; left: 0; right: 0; bottom: 0; \
    background: rgba(0, 0, 0, 0.85); display: flex; align-items: center; \
    justify-content: center; flex-direction: column; z-index: 9999; \
    border-radius: 0.5rem; color: white; font-size: 0.875rem; font-weight: 500; \
    backdrop-filter: blur(2px)";
const MESSAGE_CSS: &str = "margin-bottom: 0.5rem; font-weight: 500";
const SPINNER_CSS: &str = "width: 2rem; height: 2rem; border: 3px solid rgba(255, 255, 255, 0.3); \
    border-top-color: white; border-radius: 50%; animation: spin 0.8s linear infinite";
const KEYFRAMES: &str = "@keyframes spin { to { transform: rotate(360deg); } }";

/// [`ProgressPresenter`] drawing into a [`Dom`].
#[derive(Debug, Clone)]
pub struct OverlayPresenter {
    dom: Dom,
}

impl OverlayPresenter {
    pub fn new(dom: Dom) -> Self {
        Self { dom }
    }

    /// The known widget wrapper around `input`, falling back to its
    /// grandparent.
    pub fn find_wrapper(&self, input: ElementId) -> Option<ElementId> {
        WRAPPER_CLASSES
            .iter()
            .find_map(|class| self.dom.closest_with_class(input, class))
            .or_else(|| self.dom.parent(input).and_then(|p| self.dom.parent(p)))
    }

    /// Wrapper for `input`, synthesising a positioned container if needed.
    fn container_for(&self, input: ElementId) -> ElementId {
        if let Some(wrapper) = self.find_wrapper(input) {
            return wrapper;
        }
        let container = self.dom.create_element("div");
        self.dom.set_style_text(container, CONTAINER_CSS);
        if let Some(parent) = self.dom.parent(input) {
            self.dom.insert_before(parent, container, input);
        }
        self.dom.append_child(container, input);
        container
    }

    fn child_with_class(&self, parent: ElementId, class: &str) -> Option<ElementId> {
        self.dom
            .children(parent)
            .into_iter()
            .find(|c| self.dom.has_class(*c, class))
    }

    fn ensure_child(&self, parent: ElementId, class: &str) -> ElementId {
        self.child_with_class(parent, class).unwrap_or_else(|| {
            let el = self.dom.create_element("div");
            self.dom.add_class(el, class);
            self.dom.append_child(parent, el);
            el
        })
    }

    fn ensure_keyframes(&self) {
        let root = self.dom.document_element();
        let present = self
            .dom
            .query_first(root, |el| el.attribute("id") == Some(STYLES_ID))
            .is_some();
        if !present {
            let style = self.dom.create_element("style");
            self.dom.set_attribute(style, "id", STYLES_ID);
            self.dom.set_text(style, KEYFRAMES);
            self.dom.append_child(self.dom.head(), style);
        }
    }
}

impl ProgressPresenter for OverlayPresenter {
    fn show(&self, input: ElementId, message: &str) -> Option<ProgressHandle> {
        let container = self.container_for(input);

        let position = self.dom.style(container, "position");
        if matches!(position.as_deref(), None | Some("") | Some("static")) {
            self.dom.set_style(container, "position", "relative");
        }

        let overlay = self.ensure_child(container, OVERLAY_CLASS);
        self.dom.set_attribute(overlay, "data-pdf-sanitizer-progress", "true");
        self.dom.set_style_text(overlay, OVERLAY_CSS);

        let message_el = self.ensure_child(overlay, MESSAGE_CLASS);
        self.dom.set_style_text(message_el, MESSAGE_CSS);
        self.dom.set_text(message_el, message);

        let spinner = self.ensure_child(overlay, SPINNER_CLASS);
        self.dom.set_style_text(spinner, SPINNER_CSS);

        self.ensure_keyframes();

        self.dom.set_style(overlay, "display", "flex");
        self.dom.set_style(container, "pointer-events", "none");
        self.dom.set_style(container, "opacity", "0.8");

        Some(ProgressHandle {
            input,
            container: Some(container),
            overlay: Some(overlay),
        })
    }

    fn update(&self, handle: &ProgressHandle, message: &str, percent: Option<u8>) {
        let Some(overlay) = handle.overlay else {
            return;
        };
        if let Some(message_el) = self.child_with_class(overlay, MESSAGE_CLASS) {
            let text = match percent {
                Some(p) => format!("{message} ({p}%)"),
                None => message.to_string(),
            };
            self.dom.set_text(message_el, &text);
        }
    }

    fn hide(&self, handle: &ProgressHandle) {
        if let Some(overlay) = handle.overlay {
            self.dom.set_style(overlay, "display", "none");
        }
        if let Some(container) = handle.container {
            self.dom.set_style(container, "pointer-events", "");
            self.dom.set_style(container, "opacity", "");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlays(dom: &Dom) -> Vec<ElementId> {
        dom.query_all(dom.document_element(), |el| el.has_class(OVERLAY_CLASS))
    }

    #[test]
    fn test_known_wrapper_wins_over_grandparent() {
        let dom = Dom::new();
        let outer = dom.create_element("div");
        dom.add_class(outer, "fi-input-wrp");
        let mid = dom.create_element("div");
        dom.add_class(mid, "fi-input");
        let input = dom.create_file_input("doc", true);
        dom.append_child(dom.body(), outer);
        dom.append_child(outer, mid);
        dom.append_child(mid, input);

        // `fi-input-wrp` has higher priority than the nearer `fi-input`.
        assert_eq!(OverlayPresenter::new(dom).find_wrapper(input), Some(outer));
    }

    #[test]
    fn test_detached_input_gets_synthesised_container() {
        let dom = Dom::new();
        let input = dom.create_file_input("doc", true);
        let presenter = OverlayPresenter::new(dom.clone());

        let handle = presenter.show(input, "Sanitizing PDF...").unwrap();
        let container = handle.container.unwrap();
        assert_eq!(dom.parent(input), Some(container));
        assert_eq!(dom.style(container, "position").as_deref(), Some("relative"));
        assert_eq!(dom.style(container, "width").as_deref(), Some("100%"));
    }

    #[test]
    fn test_repeated_show_reuses_elements() {
        let dom = Dom::new();
        let wrapper = dom.create_element("div");
        dom.add_class(wrapper, "fi-fo-file-upload-wrapper");
        let input = dom.create_file_input("doc", true);
        dom.append_child(dom.body(), wrapper);
        dom.append_child(wrapper, input);

        let presenter = OverlayPresenter::new(dom.clone());
        let first = presenter.show(input, "one").unwrap();
        let second = presenter.show(input, "two").unwrap();
        assert_eq!(first, second);

        let overlay = first.overlay.unwrap();
        assert_eq!(overlays(&dom), vec![overlay]);
        assert_eq!(dom.children(overlay).len(), 2);
        let styles = dom.query_all(dom.head(), |el| el.attribute("id") == Some(STYLES_ID));
        assert_eq!(styles.len(), 1);
        assert_eq!(dom.style(wrapper, "pointer-events").as_deref(), Some("none"));
        assert_eq!(dom.style(wrapper, "opacity").as_deref(), Some("0.8"));
    }

    #[test]
    fn test_update_and_hide() {
        let dom = Dom::new();
        let wrapper = dom.create_element("div");
        dom.add_class(wrapper, "fi-input");
        dom.set_style(wrapper, "position", "absolute");
        let input = dom.create_file_input("doc", true);
        dom.append_child(dom.body(), wrapper);
        dom.append_child(wrapper, input);

        let presenter = OverlayPresenter::new(dom.clone());
        let handle = presenter.show(input, "Sanitizing PDF...").unwrap();
        // Non-static positioning is left alone.
        assert_eq!(dom.style(wrapper, "position").as_deref(), Some("absolute"));

        presenter.update(&handle, "Processing page 1 of 2...", Some(50));
        let overlay = handle.overlay.unwrap();
        let message = dom.children(overlay)[0];
        assert_eq!(dom.text(message), "Processing page 1 of 2... (50%)");

        presenter.hide(&handle);
        assert_eq!(dom.style(overlay, "display").as_deref(), Some("none"));
        assert_eq!(dom.style(wrapper, "pointer-events"), None);
        assert_eq!(dom.style(wrapper, "opacity"), None);
        assert_eq!(overlays(&dom), vec![overlay]);
    }
}
