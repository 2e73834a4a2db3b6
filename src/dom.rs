//! A small host document model.
//!
//! The sanitiser runs against whatever page the host renders: file inputs
//! carrying file lists, wrapper elements the overlay positions itself in,
//! change events dispatched in capture then bubble order, and notifications
//! when subtrees are inserted or patched by the host framework. [`Dom`]
//! models exactly that and nothing more.
//!
//! `Dom` is a cheap-clone handle; every clone sees the same tree. Listeners
//! are called with no lock held, so a listener may freely read and mutate
//! the document (including rewriting the target's file list).

use crate::file::CandidateFile;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const NOTIFY_CAPACITY: usize = 256;

/// Index of an element in the document arena.
///
/// Elements are never freed, so an id stays valid for the [`Dom`] that
/// minted it. An id the document does not know reads as an absent element:
/// queries come back empty and writes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(usize);

impl ElementId {
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }
}

/// Event listener phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    Capture,
    Bubble,
}

/// Change listener; receives the document and the event target.
pub type Listener = Arc<dyn Fn(&Dom, ElementId) + Send + Sync>;

/// Nodes inserted under `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: ElementId,
    pub added: Vec<ElementId>,
}

/// The host framework finished patching the subtree at `root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchEvent {
    pub root: ElementId,
}

struct Node {
    tag: String,
    attributes: BTreeMap<String, String>,
    style: Vec<(String, String)>,
    text: String,
    parent: Option<ElementId>,
    children: Vec<ElementId>,
    files: Vec<CandidateFile>,
    listeners: Vec<(EventPhase, Listener)>,
}

impl Node {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            style: Vec::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
            files: Vec::new(),
            listeners: Vec::new(),
        }
    }

    fn has_class(&self, class: &str) -> bool {
        self.attributes
            .get("class")
            .is_some_and(|c| c.split_whitespace().any(|x| x == class))
    }

    fn is_file_input(&self) -> bool {
        self.tag == "input"
            && self
                .attributes
                .get("type")
                .is_some_and(|t| t.eq_ignore_ascii_case("file"))
    }
}

struct Tree {
    nodes: Vec<Node>,
    root: ElementId,
    head: ElementId,
    body: ElementId,
}

impl Tree {
    fn new() -> Self {
        let mut tree = Self {
            nodes: vec![Node::new("html"), Node::new("head"), Node::new("body")],
            root: ElementId(0),
            head: ElementId(1),
            body: ElementId(2),
        };
        tree.link(tree.root, tree.head, None);
        tree.link(tree.root, tree.body, None);
        tree
    }

    /// `None` for an id this document never minted.
    fn node(&self, id: ElementId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    fn node_mut(&mut self, id: ElementId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    fn detach(&mut self, child: ElementId) {
        if let Some(old) = self.node_mut(child).and_then(|n| n.parent.take()) {
            if let Some(parent) = self.node_mut(old) {
                parent.children.retain(|c| *c != child);
            }
        }
    }

    /// Insert `child` under `parent`, before `before` when it is a child.
    /// Returns `false`, changing nothing, when either id is unknown.
    fn link(&mut self, parent: ElementId, child: ElementId, before: Option<ElementId>) -> bool {
        if self.node(parent).is_none() || self.node(child).is_none() {
            return false;
        }
        self.detach(child);
        if let Some(node) = self.node_mut(parent) {
            let children = &mut node.children;
            let at = before
                .and_then(|b| children.iter().position(|c| *c == b))
                .unwrap_or(children.len());
            children.insert(at, child);
        }
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
        true
    }

    fn is_ancestor_or_self(&self, ancestor: ElementId, mut id: ElementId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.node(id).and_then(|n| n.parent) {
                Some(p) => id = p,
                None => return false,
            }
        }
    }

    /// Pre-order traversal from `root`, inclusive.
    fn walk(&self, root: ElementId, out: &mut Vec<ElementId>, pred: &dyn Fn(&ElementView<'_>) -> bool) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            if pred(&ElementView { id, node }) {
                out.push(id);
            }
            stack.extend(node.children.iter().rev().copied());
        }
    }
}

/// Read-only view of one element, handed to query predicates.
pub struct ElementView<'a> {
    id: ElementId,
    node: &'a Node,
}

impl ElementView<'_> {
    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.node.tag
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.node.attributes.get(name).map(String::as_str)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.node.has_class(class)
    }

    pub fn is_file_input(&self) -> bool {
        self.node.is_file_input()
    }
}

struct Shared {
    tree: RwLock<Tree>,
    mutations: broadcast::Sender<MutationRecord>,
    patches: broadcast::Sender<PatchEvent>,
}

/// Shared handle to a host document.
#[derive(Clone)]
pub struct Dom {
    shared: Arc<Shared>,
}

impl Default for Dom {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dom")
            .field("elements", &self.read().nodes.len())
            .finish()
    }
}

impl Dom {
    /// An empty document with `<html>`, `<head>` and `<body>`.
    pub fn new() -> Self {
        let (mutations, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (patches, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                tree: RwLock::new(Tree::new()),
                mutations,
                patches,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tree> {
        self.shared.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        self.shared.tree.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn document_element(&self) -> ElementId {
        self.read().root
    }

    pub fn head(&self) -> ElementId {
        self.read().head
    }

    pub fn body(&self) -> ElementId {
        self.read().body
    }

    // ── Structure ────────────────────────────────────────────────────────

    /// Create a detached element.
    pub fn create_element(&self, tag: &str) -> ElementId {
        let mut tree = self.write();
        tree.nodes.push(Node::new(tag));
        ElementId(tree.nodes.len() - 1)
    }

    /// Create a file input, optionally carrying the opt-in marker.
    pub fn create_file_input(&self, name: &str, marked: bool) -> ElementId {
        let input = self.create_element("input");
        self.set_attribute(input, "type", "file");
        self.set_attribute(input, "name", name);
        if marked {
            self.set_attribute(input, crate::config::MARKER_ATTRIBUTE, "true");
        }
        input
    }

    /// Move `child` to the end of `parent`'s children.
    pub fn append_child(&self, parent: ElementId, child: ElementId) {
        self.insert(parent, child, None);
    }

    /// Move `child` in front of `reference` under `parent`.
    pub fn insert_before(&self, parent: ElementId, child: ElementId, reference: ElementId) {
        self.insert(parent, child, Some(reference));
    }

    fn insert(&self, parent: ElementId, child: ElementId, before: Option<ElementId>) {
        {
            let mut tree = self.write();
            // Refuse cycles.
            if tree.is_ancestor_or_self(child, parent) || !tree.link(parent, child, before) {
                return;
            }
        }
        let _ = self.shared.mutations.send(MutationRecord {
            target: parent,
            added: vec![child],
        });
    }

    /// Detach `child` from its parent.
    pub fn remove(&self, child: ElementId) {
        self.write().detach(child);
    }

    pub fn parent(&self, id: ElementId) -> Option<ElementId> {
        self.read().node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: ElementId) -> Vec<ElementId> {
        self.read().node(id).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// `true` when the element is attached to the document.
    pub fn is_connected(&self, id: ElementId) -> bool {
        let tree = self.read();
        tree.is_ancestor_or_self(tree.root, id)
    }

    pub fn tag(&self, id: ElementId) -> String {
        self.read().node(id).map(|n| n.tag.clone()).unwrap_or_default()
    }

    // ── Attributes, classes, style, text ────────────────────────────────

    pub fn attribute(&self, id: ElementId, name: &str) -> Option<String> {
        self.read().node(id).and_then(|n| n.attributes.get(name).cloned())
    }

    pub fn has_attribute(&self, id: ElementId, name: &str) -> bool {
        self.read().node(id).is_some_and(|n| n.attributes.contains_key(name))
    }

    pub fn set_attribute(&self, id: ElementId, name: &str, value: &str) {
        if let Some(node) = self.write().node_mut(id) {
            node.attributes.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove_attribute(&self, id: ElementId, name: &str) {
        if let Some(node) = self.write().node_mut(id) {
            node.attributes.remove(name);
        }
    }

    pub fn has_class(&self, id: ElementId, class: &str) -> bool {
        self.read().node(id).is_some_and(|n| n.has_class(class))
    }

    pub fn add_class(&self, id: ElementId, class: &str) {
        let mut tree = self.write();
        let Some(node) = tree.node_mut(id) else {
            return;
        };
        if node.has_class(class) {
            return;
        }
        let classes = node.attributes.entry("class".to_string()).or_default();
        if !classes.is_empty() {
            classes.push(' ');
        }
        classes.push_str(class);
    }

    /// Inline style property, e.g. `style(el, "position")`.
    pub fn style(&self, id: ElementId, property: &str) -> Option<String> {
        self.read()
            .node(id)?
            .style
            .iter()
            .find(|(k, _)| k == property)
            .map(|(_, v)| v.clone())
    }

    /// Set an inline style property. An empty value removes it.
    pub fn set_style(&self, id: ElementId, property: &str, value: &str) {
        let mut tree = self.write();
        let Some(node) = tree.node_mut(id) else {
            return;
        };
        let style = &mut node.style;
        let existing = style.iter().position(|(k, _)| k == property);
        match (existing, value.is_empty()) {
            (Some(i), true) => {
                style.remove(i);
            }
            (Some(i), false) => style[i].1 = value.to_string(),
            (None, false) => style.push((property.to_string(), value.to_string())),
            (None, true) => {}
        }
    }

    /// Parse and apply a `prop: value; prop: value` declaration list.
    pub fn set_style_text(&self, id: ElementId, css: &str) {
        for decl in css.split(';') {
            if let Some((k, v)) = decl.split_once(':') {
                self.set_style(id, k.trim(), v.trim());
            }
        }
    }

    pub fn text(&self, id: ElementId) -> String {
        self.read().node(id).map(|n| n.text.clone()).unwrap_or_default()
    }

    pub fn set_text(&self, id: ElementId, text: &str) {
        if let Some(node) = self.write().node_mut(id) {
            node.text = text.to_string();
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Nearest inclusive ancestor carrying `class`.
    pub fn closest_with_class(&self, id: ElementId, class: &str) -> Option<ElementId> {
        let tree = self.read();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = tree.node(c)?;
            if node.has_class(class) {
                return Some(c);
            }
            cur = node.parent;
        }
        None
    }

    /// Elements under `root` (inclusive) matching `pred`, in document order.
    pub fn query_all(&self, root: ElementId, pred: impl Fn(&ElementView<'_>) -> bool) -> Vec<ElementId> {
        let mut out = Vec::new();
        self.read().walk(root, &mut out, &pred);
        out
    }

    /// First element under `root` (inclusive) matching `pred`.
    pub fn query_first(&self, root: ElementId, pred: impl Fn(&ElementView<'_>) -> bool) -> Option<ElementId> {
        self.query_all(root, pred).into_iter().next()
    }

    /// `<input type="file">` elements under `root`, inclusive.
    pub fn file_inputs(&self, root: ElementId) -> Vec<ElementId> {
        self.query_all(root, |el| el.is_file_input())
    }

    pub fn is_file_input(&self, id: ElementId) -> bool {
        self.read().node(id).is_some_and(Node::is_file_input)
    }

    // ── File lists ───────────────────────────────────────────────────────

    pub fn files(&self, id: ElementId) -> Vec<CandidateFile> {
        self.read().node(id).map(|n| n.files.clone()).unwrap_or_default()
    }

    /// Replace the element's file list. Does not dispatch a change event.
    pub fn set_files(&self, id: ElementId, files: Vec<CandidateFile>) {
        if let Some(node) = self.write().node_mut(id) {
            node.files = files;
        }
    }

    /// Clear the native selection (`input.value = ''`).
    pub fn clear_files(&self, id: ElementId) {
        if let Some(node) = self.write().node_mut(id) {
            node.files.clear();
        }
    }

    /// Simulate a user selection: set the files, then dispatch `change`.
    pub fn select_files(&self, input: ElementId, files: Vec<CandidateFile>) {
        self.set_files(input, files);
        self.dispatch_change(input);
    }

    // ── Events ───────────────────────────────────────────────────────────

    pub fn add_listener(&self, id: ElementId, phase: EventPhase, listener: Listener) {
        if let Some(node) = self.write().node_mut(id) {
            node.listeners.push((phase, listener));
        }
    }

    pub fn listener_count(&self, id: ElementId) -> usize {
        self.read().node(id).map_or(0, |n| n.listeners.len())
    }

    /// Dispatch a `change` event at `target`.
    ///
    /// Capture listeners run from the document element down to the target,
    /// then bubble listeners run from the target back up. At the target,
    /// capture listeners run before bubble listeners.
    pub fn dispatch_change(&self, target: ElementId) {
        let path: Vec<(EventPhase, Listener)> = {
            let tree = self.read();
            let mut ancestors = vec![target];
            let mut cur = tree.node(target).and_then(|n| n.parent);
            while let Some(p) = cur {
                ancestors.push(p);
                cur = tree.node(p).and_then(|n| n.parent);
            }

            let mut path = Vec::new();
            let mut collect = |id: ElementId, phase: EventPhase| {
                let Some(node) = tree.node(id) else {
                    return;
                };
                for (p, l) in &node.listeners {
                    if *p == phase {
                        path.push((phase, Arc::clone(l)));
                    }
                }
            };
            for id in ancestors.iter().rev() {
                collect(*id, EventPhase::Capture);
            }
            for id in ancestors.iter() {
                collect(*id, EventPhase::Bubble);
            }
            path
        };

        for (_, listener) in path {
            listener(self, target);
        }
    }

    // ── Notifications ────────────────────────────────────────────────────

    pub fn subscribe_mutations(&self) -> broadcast::Receiver<MutationRecord> {
        self.shared.mutations.subscribe()
    }

    pub fn subscribe_patches(&self) -> broadcast::Receiver<PatchEvent> {
        self.shared.patches.subscribe()
    }

    /// Announce that the host framework finished patching `root`.
    pub fn notify_patched(&self, root: ElementId) {
        let _ = self.shared.patches.send(PatchEvent { root });
    }
}
