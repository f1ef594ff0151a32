// rejourney — session replay for mobile apps
// https://rejourney.co

//! Budgeted traversal of the live view hierarchy.
//!
//! The scanner walks the UI tree on the UI thread and emits the sensitive
//! regions for the current frame. It must respect a hard wall-clock budget;
//! when the budget is exceeded mid-walk the whole frame is flagged for full
//! occlusion rather than risking a leak.

use dashmap::DashSet;
use once_cell::sync::Lazy;
use rejourney_core::{Rect, SensitiveKind, SensitiveRegionSet};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Accessibility hint that force-masks a view regardless of class.
pub const OCCLUDE_HINT: &str = "rejourney_occlude";

/// Sentinel view tag that force-masks a view regardless of class.
pub const OCCLUDE_TAG: i64 = 98765;

/// Editable text surfaces by concrete class name.
static TEXT_INPUT_CLASSES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "UITextField",
        "UITextView",
        "UISearchTextField",
        "RCTUITextField",
        "RCTUITextView",
        "RCTSinglelineTextInputView",
        "RCTMultilineTextInputView",
    ])
});

/// Classes hosting the on-screen keyboard itself — never treated as text
/// input (the keyboard is occluded by its own blocker windows, not masked).
static KEYBOARD_HOST_CLASSES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "UIRemoteKeyboardWindow",
        "UIInputSetContainerView",
        "UIInputSetHostView",
        "UIKeyboardLayout",
    ])
});

/// Third-party camera preview views that carry no identifiable layer.
static CAMERA_CLASSES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "CameraPreviewView",
        "ExpoCameraView",
        "RNCameraView",
        "CKCameraView",
    ])
});

/// Web surfaces by class identity.
static WEB_VIEW_CLASSES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["WKWebView", "UIWebView", "RNCWebView", "SFSafariView"]));

/// A platform-agnostic snapshot of one node in the view tree, provided by
/// the embedder's hierarchy bridge.
#[derive(Debug, Clone, Default)]
pub struct ViewNode {
    pub class_name: String,
    /// Bounding rect in window coordinate space.
    pub frame: Rect,
    pub accessibility_id: Option<String>,
    pub accessibility_hint: Option<String>,
    pub tag: i64,
    pub hidden: bool,
    pub children: Vec<ViewNode>,
}

impl ViewNode {
    pub fn new(class_name: impl Into<String>, frame: Rect) -> Self {
        Self {
            class_name: class_name.into(),
            frame,
            ..Default::default()
        }
    }

    pub fn with_children(mut self, children: Vec<ViewNode>) -> Self {
        self.children = children;
        self
    }
}

/// Platform-specific probing that cannot be expressed by class name alone
/// (first-responder status, layer kinds). The closed method set keeps all
/// platform coupling behind one seam.
pub trait SurfaceProbe {
    /// First-responder editable text surface.
    fn is_text_input(&self, _node: &ViewNode) -> bool {
        false
    }

    /// View whose layer (or a sublayer) is a capture preview layer.
    fn is_camera(&self, _node: &ViewNode) -> bool {
        false
    }

    fn is_web_view(&self, _node: &ViewNode) -> bool {
        false
    }

    /// View whose layer (or a sublayer) is a player layer.
    fn is_video(&self, _node: &ViewNode) -> bool {
        false
    }
}

/// Probe that answers no to everything — class-name matching only.
pub struct NoProbe;

impl SurfaceProbe for NoProbe {}

/// App-managed set of accessibility identifiers to mask. Shared with the
/// public SDK surface; reads happen on the UI thread during scans.
#[derive(Debug, Default)]
pub struct MaskRegistry {
    ids: DashSet<String>,
}

impl MaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mask(&self, id: impl Into<String>) {
        self.ids.insert(id.into());
    }

    pub fn unmask(&self, id: &str) {
        self.ids.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Classify one node. Manual masking wins; the rest follow the probe plus
/// class-name allowlists.
fn classify(node: &ViewNode, probe: &dyn SurfaceProbe, registry: &MaskRegistry) -> Option<SensitiveKind> {
    let class = node.class_name.as_str();

    let manual = node
        .accessibility_id
        .as_deref()
        .is_some_and(|id| registry.contains(id))
        || node.accessibility_hint.as_deref() == Some(OCCLUDE_HINT)
        || node.tag == OCCLUDE_TAG;
    if manual {
        return Some(SensitiveKind::ManualId);
    }

    let keyboard_host =
        KEYBOARD_HOST_CLASSES.contains(class) || class.starts_with("UIKeyboard");
    if !keyboard_host && (probe.is_text_input(node) || TEXT_INPUT_CLASSES.contains(class)) {
        return Some(SensitiveKind::TextInput);
    }

    if probe.is_camera(node) || CAMERA_CLASSES.contains(class) {
        return Some(SensitiveKind::Camera);
    }

    if probe.is_web_view(node) || WEB_VIEW_CLASSES.contains(class) {
        return Some(SensitiveKind::WebView);
    }

    if probe.is_video(node) || (class.contains("Video") && class.contains("View")) {
        return Some(SensitiveKind::Video);
    }

    None
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Wall-clock budget for one walk; exceeding it flags `mask_all`.
    pub budget: Duration,
    /// Repeated scans within this interval return the cached result.
    pub min_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_millis(16),
            min_interval: Duration::from_secs(1),
        }
    }
}

struct CachedScan {
    at: Instant,
    result: SensitiveRegionSet,
}

/// Walks the view tree under a time budget and emits sensitive regions.
pub struct HierarchyScanner {
    config: ScannerConfig,
    registry: Arc<MaskRegistry>,
    cache: Option<CachedScan>,
    /// Rect of the currently focused input, registered explicitly by the
    /// focus observer. Bypasses the cache for that one view.
    focused_input: Option<Rect>,
}

impl HierarchyScanner {
    pub fn new(config: ScannerConfig, registry: Arc<MaskRegistry>) -> Self {
        Self {
            config,
            registry,
            cache: None,
            focused_input: None,
        }
    }

    pub fn registry(&self) -> &Arc<MaskRegistry> {
        &self.registry
    }

    /// Register the focused input view's rect; it is merged fresh into
    /// every result until cleared, even when the cached scan is served.
    pub fn register_focused_input(&mut self, rect: Rect) {
        self.focused_input = Some(rect);
    }

    pub fn clear_focused_input(&mut self) {
        self.focused_input = None;
    }

    /// Drop the cached result (used across navigations).
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Scan the tree rooted at `root`. `now` drives cache decisions; the
    /// traversal budget is measured against real wall time.
    pub fn scan(
        &mut self,
        root: &ViewNode,
        window_bounds: Rect,
        probe: &dyn SurfaceProbe,
        now: Instant,
    ) -> SensitiveRegionSet {
        if let Some(cache) = &self.cache {
            if now.duration_since(cache.at) < self.config.min_interval {
                let mut result = cache.result.clone();
                self.merge_focused_input(&mut result, &window_bounds);
                return result;
            }
        }

        let started = Instant::now();
        let deadline = started + self.config.budget;
        let mut result = SensitiveRegionSet::empty();
        Self::walk(
            root,
            &window_bounds,
            probe,
            &self.registry,
            deadline,
            &mut result,
        );

        if result.mask_all {
            debug!(
                "hierarchy scan exceeded {}ms budget, masking whole frame",
                self.config.budget.as_millis()
            );
        }

        self.merge_focused_input(&mut result, &window_bounds);
        self.cache = Some(CachedScan {
            at: now,
            result: result.clone(),
        });
        result
    }

    /// Returns false once the budget is exceeded, aborting the walk.
    fn walk(
        node: &ViewNode,
        window: &Rect,
        probe: &dyn SurfaceProbe,
        registry: &MaskRegistry,
        deadline: Instant,
        out: &mut SensitiveRegionSet,
    ) -> bool {
        if node.hidden {
            return true;
        }

        if let Some(kind) = classify(node, probe, registry) {
            if let Some(rect) = node.frame.sanitized(window) {
                out.push(kind, rect);
            }
        }

        for child in &node.children {
            if Instant::now() > deadline {
                out.mask_all = true;
                return false;
            }
            if !Self::walk(child, window, probe, registry, deadline, out) {
                return false;
            }
        }
        true
    }

    fn merge_focused_input(&self, result: &mut SensitiveRegionSet, window: &Rect) {
        if let Some(rect) = self.focused_input {
            if let Some(rect) = rect.sanitized(window) {
                if !result.regions.contains(&(SensitiveKind::TextInput, rect)) {
                    result.push(SensitiveKind::TextInput, rect);
                }
            }
        }
    }
}
