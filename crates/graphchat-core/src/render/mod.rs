//! Uniform render entry point over the flowchart and outline engines.
//!
//! Engines are black boxes behind [`GraphEngine`] and [`OutlineEngine`]. The
//! adapter turns every engine error, and every engine panic, into
//! [`RenderResult::Failure`] carrying the engine's message verbatim.

pub mod flowchart;
pub mod outline;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::Dialect;

pub use flowchart::FlowchartEngine;
pub use outline::{
    MarkdownOutlineEngine, OutlineNode, OutlineTree, ThemeTextHook, LABEL_TEXT_FILL, PALETTE,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        EngineError(message.into())
    }
}

/// Graph-syntax renderer: source text in, SVG out.
pub trait GraphEngine: Send + Sync {
    fn render_graph(&self, source: &str) -> Result<String, EngineError>;
}

/// Outline renderer: heading text to tree, tree to SVG.
pub trait OutlineEngine: Send + Sync {
    fn transform(&self, source: &str) -> Result<OutlineTree, EngineError>;
    fn layout(&self, tree: &OutlineTree) -> Result<String, EngineError>;
}

/// Re-applied to every node touched by a mutation of a rendered outline
/// (expand, collapse, restyle). Errors are logged and ignored.
pub trait MutationHook: Send + Sync {
    fn on_mutation(&self, node: &mut OutlineNode) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub enum RenderedDiagram {
    Graph { svg: String },
    Outline(OutlineView),
}

impl RenderedDiagram {
    pub fn svg(&self) -> &str {
        match self {
            RenderedDiagram::Graph { svg } => svg,
            RenderedDiagram::Outline(view) => view.svg(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RenderResult {
    Success(RenderedDiagram),
    Failure {
        error_message: String,
        partial_source: String,
    },
}

impl RenderResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RenderResult::Success(_))
    }
}

/// Serializable summary of a render, for transports that cannot carry the view.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RenderReport {
    Success { svg: String },
    Failure { error_message: String, partial_source: String },
}

impl From<&RenderResult> for RenderReport {
    fn from(result: &RenderResult) -> Self {
        match result {
            RenderResult::Success(diagram) => RenderReport::Success {
                svg: diagram.svg().to_string(),
            },
            RenderResult::Failure {
                error_message,
                partial_source,
            } => RenderReport::Failure {
                error_message: error_message.clone(),
                partial_source: partial_source.clone(),
            },
        }
    }
}

#[derive(Clone)]
pub struct DiagramRenderer {
    graph: Arc<dyn GraphEngine>,
    outline: Arc<dyn OutlineEngine>,
    hooks: Vec<Arc<dyn MutationHook>>,
}

impl Default for DiagramRenderer {
    fn default() -> Self {
        Self::new(Arc::new(FlowchartEngine::default()), Arc::new(MarkdownOutlineEngine::default()))
    }
}

impl DiagramRenderer {
    /// Built with the theme hook installed.
    pub fn new(graph: Arc<dyn GraphEngine>, outline: Arc<dyn OutlineEngine>) -> Self {
        Self {
            graph,
            outline,
            hooks: vec![Arc::new(ThemeTextHook)],
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn MutationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn render(&self, dialect: Dialect, source: &str) -> RenderResult {
        let attempt = match dialect {
            Dialect::Flowchart => guarded(|| self.graph.render_graph(source))
                .map(|svg| RenderedDiagram::Graph { svg }),
            Dialect::Outline => self.render_outline(source).map(RenderedDiagram::Outline),
        };

        match attempt {
            Ok(diagram) => {
                debug!(?dialect, svg_len = diagram.svg().len(), "diagram rendered");
                RenderResult::Success(diagram)
            }
            Err(err) => {
                debug!(?dialect, error = %err, "diagram render failed");
                RenderResult::Failure {
                    error_message: err.0,
                    partial_source: source.to_string(),
                }
            }
        }
    }

    fn render_outline(&self, source: &str) -> Result<OutlineView, EngineError> {
        let mut tree = guarded(|| self.outline.transform(source))?;
        debug!(nodes = tree.node_count(), "outline transformed");
        tree.collapse_below(1);

        let mut view = OutlineView {
            tree,
            svg: String::new(),
            engine: Arc::clone(&self.outline),
            hooks: self.hooks.clone(),
        };
        view.notify(&[]);
        view.relayout()?;
        Ok(view)
    }
}

/// Run an engine call, converting a panic into an [`EngineError`].
fn guarded<T>(call: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "renderer panicked".to_string());
            Err(EngineError(message))
        }
    }
}

/// A rendered outline that stays interactive. Every mutation re-runs the
/// installed hooks over the changed subtree and lays the tree out again.
#[derive(Clone)]
pub struct OutlineView {
    tree: OutlineTree,
    svg: String,
    engine: Arc<dyn OutlineEngine>,
    hooks: Vec<Arc<dyn MutationHook>>,
}

impl fmt::Debug for OutlineView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutlineView")
            .field("tree", &self.tree)
            .field("svg_len", &self.svg.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl OutlineView {
    pub fn tree(&self) -> &OutlineTree {
        &self.tree
    }

    pub fn svg(&self) -> &str {
        &self.svg
    }

    /// Expand or collapse the node at `path` (child indices from the root).
    pub fn toggle_fold(&mut self, path: &[usize]) -> Result<bool, EngineError> {
        let node = self
            .tree
            .node_mut(path)
            .ok_or_else(|| EngineError::new(format!("no outline node at {path:?}")))?;
        node.folded = !node.folded;
        let folded = node.folded;
        self.notify(path);
        self.relayout()?;
        Ok(folded)
    }

    /// Change the label fill of the subtree at `path`; hooks may override it.
    pub fn set_text_fill(&mut self, path: &[usize], fill: &str) -> Result<(), EngineError> {
        let node = self
            .tree
            .node_mut(path)
            .ok_or_else(|| EngineError::new(format!("no outline node at {path:?}")))?;
        node.walk_mut(&mut |n| n.style.text_fill = fill.to_string());
        self.notify(path);
        self.relayout()
    }

    fn notify(&mut self, path: &[usize]) {
        let Some(node) = self.tree.node_mut(path) else {
            return;
        };
        for hook in &self.hooks {
            node.walk_mut(&mut |n| {
                if let Err(err) = hook.on_mutation(n) {
                    warn!(label = %n.label, error = %err, "outline mutation hook failed");
                }
            });
        }
    }

    fn relayout(&mut self) -> Result<(), EngineError> {
        let engine = Arc::clone(&self.engine);
        let tree = &self.tree;
        self.svg = guarded(|| engine.layout(tree))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingEngine;

    impl GraphEngine for PanickingEngine {
        fn render_graph(&self, _source: &str) -> Result<String, EngineError> {
            panic!("layout exploded");
        }
    }

    struct FailingHook;

    impl MutationHook for FailingHook {
        fn on_mutation(&self, _node: &mut OutlineNode) -> Result<(), EngineError> {
            Err(EngineError::new("observer detached"))
        }
    }

    #[test]
    fn flowchart_success() {
        let renderer = DiagramRenderer::default();
        let source = "flowchart TD\nA[Start] --> B{Check}\nB -->|Yes| C[Done]\nB -->|No| A";
        let result = renderer.render(Dialect::Flowchart, source);
        assert!(result.is_success(), "{result:?}");
    }

    #[test]
    fn flowchart_failure_keeps_message_and_source() {
        let renderer = DiagramRenderer::default();
        let source = "flowchart TD\nA[Start] --> B[Proc";
        match renderer.render(Dialect::Flowchart, source) {
            RenderResult::Failure {
                error_message,
                partial_source,
            } => {
                assert!(error_message.starts_with("Parse error on line 2"));
                assert_eq!(partial_source, source);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn engine_panic_becomes_failure() {
        let renderer = DiagramRenderer::new(
            Arc::new(PanickingEngine),
            Arc::new(MarkdownOutlineEngine::default()),
        );
        match renderer.render(Dialect::Flowchart, "graph TD") {
            RenderResult::Failure { error_message, .. } => assert_eq!(error_message, "layout exploded"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn outline_is_folded_below_first_level_and_themed() {
        let renderer = DiagramRenderer::default();
        let source = "# Project\n## Frontend\n### Components\n- Header\n## Backend\n### API";
        let RenderResult::Success(RenderedDiagram::Outline(view)) =
            renderer.render(Dialect::Outline, source)
        else {
            panic!("expected outline");
        };
        let root = &view.tree().root;
        assert!(!root.folded);
        assert!(root.children.iter().all(|c| c.folded));
        assert_eq!(root.children[0].style.text_fill, LABEL_TEXT_FILL);
        assert_eq!(root.children[0].style.branch_color, PALETTE[1]);
        assert!(view.svg().contains("<svg"));
    }

    #[test]
    fn mutation_reapplies_white_text() {
        let renderer = DiagramRenderer::default();
        let RenderResult::Success(RenderedDiagram::Outline(mut view)) =
            renderer.render(Dialect::Outline, "# Root\n## A\n### A1\n## B")
        else {
            panic!("expected outline");
        };
        view.set_text_fill(&[0], "#111111").unwrap();
        assert_eq!(view.tree().root.children[0].style.text_fill, LABEL_TEXT_FILL);

        assert!(!view.toggle_fold(&[0]).unwrap());
        assert!(view.svg().contains("A1"));
    }

    #[test]
    fn failing_hook_does_not_abort_render() {
        let renderer = DiagramRenderer::default().with_hook(Arc::new(FailingHook));
        assert!(renderer.render(Dialect::Outline, "# Root\n## A").is_success());
    }

    #[test]
    fn empty_outline_fails() {
        let renderer = DiagramRenderer::default();
        assert!(!renderer.render(Dialect::Outline, "just prose").is_success());
    }
}
