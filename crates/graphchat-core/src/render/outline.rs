//! Heading-based outlines rendered as a collapsible mind map.

use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use serde::Serialize;
use svg::node::element::{path::Data, Circle, Path, Text};
use svg::Document;

use super::{EngineError, MutationHook, OutlineEngine};

/// Branch colours, indexed by node depth.
pub const PALETTE: [&str; 6] = [
    "#5eead4", // teal-300
    "#6ee7b7", // emerald-300
    "#2dd4bf", // teal-400
    "#34d399", // emerald-400
    "#14b8a6", // teal-500
    "#10b981", // emerald-500
];

/// Label colour for the dark theme.
pub const LABEL_TEXT_FILL: &str = "#ffffff";

const ENGINE_TEXT_FILL: &str = "#333333";
const ENGINE_BRANCH_COLOR: &str = "#999999";
const CHAR_WIDTH: f32 = 8.0;
const LINE_HEIGHT: f32 = 22.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStyle {
    pub branch_color: String,
    pub text_fill: String,
    pub font_weight: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineNode {
    pub label: String,
    pub depth: usize,
    pub folded: bool,
    pub style: NodeStyle,
    pub children: Vec<OutlineNode>,
}

impl OutlineNode {
    fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            depth: 0,
            folded: false,
            style: NodeStyle {
                branch_color: ENGINE_BRANCH_COLOR.to_string(),
                text_fill: ENGINE_TEXT_FILL.to_string(),
                font_weight: 400,
            },
            children: Vec::new(),
        }
    }

    /// Pre-order visit of this node and its descendants.
    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut OutlineNode)) {
        f(self);
        for child in &mut self.children {
            child.walk_mut(f);
        }
    }

    fn assign_depth(&mut self, depth: usize) {
        self.depth = depth;
        for child in &mut self.children {
            child.assign_depth(depth + 1);
        }
    }

    fn count(&self) -> usize {
        1 + self.children.iter().map(OutlineNode::count).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlineTree {
    pub root: OutlineNode,
}

impl OutlineTree {
    pub fn node(&self, path: &[usize]) -> Option<&OutlineNode> {
        path.iter()
            .try_fold(&self.root, |node, &i| node.children.get(i))
    }

    pub fn node_mut(&mut self, path: &[usize]) -> Option<&mut OutlineNode> {
        let mut node = &mut self.root;
        for &i in path {
            node = node.children.get_mut(i)?;
        }
        Some(node)
    }

    /// Fold every node at `depth` or deeper that has children.
    pub fn collapse_below(&mut self, depth: usize) {
        self.root.walk_mut(&mut |node| {
            if node.depth >= depth && !node.children.is_empty() {
                node.folded = true;
            }
        });
    }

    /// Number of nodes, root included. Never zero.
    pub fn node_count(&self) -> usize {
        self.root.count()
    }
}

/// White labels on dark fills, branch colour cycled by depth.
pub struct ThemeTextHook;

impl MutationHook for ThemeTextHook {
    fn on_mutation(&self, node: &mut OutlineNode) -> Result<(), EngineError> {
        node.style.branch_color = PALETTE[node.depth % PALETTE.len()].to_string();
        if is_dark_fill(&node.style.text_fill) {
            node.style.text_fill = LABEL_TEXT_FILL.to_string();
        }
        node.style.font_weight = 600;
        Ok(())
    }
}

pub fn is_dark_fill(fill: &str) -> bool {
    let fill = fill.trim().to_ascii_lowercase();
    fill == "black" || ["#0", "#1", "#2", "#3"].iter().any(|p| fill.starts_with(p))
}

/// Markdown outline transformer and tree layout.
#[derive(Debug, Clone)]
pub struct MarkdownOutlineEngine {
    pub max_width: f32,
    pub spacing_vertical: f32,
    pub spacing_horizontal: f32,
    pub padding_x: f32,
}

impl Default for MarkdownOutlineEngine {
    fn default() -> Self {
        Self {
            max_width: 400.0,
            spacing_vertical: 10.0,
            spacing_horizontal: 120.0,
            padding_x: 20.0,
        }
    }
}

/// Headings sit at levels 1..=6; list items nest below the current heading.
struct Pending {
    level: usize,
    label: String,
}

#[derive(Default)]
struct TreeBuilder {
    stack: Vec<(usize, OutlineNode)>,
    roots: Vec<OutlineNode>,
}

impl TreeBuilder {
    fn push(&mut self, level: usize, label: String) {
        while self.stack.last().is_some_and(|(l, _)| *l >= level) {
            self.attach_top();
        }
        self.stack.push((level, OutlineNode::new(label.trim())));
    }

    fn attach_top(&mut self) {
        if let Some((_, node)) = self.stack.pop() {
            match self.stack.last_mut() {
                Some((_, parent)) => parent.children.push(node),
                None => self.roots.push(node),
            }
        }
    }

    fn finish(mut self) -> Option<OutlineTree> {
        while !self.stack.is_empty() {
            self.attach_top();
        }
        let mut root = match self.roots.len() {
            0 => return None,
            1 => self.roots.pop()?,
            _ => {
                let mut root = OutlineNode::new("");
                root.children = self.roots;
                root
            }
        };
        root.assign_depth(0);
        Some(OutlineTree { root })
    }
}

impl OutlineEngine for MarkdownOutlineEngine {
    fn transform(&self, source: &str) -> Result<OutlineTree, EngineError> {
        let mut builder = TreeBuilder::default();
        let mut heading_level = 0usize;
        let mut list_depth = 0usize;
        let mut pending: Option<Pending> = None;

        for event in Parser::new(source) {
            match event {
                Event::Start(Tag::Heading { level, .. }) => {
                    heading_level = level as usize;
                    pending = Some(Pending {
                        level: heading_level,
                        label: String::new(),
                    });
                }
                Event::End(TagEnd::Heading(_)) => {
                    if let Some(p) = pending.take() {
                        builder.push(p.level, p.label);
                    }
                }
                Event::Start(Tag::List(_)) => {
                    // A nested list ends the owning item's label.
                    if let Some(p) = pending.take() {
                        builder.push(p.level, p.label);
                    }
                    list_depth += 1;
                }
                Event::End(TagEnd::List(_)) => {
                    list_depth = list_depth.saturating_sub(1);
                }
                Event::Start(Tag::Item) => {
                    pending = Some(Pending {
                        level: heading_level + list_depth,
                        label: String::new(),
                    });
                }
                Event::End(TagEnd::Item) => {
                    if let Some(p) = pending.take() {
                        builder.push(p.level, p.label);
                    }
                }
                Event::Text(text) | Event::Code(text) => {
                    if let Some(p) = pending.as_mut() {
                        p.label.push_str(&text);
                    }
                }
                Event::SoftBreak | Event::HardBreak => {
                    if let Some(p) = pending.as_mut() {
                        p.label.push(' ');
                    }
                }
                _ => {}
            }
        }

        builder
            .finish()
            .ok_or_else(|| EngineError::new("No headings or list items found in mind map source"))
    }

    fn layout(&self, tree: &OutlineTree) -> Result<String, EngineError> {
        let mut placed = Vec::new();
        let mut row = 0usize;
        self.place(&tree.root, self.padding_x, None, &mut row, &mut placed);

        let row_height = LINE_HEIGHT + self.spacing_vertical;
        let width = placed
            .iter()
            .map(|p| p.x + self.label_width(&p.node.label) + self.padding_x)
            .fold(self.padding_x * 2.0, f32::max);
        let height = row as f32 * row_height + self.spacing_vertical;

        let mut doc = Document::new()
            .set("viewBox", format!("0 0 {width} {height}"))
            .set("width", width)
            .set("height", height)
            .set("class", "markmap");

        for p in &placed {
            let style = &p.node.style;
            if let Some((px, py)) = p.parent {
                let data = Data::new()
                    .move_to((px, py))
                    .cubic_curve_to((px + self.spacing_horizontal / 2.0, py, p.x - self.spacing_horizontal / 2.0, p.y, p.x, p.y));
                doc = doc.add(
                    Path::new()
                        .set("d", data)
                        .set("fill", "none")
                        .set("stroke", style.branch_color.as_str())
                        .set("stroke-width", 1.5),
                );
            }
            if !p.node.children.is_empty() {
                let fill = if p.node.folded { style.branch_color.as_str() } else { "none" };
                doc = doc.add(
                    Circle::new()
                        .set("cx", p.x)
                        .set("cy", p.y)
                        .set("r", 4)
                        .set("fill", fill)
                        .set("stroke", style.branch_color.as_str()),
                );
            }
            doc = doc.add(
                Text::new(p.node.label.as_str())
                    .set("x", p.x + 8.0)
                    .set("y", p.y - 4.0)
                    .set("fill", style.text_fill.as_str())
                    .set("font-weight", style.font_weight.to_string()),
            );
        }

        Ok(doc.to_string())
    }
}

struct Placed<'a> {
    node: &'a OutlineNode,
    x: f32,
    y: f32,
    parent: Option<(f32, f32)>,
}

impl MarkdownOutlineEngine {
    fn label_width(&self, label: &str) -> f32 {
        (label.chars().count() as f32 * CHAR_WIDTH).min(self.max_width)
    }

    fn place<'a>(
        &self,
        node: &'a OutlineNode,
        x: f32,
        parent: Option<(f32, f32)>,
        row: &mut usize,
        out: &mut Vec<Placed<'a>>,
    ) {
        let y = (*row as f32 + 1.0) * (LINE_HEIGHT + self.spacing_vertical);
        *row += 1;
        out.push(Placed { node, x, y, parent });
        if node.folded {
            return;
        }
        let child_x = x + self.label_width(&node.label) + self.padding_x + self.spacing_horizontal;
        for child in &node.children {
            self.place(child, child_x, Some((x, y)), row, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(source: &str) -> OutlineTree {
        MarkdownOutlineEngine::default().transform(source).unwrap()
    }

    #[test]
    fn headings_and_bullets_nest() {
        let tree = transform(
            "# Project Root\n## Frontend\n### React Components\n- Header\n- Footer\n## Backend\n### Database\n- PostgreSQL",
        );
        let root = &tree.root;
        assert_eq!(root.label, "Project Root");
        assert_eq!(root.children.len(), 2);
        let components = &root.children[0].children[0];
        assert_eq!(components.label, "React Components");
        assert_eq!(components.children.len(), 2);
        assert_eq!(components.children[1].label, "Footer");
        assert_eq!(components.children[1].depth, 3);
        assert_eq!(tree.node_count(), 8);
    }

    #[test]
    fn nested_lists_follow_indentation() {
        let tree = transform("# Root\n- a\n  - a1\n  - a2\n- b");
        let a = &tree.root.children[0];
        assert_eq!(a.label, "a");
        assert_eq!(a.children.len(), 2);
        assert_eq!(tree.root.children[1].label, "b");
    }

    #[test]
    fn several_top_level_headings_share_a_synthetic_root() {
        let tree = transform("# One\n# Two");
        assert_eq!(tree.root.label, "");
        assert_eq!(tree.root.children.len(), 2);
        assert_eq!(tree.root.children[0].depth, 1);
    }

    #[test]
    fn collapse_below_only_folds_branches() {
        let mut tree = transform("# Root\n## A\n### A1\n## B");
        tree.collapse_below(1);
        assert!(!tree.root.folded);
        assert!(tree.node(&[0]).unwrap().folded);
        assert!(!tree.node(&[1]).unwrap().folded);
    }

    #[test]
    fn folded_children_are_not_laid_out() {
        let engine = MarkdownOutlineEngine::default();
        let mut tree = engine.transform("# Root\n## A\n### Hidden").unwrap();
        tree.collapse_below(1);
        let svg = engine.layout(&tree).unwrap();
        assert!(svg.contains("Root"));
        assert!(!svg.contains("Hidden"));
    }

    #[test]
    fn dark_fill_detection() {
        assert!(is_dark_fill("#333"));
        assert!(is_dark_fill("black"));
        assert!(!is_dark_fill("#ffffff"));
        assert!(!is_dark_fill("#5eead4"));
    }
}
