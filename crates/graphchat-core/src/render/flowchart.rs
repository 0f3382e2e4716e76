//! Built-in flowchart engine.
//!
//! Parses `flowchart`/`graph` source into nodes and edges, ranks them by
//! breadth-first distance from the entry nodes and draws a plain SVG.
//! Syntax errors are reported in the parser's usual shape:
//!
//! ```text
//! Parse error on line 2:
//! A[Start] --> B[Proc
//! -------------------^
//! Expecting 'SQE', got 'EOF'
//! ```

use std::collections::VecDeque;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use svg::node::element::{Definitions, Ellipse, Group, Line, Marker, Path, Polygon, Rectangle, Text};
use svg::Document;

use super::{EngineError, GraphEngine};

static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<?(?:-{2,}[>xo]|-{3,}|={2,}[>xo]|={3,}|-\.+-[>xo]?|~{3,})")
        .expect("valid link regex")
});
static TEXT_LINK_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<?(?:--|==|-\.)\s").expect("valid link opener regex"));
static TEXT_LINK_CLOSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-{2,}[>xo]|-{3,}|={2,}[>xo]|={3,}|\.-+[>xo]?").expect("valid link closer regex")
});

const DIRECTIVES: &[&str] = &[
    "direction", "classDef", "class", "style", "linkStyle", "click", "accTitle", "accDescr",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum Direction {
    #[default]
    TopDown,
    BottomUp,
    LeftRight,
    RightLeft,
}

impl Direction {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "TD" | "TB" | "v" => Some(Direction::TopDown),
            "BT" | "^" => Some(Direction::BottomUp),
            "LR" | ">" => Some(Direction::LeftRight),
            "RL" | "<" => Some(Direction::RightLeft),
            _ => None,
        }
    }

    fn horizontal(self) -> bool {
        matches!(self, Direction::LeftRight | Direction::RightLeft)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Shape {
    Rect,
    Round,
    Stadium,
    Subroutine,
    Cylinder,
    Circle,
    DoubleCircle,
    Asymmetric,
    Rhombus,
    Hexagon,
    Parallelogram,
}

/// Opener, accepted closers, shape, and the token reported when no closer is found.
const SHAPES: &[(&str, &[&str], Shape, &[&str])] = &[
    ("(((", &[")))"], Shape::DoubleCircle, &["DOUBLECIRCLEEND"]),
    ("((", &["))"], Shape::Circle, &["PE"]),
    ("([", &["])"], Shape::Stadium, &["STADIUMEND"]),
    ("[[", &["]]"], Shape::Subroutine, &["SUBROUTINEEND"]),
    ("[(", &[")]"], Shape::Cylinder, &["CYLINDEREND"]),
    ("[/", &["/]", "\\]"], Shape::Parallelogram, &["TRAPEND"]),
    ("[\\", &["\\]", "/]"], Shape::Parallelogram, &["INVTRAPEND"]),
    ("{{", &["}}"], Shape::Hexagon, &["DIAMOND_STOP"]),
    ("[", &["]"], Shape::Rect, &["SQE"]),
    ("(", &[")"], Shape::Round, &["PE"]),
    ("{", &["}"], Shape::Rhombus, &["DIAMOND_STOP"]),
    (">", &["]"], Shape::Asymmetric, &["SQE"]),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub shape: Shape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeStyle {
    Solid,
    Dotted,
    Thick,
    Invisible,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub style: EdgeStyle,
    pub arrow_head: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subgraph {
    pub id: String,
    pub title: String,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Flowchart {
    pub direction: Direction,
    pub nodes: IndexMap<String, Node>,
    pub edges: Vec<Edge>,
    pub subgraphs: Vec<Subgraph>,
}

/// Parse flowchart source. Errors carry the full parser message.
pub fn parse(source: &str) -> Result<Flowchart, EngineError> {
    let lines: Vec<&str> = source.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    let last = lines.len().saturating_sub(1);

    let header_at = header_line(&lines).ok_or_else(|| {
        EngineError::new(format!(
            "No diagram type detected matching given configuration for text: {source}"
        ))
    })?;

    let mut chart = Flowchart::default();
    let mut open_subgraphs: Vec<usize> = Vec::new();

    let header = lines[header_at].trim();
    let after_keyword = header
        .strip_prefix("flowchart-elk")
        .or_else(|| header.strip_prefix("flowchart"))
        .or_else(|| header.strip_prefix("graph"))
        .unwrap_or_default();
    let after_keyword = after_keyword.trim_start();
    let direction_token = after_keyword
        .split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or_default();
    let inline = match Direction::parse(direction_token) {
        Some(direction) => {
            chart.direction = direction;
            &after_keyword[direction_token.len()..]
        }
        None => after_keyword,
    };
    let inline = inline.trim_start().trim_start_matches(';');
    if !inline.trim().is_empty() {
        let mut ctx = LineContext {
            chart: &mut chart,
            open_subgraphs: &mut open_subgraphs,
        };
        ctx.statement_line(inline, header_at == last)
            .map_err(|e| e.into_engine_error(header_at + 1, inline))?;
    }

    for (index, line) in lines.iter().enumerate().skip(header_at + 1) {
        let mut ctx = LineContext {
            chart: &mut chart,
            open_subgraphs: &mut open_subgraphs,
        };
        ctx.statement_line(line, index == last)
            .map_err(|e| e.into_engine_error(index + 1, line))?;
    }

    if !open_subgraphs.is_empty() {
        let line = lines[last];
        let failure = SyntaxFailure {
            pos: line.len(),
            expected: &["end"],
            got: "EOF",
        };
        return Err(failure.into_engine_error(last + 1, line));
    }

    Ok(chart)
}

/// Index of the diagram header, skipping blank lines, comments and front matter.
fn header_line(lines: &[&str]) -> Option<usize> {
    let mut in_front_matter = false;
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed == "---" {
            in_front_matter = !in_front_matter;
            continue;
        }
        if in_front_matter || trimmed.is_empty() || trimmed.starts_with("%%") {
            continue;
        }
        let keyword = trimmed
            .split(|c: char| c.is_whitespace() || c == ';')
            .next()
            .unwrap_or_default();
        return matches!(keyword, "flowchart" | "graph" | "flowchart-elk").then_some(index);
    }
    None
}

struct SyntaxFailure {
    /// Byte offset in the line.
    pos: usize,
    expected: &'static [&'static str],
    got: &'static str,
}

impl SyntaxFailure {
    fn into_engine_error(self, line_no: usize, line: &str) -> EngineError {
        let pos = self.pos.min(line.len());
        let column = line[..pos].chars().count();
        let (echo, column) = if column > 50 {
            let skip = column - 40;
            let tail: String = line.chars().skip(skip).collect();
            (format!("...{tail}"), 43)
        } else {
            (line.to_string(), column)
        };
        let expected = self
            .expected
            .iter()
            .map(|e| format!("'{e}'"))
            .collect::<Vec<_>>()
            .join(", ");
        EngineError::new(format!(
            "Parse error on line {line_no}:\n{echo}\n{}^\nExpecting {expected}, got '{}'",
            "-".repeat(column),
            self.got
        ))
    }
}

struct Cursor<'a> {
    line: &'a str,
    pos: usize,
    last_line: bool,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.line.len()
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn token_here(&self) -> &'static str {
        match self.peek() {
            None if self.last_line => "EOF",
            None => "NEWLINE",
            Some('(') => "PS",
            Some(')') => "PE",
            Some('[') => "SQS",
            Some(']') => "SQE",
            Some('{') => "DIAMOND_START",
            Some('}') => "DIAMOND_STOP",
            Some('|') => "PIPE",
            Some(c) if c.is_ascii_digit() => "NUM",
            Some(_) => "STR",
        }
    }

    fn fail(&self, expected: &'static [&'static str]) -> SyntaxFailure {
        SyntaxFailure {
            pos: self.pos,
            expected,
            got: self.token_here(),
        }
    }
}

struct LineContext<'c> {
    chart: &'c mut Flowchart,
    open_subgraphs: &'c mut Vec<usize>,
}

impl LineContext<'_> {
    fn statement_line(&mut self, line: &str, last_line: bool) -> Result<(), SyntaxFailure> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("%%") {
            return Ok(());
        }

        let keyword = trimmed.split_whitespace().next().unwrap_or_default();
        match keyword {
            "subgraph" => {
                self.open_subgraph(trimmed["subgraph".len()..].trim());
                return Ok(());
            }
            "end" => {
                if self.open_subgraphs.pop().is_none() {
                    let pos = line.len() - line.trim_start().len();
                    return Err(SyntaxFailure {
                        pos,
                        expected: &["NODE_STRING"],
                        got: "end",
                    });
                }
                return Ok(());
            }
            k if DIRECTIVES.contains(&k) => return Ok(()),
            _ => {}
        }

        let mut cur = Cursor {
            line,
            pos: 0,
            last_line,
        };
        loop {
            cur.skip_ws();
            if cur.at_end() {
                return Ok(());
            }
            self.chain(&mut cur)?;
            cur.skip_ws();
            if cur.at_end() {
                return Ok(());
            }
            if !cur.eat(";") {
                return Err(SyntaxFailure {
                    pos: cur.pos,
                    expected: &["SEMI", "NEWLINE", "EOF"],
                    got: "STR",
                });
            }
        }
    }

    fn open_subgraph(&mut self, rest: &str) {
        let (id, title) = match rest.split_once('[') {
            Some((id, title)) => (id.trim(), title.trim_end_matches(']').trim()),
            None => (rest, rest),
        };
        let title = title.trim_matches('"');
        let id = if id.is_empty() {
            format!("subgraph{}", self.chart.subgraphs.len())
        } else {
            id.to_string()
        };
        self.chart.subgraphs.push(Subgraph {
            id,
            title: title.to_string(),
            nodes: Vec::new(),
        });
        self.open_subgraphs.push(self.chart.subgraphs.len() - 1);
    }

    /// `group (link group)*` where a group is `node (& node)*`.
    fn chain(&mut self, cur: &mut Cursor<'_>) -> Result<(), SyntaxFailure> {
        let mut sources = self.group(cur)?;
        loop {
            cur.skip_ws();
            let Some(link) = parse_link(cur)? else {
                return Ok(());
            };
            cur.skip_ws();
            let targets = self.group(cur)?;
            for from in &sources {
                for to in &targets {
                    self.chart.edges.push(Edge {
                        from: from.clone(),
                        to: to.clone(),
                        label: link.label.clone(),
                        style: link.style,
                        arrow_head: link.arrow_head,
                    });
                }
            }
            sources = targets;
        }
    }

    fn group(&mut self, cur: &mut Cursor<'_>) -> Result<Vec<String>, SyntaxFailure> {
        let mut ids = vec![self.node(cur)?];
        loop {
            let save = cur.pos;
            cur.skip_ws();
            if cur.eat("&") {
                cur.skip_ws();
                ids.push(self.node(cur)?);
            } else {
                cur.pos = save;
                return Ok(ids);
            }
        }
    }

    fn node(&mut self, cur: &mut Cursor<'_>) -> Result<String, SyntaxFailure> {
        if cur.peek().is_some_and(|c| c.is_ascii_digit()) {
            return Err(cur.fail(&["NODE_STRING"]));
        }
        let id = scan_id(cur);
        if id.is_empty() {
            return Err(cur.fail(&["NODE_STRING"]));
        }

        let shape = parse_shape(cur)?;

        if cur.eat(":::") {
            scan_id(cur);
        }

        let id = id.to_string();
        match (self.chart.nodes.get_mut(&id), shape) {
            (Some(existing), Some((shape, label))) => {
                existing.shape = shape;
                existing.label = label;
            }
            (Some(_), None) => {}
            (None, shape) => {
                let (shape, label) = shape.unwrap_or_else(|| (Shape::Rect, id.clone()));
                self.chart.nodes.insert(
                    id.clone(),
                    Node {
                        id: id.clone(),
                        label,
                        shape,
                    },
                );
                if let Some(&sub) = self.open_subgraphs.last() {
                    self.chart.subgraphs[sub].nodes.push(id.clone());
                }
            }
        }
        Ok(id)
    }
}

fn scan_id<'a>(cur: &mut Cursor<'a>) -> &'a str {
    let start = cur.pos;
    while let Some(c) = cur.peek() {
        let id_char = c.is_alphanumeric() || c == '_' || c == '-';
        if !id_char || (c == '-' && is_link_start(cur.rest())) {
            break;
        }
        cur.pos += c.len_utf8();
    }
    &cur.line[start..cur.pos]
}

fn is_link_start(rest: &str) -> bool {
    LINK.is_match(rest) || TEXT_LINK_OPEN.is_match(rest)
}

fn parse_shape(cur: &mut Cursor<'_>) -> Result<Option<(Shape, String)>, SyntaxFailure> {
    let Some(&(opener, closers, shape, expected)) = SHAPES
        .iter()
        .find(|(opener, ..)| cur.rest().starts_with(opener))
    else {
        return Ok(None);
    };
    cur.pos += opener.len();

    let label = if cur.rest().trim_start().starts_with('"') {
        cur.skip_ws();
        cur.pos += 1;
        let Some(end) = cur.rest().find('"') else {
            cur.pos = cur.line.len();
            return Err(cur.fail(&["STR"]));
        };
        let label = cur.rest()[..end].to_string();
        cur.pos += end + 1;
        cur.skip_ws();
        label
    } else {
        let start = cur.pos;
        loop {
            if closer_at(cur, closers).is_some() {
                break;
            }
            match cur.peek() {
                None => return Err(cur.fail(expected)),
                Some('(') | Some(')') => return Err(cur.fail(expected)),
                Some('[') if opener.starts_with('[') => return Err(cur.fail(expected)),
                Some(c) => cur.pos += c.len_utf8(),
            }
        }
        cur.line[start..cur.pos].trim().to_string()
    };

    match closer_at(cur, closers) {
        Some(closer) => {
            cur.pos += closer.len();
            Ok(Some((shape, label)))
        }
        None => Err(cur.fail(expected)),
    }
}

fn closer_at(cur: &Cursor<'_>, closers: &'static [&'static str]) -> Option<&'static str> {
    closers.iter().find(|c| cur.rest().starts_with(**c)).copied()
}

struct Link {
    label: Option<String>,
    style: EdgeStyle,
    arrow_head: bool,
}

impl Link {
    fn from_token(token: &str, label: Option<String>) -> Self {
        let style = if token.contains('=') {
            EdgeStyle::Thick
        } else if token.contains('.') {
            EdgeStyle::Dotted
        } else if token.contains('~') {
            EdgeStyle::Invisible
        } else {
            EdgeStyle::Solid
        };
        Link {
            label,
            style,
            arrow_head: token.ends_with('>'),
        }
    }
}

fn parse_link(cur: &mut Cursor<'_>) -> Result<Option<Link>, SyntaxFailure> {
    if let Some(m) = LINK.find(cur.rest()) {
        let token = m.as_str();
        cur.pos += m.end();
        let label = pipe_label(cur)?;
        return Ok(Some(Link::from_token(token, label)));
    }

    if let Some(open) = TEXT_LINK_OPEN.find(cur.rest()) {
        cur.pos += open.end();
        let Some(close) = TEXT_LINK_CLOSE.find(cur.rest()) else {
            cur.pos = cur.line.len();
            return Err(cur.fail(&["LINK"]));
        };
        let label = cur.rest()[..close.start()].trim().to_string();
        let token = format!("{}{}", open.as_str().trim(), close.as_str());
        cur.pos += close.end();
        return Ok(Some(Link::from_token(&token, Some(label))));
    }

    Ok(None)
}

fn pipe_label(cur: &mut Cursor<'_>) -> Result<Option<String>, SyntaxFailure> {
    let save = cur.pos;
    cur.skip_ws();
    if !cur.eat("|") {
        cur.pos = save;
        return Ok(None);
    }
    match cur.rest().find('|') {
        Some(end) => {
            let label = cur.rest()[..end].trim().trim_matches('"').to_string();
            cur.pos += end + 1;
            Ok(Some(label))
        }
        None => {
            cur.pos = cur.line.len();
            Err(cur.fail(&["PIPE"]))
        }
    }
}

mod theme {
    pub const NODE_FILL: &str = "#14b8a6";
    pub const NODE_STROKE: &str = "#0d9488";
    pub const LINE: &str = "#6b7280";
    pub const TEXT: &str = "#ffffff";
    pub const EDGE_TEXT: &str = "#d1d5db";
    pub const CLUSTER_FILL: &str = "#1f2937";
    pub const CLUSTER_STROKE: &str = "#374151";
}

/// Parses and lays out flowcharts.
#[derive(Debug, Clone)]
pub struct FlowchartEngine {
    pub node_height: f32,
    pub rank_gap: f32,
    pub sibling_gap: f32,
    pub margin: f32,
}

impl Default for FlowchartEngine {
    fn default() -> Self {
        Self {
            node_height: 44.0,
            rank_gap: 60.0,
            sibling_gap: 30.0,
            margin: 24.0,
        }
    }
}

impl GraphEngine for FlowchartEngine {
    fn render_graph(&self, source: &str) -> Result<String, EngineError> {
        let chart = parse(source)?;
        Ok(self.draw(&chart))
    }
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
}

impl FlowchartEngine {
    fn node_width(label: &str) -> f32 {
        (label.chars().count() as f32 * 8.0 + 32.0).max(80.0)
    }

    /// Breadth-first rank per node, entry nodes (no incoming edges) first.
    fn ranks(chart: &Flowchart) -> Vec<usize> {
        let n = chart.nodes.len();
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        for edge in &chart.edges {
            if let (Some(a), Some(b)) = (
                chart.nodes.get_index_of(&edge.from),
                chart.nodes.get_index_of(&edge.to),
            ) {
                outgoing[a].push(b);
                indegree[b] += 1;
            }
        }

        let mut rank = vec![0usize; n];
        let mut seen = vec![false; n];
        let entries = (0..n).filter(|&i| indegree[i] == 0).chain(0..n);
        for start in entries {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            let mut queue = VecDeque::from([start]);
            while let Some(u) = queue.pop_front() {
                for &v in &outgoing[u] {
                    if !seen[v] {
                        seen[v] = true;
                        rank[v] = rank[u] + 1;
                        queue.push_back(v);
                    }
                }
            }
        }
        rank
    }

    fn place(&self, chart: &Flowchart) -> (Vec<Placement>, f32, f32) {
        let ranks = Self::ranks(chart);
        let max_rank = ranks.iter().copied().max().unwrap_or(0);
        let cell_w = chart
            .nodes
            .values()
            .map(|n| Self::node_width(&n.label))
            .fold(80.0, f32::max);
        let cell_h = self.node_height;

        let mut slot = vec![0usize; max_rank + 1];
        let mut placed = Vec::with_capacity(chart.nodes.len());
        let (mut width, mut height) = (self.margin * 2.0, self.margin * 2.0);

        for (i, node) in chart.nodes.values().enumerate() {
            let order = slot[ranks[i]];
            slot[ranks[i]] += 1;
            let level = match chart.direction {
                Direction::BottomUp | Direction::RightLeft => max_rank - ranks[i],
                _ => ranks[i],
            };
            let (cx, cy) = if chart.direction.horizontal() {
                (
                    self.margin + level as f32 * (cell_w + self.rank_gap) + cell_w / 2.0,
                    self.margin + order as f32 * (cell_h + self.sibling_gap) + cell_h / 2.0,
                )
            } else {
                (
                    self.margin + order as f32 * (cell_w + self.sibling_gap) + cell_w / 2.0,
                    self.margin + level as f32 * (cell_h + self.rank_gap) + cell_h / 2.0,
                )
            };
            let p = Placement {
                cx,
                cy,
                w: Self::node_width(&node.label),
                h: cell_h,
            };
            width = width.max(cx + cell_w / 2.0 + self.margin);
            height = height.max(cy + cell_h / 2.0 + self.margin);
            placed.push(p);
        }
        (placed, width, height)
    }

    fn draw(&self, chart: &Flowchart) -> String {
        let (placed, width, height) = self.place(chart);

        let marker = Marker::new()
            .set("id", "arrowhead")
            .set("viewBox", "0 0 10 10")
            .set("refX", 9)
            .set("refY", 5)
            .set("markerWidth", 6)
            .set("markerHeight", 6)
            .set("orient", "auto")
            .add(
                Path::new()
                    .set("d", "M 0 0 L 10 5 L 0 10 z")
                    .set("fill", theme::LINE),
            );

        let mut doc = Document::new()
            .set("viewBox", format!("0 0 {width} {height}"))
            .set("width", width)
            .set("height", height)
            .set("class", "flowchart")
            .add(Definitions::new().add(marker));

        for sub in &chart.subgraphs {
            if let Some(cluster) = self.draw_cluster(chart, &placed, sub) {
                doc = doc.add(cluster);
            }
        }

        for edge in &chart.edges {
            let (Some(a), Some(b)) = (
                chart.nodes.get_index_of(&edge.from),
                chart.nodes.get_index_of(&edge.to),
            ) else {
                continue;
            };
            doc = doc.add(Self::draw_edge(edge, placed[a], placed[b]));
        }

        for (node, p) in chart.nodes.values().zip(&placed) {
            doc = doc.add(Self::draw_node(node, *p));
        }

        doc.to_string()
    }

    fn draw_cluster(&self, chart: &Flowchart, placed: &[Placement], sub: &Subgraph) -> Option<Group> {
        let members: Vec<Placement> = sub
            .nodes
            .iter()
            .filter_map(|id| chart.nodes.get_index_of(id))
            .map(|i| placed[i])
            .collect();
        if members.is_empty() {
            return None;
        }
        let pad = 12.0;
        let x0 = members.iter().map(|p| p.cx - p.w / 2.0).fold(f32::MAX, f32::min) - pad;
        let y0 = members.iter().map(|p| p.cy - p.h / 2.0).fold(f32::MAX, f32::min) - pad - 14.0;
        let x1 = members.iter().map(|p| p.cx + p.w / 2.0).fold(f32::MIN, f32::max) + pad;
        let y1 = members.iter().map(|p| p.cy + p.h / 2.0).fold(f32::MIN, f32::max) + pad;

        Some(
            Group::new()
                .set("class", "cluster")
                .add(
                    Rectangle::new()
                        .set("x", x0)
                        .set("y", y0)
                        .set("width", x1 - x0)
                        .set("height", y1 - y0)
                        .set("rx", 6)
                        .set("fill", theme::CLUSTER_FILL)
                        .set("stroke", theme::CLUSTER_STROKE),
                )
                .add(
                    Text::new(sub.title.as_str())
                        .set("x", x0 + 8.0)
                        .set("y", y0 + 14.0)
                        .set("fill", theme::EDGE_TEXT)
                        .set("font-size", 12),
                ),
        )
    }

    fn draw_edge(edge: &Edge, from: Placement, to: Placement) -> Group {
        let mut line = Line::new()
            .set("x1", from.cx)
            .set("y1", from.cy)
            .set("x2", to.cx)
            .set("y2", to.cy)
            .set("stroke", theme::LINE);
        line = match edge.style {
            EdgeStyle::Solid => line.set("stroke-width", 1.5),
            EdgeStyle::Thick => line.set("stroke-width", 3),
            EdgeStyle::Dotted => line.set("stroke-width", 1.5).set("stroke-dasharray", "3 3"),
            EdgeStyle::Invisible => line.set("stroke-opacity", 0),
        };
        if edge.arrow_head {
            line = line.set("marker-end", "url(#arrowhead)");
        }

        let mut group = Group::new().set("class", "edge").add(line);
        if let Some(label) = edge.label.as_deref().filter(|l| !l.is_empty()) {
            group = group.add(
                Text::new(label)
                    .set("x", (from.cx + to.cx) / 2.0)
                    .set("y", (from.cy + to.cy) / 2.0 - 4.0)
                    .set("text-anchor", "middle")
                    .set("fill", theme::EDGE_TEXT)
                    .set("font-size", 12),
            );
        }
        group
    }

    fn draw_node(node: &Node, p: Placement) -> Group {
        let (x, y, w, h) = (p.cx - p.w / 2.0, p.cy - p.h / 2.0, p.w, p.h);
        let mut group = Group::new().set("class", "node").set("id", node.id.as_str());

        group = match node.shape {
            Shape::Circle | Shape::DoubleCircle => group.add(
                Ellipse::new()
                    .set("cx", p.cx)
                    .set("cy", p.cy)
                    .set("rx", w / 2.0)
                    .set("ry", h / 2.0)
                    .set("fill", theme::NODE_FILL)
                    .set("stroke", theme::NODE_STROKE),
            ),
            Shape::Rhombus | Shape::Hexagon | Shape::Parallelogram | Shape::Asymmetric => {
                let points = match node.shape {
                    Shape::Rhombus => format!(
                        "{},{} {},{} {},{} {},{}",
                        p.cx, y, x + w, p.cy, p.cx, y + h, x, p.cy
                    ),
                    Shape::Hexagon => format!(
                        "{},{} {},{} {},{} {},{} {},{} {},{}",
                        x + 12.0, y, x + w - 12.0, y, x + w, p.cy, x + w - 12.0, y + h, x + 12.0, y + h, x, p.cy
                    ),
                    Shape::Asymmetric => format!(
                        "{},{} {},{} {},{} {},{} {},{}",
                        x, y, x + w, y, x + w, y + h, x, y + h, x + 12.0, p.cy
                    ),
                    _ => format!(
                        "{},{} {},{} {},{} {},{}",
                        x + 12.0, y, x + w, y, x + w - 12.0, y + h, x, y + h
                    ),
                };
                group.add(
                    Polygon::new()
                        .set("points", points)
                        .set("fill", theme::NODE_FILL)
                        .set("stroke", theme::NODE_STROKE),
                )
            }
            shape => {
                let rx = match shape {
                    Shape::Round => 8.0,
                    Shape::Stadium | Shape::Cylinder => h / 2.0,
                    _ => 2.0,
                };
                group.add(
                    Rectangle::new()
                        .set("x", x)
                        .set("y", y)
                        .set("width", w)
                        .set("height", h)
                        .set("rx", rx)
                        .set("fill", theme::NODE_FILL)
                        .set("stroke", theme::NODE_STROKE),
                )
            }
        };

        group.add(
            Text::new(node.label.as_str())
                .set("x", p.cx)
                .set("y", p.cy + 4.0)
                .set("text-anchor", "middle")
                .set("fill", theme::TEXT)
                .set("font-size", 14),
        )
    }
}
