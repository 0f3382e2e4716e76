//! Diagram syntax rules: single source of truth for system prompts and corrective instructions.

use crate::Dialect;

pub const FLOWCHART_RULES: &str = "\
1. Complete node definitions. Every node is fully defined on ONE line and every bracket \
is closed on the line that opens it (write CDNSvc[Content Delivery Network], never CDNSvc[Content).\n\
2. Node IDs start with a letter. IDs may contain letters, digits and underscores but never \
begin with a digit (Client, step1, node_1 are fine; 1Client, 2API are not).\n\
3. No parentheses in label text. Parentheses are shape syntax; inside a label they break \
the parser (write CDN[Content Delivery Network CDN], not CDN[Content Delivery Network (CDN)]).\n\
4. Comments live on their own line and start with %%. Never put a comment after a node or \
edge on the same line.\n\
5. One connection per line. Basic links are A --> B, labelled links are A -->|Label| B. \
Keep labels short and free of quotes.\n\
6. Start the block with a header such as `flowchart TD` or `graph LR`.";

pub const OUTLINE_RULES: &str = "\
1. Use markdown headings for hierarchy: # for the single root, ## for main branches, \
### and deeper for sub-branches (at most six levels).\n\
2. Use - bullet points for leaf items under a heading.\n\
3. Keep the structure 4-5 levels deep at most and group related concepts together.\n\
4. Keep every entry a short, descriptive phrase on a single line.";

/// Structural checklist for a dialect, restated in prompts and repair instructions.
pub fn rules_for(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Flowchart => FLOWCHART_RULES,
        Dialect::Outline => OUTLINE_RULES,
    }
}
