use scraper::{ElementRef, Html};

/// Deeper subtrees are dropped rather than walked.
const MAX_DEPTH: usize = 512;

/// Elements whose text never reaches the reader.
const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template"];

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element { tag: String, children: Vec<Node> },
    Text(String),
}

/// Parse markup into an owned node tree rooted at a synthetic `#document` element.
/// html5ever recovers from any input, so this never fails.
pub fn parse_document(html: &str) -> Node {
    let doc = Html::parse_document(html);
    let children = convert(doc.root_element(), 0).into_iter().collect();
    Node::Element {
        tag: "#document".to_string(),
        children,
    }
}

fn convert(el: ElementRef<'_>, depth: usize) -> Option<Node> {
    let tag = el.value().name().to_ascii_lowercase();
    if SKIPPED_TAGS.contains(&tag.as_str()) {
        return None;
    }
    let mut children = Vec::new();
    if depth < MAX_DEPTH {
        for child in el.children() {
            match child.value() {
                scraper::Node::Text(t) => {
                    let text: &str = t;
                    children.push(Node::Text(text.to_owned()));
                }
                scraper::Node::Element(_) => {
                    if let Some(node) = ElementRef::wrap(child).and_then(|c| convert(c, depth + 1)) {
                        children.push(node);
                    }
                }
                _ => {}
            }
        }
    }
    Some(Node::Element { tag, children })
}

impl Node {
    /// Raw text nodes in document order.
    pub fn text_nodes(&self) -> TextNodes<'_> {
        TextNodes { stack: vec![self] }
    }

    /// First element with `tag` in document order.
    pub fn find_first(&self, tag: &str) -> Option<&Node> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Node::Element { tag: t, children } = node {
                if t == tag {
                    return Some(node);
                }
                stack.extend(children.iter().rev());
            }
        }
        None
    }

    /// Concatenated text of this subtree.
    pub fn text(&self) -> String {
        self.text_nodes().collect()
    }
}

pub struct TextNodes<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for TextNodes<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        while let Some(node) = self.stack.pop() {
            match node {
                Node::Text(t) => return Some(t.as_str()),
                Node::Element { children, .. } => self.stack.extend(children.iter().rev()),
            }
        }
        None
    }
}

/// Collapse whitespace runs to one space and trim; empty-after-trim is `None`.
pub fn normalize(s: &str) -> Option<String> {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

// ── Tests ──
