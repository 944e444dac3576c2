//! Element lookup helpers over a parsed envelope document.

use roxmltree::Node;

/// Namespace every envelope root is expected to declare.
pub const NAMESPACE: &str = "http://agent-orchestra.local/protocol/1.0";

/// Root element name.
pub const ROOT: &str = "agent-message";

/// Protocol version accepted by this crate.
pub const VERSION: &str = "1.0";

/// First element child with the given local name.
pub fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

/// Element children, in document order.
pub fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|c| c.is_element())
}

/// Trimmed text content, `None` when blank.
pub fn text<'a>(node: Node<'a, '_>) -> Option<&'a str> {
    node.text().map(str::trim).filter(|t| !t.is_empty())
}

/// An element counts as present when it has element children or non-blank text.
pub fn is_present(node: Node<'_, '_>) -> bool {
    elements(node).next().is_some() || text(node).is_some()
}

/// Child element that is present in the sense of [`is_present`].
pub fn present_child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    child(node, name).filter(|c| is_present(*c))
}

/// Trimmed text of a child element.
pub fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(text)
}

/// Body content node: either a wrapper named after the body type, or the body itself.
pub fn body_content<'a, 'input>(body: Node<'a, 'input>, body_type: &str) -> Node<'a, 'input> {
    child(body, body_type).unwrap_or(body)
}

/// One-based (line, column) of a node's start tag.
pub fn position(node: Node<'_, '_>) -> (u32, u32) {
    let pos = node.document().text_pos_at(node.range().start);
    (pos.row, pos.col)
}

/// Escape text for inclusion in element content.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_rules() {
        let doc = roxmltree::Document::parse(
            "<root><empty/><blank>   </blank><value> x </value><nested><a>1</a></nested></root>",
        )
        .unwrap();
        let root = doc.root_element();

        assert!(child(root, "empty").is_some());
        assert!(present_child(root, "empty").is_none());
        assert!(present_child(root, "blank").is_none());
        assert_eq!(child_text(root, "value"), Some("x"));
        assert!(present_child(root, "nested").is_some());
        assert!(child(root, "missing").is_none());
    }

    #[test]
    fn test_position_is_one_based() {
        let doc = roxmltree::Document::parse("<root>\n  <item/>\n</root>").unwrap();
        let item = child(doc.root_element(), "item").unwrap();
        assert_eq!(position(item), (2, 3));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a < b & \"c\""), "a &lt; b &amp; &quot;c&quot;");
    }
}
