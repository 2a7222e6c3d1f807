use crate::{
    ast::{Node, NodeKind},
    optimizer::for_each_body,
};

/// A structural HTML element found in a block's literal text.
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Landmark {
    Nav,
    Main,
    Article,
    Header,
    Footer,
    Aside,
}

impl Landmark {
    const ALL: [Self; 6] = [
        Self::Nav,
        Self::Main,
        Self::Article,
        Self::Header,
        Self::Footer,
        Self::Aside,
    ];

    pub const fn tag(self) -> &'static str {
        match self {
            Self::Nav => "nav",
            Self::Main => "main",
            Self::Article => "article",
            Self::Header => "header",
            Self::Footer => "footer",
            Self::Aside => "aside",
        }
    }

    /// The ARIA role equivalent to the element.
    const fn aria_role(self) -> &'static str {
        match self {
            Self::Nav => "navigation",
            Self::Main => "main",
            Self::Article => "article",
            Self::Header => "banner",
            Self::Footer => "contentinfo",
            Self::Aside => "complementary",
        }
    }

    const fn role(self) -> Role {
        match self {
            Self::Nav => Role::Navigation,
            Self::Main | Self::Article => Role::Content,
            Self::Header => Role::Header,
            Self::Footer => Role::Footer,
            Self::Aside => Role::Sidebar,
        }
    }
}

/// What part of a page a block most likely renders.
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    Navigation,
    Content,
    Sidebar,
    Header,
    Footer,
    #[default]
    Unknown,
}

/// Result of scanning a block body.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub(crate) emits_output: bool,
    /// Landmarks in document order, first occurrence only.
    pub(crate) order: Vec<Landmark>,
}

/// Scans the literal text of `nodes` in document order. Macro definitions
/// are skipped since they render nothing where they are defined.
pub(crate) fn scan(nodes: &[Node]) -> Scan {
    let mut scan = Scan::default();
    let mut stack: Vec<&Node> = nodes.iter().rev().collect();
    while let Some(node) = stack.pop() {
        match &node.kind {
            NodeKind::Def { .. } => continue,
            NodeKind::Data(text) => {
                scan.emits_output |= !text.trim().is_empty();
                for landmark in landmarks_in(text) {
                    if !scan.order.contains(&landmark) {
                        scan.order.push(landmark);
                    }
                }
            }
            NodeKind::Output(_)
            | NodeKind::Include { .. }
            | NodeKind::CallBlock { .. }
            | NodeKind::Slot => scan.emits_output = true,
            _ => {}
        }
        let mut children = Vec::new();
        for_each_body(&node.kind, |body| children.extend(body.iter()));
        stack.extend(children.into_iter().rev());
    }
    scan
}

/// Landmarks opened in `text`, in order of appearance.
fn landmarks_in(text: &str) -> Vec<Landmark> {
    let lower = text.to_ascii_lowercase();
    let mut found: Vec<(usize, Landmark)> = Vec::new();
    for landmark in Landmark::ALL {
        let tag = format!("<{}", landmark.tag());
        let role = format!("role=\"{}\"", landmark.aria_role());
        let tag_at = lower.match_indices(&tag).find_map(|(at, _)| {
            let next = lower
                .get(at.saturating_add(tag.len())..)
                .and_then(|rest| rest.chars().next());
            next.is_none_or(|c| c == '>' || c == '/' || c.is_whitespace())
                .then_some(at)
        });
        let role_at = lower.find(&role);
        if let Some(at) = tag_at.into_iter().chain(role_at).min() {
            found.push((at, landmark));
        }
    }
    found.sort_unstable();
    found.into_iter().map(|(_, landmark)| landmark).collect()
}

/// Role from the first landmark, or failing that from the block's name.
pub(crate) fn infer_role(block: &str, landmarks: &[Landmark]) -> Role {
    if let Some(first) = landmarks.first() {
        return first.role();
    }
    let name = block.to_ascii_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| name.contains(w));
    if has(&["footer"]) {
        Role::Footer
    } else if has(&["header", "banner", "masthead"]) {
        Role::Header
    } else if has(&["sidebar", "aside"]) {
        Role::Sidebar
    } else if has(&["nav", "menu", "breadcrumb", "toc"]) {
        Role::Navigation
    } else if has(&["content", "main", "article", "body", "post"]) {
        Role::Content
    } else {
        Role::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::parse_ast;

    #[test]
    #[ntest::timeout(100)]
    fn test_tags_in_document_order() {
        assert_eq!(
            landmarks_in("<HEADER class=\"top\"><nav>x</nav></header><main>"),
            [Landmark::Header, Landmark::Nav, Landmark::Main]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_similar_tags_are_not_landmarks() {
        assert!(landmarks_in("<navbar><mainframe><header-logo>").is_empty());
        assert!(landmarks_in("<head><title>x</title></head>").is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tag_at_end_of_text() {
        assert_eq!(landmarks_in("<p>café</p><nav"), [Landmark::Nav]);
        assert_eq!(landmarks_in("ünïcode <aside/>"), [Landmark::Aside]);
        assert!(landmarks_in("<").is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_aria_roles_count() {
        assert_eq!(landmarks_in("<div role=\"navigation\">"), [Landmark::Nav]);
        assert_eq!(
            landmarks_in("<div role=\"contentinfo\"></div>"),
            [Landmark::Footer]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_scan_walks_nested_bodies_in_order() {
        let ast = parse_ast(
            "{% if x %}<aside>{% endif %}{% for i in xs %}<footer>{% end %}\
             {% def m() %}<nav>{% enddef %}",
        );
        let scan = scan(&ast.body);
        assert!(scan.emits_output);
        assert_eq!(scan.order, [Landmark::Aside, Landmark::Footer]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_whitespace_only_emits_nothing() {
        let ast = parse_ast("  \n {% let a = 1 %} ");
        assert!(!scan(&ast.body).emits_output);
        let ast = parse_ast("{{ a }}");
        assert!(scan(&ast.body).emits_output);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_role_inference() {
        assert_eq!(infer_role("anything", &[Landmark::Aside, Landmark::Nav]), Role::Sidebar);
        assert_eq!(infer_role("site_footer", &[]), Role::Footer);
        assert_eq!(infer_role("main_nav", &[]), Role::Navigation);
        assert_eq!(infer_role("content", &[]), Role::Content);
        assert_eq!(infer_role("scripts", &[]), Role::Unknown);
    }
}
