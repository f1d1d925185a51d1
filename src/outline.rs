//! Plain-text outline of a forest, one indented block per comment.

use textwrap::{wrap, Options as WrapOptions};

use crate::tree::{CommentNode, Forest, NodeId, Placeholder};

#[derive(Debug, Clone, Copy)]
pub struct OutlineOptions {
    pub width: usize,
    pub indent: usize,
}

impl Default for OutlineOptions {
    fn default() -> Self {
        Self {
            width: 100,
            indent: 2,
        }
    }
}

enum Step<'a> {
    Node(NodeId),
    More(&'a Placeholder, usize),
}

pub fn render(forest: &Forest, opts: &OutlineOptions) -> Vec<String> {
    let mut lines = Vec::new();
    let mut stack: Vec<Step<'_>> = Vec::new();
    if let Some(more) = forest.root_placeholder() {
        stack.push(Step::More(more, 0));
    }
    stack.extend(forest.roots().iter().rev().map(|id| Step::Node(*id)));

    while let Some(step) = stack.pop() {
        match step {
            Step::Node(id) => {
                let Some(node) = forest.node(id) else {
                    continue;
                };
                lines.extend(comment_lines(node, opts));
                if let Some(more) = node.placeholder.pending() {
                    stack.push(Step::More(more, node.depth + 1));
                }
                stack.extend(node.children.iter().rev().map(|child| Step::Node(*child)));
            }
            Step::More(more, depth) => {
                let prefix = " ".repeat(opts.indent * depth);
                let marker = if more.is_continuation { "→" } else { "+" };
                lines.push(format!("{prefix}[{marker}] {}", more.label()));
            }
        }
    }
    lines
}

fn comment_lines(node: &CommentNode, opts: &OutlineOptions) -> Vec<String> {
    let indent_units = " ".repeat(opts.indent * node.depth);
    let body_prefix = format!("{indent_units}  ");

    let author = if node.payload.author.trim().is_empty() {
        "[deleted]"
    } else {
        node.payload.author.as_str()
    };
    let score = node.payload.score;
    let mut lines = wrap_with_prefix(
        &format!("· {author} · {score} points"),
        opts.width,
        &indent_units,
    );

    if node.payload.body.trim().is_empty() {
        lines.extend(wrap_with_prefix("(no comment body)", opts.width, &body_prefix));
        return lines;
    }
    for raw_line in node.payload.body.lines() {
        if raw_line.trim().is_empty() {
            lines.push(String::new());
            continue;
        }
        lines.extend(wrap_with_prefix(raw_line.trim(), opts.width, &body_prefix));
    }
    lines
}

fn wrap_with_prefix(text: &str, width: usize, prefix: &str) -> Vec<String> {
    if width == 0 {
        return vec![format!("{prefix}{text}")];
    }
    let wrap_width = width.max(prefix.chars().count() + 1);
    let options = WrapOptions::new(wrap_width)
        .break_words(false)
        .initial_indent(prefix)
        .subsequent_indent(prefix);
    wrap(text, options)
        .into_iter()
        .map(|cow| cow.into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graft::{Batch, ReplyRecord};
    use crate::resolve::populate;
    use crate::tree::{Anchor, ParentRef, Payload};

    fn payload(author: &str, body: &str) -> Payload {
        Payload {
            author: author.into(),
            body: body.into(),
            score: 2,
            created_utc: 0.0,
        }
    }

    #[test]
    fn renders_indentation_and_placeholders() {
        let (forest, _) = populate(Batch::new(
            vec![
                ReplyRecord::new("1", ParentRef::Post, 0)
                    .with_payload(payload("alice", "top level"))
                    .with_more(Placeholder::continue_thread("c1", Anchor::Node("1".into()))),
                ReplyRecord::reply_to("2", "1", 1).with_payload(payload("", "reply")),
            ],
            Some(Placeholder::new("m", Anchor::Root, 3)),
        ));
        let lines = render(&forest, &OutlineOptions::default());
        assert_eq!(
            lines,
            vec![
                "· alice · 2 points",
                "  top level",
                "  · [deleted] · 2 points",
                "    reply",
                "  [→] continue this thread",
                "[+] 3 more replies",
            ]
        );
    }

    #[test]
    fn wraps_long_bodies_under_prefix() {
        let (forest, _) = populate(Batch::new(
            vec![ReplyRecord::new("1", ParentRef::Post, 0)
                .with_payload(payload("bob", "one two three four five six"))],
            None,
        ));
        let lines = render(
            &forest,
            &OutlineOptions {
                width: 20,
                indent: 2,
            },
        );
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "· bob · 2 points");
        assert!(lines[1..].iter().all(|line| line.starts_with("  ")));
    }

    #[test]
    fn empty_body_is_marked() {
        let (forest, _) = populate(Batch::new(
            vec![ReplyRecord::new("1", ParentRef::Post, 0).with_payload(payload("carol", " "))],
            None,
        ));
        let lines = render(&forest, &OutlineOptions::default());
        assert_eq!(lines[1], "  (no comment body)");
    }
}
