pub const CITATION_OPEN: &str = "【†";
pub const CITATION_CLOSE: &str = "†】";

/// Rewrites the agent's citation anchors (`【†3†】`) into plain brackets
/// (`[3]`). Only well-formed pairs are rewritten; a stray opening or closing
/// marker is kept verbatim.
pub fn normalize_citation_markers(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open_at) = rest.find(CITATION_OPEN) {
        output.push_str(&rest[..open_at]);
        let after_open = &rest[open_at + CITATION_OPEN.len()..];

        let close_at = after_open.find(CITATION_CLOSE);
        let next_open_at = after_open.find(CITATION_OPEN);
        match close_at {
            Some(close_at) if next_open_at.map_or(true, |next| close_at < next) => {
                output.push('[');
                output.push_str(&after_open[..close_at]);
                output.push(']');
                rest = &after_open[close_at + CITATION_CLOSE.len()..];
            }
            _ => {
                output.push_str(CITATION_OPEN);
                rest = after_open;
            }
        }
    }

    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::normalize_citation_markers;

    #[test]
    fn rewrites_well_formed_anchor() {
        assert_eq!(normalize_citation_markers("Result 【†3†】 shown"), "Result [3] shown");
    }

    #[test]
    fn rewrites_every_pair() {
        assert_eq!(
            normalize_citation_markers("a【†1†】 b【†2†】【†3†】"),
            "a[1] b[2][3]"
        );
    }

    #[test]
    fn unmatched_markers_pass_through() {
        assert_eq!(normalize_citation_markers("open 【†3 only"), "open 【†3 only");
        assert_eq!(normalize_citation_markers("close 3†】 only"), "close 3†】 only");
        assert_eq!(normalize_citation_markers("【†a 【†b†】"), "【†a [b]");
    }

    #[test]
    fn text_without_markers_is_unchanged() {
        assert_eq!(normalize_citation_markers("Revenue grew"), "Revenue grew");
        assert_eq!(normalize_citation_markers(""), "");
    }
}
