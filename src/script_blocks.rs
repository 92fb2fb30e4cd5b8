//! Extraction of embedded executable-code tags from assistant text.
//!
//! The model embeds scripts as `<code>...</code>` spans inside otherwise
//! ordinary prose. Extraction yields the spans in order together with the
//! raw text that precedes each one, so the surrounding prose can be
//! displayed while the scripts run.

const OPEN_TAG: &str = "<code>";
const CLOSE_TAG: &str = "</code>";

/// One extracted script span. `code` is trimmed; `preceding_text` is the
/// raw text between the previous span (or start of input) and this one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScriptBlock {
    pub code: String,
    pub preceding_text: String,
}

/// Extract all well-formed tag pairs in order. If any blocks were found
/// and text remains after the last close tag, a final block with empty
/// code carries the trailing text.
pub fn extract_blocks(text: &str) -> Vec<ScriptBlock> {
    let mut blocks = Vec::new();
    let mut last_end = 0;

    let mut search_from = 0;
    while let Some(open_rel) = text[search_from..].find(OPEN_TAG) {
        let open = search_from + open_rel;
        let code_start = open + OPEN_TAG.len();
        let Some(close_rel) = text[code_start..].find(CLOSE_TAG) else {
            // Unterminated tag: not a well-formed pair
            break;
        };
        let close = code_start + close_rel;

        blocks.push(ScriptBlock {
            code: text[code_start..close].trim().to_string(),
            preceding_text: text[last_end..open].to_string(),
        });

        last_end = close + CLOSE_TAG.len();
        search_from = last_end;
    }

    if !blocks.is_empty() && last_end < text.len() {
        blocks.push(ScriptBlock {
            code: String::new(),
            preceding_text: text[last_end..].to_string(),
        });
    }

    blocks
}

/// Fast check without allocating blocks
pub fn has_blocks(text: &str) -> bool {
    match text.find(OPEN_TAG) {
        Some(open) => text[open + OPEN_TAG.len()..].contains(CLOSE_TAG),
        None => false,
    }
}

/// Remove exactly the tagged spans (tags included), leaving every other
/// character untouched
pub fn strip_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find(OPEN_TAG) {
        let after_open = &rest[open + OPEN_TAG.len()..];
        let Some(close) = after_open.find(CLOSE_TAG) else {
            break;
        };
        out.push_str(&rest[..open]);
        rest = &after_open[close + CLOSE_TAG.len()..];
    }
    out.push_str(rest);
    out
}
