// Post-processing of model output before it is shown or stored.

/// Reasoning blocks some hosted reasoning models inline into the content.
const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Stage directions and asides in half- or full-width brackets.
const ASIDE_OPEN: [char; 2] = ['(', '（'];
const ASIDE_CLOSE: [char; 2] = [')', '）'];

const REPLY_PREFIX: &str = "回复：";

/// Strip reasoning blocks and bracketed asides, trim, and drop a leading
/// `回复：` label.
pub fn clean_reply(text: &str) -> String {
    let without_think = strip_think_blocks(text);
    let without_asides = strip_asides(&without_think);
    without_asides.trim().replacen(REPLY_PREFIX, "", 1)
}

/// Remove every `<think>…</think>` span. An unclosed block is kept.
fn strip_think_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(THINK_OPEN) {
        let after = &rest[start + THINK_OPEN.len()..];
        let Some(end) = after.find(THINK_CLOSE) else {
            break;
        };
        out.push_str(&rest[..start]);
        rest = &after[end + THINK_CLOSE.len()..];
    }
    out.push_str(rest);
    out
}

/// Remove the shortest bracketed span from each opening bracket. Spans never
/// cross a newline; the brackets need not match in width.
fn strip_asides(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(ASIDE_OPEN) {
        let open_len = rest[start..].chars().next().map_or(1, char::len_utf8);
        let after = &rest[start + open_len..];
        let line = after.find('\n').map_or(after, |nl| &after[..nl]);
        match line.find(ASIDE_CLOSE) {
            Some(end) => {
                out.push_str(&rest[..start]);
                let close_len = line[end..].chars().next().map_or(1, char::len_utf8);
                rest = &after[end + close_len..];
            }
            None => {
                out.push_str(&rest[..start + open_len]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
