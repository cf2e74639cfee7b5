// Visible-text extraction from raw HTML.

/// Elements whose content never renders as page text.
const SKIPPED_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Longest entity name looked up, in chars.
const MAX_ENTITY_LEN: usize = 10;

/// Returns the page's visible text, tags replaced by single spaces and whitespace collapsed.
pub fn page_text(html: &str) -> String {
    let visible = strip_hidden_blocks(html);
    let mut out = String::with_capacity(visible.len());
    let mut in_tag = false;
    let mut quote: Option<char> = None;
    let mut chars = visible.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_tag {
            match (quote, ch) {
                (Some(open), _) if ch == open => quote = None,
                (Some(_), _) => {}
                (None, '"' | '\'') => quote = Some(ch),
                (None, '>') => {
                    in_tag = false;
                    out.push(' ');
                }
                (None, _) => {}
            }
            continue;
        }
        if ch == '<' && chars.peek().is_some_and(|next| starts_markup(*next)) {
            in_tag = true;
            out.push(' ');
        } else {
            out.push(ch);
        }
    }
    normalize_ws(&decode_entities(&out))
}

pub fn page_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let body_start = lower[open..].find('>')? + open + 1;
    let body_end = lower[body_start..].find("</title")? + body_start;
    let title = normalize_ws(&decode_entities(&html[body_start..body_end]));
    if title.is_empty() { None } else { Some(title) }
}

pub fn normalize_ws(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !prev_space {
                out.push(' ');
                prev_space = true;
            }
        } else {
            out.push(ch);
            prev_space = false;
        }
    }
    out.trim().to_string()
}

pub fn decode_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest[1..]
            .char_indices()
            .take(MAX_ENTITY_LEN + 1)
            .find(|(_, ch)| *ch == ';')
            .and_then(|(semi, _)| decode_entity(&rest[1..semi + 1]).map(|ch| (ch, semi + 2)));
        match decoded {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" | "#39" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn starts_markup(ch: char) -> bool {
    ch.is_ascii_alphabetic() || matches!(ch, '/' | '!' | '?')
}

// ASCII lowercasing keeps byte offsets, so indices found in `lower` are valid in `html`.
fn strip_hidden_blocks(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;
    while pos < html.len() {
        let Some(rel) = lower[pos..].find('<') else {
            out.push_str(&html[pos..]);
            break;
        };
        let start = pos + rel;
        out.push_str(&html[pos..start]);
        let rest = &lower[start..];

        if rest.starts_with("<!--") {
            match rest[4..].find("-->") {
                Some(end) => {
                    pos = start + 4 + end + 3;
                    out.push(' ');
                    continue;
                }
                None => break,
            }
        }

        if let Some(element) = SKIPPED_ELEMENTS
            .iter()
            .find(|element| opens_element(rest, element))
        {
            let close = format!("</{element}");
            match rest.find(&close) {
                Some(close_rel) => {
                    let close_start = start + close_rel;
                    pos = lower[close_start..]
                        .find('>')
                        .map_or(html.len(), |end| close_start + end + 1);
                    out.push(' ');
                    continue;
                }
                None => break,
            }
        }

        out.push('<');
        pos = start + 1;
    }
    out
}

fn opens_element(rest: &str, element: &str) -> bool {
    let Some(after_open) = rest.strip_prefix('<') else {
        return false;
    };
    let Some(after_name) = after_open.strip_prefix(element) else {
        return false;
    };
    after_name
        .chars()
        .next()
        .is_none_or(|ch| ch == '>' || ch == '/' || ch.is_ascii_whitespace())
}
