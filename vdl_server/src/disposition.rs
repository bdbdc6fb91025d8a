//! `Content-Disposition` construction for attachment downloads.
//!
//! Unicode filenames travel in the RFC 5987 `filename*=UTF-8''…` parameter;
//! a plain ASCII `filename="…"` fallback is always included for clients
//! that predate the extended form.

/// Characters allowed unescaped in an RFC 5987 value (attr-char).
fn is_attr_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '&' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if is_attr_char(c) {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    out
}

fn ascii_fallback(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' {
                c
            } else if c == ' ' {
                ' '
            } else {
                '_'
            }
        })
        .collect()
}

/// Header value for `Content-Disposition: attachment`.
pub fn attachment_value(filename: &str) -> String {
    let fallback = ascii_fallback(filename);
    if filename.is_ascii() {
        format!("attachment; filename=\"{fallback}\"")
    } else {
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            percent_encode(filename)
        )
    }
}
