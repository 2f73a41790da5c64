//! HTML whitespace stripping applied before a page is stored.

use bytes::Bytes;

/// Remove whitespace that sits only between two tags (`>   <` becomes `><`).
pub fn strip_spaces_between_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(pos) = rest.find('>') {
        out.push_str(&rest[..=pos]);
        rest = &rest[pos + 1..];

        let trimmed = rest.trim_start();
        if trimmed.starts_with('<') {
            rest = trimmed;
        }
    }
    out.push_str(rest);
    out
}

/// Minify an HTML body. Returns `None` when the body is not valid UTF-8.
pub fn minify_html(body: &[u8]) -> Option<Bytes> {
    let text = std::str::from_utf8(body).ok()?;
    Some(Bytes::from(strip_spaces_between_tags(text.trim())))
}

/// Whether a content type designates an HTML document.
pub fn is_html(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|value| value.contains("text/html"))
}
