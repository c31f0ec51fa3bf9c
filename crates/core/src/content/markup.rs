use once_cell::sync::Lazy;
use regex::{Captures, Regex};

const ACTIVE_ELEMENTS: &[&str] = &["script", "iframe", "object", "embed", "style"];
const SCRIPT_SCHEMES: &[&str] = &["javascript:", "vbscript:"];

struct Rules {
    blocks: Vec<Regex>,
    orphans: Vec<Regex>,
    /// A whole start or end tag; quoted values may contain `>`.
    tags: Regex,
    event_handlers: Regex,
    url_attributes: Regex,
    entities: Regex,
}

static RULES: Lazy<Option<Rules>> = Lazy::new(|| {
    let mut blocks = Vec::new();
    let mut orphans = Vec::new();
    for tag in ACTIVE_ELEMENTS {
        blocks.push(Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).ok()?);
        orphans.push(Regex::new(&format!(r"(?is)</?{tag}\b[^>]*>")).ok()?);
    }
    Some(Rules {
        blocks,
        orphans,
        tags: Regex::new(r#"(?s)</?[a-zA-Z](?:"[^"]*"|'[^']*'|[^"'>])*>"#).ok()?,
        event_handlers: Regex::new(r#"(?is)[\s/]+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).ok()?,
        url_attributes: Regex::new(
            r#"(?is)([\s/]+(?:href|src|action|formaction|xlink:href)\s*=\s*)("[^"]*"|'[^']*'|[^\s>]+)"#,
        )
        .ok()?,
        entities: Regex::new(r"&(?:#([0-9]+)|#[xX]([0-9a-fA-F]+)|([a-zA-Z]+));?").ok()?,
    })
});

fn named_entity(name: &str) -> Option<char> {
    Some(match name.to_ascii_lowercase().as_str() {
        "colon" => ':',
        "tab" => '\t',
        "newline" => '\n',
        "nbsp" => '\u{a0}',
        "amp" => '&',
        "lpar" => '(',
        "rpar" => ')',
        "sol" => '/',
        "quot" => '"',
        "apos" => '\'',
        "lt" => '<',
        "gt" => '>',
        _ => return None,
    })
}

/// Decodes character references the way a browser does inside an
/// attribute value. Numeric references need no terminating `;`.
fn decode_entities(rules: &Rules, value: &str) -> String {
    rules
        .entities
        .replace_all(value, |caps: &Captures| {
            let decoded = if let Some(dec) = caps.get(1) {
                dec.as_str().parse::<u32>().ok().and_then(char::from_u32)
            } else if let Some(hex) = caps.get(2) {
                u32::from_str_radix(hex.as_str(), 16).ok().and_then(char::from_u32)
            } else {
                caps.get(3).and_then(|name| named_entity(name.as_str()))
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}

/// Whether a URL attribute value would run code when followed. Inline
/// raster images are the only `data:` URLs let through.
fn is_script_url(rules: &Rules, value: &str) -> bool {
    let compact: String = decode_entities(rules, unquote(value))
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    if SCRIPT_SCHEMES.iter().any(|scheme| compact.starts_with(scheme)) {
        return true;
    }
    compact.starts_with("data:") && (!compact.starts_with("data:image/") || compact.starts_with("data:image/svg"))
}

fn clean_tag(rules: &Rules, tag: &str) -> String {
    let tag = rules.event_handlers.replace_all(tag, "");
    rules
        .url_attributes
        .replace_all(&tag, |caps: &Captures| {
            let value = &caps[2];
            if !is_script_url(rules, value) {
                return caps[0].to_string();
            }
            let quote = match value.chars().next() {
                Some(q @ ('"' | '\'')) => q.to_string(),
                _ => String::new(),
            };
            format!("{}{quote}#{quote}", &caps[1])
        })
        .into_owned()
}

fn strip_once(rules: &Rules, html: &str) -> String {
    let mut out = html.to_string();
    for re in &rules.blocks {
        out = re.replace_all(&out, "").into_owned();
    }
    for re in &rules.orphans {
        out = re.replace_all(&out, "").into_owned();
    }
    rules
        .tags
        .replace_all(&out, |caps: &Captures| clean_tag(rules, &caps[0]))
        .into_owned()
}

/// Removes active content from markup.
///
/// Passes repeat until nothing changes, so fragments that reassemble into a
/// tag after one removal are caught and `sanitize_markup(sanitize_markup(x))`
/// equals `sanitize_markup(x)`. A pass either shortens the input or replaces
/// a script URL with `#`, which no later pass touches, so the loop
/// terminates.
#[must_use]
pub fn sanitize_markup(html: &str) -> String {
    let Some(rules) = RULES.as_ref() else {
        // Fail closed if the rules did not compile
        return html.replace('<', "&lt;").replace('>', "&gt;");
    };
    let mut current = html.to_string();
    loop {
        let next = strip_once(rules, &current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Whether the markup still contains anything `sanitize_markup` would strip.
#[must_use]
pub fn has_active_content(html: &str) -> bool {
    sanitize_markup(html) != html
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_script_blocks_and_handlers() {
        let html = r#"<p class="x" onclick="steal()">Hi</p><script type="text/javascript">alert(1)</script>"#;
        assert_eq!(sanitize_markup(html), r#"<p class="x">Hi</p>"#);
    }

    #[test]
    fn test_slash_separated_handler_is_stripped() {
        assert_eq!(sanitize_markup("<svg/onload=alert(1)>"), "<svg>");
        assert_eq!(sanitize_markup("<img src=x\nonerror=alert(1)>"), "<img src=x>");
        assert_eq!(sanitize_markup(r#"<a title=">" onclick=go()>x</a>"#), r#"<a title=">">x</a>"#);
    }

    #[test]
    fn test_handler_lookalikes_outside_tags_are_kept() {
        let prose = "status online = yes, and 3 < 4 onward=true";
        assert_eq!(sanitize_markup(prose), prose);
        assert!(!has_active_content("<p>we are online = yes</p>"));
    }

    #[test]
    fn test_nested_reassembly_is_caught() {
        let html = "<scr<script>x</script>ipt>alert(1)</scr<script></script>ipt>";
        let clean = sanitize_markup(html);
        assert!(!clean.to_lowercase().contains("<script"));
        assert_eq!(sanitize_markup(&clean), clean);
    }

    #[test]
    fn test_javascript_urls_neutralized() {
        let clean = sanitize_markup(r#"<a href="javascript:alert(1)">x</a>"#);
        assert_eq!(clean, r##"<a href="#">x</a>"##);
        let clean = sanitize_markup("<a href=vbscript:msgbox(1)>x</a>");
        assert_eq!(clean, "<a href=#>x</a>");
    }

    #[test]
    fn test_encoded_script_urls_neutralized() {
        let samples = [
            r#"<a href="&#106;avascript:alert(1)">x</a>"#,
            r#"<a href="&#x6A;avascript:alert(1)">x</a>"#,
            r#"<a href="&#0000106&#0000097vascript:alert(1)">x</a>"#,
            r#"<a href="javascript&colon;alert(1)">x</a>"#,
            r#"<a href="java&Tab;script:alert(1)">x</a>"#,
            "<a href=\"java\tscript:alert(1)\">x</a>",
        ];
        for html in samples {
            assert_eq!(sanitize_markup(html), r##"<a href="#">x</a>"##, "not neutralized: {html}");
        }
    }

    #[test]
    fn test_data_urls_only_allowed_for_raster_images() {
        let html = r#"<a href="data:text/html;base64,PHNjcmlwdD4=">x</a>"#;
        assert_eq!(sanitize_markup(html), r##"<a href="#">x</a>"##);
        let svg = r#"<img src="data:image/svg+xml;base64,PHN2Zz4=">"#;
        assert_eq!(sanitize_markup(svg), r##"<img src="#">"##);
        let png = r#"<img src="data:image/png;base64,iVBORw0KGgo=">"#;
        assert_eq!(sanitize_markup(png), png);
        let link = r#"<a href="https://example.com/?q=1&amp;r=2">ok</a>"#;
        assert_eq!(sanitize_markup(link), link);
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let samples = [
            "<div>plain</div>",
            "<img src=x onerror=alert(1)>",
            "<iframe src='evil'></iframe><b>ok</b>",
            "<SCRIPT>a</SCRIPT><style>p{}</style>",
            "<a HREF = ' javascript:void(0)'>l</a>",
            "<svg/onload=alert(1)//>",
            r#"<a href="&#106;avascript:alert(1)">x</a>"#,
        ];
        for s in samples {
            let once = sanitize_markup(s);
            assert_eq!(sanitize_markup(&once), once, "not idempotent for {s}");
            assert!(!has_active_content(&once));
        }
    }
}
