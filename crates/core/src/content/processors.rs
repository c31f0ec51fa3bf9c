use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use kora_shared::{ContentBody, ContentKind, ContentUnit, ValidationError};
use sha2::{Digest, Sha256};

use super::markup::{has_active_content, sanitize_markup};
use super::{ContentLimits, ContentProcessor, ValidationResult};

const IMAGE_FORMATS: &[&str] = &["png", "jpeg", "gif", "webp"];
const AUDIO_FORMATS: &[&str] = &["mp3", "wav", "ogg", "webm", "m4a", "flac"];
const BLOCKED_FILE_EXTENSIONS: &[&str] = &["exe", "dll", "bat", "cmd", "com", "scr", "msi", "ps1", "vbs"];
const EXECUTABLE_LANGUAGES: &[&str] = &["python", "javascript", "typescript", "shell", "ruby", "lua"];

// ============================================================
// Shared helpers
// ============================================================

/// CRLF/CR to LF, drops control characters other than tab and newline,
/// trims trailing whitespace.
fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let cleaned: String = unified
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    cleaned.trim_end().to_string()
}

fn strip_data_uri(data: &str) -> &str {
    if data.starts_with("data:") {
        if let Some((_, payload)) = data.split_once(";base64,") {
            return payload;
        }
    }
    data
}

fn compact_base64(data: &str) -> String {
    strip_data_uri(data).chars().filter(|c| !c.is_whitespace()).collect()
}

/// Decodes a base64 payload, rejecting it early if it cannot fit the limit.
fn decode_payload(field: &str, data: &str, limit: usize) -> Result<Vec<u8>, ValidationError> {
    let compact = compact_base64(data);
    if compact.is_empty() {
        return Err(ValidationError::empty(field));
    }
    let estimated = compact.len() / 4 * 3;
    if estimated > limit.saturating_add(3) {
        return Err(ValidationError::size_exceeded(field, limit, estimated));
    }
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ValidationError::malformed(field, format!("invalid base64: {}", e)))?;
    if bytes.len() > limit {
        return Err(ValidationError::size_exceeded(field, limit, bytes.len()));
    }
    Ok(bytes)
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn canonical_format(format: &str) -> String {
    let lower = format.trim().trim_start_matches('.').to_ascii_lowercase();
    let lower = lower.rsplit('/').next().unwrap_or_default().to_string();
    match lower.as_str() {
        "jpg" => "jpeg".to_string(),
        "mpeg" => "mp3".to_string(),
        "x-wav" | "wave" => "wav".to_string(),
        _ => lower,
    }
}

fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("webp"),
        _ => None,
    }
}

fn mismatch(unit: &ContentUnit) -> ValidationResult {
    ValidationResult::from_error(ValidationError::malformed(
        "type",
        format!("unexpected {} unit", unit.kind()),
    ))
}

// ============================================================
// Text
// ============================================================

pub struct TextProcessor;

impl ContentProcessor for TextProcessor {
    fn kind(&self) -> ContentKind {
        ContentKind::Text
    }

    fn validate(&self, unit: &ContentUnit, limits: &ContentLimits) -> ValidationResult {
        let ContentBody::Text { text } = &unit.body else {
            return mismatch(unit);
        };
        let mut result = ValidationResult::ok();
        if text.trim().is_empty() {
            result.error(ValidationError::empty("text"));
        }
        let chars = text.chars().count();
        if chars > limits.max_text_chars {
            result.error(ValidationError::size_exceeded("text", limits.max_text_chars, chars));
        }
        result
    }

    fn normalize(&self, mut unit: ContentUnit, _limits: &ContentLimits) -> Result<ContentUnit, ValidationError> {
        if let ContentBody::Text { text } = &mut unit.body {
            *text = normalize_text(text);
            if text.is_empty() {
                return Err(ValidationError::empty("text"));
            }
        }
        Ok(unit)
    }
}

// ============================================================
// Code
// ============================================================

pub struct CodeProcessor;

fn canonical_language(language: &str) -> String {
    let lower = language.trim().to_ascii_lowercase();
    match lower.as_str() {
        "py" | "python3" => "python".to_string(),
        "js" | "node" => "javascript".to_string(),
        "ts" => "typescript".to_string(),
        "sh" | "bash" | "zsh" => "shell".to_string(),
        "rs" => "rust".to_string(),
        "rb" => "ruby".to_string(),
        "" => "plaintext".to_string(),
        _ => lower,
    }
}

impl ContentProcessor for CodeProcessor {
    fn kind(&self) -> ContentKind {
        ContentKind::Code
    }

    fn validate(&self, unit: &ContentUnit, limits: &ContentLimits) -> ValidationResult {
        let ContentBody::Code { language, source, executable } = &unit.body else {
            return mismatch(unit);
        };
        let mut result = ValidationResult::ok();
        if source.trim().is_empty() {
            result.error(ValidationError::empty("source"));
        }
        let chars = source.chars().count();
        if chars > limits.max_code_chars {
            result.error(ValidationError::size_exceeded("source", limits.max_code_chars, chars));
        }
        let lang = canonical_language(language);
        if *executable && !EXECUTABLE_LANGUAGES.contains(&lang.as_str()) {
            result.warn(format!("'{}' is not executable; the flag will be cleared", lang));
        }
        result
    }

    fn normalize(&self, mut unit: ContentUnit, _limits: &ContentLimits) -> Result<ContentUnit, ValidationError> {
        if let ContentBody::Code { language, source, executable } = &mut unit.body {
            *language = canonical_language(language);
            *source = source.replace("\r\n", "\n").replace('\r', "\n");
            if !EXECUTABLE_LANGUAGES.contains(&language.as_str()) {
                *executable = false;
            }
        }
        Ok(unit)
    }
}

// ============================================================
// Markup
// ============================================================

pub struct MarkupProcessor;

impl ContentProcessor for MarkupProcessor {
    fn kind(&self) -> ContentKind {
        ContentKind::Markup
    }

    fn validate(&self, unit: &ContentUnit, limits: &ContentLimits) -> ValidationResult {
        let ContentBody::Markup { html } = &unit.body else {
            return mismatch(unit);
        };
        let mut result = ValidationResult::ok();
        let chars = html.chars().count();
        if chars > limits.max_markup_chars {
            result.error(ValidationError::size_exceeded("html", limits.max_markup_chars, chars));
        }
        if html.trim().is_empty() {
            result.error(ValidationError::empty("html"));
        } else if has_active_content(html) {
            result.warn("markup contains active content that will be stripped");
        }
        result
    }

    fn normalize(&self, mut unit: ContentUnit, _limits: &ContentLimits) -> Result<ContentUnit, ValidationError> {
        if let ContentBody::Markup { html } = &mut unit.body {
            let clean = sanitize_markup(html);
            if clean.trim().is_empty() {
                return Err(ValidationError::empty("html"));
            }
            *html = clean;
        }
        Ok(unit)
    }
}

// ============================================================
// Image
// ============================================================

pub struct ImageProcessor;

impl ContentProcessor for ImageProcessor {
    fn kind(&self) -> ContentKind {
        ContentKind::Image
    }

    fn validate(&self, unit: &ContentUnit, limits: &ContentLimits) -> ValidationResult {
        let ContentBody::Image { format, data, .. } = &unit.body else {
            return mismatch(unit);
        };
        let format = canonical_format(format);
        if !IMAGE_FORMATS.contains(&format.as_str()) {
            return ValidationResult::from_error(ValidationError::unsupported_format(
                "format",
                &format,
                IMAGE_FORMATS,
            ));
        }
        let mut result = ValidationResult::ok();
        match decode_payload("data", data, limits.max_image_bytes) {
            Ok(bytes) => match sniff_image(&bytes) {
                Some(actual) if actual != format => {
                    result.warn(format!("declared {} but payload looks like {}", format, actual));
                }
                None => result.warn("image signature not recognized"),
                _ => {}
            },
            Err(e) => result.error(e),
        }
        result
    }

    fn normalize(&self, mut unit: ContentUnit, limits: &ContentLimits) -> Result<ContentUnit, ValidationError> {
        if let ContentBody::Image { format, data, .. } = &mut unit.body {
            let bytes = decode_payload("data", data, limits.max_image_bytes)?;
            *format = canonical_format(format);
            *data = compact_base64(data);
            unit.meta.attributes.insert("sha256".into(), sha256_hex(&bytes));
            unit.meta.attributes.insert("bytes".into(), bytes.len().to_string());
        }
        Ok(unit)
    }
}

// ============================================================
// Audio
// ============================================================

pub struct AudioProcessor;

impl ContentProcessor for AudioProcessor {
    fn kind(&self) -> ContentKind {
        ContentKind::Audio
    }

    fn validate(&self, unit: &ContentUnit, limits: &ContentLimits) -> ValidationResult {
        let ContentBody::Audio { format, data, .. } = &unit.body else {
            return mismatch(unit);
        };
        let format = canonical_format(format);
        if !AUDIO_FORMATS.contains(&format.as_str()) {
            return ValidationResult::from_error(ValidationError::unsupported_format(
                "format",
                &format,
                AUDIO_FORMATS,
            ));
        }
        match decode_payload("data", data, limits.max_audio_bytes) {
            Ok(_) => ValidationResult::ok(),
            Err(e) => ValidationResult::from_error(e),
        }
    }

    fn normalize(&self, mut unit: ContentUnit, limits: &ContentLimits) -> Result<ContentUnit, ValidationError> {
        if let ContentBody::Audio { format, data, .. } = &mut unit.body {
            let bytes = decode_payload("data", data, limits.max_audio_bytes)?;
            *format = canonical_format(format);
            *data = compact_base64(data);
            unit.meta.attributes.insert("sha256".into(), sha256_hex(&bytes));
            unit.meta.attributes.insert("bytes".into(), bytes.len().to_string());
        }
        Ok(unit)
    }
}

// ============================================================
// File
// ============================================================

pub struct FileProcessor;

fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    base.chars().filter(|c| !c.is_control()).collect::<String>().trim().to_string()
}

fn extension(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

impl ContentProcessor for FileProcessor {
    fn kind(&self) -> ContentKind {
        ContentKind::File
    }

    fn validate(&self, unit: &ContentUnit, limits: &ContentLimits) -> ValidationResult {
        let ContentBody::File { name, data, .. } = &unit.body else {
            return mismatch(unit);
        };
        let mut result = ValidationResult::ok();
        let clean = safe_file_name(name);
        if clean.is_empty() {
            result.error(ValidationError::empty("name"));
        } else if clean != *name {
            result.warn(format!("file name will be normalized to '{}'", clean));
        }
        if let Some(ext) = extension(&clean) {
            if BLOCKED_FILE_EXTENSIONS.contains(&ext.as_str()) {
                result.error(ValidationError::unsupported_format("name", &ext, &[]));
            }
        }
        if let Err(e) = decode_payload("data", data, limits.max_file_bytes) {
            result.error(e);
        }
        result
    }

    fn normalize(&self, mut unit: ContentUnit, limits: &ContentLimits) -> Result<ContentUnit, ValidationError> {
        if let ContentBody::File { name, mime_type, data } = &mut unit.body {
            let bytes = decode_payload("data", data, limits.max_file_bytes)?;
            *name = safe_file_name(name);
            if mime_type.as_deref().map_or(true, str::is_empty) {
                *mime_type = Some(
                    mime_guess::from_path(name.as_str())
                        .first_or_octet_stream()
                        .essence_str()
                        .to_string(),
                );
            }
            *data = compact_base64(data);
            unit.meta.attributes.insert("sha256".into(), sha256_hex(&bytes));
            unit.meta.attributes.insert("bytes".into(), bytes.len().to_string());
        }
        Ok(unit)
    }
}

// ============================================================
// Tool result
// ============================================================

pub struct ToolResultProcessor;

impl ContentProcessor for ToolResultProcessor {
    fn kind(&self) -> ContentKind {
        ContentKind::ToolResult
    }

    fn validate(&self, unit: &ContentUnit, limits: &ContentLimits) -> ValidationResult {
        let ContentBody::ToolResult { tool_call_id, output, .. } = &unit.body else {
            return mismatch(unit);
        };
        let mut result = ValidationResult::ok();
        if tool_call_id.trim().is_empty() {
            result.error(ValidationError::empty("tool_call_id"));
        }
        let size = serde_json::to_vec(output).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > limits.max_tool_output_bytes {
            result.error(ValidationError::size_exceeded("output", limits.max_tool_output_bytes, size));
        }
        result
    }

    fn normalize(&self, unit: ContentUnit, _limits: &ContentLimits) -> Result<ContentUnit, ValidationError> {
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kora_shared::{Originator, ValidationErrorKind};

    const PNG_1X1: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn image(format: &str, data: &str) -> ContentUnit {
        ContentUnit::new(
            ContentBody::Image {
                format: format.into(),
                data: data.into(),
                alt: None,
                width: None,
                height: None,
            },
            Originator::User,
        )
    }

    #[test]
    fn test_text_normalization() {
        let unit = ContentUnit::text("a\r\nb\u{0007}c \n", Originator::User);
        let out = TextProcessor.normalize(unit, &ContentLimits::default()).unwrap();
        assert_eq!(out.as_text(), Some("a\nbc"));
    }

    #[test]
    fn test_text_size_exceeded() {
        let limits = ContentLimits {
            max_text_chars: 4,
            ..ContentLimits::default()
        };
        let result = TextProcessor.validate(&ContentUnit::text("12345", Originator::User), &limits);
        assert!(!result.valid);
        assert_eq!(result.errors[0].kind, ValidationErrorKind::SizeExceeded);
    }

    #[test]
    fn test_image_png_accepted_and_annotated() {
        let limits = ContentLimits::default();
        let unit = image("image/PNG", &format!("data:image/png;base64,{}", PNG_1X1));
        let result = ImageProcessor.validate(&unit, &limits);
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty());

        let out = ImageProcessor.normalize(unit, &limits).unwrap();
        let ContentBody::Image { format, data, .. } = &out.body else {
            panic!("kind changed")
        };
        assert_eq!(format, "png");
        assert_eq!(data, PNG_1X1);
        assert!(out.meta.attributes.contains_key("sha256"));
    }

    #[test]
    fn test_image_unsupported_format() {
        let result = ImageProcessor.validate(&image("svg", PNG_1X1), &ContentLimits::default());
        assert_eq!(result.errors[0].kind, ValidationErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_image_size_exceeded() {
        let limits = ContentLimits {
            max_image_bytes: 16,
            ..ContentLimits::default()
        };
        let result = ImageProcessor.validate(&image("png", PNG_1X1), &limits);
        assert_eq!(result.errors[0].kind, ValidationErrorKind::SizeExceeded);
    }

    #[test]
    fn test_image_bad_base64() {
        let result = ImageProcessor.validate(&image("png", "!!!not-base64!!!"), &ContentLimits::default());
        assert_eq!(result.errors[0].kind, ValidationErrorKind::Malformed);
    }

    #[test]
    fn test_audio_unsupported_format() {
        let unit = ContentUnit::new(
            ContentBody::Audio {
                format: "aiff".into(),
                data: "AAAA".into(),
                duration_ms: None,
            },
            Originator::User,
        );
        let result = AudioProcessor.validate(&unit, &ContentLimits::default());
        assert_eq!(result.errors[0].kind, ValidationErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_file_name_and_mime_inferred() {
        let unit = ContentUnit::new(
            ContentBody::File {
                name: "../../etc/report.csv".into(),
                mime_type: None,
                data: STANDARD.encode(b"a,b\n1,2\n"),
            },
            Originator::User,
        );
        let limits = ContentLimits::default();
        assert!(FileProcessor.validate(&unit, &limits).valid);
        let out = FileProcessor.normalize(unit, &limits).unwrap();
        let ContentBody::File { name, mime_type, .. } = &out.body else {
            panic!("kind changed")
        };
        assert_eq!(name, "report.csv");
        assert_eq!(mime_type.as_deref(), Some("text/csv"));
    }

    #[test]
    fn test_file_blocked_extension() {
        let unit = ContentUnit::new(
            ContentBody::File {
                name: "setup.EXE".into(),
                mime_type: None,
                data: STANDARD.encode(b"MZ"),
            },
            Originator::User,
        );
        let result = FileProcessor.validate(&unit, &ContentLimits::default());
        assert_eq!(result.errors[0].kind, ValidationErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_code_executable_flag_cleared_for_unknown_language() {
        let unit = ContentUnit::new(
            ContentBody::Code {
                language: "cobol".into(),
                source: "DISPLAY 'HI'.".into(),
                executable: true,
            },
            Originator::User,
        );
        let limits = ContentLimits::default();
        let result = CodeProcessor.validate(&unit, &limits);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        let out = CodeProcessor.normalize(unit, &limits).unwrap();
        assert!(matches!(out.body, ContentBody::Code { executable: false, .. }));
    }
}
