//! Validation and normalization of message content units.
//!
//! Every content kind has one stateless [`ContentProcessor`]. The
//! [`ContentPipeline`] routes a unit to its processor. Processors hold no
//! mutable state, so a pipeline can be shared across tasks and used on
//! distinct units concurrently.

mod markup;
mod processors;

pub use markup::sanitize_markup;
pub use processors::{
    AudioProcessor, CodeProcessor, FileProcessor, ImageProcessor, MarkupProcessor,
    TextProcessor, ToolResultProcessor,
};

use kora_shared::{ContentKind, ContentUnit, ValidationError};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentLimits {
    pub max_text_chars: usize,
    pub max_code_chars: usize,
    pub max_markup_chars: usize,
    pub max_image_bytes: usize,
    pub max_audio_bytes: usize,
    pub max_file_bytes: usize,
    pub max_tool_output_bytes: usize,
}

impl Default for ContentLimits {
    fn default() -> Self {
        Self {
            max_text_chars: 100_000,
            max_code_chars: 200_000,
            max_markup_chars: 200_000,
            max_image_bytes: 10 * 1024 * 1024,
            max_audio_bytes: 25 * 1024 * 1024,
            max_file_bytes: 25 * 1024 * 1024,
            max_tool_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    pub fn error(&mut self, error: ValidationError) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    #[must_use]
    pub fn from_error(error: ValidationError) -> Self {
        let mut result = Self::ok();
        result.error(error);
        result
    }

    /// First error, if any.
    pub fn into_result(mut self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors.remove(0))
        }
    }
}

/// Validator and normalizer for one content kind.
pub trait ContentProcessor: Send + Sync {
    fn kind(&self) -> ContentKind;

    fn can_process(&self, unit: &ContentUnit) -> bool {
        unit.kind() == self.kind()
    }

    fn validate(&self, unit: &ContentUnit, limits: &ContentLimits) -> ValidationResult;

    /// Produces the canonical form. Called only on units that validated.
    fn normalize(&self, unit: ContentUnit, limits: &ContentLimits) -> Result<ContentUnit, ValidationError>;
}

/// Routes units to the processor registered for their kind.
pub struct ContentPipeline {
    processors: Vec<Box<dyn ContentProcessor>>,
    limits: ContentLimits,
}

impl Default for ContentPipeline {
    fn default() -> Self {
        Self::new(ContentLimits::default())
    }
}

impl ContentPipeline {
    #[must_use]
    pub fn new(limits: ContentLimits) -> Self {
        Self {
            processors: vec![
                Box::new(TextProcessor),
                Box::new(CodeProcessor),
                Box::new(MarkupProcessor),
                Box::new(ImageProcessor),
                Box::new(AudioProcessor),
                Box::new(FileProcessor),
                Box::new(ToolResultProcessor),
            ],
            limits,
        }
    }

    #[must_use]
    pub fn limits(&self) -> &ContentLimits {
        &self.limits
    }

    fn processor_for(&self, unit: &ContentUnit) -> Option<&dyn ContentProcessor> {
        self.processors
            .iter()
            .find(|p| p.can_process(unit))
            .map(AsRef::as_ref)
    }

    #[must_use]
    pub fn can_process(&self, unit: &ContentUnit) -> bool {
        self.processor_for(unit).is_some()
    }

    #[must_use]
    pub fn validate(&self, unit: &ContentUnit) -> ValidationResult {
        match self.processor_for(unit) {
            Some(p) => p.validate(unit, &self.limits),
            None => ValidationResult::from_error(ValidationError::unsupported_format(
                "type",
                &unit.kind().to_string(),
                &[],
            )),
        }
    }

    /// Validates then normalizes. `limits` overrides the pipeline defaults.
    pub fn process(
        &self,
        unit: ContentUnit,
        limits: Option<&ContentLimits>,
    ) -> Result<ContentUnit, ValidationError> {
        let limits = limits.unwrap_or(&self.limits);
        let processor = self.processor_for(&unit).ok_or_else(|| {
            ValidationError::unsupported_format("type", &unit.kind().to_string(), &[])
        })?;
        processor.validate(&unit, limits).into_result()?;
        processor.normalize(unit, limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kora_shared::{ContentBody, Originator, ValidationErrorKind};

    fn markup(html: &str) -> ContentUnit {
        ContentUnit::new(ContentBody::Markup { html: html.into() }, Originator::User)
    }

    #[test]
    fn test_processed_unit_stays_valid() {
        let pipeline = ContentPipeline::default();
        let units = vec![
            ContentUnit::text("hello\r\nworld  ", Originator::User),
            markup("<p onclick=\"x()\">hi</p><script>alert(1)</script>"),
            ContentUnit::new(
                ContentBody::Code {
                    language: "PY".into(),
                    source: "print(1)\r\n".into(),
                    executable: true,
                },
                Originator::User,
            ),
        ];
        for unit in units {
            assert!(pipeline.validate(&unit).valid);
            let processed = pipeline.process(unit, None).unwrap();
            assert!(pipeline.validate(&processed).valid);
            let again = pipeline.process(processed.clone(), None).unwrap();
            assert_eq!(again.body, processed.body);
        }
    }

    #[test]
    fn test_limits_override() {
        let pipeline = ContentPipeline::default();
        let tight = ContentLimits {
            max_text_chars: 3,
            ..ContentLimits::default()
        };
        let err = pipeline
            .process(ContentUnit::text("too long", Originator::User), Some(&tight))
            .unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::SizeExceeded);
    }
}
