use async_trait::async_trait;
use kora_shared::{
    kora_plugin, ConfigMap, ContentBody, ContentUnit, InterceptRequest, Plugin, PluginConfig,
    PluginDescriptor, PluginInitContext,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::RwLock;

const DEFAULT_MASK: &str = "[REDACTED]";

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"sk-[A-Za-z0-9_\-]{20,}",
        r"AKIA[0-9A-Z]{16}",
        r"gh[pousr]_[A-Za-z0-9]{36,}",
        r"xox[abpr]-[A-Za-z0-9\-]{10,}",
        r"(?i)bearer\s+[A-Za-z0-9._\-]{16,}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Masks credentials in user text before it reaches the generator.
#[kora_plugin(
    id = "core.redactor",
    name = "Secret Redactor",
    description = "Masks API keys and bearer tokens in outgoing user text.",
    version = "0.1.0",
    capabilities = ["message.intercept"]
)]
pub struct RedactorPlugin {
    mask: RwLock<String>,
}

impl RedactorPlugin {
    pub async fn new_plugin(config: PluginConfig) -> anyhow::Result<Self> {
        let mask = mask_from(&config.values).unwrap_or(DEFAULT_MASK).to_string();
        Ok(Self {
            mask: RwLock::new(mask),
        })
    }
}

fn mask_from(config: &ConfigMap) -> Option<&str> {
    config.get("mask").and_then(Value::as_str)
}

/// Returns `None` when nothing matched.
pub fn redact(text: &str, mask: &str) -> Option<String> {
    let mut out = std::borrow::Cow::Borrowed(text);
    for pattern in SECRET_PATTERNS.iter() {
        if pattern.is_match(&out) {
            out = std::borrow::Cow::Owned(pattern.replace_all(&out, mask).into_owned());
        }
    }
    match out {
        std::borrow::Cow::Borrowed(_) => None,
        std::borrow::Cow::Owned(s) => Some(s),
    }
}

#[async_trait]
impl Plugin for RedactorPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        Self::static_descriptor().with_default_config("mask", Value::String(DEFAULT_MASK.into()))
    }

    async fn on_init(&self, ctx: PluginInitContext) -> anyhow::Result<()> {
        if let Some(mask) = mask_from(&ctx.config) {
            *self.mask.write().await = mask.to_string();
        }
        Ok(())
    }

    fn validate_config(&self, config: &ConfigMap) -> Result<(), String> {
        match config.get("mask") {
            None => Ok(()),
            Some(Value::String(s)) if !s.is_empty() => Ok(()),
            Some(_) => Err("'mask' must be a non-empty string".to_string()),
        }
    }

    async fn on_config_changed(&self, config: &ConfigMap) -> anyhow::Result<()> {
        let mask = mask_from(config).unwrap_or(DEFAULT_MASK);
        *self.mask.write().await = mask.to_string();
        Ok(())
    }

    async fn intercept_message(
        &self,
        request: &InterceptRequest,
    ) -> anyhow::Result<Option<Vec<ContentUnit>>> {
        let mask = self.mask.read().await.clone();
        let mut changed = 0usize;
        let content = request
            .content
            .iter()
            .map(|unit| match &unit.body {
                ContentBody::Text { text } => match redact(text, &mask) {
                    Some(clean) => {
                        changed += 1;
                        ContentUnit {
                            body: ContentBody::Text { text: clean },
                            meta: unit.meta.clone(),
                        }
                    }
                    None => unit.clone(),
                },
                _ => unit.clone(),
            })
            .collect::<Vec<_>>();

        if changed == 0 {
            return Ok(None);
        }
        tracing::info!(
            session_id = %request.session_id,
            units = changed,
            "🔏 Redacted credentials from user content"
        );
        Ok(Some(content))
    }
}
