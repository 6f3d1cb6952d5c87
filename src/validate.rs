//! Input validation and sanitization for generation requests.
//!
//! Returns the first violated rule. The caller logs; this module does not.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::GenerateRequest;

/// A validated, immutable generation payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationPayload {
    pub prompt: String,
    pub width: i64,
    pub height: i64,
    pub model: String,
}

/// Patterns that have no business inside an image prompt: script injection,
/// inline event handlers, SQL tokens and code-execution calls.
static DENYLIST: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)<script",
        r"(?i)javascript:",
        r"(?i)on\w+\s*=",
        r"(?i)union\s+select",
        r"(?i)eval\(",
        r"(?i)exec\(",
        r"(?i)import\s*\(",
        r"(?i)require\s*\(",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("denylist pattern compiles"))
    .collect()
});

pub fn validate(
    body: &GenerateRequest,
    cfg: &GatewayConfig,
) -> Result<GenerationPayload, GatewayError> {
    let prompt = body
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            GatewayError::Validation("Prompt is required and must be a string".into())
        })?;

    let len = prompt.chars().count();
    if len < cfg.min_prompt_len {
        return Err(GatewayError::Validation(format!(
            "Prompt too short (minimum {} characters)",
            cfg.min_prompt_len
        )));
    }
    if len > cfg.max_prompt_len {
        return Err(GatewayError::Validation(format!(
            "Prompt too long (maximum {} characters)",
            cfg.max_prompt_len
        )));
    }
    if DENYLIST.iter().any(|re| re.is_match(prompt)) {
        return Err(GatewayError::Validation(
            "Invalid prompt content detected".into(),
        ));
    }

    let width = dimension(body.width.as_ref(), cfg.default_width, cfg)?;
    let height = dimension(body.height.as_ref(), cfg.default_height, cfg)?;

    let model = body
        .model
        .clone()
        .unwrap_or_else(|| cfg.default_model.clone());
    if !cfg.allowed_models.iter().any(|m| m == &model) {
        return Err(GatewayError::Validation(format!(
            "Invalid model. Allowed: {}",
            cfg.allowed_models.join(", ")
        )));
    }

    Ok(GenerationPayload {
        prompt: strip_control_chars(prompt),
        width,
        height,
        model,
    })
}

fn dimension(
    value: Option<&serde_json::Number>,
    default: i64,
    cfg: &GatewayConfig,
) -> Result<i64, GatewayError> {
    let value = match value {
        Some(n) => n.as_i64().ok_or_else(|| {
            GatewayError::Validation("Width and height must be integers".into())
        })?,
        None => default,
    };
    if value < cfg.min_dimension || value > cfg.max_dimension {
        return Err(GatewayError::Validation(format!(
            "Dimensions must be between {} and {}",
            cfg.min_dimension, cfg.max_dimension
        )));
    }
    Ok(value)
}

fn strip_control_chars(prompt: &str) -> String {
    prompt
        .chars()
        .filter(|c| !c.is_ascii_control())
        .collect()
}
