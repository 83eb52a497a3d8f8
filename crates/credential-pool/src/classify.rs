//! Classification of upstream error responses
//!
//! The generation service reports concurrency and quota rejections in two
//! ways: an HTTP 429, or a business `code` in the JSON envelope delivered
//! with some other status. Both mean "this credential is saturated, try
//! another". Content-policy rejections are separated out because retrying
//! the same prompt on another credential is pointless.

/// What a failed upstream response means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Concurrency/quota limit on the credential used; rotate credentials
    Throttle,
    /// Prompt or input rejected by content policy; do not retry as-is
    ContentModeration,
    /// Anything else (auth, validation, 5xx)
    Other,
}

/// Business codes signalling rate, concurrency or balance exhaustion.
const THROTTLE_CODES: &[i64] = &[1102, 1302, 1303];

/// Business codes signalling a content-policy rejection.
const MODERATION_CODES: &[i64] = &[1301];

const THROTTLE_PATTERNS: &[&str] = &[
    "concurrency",
    "parallel task",
    "rate limit",
    "too many requests",
    "quota",
    "insufficient balance",
];

const MODERATION_PATTERNS: &[&str] = &[
    "risk control",
    "content security",
    "moderation",
    "sensitive",
];

/// Classify an error response by HTTP status and raw body.
pub fn classify(status: u16, body: &str) -> Classification {
    if status == 429 {
        return Classification::Throttle;
    }
    classify_body(body)
}

/// Classify an envelope body on its own (used when upstream answers 2xx with
/// a non-zero business code).
pub fn classify_body(body: &str) -> Classification {
    let envelope: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let code = envelope
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(|c| c.as_i64());

    if let Some(code) = code {
        if THROTTLE_CODES.contains(&code) {
            return Classification::Throttle;
        }
        if MODERATION_CODES.contains(&code) {
            return Classification::ContentModeration;
        }
    }

    let message = envelope
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_lowercase)
        .unwrap_or_else(|| body.to_lowercase());

    if MODERATION_PATTERNS.iter().any(|p| message.contains(p)) {
        return Classification::ContentModeration;
    }
    if THROTTLE_PATTERNS.iter().any(|p| message.contains(p)) {
        return Classification::Throttle;
    }
    Classification::Other
}
