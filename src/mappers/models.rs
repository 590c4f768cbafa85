use crate::auth::Group;

/// Upstream id used when the client names a Claude model we do not know.
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-5";

/// Flash variant forced for web_search requests.
pub const WEB_SEARCH_MODEL: &str = "gemini-2.5-flash";

/// Hand-maintained Anthropic alias table. Entries map the ids Claude clients
/// send to the ids the upstream multiplexer understands.
const CLAUDE_ALIASES: &[(&str, &str)] = &[
    ("claude-sonnet-4-5", "claude-sonnet-4-5"),
    ("claude-sonnet-4-5-thinking", "claude-sonnet-4-5-thinking"),
    ("claude-sonnet-4-20250514", "claude-sonnet-4-5"),
    ("claude-sonnet-4-5-20250929", "claude-sonnet-4-5"),
    ("claude-opus-4-5", "claude-opus-4-5"),
    ("claude-opus-4-5-thinking", "claude-opus-4-5-thinking"),
    ("claude-opus-4-1-20250805", "claude-opus-4-5"),
    ("claude-3-7-sonnet-20250219", "claude-sonnet-4-5"),
    ("claude-3-5-haiku-20241022", "claude-sonnet-4-5"),
    ("claude-haiku-4-5", "claude-sonnet-4-5"),
];

/// Models advertised on the two public list surfaces.
pub const CLAUDE_PUBLIC_MODELS: &[&str] = &[
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "claude-opus-4-5",
    "claude-opus-4-5-thinking",
];

pub const GEMINI_PUBLIC_MODELS: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.5-pro",
    "gemini-3-flash",
    "gemini-3-pro",
];

pub fn map_claude_model(model: &str) -> &'static str {
    CLAUDE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, mapped)| *mapped)
        .unwrap_or(DEFAULT_CLAUDE_MODEL)
}

/// Routing cohort for the per-group rotation cursors, decided by substring
/// so a Claude-family exhaustion never touches Gemini selection.
pub fn model_group(model: &str) -> Group {
    if model.contains("claude") {
        Group::Claude
    } else {
        Group::Gemini
    }
}

pub fn is_pro_variant(model: &str) -> bool {
    model.contains("pro")
}

pub fn is_flash_variant(model: &str) -> bool {
    model.contains("flash")
}
