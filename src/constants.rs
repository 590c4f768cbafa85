use std::sync::LazyLock;

pub const V1_INTERNAL_BASE_URL: &str =
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal";

pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

// Public installed-app client; overridable via GOOGLE_OAUTH_CLIENT_ID / _SECRET.
pub const DEFAULT_OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const DEFAULT_OAUTH_CLIENT_SECRET: &str = "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";

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "antigravity/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

// Minimum spacing between consecutive calls on the v1internal lane.
pub const UPSTREAM_MIN_GAP_MS: u64 = 500;

// Fallback sleep before rotating/retrying when the upstream gives no hint.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1200;

// Access tokens are treated as expired this long before the real deadline.
pub const TOKEN_EXPIRY_SAFETY_MS: i64 = 60_000;

// Refresh timers fire this long before expiry, re-arming on failure.
pub const REFRESH_LEAD_MS: i64 = 10 * 60 * 1000;
pub const REFRESH_RETRY_MS: u64 = 60_000;

pub const DEFAULT_QUOTA_REFRESH_S: u64 = 300;
pub const COOLDOWN_WAIT_THRESHOLD_MS: u64 = 5_000;

// Upper bound accepted by flash variants for the thinking budget.
pub const FLASH_THINKING_BUDGET_CAP: u64 = 24_576;

pub const MAX_OUTPUT_TOKENS: u64 = 64_000;

pub const AUTHS_DIR: &str = "auths";
pub const LOG_DIR: &str = "log";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_carries_crate_version() {
        assert!(USER_AGENT.starts_with("antigravity/"));
        assert!(USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
