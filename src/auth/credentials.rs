use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One on-disk credential document, named after the sanitized account email
/// (or a timestamped placeholder until the email is known).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl CredentialRecord {
    /// Shape gate applied at load time: both tokens plus at least one of
    /// tokenType / scope must be present.
    pub fn is_loadable(&self) -> bool {
        !self.access_token.is_empty()
            && !self.refresh_token.is_empty()
            && (self.token_type.is_some() || self.scope.is_some())
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_ms < now_ms
    }

    /// The file name this record wants to live under.
    pub fn derived_file_name(&self) -> String {
        match self.email.as_deref().filter(|e| !e.is_empty()) {
            Some(email) => format!("{}.json", sanitize_email(email)),
            None => placeholder_file_name(),
        }
    }
}

pub fn sanitize_email(email: &str) -> String {
    email
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '@' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn placeholder_file_name() -> String {
    format!("account-{}.json", chrono::Utc::now().timestamp_millis())
}

/// A credential file excluded from pool loading even though it matches
/// `*.json` (tooling artifacts that commonly share the directory).
pub fn is_excluded_file_name(name: &str) -> bool {
    name.starts_with("package") && name.ends_with(".json") || name == "tsconfig.json"
}

/// Deletion takes a client-supplied file name; reject anything that could
/// escape the credentials directory.
pub fn validate_delete_name(name: &str) -> AppResult<()> {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(AppError::Account(format!("invalid file name: {}", name)));
    }
    if !name.ends_with(".json") {
        return Err(AppError::Account(format!(
            "only .json credential files can be deleted: {}",
            name
        )));
    }
    Ok(())
}

pub fn persist_record(path: &Path, record: &CredentialRecord) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(record)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_email_characters() {
        assert_eq!(sanitize_email("user@example.com"), "user@example.com");
        assert_eq!(sanitize_email("us er+tag@ex!.com"), "us_er_tag@ex_.com");
    }

    #[test]
    fn shape_gate_requires_tokens_and_metadata() {
        let mut record = CredentialRecord {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            scope: Some("openid".to_string()),
            ..Default::default()
        };
        assert!(record.is_loadable());

        record.scope = None;
        assert!(!record.is_loadable());

        record.token_type = Some("Bearer".to_string());
        assert!(record.is_loadable());

        record.access_token.clear();
        assert!(!record.is_loadable());
    }

    #[test]
    fn delete_name_validation_rejects_traversal() {
        assert!(validate_delete_name("../secrets.json").is_err());
        assert!(validate_delete_name("a/b.json").is_err());
        assert!(validate_delete_name("a\\b.json").is_err());
        assert!(validate_delete_name("account.txt").is_err());
        assert!(validate_delete_name("user@example.com.json").is_ok());
    }

    #[test]
    fn excluded_files_are_recognized() {
        assert!(is_excluded_file_name("package.json"));
        assert!(is_excluded_file_name("package-lock.json"));
        assert!(is_excluded_file_name("tsconfig.json"));
        assert!(!is_excluded_file_name("user@example.com.json"));
    }

    #[test]
    fn derived_file_name_prefers_email() {
        let record = CredentialRecord {
            email: Some("a b@c.io".to_string()),
            ..Default::default()
        };
        assert_eq!(record.derived_file_name(), "a_b@c.io.json");

        let anonymous = CredentialRecord::default();
        assert!(anonymous.derived_file_name().starts_with("account-"));
        assert!(anonymous.derived_file_name().ends_with(".json"));
    }

    #[test]
    fn record_round_trips_camel_case() {
        let record = CredentialRecord {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expiry_ms: 123,
            token_type: Some("Bearer".to_string()),
            scope: None,
            email: Some("u@e.com".to_string()),
            project_id: Some("bright-wave-a1b2c".to_string()),
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"accessToken\""));
        assert!(json.contains("\"expiryMs\""));
        assert!(json.contains("\"projectId\""));
        let back: CredentialRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
    }
}
