use serde::{Deserialize, Serialize};

/// Error prefix the shield uses for rule-level rejections whose reason is safe
/// to show to the user.
pub const ACCESS_CONTROL_PREFIX: &str = "AccessControlException: ERROR: PAIG-400004: ";

pub const NOT_AUTHORIZED_MESSAGE: &str =
    "Looks like you’re not authorized to get information about that.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationRole {
    Prompt,
    Reply,
}

impl ConversationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "PROMPT",
            Self::Reply => "REPLY",
        }
    }
}

/// A piece of text on its way to or from the user. Authorization never
/// mutates an artifact; it yields a new outcome instead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentArtifact {
    pub text: String,
    pub role: ConversationRole,
}

impl ContentArtifact {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self { text: text.into(), role: ConversationRole::Prompt }
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Self { text: text.into(), role: ConversationRole::Reply }
    }

    pub fn is_blank(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum AuthorizationOutcome {
    Authorized(String),
    /// Carries only a sanitized, user-facing message.
    Denied(String),
}

impl AuthorizationOutcome {
    pub fn denied_from_raw(raw_error: &str) -> Self {
        Self::Denied(sanitize_denial_message(raw_error))
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized(_))
    }

    /// The text to show in place of the original content.
    pub fn into_display_text(self) -> String {
        match self {
            Self::Authorized(text) | Self::Denied(text) => text,
        }
    }
}

/// Maps a raw access-control error to what the user may see. Only rule-level
/// rejections carrying the known prefix expose their reason, and never when
/// the reason mentions a denial.
pub fn sanitize_denial_message(raw_error: &str) -> String {
    let mentions_denial = raw_error.to_lowercase().contains("denied");
    match raw_error.strip_prefix(ACCESS_CONTROL_PREFIX) {
        Some(reason) if !mentions_denial => reason.trim().to_string(),
        _ => NOT_AUTHORIZED_MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        sanitize_denial_message, AuthorizationOutcome, ContentArtifact, ConversationRole,
        NOT_AUTHORIZED_MESSAGE,
    };

    #[test]
    fn prefixed_rule_rejection_exposes_trimmed_reason() {
        let message = sanitize_denial_message(
            "AccessControlException: ERROR: PAIG-400004: Column X contains PII  ",
        );
        assert_eq!(message, "Column X contains PII");
    }

    #[test]
    fn denial_wording_falls_back_to_generic_message() {
        let message =
            sanitize_denial_message("AccessControlException: access denied for role ANALYST");
        assert_eq!(message, NOT_AUTHORIZED_MESSAGE);
    }

    #[test]
    fn denial_wording_wins_even_with_known_prefix() {
        let message = sanitize_denial_message(
            "AccessControlException: ERROR: PAIG-400004: Request DENIED by policy 12",
        );
        assert_eq!(message, NOT_AUTHORIZED_MESSAGE);
    }

    #[test]
    fn unknown_error_shape_falls_back_to_generic_message() {
        assert_eq!(sanitize_denial_message("connection reset"), NOT_AUTHORIZED_MESSAGE);
        assert_eq!(sanitize_denial_message(""), NOT_AUTHORIZED_MESSAGE);
    }

    #[test]
    fn outcome_exposes_display_text_for_both_variants() {
        let denied = AuthorizationOutcome::denied_from_raw("boom");
        assert!(!denied.is_authorized());
        assert_eq!(denied.into_display_text(), NOT_AUTHORIZED_MESSAGE);

        let authorized = AuthorizationOutcome::Authorized("ok".to_string());
        assert_eq!(authorized.into_display_text(), "ok");
    }

    #[test]
    fn artifact_constructors_set_role() {
        assert_eq!(ContentArtifact::prompt("q").role, ConversationRole::Prompt);
        assert_eq!(ContentArtifact::reply("a").role, ConversationRole::Reply);
        assert!(ContentArtifact::reply("").is_blank());
    }
}
