use serde::{Deserialize, Serialize};

/// The signed-in user as the shield sees them: a lower-cased username and the
/// external groups derived from the user's active warehouse role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub user_groups: Vec<String>,
}

impl UserIdentity {
    pub fn new(username: &str, role: &str) -> Self {
        let role = normalize_role(role);
        let user_groups = if role.is_empty() { Vec::new() } else { vec![role] };
        Self { username: username.trim().to_lowercase(), user_groups }
    }
}

fn normalize_role(role: &str) -> String {
    role.trim().trim_matches('"').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::UserIdentity;

    #[test]
    fn identity_lowercases_user_and_strips_quoted_role() {
        let identity = UserIdentity::new("JANE.DOE", "\"SALES_ANALYST\"");

        assert_eq!(identity.username, "jane.doe");
        assert_eq!(identity.user_groups, vec!["sales_analyst".to_string()]);
    }

    #[test]
    fn blank_role_yields_no_groups() {
        let identity = UserIdentity::new("jane", "  ");
        assert!(identity.user_groups.is_empty());
    }
}
