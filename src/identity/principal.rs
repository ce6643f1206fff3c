use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Sentinel username carried by the identity of a request without credentials.
pub const ANONYMOUS: &str = "anonymous";

/// Extra key/value context attached by an external bearer resolver
/// (e.g. the calling application and organisation of a service user).
pub type UserContext = HashMap<String, String>;

/// The resolved principal of a request. Immutable once built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    #[serde(rename = "userid")]
    pub user_id: String,
    /// Absolute expiry in epoch milliseconds; 0 for identities that never expire.
    pub expires: i64,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default, rename = "usercontext")]
    pub user_context: UserContext,
}

impl Identity {
    pub fn new<I, S>(username: impl Into<String>, user_id: impl Into<String>, expires: i64, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            username: username.into(),
            user_id: user_id.into(),
            expires,
            roles: roles.into_iter().map(Into::into).collect(),
            user_context: UserContext::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS, "0", 0, Vec::<String>::new())
    }

    pub fn is_anonymous(&self) -> bool {
        self.username == ANONYMOUS
    }

    pub fn with_context(mut self, ctx: UserContext) -> Self {
        self.user_context = ctx;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_has_no_roles_and_id_zero() {
        let a = Identity::anonymous();
        assert!(a.is_anonymous());
        assert_eq!(a.user_id, "0");
        assert!(a.roles.is_empty());
        assert!(a.user_context.is_empty());
    }

    #[test]
    fn json_shape_uses_wire_names() {
        let id = Identity::new("jane", "42", 1000, ["admin"]);
        let v = serde_json::to_value(&id).unwrap();
        assert_eq!(v["username"], "jane");
        assert_eq!(v["userid"], "42");
        assert_eq!(v["expires"], 1000);
        assert_eq!(v["roles"], serde_json::json!(["admin"]));
        assert_eq!(v["usercontext"], serde_json::json!({}));
    }
}
