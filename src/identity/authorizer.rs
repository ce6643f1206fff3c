use super::principal::Identity;

/// True when `user` holds at least one of `allowed`. Role names are compared exactly.
/// An empty `allowed` list never matches.
pub fn user_has_a_role<S: AsRef<str>>(allowed: &[S], user: &Identity) -> bool {
    allowed.iter().any(|r| user.roles.contains(r.as_ref()))
}
