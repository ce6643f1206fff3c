//! Caller identity: who is making a request, how that is proven, and the
//! per-request context that carries it alongside the database handle.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod codec;
mod request_context;
mod authorizer;

pub use principal::{Identity, UserContext, ANONYMOUS};
pub use codec::{CredentialCodec, CredentialError, CredentialVerifier, CREDENTIAL_TTL};
pub use request_context::{
    parse_cookie, BearerResolver, RequestContext, ResolvedPrincipal, RESOLVED_IDENTITY_TTL, TOKEN_COOKIE_NAME,
};
pub(crate) use request_context::SavedSlot;
pub use authorizer::user_has_a_role;
