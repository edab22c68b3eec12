use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::token::SessionToken;
use crate::Result;

/// Obtains and renews session tokens for the client side.
///
/// Issuance itself (the token exchange with the server) happens behind this
/// trait; the server learns about new tokens through
/// [crate::server::ServerSessionSettings::on_token_issued] and
/// [crate::server::ServerSessionSettings::on_token_renewed].
#[async_trait]
pub trait SessionTokenProvider: Send + Sync + Debug {
    async fn get_token(&self, timeout: Duration) -> Result<SessionToken>;

    /// Issue the next key generation of the session `current` belongs to
    async fn renew_token(&self, timeout: Duration, current: &SessionToken) -> Result<SessionToken>;
}
