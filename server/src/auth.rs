//! Login validation and identity tokens.
//!
//! Successful logins receive a token that can be presented on a later
//! connection to get the same identity back, as long as it has not expired
//! and nobody else is using the name.

use crate::utils::{hex_token, now_ms};
use log::{info, warn};
use rand::rngs::StdRng;
use shared::{ErrorCode, Identity, LoginRequest, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::time::Duration;

/// How often expired identities are swept out of the store.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 15);
/// Lifetime of an issued identity token, in epoch milliseconds.
pub const TOKEN_LIFETIME_MS: i64 = 1000 * 60 * 60;

/// Gatekeeper for the login step.
///
/// `in_use` reports whether an identifier is already attached to a live
/// connection; logins never displace a connected player.
pub trait Authenticator: Send {
    fn login(
        &mut self,
        request: &LoginRequest,
        in_use: &dyn Fn(&str) -> bool,
    ) -> Result<Identity, ErrorCode>;

    /// Drops expired identities. Driven by a periodic timer.
    fn sweep(&mut self);
}

/// Username plus token authentication backed by an in-memory store.
pub struct BasicAuth {
    tokens: HashMap<String, Identity>,
    rng: StdRng,
}

impl BasicAuth {
    pub fn new(rng: StdRng) -> Self {
        BasicAuth {
            tokens: HashMap::new(),
            rng,
        }
    }

    fn issue(&mut self, username: &str, identifier: &str, expires_at: i64) -> Identity {
        let identity = Identity {
            username: username.to_string(),
            identifier: identifier.to_string(),
            token: hex_token(&mut self.rng, 20),
            expires_at,
        };
        info!("Issued token for \"{}\" ({})", username, identifier);
        self.tokens.insert(identity.token.clone(), identity.clone());
        identity
    }

    /// Looks a token up, lazily revoking it when expired.
    fn take_valid(&mut self, token: &str) -> Option<Identity> {
        match self.tokens.get(token) {
            Some(identity) if now_ms() > identity.expires_at => {
                info!("Token expired for \"{}\"", identity.username);
                self.tokens.remove(token);
                None
            }
            Some(identity) => Some(identity.clone()),
            None => None,
        }
    }

    fn login_fresh(
        &mut self,
        username: &str,
        in_use: &dyn Fn(&str) -> bool,
    ) -> Result<Identity, ErrorCode> {
        let identifier = username.to_lowercase();
        if in_use(&identifier) {
            warn!("Account \"{}\" already in use", username);
            return Err(ErrorCode::IdentityInUse);
        }
        info!("Authenticated as \"{}\"", username);
        Ok(self.issue(username, &identifier, now_ms() + TOKEN_LIFETIME_MS))
    }

    /// Token logins hand out a fresh token but keep the original expiry, so
    /// a reconnect loop cannot extend an identity forever.
    fn login_with_token(
        &mut self,
        username: &str,
        token: &str,
        in_use: &dyn Fn(&str) -> bool,
    ) -> Result<Identity, ErrorCode> {
        let known = match self.take_valid(token) {
            Some(identity) => identity,
            None => {
                warn!("Token not found or expired");
                return Err(ErrorCode::LoginToken);
            }
        };
        if known.username != username {
            warn!(
                "Username \"{}\" does not match the presented token",
                username
            );
            return Err(ErrorCode::LoginToken);
        }
        if in_use(&known.identifier) {
            warn!("Account \"{}\" already in use", known.username);
            return Err(ErrorCode::IdentityInUse);
        }

        info!(
            "Re-issueing token for \"{}\" ({})",
            known.username, known.identifier
        );
        self.tokens.remove(token);
        Ok(self.issue(&known.username, &known.identifier, known.expires_at))
    }
}

impl Authenticator for BasicAuth {
    fn login(
        &mut self,
        request: &LoginRequest,
        in_use: &dyn Fn(&str) -> bool,
    ) -> Result<Identity, ErrorCode> {
        let username = request.username.trim();
        let game = request.game.trim();

        if request.client_version != PROTOCOL_VERSION {
            warn!("Client version mismatch v{}", request.client_version);
            return Err(ErrorCode::LoginVersion);
        }
        if game.is_empty() || request.game_version == 0 {
            warn!("Invalid game \"{}\" @ v{}", game, request.game_version);
            return Err(ErrorCode::LoginGame);
        }
        if !valid_username(username) {
            warn!("Invalid username \"{}\"", username);
            return Err(ErrorCode::LoginUsername);
        }

        match request.token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => {
                if token.len() != 40 {
                    warn!("Malformed token");
                    return Err(ErrorCode::LoginToken);
                }
                self.login_with_token(username, token, in_use)
            }
            _ => self.login_fresh(username, in_use),
        }
    }

    fn sweep(&mut self) {
        let now = now_ms();
        let before = self.tokens.len();
        self.tokens.retain(|_, identity| now <= identity.expires_at);
        let dropped = before - self.tokens.len();
        if dropped > 0 {
            info!("Swept {} expired identities", dropped);
        }
    }
}

/// Usernames are 3 to 16 characters from `[0-9a-zA-Z_$]`.
fn valid_username(name: &str) -> bool {
    (3..=16).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
