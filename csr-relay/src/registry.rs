//! Proxy id registry for relay routing
//!
//! Maps each registered NetProxy unique id to the connection that claimed
//! it, and back, so a closing connection releases its id.

use std::collections::HashMap;

use mio::Token;
use netproxy_core::relay::RelayErrorCode;

// ============================================================================
// Registry Structure
// ============================================================================

pub struct Registry {
    /// Proxy id to the connection that registered it
    by_id: HashMap<u32, Token>,
    /// Reverse map for cleanup
    by_token: HashMap<Token, u32>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            by_id: HashMap::new(),
            by_token: HashMap::new(),
        }
    }

    /// Claim `proxy_id` for `token`
    ///
    /// Registering again on the same connection is accepted; a connection
    /// re-registering under a new id gives up the old one.
    pub fn register(&mut self, token: Token, proxy_id: u32) -> Result<(), RelayErrorCode> {
        match self.by_id.get(&proxy_id) {
            Some(owner) if *owner == token => return Ok(()),
            Some(_) => {
                log::warn!("Proxy {} already registered on another connection", proxy_id);
                return Err(RelayErrorCode::DuplicateId);
            }
            None => {}
        }
        if let Some(old) = self.by_token.insert(token, proxy_id) {
            self.by_id.remove(&old);
        }
        self.by_id.insert(proxy_id, token);
        log::info!("Registered proxy {} ({:?})", proxy_id, token);
        Ok(())
    }

    /// Release whatever `token` registered
    pub fn unregister(&mut self, token: Token) -> Option<u32> {
        let proxy_id = self.by_token.remove(&token)?;
        self.by_id.remove(&proxy_id);
        log::info!("Unregistered proxy {} ({:?})", proxy_id, token);
        Some(proxy_id)
    }

    pub fn proxy_of(&self, token: Token) -> Option<u32> {
        self.by_token.get(&token).copied()
    }

    /// Connection to deliver to, if `proxy_id` is registered
    pub fn route(&self, proxy_id: u32) -> Result<Token, RelayErrorCode> {
        self.by_id
            .get(&proxy_id)
            .copied()
            .ok_or(RelayErrorCode::UnknownPeer)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_route() {
        let mut registry = Registry::new();
        registry.register(Token(1), 10).unwrap();
        registry.register(Token(2), 20).unwrap();

        assert_eq!(registry.route(10), Ok(Token(1)));
        assert_eq!(registry.route(20), Ok(Token(2)));
        assert_eq!(registry.route(30), Err(RelayErrorCode::UnknownPeer));
        assert_eq!(registry.proxy_of(Token(2)), Some(20));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = Registry::new();
        registry.register(Token(1), 10).unwrap();

        assert_eq!(registry.register(Token(2), 10), Err(RelayErrorCode::DuplicateId));
        // Same connection again is fine
        assert_eq!(registry.register(Token(1), 10), Ok(()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregister_releases_old_id() {
        let mut registry = Registry::new();
        registry.register(Token(1), 10).unwrap();
        registry.register(Token(1), 11).unwrap();

        assert_eq!(registry.route(10), Err(RelayErrorCode::UnknownPeer));
        assert_eq!(registry.route(11), Ok(Token(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let mut registry = Registry::new();
        registry.register(Token(1), 10).unwrap();

        assert_eq!(registry.unregister(Token(1)), Some(10));
        assert_eq!(registry.unregister(Token(1)), None);
        assert_eq!(registry.route(10), Err(RelayErrorCode::UnknownPeer));
        // The id is free again
        registry.register(Token(2), 10).unwrap();
    }
}
