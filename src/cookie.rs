//! Cookie minting and verification, delegated to the embedding application.
//!
//! The listener cannot mint or check cookies itself: a cookie's validity
//! must bind the client to its apparent source address, and only the
//! embedder knows which keys and which address book to do that with. Both
//! operations are injected as callbacks, mirroring how the transport and
//! record layer are injected as traits.

use bytes::Bytes;

use connection::Connection;
use packet::MAX_COOKIE_LENGTH;
use Error;

/// Mints a fresh cookie binding `conn`'s peer address. `None` reports
/// failure.
pub type GenerateCookie = Box<FnMut(&Connection) -> Option<Bytes>>;

/// Checks a cookie echoed back by a client.
pub type VerifyCookie = Box<FnMut(&Connection, &[u8]) -> bool>;

/// Host-supplied cookie callbacks.
pub struct CookieEngine {
    generate: Option<GenerateCookie>,
    verify: Option<VerifyCookie>,
}

impl CookieEngine {
    pub fn new() -> Self {
        CookieEngine {
            generate: None,
            verify: None,
        }
    }

    pub fn set_generate_callback(&mut self, callback: GenerateCookie) {
        self.generate = Some(callback);
    }

    pub fn set_verify_callback(&mut self, callback: VerifyCookie) {
        self.verify = Some(callback);
    }

    /// Mint the cookie for a HelloVerifyRequest. Any failure here is fatal
    /// to the listen attempt, including a cookie too long for its one-byte
    /// length field.
    pub fn mint(&mut self, conn: &Connection) -> Result<Bytes, Error> {
        let cookie = self.generate
            .as_mut()
            .and_then(|generate| generate(conn))
            .ok_or(Error::CookieGenFailure)?;
        if cookie.len() > MAX_COOKIE_LENGTH {
            return Err(Error::CookieGenFailure);
        }
        Ok(cookie)
    }

    /// Check a client-provided cookie. A missing verifier is a
    /// configuration fault and fails the listen; a bad cookie is not an
    /// error, since RFC 6347 treats it exactly like an absent one.
    pub fn verify(&mut self, conn: &Connection, cookie: &[u8]) -> Result<bool, Error> {
        match self.verify {
            Some(ref mut verify) => Ok(verify(conn, cookie)),
            None => Err(Error::NoCookieVerifier),
        }
    }
}

impl Default for CookieEngine {
    fn default() -> Self {
        CookieEngine::new()
    }
}
