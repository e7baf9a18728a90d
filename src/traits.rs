//! Traits a host application implements so the engine can read an actor's
//! federation-relevant fields without depending on the host's object model.

use url::Url;

/// Minimal view of an actor the engine needs: its id, inbox, and public
/// key, so that it can verify HTTP Signatures and route deliveries without
/// depending on the host's full actor representation.
pub trait Actor: Send + Sync {
    /// The actor's id (also its ActivityPub URI).
    fn id(&self) -> &Url;
    /// PEM-encoded RSA public key used to verify HTTP Signatures signed by
    /// this actor, if it has one.
    fn public_key_pem(&self) -> Option<&str>;
    /// The actor's personal inbox.
    fn inbox(&self) -> &Url;
    /// The actor's shared inbox, if its instance provides one.
    fn shared_inbox(&self) -> Option<&Url> {
        None
    }
}
