//! Checks that received data is self-consistent

use url::Url;

use crate::error::Error;

/// Check that both URLs share a domain, e.g. an activity's id and its
/// actor's id during forwarding.
///
/// ```
/// # use url::Url;
/// # use fedikit::protocol::verification::verify_domains_match;
/// let a = Url::parse("https://example.com/abc")?;
/// let b = Url::parse("https://sample.net/abc")?;
/// assert!(verify_domains_match(&a, &b).is_err());
/// # Ok::<(), url::ParseError>(())
/// ```
pub fn verify_domains_match(a: &Url, b: &Url) -> Result<(), Error> {
    if a.domain() != b.domain() {
        return Err(Error::UrlVerificationError("domains do not match"));
    }
    Ok(())
}

/// Check that two URLs are identical.
pub fn verify_urls_match(a: &Url, b: &Url) -> Result<(), Error> {
    if a != b {
        return Err(Error::UrlVerificationError("urls do not match"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_domains_pass() {
        let a = Url::parse("https://example.com/a").unwrap();
        let b = Url::parse("https://example.com/b").unwrap();
        assert!(verify_domains_match(&a, &b).is_ok());
    }

    #[test]
    fn mismatched_domains_fail() {
        let a = Url::parse("https://example.com/a").unwrap();
        let b = Url::parse("https://other.example/a").unwrap();
        assert!(verify_domains_match(&a, &b).is_err());
    }
}
