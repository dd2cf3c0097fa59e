//! Request keys for cached responses.

use sha2::{Digest, Sha256};

/// Compute the storage key of a request within one namespace.
pub fn request_key(method: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// The URL with its query string and fragment removed.
pub fn without_search(url: &str) -> &str {
    match url.find(['?', '#']) {
        Some(end) => &url[..end],
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_stability() {
        let key1 = request_key("GET", "https://pos.local/app/posapp");
        let key2 = request_key("get", "https://pos.local/app/posapp");
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_key_differs_by_url() {
        assert_ne!(request_key("GET", "https://pos.local/a?v=1"), request_key("GET", "https://pos.local/a?v=2"));
    }

    #[test]
    fn test_key_format() {
        let key = request_key("GET", "https://pos.local/");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_without_search() {
        assert_eq!(without_search("https://pos.local/app/posapp?x=1"), "https://pos.local/app/posapp");
        assert_eq!(without_search("https://pos.local/a.js#frag"), "https://pos.local/a.js");
        assert_eq!(without_search("https://pos.local/a.js"), "https://pos.local/a.js");
    }
}
