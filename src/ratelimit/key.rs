//! Limiter key composition.

/// Separator placed between key components.
///
/// Client addresses never contain it, and the rule parser rejects method
/// lists and resources that do.
pub const KEY_SEPARATOR: char = '|';

/// Build the key that identifies one limiter.
///
/// The key is the client address, the rule's method string and the matched
/// resource joined by [`KEY_SEPARATOR`], in that order. No normalization is
/// applied: requests only share a bucket when all three components are
/// byte-for-byte identical.
pub fn build_key(client_ip: &str, methods: &str, resource: &str) -> String {
    let mut key = String::with_capacity(client_ip.len() + methods.len() + resource.len() + 2);
    key.push_str(client_ip);
    key.push(KEY_SEPARATOR);
    key.push_str(methods);
    key.push(KEY_SEPARATOR);
    key.push_str(resource);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(build_key("1.2.3.4", "GET", "/a"), "1.2.3.4|GET|/a");
        assert_eq!(build_key("::1", "GET,POST", "*"), "::1|GET,POST|*");
    }

    #[test]
    fn test_key_is_stable() {
        let key1 = build_key("1.2.3.4", "GET", "/a");
        let key2 = build_key("1.2.3.4", "GET", "/a");

        assert_eq!(key1, key2);
    }

    #[test]
    fn test_key_distinguishes_resources() {
        assert_ne!(build_key("1.2.3.4", "GET", "/a"), build_key("1.2.3.4", "GET", "/b"));
    }

    #[test]
    fn test_key_is_order_sensitive() {
        assert_ne!(build_key("GET", "1.2.3.4", "/a"), build_key("1.2.3.4", "GET", "/a"));
    }

    #[test]
    fn test_key_does_not_normalize() {
        assert_ne!(build_key("1.2.3.4", "get", "/a"), build_key("1.2.3.4", "GET", "/a"));
        assert_ne!(build_key("1.2.3.4", "GET", "/a/"), build_key("1.2.3.4", "GET", "/a"));
    }
}
