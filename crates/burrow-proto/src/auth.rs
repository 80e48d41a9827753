//! Credential parsing

/// Split an auth string into `(user, password)` on its first `:`.
///
/// A string without a separator yields empty credentials.
pub fn parse_auth(auth: &str) -> (String, String) {
    match auth.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_splits_on_first_colon() {
        assert_eq!(
            parse_auth("admin:s3cr:et"),
            ("admin".to_string(), "s3cr:et".to_string())
        );
    }

    #[test]
    fn test_parse_auth_without_separator() {
        assert_eq!(parse_auth("admin"), (String::new(), String::new()));
        assert_eq!(parse_auth(""), (String::new(), String::new()));
    }

    #[test]
    fn test_parse_auth_empty_password() {
        assert_eq!(parse_auth("user:"), ("user".to_string(), String::new()));
    }
}
