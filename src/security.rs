use subtle::ConstantTimeEq;

/// Constant-time string comparison to prevent timing attacks.
/// Used for the API key gate on the router endpoints.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
