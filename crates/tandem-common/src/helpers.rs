//! Small helpers shared by the engine and the CLI.

/// Constant-time string comparison, used for ICE credentials.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() != b_bytes.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a_bytes.iter().zip(b_bytes.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Wall-clock microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Random token of `len` characters from the ICE credential alphabet.
pub fn random_ice_token(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("ufrag:pwd", "ufrag:pwd"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("short", "much_longer_string"));
    }

    #[test]
    fn test_env_bool_values() {
        std::env::set_var("TANDEM_TEST_ENV_TRUE", " Yes ");
        assert!(env_bool("TANDEM_TEST_ENV_TRUE", false));

        std::env::set_var("TANDEM_TEST_ENV_FALSE", "off");
        assert!(!env_bool("TANDEM_TEST_ENV_FALSE", true));

        assert!(env_bool("TANDEM_DEFINITELY_NOT_SET_12345", true));
        assert!(!env_bool("TANDEM_DEFINITELY_NOT_SET_12345", false));
    }

    #[test]
    fn test_now_us_reasonable() {
        let t1 = now_us();
        let t2 = now_us();
        assert!(t1 > 1_577_836_800u64 * 1_000_000);
        assert!(t2 >= t1);
    }

    #[test]
    fn test_random_ice_token() {
        let a = random_ice_token(16);
        let b = random_ice_token(16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/'));
    }
}
