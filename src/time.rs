//! Time functions, a small shim over chrono.

use chrono::Utc;

/// The current unix time, in seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn now_is_positive() {
        assert!(now() > 0);
    }
}
