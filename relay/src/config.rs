//! Environment-variable configuration. No config files, no CLI flags.

/// Relay listen port. `PORT`, default 3000.
pub fn port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_3000_when_unset() {
        // Safe because tests run single-threaded within this module's env
        // mutation scope is not guaranteed across the whole test binary,
        // so we only assert the default when the var is genuinely absent.
        if std::env::var("PORT").is_err() {
            assert_eq!(port(), 3000);
        }
    }
}
