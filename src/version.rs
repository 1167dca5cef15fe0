//! Version reporting
//!
//! The effective version can be overridden with `BLOCKHAUS_VERSION` for
//! deployments that stamp builds externally; otherwise the crate version
//! from Cargo is used.

/// Resolve the version string reported at startup and by `--version`.
pub fn version() -> String {
    std::env::var("BLOCKHAUS_VERSION")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
}

#[cfg(test)]
mod tests {
    use super::version;

    #[test]
    fn falls_back_to_crate_version() {
        // The override variable is not set under cargo test.
        if std::env::var("BLOCKHAUS_VERSION").is_err() {
            assert_eq!(version(), env!("CARGO_PKG_VERSION"));
        }
    }
}
