/// Build commit, set by the image build through `PINGER_GIT_COMMIT`.
const GIT_COMMIT: Option<&str> = option_env!("PINGER_GIT_COMMIT");

/// One-line description of this build for the startup log.
pub fn banner() -> String {
    format!(
        "{} version {}, commit {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        GIT_COMMIT.unwrap_or("unknown")
    )
}
