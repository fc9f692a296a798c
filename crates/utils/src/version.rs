use std::sync::LazyLock;

/// Defines the application version.
///
/// `IMAGE_VERSION` comes from the `VERSION` build environment variable and
/// falls back to the crate version; the git revision is appended when the
/// build ran inside a checkout.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let dirty = matches!(option_env!("VERGEN_GIT_DIRTY"), Some("true"));
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        if dirty { "-dirty" } else { "" }
    )
});
