//! Embedded templates for files written by `mender init`.

/// Default `mender.toml` configuration.
pub(crate) const MENDER_TOML: &str = include_str!("mender.toml");
