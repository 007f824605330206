//! Shorthands for building and returning [`crate::error::FlowError`]s.

/// Creates a [`crate::error::FlowError`] from a kind and a static description.
///
/// Dynamic detail can be appended either as an owned value (`detail = value`) or as
/// anything implementing [`ToString`], and a source error with `source: err`.
#[macro_export]
macro_rules! flow_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::FlowError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::FlowError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        $crate::error::FlowError::from(($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr, source: $source:expr) => {
        $crate::error::FlowError::from(($kind, $desc, $detail)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::FlowError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::FlowError::from(($kind, $desc, $detail.to_string())).with_source($source)
    };
}

/// Returns early with a [`crate::error::FlowError`], accepting the same forms as [`flow_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return ::core::result::Result::Err($crate::flow_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::flow_error!($kind, $desc, source: $source))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        return ::core::result::Result::Err($crate::flow_error!($kind, $desc, detail = $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return ::core::result::Result::Err($crate::flow_error!($kind, $desc, $detail))
    };
}
