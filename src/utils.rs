//! # Utility Functions Module
//!
//! Small helpers shared by the argument builders and the log messages.

use std::path::Path;

/// Converts any iterable of string-like items to `Vec<String>`.
///
/// Used by the plan builders so argument templates read as flat lists.
///
/// # Example
/// ```rust
/// use media_engine::utils::to_string_vec;
///
/// let crf = 26;
/// let args = to_string_vec(["-crf", &crf.to_string(), "-preset", "slow"]);
/// assert_eq!(args[1], "26");
/// ```
pub fn to_string_vec<T, I>(items: I) -> Vec<String>
where
    T: ToString,
    I: IntoIterator<Item = T>,
{
    items.into_iter().map(|item| item.to_string()).collect()
}

/// Builds a `Vec<String>` argument list from mixed literals and values.
///
/// # Example
/// ```rust
/// use media_engine::args;
///
/// let fps = 30;
/// let args = args!["-fpsmax", fps, "-nostats"];
/// assert_eq!(args, vec!["-fpsmax", "30", "-nostats"]);
/// ```
#[macro_export]
macro_rules! args {
    [$($item:expr),* $(,)?] => {
        $crate::utils::to_string_vec([$($item.to_string()),*])
    };
}

/// Path rendered as a command-line argument (lossy on non UTF-8 names)
pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Short file name for log lines and user-facing messages
pub fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
