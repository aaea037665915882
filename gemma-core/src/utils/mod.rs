pub(crate) mod dtype;
pub(crate) mod log;

/// Declares a zero-argument function returning `$v`, for use as a `#[serde(default = ...)]`.
#[macro_export]
macro_rules! serde_default_fn {
    ($t:ty, $name:ident, $v:expr) => {
        fn $name() -> $t {
            $v
        }
    };
}
