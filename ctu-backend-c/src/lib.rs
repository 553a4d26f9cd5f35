#![forbid(unsafe_code)]

mod emit;

pub use emit::emit;

use serde::Deserialize;

/// Knobs for C emission. Read from the `[emit]` table of `ctu.toml`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmitOptions {
    /// Emit `#line` directives pointing back at the source unit before each
    /// function definition.
    pub line_directives: bool,
    /// Start the file with a comment naming the unit it was generated from.
    pub banner: bool,
}
