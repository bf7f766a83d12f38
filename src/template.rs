//! Expansion of the configuration templates pushed to machines.

use crate::error::Error;
use minijinja::Environment;
use serde::Serialize;

/// Expands `body` against `options`.
///
/// Templates use Jinja syntax. Trailing newlines are preserved, since most of the output ends up
/// in config files and unit definitions.
///
/// # Errors
///
/// Returns [Error::Template] if `body` is not a valid template or refers to something that
/// `options` can't provide.
pub fn render(body: &str, options: &impl Serialize) -> Result<String, Error> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
    Ok(env.render_str(body, options)?)
}
