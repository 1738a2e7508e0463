//! CLI color policy.
//!
//! Resolution order:
//! - `--color` on the command line wins.
//! - `NO_COLOR` disables colors in `auto`.
//! - `EMACS` implies non-interactive output in `auto`.
//! - Otherwise `auto` colors only when the stream is a TTY.

use std::env;

/// When to emit ANSI colors.
///
/// Parsed directly by clap (`--color auto|always|never`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    #[default]
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !env_disables_color() && atty::is(stream),
        }
    }

    /// Convenience helper for stderr, where tracing output goes.
    pub fn should_color_stderr(self) -> bool {
        self.should_color(atty::Stream::Stderr)
    }
}

fn env_disables_color() -> bool {
    // ---
    env::var_os("NO_COLOR").is_some() || env::var_os("EMACS").is_some()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn parses_from_cli_values() {
        // ---
        assert_eq!(ColorWhen::from_str("never", true), Ok(ColorWhen::Never));
        assert_eq!(ColorWhen::from_str("ALWAYS", true), Ok(ColorWhen::Always));
        assert!(ColorWhen::from_str("sometimes", true).is_err());
        assert_eq!(ColorWhen::default(), ColorWhen::Auto);
    }

    #[test]
    fn explicit_choices_ignore_environment() {
        // ---
        assert!(ColorWhen::Always.should_color_stderr());
        assert!(!ColorWhen::Never.should_color_stderr());
    }
}
