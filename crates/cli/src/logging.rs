use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Used when `RUST_LOG` is unset or invalid.
const DEFAULT_DIRECTIVES: &str = "info,hf_hub=warn";

fn filter(quiet: bool, from_env: Option<EnvFilter>) -> EnvFilter {
    if quiet {
        return EnvFilter::new("error");
    }
    from_env.unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the stderr subscriber once; stdout carries only generated text.
pub fn init(quiet: bool) {
    INIT.call_once(|| {
        let from_env = EnvFilter::try_from_default_env().ok();
        tracing_subscriber::fmt()
            .with_env_filter(filter(quiet, from_env))
            .with_target(!quiet)
            .with_writer(std::io::stderr)
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_ignores_the_environment() {
        let env = Some(EnvFilter::new("trace"));
        assert_eq!(filter(true, env).to_string(), "error");
    }

    #[test]
    fn environment_replaces_the_defaults() {
        assert_eq!(filter(false, Some(EnvFilter::new("debug"))).to_string(), "debug");
        let defaults = filter(false, None).to_string();
        assert!(defaults.contains("hf_hub=warn"), "{defaults}");
    }
}
