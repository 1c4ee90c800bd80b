use tracing_subscriber::{EnvFilter, prelude::*};

const WORKSPACE_TARGETS: [&str; 4] = ["client", "services", "git", "utils"];

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_level`; either way the level is applied to the
/// workspace crates only and everything else stays at `warn`.
pub fn init(default_level: &str) {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    let env_filter = EnvFilter::try_new(filter_string(&level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .try_init();
}

fn filter_string(level: &str) -> String {
    let mut filter = String::from("warn");
    for target in WORKSPACE_TARGETS {
        filter.push_str(&format!(",{target}={level}"));
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_scopes_level_to_workspace_crates() {
        assert_eq!(
            filter_string("debug"),
            "warn,client=debug,services=debug,git=debug,utils=debug"
        );
    }
}
