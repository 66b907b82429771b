use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

fn layered(filter: &str) -> impl SubscriberInitExt {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    Registry::default().with(env_filter).with(fmt_layer)
}

/// Install the global subscriber unless one is already set. Returns
/// whether this call installed it.
pub fn try_init_tracing(filter: &str) -> bool {
    layered(filter).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn second_install_is_refused() {
        try_init_tracing("peer_mesh=debug");
        assert!(!try_init_tracing("info"));
        tracing::debug!("subscriber installed");
    }
}
