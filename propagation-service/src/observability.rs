use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    EnvFilter,
};

pub fn init_tracing() {
    let directive: Directive = "propagation_service=info"
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let filter = EnvFilter::from_default_env().add_directive(directive);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
