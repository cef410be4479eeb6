use clap::Parser;
use color_eyre::eyre::Result;
use kube_resource_advisor::{CliOpts, do_main};

fn init_tracing() -> Result<()> {
    use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::{EnvFilter, Registry};

    let app_name = env!("CARGO_CRATE_NAME");
    // stdout is reserved for the report
    let formatting_layer = BunyanFormattingLayer::new(app_name.to_owned(), std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = Registry::default()
        .with(filter)
        .with(JsonStorageLayer)
        .with(formatting_layer)
        .with(tracing_error::ErrorLayer::default());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    color_eyre::config::HookBuilder::default()
        .panic_section("consider reporting the bug with the command line and the logs (RUST_LOG=debug)")
        .install()?;
    let cli_opts = CliOpts::parse();
    do_main(&cli_opts).await?;
    Ok(())
}
