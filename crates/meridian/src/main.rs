use meridian::{app, cli::CliArgs, config::AppConfig, logging};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    args.apply_overrides(&mut config);
    config.validate().map_err(std::io::Error::other)?;

    logging::setup_logging(&config.logging, args.json_logs)?;
    logging::display_banner();

    app::run(args.role, config).await
}
