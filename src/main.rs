use anyhow::Result;
use gesture_trainer::cli::interface::run_cli_interface;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    run_cli_interface().await?;
    Ok(())
}
