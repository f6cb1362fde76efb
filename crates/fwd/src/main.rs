use std::sync::Arc;

use fwd_core::config::Config;
use fwd_mtproto::MtprotoConnector;

#[tokio::main]
async fn main() -> Result<(), fwd_core::Error> {
    fwd_core::logging::init("fwd")?;

    let cfg = Arc::new(Config::load()?);
    std::fs::create_dir_all(&cfg.sessions_dir)?;
    tracing::info!(
        sessions_dir = %cfg.sessions_dir.display(),
        data_file = %cfg.data_file.display(),
        "starting forwarder"
    );

    let connector = Arc::new(MtprotoConnector::new(&cfg));

    fwd_telegram::router::run_polling(cfg, connector)
        .await
        .map_err(|e| fwd_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
