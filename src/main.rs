use std::path::PathBuf;

const DEFAULT_SETTINGS_PATH: &str = "logsync.json";

#[tokio::main]
async fn main() {
    logsync_lib::init_tracing();

    let settings_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));

    let settings = match logsync_lib::settings::EngineSettings::load(&settings_path) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::error!(path = %settings_path.display(), settings_error = %error, "Failed to load settings");
            std::process::exit(1);
        }
    };

    if let Err(error) = logsync_lib::run(settings).await {
        tracing::error!("logsync stopped: {error}");
        std::process::exit(1);
    }
}
