use chrono::Utc;
use gsc_backup::{
    Config, DateWindow, Pipeline, SearchConsole,
    auth::{ClientSecret, GoogleOAuth, StdinPrompt, TokenStore, obtain_token},
};
use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_default()?;
    let now = Utc::now();
    let window = DateWindow::from_clock(now, &config)?;

    let endpoint = GoogleOAuth::new(ClientSecret::load(&config.client_secret)?)?;
    let store = TokenStore::new(&config.credentials);
    let token = obtain_token(&endpoint, &mut StdinPrompt, &store, now)?;

    let console = SearchConsole::new(token.access_token)?;
    let summary = Pipeline::new(&console, &config, window).run()?;

    info!(
        sheets = summary.sheets.len(),
        rows = summary.rows_written(),
        "backup finished"
    );
    Ok(())
}
