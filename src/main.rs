#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = redink::run_save_server().await {
        eprintln!("redink-save-server fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
