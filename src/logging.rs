use anyhow::Result;
use tracing::Level;
use tracing_subscriber::fmt;

/// Install the stderr subscriber. Without `verbose` nothing is logged, so
/// progress output and written files stay the only output.
pub fn init(verbose: bool) -> Result<()> {
    if !verbose {
        return Ok(());
    }
    let _ = fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
    Ok(())
}
