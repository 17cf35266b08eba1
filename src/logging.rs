//! Logger initialization: a stderr sink, set up before anything else
//! in `main`.

use std::io::Write;

/// Initialize the global logger. Must be called once, before any other
/// startup step.
pub fn init() {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(buf, "flux-imp: {}: {}", record.level(), record.args())
    });
    let _ = builder.try_init();
}
