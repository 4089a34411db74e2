//! drive_fleet CLI entry point

use std::path::Path;
use std::rc::Rc;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use anki_transport::BluezHost;
use drive_fleet::catalog;
use drive_fleet::cli::Cli;
use drive_fleet::engine::{self, Engine};
use drive_fleet::observer::NullObserver;
use drive_fleet::output::Output;
use drive_fleet::pidfile::PidFile;
use drive_fleet::shell::Shell;

fn main() -> Result<()> {
    let binary = std::env::args().next().unwrap_or_else(|| "drive_fleet".into());
    let pidfile = PidFile::acquire(&binary)?;
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("drive_fleet=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    // A successor instance evicts us with SIGTERM and waits for the
    // pid file to vanish; remove it on the way out.
    let pid_path = pidfile.path().to_path_buf();
    ctrlc::set_handler(move || {
        let _ = std::fs::remove_file(&pid_path);
        std::process::exit(0);
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(async move {
        let out = Output::new();
        let (engine, events_rx, gate) = Engine::new(
            Rc::new(BluezHost::new()),
            out.clone(),
            Box::new(NullObserver),
        );

        {
            let mut engine = engine.borrow_mut();
            catalog::load_into(engine.registry_mut(), Path::new(catalog::CATALOG_FILE));
            match engine.pool_mut().discover() {
                Ok(true) => {}
                Ok(false) => out.warning("No Bluetooth controllers found."),
                Err(e) => warn!(error = %e, "HCI enumeration failed"),
            }
        }

        let engine_task = tokio::task::spawn_local(engine::run(engine.clone(), events_rx));

        let mut shell = Shell::new(engine.clone(), gate, out, cli.background);
        let shell_result = shell.run().await;

        // Ask every vehicle to hang up, give the loop one pass to push
        // the writes out, then tear everything down.
        engine.borrow_mut().shutdown();
        tokio::task::yield_now().await;
        engine_task.abort();

        shell_result
    }))?;

    drop(pidfile);
    Ok(())
}
