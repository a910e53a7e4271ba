//! Interactive console for beamctl.
//!
//! Runs the verb vocabulary against the in-memory simulation, either as a
//! REPL or by executing a script file. The live channel-access transport is
//! an external collaborator; embedders wire it through
//! [`beamctl::session::Session::live`].

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;

use beamctl::config::Settings;
use beamctl::script::ScriptHost;
use beamctl::session::Session;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "beamctl", about = "Scripting control console for a pulsed-neutron instrument")]
struct Cli {
    /// Instrument identifier (host name, bare name or explicit prefix).
    #[arg(long)]
    instrument: Option<String>,

    /// Script file to execute instead of starting the REPL.
    #[arg(long)]
    script: Option<String>,

    /// Settings file (defaults to beamctl.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Treat script warnings as errors.
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    if cli.instrument.is_some() {
        settings.instrument = cli.instrument.clone();
    }

    let (session, sim) = Session::simulated(settings);
    seed_demo_blocks(&sim).await;
    log::info!("session prefix: {}", session.prefix());

    let session = Arc::new(session);
    let mut host = ScriptHost::new(session.clone(), Handle::current());

    match &cli.script {
        Some(script) => {
            session.set_exceptions_raised(true);
            host.load_script(script, cli.strict)
                .with_context(|| format!("loading {}", script))?;
            Ok(())
        }
        None => repl(&mut host),
    }
}

/// A couple of blocks so the offline console has something to poke at.
async fn seed_demo_blocks(sim: &beamctl::backend::sim::SimBackend) {
    sim.add_block("Temp1", 300.0).await;
    sim.add_block("Field", 0.5).await;
    sim.add_block("Phase", 0.0).await;
}

fn repl(host: &mut ScriptHost) -> Result<()> {
    println!("beamctl console; verbs are functions, e.g. begin(); end(). Ctrl-D quits.");
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        print!(">> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            return Ok(());
        }
        match host.run_line(line) {
            Ok(Some(output)) => println!("{}", output),
            Ok(None) => {}
            Err(e) => eprintln!("ERROR: {}", e),
        }
    }
}
