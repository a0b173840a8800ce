use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};
use signal_hook::iterator::Signals;

use mpipe::config;
use mpipe::multiplexer::{Config, Multiplexer};
use mpipe::socket::SocketConfig;

static TERMINATE: AtomicBool = AtomicBool::new(false);

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<()> {
    let node_config = config::from_args().context("loading node configuration")?;
    setup_logger(&node_config.log)?;

    let mut signals = Signals::new(&[libc::SIGINT, libc::SIGTERM])?;
    thread::spawn(move || {
        for _ in signals.forever() {
            TERMINATE.store(true, Ordering::Relaxed);
        }
    });

    let socket_config = SocketConfig {
        node_index: node_config.node_index,
        master_host: node_config.master_host.clone(),
        master_port: node_config.master_port,
        slave_group: node_config.slave_group.clone(),
        slave_port: node_config.slave_port,
    };

    let mux = Multiplexer::with_config(
        node_config.node_index,
        node_config.num_slaves,
        socket_config,
        Config::default(),
    )
    .context("setting up multiplexer")?;

    info!(
        "node {} waiting for {} peer(s) to connect",
        node_config.node_index, node_config.num_slaves
    );
    mux.wait_for_connection()
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    info!("node {} connected", node_config.node_index);

    let pipe_id = mux.open_pipe().map_err(|e| anyhow::anyhow!("{}", e))?;
    info!("node {} opened pipe {}", node_config.node_index, pipe_id);

    if node_config.node_index == 0 {
        let mut counter: u64 = 0;
        while !TERMINATE.load(Ordering::Relaxed) {
            let payload = counter.to_le_bytes();
            if let Err(e) = mux.send_packet(pipe_id, &payload) {
                error!("send failed: {}", e);
                break;
            }
            counter += 1;
            thread::sleep(Duration::from_millis(100));
        }
    } else {
        let mut received: u64 = 0;
        while !TERMINATE.load(Ordering::Relaxed) {
            match mux.receive_packet(pipe_id) {
                Ok(payload) => {
                    received += payload.len() as u64;
                    info!("node {} received {} bytes total", node_config.node_index, received);
                }
                Err(e) => {
                    error!("receive failed: {}", e);
                    break;
                }
            }
        }
    }

    mux.close_pipe(pipe_id).map_err(|e| anyhow::anyhow!("{}", e))?;
    info!("node {} shutting down", node_config.node_index);
    Ok(())
}

fn setup_logger(log: &config::LogOpt) -> Result<()> {
    let level = match log.level.as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    fern::Dispatch::new()
        .level(level)
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}",
                record.level(),
                record.target(),
                message,
            ))
        })
        .chain(std::io::stdout())
        .apply()?;

    Ok(())
}
