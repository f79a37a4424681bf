// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Monitor event-builder process
//!
//! Serves built events to monitoring consumers: contributions stream in
//! from the data-readout processes, the event builder matches them into
//! events, and complete events land in a shared-memory ring that consumer
//! processes attach to. The collection server drives the lifecycle
//! (connect, configure, beginrun, disconnect, reset).

mod collection;
mod meb;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use eventlib::config::{self, MebParams};
use eventlib::link::LoopbackFabric;
use meb::{Meb, MebCommand};

/// First port tried for the prometheus endpoint.
const PROM_PORT_BASE: u16 = 9200;
const MAX_PROM_PORTS: u16 = 100;

static RUNNING: AtomicBool = AtomicBool::new(true);
static INT_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_sigint(_signal: libc::c_int) {
    if INT_COUNT.fetch_add(1, Ordering::Relaxed) == 0 {
        RUNNING.store(false, Ordering::Release);
    } else {
        // Second ^C: give up on the graceful path.
        unsafe { libc::_exit(130) };
    }
}

#[derive(Parser)]
#[command(name = "eventlib-monitor")]
#[command(author, version, about = "Monitor event builder", long_about = None)]
struct Cli {
    /// Partition number
    #[arg(short = 'p', long)]
    partition: u32,

    /// Instrument name
    #[arg(short = 'P', long)]
    instrument: String,

    /// Collection server address (host:port)
    #[arg(short = 'C', long = "collection")]
    collection: String,

    /// Unique alias for this process
    #[arg(short = 'u', long)]
    alias: String,

    /// Number of shared-memory event buffers
    #[arg(short = 'n', long = "num-buffers", default_value_t = config::MIN_EV_BUFFERS)]
    num_ev_buffers: usize,

    /// Number of consumer event queues
    #[arg(short = 'q', long = "num-queues", default_value_t = 1)]
    num_ev_queues: usize,

    /// Give each event to one consumer instead of all of them
    #[arg(short = 'd', long)]
    distribute: bool,

    /// Shared-memory tag; defaults to the instrument name
    #[arg(short = 't', long)]
    tag: Option<String>,

    /// Network interface address override
    #[arg(short = 'A', long = "if-addr")]
    if_addr: Option<String>,

    /// Prometheus scrape-target config directory
    #[arg(short = 'M', long = "prometheus-dir")]
    prometheus_dir: Option<PathBuf>,

    /// Core to pin the builder thread to (-1 disables)
    #[arg(short = '1', long = "core-app", default_value_t = -1, allow_negative_numbers = true)]
    core_app: i32,

    /// Core to pin auxiliary threads to (-1 disables)
    #[arg(short = '2', long = "core-aux", default_value_t = -1, allow_negative_numbers = true)]
    core_aux: i32,

    /// Increase logging detail (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

struct MebApp {
    fabric: LoopbackFabric,
    prms: MebParams,
    tag: String,
    num_ev_queues: usize,
    distribute: bool,
    thread: Option<JoinHandle<eventlib::Result<()>>>,
    commands: Option<crossbeam_channel::Sender<MebCommand>>,
}

impl MebApp {
    fn handle_connect(&mut self, body: &serde_json::Value, id: u64) -> serde_json::Value {
        match config::parse_meb_connection(body, &id.to_string(), &mut self.prms) {
            Ok(()) => config::connection_info(&self.prms.eb.if_addr, self.prms.num_ev_buffers),
            Err(err) => {
                tracing::error!(%err, "error parsing connect parameters");
                collection::err_body(err.to_string())
            }
        }
    }

    fn handle_configure(&mut self) -> serde_json::Value {
        // Shut down the previously running instance, if any.
        self.stop_thread();

        self.print_params();
        match Meb::configure(
            &self.fabric,
            &self.prms,
            self.num_ev_queues,
            self.distribute,
            &self.tag,
        ) {
            Ok(mut meb) => {
                let (tx, rx) = crossbeam_channel::bounded(4);
                RUNNING.store(true, Ordering::Release);
                self.commands = Some(tx);
                self.thread = Some(std::thread::spawn(move || meb.run(&RUNNING, &rx)));
                json!({})
            }
            Err(err) => {
                tracing::error!(%err, "failed to configure MEB");
                collection::err_body(format!("Phase 1 error: {err}"))
            }
        }
    }

    fn handle_beginrun(&mut self) -> serde_json::Value {
        if let Some(commands) = &self.commands {
            let _ = commands.send(MebCommand::BeginRun);
        }
        json!({})
    }

    fn stop_thread(&mut self) {
        RUNNING.store(false, Ordering::Release);
        self.commands = None;
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(%err, "MEB thread failed"),
                Err(_) => tracing::error!("MEB thread panicked"),
            }
        }
    }

    fn print_params(&self) {
        let p = &self.prms;
        tracing::info!(
            id = p.eb.id,
            partition = p.eb.partition,
            contributors = format_args!("{:016x}", p.eb.contributors),
            contributor_count = p.eb.contributors.count_ones(),
            groups = format_args!("{:04x}", self.prms.group_mask()),
            tebs = p.eb.addrs.len(),
            num_ev_buffers = p.num_ev_buffers,
            buffer_size = p.max_buffer_size,
            num_ev_queues = self.num_ev_queues,
            distribute = self.distribute,
            tag = %self.tag,
            "MEB parameters"
        );
    }

}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("eventlib={level},eventlib_monitor={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn install_metrics(prometheus_dir: Option<&PathBuf>) {
    for i in 0..MAX_PROM_PORTS {
        let port = PROM_PORT_BASE + i;
        let builder =
            PrometheusBuilder::new().with_http_listener(([0u8, 0, 0, 0], port));
        match builder.install() {
            Ok(()) => {
                tracing::info!(port, "providing run-time monitoring data");
                eventlib::metrics::describe();
                if i > 0 {
                    if let Some(dir) = prometheus_dir {
                        match eventlib::metrics::write_scrape_target(dir, i as u32, port) {
                            Ok(path) => tracing::info!(path = %path.display(), "wrote scrape target"),
                            Err(err) => tracing::error!(%err, "error writing scrape target file"),
                        }
                    } else {
                        tracing::warn!("non-default metrics port and no config directory");
                    }
                }
                return;
            }
            Err(err) => {
                tracing::debug!(port, %err, "could not start run-time monitoring server");
            }
        }
    }
    tracing::warn!("could not start run-time monitoring server");
}

fn run(cli: Cli) -> Result<()> {
    let tag = cli.tag.clone().unwrap_or_else(|| cli.instrument.clone());
    tracing::info!(%tag, "partition tag");

    let mut num_ev_buffers = cli.num_ev_buffers;
    config::validate_buffer_count(&mut num_ev_buffers)
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    let mut app = MebApp {
        fabric: LoopbackFabric::new(),
        prms: MebParams {
            eb: eventlib::config::EbParams {
                if_addr: cli.if_addr.clone().unwrap_or_default(),
                instrument: cli.instrument.clone(),
                partition: cli.partition,
                alias: cli.alias.clone(),
                core: [cli.core_app, cli.core_aux],
                verbose: cli.verbose,
                ..Default::default()
            },
            max_buffer_size: 0, // Filled in at connect
            num_ev_buffers,
        },
        tag,
        num_ev_queues: cli.num_ev_queues,
        distribute: cli.distribute,
        thread: None,
        commands: None,
    };

    let mut coll =
        collection::CollectionClient::connect(&cli.collection, cli.partition, "meb", &cli.alias)?;
    tracing::info!("ready for transitions");

    while RUNNING.load(Ordering::Acquire) || app.thread.is_some() {
        let Some(msg) = coll.poll()? else {
            if !RUNNING.load(Ordering::Acquire) {
                break;
            }
            continue;
        };
        let reply_body = match msg.key.as_str() {
            "connect" => app.handle_connect(&msg.body, coll.id()),
            "configure" => app.handle_configure(),
            "beginrun" => app.handle_beginrun(),
            "disconnect" | "reset" => {
                app.stop_thread();
                json!({})
            }
            other => {
                tracing::warn!(key = other, "unexpected transition ignored");
                json!({})
            }
        };
        coll.reply(&msg.key, &msg.msg_id, reply_body)?;
        if msg.key == "reset" {
            break;
        }
    }

    app.stop_thread();
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    unsafe {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }

    install_metrics(cli.prometheus_dir.as_ref());

    match run(cli) {
        Ok(()) => {
            tracing::info!("shut down cleanly");
        }
        Err(err) => {
            tracing::error!(%err, "fatal");
            std::process::exit(1);
        }
    }
}
