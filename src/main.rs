use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{panic, process};
use tokio_util::sync::CancellationToken;
use xrcast::assets::STREAM_SERVICE_PORT;
use xrcast::config::{StreamConfig, app_name, app_version};
use xrcast::headset::{DesktopHeadset, Headset};
use xrcast::net::UdpSession;
use xrcast::pipeline::state::frame_interval;
use xrcast::{Stream, audio};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("peer")
                .short('p')
                .long("peer")
                .value_name("ADDRESS")
                .help("Rendering server address (ip:port).")
                .required(true),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDRESS")
                .help("Local address to receive the stream on (default 0.0.0.0:9757)."),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON stream configuration."),
        )
        .arg(
            Arg::new("microphone")
                .short('m')
                .long("microphone")
                .help("Send the microphone to the server.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("refresh-rate")
                .short('r')
                .long("refresh-rate")
                .value_name("HZ")
                .help("Display refresh rate driving the render loop.")
                .value_parser(clap::value_parser!(f32))
                .default_value("72"),
        )
        .get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();
    // gracefully close the stream when receiving SIGINT, SIGTERM, or SIGHUP
    if let Err(e) = ctrlc::set_handler(move || ctrlc_cancel.cancel()) {
        error!("Error setting Ctrl-C handler: {}", e);
        process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(&matches, cancel)) {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(matches: &clap::ArgMatches, cancel: CancellationToken) -> Result<()> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => StreamConfig::load(path)?,
        None => StreamConfig::default(),
    };
    if matches.get_flag("microphone") {
        config.enable_microphone = true;
    }

    let refresh_rate = matches.get_one::<f32>("refresh-rate").copied().unwrap_or(72.0);
    let peer: SocketAddr = matches
        .get_one::<String>("peer")
        .context("missing --peer")?
        .parse()
        .context("invalid --peer address")?;
    let listen: SocketAddr = match matches.get_one::<String>("listen") {
        Some(addr) => addr.parse().context("invalid --listen address")?,
        None => SocketAddr::from(([0, 0, 0, 0], STREAM_SERVICE_PORT)),
    };

    let session = Arc::new(UdpSession::connect(listen, peer)?);
    let local = session.local_addr()?;
    let headset = Arc::new(DesktopHeadset::new(refresh_rate));
    let backend: Arc<dyn audio::AudioBackend> = Arc::from(audio::default_backend());

    let stream = Stream::start(config, session, headset.clone(), backend)?;
    info!("{} {} streaming from {} on {}", app_name(), app_version(), peer, local);

    let mut render_tick = tokio::time::interval(frame_interval(headset.refresh_rate()));
    render_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut health_tick = tokio::time::interval(HEALTH_LOG_INTERVAL);
    let mut last_state = stream.current_state();

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown requested");
                break Ok(());
            }
            _ = render_tick.tick() => {
                match stream.render(Instant::now()) {
                    Ok(outcome) => {
                        if outcome.state != last_state {
                            last_state = outcome.state;
                            if !last_state.is_streaming() {
                                warn!("Stream is {}", last_state);
                            }
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
            _ = health_tick.tick() => {
                info!("{}", stream.health().summary());
            }
        }
    };

    // Joins the stream threads and waits for the audio stop handshake
    let stopped = tokio::task::spawn_blocking(move || {
        let mut stream = stream;
        stream.stop();
    })
    .await;
    if let Err(e) = stopped {
        error!("Stream shutdown failed: {}", e);
    }
    result
}
