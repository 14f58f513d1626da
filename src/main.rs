mod app;
mod backend;
mod channel;
mod command;
mod config;
mod constants;
mod data;
mod dispatcher;
mod frame;
mod input;
mod interface;
mod modbus;
mod monitor;
mod register_map;
mod transport;
mod ui;

#[cfg(debug_assertions)]
mod sim;

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use crossterm::event::{self, Event};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tokio::runtime::Runtime;

use app::AppState;
use config::{BridgeConfig, FileConfig};
use dispatcher::Dispatcher;
use input::{DashboardCommand, handle_key_event};
use interface::InterfaceMode;
use modbus::BridgeService;
use register_map::ChannelId;
use transport::Bridge;
use ui::render_ui;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Modbus TCP bridge for two VIAFLO pipettes")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port of the channel 1 pipette (e.g. /dev/ttyUSB0)
    #[arg(long)]
    port1: Option<String>,

    /// Serial port of the channel 2 pipette
    #[arg(long)]
    port2: Option<String>,

    /// Modbus TCP listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Device status poll interval in milliseconds
    #[arg(short = 'i', long)]
    poll_interval: Option<u64>,

    /// Device interface
    #[arg(short = 'I', long, value_enum, default_value_t = InterfaceMode::Serial)]
    interface: InterfaceMode,

    /// Run without the dashboard
    #[arg(long, default_value_t = false)]
    headless: bool,

    /// Append log output to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct RuntimeArgs {
    config: BridgeConfig,
    headless: bool,
    log_file: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let runtime = resolve_runtime_args(&args)?;
    init_logging(runtime.headless, runtime.log_file.as_deref())?;

    let config = runtime.config;
    let map = Arc::new(config.register_map()?);
    let [link1, link2] = ChannelId::ALL.map(|id| backend::open_link(&config, id));
    let bridge = Bridge::start(map, [link1?, link2?], config.poll_interval)?;
    log::info!(
        "bridge started ({} interface, poll every {:?})",
        config.interface.label(),
        config.poll_interval
    );

    let service = BridgeService::new(Arc::clone(&bridge.dispatcher), config.register_count);
    let async_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("start async runtime")?;

    let result = if runtime.headless {
        run_headless(&async_runtime, config.bind, service)
    } else {
        run_dashboard(&async_runtime, &config, &bridge.dispatcher, service)
    };

    bridge.shutdown();
    async_runtime.shutdown_background();
    log::info!("bridge stopped");
    result
}

fn run_headless(
    async_runtime: &Runtime,
    bind: SocketAddr,
    service: BridgeService,
) -> eyre::Result<()> {
    async_runtime.block_on(serve_until_ctrl_c(bind, service))
}

async fn serve_until_ctrl_c(bind: SocketAddr, service: BridgeService) -> eyre::Result<()> {
    let listener = modbus::bind(bind).await?;
    tokio::select! {
        result = modbus::serve(listener, service) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.wrap_err("listen for ctrl-c")?;
            log::info!("ctrl-c received, shutting down");
            Ok(())
        }
    }
}

fn run_dashboard(
    async_runtime: &Runtime,
    config: &BridgeConfig,
    dispatcher: &Dispatcher,
    service: BridgeService,
) -> eyre::Result<()> {
    let listener = async_runtime.block_on(modbus::bind(config.bind))?;
    let server = async_runtime.spawn(modbus::serve(listener, service));

    enable_raw_mode().wrap_err("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).wrap_err("enter alternate screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (command_tx, command_rx) = mpsc::channel();
    let tick_rate = Duration::from_millis(100);
    let mut app = AppState::new(dispatcher, config.interface, config.bind);
    let mut exit_error: Option<eyre::Report> = None;

    loop {
        terminal.draw(|frame| render_ui(frame, &app))?;

        if event::poll(tick_rate)?
            && let Event::Key(key) = event::read()?
            && handle_key_event(key.code, &mut app, &command_tx)?
        {
            break;
        }

        while let Ok(DashboardCommand::Reset(id)) = command_rx.try_recv() {
            app.notice = Some(match dispatcher.reset(id) {
                Ok(()) => format!("{id} reset"),
                Err(err) => format!("reset failed: {err}"),
            });
            log::info!("operator reset of {id}");
        }
        app.refresh(dispatcher);

        if server.is_finished() {
            exit_error = Some(match async_runtime.block_on(server) {
                Ok(Ok(())) => eyre::eyre!("modbus server stopped"),
                Ok(Err(err)) => err,
                Err(err) => eyre::Report::new(err).wrap_err("modbus server task failed"),
            });
            break;
        }

        if app.should_quit {
            break;
        }
    }

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();

    if let Some(err) = exit_error {
        return Err(err);
    }

    Ok(())
}

fn init_logging(headless: bool, log_file: Option<&Path>) -> eyre::Result<()> {
    // Dashboard output owns the terminal; stay quiet unless asked.
    let default_filter = if headless || log_file.is_some() {
        "info"
    } else {
        "off"
    };
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, default_filter),
    );
    if let Some(path) = log_file {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .wrap_err_with(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init().wrap_err("initialize logging")
}

fn resolve_runtime_args(args: &Args) -> eyre::Result<RuntimeArgs> {
    let interface = {
        #[cfg(debug_assertions)]
        {
            resolve_interface_mode(args)
        }
        #[cfg(not(debug_assertions))]
        {
            resolve_interface_mode(args)?
        }
    };

    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let mut config = BridgeConfig::from_file(&file, interface);

    if let Some(port) = &args.port1 {
        config.channel_mut(ChannelId::One).port = Some(port.clone());
    }
    if let Some(port) = &args.port2 {
        config.channel_mut(ChannelId::Two).port = Some(port.clone());
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(baud) = args.baud {
        config.baud = baud;
    }
    if let Some(poll_interval) = args.poll_interval {
        config.poll_interval = Duration::from_millis(poll_interval);
    }
    config.validate()?;

    Ok(RuntimeArgs {
        config,
        headless: args.headless,
        log_file: args.log_file.clone(),
    })
}

#[cfg(debug_assertions)]
fn resolve_interface_mode(args: &Args) -> InterfaceMode {
    args.interface
}

#[cfg(not(debug_assertions))]
fn resolve_interface_mode(args: &Args) -> eyre::Result<InterfaceMode> {
    if args.interface == InterfaceMode::Simulation {
        return Err(eyre::eyre!(
            "simulation interface is only available in debug builds"
        ));
    }
    Ok(args.interface)
}
