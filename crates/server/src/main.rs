mod config;
mod server;
mod tui;

use std::io;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use meridian::{NetConfig, NetEvent};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use config::ServerConfig;
use server::GameServer;
use tui::TuiState;

#[derive(Parser)]
#[command(name = "meridian-server")]
#[command(about = "Meridian replication server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = meridian::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = meridian::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(short, long, default_value = "Meridian Server")]
    name: String,

    #[arg(long, default_value_t = 8, help = "Wandering entities to spawn")]
    npcs: usize,

    #[arg(long, help = "Radius inside which entities are created for a peer")]
    small_radius: Option<f32>,

    #[arg(long, help = "Radius outside which entities are destroyed for a peer")]
    large_radius: Option<f32>,

    #[arg(long)]
    headless: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let defaults = NetConfig::default();
    let net = NetConfig {
        port: args.port,
        tick_rate: args.tick_rate,
        max_connections: args.max_clients,
        server_name: args.name,
        small_radius: args.small_radius.unwrap_or(defaults.small_radius),
        large_radius: args.large_radius.unwrap_or(defaults.large_radius),
        ..defaults
    };
    anyhow::ensure!(
        net.small_radius <= net.large_radius,
        "small radius {} exceeds large radius {}",
        net.small_radius,
        net.large_radius
    );

    let config = ServerConfig {
        bind: args.bind,
        net,
        npc_count: args.npcs,
        ..Default::default()
    };

    let mut server = GameServer::new(config)
        .with_context(|| format!("binding {}:{}", args.bind, args.port))?;

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        log::info!("server started on {}", server.local_addr());
        server.run();
        log::info!("server stopped");
    } else {
        run_with_tui(&mut server)?;
    }

    Ok(())
}

fn run_with_tui(server: &mut GameServer) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let running = server.running();
    let mut tui_state = TuiState::new();
    tui_state.log_info(format!("server started on {}", server.local_addr()));

    while running.load(Ordering::SeqCst) {
        server.tick_once();

        for event in server.drain_events() {
            match event {
                NetEvent::Connected { addr, entity } => match entity {
                    Some(entity) => tui_state.log_info(format!("{addr} joined as {entity}")),
                    None => tui_state.log_info(format!("{addr} joined")),
                },
                NetEvent::Disconnected { addr, reason, .. } => {
                    tui_state.log_warn(format!("{addr} left: {reason}"));
                }
                NetEvent::ServerDiscovered { .. } | NetEvent::PingMeasured { .. } => {}
            }
        }

        let stats = server.stats();

        if event::poll(Duration::from_millis(1))?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => running.store(false, Ordering::SeqCst),
                KeyCode::Up => tui_state.select_prev(stats.peers.len()),
                KeyCode::Down => tui_state.select_next(stats.peers.len()),
                KeyCode::Char('k') | KeyCode::Char('K') => tui_state.request_kick(&stats.peers),
                _ => {}
            }
        }

        if let Some(addr) = tui_state.take_pending_kick() {
            server.kick(addr);
            tui_state.log_warn(format!("kicked {addr}"));
        }

        terminal.draw(|frame| tui::render(frame, &tui_state, &stats))?;
    }

    server.shutdown();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
