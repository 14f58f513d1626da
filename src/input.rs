use std::sync::mpsc::Sender;

use color_eyre::eyre::{self, WrapErr};
use crossterm::event::KeyCode;

use crate::app::AppState;
use crate::channel::ChannelState;
use crate::register_map::ChannelId;

/// Operator actions the dashboard hands back to the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardCommand {
    Reset(ChannelId),
}

/// Returns `Ok(true)` when the dashboard should exit.
pub fn handle_key_event(
    code: KeyCode,
    app: &mut AppState,
    command_tx: &Sender<DashboardCommand>,
) -> eyre::Result<bool> {
    match code {
        KeyCode::Char('q') => {
            app.should_quit = true;
            return Ok(true);
        }
        KeyCode::Char('1') => request_reset(ChannelId::One, app, command_tx)?,
        KeyCode::Char('2') => request_reset(ChannelId::Two, app, command_tx)?,
        KeyCode::Char('d') => {
            app.show_registers = !app.show_registers;
        }
        _ => {}
    }

    Ok(false)
}

fn request_reset(
    id: ChannelId,
    app: &mut AppState,
    command_tx: &Sender<DashboardCommand>,
) -> eyre::Result<()> {
    if app.channel(id).state != ChannelState::Faulted {
        app.notice = Some(format!("{id} is not faulted"));
        return Ok(());
    }
    command_tx
        .send(DashboardCommand::Reset(id))
        .wrap_err("send reset request")
}
