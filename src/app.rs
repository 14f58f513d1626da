use std::net::SocketAddr;

use crate::channel::ChannelSnapshot;
use crate::dispatcher::Dispatcher;
use crate::interface::InterfaceMode;
use crate::register_map::{ChannelId, RegisterRole};

#[derive(Debug)]
pub struct AppState {
    pub channels: [ChannelSnapshot; 2],
    pub registers: Vec<(u16, RegisterRole)>,
    pub interface: InterfaceMode,
    pub bind: SocketAddr,
    pub show_registers: bool,
    pub should_quit: bool,
    pub notice: Option<String>,
}

impl AppState {
    pub fn new(dispatcher: &Dispatcher, interface: InterfaceMode, bind: SocketAddr) -> Self {
        Self {
            channels: dispatcher.snapshots(),
            registers: dispatcher.register_map().entries(),
            interface,
            bind,
            show_registers: false,
            should_quit: false,
            notice: None,
        }
    }

    pub fn refresh(&mut self, dispatcher: &Dispatcher) {
        self.channels = dispatcher.snapshots();
    }

    pub fn channel(&self, id: ChannelId) -> &ChannelSnapshot {
        &self.channels[id.index()]
    }
}
