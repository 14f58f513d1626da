use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use color_eyre::eyre::{self, WrapErr};

use crate::backend::PipetteLink;
use crate::channel::{Channel, LinkRequest};
use crate::dispatcher::Dispatcher;
use crate::monitor::CompletionMonitor;
use crate::register_map::{ChannelId, RegisterMap};

/// Running bridge core: the dispatcher and one serial worker per channel.
pub struct Bridge {
    pub dispatcher: Arc<Dispatcher>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Bridge {
    /// Spawn a worker for each channel. Each link moves into its worker and
    /// is dropped (closing the port) when the worker exits.
    pub(crate) fn start(
        map: Arc<RegisterMap>,
        links: [Box<dyn PipetteLink + Send>; 2],
        poll_interval: Duration,
    ) -> eyre::Result<Self> {
        let mut channels = Vec::with_capacity(2);
        let mut workers = Vec::with_capacity(2);

        for (id, link) in ChannelId::ALL.into_iter().zip(links) {
            let (request_tx, request_rx) = mpsc::channel();
            let channel = Arc::new(Channel::new(id, map.defaults_for(id), request_tx));
            let handle = spawn_worker(Arc::clone(&channel), link, request_rx, poll_interval)?;
            channels.push(channel);
            workers.push(handle);
        }

        let channels: [Arc<Channel>; 2] = channels
            .try_into()
            .map_err(|_| eyre::eyre!("expected exactly two channels"))?;
        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(map, channels)),
            workers,
        })
    }

    /// Stop both workers and wait for them to release their ports.
    pub fn shutdown(self) {
        self.dispatcher.terminate();
        for worker in self.workers {
            if worker.join().is_err() {
                log::error!("serial worker panicked");
            }
        }
    }
}

pub(crate) fn spawn_worker(
    channel: Arc<Channel>,
    link: Box<dyn PipetteLink + Send>,
    request_rx: Receiver<LinkRequest>,
    poll_interval: Duration,
) -> eyre::Result<thread::JoinHandle<()>> {
    let name = format!("pipette-ch{}", channel.id().number());
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let id = channel.id();
            if let Err(err) = run_worker_loop(&channel, link, &request_rx, poll_interval) {
                log::error!("{id}: worker stopped: {err:#}");
            }
        })
        .wrap_err_with(|| format!("spawn {name}"))
}

fn run_worker_loop(
    channel: &Arc<Channel>,
    mut link: Box<dyn PipetteLink + Send>,
    request_rx: &Receiver<LinkRequest>,
    poll_interval: Duration,
) -> eyre::Result<()> {
    let mut monitor = CompletionMonitor::new(Arc::clone(channel));

    loop {
        match request_rx.recv_timeout(poll_interval) {
            Ok(LinkRequest::Execute(command)) => match link.send(command) {
                Ok(()) => {
                    log::debug!("{}: sent {command}", channel.id());
                    monitor.command_sent(command);
                }
                Err(err) => channel.on_link_error(format!("{err:#}")),
            },
            Ok(LinkRequest::Terminate) => break,
            Err(RecvTimeoutError::Timeout) => monitor.poll(link.as_mut()),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(eyre::eyre!("request channel closed"));
            }
        }
    }

    log::debug!("{}: worker terminated", channel.id());
    Ok(())
}
