//! Modbus TCP side of the bridge.
//!
//! Holding registers, input registers and coils all share one register
//! store. Mapped addresses are routed through the [`Dispatcher`]; everything
//! else inside the store behaves like plain memory.

use std::future;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use color_eyre::eyre::{self, WrapErr};
use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};

use crate::dispatcher::{DispatchError, Dispatcher, ReadOutcome};

#[derive(Debug, Clone)]
pub struct BridgeService {
    dispatcher: Arc<Dispatcher>,
    store: Arc<Mutex<Vec<u16>>>,
}

impl BridgeService {
    pub fn new(dispatcher: Arc<Dispatcher>, register_count: u16) -> Self {
        Self {
            dispatcher,
            store: Arc::new(Mutex::new(vec![0; usize::from(register_count)])),
        }
    }

    fn store(&self) -> MutexGuard<'_, Vec<u16>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        let range = self.store_range(address, count)?;
        let mut values = Vec::with_capacity(range.len());
        for index in range {
            let register = register_at(index)?;
            let value = match self.dispatcher.handle_read(register) {
                Ok(ReadOutcome::Value(value)) => value,
                Ok(ReadOutcome::PassThrough) | Err(DispatchError::UnknownAddress(_)) => {
                    self.store()[index]
                }
                Err(err) => return Err(exception_for(register, err)),
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Returns the number of registers written. The batch is checked as a
    /// whole first, so a rejected write leaves every channel and the store
    /// untouched.
    fn write_registers(&self, address: u16, values: &[u16]) -> Result<u16, ExceptionCode> {
        let count = u16::try_from(values.len()).map_err(|_| ExceptionCode::IllegalDataValue)?;
        let range = self.store_range(address, count)?;
        let registers = registers_in(range.clone())?;
        self.check_batch(registers.iter().map(|&register| (register, true)))?;

        for ((index, register), &value) in range.zip(registers).zip(values) {
            match self.dispatcher.handle_write(register, value) {
                Ok(dispatched) => {
                    log::debug!("register {register} <- {value}: {dispatched:?}");
                    self.store()[index] = value;
                }
                Err(err) => return Err(exception_for(register, err)),
            }
        }
        Ok(count)
    }

    /// Returns the number of coils written. Checked as a whole like
    /// [`Self::write_registers`]; only coils set to true dispatch.
    fn write_coils(&self, address: u16, coils: &[bool]) -> Result<u16, ExceptionCode> {
        let count = u16::try_from(coils.len()).map_err(|_| ExceptionCode::IllegalDataValue)?;
        let range = self.store_range(address, count)?;
        let registers = registers_in(range.clone())?;
        self.check_batch(registers.iter().copied().zip(coils.iter().copied()))?;

        for ((index, register), &coil) in range.zip(registers).zip(coils) {
            let result = if coil {
                self.dispatcher.handle_write(register, 0).map(|dispatched| {
                    log::debug!("coil {register} on: {dispatched:?}");
                })
            } else {
                self.dispatcher.handle_release(register)
            };
            match result {
                Ok(()) => self.store()[index] = u16::from(coil),
                Err(err) => return Err(exception_for(register, err)),
            }
        }
        Ok(count)
    }

    /// Every dispatching write must be takeable, and each channel may be
    /// addressed at most once per batch.
    fn check_batch(
        &self,
        writes: impl IntoIterator<Item = (u16, bool)>,
    ) -> Result<(), ExceptionCode> {
        let mut claimed = [false; 2];
        for (register, dispatches) in writes {
            if !dispatches {
                self.dispatcher
                    .handle_release(register)
                    .map_err(|err| exception_for(register, err))?;
                continue;
            }
            let id = self
                .dispatcher
                .check_write(register)
                .map_err(|err| exception_for(register, err))?;
            if std::mem::replace(&mut claimed[id.index()], true) {
                log::warn!("rejected batch: {id} addressed more than once");
                return Err(ExceptionCode::ServerDeviceBusy);
            }
        }
        Ok(())
    }

    fn store_range(&self, address: u16, count: u16) -> Result<Range<usize>, ExceptionCode> {
        let start = usize::from(address);
        let end = start + usize::from(count);
        if end > self.store().len() {
            log::warn!("request for {count} registers at {address} is outside the store");
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(start..end)
    }
}

fn register_at(index: usize) -> Result<u16, ExceptionCode> {
    u16::try_from(index).map_err(|_| ExceptionCode::IllegalDataAddress)
}

fn registers_in(range: Range<usize>) -> Result<Vec<u16>, ExceptionCode> {
    range.map(register_at).collect()
}

fn exception_for(address: u16, err: DispatchError) -> ExceptionCode {
    log::warn!("rejected request at register {address}: {err}");
    match err {
        DispatchError::UnknownAddress(_) | DispatchError::WriteToReadOnlyRegister(_) => {
            ExceptionCode::IllegalDataAddress
        }
        DispatchError::Busy(_) => ExceptionCode::ServerDeviceBusy,
        DispatchError::Faulted(_) => ExceptionCode::ServerDeviceFailure,
    }
}

impl tokio_modbus::server::Service for BridgeService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        log::trace!("modbus request: {req:?}");
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                self.read_registers(addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                self.read_registers(addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::ReadCoils(addr, cnt) => self.read_registers(addr, cnt).map(|values| {
                Response::ReadCoils(values.into_iter().map(|value| value != 0).collect())
            }),
            Request::WriteSingleRegister(addr, value) => self
                .write_registers(addr, std::slice::from_ref(&value))
                .map(|_| Response::WriteSingleRegister(addr, value)),
            Request::WriteMultipleRegisters(addr, values) => self
                .write_registers(addr, &values)
                .map(|count| Response::WriteMultipleRegisters(addr, count)),
            Request::WriteSingleCoil(addr, coil) => self
                .write_coils(addr, std::slice::from_ref(&coil))
                .map(|_| Response::WriteSingleCoil(addr, coil)),
            Request::WriteMultipleCoils(addr, coils) => self
                .write_coils(addr, &coils)
                .map(|count| Response::WriteMultipleCoils(addr, count)),
            _ => {
                log::warn!("unsupported function in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

pub async fn bind(addr: SocketAddr) -> eyre::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("bind modbus listener on {addr}"))
}

/// Serve Modbus TCP clients until the listener fails.
pub async fn serve(listener: TcpListener, service: BridgeService) -> eyre::Result<()> {
    let local = listener.local_addr().wrap_err("modbus listener address")?;
    log::info!("modbus server listening on {local}");
    let server = Server::new(listener);

    let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
        let service = service.clone();
        async move {
            log::info!("modbus client connected: {socket_addr}");
            accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                Ok(Some(service.clone()))
            })
        }
    };
    let on_process_error = |err| {
        log::error!("modbus connection error: {err}");
    };

    server
        .serve(&on_connected, on_process_error)
        .await
        .wrap_err("modbus server stopped")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::Arc;

    use tokio::net::TcpListener;
    use tokio_modbus::prelude::*;

    use super::{BridgeService, serve};
    use crate::channel::{Channel, ChannelState, DeviceSignal, LinkRequest};
    use crate::dispatcher::Dispatcher;
    use crate::register_map::{ChannelId, RegisterMap};

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        addr: SocketAddr,
        server: tokio::task::JoinHandle<()>,
        _links: Vec<Receiver<LinkRequest>>,
    }

    fn dispatcher() -> (Arc<Dispatcher>, Vec<Receiver<LinkRequest>>) {
        let map = Arc::new(RegisterMap::default());
        let mut links = Vec::new();
        let channels = ChannelId::ALL.map(|id| {
            let (tx, rx) = mpsc::channel();
            links.push(rx);
            Arc::new(Channel::new(id, map.defaults_for(id), tx))
        });
        (Arc::new(Dispatcher::new(map, channels)), links)
    }

    fn assert_untouched(
        service: &BridgeService,
        dispatcher: &Dispatcher,
        links: &[Receiver<LinkRequest>],
    ) {
        for id in ChannelId::ALL {
            let channel = dispatcher.channel(id);
            assert_eq!(channel.state(), ChannelState::Idle, "{id} state");
            assert!(channel.poll_completion(), "{id} completion");
            assert_eq!(channel.snapshot().accepted, 0, "{id} accepted");
        }
        assert!(links.iter().all(|link| link.try_recv().is_err()));
        assert!(service.store().iter().all(|&value| value == 0));
    }

    #[test]
    fn batch_hitting_one_channel_twice_changes_nothing() {
        let (dispatcher, links) = dispatcher();
        let service = BridgeService::new(Arc::clone(&dispatcher), 100);

        assert_eq!(
            service.write_registers(2, &[1000, 500]),
            Err(ExceptionCode::ServerDeviceBusy)
        );
        assert_eq!(
            service.write_coils(6, &[true, true]),
            Err(ExceptionCode::ServerDeviceBusy)
        );
        assert_untouched(&service, &dispatcher, &links);
    }

    #[test]
    fn batch_ending_on_bad_address_changes_nothing() {
        let (dispatcher, links) = dispatcher();
        let service = BridgeService::new(Arc::clone(&dispatcher), 100);

        assert_eq!(
            service.write_registers(4, &[1, 0]),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            service.write_registers(12, &[0, 0]),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            service.write_coils(8, &[true, false, false, false, false]),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_untouched(&service, &dispatcher, &links);
    }

    #[test]
    fn batch_touching_busy_channel_changes_nothing() {
        let (dispatcher, links) = dispatcher();
        let service = BridgeService::new(Arc::clone(&dispatcher), 100);
        service.write_registers(2, &[300]).expect("idle channel accepts");
        assert!(matches!(links[0].try_recv(), Ok(LinkRequest::Execute(_))));

        // Home on channel 2 is valid, but the reset of busy channel 1 is not.
        assert_eq!(
            service.write_registers(8, &[1, 1]),
            Err(ExceptionCode::ServerDeviceBusy)
        );
        let two = dispatcher.channel(ChannelId::Two);
        assert_eq!(two.state(), ChannelState::Idle);
        assert_eq!(two.snapshot().accepted, 0);
        assert!(links[1].try_recv().is_err());
        assert_eq!(service.store()[8], 0);
    }

    #[test]
    fn batch_over_both_channels_dispatches_each_once() {
        let (dispatcher, links) = dispatcher();
        let service = BridgeService::new(Arc::clone(&dispatcher), 100);

        assert_eq!(service.write_registers(8, &[1, 1]), Ok(2));
        assert_eq!(dispatcher.channel(ChannelId::Two).state(), ChannelState::Busy);
        assert!(matches!(links[1].try_recv(), Ok(LinkRequest::Execute(_))));
        assert!(links[0].try_recv().is_err());
        assert_eq!(&service.store()[8..10], &[1, 1]);

        dispatcher
            .channel(ChannelId::Two)
            .on_device_signal(DeviceSignal::Error("tip missing".into()));
        assert_eq!(service.write_coils(2, &[true, false]), Ok(2));
        assert_eq!(
            service.write_coils(6, &[true]),
            Err(ExceptionCode::ServerDeviceFailure)
        );
        assert_eq!(service.write_registers(10, &[1]), Ok(1));
        assert_eq!(dispatcher.channel(ChannelId::Two).state(), ChannelState::Idle);
    }

    async fn start_server() -> Harness {
        let (dispatcher, links) = dispatcher();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        let service = BridgeService::new(Arc::clone(&dispatcher), 100);
        let server = tokio::spawn(async move {
            serve(listener, service).await.ok();
        });

        Harness {
            dispatcher,
            addr,
            server,
            _links: links,
        }
    }

    #[tokio::test]
    async fn aspirate_then_completion_over_tcp() {
        let harness = start_server().await;
        let mut ctx = tcp::connect(harness.addr).await.expect("connect");

        let completion = ctx
            .read_holding_registers(1, 1)
            .await
            .expect("transport")
            .expect("read completion");
        assert_eq!(completion, vec![1]);

        ctx.write_single_register(2, 1000)
            .await
            .expect("transport")
            .expect("aspirate accepted");
        let registers = ctx
            .read_holding_registers(1, 2)
            .await
            .expect("transport")
            .expect("read back");
        assert_eq!(registers, vec![0, 1000]);

        ctx.write_single_register(6, 1000)
            .await
            .expect("transport")
            .expect("channel 2 is independent");

        let rejected = ctx
            .write_single_register(3, 500)
            .await
            .expect("transport");
        assert_eq!(rejected, Err(ExceptionCode::ServerDeviceBusy));

        harness
            .dispatcher
            .channel(ChannelId::One)
            .on_device_signal(DeviceSignal::Completed);
        let completion = ctx
            .read_input_registers(1, 1)
            .await
            .expect("transport")
            .expect("read completion");
        assert_eq!(completion, vec![1]);

        harness.server.abort();
    }

    #[tokio::test]
    async fn address_errors_map_to_exceptions() {
        let harness = start_server().await;
        let mut ctx = tcp::connect(harness.addr).await.expect("connect");

        let read_only = ctx.write_single_register(1, 1).await.expect("transport");
        assert_eq!(read_only, Err(ExceptionCode::IllegalDataAddress));

        let unknown = ctx.write_single_register(50, 1).await.expect("transport");
        assert_eq!(unknown, Err(ExceptionCode::IllegalDataAddress));

        let outside = ctx
            .read_holding_registers(99, 2)
            .await
            .expect("transport");
        assert_eq!(outside, Err(ExceptionCode::IllegalDataAddress));

        let unmapped = ctx
            .read_holding_registers(40, 2)
            .await
            .expect("transport")
            .expect("unmapped reads come from the store");
        assert_eq!(unmapped, vec![0, 0]);

        harness.server.abort();
    }

    #[tokio::test]
    async fn coils_trigger_commands_with_defaults() {
        let harness = start_server().await;
        let mut ctx = tcp::connect(harness.addr).await.expect("connect");

        ctx.write_single_coil(8, true)
            .await
            .expect("transport")
            .expect("home accepted");
        let two = harness.dispatcher.channel(ChannelId::Two);
        assert!(!two.poll_completion());

        ctx.write_single_coil(8, false)
            .await
            .expect("transport")
            .expect("release accepted");
        let coils = ctx.read_coils(5, 1).await.expect("transport").expect("read");
        assert_eq!(coils, vec![false]);

        two.on_device_signal(DeviceSignal::Error("hardware error 3".into()));
        let status = ctx
            .read_holding_registers(12, 1)
            .await
            .expect("transport")
            .expect("read status");
        assert_eq!(status, vec![2]);

        let faulted = ctx.write_single_coil(6, true).await.expect("transport");
        assert_eq!(faulted, Err(ExceptionCode::ServerDeviceFailure));

        ctx.write_single_register(10, 1)
            .await
            .expect("transport")
            .expect("reset accepted");
        let coils = ctx.read_coils(5, 1).await.expect("transport").expect("read");
        assert_eq!(coils, vec![true]);

        harness.server.abort();
    }
}
