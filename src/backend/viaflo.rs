use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use color_eyre::eyre;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::backend::PipetteLink;
use crate::channel::DeviceSignal;
use crate::command::Command;
use crate::data::{
    DeviceStatus, MSG_GET_ACTION_STATUS, MSG_GET_INFO, MSG_SET_ACTION, PipetteInfo, StatusCode,
    action_code, display_message,
};
use crate::frame::{Response, SequenceCounter, build_frame, find_frame, parse_frame};

const READ_SLICE: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) struct ViafloLink {
    port: Box<dyn SerialPort>,
    path: String,
    sequence: SequenceCounter,
    response_timeout: Duration,
}

impl ViafloLink {
    pub(crate) fn open(path: &str, baud: u32, response_timeout: Duration) -> eyre::Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(READ_SLICE)
            .open()
            .map_err(|err| eyre::eyre!("open serial port {path}: {err}"))?;
        let mut link = Self {
            port,
            path: path.to_string(),
            sequence: SequenceCounter::new(),
            response_timeout,
        };
        match link.identify() {
            Ok(info) => log::info!(
                "{path}: pipette fw {}.{} hw {}.0 serial {} model {}",
                info.firmware.0,
                info.firmware.1,
                info.hardware,
                info.serial_number,
                info.model_type
            ),
            Err(err) => log::warn!("{path}: pipette did not identify: {err:#}"),
        }
        Ok(link)
    }

    fn identify(&mut self) -> eyre::Result<PipetteInfo> {
        let response = self
            .request(MSG_GET_INFO, &[])?
            .ok_or_else(|| eyre::eyre!("no response to info request"))?;
        if StatusCode::from(response.status) != StatusCode::Accepted {
            return Err(eyre::eyre!(
                "info request failed: {}",
                StatusCode::from(response.status).describe()
            ));
        }
        PipetteInfo::from_data(&response.data).ok_or_else(|| eyre::eyre!("info payload too short"))
    }

    /// Send one message and wait for its reply. `Ok(None)` means the device
    /// stayed silent until the response timeout.
    fn request(&mut self, msg_type: u16, payload: &[u8]) -> eyre::Result<Option<Response>> {
        let frame = build_frame(self.sequence.next(), msg_type, payload)?;
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|err| eyre::eyre!("clear input: {err}"))?;
        self.write_frame(&frame)?;
        self.read_response(msg_type)
    }

    fn write_frame(&mut self, frame: &[u8]) -> eyre::Result<()> {
        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut written = 0;
        while written < frame.len() {
            match self.port.write(&frame[written..]) {
                Ok(0) => return Err(eyre::eyre!("write request: port closed")),
                Ok(count) => written += count,
                Err(err) if err.kind() == ErrorKind::TimedOut && Instant::now() < deadline => {}
                Err(err) => return Err(eyre::eyre!("write request: {err}")),
            }
        }
        self.port
            .flush()
            .map_err(|err| eyre::eyre!("flush request: {err}"))
    }

    fn read_response(&mut self, expected_type: u16) -> eyre::Result<Option<Response>> {
        let deadline = Instant::now() + self.response_timeout;
        let mut buffer = Vec::with_capacity(64);
        let mut chunk = [0u8; 64];

        loop {
            while let Some((start, end)) = find_frame(&buffer) {
                let parsed = parse_frame(&buffer[start..=end]);
                buffer.drain(..=end);
                match parsed {
                    Ok(response) if response.msg_type == expected_type => {
                        return Ok(Some(response));
                    }
                    Ok(response) => log::debug!(
                        "{}: skipping response #{} to message 0x{:02X}",
                        self.path,
                        response.sequence,
                        response.msg_type
                    ),
                    Err(err) => log::debug!("{}: dropping frame: {err}", self.path),
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            match self.port.read(&mut chunk) {
                Ok(count) => buffer.extend_from_slice(&chunk[..count]),
                Err(err) if err.kind() == ErrorKind::TimedOut => {}
                Err(err) => return Err(eyre::eyre!("read response: {err}")),
            }
        }
    }
}

impl PipetteLink for ViafloLink {
    fn send(&mut self, command: Command) -> eyre::Result<()> {
        let payload = build_action_payload(command);
        let response = self
            .request(MSG_SET_ACTION, &payload)?
            .ok_or_else(|| eyre::eyre!("no response to {command}"))?;
        check_action_response(command, &response)
    }

    fn read_signal(&mut self) -> DeviceSignal {
        match self.request(MSG_GET_ACTION_STATUS, &[]) {
            Ok(Some(response)) => signal_from_status_response(&response),
            Ok(None) => {
                log::debug!("{}: status request timed out", self.path);
                DeviceSignal::Pending
            }
            Err(err) => DeviceSignal::Error(format!("{err:#}")),
        }
    }
}

fn build_action_payload(command: Command) -> Vec<u8> {
    let [volume_hi, volume_lo] = command.device_volume().to_be_bytes();
    let mut payload = Vec::with_capacity(28);
    payload.extend_from_slice(&[
        action_code(command.action),
        command.speed,
        volume_hi,
        volume_lo,
        0, // mix cycles
        0, // no RUN key confirmation
    ]);
    payload.extend_from_slice(&display_message(command.action));
    payload.extend_from_slice(&[0, 0]); // spacing
    payload
}

fn check_action_response(command: Command, response: &Response) -> eyre::Result<()> {
    match StatusCode::from(response.status) {
        StatusCode::Accepted => Ok(()),
        status => Err(eyre::eyre!(
            "{command} refused by pipette: {} (code {})",
            status.describe(),
            response.status
        )),
    }
}

fn signal_from_status_response(response: &Response) -> DeviceSignal {
    let status = StatusCode::from(response.status);
    if status != StatusCode::Accepted {
        log::debug!("status request answered with {}", status.describe());
        return DeviceSignal::Pending;
    }
    DeviceStatus::from_data(&response.data).map_or(DeviceSignal::Pending, DeviceStatus::signal)
}
