use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, trace, warn};

use super::PlcError;

/// Base address of the holding-register block shared with the PLC.
pub const BLOCK_BASE: u16 = 10;
/// Block length; covers registers 20-26 plus headroom.
pub const BLOCK_LEN: u16 = 17;

/// Read timeout used as the RTU inter-frame gap.
const FRAME_GAP: Duration = Duration::from_millis(10);

const FN_READ_HOLDING: u8 = 0x03;
const FN_WRITE_SINGLE: u8 = 0x06;
const FN_WRITE_MULTIPLE: u8 = 0x10;

const EX_ILLEGAL_FUNCTION: u8 = 0x01;
const EX_ILLEGAL_ADDRESS: u8 = 0x02;
const EX_ILLEGAL_VALUE: u8 = 0x03;

/// The holding-register block backing the RTU slave.
///
/// Addresses are absolute register numbers; the block rejects anything
/// outside `[base, base + len)`.
pub struct HoldingBlock {
    base: u16,
    words: Mutex<Vec<u16>>,
}

impl HoldingBlock {
    pub fn new(base: u16, len: u16) -> HoldingBlock {
        HoldingBlock {
            base,
            words: Mutex::new(vec![0; len as usize]),
        }
    }

    fn index(&self, address: u16) -> Result<usize, PlcError> {
        let len = self.words.lock().unwrap().len() as u16;
        address
            .checked_sub(self.base)
            .filter(|offset| *offset < len)
            .map(usize::from)
            .ok_or(PlcError::AddressOutOfRange(address))
    }

    pub fn read(&self, address: u16) -> Result<u16, PlcError> {
        let index = self.index(address)?;
        Ok(self.words.lock().unwrap()[index])
    }

    pub fn write(&self, address: u16, value: u16) -> Result<(), PlcError> {
        let index = self.index(address)?;
        self.words.lock().unwrap()[index] = value;
        Ok(())
    }

    pub fn read_range(&self, address: u16, count: u16) -> Result<Vec<u16>, PlcError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let first = self.index(address)?;
        let last = self.index(address + count.saturating_sub(1))?;
        Ok(self.words.lock().unwrap()[first..=last].to_vec())
    }

    pub fn write_range(&self, address: u16, values: &[u16]) -> Result<(), PlcError> {
        let first = self.index(address)?;
        self.index(address + values.len().saturating_sub(1) as u16)?;
        let mut words = self.words.lock().unwrap();
        words[first..first + values.len()].copy_from_slice(values);
        Ok(())
    }
}

/// Modbus CRC-16 (poly 0xA001, init 0xFFFF), transmitted low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn exception(slave: u8, function: u8, code: u8) -> Vec<u8> {
    finalize(vec![slave, function | 0x80, code])
}

fn finalize(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
    frame
}

fn be16(frame: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}

/// Service one request frame against the block.
///
/// Returns the response frame, or `None` when the frame is not ours to
/// answer (wrong slave, bad CRC, runt frame).
pub fn process_request(frame: &[u8], slave: u8, block: &HoldingBlock) -> Option<Vec<u8>> {
    if frame.len() < 4 {
        return None;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from(tail[0]) | (u16::from(tail[1]) << 8);
    if crc16(body) != received {
        debug!("dropping frame with bad crc");
        return None;
    }
    if body[0] != slave {
        return None;
    }

    let function = body[1];
    match function {
        FN_READ_HOLDING if body.len() == 6 => {
            let start = be16(body, 2);
            let count = be16(body, 4);
            match block.read_range(start, count) {
                Ok(words) => {
                    let mut out = vec![slave, function, (words.len() * 2) as u8];
                    for word in words {
                        out.extend_from_slice(&word.to_be_bytes());
                    }
                    Some(finalize(out))
                }
                Err(_) => Some(exception(slave, function, EX_ILLEGAL_ADDRESS)),
            }
        }
        FN_WRITE_SINGLE if body.len() == 6 => {
            let address = be16(body, 2);
            let value = be16(body, 4);
            match block.write(address, value) {
                Ok(()) => Some(frame.to_vec()),
                Err(_) => Some(exception(slave, function, EX_ILLEGAL_ADDRESS)),
            }
        }
        FN_WRITE_MULTIPLE if body.len() >= 7 => {
            let start = be16(body, 2);
            let count = be16(body, 4) as usize;
            let byte_count = body[6] as usize;
            if byte_count != count * 2 || body.len() != 7 + byte_count {
                return Some(exception(slave, function, EX_ILLEGAL_VALUE));
            }
            let values: Vec<u16> = (0..count).map(|i| be16(body, 7 + i * 2)).collect();
            match block.write_range(start, &values) {
                Ok(()) => {
                    let mut out = vec![slave, function];
                    out.extend_from_slice(&start.to_be_bytes());
                    out.extend_from_slice(&(count as u16).to_be_bytes());
                    Some(finalize(out))
                }
                Err(_) => Some(exception(slave, function, EX_ILLEGAL_ADDRESS)),
            }
        }
        _ => Some(exception(slave, function, EX_ILLEGAL_FUNCTION)),
    }
}

/// Background service for the serial side of the slave.
///
/// Owns the port, splits the byte stream into silence-delimited frames and
/// answers the bus master out of the holding block. Wire faults are logged
/// and the loop keeps going.
pub struct RtuService {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RtuService {
    pub fn spawn(
        path: &str,
        baudrate: u32,
        slave: u8,
        block: Arc<HoldingBlock>,
    ) -> Result<RtuService, PlcError> {
        let port = serialport::new(path, baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(FRAME_GAP)
            .open()?;

        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("plc-rtu".into())
            .spawn({
                let stop = Arc::clone(&stop);
                move || serve(port, slave, block, stop)
            })
            .map_err(PlcError::Io)?;

        Ok(RtuService {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(mut port: Box<dyn SerialPort>, slave: u8, block: Arc<HoldingBlock>, stop: Arc<AtomicBool>) {
    let mut frame = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];

    while !stop.load(Ordering::SeqCst) {
        match port.read(&mut chunk) {
            Ok(0) => flush(&mut frame, slave, &block, port.as_mut()),
            Ok(n) => {
                frame.extend_from_slice(&chunk[..n]);
                // Runaway garbage between gaps; resync on the next silence.
                if frame.len() > 512 {
                    frame.clear();
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                flush(&mut frame, slave, &block, port.as_mut());
            }
            Err(err) => {
                warn!("serial read failed: {err}");
                frame.clear();
            }
        }
    }
}

fn flush(frame: &mut Vec<u8>, slave: u8, block: &HoldingBlock, port: &mut dyn SerialPort) {
    if frame.is_empty() {
        return;
    }
    trace!(len = frame.len(), "rtu frame");
    if let Some(response) = process_request(frame, slave, block) {
        if let Err(err) = port.write_all(&response) {
            warn!("serial write failed: {err}");
        }
    }
    frame.clear();
}
