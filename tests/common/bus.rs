use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use usb_device::bus::{PollResult, UsbBus};
use usb_device::class_prelude::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};

const CBW_SIGNATURE: u32 = 0x43425355;
const CSW_SIGNATURE: u32 = 0x53425355;
const CSW_LEN: usize = 13;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// host to device
    Out,
    /// device to host
    In,
    None,
}

/// Command Block Wrapper as sent by the host
pub fn cbw(tag: u32, data_len: u32, direction: Direction, cb: &[u8]) -> Vec<u8> {
    assert!((1..=16).contains(&cb.len()));

    let mut bytes = vec![];
    bytes.extend_from_slice(&CBW_SIGNATURE.to_le_bytes());
    bytes.extend_from_slice(&tag.to_le_bytes());
    bytes.extend_from_slice(&data_len.to_le_bytes());
    bytes.push(if direction == Direction::In { 0x80 } else { 0x00 });
    bytes.push(0); // lun
    bytes.push(cb.len() as u8);
    let mut block = [0u8; 16];
    block[..cb.len()].copy_from_slice(cb);
    bytes.extend_from_slice(&block);
    bytes
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Passed,
    Failed,
    PhaseError,
}

/// Command Status Wrapper as received by the host
#[derive(Debug, Eq, PartialEq)]
pub struct Csw {
    pub tag: u32,
    pub residue: u32,
    pub status: Status,
}

impl Csw {
    pub fn parse(bytes: &[u8]) -> Csw {
        assert_eq!(CSW_LEN, bytes.len());
        assert_eq!(CSW_SIGNATURE, u32::from_le_bytes(bytes[..4].try_into().unwrap()));
        Csw {
            tag: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            residue: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            status: match bytes[12] {
                0x00 => Status::Passed,
                0x01 => Status::Failed,
                0x02 => Status::PhaseError,
                other => panic!("invalid status {}", other),
            },
        }
    }
}

struct Pipe {
    addr: EndpointAddress,
    max_packet_size: u16,
    stalled: bool,
    packets: VecDeque<Vec<u8>>,
    /// bytes moved by the device
    traffic: usize,
}

impl Pipe {
    fn new(addr: EndpointAddress, max_packet_size: u16) -> Self {
        Self {
            addr,
            max_packet_size,
            stalled: false,
            packets: VecDeque::new(),
            traffic: 0,
        }
    }
}

#[derive(Default)]
struct Pipes {
    enabled: bool,
    bulk_in: Option<Pipe>,
    bulk_out: Option<Pipe>,
}

impl Pipes {
    fn pipe(&mut self, addr: EndpointAddress) -> Option<&mut Pipe> {
        [self.bulk_in.as_mut(), self.bulk_out.as_mut()]
            .into_iter()
            .flatten()
            .find(|pipe| pipe.addr == addr)
    }
}

/// A USB bus whose far end is played by the test acting as the host
#[derive(Clone, Default)]
pub struct HostBus {
    pipes: Arc<Mutex<Pipes>>,
}

impl HostBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes on the bulk OUT endpoint, split into packets
    pub fn send(&self, bytes: &[u8]) {
        let mut pipes = self.pipes.lock().unwrap();
        let pipe = pipes.bulk_out.as_mut().unwrap();
        for chunk in bytes.chunks(pipe.max_packet_size as usize) {
            pipe.packets.push_back(chunk.to_vec());
        }
    }

    /// Takes everything the device has written to the bulk IN endpoint
    pub fn receive(&self) -> Vec<u8> {
        let mut pipes = self.pipes.lock().unwrap();
        let pipe = pipes.bulk_in.as_mut().unwrap();
        pipe.packets.drain(..).flatten().collect()
    }

    /// Bytes the device has moved so far in both directions
    pub fn traffic(&self) -> usize {
        let pipes = self.pipes.lock().unwrap();
        [pipes.bulk_in.as_ref(), pipes.bulk_out.as_ref()]
            .into_iter()
            .flatten()
            .map(|pipe| pipe.traffic)
            .sum()
    }

    /// Drops whatever the device has not read yet
    pub fn flush_out(&self) {
        let mut pipes = self.pipes.lock().unwrap();
        pipes.bulk_out.as_mut().unwrap().packets.clear();
    }
}

impl UsbBus for HostBus {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        _ep_addr: Option<EndpointAddress>,
        ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        let mut pipes = self.pipes.lock().unwrap();
        assert!(!pipes.enabled);

        if matches!(ep_type, EndpointType::Control) {
            return Ok(EndpointAddress::from_parts(0, ep_dir));
        }

        let addr = EndpointAddress::from_parts(1, ep_dir);
        let pipe = Pipe::new(addr, max_packet_size);
        match ep_dir {
            UsbDirection::Out => pipes.bulk_out.replace(pipe),
            UsbDirection::In => pipes.bulk_in.replace(pipe),
        };
        Ok(addr)
    }

    fn enable(&mut self) {
        self.pipes.lock().unwrap().enabled = true;
    }

    fn reset(&self) {}

    fn set_device_address(&self, _addr: u8) {}

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        let mut pipes = self.pipes.lock().unwrap();
        let pipe = pipes.pipe(ep_addr).ok_or(UsbError::InvalidEndpoint)?;
        if buf.len() > pipe.max_packet_size as usize {
            return Err(UsbError::BufferOverflow);
        }
        pipe.packets.push_back(buf.to_vec());
        pipe.traffic += buf.len();
        Ok(buf.len())
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        let mut pipes = self.pipes.lock().unwrap();
        let pipe = pipes.pipe(ep_addr).ok_or(UsbError::InvalidEndpoint)?;
        let len = match pipe.packets.front() {
            Some(packet) => packet.len(),
            None => return Err(UsbError::WouldBlock),
        };
        if len > buf.len() {
            return Err(UsbError::BufferOverflow);
        }
        let packet = pipe.packets.pop_front().unwrap();
        buf[..len].copy_from_slice(&packet);
        pipe.traffic += len;
        Ok(len)
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        if let Some(pipe) = self.pipes.lock().unwrap().pipe(ep_addr) {
            pipe.stalled = stalled;
        }
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        self.pipes
            .lock()
            .unwrap()
            .pipe(ep_addr)
            .map_or(false, |pipe| pipe.stalled)
    }

    fn suspend(&self) {}

    fn resume(&self) {}

    fn poll(&self) -> PollResult {
        PollResult::None
    }
}
