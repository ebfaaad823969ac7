#![allow(dead_code)]

use std::sync::mpsc::sync_channel;
use std::thread;
use std::time::Duration;
use usb_device::bus::UsbBusAllocator;
use usb_device::device::{UsbDeviceBuilder, UsbVidPid};
use usbd_flashdisk::host::BlockHandler;
use usbd_flashdisk::{MediaSession, MscClass};

use crate::common::bus::{cbw, Csw, Direction, HostBus, Status};
use crate::common::flash::RamPartition;

pub mod bus;
pub mod flash;

pub const PACKET_SIZES: [u16; 4] = [8, 16, 32, 64];

pub type Session = MediaSession<RamPartition, Vec<u8>>;

/// A device under test together with the host side of its bus
pub struct Disk<'a, H> {
    pub bus: HostBus,
    pub msc: MscClass<'a, HostBus, &'a mut [u8]>,
    pub handler: H,
    tag: u32,
}

impl<H: BlockHandler> Disk<'_, H> {
    /// Polls the device until it stops moving bytes
    pub fn drive(&mut self) {
        let mut idle = 0;
        while idle < 2 {
            let before = self.bus.traffic();
            self.msc.poll(&mut self.handler).unwrap();
            if self.bus.traffic() == before {
                idle += 1;
            } else {
                idle = 0;
            }
        }
    }

    /// Runs a single command, returning data sent by the device and the status
    pub fn exec(&mut self, cb: &[u8], direction: Direction, data_len: u32, data: &[u8]) -> (Vec<u8>, Csw) {
        self.tag += 1;
        self.bus.send(&cbw(self.tag, data_len, direction, cb));
        if !data.is_empty() {
            self.bus.send(data);
        }
        self.drive();
        // data the device refused to take
        self.bus.flush_out();

        let mut bytes = self.bus.receive();
        assert!(bytes.len() >= 13, "no status received");
        let csw = Csw::parse(&bytes.split_off(bytes.len() - 13));
        assert_eq!(self.tag, csw.tag);
        (bytes, csw)
    }

    pub fn data_in(&mut self, cb: &[u8], len: u32) -> (Vec<u8>, Csw) {
        self.exec(cb, Direction::In, len, &[])
    }

    pub fn data_out(&mut self, cb: &[u8], data: &[u8]) -> Csw {
        self.exec(cb, Direction::Out, data.len() as u32, data).1
    }

    pub fn no_data(&mut self, cb: &[u8]) -> Csw {
        self.exec(cb, Direction::None, 0, &[]).1
    }

    /// (sense key, additional sense code) of the last failure
    pub fn sense(&mut self) -> (u8, u8) {
        let (data, csw) = self.data_in(&scsi::request_sense(18), 18);
        assert_eq!(Status::Passed, csw.status);
        assert_eq!(18, data.len());
        (data[2] & 0x0F, data[12])
    }
}

/// Builds a disk on a fresh bus and hands it to `f`
pub fn with_disk<H, F>(packet_size: u16, block_buf_len: usize, handler: H, f: F)
where
    H: BlockHandler,
    F: FnOnce(&mut Disk<'_, H>),
{
    let mut io_buf = vec![0u8; 512];
    let mut block_buf = vec![0u8; block_buf_len];
    let bus = HostBus::new();
    let usb_bus = UsbBusAllocator::new(bus.clone());
    let msc = MscClass::new(
        &usb_bus,
        packet_size,
        io_buf.as_mut_slice(),
        block_buf.as_mut_slice(),
    )
    .unwrap();
    let _ = UsbDeviceBuilder::new(&usb_bus, UsbVidPid(0xabcd, 0xabcd)).build();

    let mut disk = Disk {
        bus,
        msc,
        handler,
        tag: 0,
    };
    f(&mut disk);
}

pub fn timeout<F, T>(timeout: Duration, f: F)
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = sync_channel(0);
    thread::spawn(move || {
        f();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(timeout).expect("timeout");
}
