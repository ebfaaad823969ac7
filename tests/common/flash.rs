use std::cell::RefCell;
use std::rc::Rc;
use usbd_flashdisk::flash::{FlashError, FlashPartition, FlashVolume, Geometry, MountConfig, MountError};

/// RAM backed NOR flash. Erased cells read 0xFF, programming only clears bits.
pub struct Chip {
    pub mem: Vec<u8>,
    pub geometry: Geometry,
    pub erase_size: u32,
    pub formatted: bool,
    pub format_fails: bool,
    pub mounted: bool,
    pub fail: Option<FlashError>,
    pub reads: usize,
    /// (offset, len) of every erase
    pub erases: Vec<(u32, u32)>,
}

impl Chip {
    pub fn new(sector_size: u32, sector_count: u32) -> Rc<RefCell<Chip>> {
        Rc::new(RefCell::new(Chip {
            mem: vec![0u8; (sector_size * sector_count) as usize],
            geometry: Geometry::new(sector_size, sector_count),
            erase_size: sector_size,
            formatted: true,
            format_fails: false,
            mounted: false,
            fail: None,
            reads: 0,
            erases: vec![],
        }))
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.mem[offset..offset + len]
    }

    fn check(&self, offset: u32, len: usize) {
        let end = offset as usize + len;
        assert!(end <= self.mem.len(), "access beyond capacity: {}..{}", offset, end);
    }
}

pub struct RamPartition {
    pub chip: Rc<RefCell<Chip>>,
}

pub struct RamVolume {
    chip: Rc<RefCell<Chip>>,
}

impl FlashPartition for RamPartition {
    type Volume = RamVolume;

    fn mount(&mut self, config: &MountConfig) -> Result<RamVolume, MountError> {
        let mut chip = self.chip.borrow_mut();
        assert!(!chip.mounted);
        if !chip.formatted {
            if !config.format_if_mount_failed {
                return Err(MountError::MountFailed);
            }
            if chip.format_fails {
                return Err(MountError::FormatFailed);
            }
            chip.mem.fill(0xFF);
            chip.formatted = true;
        }
        chip.mounted = true;
        Ok(RamVolume {
            chip: self.chip.clone(),
        })
    }

    fn unmount(&mut self, _volume: RamVolume) {
        self.chip.borrow_mut().mounted = false;
    }
}

impl FlashVolume for RamVolume {
    fn geometry(&self) -> Geometry {
        self.chip.borrow().geometry
    }

    fn erase_size(&self) -> u32 {
        self.chip.borrow().erase_size
    }

    fn read(&mut self, offset: u32, dst: &mut [u8]) -> Result<(), FlashError> {
        let mut chip = self.chip.borrow_mut();
        chip.check(offset, dst.len());
        if chip.fail == Some(FlashError::Read) {
            return Err(FlashError::Read);
        }
        chip.reads += 1;
        dst.copy_from_slice(chip.bytes(offset as usize, dst.len()));
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        let mut chip = self.chip.borrow_mut();
        chip.check(offset, len as usize);
        assert_eq!(0, offset % chip.erase_size, "unaligned erase offset");
        assert_eq!(0, len % chip.erase_size, "unaligned erase length");
        if chip.fail == Some(FlashError::Erase) {
            return Err(FlashError::Erase);
        }
        chip.erases.push((offset, len));
        chip.mem[offset as usize..(offset + len) as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, src: &[u8]) -> Result<(), FlashError> {
        let mut chip = self.chip.borrow_mut();
        chip.check(offset, src.len());
        if chip.fail == Some(FlashError::Write) {
            return Err(FlashError::Write);
        }
        let offset = offset as usize;
        for (cell, byte) in chip.mem[offset..offset + src.len()].iter_mut().zip(src) {
            *cell &= *byte;
        }
        Ok(())
    }
}
