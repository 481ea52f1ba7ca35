//-----------------------------------------------------------------------------
// Module image
// Static memory images and the static file transport
// An image is loaded from a Motorola S-record file or a raw binary file,
// StaticImageTransport serves the transfers of StaticFile fetch channels from it

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use parking_lot::{Mutex, MutexGuard};
use std::path::Path;

use crate::fetch::{Direction, Dispatcher, LinkError, TransferStatus, Transport, TransportKind};

//----------------------------------------------------------------------------------------------
// BinImage

/// Memory image covering offset..offset+size
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BinImage {
    offset: u64,
    image: Vec<u8>,
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn decode_hex(s: &[u8]) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.chunks_exact(2).map(|c| Some((hex_nibble(c[0])? << 4) | hex_nibble(c[1])?)).collect()
}

// Parse one S-record line, returns the address and data of S1/S2/S3 data records
fn parse_record(line: &str, line_no: usize) -> Result<Option<(u64, Vec<u8>)>, LinkError> {
    let format_error = |reason: &str| LinkError::ImageFormat {
        line: line_no,
        reason: reason.to_string(),
    };
    let line = line.trim_end().as_bytes();
    if line.is_empty() {
        return Ok(None);
    }
    if line.len() < 4 || line[0] != b'S' {
        return Err(format_error("not an S-record"));
    }
    let address_len = match line[1] {
        b'1' => 2,
        b'2' => 3,
        b'3' => 4,
        b'0' | b'4'..=b'9' => return Ok(None),
        _ => return Err(format_error("unknown record type")),
    };

    let raw = decode_hex(&line[2..]).ok_or_else(|| format_error("invalid hex digits"))?;
    let count = raw[0] as usize;
    if raw.len() != count + 1 || count < address_len + 1 {
        return Err(format_error("byte count mismatch"));
    }
    let sum = raw[..count].iter().fold(0u8, |s, b| s.wrapping_add(*b));
    if !sum != raw[count] {
        return Err(format_error("checksum mismatch"));
    }
    let address = raw[1..=address_len].iter().fold(0u64, |a, b| (a << 8) | u64::from(*b));
    Ok(Some((address, raw[1 + address_len..count].to_vec())))
}

impl BinImage {
    /// Zero filled image
    pub fn new(offset: u64, size: usize) -> BinImage {
        BinImage { offset, image: vec![0; size] }
    }

    pub fn from_bytes(offset: u64, bytes: Vec<u8>) -> BinImage {
        BinImage { offset, image: bytes }
    }

    /// Parse S-record text into the window offset..offset+size
    /// Data outside of the window is ignored, bytes never written are zero
    pub fn parse_s19(text: &str, offset: u64, size: usize) -> Result<BinImage, LinkError> {
        let mut image = BinImage::new(offset, size);
        let mut records = 0usize;
        for (i, line) in text.lines().enumerate() {
            if let Some((address, data)) = parse_record(line, i + 1)? {
                records += 1;
                for (n, b) in data.iter().enumerate() {
                    if let Some(slot) = image.slot(address + n as u64) {
                        *slot = *b;
                    }
                }
            }
        }
        debug!("{} data records, window {:#x}+{:#x}", records, offset, size);
        Ok(image)
    }

    /// Load an S-record file into the window offset..offset+size
    pub fn load_s19<P: AsRef<Path>>(path: &P, offset: u64, size: usize) -> Result<BinImage, LinkError> {
        let path = path.as_ref();
        info!("Load S19 file {}", path.display());
        let text = std::fs::read_to_string(path)?;
        BinImage::parse_s19(&text, offset, size)
    }

    /// Load a raw binary file, the image starts at address 0
    pub fn load_bin<P: AsRef<Path>>(path: &P) -> Result<BinImage, LinkError> {
        let path = path.as_ref();
        info!("Load binary file {}", path.display());
        Ok(BinImage::from_bytes(0, std::fs::read(path)?))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.image.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.image
    }

    fn slot(&mut self, address: u64) -> Option<&mut u8> {
        let i = usize::try_from(address.checked_sub(self.offset)?).ok()?;
        self.image.get_mut(i)
    }

    fn range(&self, address: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(address.checked_sub(self.offset)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.image.len()).then_some(start..end)
    }

    /// Copy image bytes at address into dst, false if not completely inside the image
    pub fn read(&self, address: u64, dst: &mut [u8]) -> bool {
        match self.range(address, dst.len()) {
            Some(r) => {
                dst.copy_from_slice(&self.image[r]);
                true
            }
            None => false,
        }
    }

    /// Patch the image at address, false if not completely inside the image
    pub fn write(&mut self, address: u64, src: &[u8]) -> bool {
        match self.range(address, src.len()) {
            Some(r) => {
                self.image[r].copy_from_slice(src);
                true
            }
            None => false,
        }
    }
}

//----------------------------------------------------------------------------------------------
// StaticImageTransport

/// Polling driver of StaticFile fetch channels with a matching image handle
#[derive(Debug)]
pub struct StaticImageTransport {
    handle: u32,
    image: Mutex<BinImage>,
    dispatcher: Dispatcher,
}

impl StaticImageTransport {
    pub fn new(handle: u32, image: BinImage, dispatcher: Dispatcher) -> StaticImageTransport {
        StaticImageTransport {
            handle,
            image: Mutex::new(image),
            dispatcher,
        }
    }

    /// Transport to open fetch channels on this image with
    pub fn transport(&self) -> Transport {
        Transport::StaticFile { handle: self.handle }
    }

    pub fn image(&self) -> MutexGuard<'_, BinImage> {
        self.image.lock()
    }

    /// Serve all transfers pending for this image, returns the number of completed transfers
    /// A span outside of the image fails its transfer
    pub fn service(&self) -> usize {
        let mut n = 0;
        while let Some(mut transfer) = self.dispatcher.take_pending(TransportKind::StaticFile, Some(self.handle)) {
            let ok = {
                let mut image = self.image.lock();
                match transfer.direction() {
                    Direction::Read => transfer.spans_mut().iter_mut().all(|s| image.read(s.address, &mut s.data)),
                    Direction::Write => transfer.spans().iter().all(|s| image.write(s.address, &s.data)),
                }
            };
            let status = if ok {
                TransferStatus::Done
            } else {
                warn!("image {}: {} outside of image", self.handle, transfer.group());
                TransferStatus::Failed
            };
            match self.dispatcher.complete_transfer(transfer, status) {
                Ok(()) => n += 1,
                Err(e) => warn!("image {}: {}", self.handle, e),
            }
        }
        n
    }
}

//----------------------------------------------------------------------------------------------
// Test module
