use crate::memory::WORD_SIZE;
use crate::CoprocessorError;
use serde::{Deserialize, Serialize};

pub const HEADER_SIZE: usize = 12;

/// `"ulp\0"` read as a native-order word.
pub const ULP_MAGIC: u32 = u32::from_ne_bytes(*b"ulp\0");

/// Fixed-layout header at the start of every ULP binary.
///
/// All fields are stored in host byte order. Sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub magic: u32,
    pub text_offset: u16,
    pub text_size: u16,
    pub data_size: u16,
    pub bss_size: u16,
}

impl ImageHeader {
    /// Copies the first [`HEADER_SIZE`] bytes verbatim. Nothing is validated
    /// beyond the length; that is the loader's job.
    pub fn parse(bytes: &[u8]) -> Result<Self, CoprocessorError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CoprocessorError::InvalidSize(format!(
                "{} bytes is shorter than the {} byte header",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        let u16_at = |i: usize| u16::from_ne_bytes([bytes[i], bytes[i + 1]]);
        Ok(Self {
            magic: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            text_offset: u16_at(4),
            text_size: u16_at(6),
            data_size: u16_at(8),
            bss_size: u16_at(10),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_ne_bytes());
        out[4..6].copy_from_slice(&self.text_offset.to_ne_bytes());
        out[6..8].copy_from_slice(&self.text_size.to_ne_bytes());
        out[8..10].copy_from_slice(&self.data_size.to_ne_bytes());
        out[10..12].copy_from_slice(&self.bss_size.to_ne_bytes());
        out
    }

    /// Bytes the image occupies on the wire (header, padding, text, data).
    pub fn image_len(&self) -> usize {
        self.text_offset as usize + self.text_size as usize + self.data_size as usize
    }
}

/// Word indices of the three sections inside the shared memory window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryWindow {
    pub text: usize,
    pub data: usize,
    pub bss: usize,
}

impl MemoryWindow {
    /// Lays the sections out back to back from `load_addr` (a word index).
    /// Trusts the header.
    pub fn map(header: &ImageHeader, load_addr: usize) -> Self {
        let text = load_addr;
        let data = text + header.text_size as usize / WORD_SIZE;
        let bss = data + header.data_size as usize / WORD_SIZE;
        Self { text, data, bss }
    }
}

/// Converts words to bytes in host order, the layout the ULP sees them in.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_ne_bytes()).collect()
}

/// Packs sections into the ULP binary format. Sections are zero padded to
/// a whole number of words.
pub fn build_image(
    text: &[u8],
    data: &[u8],
    bss_size: usize,
) -> Result<Vec<u8>, CoprocessorError> {
    let text_size = text.len().next_multiple_of(WORD_SIZE);
    let data_size = data.len().next_multiple_of(WORD_SIZE);
    let bss_size = bss_size.next_multiple_of(WORD_SIZE);

    let field = |name: &str, size: usize| {
        u16::try_from(size).map_err(|_| {
            CoprocessorError::InvalidSize(format!("{} section of {} bytes", name, size))
        })
    };
    let header = ImageHeader {
        magic: ULP_MAGIC,
        text_offset: HEADER_SIZE as u16,
        text_size: field(".text", text_size)?,
        data_size: field(".data", data_size)?,
        bss_size: field(".bss", bss_size)?,
    };

    let mut image = Vec::with_capacity(HEADER_SIZE + text_size + data_size);
    image.extend_from_slice(&header.to_bytes());
    image.extend_from_slice(text);
    image.resize(HEADER_SIZE + text_size, 0);
    image.extend_from_slice(data);
    image.resize(HEADER_SIZE + text_size + data_size, 0);
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RTC_SLOW_MEM_BYTES;

    #[test]
    fn test_header_parse_copies_native_fields() {
        let header = ImageHeader {
            magic: ULP_MAGIC,
            text_offset: 12,
            text_size: 64,
            data_size: 20,
            bss_size: 8,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&[0xAA; 84]);

        assert_eq!(ImageHeader::parse(&bytes).unwrap(), header);
        assert_eq!(&bytes[0..4], b"ulp\0");
    }

    #[test]
    fn test_header_parse_does_not_check_magic() {
        let bytes = [0xFFu8; HEADER_SIZE];
        let header = ImageHeader::parse(&bytes).unwrap();
        assert_eq!(header.magic, 0xFFFF_FFFF);
    }

    #[test]
    fn test_header_parse_short_buffer() {
        let err = ImageHeader::parse(b"ulp\0\x0c\x00").unwrap_err();
        assert!(matches!(err, CoprocessorError::InvalidSize(_)));
    }

    #[test]
    fn test_window_regions_are_ordered_and_disjoint() {
        let cases = [(0u16, 0u16), (4, 0), (0, 4), (400, 20), (4000, 4096), (8156, 0)];
        for (text_size, data_size) in cases {
            let header = ImageHeader {
                magic: ULP_MAGIC,
                text_offset: 12,
                text_size,
                data_size,
                bss_size: 0,
            };
            let window = MemoryWindow::map(&header, 0);
            assert_eq!(window.text, 0);
            assert!(window.text <= window.data && window.data <= window.bss);
            assert_eq!(window.data - window.text, text_size as usize / WORD_SIZE);
            assert_eq!(window.bss - window.data, data_size as usize / WORD_SIZE);
            assert!(window.bss * WORD_SIZE <= RTC_SLOW_MEM_BYTES);
        }
    }

    #[test]
    fn test_window_honours_load_addr() {
        let header = ImageHeader {
            magic: ULP_MAGIC,
            text_offset: 12,
            text_size: 8,
            data_size: 12,
            bss_size: 4,
        };
        let window = MemoryWindow::map(&header, 16);
        assert_eq!(window, MemoryWindow { text: 16, data: 18, bss: 21 });
    }

    #[test]
    fn test_build_image_pads_sections() {
        let image = build_image(&[1, 2, 3], &[4], 5).unwrap();
        let header = ImageHeader::parse(&image).unwrap();
        assert_eq!(header.magic, ULP_MAGIC);
        assert_eq!(header.text_offset, 12);
        assert_eq!(header.text_size, 4);
        assert_eq!(header.data_size, 4);
        assert_eq!(header.bss_size, 8);
        assert_eq!(image.len(), header.image_len());
        assert_eq!(&image[12..20], &[1, 2, 3, 0, 4, 0, 0, 0]);
    }

    #[test]
    fn test_build_image_rejects_oversized_section() {
        let text = vec![0u8; 70_000];
        assert!(build_image(&text, &[], 0).is_err());
    }
}
