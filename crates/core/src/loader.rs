use crate::image::{ImageHeader, HEADER_SIZE, ULP_MAGIC};
use crate::memory::WORD_SIZE;
use crate::{CoprocessorError, SharedMemory};

/// Copies a ULP binary into shared memory at `load_addr` (a word index).
///
/// Performs the checks of the ESP-IDF `ulp_load_binary`: header present,
/// magic `"ulp\0"`, sections present in the buffer, and the loaded image
/// (including `.bss`) within `reserved_bytes`. `.bss` is zeroed.
pub fn load_binary<M: SharedMemory + ?Sized>(
    memory: &M,
    load_addr: usize,
    image: &[u8],
    reserved_bytes: usize,
) -> Result<ImageHeader, CoprocessorError> {
    if image.len() < HEADER_SIZE {
        return Err(CoprocessorError::InvalidSize(format!(
            "image of {} bytes has no header",
            image.len()
        )));
    }
    let header = ImageHeader::parse(image)?;
    if header.magic != ULP_MAGIC {
        return Err(CoprocessorError::NotSupported(header.magic));
    }
    if header.image_len() > image.len() {
        return Err(CoprocessorError::InvalidSize(format!(
            "header declares {} bytes but image has {}",
            header.image_len(),
            image.len()
        )));
    }
    if header.image_len() < image.len() {
        tracing::debug!(
            "Ignoring {} trailing bytes after .data",
            image.len() - header.image_len()
        );
    }

    let sections = &image[header.text_offset as usize..header.image_len()];
    let section_words = sections.len().div_ceil(WORD_SIZE);
    let bss_words = (header.bss_size as usize).div_ceil(WORD_SIZE);

    // Bound in whole words, the unit the sections are written in.
    let reserved_words = reserved_bytes.min(memory.len_words() * WORD_SIZE) / WORD_SIZE;
    let required_words = load_addr
        .checked_add(section_words)
        .and_then(|words| words.checked_add(bss_words));
    match required_words {
        Some(words) if words <= reserved_words => {}
        Some(words) => {
            return Err(CoprocessorError::InvalidSize(format!(
                "image needs {} words at word {}, only {} reserved",
                words - load_addr,
                load_addr,
                reserved_words
            )));
        }
        None => {
            return Err(CoprocessorError::InvalidSize(format!(
                "load address {} is out of range",
                load_addr
            )));
        }
    }

    let bss_start = load_addr + section_words;
    for index in bss_start..bss_start + bss_words {
        memory.write_word(index, 0);
    }
    for (i, chunk) in sections.chunks(WORD_SIZE).enumerate() {
        let mut word = [0u8; WORD_SIZE];
        word[..chunk.len()].copy_from_slice(chunk);
        memory.write_word(load_addr + i, u32::from_ne_bytes(word));
    }

    tracing::debug!(
        "Loaded ULP image: text={}B data={}B bss={}B at word {}",
        header.text_size,
        header.data_size,
        header.bss_size,
        load_addr
    );
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{build_image, words_to_bytes};
    use crate::memory::{RtcSlowMemory, RTC_SLOW_MEM_BYTES};

    #[test]
    fn test_load_copies_text_and_data() {
        let mem = RtcSlowMemory::default();
        let image = build_image(
            &words_to_bytes(&[0xB000_0000, 0x1234_5678]),
            &words_to_bytes(&[7, 8]),
            0,
        )
        .unwrap();

        let header = load_binary(&mem, 0, &image, RTC_SLOW_MEM_BYTES).unwrap();
        assert_eq!(header.text_size, 8);
        assert_eq!(&mem.snapshot()[..5], &[0xB000_0000, 0x1234_5678, 7, 8, 0]);
    }

    #[test]
    fn test_load_zeroes_bss() {
        let mem = RtcSlowMemory::default();
        for i in 0..8 {
            mem.write_word(i, 0xFFFF_FFFF);
        }
        let image = build_image(&words_to_bytes(&[1]), &words_to_bytes(&[2]), 12).unwrap();
        load_binary(&mem, 0, &image, RTC_SLOW_MEM_BYTES).unwrap();

        assert_eq!(&mem.snapshot()[..6], &[1, 2, 0, 0, 0, 0xFFFF_FFFF]);
    }

    #[test]
    fn test_load_at_offset() {
        let mem = RtcSlowMemory::default();
        let image = build_image(&words_to_bytes(&[5]), &[], 0).unwrap();
        load_binary(&mem, 10, &image, RTC_SLOW_MEM_BYTES).unwrap();
        assert_eq!(mem.read_word(10), 5);
        assert_eq!(mem.read_word(0), 0);
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let mem = RtcSlowMemory::default();
        let mut image = build_image(&[0; 4], &[], 0).unwrap();
        image[0] = b'x';
        let err = load_binary(&mem, 0, &image, RTC_SLOW_MEM_BYTES).unwrap_err();
        assert!(matches!(err, CoprocessorError::NotSupported(_)));
    }

    #[test]
    fn test_load_rejects_truncated_image() {
        let mem = RtcSlowMemory::default();
        let image = build_image(&[0; 16], &[0; 8], 0).unwrap();
        let err =
            load_binary(&mem, 0, &image[..image.len() - 4], RTC_SLOW_MEM_BYTES).unwrap_err();
        assert!(matches!(err, CoprocessorError::InvalidSize(_)));

        let err = load_binary(&mem, 0, b"ulp", RTC_SLOW_MEM_BYTES).unwrap_err();
        assert!(matches!(err, CoprocessorError::InvalidSize(_)));
    }

    #[test]
    fn test_load_rejects_image_over_reserved_memory() {
        let mem = RtcSlowMemory::default();
        let image = build_image(&[0; 64], &[], 8_176).unwrap();
        let err = load_binary(&mem, 0, &image, RTC_SLOW_MEM_BYTES).unwrap_err();
        assert!(matches!(err, CoprocessorError::InvalidSize(_)));

        let image = build_image(&[0; 64], &[], 0).unwrap();
        assert!(load_binary(&mem, 0, &image, 32).is_err());
        assert!(load_binary(&mem, 0, &image, 64).is_ok());
    }

    #[test]
    fn test_load_rejects_unaligned_sections_past_memory() {
        let mem = RtcSlowMemory::default();
        // 1 + 8175 bytes fits, but rounds up to 2045 words
        let image = [
            ImageHeader {
                magic: ULP_MAGIC,
                text_offset: HEADER_SIZE as u16,
                text_size: 1,
                data_size: 0,
                bss_size: 8_175,
            }
            .to_bytes()
            .as_slice(),
            &[0xB0],
        ]
        .concat();
        let err = load_binary(&mem, 0, &image, RTC_SLOW_MEM_BYTES).unwrap_err();
        assert!(matches!(err, CoprocessorError::InvalidSize(_)));
        assert!(mem.snapshot().iter().all(|&w| w == 0));
    }

    #[test]
    fn test_load_rejects_huge_load_addr() {
        let mem = RtcSlowMemory::default();
        let image = build_image(&words_to_bytes(&[5]), &[], 0).unwrap();
        let err = load_binary(&mem, usize::MAX, &image, RTC_SLOW_MEM_BYTES).unwrap_err();
        assert!(matches!(err, CoprocessorError::InvalidSize(_)));
        let err = load_binary(&mem, 2_044, &image, RTC_SLOW_MEM_BYTES).unwrap_err();
        assert!(matches!(err, CoprocessorError::InvalidSize(_)));
    }
}
