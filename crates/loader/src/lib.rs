use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use goblin::elf::section_header::SHT_NOBITS;
use goblin::elf::Elf;
use labwired_ulp_core::image::{build_image, HEADER_SIZE, ULP_MAGIC};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Base64 text, the same encoding the command session accepts.
    Base64,
    /// Linked ULP ELF with `.text`, `.data` and `.bss`.
    Elf,
    /// Ready-made ULP binary (`ulp\0` header).
    Raw,
}

impl ImageFormat {
    pub fn detect(path: &Path, bytes: &[u8]) -> Self {
        if bytes.starts_with(ELF_MAGIC) {
            return ImageFormat::Elf;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("b64") | Some("txt") => ImageFormat::Base64,
            _ => ImageFormat::Raw,
        }
    }
}

/// Reads a ULP image from disk and returns it as a loadable binary.
pub fn load_image(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read image file: {:?}", path))?;
    let format = ImageFormat::detect(path, &bytes);
    info!("Loading {:?} image from {:?}", format, path);

    let image = match format {
        ImageFormat::Base64 => decode_base64(&bytes)?,
        ImageFormat::Elf => image_from_elf(&bytes)?,
        ImageFormat::Raw => bytes,
    };

    if image.len() < HEADER_SIZE || !image.starts_with(&ULP_MAGIC.to_ne_bytes()) {
        warn!("Image {:?} has no ULP header; it will be rejected by the loader", path);
    }
    Ok(image)
}

pub fn decode_base64(text: &[u8]) -> Result<Vec<u8>> {
    let text: Vec<u8> = text.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(&text)
        .context("Failed to decode base64 image")
}

/// Packs the `.text`, `.data` and `.bss` sections of a ULP ELF into the
/// binary format the coprocessor loader expects.
pub fn image_from_elf(bytes: &[u8]) -> Result<Vec<u8>> {
    let elf = Elf::parse(bytes).context("Failed to parse ELF binary")?;

    let mut text: &[u8] = &[];
    let mut data: &[u8] = &[];
    let mut bss_size = 0usize;

    for sh in &elf.section_headers {
        let Some(name) = elf.shdr_strtab.get_at(sh.sh_name) else {
            continue;
        };
        let size = sh.sh_size as usize;
        if name == ".bss" {
            bss_size = size;
            continue;
        }
        if name != ".text" && name != ".data" {
            continue;
        }
        if sh.sh_type == SHT_NOBITS {
            bail!("Section {} has no file contents", name);
        }
        let offset = sh.sh_offset as usize;
        let contents = offset
            .checked_add(size)
            .and_then(|end| bytes.get(offset..end))
            .ok_or_else(|| anyhow!("Section {} out of bounds in ELF file", name))?;
        debug!("Found section {}: offset={:#x}, size={} bytes", name, offset, size);
        match name {
            ".text" => text = contents,
            _ => data = contents,
        }
    }

    if text.is_empty() {
        bail!("ELF file has no .text section");
    }
    build_image(text, data, bss_size).context("Sections do not fit a ULP image")
}
