//! `.eh_frame_hdr` walker

const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_PCREL_SDATA4: u8 = 0x1B;
const DW_EH_PE_DATAREL_SDATA4: u8 = 0x3B;

/// Location of the frame data described by the header, as offsets from the
/// module base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EhFrameInfo {
    pub header_offset: u64,
    pub header_size: u64,
    pub data_offset: u64,
    pub data_end: u64,
    pub fde_count: u32,
}

impl EhFrameInfo {
    pub fn data_size(&self) -> u64 {
        self.data_end - self.data_offset
    }
}

/// Mapped bytes starting at module offset `base`.
struct View<'a> {
    bytes: &'a [u8],
    base: u64,
}

impl View<'_> {
    fn get(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset.checked_sub(self.base)?).ok()?;
        self.bytes.get(start..start.checked_add(len)?)
    }

    fn read_u32(&self, offset: u64) -> Option<u32> {
        Some(u32::from_le_bytes(self.get(offset, 4)?.try_into().ok()?))
    }

    fn read_u64(&self, offset: u64) -> Option<u64> {
        Some(u64::from_le_bytes(self.get(offset, 8)?.try_into().ok()?))
    }
}

/// Parse the header at module offset `header_offset` and find the end of the
/// record list it points at. `image` holds the mapped bytes from module
/// offset `image_base` on. Returns `None` for any encoding other than the
/// ones Orbis toolchains emit.
pub fn parse(
    image: &[u8],
    image_base: u64,
    header_offset: u64,
    header_size: u64,
) -> Option<EhFrameInfo> {
    if header_offset == 0 || header_size < 4 {
        return None;
    }

    let image = View {
        bytes: image,
        base: image_base,
    };
    let header = image.get(header_offset, 4)?;
    let (version, data_encoding, fde_count_encoding, table_encoding) =
        (header[0], header[1], header[2], header[3]);
    if version != 1 {
        return None;
    }

    let mut current = header_offset + 4;
    let data_offset = match data_encoding {
        DW_EH_PE_UDATA4 => {
            let offset = image.read_u32(current)? as u64;
            current += 4;
            offset
        }
        DW_EH_PE_PCREL_SDATA4 => {
            let delta = image.read_u32(current)? as i32 as i64;
            current += 4;
            current.checked_add_signed(delta)?
        }
        _ => return None,
    };

    let mut data_end = data_offset;
    loop {
        let size = image.read_u32(data_end)?;
        let record = match size {
            0 => {
                data_end += 4;
                break;
            }
            u32::MAX => 12 + image.read_u64(data_end + 4)?,
            n => 4 + n as u64,
        };
        data_end = data_end.checked_add(record)?;
    }

    if fde_count_encoding != DW_EH_PE_UDATA4 {
        return None;
    }
    let fde_count = image.read_u32(current)?;

    if table_encoding != DW_EH_PE_DATAREL_SDATA4 {
        return None;
    }

    Some(EhFrameInfo {
        header_offset,
        header_size,
        data_offset,
        data_end,
        fde_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_header(data_encoding: u8, pointer: u32) -> Vec<u8> {
        let mut image = vec![0u8; 0x200];
        image[0x100..0x104].copy_from_slice(&[1, data_encoding, 0x03, 0x3B]);
        image[0x104..0x108].copy_from_slice(&pointer.to_le_bytes());
        image[0x108..0x10C].copy_from_slice(&2u32.to_le_bytes());
        // Two records of 0x14 and 0x1C bytes, then the terminator.
        image[0x20..0x24].copy_from_slice(&0x10u32.to_le_bytes());
        image[0x34..0x38].copy_from_slice(&0x18u32.to_le_bytes());
        image
    }

    #[test]
    fn test_absolute_data_pointer() {
        let image = image_with_header(0x03, 0x20);
        let info = parse(&image, 0, 0x100, 0x20).unwrap();
        assert_eq!(info.data_offset, 0x20);
        assert_eq!(info.data_end, 0x20 + 0x14 + 0x1C + 4);
        assert_eq!(info.fde_count, 2);
    }

    #[test]
    fn test_relative_data_pointer() {
        // Relative to the end of the pointer field (0x108).
        let delta = (0x20i32 - 0x108) as u32;
        let image = image_with_header(0x1B, delta);
        let info = parse(&image, 0, 0x100, 0x20).unwrap();
        assert_eq!(info.data_offset, 0x20);
        assert_eq!(info.data_size(), 0x34);
    }

    #[test]
    fn test_unsupported_encodings() {
        let image = image_with_header(0x04, 0x20);
        assert!(parse(&image, 0, 0x100, 0x20).is_none());

        let mut image = image_with_header(0x03, 0x20);
        image[0x103] = 0x1B;
        assert!(parse(&image, 0, 0x100, 0x20).is_none());

        let mut image = image_with_header(0x03, 0x20);
        image[0x100] = 2;
        assert!(parse(&image, 0, 0x100, 0x20).is_none());

        assert!(parse(&image, 0, 0, 0).is_none());
    }

    #[test]
    fn test_image_with_offset_base() {
        // Same layout, but the mapped view starts at module offset 0x10000.
        let image = image_with_header(0x03, 0x10020);
        let info = parse(&image, 0x10000, 0x10100, 0x20).unwrap();
        assert_eq!(info.header_offset, 0x10100);
        assert_eq!(info.data_offset, 0x10020);
        assert_eq!(info.data_end, 0x10020 + 0x34);

        // Header before the view.
        assert!(parse(&image, 0x10000, 0x100, 0x20).is_none());
    }
}
