//! Builders for crafted inputs shared by the unit tests.


pub use portable::PortablePdbBuilder;

/// RVA at which [`ImageBuilder::code`] places its method body
pub const TEST_CODE_RVA: u32 = 0x2100;

const SECTION_RVA: u32 = 0x2000;
const SECTION_RAW: u32 = 0x200;
const DEBUG_DIR_OFFSET: usize = 0x50;
const CODEVIEW_OFFSET: usize = 0x70;
const CODE_OFFSET: usize = 0x100;

/// Produces a minimal PE32 .NET image with one `.text` section.
///
/// The section holds a CLR header at its start, an optional CodeView debug directory and an
/// optional method body at [`TEST_CODE_RVA`].
#[derive(Default)]
pub struct ImageBuilder {
    codeview: Option<(uguid::Guid, u32, String)>,
    code: Vec<u8>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codeview(mut self, guid: uguid::Guid, age: u32, path: &str) -> Self {
        self.codeview = Some((guid, age, path.to_string()));
        self
    }

    pub fn code(mut self, code: &[u8]) -> Self {
        self.code = code.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let raw_size = (CODE_OFFSET + self.code.len()).next_multiple_of(0x200) as u32;

        let mut image = vec![0u8; SECTION_RAW as usize];
        // DOS header
        image[0] = b'M';
        image[1] = b'Z';
        put_u32(&mut image, 0x3C, 0x80);

        // PE signature and COFF header
        image[0x80..0x84].copy_from_slice(b"PE\0\0");
        put_u16(&mut image, 0x84, 0x014C);
        put_u16(&mut image, 0x86, 1);
        put_u16(&mut image, 0x94, 0xE0);
        put_u16(&mut image, 0x96, 0x2102);

        // Optional header, standard fields
        let opt = 0x98;
        put_u16(&mut image, opt, 0x010B);
        image[opt + 2] = 8;
        put_u32(&mut image, opt + 4, raw_size);
        put_u32(&mut image, opt + 20, SECTION_RVA);

        // Windows fields
        put_u32(&mut image, opt + 28, 0x0040_0000);
        put_u32(&mut image, opt + 32, 0x1000);
        put_u32(&mut image, opt + 36, 0x200);
        put_u16(&mut image, opt + 40, 4);
        put_u16(&mut image, opt + 48, 4);
        put_u32(&mut image, opt + 56, SECTION_RVA + raw_size.next_multiple_of(0x1000));
        put_u32(&mut image, opt + 60, SECTION_RAW);
        put_u16(&mut image, opt + 68, 3);
        put_u16(&mut image, opt + 70, 0x8540);
        put_u32(&mut image, opt + 72, 0x10_0000);
        put_u32(&mut image, opt + 76, 0x1000);
        put_u32(&mut image, opt + 80, 0x10_0000);
        put_u32(&mut image, opt + 84, 0x1000);
        put_u32(&mut image, opt + 92, 16);

        // Data directories: debug (6) and CLR runtime header (14)
        let dirs = opt + 96;
        if self.codeview.is_some() {
            put_u32(&mut image, dirs + 6 * 8, SECTION_RVA + DEBUG_DIR_OFFSET as u32);
            put_u32(&mut image, dirs + 6 * 8 + 4, 28);
        }
        put_u32(&mut image, dirs + 14 * 8, SECTION_RVA);
        put_u32(&mut image, dirs + 14 * 8 + 4, 72);

        // Section table
        let section = 0x178;
        image[section..section + 5].copy_from_slice(b".text");
        put_u32(&mut image, section + 8, raw_size);
        put_u32(&mut image, section + 12, SECTION_RVA);
        put_u32(&mut image, section + 16, raw_size);
        put_u32(&mut image, section + 20, SECTION_RAW);
        put_u32(&mut image, section + 36, 0x6000_0020);

        let mut text = vec![0u8; raw_size as usize];
        put_u32(&mut text, 0, 72);
        put_u16(&mut text, 4, 2);
        put_u16(&mut text, 6, 5);

        if let Some((guid, age, path)) = &self.codeview {
            let mut record = b"RSDS".to_vec();
            record.extend_from_slice(&guid.to_bytes());
            record.extend_from_slice(&age.to_le_bytes());
            record.extend_from_slice(path.as_bytes());
            record.push(0);

            let entry = DEBUG_DIR_OFFSET;
            put_u32(&mut text, entry + 12, 2);
            put_u32(&mut text, entry + 16, record.len() as u32);
            put_u32(&mut text, entry + 20, SECTION_RVA + CODEVIEW_OFFSET as u32);
            put_u32(&mut text, entry + 24, SECTION_RAW + CODEVIEW_OFFSET as u32);
            text[CODEVIEW_OFFSET..CODEVIEW_OFFSET + record.len()].copy_from_slice(&record);
        }

        text[CODE_OFFSET..CODE_OFFSET + self.code.len()].copy_from_slice(&self.code);

        image.extend_from_slice(&text);
        image
    }
}

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
