//! Minimal flattened-device-tree writer.
//!
//! Produces a standard DTB blob (version 17) describing the board for the
//! guest kernel. Only the node/property subset this machine needs.

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

/// Incremental DTB builder.
pub struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self {
            structure: Vec::new(),
            strings: Vec::new(),
        }
    }

    fn push_u32(&mut self, val: u32) {
        self.structure.extend_from_slice(&val.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let bytes = name.as_bytes();
        let mut offset = 0;
        while offset + bytes.len() < self.strings.len() {
            if &self.strings[offset..offset + bytes.len()] == bytes
                && self.strings[offset + bytes.len()] == 0
            {
                return offset as u32;
            }
            match self.strings[offset..].iter().position(|&b| b == 0) {
                Some(nul) => offset += nul + 1,
                None => break,
            }
        }
        let start = self.strings.len() as u32;
        self.strings.extend_from_slice(bytes);
        self.strings.push(0);
        start
    }

    pub fn begin_node(&mut self, name: &str) {
        self.push_u32(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
    }

    /// Begin a node with a unit address, `name@hexaddr`.
    pub fn begin_node_num(&mut self, name: &str, addr: u64) {
        self.begin_node(&format!("{name}@{addr:x}"));
    }

    pub fn end_node(&mut self) {
        self.push_u32(FDT_END_NODE);
    }

    pub fn prop(&mut self, name: &str, data: &[u8]) {
        let nameoff = self.string_offset(name);
        self.push_u32(FDT_PROP);
        self.push_u32(data.len() as u32);
        self.push_u32(nameoff);
        self.structure.extend_from_slice(data);
        self.pad();
    }

    pub fn prop_empty(&mut self, name: &str) {
        self.prop(name, &[]);
    }

    pub fn prop_u32(&mut self, name: &str, val: u32) {
        self.prop(name, &val.to_be_bytes());
    }

    pub fn prop_u32s(&mut self, name: &str, vals: &[u32]) {
        let mut data = Vec::with_capacity(vals.len() * 4);
        for v in vals {
            data.extend_from_slice(&v.to_be_bytes());
        }
        self.prop(name, &data);
    }

    /// A `reg`-style property of one (address, size) pair.
    pub fn prop_u64_pair(&mut self, name: &str, addr: u64, size: u64) {
        self.prop_u32s(
            name,
            &[
                (addr >> 32) as u32,
                addr as u32,
                (size >> 32) as u32,
                size as u32,
            ],
        );
    }

    pub fn prop_str(&mut self, name: &str, val: &str) {
        let mut data = Vec::with_capacity(val.len() + 1);
        data.extend_from_slice(val.as_bytes());
        data.push(0);
        self.prop(name, &data);
    }

    /// A property holding several nul-terminated strings.
    pub fn prop_str_list(&mut self, name: &str, vals: &[&str]) {
        let mut data = Vec::new();
        for v in vals {
            data.extend_from_slice(v.as_bytes());
            data.push(0);
        }
        self.prop(name, &data);
    }

    /// Seal the blob: header, empty memory-reservation block, structure,
    /// strings.
    pub fn finish(mut self) -> Vec<u8> {
        self.push_u32(FDT_END);

        const HEADER_LEN: u32 = 40;
        const MEM_RSVMAP_LEN: u32 = 16;
        let off_dt_struct = HEADER_LEN + MEM_RSVMAP_LEN;
        let off_dt_strings = off_dt_struct + self.structure.len() as u32;
        let totalsize = off_dt_strings + self.strings.len() as u32;

        let mut out = Vec::with_capacity(totalsize as usize);
        for val in [
            FDT_MAGIC,
            totalsize,
            off_dt_struct,
            off_dt_strings,
            HEADER_LEN,
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            0, // boot_cpuid_phys
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            out.extend_from_slice(&val.to_be_bytes());
        }
        // Empty memory reservation block: one terminating (0, 0) entry.
        out.extend_from_slice(&[0u8; MEM_RSVMAP_LEN as usize]);
        out.extend_from_slice(&self.structure);
        out.extend_from_slice(&self.strings);
        out
    }
}

impl Default for FdtBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_consistent() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.prop_u32("#address-cells", 2);
        b.prop_str("model", "test");
        b.end_node();
        let blob = b.finish();

        let word = |i: usize| u32::from_be_bytes(blob[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(0), FDT_MAGIC);
        assert_eq!(word(1) as usize, blob.len());
        let off_struct = word(2) as usize;
        let off_strings = word(3) as usize;
        assert_eq!(word(5), FDT_VERSION);
        assert_eq!(off_strings + word(8) as usize, blob.len());
        // Structure block starts with BEGIN_NODE of the root.
        assert_eq!(
            u32::from_be_bytes(blob[off_struct..off_struct + 4].try_into().unwrap()),
            FDT_BEGIN_NODE
        );
    }

    #[test]
    fn string_table_dedupes() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.prop_u32("reg", 1);
        b.prop_u32("reg", 2);
        b.end_node();
        let blob = b.finish();
        let size_strings = u32::from_be_bytes(blob[32..36].try_into().unwrap());
        assert_eq!(size_strings, 4, "\"reg\\0\" stored once");
    }
}
