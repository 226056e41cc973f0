//! tree.rs — owned device tree: parse, edit, serialize

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::header::{FdtHeader, FDT_HEADER_SIZE, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_VERSION};
use crate::arith::{add_usize, span};
use crate::error::{BootError, BootResult};

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub props: Vec<Property>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), props: Vec::new(), children: Vec::new() }
    }

    pub fn prop(&self, name: &str) -> Option<&[u8]> {
        self.props.iter().find(|p| p.name == name).map(|p| p.value.as_slice())
    }

    pub fn prop_mut(&mut self, name: &str) -> Option<&mut Vec<u8>> {
        self.props.iter_mut().find(|p| p.name == name).map(|p| &mut p.value)
    }

    /// Replace (or create) a property.
    pub fn set_prop(&mut self, name: &str, value: Vec<u8>) {
        match self.prop_mut(name) {
            Some(v) => *v = value,
            None => self.props.push(Property { name: name.to_string(), value }),
        }
    }

    /// Append bytes to a property, creating it if absent.
    pub fn append_prop(&mut self, name: &str, value: &[u8]) {
        match self.prop_mut(name) {
            Some(v) => v.extend_from_slice(value),
            None => self.props.push(Property { name: name.to_string(), value: value.to_vec() }),
        }
    }

    pub fn remove_prop(&mut self, name: &str) -> Option<Vec<u8>> {
        let at = self.props.iter().position(|p| p.name == name)?;
        Some(self.props.remove(at).value)
    }

    pub fn prop_u32(&self, name: &str) -> Option<u32> {
        let v = self.prop(name)?;
        if v.len() != 4 {
            return None;
        }
        Some(u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    /// Property as a list of big-endian cells; `None` when the length is
    /// not a multiple of four.
    pub fn prop_cells(&self, name: &str) -> Option<Vec<u32>> {
        let v = self.prop(name)?;
        if v.len() % 4 != 0 {
            return None;
        }
        Some(v.chunks_exact(4).map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect())
    }

    /// First NUL-terminated string of a property.
    pub fn prop_str(&self, name: &str) -> Option<&str> {
        let v = self.prop(name)?;
        let end = v.iter().position(|&b| b == 0).unwrap_or(v.len());
        core::str::from_utf8(&v[..end]).ok()
    }

    pub fn phandle(&self) -> Option<u32> {
        self.prop_u32("phandle").or_else(|| self.prop_u32("linux,phandle"))
    }

    /// Child by name; `name` without `@unit` matches a child that has one.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| name_matches(&c.name, name))
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| name_matches(&c.name, name))
    }

    pub fn child_or_insert(&mut self, name: &str) -> &mut Node {
        match self.children.iter().position(|c| c.name == name) {
            Some(i) => &mut self.children[i],
            None => {
                self.children.push(Node::new(name));
                let last = self.children.len() - 1;
                &mut self.children[last]
            }
        }
    }

    pub fn find_phandle_mut(&mut self, ph: u32) -> Option<&mut Node> {
        if self.phandle() == Some(ph) {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_phandle_mut(ph))
    }

    /// Visit every node depth-first, parents before children.
    pub fn walk(&self, f: &mut dyn FnMut(&Node)) {
        f(self);
        for c in &self.children {
            c.walk(f);
        }
    }

    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Node)) {
        f(self);
        for c in &mut self.children {
            c.walk_mut(f);
        }
    }
}

fn name_matches(node_name: &str, wanted: &str) -> bool {
    if node_name == wanted {
        return true;
    }
    !wanted.contains('@') && node_name.split('@').next() == Some(wanted)
}

/// A device tree blob, decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceTree {
    pub boot_cpuid_phys: u32,
    pub reserve_map: Vec<(u64, u64)>,
    pub root: Node,
}

impl DeviceTree {
    pub fn new() -> Self {
        Self { boot_cpuid_phys: 0, reserve_map: Vec::new(), root: Node::new("") }
    }

    pub fn parse(blob: &[u8]) -> BootResult<Self> {
        let hdr = FdtHeader::read(blob)?;
        let total = hdr.totalsize as usize;
        let blob = blob
            .get(..total)
            .ok_or(BootError::MalformedSizes("fdt totalsize beyond buffer"))?;

        let reserve_map = read_reserve_map(blob, hdr.off_mem_rsvmap as usize)?;
        let strings = &blob[hdr.strings_block()?];
        let mut cur = Cursor { buf: &blob[hdr.struct_block()?], pos: 0 };

        let mut tok = cur.token()?;
        while tok == FDT_NOP {
            tok = cur.token()?;
        }
        if tok != FDT_BEGIN_NODE {
            return Err(BootError::InvalidFormat("fdt struct does not open with a node"));
        }
        let root = parse_node(&mut cur, strings, 0)?;
        loop {
            match cur.token()? {
                FDT_NOP => continue,
                FDT_END => break,
                _ => return Err(BootError::InvalidFormat("fdt trailing tokens after root")),
            }
        }

        Ok(Self { boot_cpuid_phys: hdr.boot_cpuid_phys, reserve_map, root })
    }

    /// Node at an absolute path such as `/soc/ufshc@1d84000`.
    pub fn node(&self, path: &str) -> Option<&Node> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(&self.root, |n, seg| n.child(seg))
    }

    pub fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut n = &mut self.root;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            n = n.child_mut(seg)?;
        }
        Some(n)
    }

    pub fn max_phandle(&self) -> u32 {
        let mut max = 0;
        self.root.walk(&mut |n| {
            if let Some(p) = n.phandle() {
                if p != u32::MAX {
                    max = max.max(p);
                }
            }
        });
        max
    }

    /// Encode as a version-17 blob.
    pub fn to_bytes(&self) -> BootResult<Vec<u8>> {
        let mut strings = Vec::new();
        let mut structure = Vec::new();
        emit_node(&self.root, &mut structure, &mut strings);
        push_u32(&mut structure, FDT_END);

        let rsv_len = (self.reserve_map.len() + 1) * 16;
        let off_rsv = FDT_HEADER_SIZE;
        let off_struct = add_usize(off_rsv, rsv_len, "fdt layout")?;
        let off_strings = add_usize(off_struct, structure.len(), "fdt layout")?;
        let total = add_usize(off_strings, strings.len(), "fdt layout")?;
        let total32 = u32::try_from(total).map_err(|_| BootError::IntegerOverflow("fdt totalsize"))?;

        let mut out = Vec::new();
        out.try_reserve_exact(total)
            .map_err(|_| BootError::OutOfMemory("fdt serialize"))?;
        for w in [
            FDT_MAGIC,
            total32,
            off_struct as u32,
            off_strings as u32,
            off_rsv as u32,
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            self.boot_cpuid_phys,
            strings.len() as u32,
            structure.len() as u32,
        ] {
            push_u32(&mut out, w);
        }
        for &(addr, size) in &self.reserve_map {
            out.extend_from_slice(&addr.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
        }
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&structure);
        out.extend_from_slice(&strings);
        Ok(out)
    }
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

/* ---------- decode helpers ---------- */

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn token(&mut self) -> BootResult<u32> {
        let r = span(self.pos, 4, self.buf.len(), "fdt struct truncated")?;
        let b = &self.buf[r.clone()];
        self.pos = r.end;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self) -> BootResult<&'a str> {
        let rest = self
            .buf
            .get(self.pos..)
            .ok_or(BootError::MalformedSizes("fdt struct truncated"))?;
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(BootError::InvalidFormat("unterminated fdt node name"))?;
        let s = core::str::from_utf8(&rest[..len])
            .map_err(|_| BootError::InvalidFormat("fdt node name not utf-8"))?;
        self.pos = align4(add_usize(self.pos, len + 1, "fdt node name")?)?;
        Ok(s)
    }

    fn bytes(&mut self, len: usize) -> BootResult<&'a [u8]> {
        let r = span(self.pos, len, self.buf.len(), "fdt property value")?;
        self.pos = align4(r.end)?;
        Ok(&self.buf[r])
    }
}

fn align4(v: usize) -> BootResult<usize> {
    Ok(add_usize(v, 3, "fdt alignment")? & !3)
}

fn parse_node(cur: &mut Cursor<'_>, strings: &[u8], depth: usize) -> BootResult<Node> {
    if depth > MAX_DEPTH {
        return Err(BootError::InvalidFormat("fdt nesting too deep"));
    }
    let mut node = Node::new(cur.cstr()?);
    loop {
        match cur.token()? {
            FDT_PROP => {
                let len = cur.token()? as usize;
                let nameoff = cur.token()? as usize;
                let value = cur.bytes(len)?.to_vec();
                let name = string_at(strings, nameoff)?;
                node.props.push(Property { name: name.to_string(), value });
            }
            FDT_BEGIN_NODE => node.children.push(parse_node(cur, strings, depth + 1)?),
            FDT_END_NODE => return Ok(node),
            FDT_NOP => {}
            _ => return Err(BootError::InvalidFormat("unexpected fdt token")),
        }
    }
}

fn string_at(strings: &[u8], off: usize) -> BootResult<&str> {
    let rest = strings
        .get(off..)
        .ok_or(BootError::MalformedSizes("fdt string offset out of bounds"))?;
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(BootError::InvalidFormat("unterminated fdt string"))?;
    core::str::from_utf8(&rest[..len]).map_err(|_| BootError::InvalidFormat("fdt string not utf-8"))
}

fn read_reserve_map(blob: &[u8], off: usize) -> BootResult<Vec<(u64, u64)>> {
    let mut out = Vec::new();
    let mut at = off;
    loop {
        let r = span(at, 16, blob.len(), "fdt reserve map")?;
        let e = &blob[r.clone()];
        let mut a = [0u8; 8];
        let mut s = [0u8; 8];
        a.copy_from_slice(&e[..8]);
        s.copy_from_slice(&e[8..]);
        let (addr, size) = (u64::from_be_bytes(a), u64::from_be_bytes(s));
        if addr == 0 && size == 0 {
            return Ok(out);
        }
        out.push((addr, size));
        at = r.end;
    }
}

/* ---------- encode helpers ---------- */

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn string_offset(strings: &mut Vec<u8>, name: &str) -> u32 {
    let needle = name.as_bytes();
    let mut at = 0;
    while at < strings.len() {
        let end = strings[at..].iter().position(|&b| b == 0).map_or(strings.len(), |p| at + p);
        if &strings[at..end] == needle {
            return at as u32;
        }
        at = end + 1;
    }
    let off = strings.len() as u32;
    strings.extend_from_slice(needle);
    strings.push(0);
    off
}

fn emit_node(node: &Node, out: &mut Vec<u8>, strings: &mut Vec<u8>) {
    push_u32(out, FDT_BEGIN_NODE);
    out.extend_from_slice(node.name.as_bytes());
    out.push(0);
    pad4(out);
    for p in &node.props {
        push_u32(out, FDT_PROP);
        push_u32(out, p.value.len() as u32);
        let off = string_offset(strings, &p.name);
        push_u32(out, off);
        out.extend_from_slice(&p.value);
        pad4(out);
    }
    for c in &node.children {
        emit_node(c, out, strings);
    }
    push_u32(out, FDT_END_NODE);
}

/// Big-endian cell encoding.
pub fn cells(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// NUL-terminated string property value.
pub fn str_value(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> DeviceTree {
        let mut t = DeviceTree::new();
        t.reserve_map.push((0x8000_0000, 0x1000));
        t.root.set_prop("model", str_value("test board"));
        t.root.set_prop("#address-cells", cells(&[2]));
        let soc = t.root.child_or_insert("soc");
        let ufs = soc.child_or_insert("ufshc@1d84000");
        ufs.set_prop("phandle", cells(&[7]));
        t.root.child_or_insert("chosen");
        t
    }

    #[test]
    fn encode_decode_preserves_tree() {
        let t = sample();
        let blob = t.to_bytes().unwrap();
        let back = DeviceTree::parse(&blob).unwrap();
        assert_eq!(back, t);
        // a second pass is byte-stable
        assert_eq!(back.to_bytes().unwrap(), blob);
    }

    #[test]
    fn path_lookup_elides_unit_address() {
        let t = sample();
        assert!(t.node("/soc/ufshc").is_some());
        assert!(t.node("/soc/ufshc@1d84000").is_some());
        assert!(t.node("/soc/ufshc@0").is_none());
        assert_eq!(t.node("/").unwrap().prop_str("model"), Some("test board"));
    }

    #[test]
    fn phandles() {
        let mut t = sample();
        assert_eq!(t.max_phandle(), 7);
        assert_eq!(t.root.find_phandle_mut(7).unwrap().name, "ufshc@1d84000");
        assert!(t.root.find_phandle_mut(8).is_none());
    }

    #[test]
    fn append_then_set() {
        let mut n = Node::new("memory");
        n.append_prop("reg", &cells(&[1, 2]));
        n.append_prop("reg", &cells(&[3, 4]));
        assert_eq!(n.prop_cells("reg").unwrap(), [1, 2, 3, 4]);
        n.set_prop("reg", cells(&[5]));
        assert_eq!(n.prop_u32("reg"), Some(5));
    }

    #[test]
    fn truncated_blob_rejected() {
        let blob = sample().to_bytes().unwrap();
        assert!(DeviceTree::parse(&blob[..blob.len() - 4]).is_err());
        let mut bad = blob.clone();
        // corrupt first struct token
        let off = u32::from_be_bytes([bad[8], bad[9], bad[10], bad[11]]) as usize;
        bad[off + 3] = 0x7;
        assert!(matches!(DeviceTree::parse(&bad), Err(BootError::InvalidFormat(_))));
    }
}
