//! overlay.rs — apply a compiled overlay (`dtc -@`) onto a base tree
//!
//! Steps, in order:
//!   1. shift every overlay phandle past the base maximum
//!   2. `__local_fixups__`: patch internal phandle references by the same delta
//!   3. `__fixups__`: resolve external labels through base `__symbols__`
//!   4. merge each `fragment/__overlay__` into its `target` / `target-path`
//!   5. carry overlay `__symbols__` into the base, re-rooted at the targets
//!
//! The base is never modified in place; a failed application leaves the
//! caller's tree untouched.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::tree::{str_value, DeviceTree, Node};
use crate::arith::span;
use crate::error::{BootError, BootResult};
use crate::logger::log_debug;

const FIXUPS: &str = "__fixups__";
const LOCAL_FIXUPS: &str = "__local_fixups__";
const SYMBOLS: &str = "__symbols__";
const OVERLAY: &str = "__overlay__";

pub fn apply(base: &DeviceTree, overlay: &DeviceTree) -> BootResult<DeviceTree> {
    let mut ov = overlay.clone();
    let mut out = base.clone();

    let delta = base.max_phandle();
    shift_phandles(&mut ov.root, delta)?;
    if let Some(local) = overlay.root.child(LOCAL_FIXUPS) {
        apply_local_fixups(&mut ov.root, local, delta)?;
    }
    if let Some(fixups) = overlay.root.child(FIXUPS) {
        resolve_fixups(&mut ov, &out, fixups)?;
    }

    let mut symbol_roots: Vec<(String, String)> = Vec::new();
    for frag in ov.root.children.iter().filter(|c| !is_meta(&c.name)) {
        let Some(body) = frag.child(OVERLAY) else {
            continue;
        };
        let target_path = target_path(frag, &out)?;
        let target = out
            .node_mut(&target_path)
            .ok_or(BootError::InvalidFormat("overlay target path not in base"))?;
        merge(target, body);
        log_debug("fdt", &format!("overlay fragment {} -> {}", frag.name, target_path));
        symbol_roots.push((format!("/{}/{}", frag.name, OVERLAY), target_path));
    }

    if let Some(syms) = ov.root.child(SYMBOLS) {
        let base_syms = out.root.child_or_insert(SYMBOLS);
        for p in &syms.props {
            let path = str_of(&p.value)?;
            let rebased = symbol_roots.iter().find_map(|(from, to)| {
                path.strip_prefix(from.as_str())
                    .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                    .map(|rest| {
                        if to == "/" && !rest.is_empty() {
                            String::from(rest)
                        } else {
                            format!("{}{}", to, rest)
                        }
                    })
            });
            if let Some(r) = rebased {
                base_syms.set_prop(&p.name, str_value(&r));
            }
        }
    }
    Ok(out)
}

fn is_meta(name: &str) -> bool {
    name == FIXUPS || name == LOCAL_FIXUPS || name == SYMBOLS
}

fn str_of(v: &[u8]) -> BootResult<&str> {
    let end = v.iter().position(|&b| b == 0).unwrap_or(v.len());
    core::str::from_utf8(&v[..end]).map_err(|_| BootError::InvalidFormat("overlay string not utf-8"))
}

fn shift_phandles(root: &mut Node, delta: u32) -> BootResult<()> {
    let mut result = Ok(());
    root.walk_mut(&mut |n| {
        for name in ["phandle", "linux,phandle"] {
            if let Some(v) = n.prop_mut(name) {
                if v.len() != 4 {
                    result = Err(BootError::InvalidFormat("malformed phandle"));
                    continue;
                }
                let ph = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
                match ph.checked_add(delta) {
                    Some(p) => v.copy_from_slice(&p.to_be_bytes()),
                    None => result = Err(BootError::IntegerOverflow("phandle shift")),
                }
            }
        }
    });
    result
}

/// Walk the fixup tree alongside the overlay tree.
fn apply_local_fixups(node: &mut Node, fix: &Node, delta: u32) -> BootResult<()> {
    for p in &fix.props {
        let value = node
            .prop_mut(&p.name)
            .ok_or(BootError::InvalidFormat("local fixup names a missing property"))?;
        for off in p.value.chunks_exact(4) {
            let off = u32::from_be_bytes([off[0], off[1], off[2], off[3]]) as usize;
            let r = span(off, 4, value.len(), "local fixup offset")?;
            let cur = u32::from_be_bytes([value[r.start], value[r.start + 1], value[r.start + 2], value[r.start + 3]]);
            let ph = cur.checked_add(delta).ok_or(BootError::IntegerOverflow("local fixup"))?;
            value[r].copy_from_slice(&ph.to_be_bytes());
        }
    }
    for fc in &fix.children {
        let child = node
            .children
            .iter_mut()
            .find(|c| c.name == fc.name)
            .ok_or(BootError::InvalidFormat("local fixup names a missing node"))?;
        apply_local_fixups(child, fc, delta)?;
    }
    Ok(())
}

fn resolve_fixups(ov: &mut DeviceTree, base: &DeviceTree, fixups: &Node) -> BootResult<()> {
    let symbols = base
        .root
        .child(SYMBOLS)
        .ok_or(BootError::InvalidFormat("overlay needs base __symbols__"))?;

    for label in &fixups.props {
        let sym_path = symbols
            .prop(&label.name)
            .ok_or(BootError::InvalidFormat("overlay label not in base symbols"))
            .and_then(str_of)?;
        let ph = base
            .node(sym_path)
            .and_then(Node::phandle)
            .ok_or(BootError::InvalidFormat("overlay label target has no phandle"))?;

        // value: one or more "path:property:offset\0"
        for entry in label.value.split(|&b| b == 0).filter(|e| !e.is_empty()) {
            let entry = core::str::from_utf8(entry)
                .map_err(|_| BootError::InvalidFormat("fixup entry not utf-8"))?;
            let mut parts = entry.rsplitn(3, ':');
            let (Some(off), Some(prop), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(BootError::InvalidFormat("malformed fixup entry"));
            };
            let off: usize = off
                .parse()
                .map_err(|_| BootError::InvalidFormat("malformed fixup offset"))?;
            let value = ov
                .node_mut(path)
                .and_then(|n| n.prop_mut(prop))
                .ok_or(BootError::InvalidFormat("fixup names a missing property"))?;
            let r = span(off, 4, value.len(), "fixup offset")?;
            value[r].copy_from_slice(&ph.to_be_bytes());
        }
    }
    Ok(())
}

fn target_path(frag: &Node, base: &DeviceTree) -> BootResult<String> {
    if let Some(ph) = frag.prop_u32("target") {
        return path_of_phandle(&base.root, ph, "")
            .ok_or(BootError::InvalidFormat("overlay target phandle not in base"));
    }
    let p = frag
        .prop("target-path")
        .ok_or(BootError::InvalidFormat("overlay fragment without target"))?;
    Ok(String::from(str_of(p)?))
}

fn path_of_phandle(node: &Node, ph: u32, parent: &str) -> Option<String> {
    let here = if parent.is_empty() && node.name.is_empty() {
        String::from("/")
    } else if parent == "/" {
        format!("/{}", node.name)
    } else {
        format!("{}/{}", parent, node.name)
    };
    if node.phandle() == Some(ph) {
        return Some(here);
    }
    node.children.iter().find_map(|c| path_of_phandle(c, ph, &here))
}

fn merge(target: &mut Node, src: &Node) {
    for p in &src.props {
        target.set_prop(&p.name, p.value.clone());
    }
    for c in &src.children {
        merge(target.child_or_insert(&c.name), c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::tree::cells;
    use pretty_assertions::assert_eq;

    fn base() -> DeviceTree {
        let mut t = DeviceTree::new();
        t.root.set_prop("model", str_value("soc"));
        let soc = t.root.child_or_insert("soc");
        let i2c = soc.child_or_insert("i2c@100");
        i2c.set_prop("phandle", cells(&[3]));
        i2c.set_prop("status", str_value("disabled"));
        t.root
            .child_or_insert("__symbols__")
            .set_prop("i2c0", str_value("/soc/i2c@100"));
        t
    }

    /// Overlay enabling i2c0 by label and adding a panel that points at a
    /// node inside the overlay itself.
    fn overlay() -> DeviceTree {
        let mut o = DeviceTree::new();
        {
            let f0 = o.root.child_or_insert("fragment@0");
            f0.set_prop("target", cells(&[0xffff_ffff]));
            let body = f0.child_or_insert("__overlay__");
            body.set_prop("status", str_value("okay"));
            let touch = body.child_or_insert("touch@20");
            touch.set_prop("phandle", cells(&[1]));
        }
        {
            let f1 = o.root.child_or_insert("fragment@1");
            f1.set_prop("target-path", str_value("/"));
            let body = f1.child_or_insert("__overlay__");
            body.set_prop("model", str_value("board"));
            let panel = body.child_or_insert("panel");
            panel.set_prop("touch", cells(&[1]));
        }
        o.root
            .child_or_insert("__fixups__")
            .set_prop("i2c0", str_value("/fragment@0:target:0"));
        o.root
            .child_or_insert("__local_fixups__")
            .child_or_insert("fragment@1")
            .child_or_insert("__overlay__")
            .child_or_insert("panel")
            .set_prop("touch", cells(&[0]));
        o.root
            .child_or_insert("__symbols__")
            .set_prop("touch", str_value("/fragment@0/__overlay__/touch@20"));
        o
    }

    #[test]
    fn applies_fragments_and_fixups() {
        let out = apply(&base(), &overlay()).unwrap();

        let i2c = out.node("/soc/i2c@100").unwrap();
        assert_eq!(i2c.prop_str("status"), Some("okay"));
        // overlay phandle 1 shifted past base max 3
        assert_eq!(out.node("/soc/i2c/touch@20").unwrap().phandle(), Some(4));
        assert_eq!(out.node("/panel").unwrap().prop_u32("touch"), Some(4));
        assert_eq!(out.root.prop_str("model"), Some("board"));
        assert_eq!(
            out.node("/__symbols__").unwrap().prop_str("touch"),
            Some("/soc/i2c@100/touch@20")
        );
    }

    #[test]
    fn base_untouched_on_failure() {
        let b = base();
        let mut o = overlay();
        o.root
            .child_mut("__fixups__")
            .unwrap()
            .set_prop("missing", str_value("/fragment@0:target:0"));
        assert!(apply(&b, &o).is_err());
        assert_eq!(b, base());
    }

    #[test]
    fn fixup_offset_bounds_checked() {
        let mut o = overlay();
        o.root
            .child_mut("__fixups__")
            .unwrap()
            .set_prop("i2c0", str_value("/fragment@0:target:4"));
        assert!(apply(&base(), &o).is_err());
    }
}
