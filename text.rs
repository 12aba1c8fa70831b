//! Human readable rendering of superblocks, layouts and fields.

use std::fmt::Write;

use crate::fields::{FieldRef, FieldType, SbHandle};
use crate::layout::Layout;
use crate::opts::SB_OPTS;
use crate::super_block::{
    bitflags_to_text, compat_to_text, features_to_text, SuperBlockFlag, NSEC_PER_SEC,
};

const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Format a byte count with a binary unit suffix, e.g. `64.0 KiB`
pub(crate) fn human_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut v = bytes as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", v, UNITS[unit])
}

fn row(out: &mut String, label: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "{:<24}{}", label, value);
}

/// Describe a superblock layout descriptor
pub fn layout_to_text(layout: &Layout) -> String {
    let mut out = String::new();
    row(&mut out, "Type:", layout.layout_type);
    row(
        &mut out,
        "Superblock max size:",
        human_bytes(512 << layout.sb_max_size_bits),
    );
    row(&mut out, "Nr superblocks:", layout.offsets.len());
    let offsets: Vec<String> = layout.offsets.iter().map(u64::to_string).collect();
    row(&mut out, "Offsets:", offsets.join(", "));
    out
}

/// Describe one field, prefixed by its name and size
pub fn field_to_text(sb: &SbHandle, f: &FieldRef) -> String {
    let mut out = String::new();
    match f.field_type() {
        Some(t) => {
            let _ = write!(out, "{}", t.name());
        }
        None => {
            let _ = write!(out, "(unknown field {})", f.ty);
        }
    }
    let _ = writeln!(out, " (size {}):", human_bytes(f.bytes() as u64));
    out.push_str(&sb.field_text(f));
    out
}

/// Describe a superblock.
///
/// `fields` is a mask of field type tags (bit `1 << tag`) whose contents
/// are printed after the header and options.
pub fn sb_to_text(sb: &SbHandle, print_layout: bool, fields: u64) -> String {
    let s = sb.sb();
    let mut out = String::new();

    let nr_devices = sb.member_mask().nr();
    let label_len = s.label().iter().position(|b| *b == 0).unwrap_or(s.label().len());

    row(&mut out, "External UUID:", s.user_uuid());
    row(&mut out, "Internal UUID:", s.uuid());
    row(&mut out, "Device index:", s.dev_idx());
    row(
        &mut out,
        "Label:",
        String::from_utf8_lossy(&s.label()[..label_len]),
    );
    row(&mut out, "Version:", s.version());
    row(&mut out, "Oldest version on disk:", s.version_min());
    if s.time_base_lo() != 0 {
        row(&mut out, "Created:", s.time_base_lo() / NSEC_PER_SEC);
    } else {
        row(&mut out, "Created:", "(not set)");
    }
    row(&mut out, "Sequence number:", s.seq());
    row(&mut out, "Superblock size:", s.vstruct_bytes());
    row(&mut out, "Clean:", s.flag(&SuperBlockFlag::CLEAN));
    row(&mut out, "Devices:", nr_devices);

    let names: Vec<&str> = FieldType::ALL.iter().map(|t| t.name()).collect();
    let have = sb
        .fields()
        .filter(|f| f.ty < 64)
        .fold(0u64, |acc, f| acc | 1 << f.ty);
    row(&mut out, "Sections:", bitflags_to_text(&names, have));
    row(&mut out, "Features:", features_to_text(s.feature(0)));
    row(&mut out, "Compat features:", compat_to_text(s.compat(0)));

    let _ = writeln!(out, "\nOptions:");
    for opt in SB_OPTS.iter() {
        let _ = writeln!(
            out,
            "  {:<22}{}",
            format!("{}:", opt.name),
            s.flag(&opt.flag)
        );
    }

    if print_layout {
        let _ = writeln!(out, "\nlayout:");
        for line in layout_to_text(&Layout::from_view(&s.layout())).lines() {
            let _ = writeln!(out, "  {}", line);
        }
    }

    for f in sb.fields() {
        if f.ty < 64 && fields & (1 << f.ty) != 0 {
            out.push('\n');
            out.push_str(&field_to_text(sb, &f));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format;
    use crate::format::tests::{as_dyn, mem_devices, test_args};
    use crate::format::Args;

    #[test]
    fn byte_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(65536), "64.0 KiB");
        assert_eq!(human_bytes(3 << 29), "1.5 GiB");
    }

    #[test]
    fn layout_text() {
        let layout = Layout {
            magic: crate::super_block::BCHFS_MAGIC,
            layout_type: 0,
            sb_max_size_bits: 7,
            offsets: vec![8, 136],
        };
        let text = layout_to_text(&layout);
        assert!(text.contains("Nr superblocks:         2"));
        assert!(text.contains("Offsets:                8, 136"));
        assert!(text.contains("64.0 KiB"));
    }

    #[test]
    fn superblock_text() {
        let devs = mem_devices(1);
        let args = Args {
            label: Some("scratch".to_string()),
            no_initialize: true,
            ..test_args(1)
        };
        let sbs = format(&as_dyn(&devs), &args).unwrap();
        let sb = &sbs[0];

        let short = sb_to_text(sb, false, 0);
        assert!(short.contains("Label:                  scratch"));
        assert!(short.contains("Devices:                1"));
        assert!(short.contains("Sequence number:        0"));
        assert!(short.contains("members"));
        assert!(short.contains("  btree_node_size:"));
        assert!(!short.contains("layout:"));
        assert!(!short.contains("Device:"));

        let full = sb_to_text(sb, true, 1 << FieldType::Members as u32);
        assert!(full.contains("layout:"));
        assert!(full.contains("members (size"));
        assert!(full.contains("Device:                 0"));
    }
}
