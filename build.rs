//! Generates the `ErrorKind` enum used throughout `bft::error`, by
//! scanning the crate's own sources for `ErrorKind::Variant` occurrences.
//!
//! This keeps every module's error classification co-located with the code
//! that raises it, instead of hand-maintaining a giant enum in one file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;

fn main() {
    println!("cargo:rerun-if-changed=src");

    let mut variants = Vec::new();
    collect_variants(Path::new("src"), &mut variants);

    let variants: Vec<String> = variants
        .into_iter()
        .unique()
        .sorted()
        .collect();

    let mut out = String::new();
    out.push_str("/// Classifies the subsystem and condition that produced an [`Error`].\n");
    out.push_str("///\n");
    out.push_str("/// Generated by `build.rs` from every `ErrorKind::Variant` literal found\n");
    out.push_str("/// in `src/`; add a new variant simply by using it at the call site.\n");
    out.push_str("#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]\n");
    out.push_str("pub enum ErrorKind {\n");
    for variant in &variants {
        out.push_str("    ");
        out.push_str(variant);
        out.push_str(",\n");
    }
    out.push_str("}\n");

    let out_dir = env::var("OUT_DIR").unwrap();
    let dest = PathBuf::from(out_dir).join("error_kind.rs");
    fs::write(dest, out).expect("failed to write generated error_kind.rs");
}

fn collect_variants(dir: &Path, variants: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_variants(&path, variants);
        } else if path.extension().map(|ext| ext == "rs").unwrap_or(false) {
            if let Ok(contents) = fs::read_to_string(&path) {
                scan_file(&contents, variants);
            }
        }
    }
}

fn scan_file(contents: &str, variants: &mut Vec<String>) {
    const NEEDLE: &str = "ErrorKind::";
    let bytes = contents.as_bytes();
    let mut search_from = 0;
    while let Some(rel) = contents[search_from..].find(NEEDLE) {
        let start = search_from + rel + NEEDLE.len();
        let mut end = start;
        while end < bytes.len() && is_ident_byte(bytes[end]) {
            end += 1;
        }
        if end > start {
            let ident = &contents[start..end];
            // skip the `ErrorKind::Variant(..)` matcher arms inside this
            // very file, which reference the enum itself, not a variant
            if ident != "Variant" {
                variants.push(ident.to_string());
            }
        }
        search_from = end.max(start + 1);
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
