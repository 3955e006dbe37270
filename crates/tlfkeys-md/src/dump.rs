//! Human-readable dumps of metadata revisions, for debugging.

use std::fmt::Write as _;

use serde_json::json;
use tlfkeys_core::{Codec, TlfKeysResult};

use crate::bundle::{make_reader_key_bundle_id, make_writer_key_bundle_id};
use crate::extra::ExtraMetadata;
use crate::metadata::{MetadataFormat, RootMetadata};

/// Encoded size, format version, then the revision as pretty JSON.
///
/// The serialized private metadata is blanked; it is encrypted and only
/// noise in a dump.
pub fn dump_root_metadata<C: Codec>(codec: &C, md: &RootMetadata) -> TlfKeysResult<String> {
    let size = md.encode(codec)?.len();
    let mut scrubbed = md.clone();
    scrubbed.set_serialized_private_metadata(Vec::new());

    let mut out = String::new();
    let _ = writeln!(out, "MD size: {size} bytes");
    let _ = writeln!(out, "MD version: {}", md.version());
    let _ = writeln!(out);
    out.push_str(&serde_json::to_string_pretty(&scrubbed)?);
    out.push('\n');
    Ok(out)
}

/// Both bundles with their IDs and pending-upload flags.
pub fn dump_extra_metadata<C: Codec>(codec: &C, extra: &ExtraMetadata) -> TlfKeysResult<String> {
    let wkb = extra.writer_bundle();
    let rkb = extra.reader_bundle();
    // An empty writer bundle has no ID; show that rather than failing.
    let wkb_id = make_writer_key_bundle_id(codec, wkb)
        .map(|id| id.to_string())
        .unwrap_or_else(|e| format!("<{e}>"));
    let rkb_id = make_reader_key_bundle_id(codec, rkb)?;

    let value = json!({
        "writerBundle": {
            "id": wkb_id,
            "new": extra.is_writer_bundle_new(),
            "bundle": wkb,
        },
        "readerBundle": {
            "id": rkb_id,
            "new": extra.is_reader_bundle_new(),
            "bundle": rkb,
        },
    });
    let mut out = serde_json::to_string_pretty(&value)?;
    out.push('\n');
    Ok(out)
}
