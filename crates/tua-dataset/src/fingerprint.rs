// SPDX-License-Identifier: MIT OR Apache-2.0
//! Attachment content fingerprinting.
//!
//! The digest itself lives on [`tua_core::AttachmentFingerprint`] since
//! `tua-approval` needs to compute and compare fingerprints independently
//! of this crate's parsing pipeline; this module only adds the batch
//! helper the Orchestrator actually calls.

use tua_core::AttachmentFingerprint;

/// Fingerprint a set of `(filename, bytes)` pairs, in the order given.
///
/// Callers are expected to have already sorted attachments by filename
/// (see [`tua_core::sort_attachments_by_filename`]) so the returned list is
/// in the deterministic order `spec.md` §5 requires.
pub fn fingerprint_all<'a>(attachments: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Vec<AttachmentFingerprint> {
    attachments
        .into_iter()
        .map(|(filename, bytes)| AttachmentFingerprint::compute(filename, bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_preserve_input_order() {
        let attachments: Vec<(&str, &[u8])> = vec![("a.csv", b"one"), ("b.csv", b"two")];
        let fingerprints = fingerprint_all(attachments);
        assert_eq!(fingerprints.len(), 2);
        assert_eq!(fingerprints[0].filename, "a.csv");
        assert_eq!(fingerprints[1].filename, "b.csv");
    }
}
