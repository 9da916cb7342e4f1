//! UID utilities and the transfer syntaxes
//! known to the negotiation logic.

use std::borrow::Cow;

/// The DICOM application context name
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Verification SOP class
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// Implicit VR Little Endian
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
/// Explicit VR Little Endian
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
/// Deflated Explicit VR Little Endian
pub const DEFLATED_EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1.99";
/// Explicit VR Big Endian (retired)
pub const EXPLICIT_VR_BE: &str = "1.2.840.10008.1.2.2";
/// Bzip2-compressed Explicit VR Little Endian (private)
pub const BZIP2_EXPLICIT_VR_LE: &str = "1.3.6.1.4.1.5962.300.1";

/// Lossless compressed transfer syntaxes
pub const LOSSLESS_TRANSFER_SYNTAXES: &[&str] = &[
    // JPEG Lossless, First-Order Prediction
    "1.2.840.10008.1.2.4.70",
    // JPEG-LS Lossless
    "1.2.840.10008.1.2.4.80",
    // JPEG 2000 Lossless
    "1.2.840.10008.1.2.4.90",
    // RLE Lossless
    "1.2.840.10008.1.2.5",
];

/// Lossy compressed transfer syntaxes
pub const LOSSY_TRANSFER_SYNTAXES: &[&str] = &[
    // JPEG Baseline
    "1.2.840.10008.1.2.4.50",
    // JPEG Extended
    "1.2.840.10008.1.2.4.51",
    // JPEG-LS Near-Lossless
    "1.2.840.10008.1.2.4.81",
    // JPEG 2000
    "1.2.840.10008.1.2.4.91",
];

pub(crate) fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with('\0') {
        Cow::Owned(uid.trim_end_matches(|c| c == '\0').to_string())
    } else {
        uid
    }
}

/// Whether the transfer syntax encodes data sets
/// in explicit VR little endian,
/// possibly compressed or encapsulated.
pub fn is_explicit_vr_little_endian(uid: &str) -> bool {
    let uid = uid.trim_end_matches('\0');
    uid == EXPLICIT_VR_LE
        || uid == DEFLATED_EXPLICIT_VR_LE
        || uid == BZIP2_EXPLICIT_VR_LE
        || uid.starts_with("1.2.840.10008.1.2.4.")
        || uid == "1.2.840.10008.1.2.5"
}

/// Whether the transfer syntax encodes data sets in explicit VR,
/// regardless of byte order.
pub fn is_explicit_vr(uid: &str) -> bool {
    is_explicit_vr_little_endian(uid) || uid.trim_end_matches('\0') == EXPLICIT_VR_BE
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    #[test]
    fn test_trim_uid() {
        let uid = trim_uid(Cow::from("1.2.3.4"));
        assert_eq!(uid, "1.2.3.4");
        let uid = trim_uid(Cow::from("1.2.3.4\0"));
        assert_eq!(uid, "1.2.3.4");
        let uid = trim_uid(Cow::from("1.2.3.45\0"));
        assert_eq!(uid, "1.2.3.45");
    }

    #[test]
    fn classifies_transfer_syntaxes() {
        assert!(is_explicit_vr_little_endian(EXPLICIT_VR_LE));
        assert!(is_explicit_vr_little_endian(DEFLATED_EXPLICIT_VR_LE));
        assert!(is_explicit_vr_little_endian("1.2.840.10008.1.2.4.50"));
        assert!(!is_explicit_vr_little_endian(IMPLICIT_VR_LE));
        assert!(!is_explicit_vr_little_endian(EXPLICIT_VR_BE));
        assert!(is_explicit_vr(EXPLICIT_VR_BE));
        assert!(!is_explicit_vr(IMPLICIT_VR_LE));
    }
}
