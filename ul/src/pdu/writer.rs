//! PDU writer module
//!
//! Every PDU is fully serialized into memory before anything
//! reaches the output, so that length fields can be filled in
//! once the size of what they cover is known.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "Invalid {} `{}`: must be at most 16 ASCII characters",
        field,
        ae_title
    ))]
    InvalidAeTitle {
        field: &'static str,
        ae_title: String,
        backtrace: Backtrace,
    },

    #[snafu(display("{} of {} bytes does not fit its length field", name, length))]
    ChunkTooLong {
        /// the name of the PDU structure
        name: &'static str,
        length: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not encode field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("Could not write PDU to the output"))]
    WritePdu {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Write a chunk preceded by its 4-byte length.
///
/// The length bytes are reserved up front
/// and patched in after `func` has written the chunk.
fn write_chunk_u32<F>(buffer: &mut Vec<u8>, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let start = buffer.len();
    buffer.extend_from_slice(&[0; 4]);
    func(buffer)?;

    let length = buffer.len() - start - 4;
    let length_field =
        u32::try_from(length).map_err(|_| ChunkTooLongSnafu { name, length }.build())?;
    buffer[start..start + 4].copy_from_slice(&length_field.to_be_bytes());
    Ok(())
}

/// Write a chunk preceded by its 2-byte length.
///
/// The length bytes are reserved up front
/// and patched in after `func` has written the chunk.
fn write_chunk_u16<F>(buffer: &mut Vec<u8>, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let start = buffer.len();
    buffer.extend_from_slice(&[0; 2]);
    func(buffer)?;

    let length = buffer.len() - start - 2;
    let length_field =
        u16::try_from(length).map_err(|_| ChunkTooLongSnafu { name, length }.build())?;
    buffer[start..start + 2].copy_from_slice(&length_field.to_be_bytes());
    Ok(())
}

/// Write an item header (type and reserved byte)
/// followed by the item content and its 2-byte length.
fn write_item<F>(buffer: &mut Vec<u8>, item_type: u8, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    buffer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    buffer
        .write_u8(0x00)
        .context(WriteFieldSnafu { field: "Reserved" })?;
    write_chunk_u16(buffer, name, func)
}

/// Write a text field with a 2-byte length prefix.
fn write_text_u16(
    buffer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    text: &str,
    field: &'static str,
) -> Result<()> {
    let bytes = codec.encode(text).context(EncodeFieldSnafu { field })?;
    write_chunk_u16(buffer, field, |buffer| {
        buffer.extend_from_slice(&bytes);
        Ok(())
    })
}

fn write_ae_title(
    buffer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    ae_title: &str,
    field: &'static str,
) -> Result<()> {
    ensure!(
        ae_title.is_ascii() && ae_title.len() <= 16,
        InvalidAeTitleSnafu { field, ae_title }
    );
    let mut bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    bytes.resize(16, b' ');
    buffer.extend_from_slice(&bytes);
    Ok(())
}

/// Write the given PDU to a stream.
///
/// The PDU is encoded in full first,
/// so nothing is written if encoding fails.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: ?Sized + Write,
{
    let bytes = encode_pdu(pdu)?;
    writer.write_all(&bytes).context(WritePduSnafu)
}

/// Encode the given PDU into a new byte vector.
pub fn encode_pdu(pdu: &Pdu) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    encode_pdu_into(&mut buffer, pdu)?;
    Ok(buffer)
}

fn encode_pdu_into(buffer: &mut Vec<u8>, pdu: &Pdu) -> Result<()> {
    let codec = DefaultCharacterSetCodec;

    // 1 - PDU-type, 2 - Reserved
    buffer
        .write_u8(pdu.pdu_type())
        .context(WriteFieldSnafu { field: "PDU-type" })?;
    buffer
        .write_u8(0x00)
        .context(WriteFieldSnafu { field: "Reserved" })?;

    // 3-6 - PDU-length
    write_chunk_u32(buffer, "PDU", |buffer| match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            write_association_header(
                buffer,
                &codec,
                *protocol_version,
                called_ae_title,
                calling_ae_title,
            )?;
            write_application_context_name(buffer, &codec, application_context_name)?;
            for presentation_context in presentation_contexts {
                write_presentation_context_proposed(buffer, &codec, presentation_context)?;
            }
            write_user_variables(buffer, &codec, user_variables)
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            write_association_header(
                buffer,
                &codec,
                *protocol_version,
                called_ae_title,
                calling_ae_title,
            )?;
            write_application_context_name(buffer, &codec, application_context_name)?;
            for presentation_context in presentation_contexts {
                write_presentation_context_result(buffer, &codec, presentation_context)?;
            }
            write_user_variables(buffer, &codec, user_variables)
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // 7 - Reserved, 8 - Result, 9 - Source, 10 - Reason/Diag.
            let (source, reason) = source.to_codes();
            buffer.extend_from_slice(&[0x00, *result as u8, source, reason]);
            Ok(())
        }
        Pdu::PData { data } => {
            for pdata_value in data {
                // Presentation Data Value Item Structure
                write_chunk_u32(buffer, "Presentation-data-value item", |buffer| {
                    // 5 - Presentation-context-ID
                    buffer
                        .write_u8(pdata_value.presentation_context_id)
                        .context(WriteFieldSnafu {
                            field: "Presentation-context-ID",
                        })?;
                    // 6 - Message Control Header
                    buffer
                        .write_u8(pdata_value.control_header())
                        .context(WriteFieldSnafu {
                            field: "Message Control Header",
                        })?;
                    buffer.extend_from_slice(&pdata_value.data);
                    Ok(())
                })?;
            }
            Ok(())
        }
        Pdu::ReleaseRQ | Pdu::ReleaseRP => {
            // 7-10 - Reserved
            buffer.extend_from_slice(&[0x00; 4]);
            Ok(())
        }
        Pdu::AbortRQ { source } => {
            // 7-8 - Reserved, 9 - Source, 10 - Reason/Diag
            let (source, reason) = source.to_codes();
            buffer.extend_from_slice(&[0x00, 0x00, source, reason]);
            Ok(())
        }
        Pdu::Unknown { data, .. } => {
            buffer.extend_from_slice(data);
            Ok(())
        }
    })
}

fn write_association_header(
    buffer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    // 7-8 - Protocol-version
    buffer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;

    // 9-10 - Reserved
    buffer
        .write_u16::<BigEndian>(0x00)
        .context(WriteFieldSnafu { field: "Reserved" })?;

    // 11-26 - Called-AE-title
    write_ae_title(buffer, codec, called_ae_title, "Called-AE-title")?;

    // 27-42 - Calling-AE-title
    write_ae_title(buffer, codec, calling_ae_title, "Calling-AE-title")?;

    // 43-74 - Reserved
    buffer.extend_from_slice(&[0x00; 32]);
    Ok(())
}

fn write_application_context_name(
    buffer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    application_context_name: &str,
) -> Result<()> {
    // Application Context Item Structure
    let bytes = codec
        .encode(application_context_name)
        .context(EncodeFieldSnafu {
            field: "Application-context-name",
        })?;
    write_item(buffer, 0x10, "Application Context Item", |buffer| {
        buffer.extend_from_slice(&bytes);
        Ok(())
    })
}

fn write_uid_sub_item(
    buffer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    item_type: u8,
    uid: &str,
    field: &'static str,
) -> Result<()> {
    let bytes = codec.encode(uid).context(EncodeFieldSnafu { field })?;
    write_item(buffer, item_type, field, |buffer| {
        buffer.extend_from_slice(&bytes);
        Ok(())
    })
}

fn write_presentation_context_proposed(
    buffer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    presentation_context: &PresentationContextProposed,
) -> Result<()> {
    // Presentation Context Item Structure (proposed)
    write_item(buffer, 0x20, "Presentation Context Item", |buffer| {
        // 5 - Presentation-context-ID, 6-8 - Reserved
        buffer.extend_from_slice(&[presentation_context.id, 0x00, 0x00, 0x00]);

        // Abstract Syntax Sub-Item Structure
        write_uid_sub_item(
            buffer,
            codec,
            0x30,
            &presentation_context.abstract_syntax,
            "Abstract-syntax-name",
        )?;

        // Transfer Syntax Sub-Item Structure, one per proposal
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_uid_sub_item(buffer, codec, 0x40, transfer_syntax, "Transfer-syntax-name")?;
        }
        Ok(())
    })
}

fn write_presentation_context_result(
    buffer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    presentation_context: &PresentationContextResult,
) -> Result<()> {
    // Presentation Context Item Structure (result)
    write_item(buffer, 0x21, "Presentation Context Item", |buffer| {
        // 5 - Presentation-context-ID, 6 - Reserved,
        // 7 - Result/Reason, 8 - Reserved
        buffer.extend_from_slice(&[
            presentation_context.id,
            0x00,
            presentation_context.reason as u8,
            0x00,
        ]);

        // Transfer Syntax Sub-Item Structure
        if let Some(transfer_syntax) = &presentation_context.transfer_syntax {
            write_uid_sub_item(buffer, codec, 0x40, transfer_syntax, "Transfer-syntax-name")?;
        }
        Ok(())
    })
}

fn write_user_variables(
    buffer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    user_variables: &[UserVariableItem],
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // User Information Item Structure
    write_item(buffer, 0x50, "User Information Item", |buffer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    // Maximum Length Sub-Item Structure
                    write_item(buffer, 0x51, "Maximum Length Sub-Item", |buffer| {
                        buffer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })?;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    write_uid_sub_item(buffer, codec, 0x52, uid, "Implementation-class-uid")?;
                }
                UserVariableItem::RoleSelection(role_selection) => {
                    // SCP/SCU Role Selection Sub-Item Structure
                    write_item(buffer, 0x54, "Role Selection Sub-Item", |buffer| {
                        write_text_u16(
                            buffer,
                            codec,
                            &role_selection.abstract_syntax,
                            "SOP-class-uid",
                        )?;
                        buffer.extend_from_slice(&[
                            role_selection.scu_role as u8,
                            role_selection.scp_role as u8,
                        ]);
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    write_uid_sub_item(buffer, codec, 0x55, name, "Implementation-version-name")?;
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                    // SOP Class Extended Negotiation Sub-Item
                    write_item(buffer, 0x56, "SOP Class Extended Negotiation Sub-Item", |buffer| {
                        write_text_u16(buffer, codec, sop_class_uid, "SOP-class-uid")?;
                        buffer.extend_from_slice(data);
                        Ok(())
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    // User Identity Negotiation Sub-Item (request)
                    write_item(buffer, 0x58, "User Identity Sub-Item", |buffer| {
                        buffer.extend_from_slice(&[
                            user_identity.identity_type().to_u8(),
                            user_identity.positive_response_requested() as u8,
                        ]);
                        // an empty field still carries its zero length
                        write_chunk_u16(buffer, "User-Identity-primary-field", |buffer| {
                            buffer.extend_from_slice(user_identity.primary_field());
                            Ok(())
                        })?;
                        write_chunk_u16(buffer, "User-Identity-secondary-field", |buffer| {
                            buffer.extend_from_slice(user_identity.secondary_field());
                            Ok(())
                        })
                    })?;
                }
                UserVariableItem::UserIdentityAccept(response) => {
                    // User Identity Negotiation Sub-Item (accept)
                    write_item(buffer, 0x59, "User Identity Accept Sub-Item", |buffer| {
                        write_chunk_u16(buffer, "Server-response", |buffer| {
                            buffer.extend_from_slice(response);
                            Ok(())
                        })
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    write_item(buffer, *item_type, "Unknown Sub-Item", |buffer| {
                        buffer.extend_from_slice(data);
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn can_write_chunks_with_preceding_u32_length() -> Result<()> {
        let mut bytes = vec![0xAA];
        write_chunk_u32(&mut bytes, "test", |writer| {
            writer.extend_from_slice(&[0x02, 0x03]);
            write_chunk_u32(writer, "inner", |writer| {
                writer.push(0x04);
                Ok(())
            })
        })?;

        assert_eq!(
            bytes,
            &[0xAA, 0x00, 0x00, 0x00, 0x07, 0x02, 0x03, 0x00, 0x00, 0x00, 0x01, 0x04]
        );
        Ok(())
    }

    #[test]
    fn can_write_chunks_with_preceding_u16_length() -> Result<()> {
        let mut bytes = vec![];
        write_chunk_u16(&mut bytes, "test", |writer| {
            writer.extend_from_slice(&[0x02, 0x03, 0x04]);
            Ok(())
        })?;

        assert_eq!(bytes, &[0x00, 0x03, 0x02, 0x03, 0x04]);
        Ok(())
    }

    #[test]
    fn oversized_u16_chunk_fails() {
        let mut bytes = vec![];
        let result = write_chunk_u16(&mut bytes, "big", |writer| {
            writer.resize(70_000, 0);
            Ok(())
        });
        assert_matches!(result, Err(Error::ChunkTooLong { name: "big", length: 70_000, .. }));
    }

    fn association_rq(called_ae_title: &str) -> Pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            }],
            user_variables: vec![UserVariableItem::MaxLength(16384)],
        })
    }

    #[test]
    fn ae_title_is_padded_at_fixed_offsets() {
        let bytes = encode_pdu(&association_rq("STORE-SCP")).unwrap();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[6..8], &[0x00, 0x01]);
        assert_eq!(&bytes[10..26], b"STORE-SCP       ");
        assert_eq!(&bytes[26..42], b"SCU             ");
        assert_eq!(&bytes[42..74], &[0; 32]);
        assert_eq!(bytes[74], 0x10);
        let length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(length as usize, bytes.len() - 6);
    }

    #[test]
    fn seventeen_byte_ae_title_fails() {
        let pdu = association_rq("SEVENTEEN-BYTES-X");
        assert_matches!(
            encode_pdu(&pdu),
            Err(Error::InvalidAeTitle {
                field: "Called-AE-title",
                ..
            })
        );

        let mut out = Vec::new();
        assert!(write_pdu(&mut out, &pdu).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn non_ascii_ae_title_fails() {
        assert_matches!(
            encode_pdu(&association_rq("ÉCHO")),
            Err(Error::InvalidAeTitle { .. })
        );
    }

    #[test]
    fn user_identity_empty_secondary_field_keeps_length() {
        let pdu = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![UserVariableItem::UserIdentityItem(UserIdentity::username(
                "jdoe", true,
            ))],
        });
        let bytes = encode_pdu(&pdu).unwrap();
        let pos = bytes.iter().rposition(|b| *b == 0x58).unwrap();
        assert_eq!(
            &bytes[pos..],
            &[0x58, 0x00, 0x00, 0x0A, 0x01, 0x01, 0x00, 0x04, b'j', b'd', b'o', b'e', 0x00, 0x00]
        );
    }

    #[test]
    fn abort_writes_source_and_reason() {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
        };
        assert_eq!(
            encode_pdu(&pdu).unwrap(),
            vec![0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x02, 0x02]
        );
    }

    #[test]
    fn release_pdus_have_reserved_body() {
        assert_eq!(
            encode_pdu(&Pdu::ReleaseRQ).unwrap(),
            vec![0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode_pdu(&Pdu::ReleaseRP).unwrap(),
            vec![0x06, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn pdata_with_command_and_data() {
        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: 3,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: vec![0x01, 0x02],
                },
                PDataValue {
                    presentation_context_id: 3,
                    value_type: PDataValueType::Data,
                    is_last: false,
                    data: vec![0x03, 0x04],
                },
            ],
        };
        assert_eq!(
            encode_pdu(&pdu).unwrap(),
            vec![
                0x04, 0x00, 0x00, 0x00, 0x00, 0x10, //
                0x00, 0x00, 0x00, 0x04, 0x03, 0x03, 0x01, 0x02, //
                0x00, 0x00, 0x00, 0x04, 0x03, 0x00, 0x03, 0x04,
            ]
        );
    }
}
