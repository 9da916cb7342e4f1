/// PDU reader module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read};
use tracing::warn;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("connection closed while reading {}", what))]
    ConnectionClosed {
        what: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read {} from the connection", what))]
    ReadPdu {
        what: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display(
        "Declared length {} of `{}` exceeds the {} bytes remaining",
        length,
        field,
        remaining
    ))]
    LengthOutOfBounds {
        field: &'static str,
        length: usize,
        remaining: usize,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },
    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },
    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },
    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid abort service provider"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },
    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },
    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },
    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },
}

impl Error {
    /// Whether this error stems from the underlying connection
    /// rather than from the bytes received.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Error::ConnectionClosed { .. } | Error::ReadPdu { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read exactly one PDU from the given byte stream.
///
/// The header and the body are read insistently:
/// a short read is never taken as the end of the PDU,
/// and the stream ending midway is reported as
/// [`ConnectionClosed`](Error::ConnectionClosed).
///
/// `max_pdu_length` is the maximum length received
/// declared by this application entity,
/// 0 meaning that no limit was declared.
/// In strict mode, PDUs longer than this are refused.
/// Otherwise they are admitted up to [`MAXIMUM_PDU_SIZE`].
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        max_pdu_length == 0 || (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );
    let max_pdu_length = if max_pdu_length == 0 {
        MAXIMUM_PDU_SIZE
    } else {
        max_pdu_length
    };

    let mut header = [0; PDU_HEADER_SIZE as usize];
    read_insistently(reader, &mut header, "PDU header")?;

    let pdu_type = header[0];
    let pdu_length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
    }

    let mut body = vec![0; pdu_length as usize];
    read_insistently(reader, &mut body, "PDU body")?;

    decode_pdu_body(pdu_type, &body)
}

/// Decode one PDU from an in-memory buffer.
///
/// The buffer must start with the PDU header.
/// Bytes beyond the declared PDU length are ignored.
pub fn decode_pdu(bytes: &[u8]) -> Result<Pdu> {
    let mut cursor = Cursor::new(bytes);
    let pdu_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "PDU-type" })?;
    cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let pdu_length = cursor
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "PDU-length" })?;
    let body = read_n(&mut cursor, pdu_length as usize, "PDU body")?;
    decode_pdu_body(pdu_type, &body)
}

/// Fill the whole buffer from the reader,
/// retrying on interruptions and short reads.
fn read_insistently<R>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<()>
where
    R: Read,
{
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => ConnectionClosedSnafu { what }.fail(),
        Err(e) => Err(e).context(ReadPduSnafu { what }),
    }
}

/// Read `length` bytes from the buffered PDU,
/// failing if the declared length does not fit in what is left.
fn read_n(cursor: &mut Cursor<&[u8]>, length: usize, field: &'static str) -> Result<Vec<u8>> {
    let remaining = remaining(cursor);
    ensure!(
        length <= remaining,
        LengthOutOfBoundsSnafu {
            field,
            length,
            remaining
        }
    );
    let mut out = vec![0; length];
    cursor
        .read_exact(&mut out)
        .context(ReadPduFieldSnafu { field })?;
    Ok(out)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize)
}

fn has_remaining(cursor: &Cursor<&[u8]>) -> bool {
    remaining(cursor) > 0
}

fn skip(cursor: &mut Cursor<&[u8]>, length: usize, field: &'static str) -> Result<()> {
    read_n(cursor, length, field).map(|_| ())
}

/// Decode a text field holding a UID,
/// dropping trailing padding.
fn read_uid(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
    length: usize,
    field: &'static str,
) -> Result<String> {
    let bytes = read_n(cursor, length, field)?;
    let text = codec.decode(&bytes).context(DecodeTextSnafu { field })?;
    Ok(text
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .trim_start()
        .to_string())
}

fn read_ae_title(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String> {
    let bytes = read_n(cursor, 16, field)?;
    let text = codec.decode(&bytes).context(DecodeTextSnafu { field })?;
    Ok(text.trim().to_string())
}

fn decode_pdu_body(pdu_type: u8, body: &[u8]) -> Result<Pdu> {
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ PDU Structure
            let (protocol_version, called_ae_title, calling_ae_title) =
                read_association_header(&mut cursor, &codec)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 75-xxx - Variable items - one Application Context Item,
            // one or more Presentation Context Items
            // and one User Information Item.
            while has_remaining(&cursor) {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::Unknown(item_type) => {
                        warn!("Skipping unknown item type {:#04x} in A-ASSOCIATE-RQ", item_type);
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x02 => {
            // A-ASSOCIATE-AC PDU Structure
            //
            // The AE title fields shall be sent with the values received
            // in the A-ASSOCIATE-RQ PDU, but are not tested when received.
            let (protocol_version, called_ae_title, calling_ae_title) =
                read_association_header(&mut cursor, &codec)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            while has_remaining(&cursor) {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::Unknown(item_type) => {
                        warn!("Skipping unknown item type {:#04x} in A-ASSOCIATE-AC", item_type);
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x03 => {
            // A-ASSOCIATE-RJ PDU Structure

            // 7 - Reserved
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            // 8 - Result
            //   1 - rejected-permanent
            //   2 - rejected-transient
            let result = AssociationRJResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            // 9 - Source
            //   1 - DICOM UL service-user
            //   2 - DICOM UL service-provider (ACSE related function)
            //   3 - DICOM UL service-provider (Presentation related function)
            // 10 - Reason/Diag., interpreted according to the source
            let source = AssociationRJSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF PDU Structure

            // 7-xxx - one or more Presentation-data-value Items
            let mut values = vec![];
            while has_remaining(&cursor) {
                // 1-4 - Item-length
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-Length",
                })?;

                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                // 5 - Presentation-context-ID
                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // 6 - Message Control Header:
                // bit 0 set means command, unset means data set;
                // bit 1 set means this is the last fragment
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                let data = read_n(
                    &mut cursor,
                    (item_length - 2) as usize,
                    "Presentation-data-value",
                )?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                })
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ PDU Structure
            // 7-10 - Reserved, not tested when received
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP PDU Structure
            // 7-10 - Reserved, not tested when received
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT PDU Structure

            // 7-8 - Reserved
            skip(&mut cursor, 2, "Reserved")?;

            // 9 - Source
            // - 0 - DICOM UL service-user (initiated abort)
            // - 1 - reserved
            // - 2 - DICOM UL service-provider (initiated abort)
            // 10 - Reason/Diag, only significant for the service provider
            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: body.to_vec(),
        }),
    }
}

/// Read the fixed part of A-ASSOCIATE-RQ and A-ASSOCIATE-AC,
/// up to the variable items.
fn read_association_header(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<(u16, String, String)> {
    // 7-8 - Protocol-version - bit 0 identifies version 1
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;

    // 9-10 - Reserved
    skip(cursor, 2, "Reserved")?;

    // 11-26 - Called-AE-title, 16 characters with non-significant spaces
    let called_ae_title = read_ae_title(cursor, codec, "Called-AE-title")?;

    // 27-42 - Calling-AE-title
    let calling_ae_title = read_ae_title(cursor, codec, "Calling-AE-title")?;

    // 43-74 - Reserved
    skip(cursor, 32, "Reserved")?;

    Ok((protocol_version, called_ae_title, calling_ae_title))
}

/// Read an item or sub-item header: type, reserved byte and 2-byte length.
fn read_item_header(cursor: &mut Cursor<&[u8]>) -> Result<(u8, u16)> {
    let item_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;
    Ok((item_type, item_length))
}

fn read_pdu_variable(cursor: &mut Cursor<&[u8]>, codec: &dyn TextCodec) -> Result<PduVariableItem> {
    let (item_type, item_length) = read_item_header(cursor)?;

    let bytes = read_n(cursor, item_length as usize, "Item")?;
    let mut cursor = Cursor::new(&bytes[..]);

    match item_type {
        0x10 => {
            // Application Context Item Structure
            let val = read_uid(
                &mut cursor,
                codec,
                item_length as usize,
                "Application-context-name",
            )?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item Structure (proposed)

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            // 5 - Presentation-context-ID
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6-8 - Reserved
            skip(&mut cursor, 3, "Reserved")?;

            // 9-xxx - one Abstract Syntax and one or more Transfer Syntax sub-items
            while has_remaining(&cursor) {
                let (sub_item_type, sub_item_length) = read_item_header(&mut cursor)?;
                let sub_item_length = sub_item_length as usize;

                match sub_item_type {
                    0x30 => {
                        abstract_syntax = Some(read_uid(
                            &mut cursor,
                            codec,
                            sub_item_length,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_uid(
                            &mut cursor,
                            codec,
                            sub_item_length,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        warn!(
                            "Skipping unknown presentation context sub-item type {:#04x}",
                            sub_item_type
                        );
                        skip(&mut cursor, sub_item_length, "Unknown sub-item")?;
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item Structure (result)

            let mut transfer_syntax: Option<String> = None;

            // 5 - Presentation-context-ID
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6 - Reserved
            skip(&mut cursor, 1, "Reserved")?;

            // 7 - Result/Reason
            //   0 - acceptance
            //   1 - user-rejection
            //   2 - no-reason (provider rejection)
            //   3 - abstract-syntax-not-supported (provider rejection)
            //   4 - transfer-syntaxes-not-supported (provider rejection)
            let reason = PresentationContextResultReason::from(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;

            // 8 - Reserved
            skip(&mut cursor, 1, "Reserved")?;

            // 9-xxx - one Transfer Syntax sub-item,
            // not significant unless the context was accepted
            while has_remaining(&cursor) {
                let (sub_item_type, sub_item_length) = read_item_header(&mut cursor)?;
                let sub_item_length = sub_item_length as usize;

                match sub_item_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax = Some(read_uid(
                            &mut cursor,
                            codec,
                            sub_item_length,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        warn!(
                            "Skipping unknown presentation context sub-item type {:#04x}",
                            sub_item_type
                        );
                        skip(&mut cursor, sub_item_length, "Unknown sub-item")?;
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax,
                },
            ))
        }
        0x50 => {
            // User Information Item Structure
            let mut user_variables = vec![];

            while has_remaining(&cursor) {
                let (sub_item_type, sub_item_length) = read_item_header(&mut cursor)?;
                let sub_item = read_n(&mut cursor, sub_item_length as usize, "User-data sub-item")?;
                user_variables.push(read_user_variable(sub_item_type, &sub_item, codec)?);
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

/// Decode one user information sub-item from its content bytes.
fn read_user_variable(
    item_type: u8,
    bytes: &[u8],
    codec: &dyn TextCodec,
) -> Result<UserVariableItem> {
    let mut cursor = Cursor::new(bytes);
    let item = match item_type {
        0x51 => {
            // Maximum Length Sub-Item Structure
            // 5-8 - Maximum-length-received, 0 meaning no maximum
            UserVariableItem::MaxLength(cursor.read_u32::<BigEndian>().context(
                ReadPduFieldSnafu {
                    field: "Maximum-length-received",
                },
            )?)
        }
        0x52 => UserVariableItem::ImplementationClassUID(read_uid(
            &mut cursor,
            codec,
            bytes.len(),
            "Implementation-class-uid",
        )?),
        0x54 => {
            // SCP/SCU Role Selection Sub-Item Structure

            // 5-6 - UID-length
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "UID-length",
            })?;
            // 7-xxx - SOP-class-uid
            let abstract_syntax =
                read_uid(&mut cursor, codec, uid_length as usize, "SOP-class-uid")?;
            // xxx - SCU-role, xxx - SCP-role
            let scu_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCU-role" })?;
            let scp_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCP-role" })?;
            UserVariableItem::RoleSelection(RoleSelection {
                abstract_syntax,
                scu_role: scu_role == 1,
                scp_role: scp_role == 1,
            })
        }
        0x55 => {
            // Implementation Version Name Structure
            let bytes = read_n(&mut cursor, bytes.len(), "Implementation-version-name")?;
            let name = codec.decode(&bytes).context(DecodeTextSnafu {
                field: "Implementation-version-name",
            })?;
            UserVariableItem::ImplementationVersionName(name.trim().to_string())
        }
        0x56 => {
            // SOP Class Extended Negotiation Sub-Item

            // 5-6 - SOP-class-uid-length
            let sop_class_uid_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "SOP-class-uid-length",
                })?;
            let sop_class_uid = read_uid(
                &mut cursor,
                codec,
                sop_class_uid_length as usize,
                "SOP-class-uid",
            )?;
            // the rest is service-class-application-information
            let rest = remaining(&cursor);
            let data = read_n(&mut cursor, rest, "Service-class-application-information")?;
            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data)
        }
        0x58 => {
            // User Identity Negotiation

            // 5 - User Identity Type
            let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-type",
            })?;

            // 6 - Positive-response-requested
            let positive_response_requested = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-positive-response-requested",
            })?;

            // 7-8 - Primary Field Length, 9-n - Primary Field
            let primary_field_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "User-Identity-primary-field-length",
                })?;
            let primary_field = read_n(
                &mut cursor,
                primary_field_length as usize,
                "User-Identity-primary-field",
            )?;

            // n+1-n+2 - Secondary Field Length, n+3-m - Secondary Field,
            // only non-empty for user name and passcode
            let secondary_field_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "User-Identity-secondary-field-length",
                })?;
            let secondary_field = read_n(
                &mut cursor,
                secondary_field_length as usize,
                "User-Identity-secondary-field",
            )?;

            match UserIdentityType::from(user_identity_type) {
                Some(user_identity_type) => UserVariableItem::UserIdentityItem(UserIdentity::new(
                    positive_response_requested == 1,
                    user_identity_type,
                    primary_field,
                    secondary_field,
                )),
                None => {
                    warn!("Unknown User Identity Type code {}", user_identity_type);
                    UserVariableItem::Unknown(item_type, bytes.to_vec())
                }
            }
        }
        0x59 => {
            // User Identity Negotiation (accept)

            // 5-6 - Server-response-length, 7-xxx - Server-response
            let response_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Server-response-length",
            })?;
            let response = read_n(&mut cursor, response_length as usize, "Server-response")?;
            UserVariableItem::UserIdentityAccept(response)
        }
        _ => UserVariableItem::Unknown(item_type, bytes.to_vec()),
    };
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    /// A-ASSOCIATE-RQ with an unknown item (0x7F)
    /// and an unknown presentation context sub-item (0x3F)
    fn association_rq_with_unknown_items() -> Vec<u8> {
        let mut body = vec![
            0x00, 0x01, // protocol version
            0x00, 0x00, // reserved
        ];
        body.extend(b"CALLED          ");
        body.extend(b"CALLING         ");
        body.extend([0; 32]);
        // application context
        body.extend([0x10, 0x00, 0x00, 0x15]);
        body.extend(b"1.2.840.10008.3.1.1.1");
        // unknown item
        body.extend([0x7F, 0x00, 0x00, 0x03, 0xAA, 0xBB, 0xCC]);
        // presentation context
        let mut pc = vec![0x01, 0x00, 0x00, 0x00];
        pc.extend([0x30, 0x00, 0x00, 0x11]);
        pc.extend(b"1.2.840.10008.1.1");
        pc.extend([0x3F, 0x00, 0x00, 0x02, 0x01, 0x02]);
        pc.extend([0x40, 0x00, 0x00, 0x11]);
        pc.extend(b"1.2.840.10008.1.2");
        body.extend([0x20, 0x00, 0x00, pc.len() as u8]);
        body.extend(pc);

        let mut pdu = vec![0x01, 0x00];
        pdu.extend((body.len() as u32).to_be_bytes());
        pdu.extend(body);
        pdu
    }

    #[test]
    fn skips_unknown_items_and_sub_items() {
        let bytes = association_rq_with_unknown_items();
        let pdu = decode_pdu(&bytes).unwrap();
        match pdu {
            Pdu::AssociationRQ(rq) => {
                assert_eq!(rq.called_ae_title, "CALLED");
                assert_eq!(rq.calling_ae_title, "CALLING");
                assert_eq!(rq.application_context_name, "1.2.840.10008.3.1.1.1");
                assert_eq!(
                    rq.presentation_contexts,
                    vec![PresentationContextProposed {
                        id: 1,
                        abstract_syntax: "1.2.840.10008.1.1".to_string(),
                        transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
                    }]
                );
                assert!(rq.user_variables.is_empty());
            }
            pdu => panic!("Expected AssociationRQ, got {:?}", pdu),
        }
    }

    #[test]
    fn unknown_user_identity_type_is_kept() {
        let identity = [0x09, 0x00, 0x00, 0x02, b'a', b'b', 0x00, 0x00];
        let mut bytes = vec![0x50, 0x00, 0x00, 0x0C, 0x58, 0x00, 0x00, 0x08];
        bytes.extend(identity);

        let codec = DefaultCharacterSetCodec;
        let item = read_pdu_variable(&mut Cursor::new(&bytes[..]), &codec).unwrap();
        assert_eq!(
            item,
            PduVariableItem::UserVariables(vec![UserVariableItem::Unknown(
                0x58,
                identity.to_vec()
            )])
        );
    }

    #[test]
    fn nested_length_beyond_buffer_is_fatal() {
        let mut bytes = association_rq_with_unknown_items();
        // the unknown item claims 0x0300 bytes instead of 3
        let pos = bytes
            .windows(4)
            .position(|w| w == [0x7F, 0x00, 0x00, 0x03])
            .unwrap();
        bytes[pos + 2] = 0x03;
        assert_matches!(decode_pdu(&bytes), Err(Error::LengthOutOfBounds { .. }));
    }

    #[test]
    fn pdu_length_beyond_buffer_is_fatal() {
        let bytes = [0x05, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00];
        assert_matches!(decode_pdu(&bytes), Err(Error::LengthOutOfBounds { .. }));
    }

    #[test]
    fn short_stream_is_connection_closed() {
        let bytes = [0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00];
        let err = read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU, true).unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(
            err.to_string(),
            "connection closed while reading PDU body"
        );

        let err = read_pdu(&mut &bytes[..3], DEFAULT_MAX_PDU, true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "connection closed while reading PDU header"
        );
    }

    /// A reader which hands out one byte at a time.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0[0];
            self.0 = &self.0[1..];
            Ok(1)
        }
    }

    #[test]
    fn short_reads_are_accumulated() {
        let bytes = [0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x02, 0x02];
        let pdu = read_pdu(&mut Trickle(&bytes), DEFAULT_MAX_PDU, true).unwrap();
        assert_eq!(
            pdu,
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu)
            }
        );
    }

    #[test]
    fn strict_mode_refuses_large_pdus() {
        let mut bytes = vec![0x04, 0x00];
        let length = MINIMUM_PDU_SIZE + 2;
        bytes.extend(length.to_be_bytes());
        bytes.extend((length - 4).to_be_bytes());
        bytes.extend([0x01, 0x02]);
        bytes.resize(bytes.len() + (length - 6) as usize, 0);

        assert_matches!(
            read_pdu(&mut &bytes[..], MINIMUM_PDU_SIZE, true),
            Err(Error::PduTooLarge { .. })
        );
        let pdu = read_pdu(&mut &bytes[..], MINIMUM_PDU_SIZE, false).unwrap();
        assert_matches!(pdu, Pdu::PData { ref data } if data.len() == 1);
    }

    #[test]
    fn unknown_pdu_type_is_kept() {
        let bytes = [0x0A, 0x00, 0x00, 0x00, 0x00, 0x02, 0xDE, 0xAD];
        assert_eq!(
            decode_pdu(&bytes).unwrap(),
            Pdu::Unknown {
                pdu_type: 0x0A,
                data: vec![0xDE, 0xAD]
            }
        );
    }

    #[test]
    fn invalid_max_pdu_is_refused() {
        let bytes = [0x06, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00];
        assert_matches!(
            read_pdu(&mut &bytes[..], 100, true),
            Err(Error::InvalidMaxPdu { .. })
        );
        assert_eq!(read_pdu(&mut &bytes[..], 0, true).unwrap(), Pdu::ReleaseRP);
    }
}
