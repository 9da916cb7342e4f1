//! Fragmentation and reassembly of P-Data messages.
//!
//! [`PDataWriter`] splits an outgoing command or data message
//! into P-DATA-TF PDUs which fit the peer's maximum length.
//! [`MessageAssembler`] joins the fragments of incoming messages back together.
use std::io::Write;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::pdu::{control_header, PDataValue, PDataValueType, MAXIMUM_PDU_SIZE};

/// Bytes before the fragment data in a P-DATA-TF PDU with a single PDV:
/// PDU header (6), PDV item length (4),
/// presentation context id (1) and message control header (1).
const PDATA_PREFIX_LEN: usize = 12;

/// Set up the P-Data PDU header for sending.
fn setup_pdata_header(buffer: &mut [u8], value_type: PDataValueType, is_last: bool) {
    let data_len = (buffer.len() - PDATA_PREFIX_LEN) as u32;

    // PDV item length: context id, control header and data
    let pdv_len = data_len + 2;
    // PDU length: PDV item length field and the item
    let pdu_len = pdv_len + 4;

    buffer[2..6].copy_from_slice(&pdu_len.to_be_bytes());
    buffer[6..10].copy_from_slice(&pdv_len.to_be_bytes());
    buffer[11] = control_header(value_type, is_last);
}

/// Determine the maximum length of fragment data
/// when encapsulated in a PDU with the given length property.
///
/// A length of 0 stands for no limit,
/// which is capped to the largest PDU this implementation handles.
/// The result is even
/// so that fragments other than the last one are never odd in length.
#[inline]
pub(crate) fn max_fragment_len(max_pdu_length: u32) -> u32 {
    let max_pdu_length = if max_pdu_length == 0 {
        MAXIMUM_PDU_SIZE
    } else {
        max_pdu_length
    };
    // PDV item length (4), context id (1), control header (1)
    max_pdu_length.saturating_sub(6).max(2) & !1
}

/// A P-Data value writer.
///
/// This exposes an API to iteratively construct and send
/// command or data messages to another node.
/// Using this as a [standard writer](std::io::Write)
/// will automatically split the incoming bytes
/// into separate PDUs if they do not fit in a single one.
/// Only the final fragment is marked as the last one.
///
/// # Example
///
/// Use an association's `send_pdata` method
/// to create a new P-Data value writer.
///
/// ```no_run
/// # use std::io::Write;
/// # use dicom_ulp::association::InitiatorOptions;
/// # fn dicom_data() -> &'static [u8] { unimplemented!() }
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut association = InitiatorOptions::new()
///     .with_abstract_syntax("1.2.840.10008.5.1.4.1.1.7")
///     .establish("129.168.0.5:104")?;
///
/// let presentation_context_id = association.presentation_contexts()[0].id;
///
/// // a DICOM object which may be split into multiple PDUs
/// let mut pdata = association.send_pdata(presentation_context_id)?;
/// pdata.write_all(dicom_data())?;
/// pdata.finish()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    max_data_len: u32,
    value_type: PDataValueType,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer for data messages.
    ///
    /// `max_pdu_length` is the maximum value of the PDU-length property
    /// admitted by the receiving node.
    pub fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        Self::with_value_type(
            stream,
            presentation_context_id,
            max_pdu_length,
            PDataValueType::Data,
        )
    }

    /// Construct a new P-Data value writer
    /// for messages of the given type.
    pub fn with_value_type(
        stream: W,
        presentation_context_id: u8,
        max_pdu_length: u32,
        value_type: PDataValueType,
    ) -> Self {
        let max_data_len = max_fragment_len(max_pdu_length);
        let mut buffer = Vec::with_capacity(max_data_len as usize + PDATA_PREFIX_LEN);
        buffer.extend([
            // PDU-type + reserved byte
            0x04,
            0x00,
            // PDU length, filled in on dispatch
            0x00,
            0x00,
            0x00,
            0x00,
            // PDV item length, filled in on dispatch
            0x00,
            0x00,
            0x00,
            0x00,
            presentation_context_id,
            // message control header, filled in on dispatch
            0x00,
        ]);

        PDataWriter {
            buffer,
            stream,
            max_data_len,
            value_type,
        }
    }

    /// The maximum number of message bytes per fragment.
    pub fn max_data_len(&self) -> u32 {
        self.max_data_len
    }

    /// Declare to have finished sending P-Data fragments,
    /// thus emitting the last P-Data fragment PDU.
    ///
    /// This is also done automatically once the P-Data writer is dropped.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            setup_pdata_header(&mut self.buffer, self.value_type, true);
            let out = self.stream.write_all(&self.buffer);
            // never send a second last fragment
            self.buffer.clear();
            out?;
            self.stream.flush()?;
        }
        Ok(())
    }

    /// Send the full buffer as a non-last fragment.
    fn dispatch_pdu(&mut self) -> std::io::Result<()> {
        debug_assert!(self.buffer.len() > PDATA_PREFIX_LEN);
        setup_pdata_header(&mut self.buffer, self.value_type, false);
        self.stream.write_all(&self.buffer)?;
        // back to just the prefix
        self.buffer.truncate(PDATA_PREFIX_LEN);
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffer.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "P-Data writer already finished",
            ));
        }
        let capacity = self.max_data_len as usize + PDATA_PREFIX_LEN;
        // a full fragment is held back until more data arrives,
        // so that the last fragment is never empty
        if self.buffer.len() == capacity {
            self.dispatch_pdu()?;
        }
        let n = buf.len().min(capacity - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// With the P-Data writer dropped,
/// this `Drop` implementation
/// will construct and emit the last P-Data fragment PDU
/// if it was not emitted yet.
impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// A complete message put back together from its fragments.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum Assembled {
    Command {
        presentation_context_id: u8,
        bytes: Bytes,
    },
    Data {
        presentation_context_id: u8,
        bytes: Bytes,
    },
}

impl Assembled {
    pub fn presentation_context_id(&self) -> u8 {
        match self {
            Assembled::Command {
                presentation_context_id,
                ..
            }
            | Assembled::Data {
                presentation_context_id,
                ..
            } => *presentation_context_id,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        match self {
            Assembled::Command { bytes, .. } | Assembled::Data { bytes, .. } => bytes,
        }
    }
}

/// Accumulator of one kind of message.
#[derive(Debug, Default)]
struct Pending {
    presentation_context_id: Option<u8>,
    bytes: BytesMut,
}

impl Pending {
    fn push(&mut self, value: PDataValue) -> Option<(u8, Bytes)> {
        let id = match self.presentation_context_id {
            None => value.presentation_context_id,
            Some(id) if id == value.presentation_context_id => id,
            Some(id) => {
                warn!(
                    "Received fragment for presentation context {} in a message of context {}",
                    value.presentation_context_id, id
                );
                id
            }
        };
        self.bytes.extend_from_slice(&value.data);
        if value.is_last {
            self.presentation_context_id = None;
            Some((id, self.bytes.split().freeze()))
        } else {
            self.presentation_context_id = Some(id);
            None
        }
    }

    fn is_empty(&self) -> bool {
        self.presentation_context_id.is_none() && self.bytes.is_empty()
    }
}

/// Reassembly of command and data messages
/// out of the P-Data values received.
///
/// Command and data fragments are accumulated independently,
/// so the tail of a command and the start of a data message
/// may arrive in the same PDU.
/// Values must be pushed in the order they were received.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    command: Pending,
    data: Pending,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one fragment,
    /// returning the whole message if it was the last one.
    pub fn push_value(&mut self, value: PDataValue) -> Option<Assembled> {
        match value.value_type {
            PDataValueType::Command => {
                self.command
                    .push(value)
                    .map(|(presentation_context_id, bytes)| Assembled::Command {
                        presentation_context_id,
                        bytes,
                    })
            }
            PDataValueType::Data => {
                self.data
                    .push(value)
                    .map(|(presentation_context_id, bytes)| Assembled::Data {
                        presentation_context_id,
                        bytes,
                    })
            }
        }
    }

    /// Accumulate all fragments of one P-DATA-TF PDU in order,
    /// returning the messages completed by it.
    pub fn push_pdu(&mut self, values: impl IntoIterator<Item = PDataValue>) -> Vec<Assembled> {
        values
            .into_iter()
            .filter_map(|value| self.push_value(value))
            .collect()
    }

    /// Whether a command message is partially received.
    pub fn has_pending_command(&self) -> bool {
        !self.command.is_empty()
    }

    /// Whether a data message is partially received.
    pub fn has_pending_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Discard any partially received message.
    pub fn clear(&mut self) {
        self.command = Pending::default();
        self.data = Pending::default();
    }
}
