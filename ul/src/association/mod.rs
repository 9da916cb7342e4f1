//! DICOM association module
//!
//! This module contains the association state machine
//! and the utilities for establishing associations
//! between DICOM nodes via TCP/IP.
//!
//! As an association requester,
//! a new association can be started
//! via the [`InitiatorOptions`] type.
//! The minimum required properties are the proposed abstract syntaxes
//! and the TCP socket address to the target node.
//!
//! As an association acceptor,
//! a newly accepted [TCP stream][1] can be passed to
//! a previously prepared [`AcceptorOptions`].
//!
//! Either way, the outcome is an [`Association`] in data transfer,
//! which is driven by the calling thread
//! until it is released or aborted.
//!
//! [1]: std::net::TcpStream
use std::fmt;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, trace, warn};

use crate::negotiation;
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, PDataValue,
    PDataValueType, Pdu, PresentationContextNegotiated, RoleSelection, UserVariableItem,
    MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};

pub mod acceptor;
pub mod artim;
pub mod initiator;
pub mod pdata;
pub mod transport;
pub mod uid;

pub use acceptor::{AcceptAny, AcceptCalledAeTitle, AcceptorOptions, AccessControl};
pub use artim::{ArtimOutcome, ArtimTimer, Clock, SystemClock};
pub use initiator::InitiatorOptions;
pub use pdata::{Assembled, MessageAssembler, PDataWriter};
pub use transport::Transport;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// could not connect to the peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not configure the socket
    SetSocketOption {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to encode PDU
    EncodePdu {
        #[snafu(backtrace)]
        source: crate::pdu::WriteError,
    },

    /// failed to send PDU on the wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to receive PDU
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::ReadError,
    },

    #[snafu(display("refusing to send P-Data PDU of odd length {}", length))]
    OddLengthPdu { length: usize, backtrace: Backtrace },

    #[snafu(display("association rejected: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    #[snafu(display("association aborted by {}", abort_source))]
    Aborted {
        abort_source: AbortRQSource,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected PDU {} in state {:?}", pdu.short_description(), state))]
    UnexpectedPdu {
        pdu: Box<Pdu>,
        state: State,
        backtrace: Backtrace,
    },

    #[snafu(display("unrecognized PDU of type {:#04x}", pdu.pdu_type()))]
    UnknownPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    #[snafu(display("unsupported protocol version {:#06x}", version))]
    UnsupportedProtocolVersion { version: u16, backtrace: Backtrace },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    /// presentation context negotiation failed
    Negotiation {
        #[snafu(backtrace)]
        source: negotiation::Error,
    },

    #[snafu(display("presentation context {} was not accepted in this association", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    /// no received data handler was set
    MissingHandler { backtrace: Backtrace },

    /// received data handler failed
    Handler {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[snafu(display("operation not allowed in state {:?}", state))]
    InvalidState { state: State, backtrace: Backtrace },

    /// TLS configuration is missing
    #[cfg(feature = "sync-tls")]
    TlsConfigMissing { backtrace: Backtrace },

    /// failed to set up the TLS session
    #[cfg(feature = "sync-tls")]
    Tls {
        source: rustls::Error,
        backtrace: Backtrace,
    },

    #[cfg(feature = "sync-tls")]
    #[snafu(display("invalid TLS server name `{}`", name))]
    InvalidServerName {
        name: String,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The closed set of failure categories of the upper layer.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// a PDU could not be encoded, nothing was sent
    Encoding,
    /// a malformed PDU was received from the peer
    Decoding,
    /// the association request was rejected (A-ASSOCIATE-RJ)
    Rejected,
    /// the association was aborted (A-ABORT or A-P-ABORT),
    /// including aborts sent on an unexpected or unrecognized PDU
    Aborted,
    /// the peer does not speak a supported protocol version
    ProtocolViolation,
    /// presentation contexts could not be agreed upon
    NegotiationFailed,
    /// the connection failed
    Transport,
    /// the association or its options were used incorrectly
    Usage,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingAbstractSyntax { .. }
            | Error::InvalidMaxPdu { .. }
            | Error::UnknownPresentationContext { .. }
            | Error::MissingHandler { .. }
            | Error::InvalidState { .. } => ErrorKind::Usage,
            #[cfg(feature = "sync-tls")]
            Error::TlsConfigMissing { .. } | Error::InvalidServerName { .. } => ErrorKind::Usage,
            Error::Connect { .. } | Error::SetSocketOption { .. } | Error::WireSend { .. } => {
                ErrorKind::Transport
            }
            #[cfg(feature = "sync-tls")]
            Error::Tls { .. } => ErrorKind::Transport,
            Error::EncodePdu { .. } | Error::OddLengthPdu { .. } => ErrorKind::Encoding,
            Error::ReceivePdu { source } => {
                if source.is_transport_failure() {
                    ErrorKind::Transport
                } else {
                    ErrorKind::Decoding
                }
            }
            Error::Rejected { .. } => ErrorKind::Rejected,
            Error::Aborted { .. }
            | Error::Handler { .. }
            | Error::UnexpectedPdu { .. }
            | Error::UnknownPdu { .. } => ErrorKind::Aborted,
            Error::UnsupportedProtocolVersion { .. } => ErrorKind::ProtocolViolation,
            Error::NoAcceptedPresentationContexts { .. } | Error::Negotiation { .. } => {
                ErrorKind::NegotiationFailed
            }
        }
    }

    /// Whether this error ended an association which was underway
    /// in an A-ABORT or A-P-ABORT indication.
    ///
    /// This includes aborts received from the peer,
    /// aborts sent in response to an unexpected PDU,
    /// and read or write failures on the connection.
    pub fn is_abort_indication(&self) -> bool {
        match self {
            Error::WireSend { .. } => true,
            Error::ReceivePdu { source } => source.is_transport_failure(),
            _ => self.kind() == ErrorKind::Aborted,
        }
    }
}

/// The states of an association,
/// loosely following the upper layer state machine.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum State {
    Idle,
    TransportConnecting,
    /// requester: A-ASSOCIATE-RQ sent
    AwaitingAssociateResponse,
    /// acceptor: connection accepted
    AwaitingAssociateRequest,
    DataTransfer,
    /// A-RELEASE-RQ sent
    AwaitingReleaseResponse,
    /// release collision: A-RELEASE-RP sent in response to the peer's request,
    /// waiting for the peer's response to ours
    AwaitingReleaseRequestEcho,
    /// A-RELEASE-RP or A-ABORT sent, waiting for the peer to close
    AwaitingTransportClose,
    Closed,
}

/// Which side of the association this node is.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum Role {
    Requestor,
    Acceptor,
}

static NEXT_ASSOCIATION_ID: AtomicU64 = AtomicU64::new(1);

/// Obtain a new process-wide association identifier for diagnostics.
pub fn next_association_id() -> u64 {
    NEXT_ASSOCIATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// The maximum PDU length to use when sending,
/// given our own maximum and the peer's, 0 meaning unlimited.
pub(crate) fn effective_max_pdu_length(local: u32, peer: u32) -> u32 {
    match (local, peer) {
        (0, 0) => MAXIMUM_PDU_SIZE,
        (0, peer) => peer,
        (local, 0) => local,
        (local, peer) => local.min(peer),
    }
}

/// Encode and send a PDU before an association exists.
pub(crate) fn send_pdu_on<S>(transport: &mut S, buffer: &mut Vec<u8>, pdu: &Pdu, id: u64) -> Result<()>
where
    S: ?Sized + Transport,
{
    buffer.clear();
    write_pdu(buffer, pdu).context(EncodePduSnafu)?;
    trace!(association = id, ">> {}", pdu.short_description());
    transport.write_all(buffer).context(WireSendSnafu)?;
    transport.flush().context(WireSendSnafu)
}

/// Close a transport, logging any failure.
pub(crate) fn close_quietly<S>(transport: &mut S, id: u64)
where
    S: ?Sized + Transport,
{
    if let Err(e) = transport.close() {
        debug!(association = id, "Failed to close transport: {}", e);
    }
}

/// Best-effort delivery of a PDU which ends the connection,
/// such as an A-ASSOCIATE-RJ or an A-ABORT,
/// followed by the ARTIM wait and the closing of the transport.
pub(crate) fn send_final_pdu_and_close<S>(transport: &mut S, pdu: &Pdu, artim: &ArtimTimer, id: u64)
where
    S: ?Sized + Transport,
{
    let mut buffer = Vec::new();
    match send_pdu_on(transport, &mut buffer, pdu, id) {
        Ok(()) => {
            debug!(association = id, state = ?State::AwaitingTransportClose, "Waiting for peer to close");
            artim.wait_for_close(transport, &SystemClock);
        }
        Err(e) => debug!(association = id, "Could not send {}: {}", pdu.short_description(), e),
    }
    close_quietly(transport, id);
}

/// What the wait loop should do after a handler call.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum HandlerControl {
    /// keep waiting for P-Data
    Continue,
    /// stop waiting and release the association
    StopAndAutoRelease,
    /// stop waiting, the caller takes care of releasing
    StopCallerReleases,
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Receiver of inbound P-Data,
/// called once per P-DATA-TF PDU in arrival order.
///
/// This is where service implementations plug into an association.
/// Any closure with the same signature as [`on_pdata`](Self::on_pdata)
/// is also a handler.
pub trait ReceivedDataHandler<S: Transport = TcpStream> {
    fn on_pdata(
        &mut self,
        association: &mut Association<S>,
        values: Vec<PDataValue>,
    ) -> Result<HandlerControl, HandlerError>;
}

impl<S, F> ReceivedDataHandler<S> for F
where
    S: Transport,
    F: FnMut(&mut Association<S>, Vec<PDataValue>) -> Result<HandlerControl, HandlerError>,
{
    fn on_pdata(
        &mut self,
        association: &mut Association<S>,
        values: Vec<PDataValue>,
    ) -> Result<HandlerControl, HandlerError> {
        self(association, values)
    }
}

/// Conditions to stop waiting for P-Data,
/// besides the handler asking to stop.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct WaitCondition {
    /// stop after this many P-DATA-TF PDUs
    pub max_pdus: Option<usize>,
    /// stop after a PDU with the last fragment of a command
    pub stop_after_command: bool,
    /// stop after a PDU with the last fragment of a data set
    pub stop_after_data: bool,
}

/// How waiting for P-Data ended, when it did not fail.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum WaitOutcome {
    /// a stop condition was met, the association is still in data transfer
    Completed,
    /// the association was released and is now closed
    Released,
}

/// Parameters agreed on during association establishment.
#[derive(Debug)]
pub(crate) struct Negotiated {
    pub id: u64,
    pub role: Role,
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    pub role_selections: Vec<RoleSelection>,
    pub local_max_pdu_length: u32,
    pub peer_max_pdu_length: u32,
    pub strict: bool,
    pub local_ae_title: String,
    pub peer_ae_title: String,
    pub peer_user_variables: Vec<UserVariableItem>,
    pub artim: ArtimTimer,
}

/// An established DICOM upper layer association.
///
/// The most common operations are
/// [`send`](Self::send) and the `wait_for_*` family,
/// which dispatch incoming P-Data to the [received data handler](ReceivedDataHandler).
/// Large messages are best sent through
/// the P-Data writer returned by [`send_pdata`](Self::send_pdata).
///
/// Failures on the wire close the transport,
/// after sending an A-ABORT when the protocol calls for it.
/// When the value falls out of scope while still in data transfer,
/// an A-ABORT is sent and the connection is shut down.
pub struct Association<S = TcpStream>
where
    S: Transport,
{
    id: u64,
    role: Role,
    state: State,
    transport: S,
    transport_closed: bool,
    /// the accepted presentation contexts
    presentation_contexts: Vec<PresentationContextNegotiated>,
    role_selections: Vec<RoleSelection>,
    /// the maximum PDU length that this node admits
    local_max_pdu_length: u32,
    /// the maximum PDU length that the peer admits
    peer_max_pdu_length: u32,
    /// the maximum PDU length used when sending
    send_max_pdu_length: u32,
    strict: bool,
    local_ae_title: String,
    peer_ae_title: String,
    peer_user_variables: Vec<UserVariableItem>,
    artim: ArtimTimer,
    handler: Option<Box<dyn ReceivedDataHandler<S> + Send>>,
    write_buffer: Vec<u8>,
}

impl<S> fmt::Debug for Association<S>
where
    S: Transport,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("presentation_contexts", &self.presentation_contexts)
            .field("local_max_pdu_length", &self.local_max_pdu_length)
            .field("peer_max_pdu_length", &self.peer_max_pdu_length)
            .field("local_ae_title", &self.local_ae_title)
            .field("peer_ae_title", &self.peer_ae_title)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl<S> Association<S>
where
    S: Transport,
{
    pub(crate) fn new(negotiated: Negotiated, transport: S) -> Self {
        let Negotiated {
            id,
            role,
            presentation_contexts,
            role_selections,
            local_max_pdu_length,
            peer_max_pdu_length,
            strict,
            local_ae_title,
            peer_ae_title,
            peer_user_variables,
            artim,
        } = negotiated;
        let send_max_pdu_length = effective_max_pdu_length(local_max_pdu_length, peer_max_pdu_length);
        debug!(
            association = id,
            ?role,
            peer = %peer_ae_title,
            send_max_pdu_length,
            "Association established with {} presentation contexts",
            presentation_contexts.len()
        );
        Association {
            id,
            role,
            state: State::DataTransfer,
            transport,
            transport_closed: false,
            presentation_contexts,
            role_selections,
            local_max_pdu_length,
            peer_max_pdu_length,
            send_max_pdu_length,
            strict,
            local_ae_title,
            peer_ae_title,
            peer_user_variables,
            artim,
            handler: None,
            write_buffer: Vec::with_capacity((send_max_pdu_length.min(MAXIMUM_PDU_SIZE) + PDU_HEADER_SIZE) as usize),
        }
    }

    /// The diagnostic identifier of this association.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Obtain a view of the accepted presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    /// The SCU/SCP role selections agreed with the peer.
    pub fn role_selections(&self) -> &[RoleSelection] {
        &self.role_selections
    }

    /// Retrieve the maximum PDU length admitted by this node.
    pub fn local_max_pdu_length(&self) -> u32 {
        self.local_max_pdu_length
    }

    /// Retrieve the maximum PDU length admitted by the peer,
    /// 0 meaning unlimited.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    /// The maximum PDU length used for outgoing PDUs.
    pub fn send_max_pdu_length(&self) -> u32 {
        self.send_max_pdu_length
    }

    pub fn local_ae_title(&self) -> &str {
        &self.local_ae_title
    }

    /// Obtain the remote DICOM node's application entity title.
    pub fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    /// The user information sub-items sent by the peer.
    pub fn peer_user_variables(&self) -> &[UserVariableItem] {
        &self.peer_user_variables
    }

    /// The user identity server response, if the peer sent one.
    pub fn user_identity_response(&self) -> Option<&[u8]> {
        self.peer_user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityAccept(response) => Some(response.as_slice()),
            _ => None,
        })
    }

    /// Choose the best accepted presentation context for the abstract syntax.
    ///
    /// See [`negotiation::select_suitable_context_id`] for the preference order.
    pub fn suitable_presentation_context_id(&self, abstract_syntax: &str) -> Result<u8> {
        negotiation::select_suitable_context_id(&self.presentation_contexts, abstract_syntax)
            .context(NegotiationSnafu)
    }

    /// Find the accepted presentation context
    /// with exactly this abstract syntax and transfer syntax.
    pub fn presentation_context_id_for(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
    ) -> Result<u8> {
        negotiation::select_exact_context_id(
            &self.presentation_contexts,
            abstract_syntax,
            transfer_syntax,
        )
        .context(NegotiationSnafu)
    }

    /// The transfer syntax accepted for the presentation context.
    pub fn transfer_syntax_for_presentation_context_id(&self, id: u8) -> Option<&str> {
        self.presentation_contexts
            .iter()
            .find(|pc| pc.id == id)
            .map(|pc| pc.transfer_syntax.as_str())
    }

    /// Register the handler of inbound P-Data,
    /// replacing any previous one.
    pub fn set_received_data_handler<H>(&mut self, handler: H)
    where
        H: ReceivedDataHandler<S> + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    /// Send a command and/or a data set on the given presentation context.
    ///
    /// Both go in a single P-DATA-TF PDU,
    /// each as one value marked as the last fragment,
    /// if that fits in the peer's maximum PDU length.
    /// Otherwise they are split across several PDUs.
    pub fn send(
        &mut self,
        presentation_context_id: u8,
        command: Option<&[u8]>,
        data: Option<&[u8]>,
    ) -> Result<()> {
        self.ensure_state(State::DataTransfer)?;
        self.ensure_presentation_context(presentation_context_id)?;

        let parts = [
            (PDataValueType::Command, command),
            (PDataValueType::Data, data),
        ];
        // each value adds its item length (4), context id and control header
        let pdu_length: usize = parts
            .iter()
            .filter_map(|(_, bytes)| bytes.map(|b| 6 + b.len()))
            .sum();
        if pdu_length == 0 {
            return Ok(());
        }

        if pdu_length > self.send_max_pdu_length as usize {
            debug!(
                association = self.id,
                pdu_length,
                max = self.send_max_pdu_length,
                "Message too large for one PDU, fragmenting"
            );
            for (value_type, bytes) in parts {
                if let Some(bytes) = bytes {
                    self.send_fragmented(presentation_context_id, value_type, bytes)?;
                }
            }
            return Ok(());
        }

        ensure!(pdu_length % 2 == 0, OddLengthPduSnafu { length: pdu_length });
        let data = parts
            .into_iter()
            .filter_map(|(value_type, bytes)| {
                bytes.map(|bytes| PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last: true,
                    data: bytes.to_vec(),
                })
            })
            .collect();
        self.send_pdu(&Pdu::PData { data })
    }

    fn send_fragmented(
        &mut self,
        presentation_context_id: u8,
        value_type: PDataValueType,
        bytes: &[u8],
    ) -> Result<()> {
        let out = {
            let mut writer = PDataWriter::with_value_type(
                &mut self.transport,
                presentation_context_id,
                self.send_max_pdu_length,
                value_type,
            );
            match writer.write_all(bytes) {
                Ok(()) => writer.finish(),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = out {
            self.close_transport();
            return Err(e).context(WireSendSnafu);
        }
        trace!(
            association = self.id,
            ">> {:?} message of {} bytes in fragments",
            value_type,
            bytes.len()
        );
        Ok(())
    }

    /// Prepare a P-Data writer for sending a data set
    /// on the given presentation context.
    ///
    /// Returns a writer which automatically
    /// splits the data into separate PDUs if necessary.
    /// Fails if the association is not in data transfer
    /// or the presentation context was not accepted.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> Result<PDataWriter<&mut S>> {
        self.pdata_writer(presentation_context_id, PDataValueType::Data)
    }

    /// Prepare a P-Data writer for sending a command message.
    pub fn send_command_pdata(
        &mut self,
        presentation_context_id: u8,
    ) -> Result<PDataWriter<&mut S>> {
        self.pdata_writer(presentation_context_id, PDataValueType::Command)
    }

    fn pdata_writer(
        &mut self,
        presentation_context_id: u8,
        value_type: PDataValueType,
    ) -> Result<PDataWriter<&mut S>> {
        self.ensure_state(State::DataTransfer)?;
        self.ensure_presentation_context(presentation_context_id)?;
        Ok(PDataWriter::with_value_type(
            &mut self.transport,
            presentation_context_id,
            self.send_max_pdu_length,
            value_type,
        ))
    }

    /// Receive P-DATA-TF PDUs and pass them to the handler
    /// until one of the stop conditions is met,
    /// the handler asks to stop,
    /// or the peer releases the association.
    ///
    /// A release requested by the peer is answered
    /// and reported as [`WaitOutcome::Released`], which is not an error.
    /// Any other PDU aborts the association.
    pub fn wait_for_pdata_pdus(&mut self, condition: WaitCondition) -> Result<WaitOutcome> {
        self.ensure_state(State::DataTransfer)?;
        let mut handler = self.handler.take().context(MissingHandlerSnafu)?;
        let out = self.wait_impl(&mut *handler, condition);
        self.handler = Some(handler);
        out
    }

    /// Wait for a single P-DATA-TF PDU.
    pub fn wait_for_one_pdata_pdu(&mut self) -> Result<WaitOutcome> {
        self.wait_for_pdata_pdus(WaitCondition {
            max_pdus: Some(1),
            ..Default::default()
        })
    }

    /// Wait until a command message is complete.
    pub fn wait_for_command_pdata_pdus(&mut self) -> Result<WaitOutcome> {
        self.wait_for_pdata_pdus(WaitCondition {
            stop_after_command: true,
            ..Default::default()
        })
    }

    /// Wait until a data set message is complete.
    pub fn wait_for_data_pdata_pdus(&mut self) -> Result<WaitOutcome> {
        self.wait_for_pdata_pdus(WaitCondition {
            stop_after_data: true,
            ..Default::default()
        })
    }

    /// Wait until the handler asks to stop.
    pub fn wait_for_pdata_pdus_until_handler_done(&mut self) -> Result<WaitOutcome> {
        self.wait_for_pdata_pdus(WaitCondition::default())
    }

    fn wait_impl(
        &mut self,
        handler: &mut (dyn ReceivedDataHandler<S> + Send),
        condition: WaitCondition,
    ) -> Result<WaitOutcome> {
        let mut received = 0;
        loop {
            let data = match self.receive_pdu()? {
                Pdu::PData { data } => data,
                Pdu::ReleaseRQ => {
                    debug!(association = self.id, "Release requested by peer");
                    self.send_pdu(&Pdu::ReleaseRP)?;
                    self.state = State::AwaitingTransportClose;
                    self.artim.wait_for_close(&mut self.transport, &SystemClock);
                    self.close_transport();
                    return Ok(WaitOutcome::Released);
                }
                pdu => return Err(self.unexpected_pdu(pdu)),
            };

            received += 1;
            let command_done = data
                .iter()
                .any(|v| v.value_type == PDataValueType::Command && v.is_last);
            let data_done = data
                .iter()
                .any(|v| v.value_type == PDataValueType::Data && v.is_last);

            let control = match handler.on_pdata(self, data) {
                Ok(control) => control,
                Err(source) => {
                    warn!(association = self.id, "Received data handler failed: {}", source);
                    let _ = self.abort_impl(AbortRQSource::ServiceUser);
                    return Err(Error::Handler { source });
                }
            };
            self.ensure_state(State::DataTransfer)?;

            match control {
                HandlerControl::Continue => {}
                HandlerControl::StopCallerReleases => return Ok(WaitOutcome::Completed),
                HandlerControl::StopAndAutoRelease => {
                    self.release_impl()?;
                    return Ok(WaitOutcome::Released);
                }
            }

            if condition.max_pdus.map_or(false, |max| received >= max)
                || (condition.stop_after_command && command_done)
                || (condition.stop_after_data && data_done)
            {
                return Ok(WaitOutcome::Completed);
            }
        }
    }

    /// Gracefully terminate the association by exchanging release messages
    /// and then shutting down the connection.
    ///
    /// A release request from the peer crossing ours
    /// is answered and also ends in a normal release.
    pub fn release(mut self) -> Result<()> {
        let out = self.release_impl();
        self.close_transport();
        out
    }

    /// Send an abort message and shut down the connection,
    /// terminating the association.
    pub fn abort(mut self) -> Result<()> {
        self.ensure_state(State::DataTransfer)?;
        self.abort_impl(AbortRQSource::ServiceUser)
    }

    fn release_impl(&mut self) -> Result<()> {
        self.ensure_state(State::DataTransfer)?;
        self.send_pdu(&Pdu::ReleaseRQ)?;
        self.transition(State::AwaitingReleaseResponse);

        match self.receive_pdu()? {
            Pdu::ReleaseRP => {
                self.close_transport();
                Ok(())
            }
            Pdu::ReleaseRQ => {
                debug!(association = self.id, "Release collision");
                self.send_pdu(&Pdu::ReleaseRP)?;
                self.transition(State::AwaitingReleaseRequestEcho);
                self.await_collision_response();
                self.close_transport();
                Ok(())
            }
            pdu => Err(self.unexpected_pdu(pdu)),
        }
    }

    /// After a release collision,
    /// give the peer's release response up to the ARTIM timeout to arrive.
    fn await_collision_response(&mut self) {
        if let Err(e) = self.transport.set_read_timeout(Some(self.artim.timeout())) {
            debug!(association = self.id, "Could not set read timeout: {}", e);
        }
        match read_pdu(&mut self.transport, self.local_max_pdu_length, false) {
            Ok(Pdu::ReleaseRP) => trace!(association = self.id, "<< ReleaseRP"),
            Ok(pdu) => debug!(
                association = self.id,
                "Ignoring {} after release collision",
                pdu.short_description()
            ),
            Err(e) => debug!(association = self.id, "No release response after collision: {}", e),
        }
    }

    /// Send an A-ABORT, wait for the peer to close, and close the transport.
    fn abort_impl(&mut self, source: AbortRQSource) -> Result<()> {
        if self.transport_closed {
            return Ok(());
        }
        debug!(association = self.id, %source, "Aborting association");
        let out = self.send_pdu(&Pdu::AbortRQ { source });
        if !self.transport_closed {
            self.transition(State::AwaitingTransportClose);
            self.artim.wait_for_close(&mut self.transport, &SystemClock);
            self.close_transport();
        }
        out
    }

    /// Handle a PDU which is not valid in the current state.
    fn unexpected_pdu(&mut self, pdu: Pdu) -> Error {
        let state = self.state;
        match pdu {
            Pdu::AbortRQ { source } => {
                debug!(association = self.id, %source, "Association aborted by peer");
                self.close_transport();
                AbortedSnafu {
                    abort_source: source,
                }
                .build()
            }
            pdu @ Pdu::Unknown { .. } => {
                warn!(association = self.id, "Unrecognized PDU type {:#04x}", pdu.pdu_type());
                let _ = self.abort_impl(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnrecognizedPdu,
                ));
                UnknownPduSnafu { pdu: Box::new(pdu) }.build()
            }
            pdu => {
                warn!(
                    association = self.id,
                    ?state,
                    "Unexpected PDU {}",
                    pdu.short_description()
                );
                let _ = self.abort_impl(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ));
                UnexpectedPduSnafu {
                    pdu: Box::new(pdu),
                    state,
                }
                .build()
            }
        }
    }

    fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, pdu).context(EncodePduSnafu)?;
        trace!(association = self.id, ">> {}", pdu.short_description());
        let out = self
            .transport
            .write_all(&self.write_buffer)
            .and_then(|_| self.transport.flush());
        if let Err(e) = out {
            self.close_transport();
            return Err(e).context(WireSendSnafu);
        }
        Ok(())
    }

    fn receive_pdu(&mut self) -> Result<Pdu> {
        match read_pdu(&mut self.transport, self.local_max_pdu_length, self.strict) {
            Ok(pdu) => {
                trace!(association = self.id, "<< {}", pdu.short_description());
                Ok(pdu)
            }
            Err(e) if e.is_transport_failure() => {
                debug!(association = self.id, "Connection failed: {}", e);
                self.close_transport();
                Err(e).context(ReceivePduSnafu)
            }
            Err(e) => {
                warn!(association = self.id, "Malformed PDU received: {}", e);
                let _ = self.abort_impl(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                ));
                Err(e).context(ReceivePduSnafu)
            }
        }
    }

    fn ensure_state(&self, expected: State) -> Result<()> {
        ensure!(self.state == expected, InvalidStateSnafu { state: self.state });
        Ok(())
    }

    fn ensure_presentation_context(&self, id: u8) -> Result<()> {
        ensure!(
            self.presentation_contexts.iter().any(|pc| pc.id == id),
            UnknownPresentationContextSnafu { id }
        );
        Ok(())
    }

    fn transition(&mut self, state: State) {
        debug!(association = self.id, from = ?self.state, to = ?state, "State transition");
        self.state = state;
    }

    /// Close the transport, only once.
    fn close_transport(&mut self) {
        if !self.transport_closed {
            self.transport_closed = true;
            close_quietly(&mut self.transport, self.id);
        }
        if self.state != State::Closed {
            self.transition(State::Closed);
        }
    }
}

/// Abort the association if it is still in data transfer,
/// then shut down the connection.
impl<S> Drop for Association<S>
where
    S: Transport,
{
    fn drop(&mut self) {
        if self.state == State::DataTransfer {
            debug!(association = self.id, "Association dropped in data transfer");
            let _ = self.send_pdu(&Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            });
        }
        self.close_transport();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{PresentationContextResultReason, ReadError};
    use matches::assert_matches;
    use std::io::{Cursor, Read};
    use std::time::Duration;

    /// In-memory transport with scripted input.
    #[derive(Debug, Default)]
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
        closed: usize,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Transport for &mut Scripted {
        fn close(&mut self) -> std::io::Result<()> {
            self.closed += 1;
            Ok(())
        }

        fn poll_peer_closed(&mut self, _timeout: Duration) -> std::io::Result<bool> {
            Ok(true)
        }

        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn scripted(pdus: &[Pdu]) -> Scripted {
        let mut input = Vec::new();
        for pdu in pdus {
            write_pdu(&mut input, pdu).unwrap();
        }
        Scripted {
            input: Cursor::new(input),
            ..Default::default()
        }
    }

    fn association(transport: &mut Scripted) -> Association<&mut Scripted> {
        Association::new(
            Negotiated {
                id: next_association_id(),
                role: Role::Acceptor,
                presentation_contexts: vec![PresentationContextNegotiated {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    abstract_syntax: uid::VERIFICATION.to_string(),
                    transfer_syntax: uid::IMPLICIT_VR_LE.to_string(),
                }],
                role_selections: Vec::new(),
                local_max_pdu_length: 16_384,
                peer_max_pdu_length: 16_384,
                strict: true,
                local_ae_title: "THIS-SCP".to_string(),
                peer_ae_title: "THIS-SCU".to_string(),
                peer_user_variables: Vec::new(),
                artim: ArtimTimer::default(),
            },
            transport,
        )
    }

    fn written(output: &[u8]) -> Vec<Pdu> {
        let mut cursor = output;
        let mut pdus = Vec::new();
        while !cursor.is_empty() {
            pdus.push(read_pdu(&mut cursor, 0, false).unwrap());
        }
        pdus
    }

    fn command(is_last: bool) -> PDataValue {
        PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last,
            data: vec![0; 8],
        }
    }

    #[test]
    fn effective_max_lengths() {
        assert_eq!(effective_max_pdu_length(16_384, 32_768), 16_384);
        assert_eq!(effective_max_pdu_length(0, 32_768), 32_768);
        assert_eq!(effective_max_pdu_length(8_192, 0), 8_192);
        assert_eq!(effective_max_pdu_length(0, 0), MAXIMUM_PDU_SIZE);
    }

    #[test]
    fn association_ids_are_unique() {
        let a = next_association_id();
        let b = next_association_id();
        assert!(b > a);
    }

    #[test]
    fn send_rejects_odd_pdu_and_unknown_context() {
        let mut transport = scripted(&[]);
        {
            let mut association = association(&mut transport);
            assert_matches!(
                association.send(1, Some(&[1, 2, 3]), None),
                Err(Error::OddLengthPdu { length: 9, .. })
            );
            let err = association.send(3, Some(&[1, 2]), None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Usage);
            association.send(1, Some(&[1, 2]), Some(&[3, 4])).unwrap();
        }
        let pdus = written(&transport.output);
        // the PDU sent, then the abort from the drop
        assert_eq!(pdus.len(), 2);
        assert_matches!(&pdus[0], Pdu::PData { data } if data.len() == 2 && data.iter().all(|v| v.is_last));
        assert_eq!(
            pdus[1],
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser
            }
        );
        assert_eq!(transport.closed, 1);
    }

    #[test]
    fn pdata_writers_check_context_and_state() {
        let mut transport = scripted(&[]);
        {
            let mut association = association(&mut transport);
            assert_matches!(
                association.send_pdata(3),
                Err(Error::UnknownPresentationContext { id: 3, .. })
            );
            {
                let mut writer = association.send_command_pdata(1).unwrap();
                writer.write_all(&[1, 2, 3, 4]).unwrap();
                writer.finish().unwrap();
            }
            association.abort().unwrap();
        }
        let pdus = written(&transport.output);
        assert_eq!(pdus.len(), 2);
        assert_matches!(
            &pdus[0],
            Pdu::PData { data } if data.len() == 1
                && data[0].value_type == PDataValueType::Command
                && data[0].is_last
        );
        assert_eq!(transport.closed, 1);
    }

    #[test]
    fn wait_stops_after_command_and_on_release() {
        let mut transport = scripted(&[
            Pdu::PData {
                data: vec![command(false)],
            },
            Pdu::PData {
                data: vec![command(true)],
            },
            Pdu::ReleaseRQ,
        ]);
        {
            let mut association = association(&mut transport);
            let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
            let c = counter.clone();
            association.set_received_data_handler(
                move |_: &mut Association<&mut Scripted>,
                      values: Vec<PDataValue>|
                      -> Result<HandlerControl, HandlerError> {
                    c.fetch_add(values.len(), Ordering::SeqCst);
                    Ok(HandlerControl::Continue)
                },
            );
            assert_eq!(
                association.wait_for_command_pdata_pdus().unwrap(),
                WaitOutcome::Completed
            );
            assert_eq!(counter.load(Ordering::SeqCst), 2);
            assert_eq!(
                association.wait_for_one_pdata_pdu().unwrap(),
                WaitOutcome::Released
            );
            assert_eq!(association.state(), State::Closed);
        }
        assert_eq!(written(&transport.output), vec![Pdu::ReleaseRP]);
        assert_eq!(transport.closed, 1);
    }

    #[test]
    fn wait_without_handler_fails() {
        let mut transport = scripted(&[]);
        let mut association = association(&mut transport);
        assert_matches!(
            association.wait_for_one_pdata_pdu(),
            Err(Error::MissingHandler { .. })
        );
    }

    #[test]
    fn handler_failure_aborts() {
        let mut transport = scripted(&[Pdu::PData {
            data: vec![command(true)],
        }]);
        {
            let mut association = association(&mut transport);
            association.set_received_data_handler(
                |_: &mut Association<&mut Scripted>,
                 _: Vec<PDataValue>|
                 -> Result<HandlerControl, HandlerError> {
                    Err(HandlerError::from("cannot handle this"))
                },
            );
            let err = association.wait_for_one_pdata_pdu().unwrap_err();
            assert_matches!(err, Error::Handler { .. });
            assert_eq!(association.state(), State::Closed);
        }
        assert_eq!(
            written(&transport.output),
            vec![Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser
            }]
        );
        assert_eq!(transport.closed, 1);
    }

    #[test]
    fn unknown_pdu_aborts_with_unrecognized_pdu() {
        let mut transport = scripted(&[Pdu::Unknown {
            pdu_type: 0x42,
            data: vec![0; 4],
        }]);
        {
            let mut association = association(&mut transport);
            association.set_received_data_handler(
                |_: &mut Association<&mut Scripted>,
                 _: Vec<PDataValue>|
                 -> Result<HandlerControl, HandlerError> {
                    Ok(HandlerControl::Continue)
                },
            );
            let err = association.wait_for_one_pdata_pdu().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Aborted);
            assert!(err.is_abort_indication());
        }
        assert_eq!(
            written(&transport.output),
            vec![Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnrecognizedPdu
                )
            }]
        );
    }

    #[test]
    fn truncated_stream_is_a_transport_failure() {
        let mut transport = scripted(&[]);
        transport.input = Cursor::new(vec![0x04, 0x00, 0x00]);
        {
            let mut association = association(&mut transport);
            association.set_received_data_handler(
                |_: &mut Association<&mut Scripted>,
                 _: Vec<PDataValue>|
                 -> Result<HandlerControl, HandlerError> {
                    Ok(HandlerControl::Continue)
                },
            );
            let err = association.wait_for_one_pdata_pdu().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Transport);
            assert!(err.is_abort_indication());
            assert_matches!(
                err,
                Error::ReceivePdu {
                    source: ReadError::ConnectionClosed { .. }
                }
            );
        }
        // nothing sent, closed once
        assert!(transport.output.is_empty());
        assert_eq!(transport.closed, 1);
    }

    #[test]
    fn release_collision_is_a_normal_release() {
        let mut transport = scripted(&[Pdu::ReleaseRQ, Pdu::ReleaseRP]);
        association(&mut transport).release().unwrap();
        assert_eq!(
            written(&transport.output),
            vec![Pdu::ReleaseRQ, Pdu::ReleaseRP]
        );
        assert_eq!(transport.closed, 1);
    }

    #[test]
    fn data_while_awaiting_release_response_aborts() {
        let mut transport = scripted(&[Pdu::PData {
            data: vec![command(true)],
        }]);
        let err = association(&mut transport).release().unwrap_err();
        assert_matches!(
            err,
            Error::UnexpectedPdu {
                state: State::AwaitingReleaseResponse,
                ..
            }
        );
        assert_eq!(
            written(&transport.output),
            vec![
                Pdu::ReleaseRQ,
                Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu
                    )
                }
            ]
        );
        assert_eq!(transport.closed, 1);
    }

    #[test]
    fn abort_from_peer_during_release() {
        let mut transport = scripted(&[Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        }]);
        let err = association(&mut transport).release().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert_eq!(written(&transport.output), vec![Pdu::ReleaseRQ]);
        assert_eq!(transport.closed, 1);
    }
}
