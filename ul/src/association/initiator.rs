//! Association requester module
//!
//! The module provides the means to request an association
//! from another application entity.
//! See [`InitiatorOptions`]
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use snafu::{ensure, ResultExt};
use tracing::{debug, trace, warn};

use crate::association::uid::{trim_uid, APPLICATION_CONTEXT_NAME, EXPLICIT_VR_LE, IMPLICIT_VR_LE};
use crate::association::{
    close_quietly, next_association_id, send_final_pdu_and_close, AbortedSnafu, ArtimTimer,
    Association, ConnectSnafu, EncodePduSnafu, InvalidMaxPduSnafu, MissingAbstractSyntaxSnafu,
    Negotiated, NegotiationSnafu, NoAcceptedPresentationContextsSnafu, ReceivePduSnafu,
    RejectedSnafu, Result, Role, SetSocketOptionSnafu, State, Transport, UnexpectedPduSnafu,
    UnknownPduSnafu, UnsupportedProtocolVersionSnafu, WireSendSnafu,
};
use crate::negotiation::{Compression, PresentationContextProposer, ProposalStrategy};
use crate::pdu::{
    max_length_of, read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource,
    AssociationAC, AssociationRQ, Pdu, PresentationContextNegotiated,
    PresentationContextProposed, PresentationContextResult, RoleSelection, UserIdentity,
    UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

#[cfg(feature = "sync-tls")]
use crate::association::transport::ClientTlsStream;

/// One abstract syntax to propose through a proposal strategy.
#[derive(Debug, Clone)]
struct Proposal<'a> {
    abstract_syntax: Cow<'a, str>,
    known_transfer_syntax: Option<Cow<'a, str>>,
    compression: Compression,
    strategy: ProposalStrategy,
}

/// A DICOM association builder for a requesting node.
/// The final outcome is an [`Association`] in data transfer.
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use dicom_ulp::association::InitiatorOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = InitiatorOptions::new()
///    .calling_ae_title("STORE-SCU")
///    .called_ae_title("STORE-SCP")
///    .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"])
///    .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// either explicitly with
/// [`with_presentation_context`](Self::with_presentation_context),
/// with the default transfer syntaxes through
/// [`with_abstract_syntax`](Self::with_abstract_syntax),
/// or through a proposal strategy with [`with_proposal`](Self::with_proposal).
/// Presentation context identifiers are allocated in the order of these calls.
///
/// ```no_run
/// # use dicom_ulp::association::InitiatorOptions;
/// # use dicom_ulp::negotiation::{Compression, ProposalStrategy};
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = InitiatorOptions::new()
///     .with_proposal(
///         "1.2.840.10008.5.1.4.1.1.7",
///         Some("1.2.840.10008.1.2.1"),
///         Compression::Deflate,
///         ProposalStrategy::their_choice().and(ProposalStrategy::as_encoded()),
///     )
///     .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct InitiatorOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title
    called_ae_title: Cow<'a, str>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// presentation contexts given explicitly
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// abstract syntaxes proposed through a strategy
    proposals: Vec<Proposal<'a>>,
    role_selections: Vec<RoleSelection>,
    sop_class_extended_negotiation: Vec<(String, Vec<u8>)>,
    user_identity: Option<UserIdentity>,
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    connection_timeout: Option<Duration>,
    artim: ArtimTimer,
    association_id: Option<u64>,
    #[cfg(feature = "sync-tls")]
    tls_config: Option<std::sync::Arc<rustls::ClientConfig>>,
    #[cfg(feature = "sync-tls")]
    server_name: Option<Cow<'a, str>>,
}

impl Default for InitiatorOptions<'_> {
    fn default() -> Self {
        InitiatorOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: APPLICATION_CONTEXT_NAME.into(),
            presentation_contexts: Vec::new(),
            proposals: Vec::new(),
            role_selections: Vec::new(),
            sop_class_extended_negotiation: Vec::new(),
            user_identity: None,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            read_timeout: None,
            write_timeout: None,
            connection_timeout: None,
            artim: ArtimTimer::default(),
            association_id: None,
            #[cfg(feature = "sync-tls")]
            tls_config: None,
            #[cfg(feature = "sync-tls")]
            server_name: None,
        }
    }
}

impl<'a> InitiatorOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Override the application context name.
    pub fn application_context_name<T>(mut self, application_context_name: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.application_context_name = application_context_name.into();
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(t.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// _Explicit VR Little Endian_ and _Implicit VR Little Endian_
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec![EXPLICIT_VR_LE.into(), IMPLICIT_VR_LE.into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Propose this abstract syntax
    /// with the transfer syntaxes of the given compression level,
    /// building presentation contexts according to the strategy.
    ///
    /// `known_transfer_syntax` is the transfer syntax
    /// in which the data to send is already encoded, if any.
    pub fn with_proposal<T>(
        mut self,
        abstract_syntax_uid: T,
        known_transfer_syntax: Option<T>,
        compression: Compression,
        strategy: ProposalStrategy,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.proposals.push(Proposal {
            abstract_syntax: trim_uid(abstract_syntax_uid.into()),
            known_transfer_syntax: known_transfer_syntax.map(|ts| trim_uid(ts.into())),
            compression,
            strategy,
        });
        self
    }

    /// Propose an SCU/SCP role selection for an abstract syntax.
    pub fn with_role_selection(mut self, role_selection: RoleSelection) -> Self {
        self.role_selections.push(role_selection);
        self
    }

    /// Include SOP class extended negotiation information
    /// for an abstract syntax.
    pub fn with_sop_class_extended_negotiation(
        mut self,
        sop_class_uid: impl Into<String>,
        service_class_application_information: Vec<u8>,
    ) -> Self {
        self.sop_class_extended_negotiation
            .push((sop_class_uid.into(), service_class_application_information));
        self
    }

    /// Identify the user to the acceptor.
    pub fn user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Override the protocol version.
    pub fn protocol_version(mut self, protocol_version: u16) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    ///
    /// 0 stands for no limit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the read timeout for the underlying TCP socket.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout for the underlying TCP socket.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Set the timeout for establishing the TCP connection.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Override the ARTIM timeout.
    pub fn artim_timeout(mut self, timeout: Duration) -> Self {
        self.artim = ArtimTimer::new(timeout, self.artim.poll_interval());
        self
    }

    /// Override the interval between checks for the peer's closure
    /// while the ARTIM timer runs.
    pub fn artim_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.artim = ArtimTimer::new(self.artim.timeout(), poll_interval);
        self
    }

    /// Use this identifier for the association in diagnostics
    /// instead of a process-wide counter.
    pub fn association_id(mut self, id: u64) -> Self {
        self.association_id = Some(id);
        self
    }

    /// Set the TLS configuration for the connection.
    #[cfg(feature = "sync-tls")]
    pub fn tls_config(mut self, config: impl Into<std::sync::Arc<rustls::ClientConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Set the name of the server to verify in the TLS handshake.
    #[cfg(feature = "sync-tls")]
    pub fn server_name<T>(mut self, server_name: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.server_name = Some(server_name.into());
        self
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<Association<TcpStream>> {
        let request = self.prepare()?;
        let socket = self.connect(address, request.id)?;
        request.negotiate(socket)
    }

    /// Request a new DICOM association
    /// over a transport which is already connected.
    pub fn establish_with<S: Transport>(self, transport: S) -> Result<Association<S>> {
        self.prepare()?.negotiate(transport)
    }

    /// Initiate a TLS connection to the given address
    /// and request a new DICOM association over it.
    #[cfg(feature = "sync-tls")]
    pub fn establish_tls<A: ToSocketAddrs>(self, address: A) -> Result<Association<ClientTlsStream>> {
        use crate::association::{InvalidServerNameSnafu, TlsConfigMissingSnafu, TlsSnafu};
        use snafu::OptionExt;

        let tls_config = self.tls_config.clone().context(TlsConfigMissingSnafu)?;
        let name = self.server_name.as_deref().context(TlsConfigMissingSnafu)?;
        let server_name = rustls::pki_types::ServerName::try_from(name.to_string())
            .map_err(|_| InvalidServerNameSnafu { name }.build())?;

        let request = self.prepare()?;
        let socket = self.connect(address, request.id)?;
        let conn = rustls::ClientConnection::new(tls_config, server_name).context(TlsSnafu)?;
        request.negotiate(rustls::StreamOwned::new(conn, socket))
    }

    fn connect<A: ToSocketAddrs>(&self, address: A, id: u64) -> Result<TcpStream> {
        debug!(association = id, state = ?State::TransportConnecting, "Connecting");
        let socket = match self.connection_timeout {
            None => TcpStream::connect(address).context(ConnectSnafu)?,
            Some(timeout) => {
                let addresses: Vec<SocketAddr> =
                    address.to_socket_addrs().context(ConnectSnafu)?.collect();
                connect_any(&addresses, timeout).context(ConnectSnafu)?
            }
        };
        socket
            .set_read_timeout(self.read_timeout)
            .context(SetSocketOptionSnafu)?;
        socket
            .set_write_timeout(self.write_timeout)
            .context(SetSocketOptionSnafu)?;
        Ok(socket)
    }

    /// Build and encode the association request,
    /// so that nothing is sent if it is not valid.
    fn prepare(&self) -> Result<Request> {
        let id = self.association_id.unwrap_or_else(next_association_id);

        ensure!(
            self.max_pdu_length == 0
                || (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&self.max_pdu_length),
            InvalidMaxPduSnafu {
                max_pdu_length: self.max_pdu_length
            }
        );

        // presentation contexts represent intent,
        // they should not be omitted by the user
        ensure!(
            !self.presentation_contexts.is_empty() || !self.proposals.is_empty(),
            MissingAbstractSyntaxSnafu
        );

        let mut proposer = PresentationContextProposer::new();
        for (abstract_syntax, transfer_syntaxes) in &self.presentation_contexts {
            proposer
                .push(
                    abstract_syntax.to_string(),
                    transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
                )
                .context(NegotiationSnafu)?;
        }
        for proposal in &self.proposals {
            proposer
                .propose(
                    &proposal.abstract_syntax,
                    proposal.known_transfer_syntax.as_deref(),
                    proposal.compression,
                    proposal.strategy,
                )
                .context(NegotiationSnafu)?;
        }
        let proposed = proposer.into_contexts();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        ];
        user_variables.extend(
            self.role_selections
                .iter()
                .cloned()
                .map(UserVariableItem::RoleSelection),
        );
        user_variables.push(UserVariableItem::ImplementationVersionName(
            IMPLEMENTATION_VERSION_NAME.to_string(),
        ));
        user_variables.extend(
            self.sop_class_extended_negotiation
                .iter()
                .cloned()
                .map(|(uid, info)| UserVariableItem::SopClassExtendedNegotiationSubItem(uid, info)),
        );
        if let Some(user_identity) = &self.user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(user_identity.clone()));
        }

        let pdu = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts: proposed.clone(),
            user_variables,
        });
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, &pdu).context(EncodePduSnafu)?;
        trace!(association = id, "Prepared {}", pdu.short_description());

        Ok(Request {
            id,
            bytes,
            proposed,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            max_pdu_length: self.max_pdu_length,
            strict: self.strict,
            artim: self.artim,
        })
    }
}

fn connect_any(addresses: &[SocketAddr], timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect_timeout(address, timeout) {
            Ok(socket) => return Ok(socket),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "could not resolve to any address",
        )
    }))
}

/// An encoded association request ready to be sent.
#[derive(Debug)]
struct Request {
    id: u64,
    bytes: Vec<u8>,
    proposed: Vec<PresentationContextProposed>,
    calling_ae_title: String,
    called_ae_title: String,
    max_pdu_length: u32,
    strict: bool,
    artim: ArtimTimer,
}

impl Request {
    fn negotiate<S: Transport>(self, mut transport: S) -> Result<Association<S>> {
        let id = self.id;
        debug!(
            association = id,
            called = %self.called_ae_title,
            state = ?State::AwaitingAssociateResponse,
            "Requesting association"
        );
        let sent = transport
            .write_all(&self.bytes)
            .and_then(|_| transport.flush());
        if let Err(e) = sent {
            close_quietly(&mut transport, id);
            return Err(e).context(WireSendSnafu);
        }

        let pdu = match read_pdu(&mut transport, MAXIMUM_PDU_SIZE, self.strict) {
            Ok(pdu) => pdu,
            Err(e) => {
                if e.is_transport_failure() {
                    close_quietly(&mut transport, id);
                } else {
                    warn!(association = id, "Malformed association response: {}", e);
                    self.abort(&mut transport, AbortRQServiceProviderReason::InvalidPduParameter);
                }
                return Err(e).context(ReceivePduSnafu);
            }
        };
        trace!(association = id, "<< {}", pdu.short_description());

        match pdu {
            Pdu::AssociationAC(ac) => self.accepted(ac, transport),
            Pdu::AssociationRJ(association_rj) => {
                debug!(association = id, "Association rejected: {}", association_rj.source);
                close_quietly(&mut transport, id);
                RejectedSnafu { association_rj }.fail()
            }
            Pdu::AbortRQ { source } => {
                debug!(association = id, "Association aborted: {}", source);
                close_quietly(&mut transport, id);
                AbortedSnafu {
                    abort_source: source,
                }
                .fail()
            }
            pdu @ Pdu::Unknown { .. } => {
                self.abort(&mut transport, AbortRQServiceProviderReason::UnrecognizedPdu);
                UnknownPduSnafu { pdu: Box::new(pdu) }.fail()
            }
            pdu => {
                warn!(association = id, "Unexpected response {}", pdu.short_description());
                self.abort(&mut transport, AbortRQServiceProviderReason::UnexpectedPdu);
                UnexpectedPduSnafu {
                    pdu: Box::new(pdu),
                    state: State::AwaitingAssociateResponse,
                }
                .fail()
            }
        }
    }

    fn abort<S: Transport>(&self, transport: &mut S, reason: AbortRQServiceProviderReason) {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(reason),
        };
        send_final_pdu_and_close(transport, &pdu, &self.artim, self.id);
    }

    fn accepted<S: Transport>(self, ac: AssociationAC, mut transport: S) -> Result<Association<S>> {
        let id = self.id;
        if ac.protocol_version & 0x0001 == 0 {
            self.abort(&mut transport, AbortRQServiceProviderReason::InvalidPduParameter);
            return UnsupportedProtocolVersionSnafu {
                version: ac.protocol_version,
            }
            .fail();
        }

        let peer_max_pdu_length = max_length_of(&ac.user_variables).unwrap_or(DEFAULT_MAX_PDU);
        let presentation_contexts =
            negotiated_contexts(&self.proposed, &ac.presentation_contexts, id);
        if presentation_contexts.is_empty() {
            let pdu = Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            };
            send_final_pdu_and_close(&mut transport, &pdu, &self.artim, id);
            return NoAcceptedPresentationContextsSnafu.fail();
        }

        let role_selections = ac
            .user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(role) => Some(role.clone()),
                _ => None,
            })
            .collect();

        Ok(Association::new(
            Negotiated {
                id,
                role: Role::Requestor,
                presentation_contexts,
                role_selections,
                local_max_pdu_length: self.max_pdu_length,
                peer_max_pdu_length,
                strict: self.strict,
                local_ae_title: self.calling_ae_title,
                peer_ae_title: self.called_ae_title,
                peer_user_variables: ac.user_variables,
                artim: self.artim,
            },
            transport,
        ))
    }
}

/// Match the acceptor's answers with the proposed presentation contexts,
/// keeping the accepted ones.
fn negotiated_contexts(
    proposed: &[PresentationContextProposed],
    results: &[PresentationContextResult],
    id: u64,
) -> Vec<PresentationContextNegotiated> {
    results
        .iter()
        .filter(|result| result.is_accepted())
        .filter_map(|result| {
            let Some(proposal) = proposed.iter().find(|pc| pc.id == result.id) else {
                warn!(
                    association = id,
                    "Acceptor answered presentation context {} which was not proposed", result.id
                );
                return None;
            };
            let transfer_syntax = trim_uid(result.transfer_syntax.as_deref()?.into()).into_owned();
            if !proposal
                .transfer_syntaxes
                .iter()
                .any(|ts| trim_uid(ts.as_str().into()) == transfer_syntax)
            {
                warn!(
                    association = id,
                    "Acceptor chose transfer syntax {} which was not proposed for context {}",
                    transfer_syntax,
                    result.id
                );
                return None;
            }
            Some(PresentationContextNegotiated {
                id: result.id,
                reason: result.reason,
                abstract_syntax: proposal.abstract_syntax.clone(),
                transfer_syntax,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{Error, ErrorKind};
    use crate::pdu::PresentationContextResultReason;
    use matches::assert_matches;
    use std::io::{Cursor, Read};
    use std::net::TcpListener;

    const A: &str = "1.2.840.10008.5.1.4.1.1.2";

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

    #[test]
    fn malformed_response_aborts_with_invalid_parameter() {
        // an A-ASSOCIATE-AC too short for its fixed fields
        let mut transport = Scripted {
            input: Cursor::new(vec![0x02, 0, 0, 0, 0, 4, 0, 1, 0, 0]),
            ..Default::default()
        };
        let err = InitiatorOptions::new()
            .with_abstract_syntax(A)
            .establish_with(&mut transport)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decoding);
        assert_matches!(err, Error::ReceivePdu { .. });

        // the request, then the abort
        let mut cursor = &transport.output[..];
        assert_matches!(
            read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, true).unwrap(),
            Pdu::AssociationRQ(_)
        );
        assert_eq!(
            read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, true).unwrap(),
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter
                )
            }
        );
        assert!(cursor.is_empty());
        assert_eq!(transport.closed, 1);
    }

    #[test]
    fn only_accepted_and_proposed_contexts_remain() {
        let proposed = vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: A.to_string(),
                transfer_syntaxes: vec![EXPLICIT_VR_LE.to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: A.to_string(),
                transfer_syntaxes: vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()],
            },
        ];
        let results = vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                transfer_syntax: Some(IMPLICIT_VR_LE.to_string()),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: Some(format!("{}\0", IMPLICIT_VR_LE)),
            },
            // never proposed
            PresentationContextResult {
                id: 5,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: Some(IMPLICIT_VR_LE.to_string()),
            },
        ];

        let negotiated = negotiated_contexts(&proposed, &results, 0);
        assert_eq!(
            negotiated,
            vec![PresentationContextNegotiated {
                id: 3,
                reason: PresentationContextResultReason::Acceptance,
                abstract_syntax: A.to_string(),
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            }]
        );
    }

    #[test]
    fn long_ae_title_fails_before_connecting() {
        // nothing listens here, but no connection should be attempted
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let err = InitiatorOptions::new()
            .calling_ae_title("SEVENTEEN-CHARS-X")
            .with_abstract_syntax(A)
            .establish(address)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encoding);
        assert_matches!(err, Error::EncodePdu { .. });
    }

    #[test]
    fn options_are_validated() {
        let err = InitiatorOptions::new().establish("127.0.0.1:1").unwrap_err();
        assert_matches!(err, Error::MissingAbstractSyntax { .. });

        let err = InitiatorOptions::new()
            .with_abstract_syntax(A)
            .max_pdu_length(100)
            .establish("127.0.0.1:1")
            .unwrap_err();
        assert_matches!(err, Error::InvalidMaxPdu { max_pdu_length: 100, .. });
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn request_carries_contexts_in_allocation_order() {
        let request = InitiatorOptions::new()
            .with_abstract_syntax(A)
            .with_proposal(
                "1.2.840.10008.1.1",
                None,
                Compression::None,
                ProposalStrategy::our_choice(),
            )
            .with_role_selection(RoleSelection::new(A, true, true))
            .prepare()
            .unwrap();
        let ids: Vec<u8> = request.proposed.iter().map(|pc| pc.id).collect();
        assert_eq!(ids, vec![1, 3, 5, 7]);

        let mut cursor = &request.bytes[..];
        match read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, true).unwrap() {
            Pdu::AssociationRQ(rq) => {
                assert_eq!(rq.calling_ae_title, "THIS-SCU");
                assert_eq!(rq.called_ae_title, "ANY-SCP");
                assert_eq!(rq.presentation_contexts, request.proposed);
                assert_eq!(max_length_of(&rq.user_variables), Some(DEFAULT_MAX_PDU));
                assert!(rq
                    .user_variables
                    .contains(&UserVariableItem::RoleSelection(RoleSelection::new(A, true, true))));
            }
            pdu => panic!("Expected AssociationRQ, got {:?}", pdu),
        }
    }
}
