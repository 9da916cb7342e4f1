//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`AcceptorOptions`]
//! for details and examples on how to accept an association.
use std::borrow::Cow;
use std::fmt;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use snafu::{ensure, ResultExt};
use tracing::{debug, trace, warn};

use crate::association::uid::{trim_uid, APPLICATION_CONTEXT_NAME, IMPLICIT_VR_LE};
use crate::association::{
    close_quietly, next_association_id, send_final_pdu_and_close, send_pdu_on, ArtimTimer,
    Association, InvalidMaxPduSnafu, MissingAbstractSyntaxSnafu, Negotiated,
    NoAcceptedPresentationContextsSnafu, ReceivePduSnafu, RejectedSnafu, Result, Role,
    SetSocketOptionSnafu, State, Transport, UnexpectedPduSnafu, UnknownPduSnafu,
    UnsupportedProtocolVersionSnafu,
};
use crate::negotiation::{AcceptSupported, PresentationContextSelectionPolicy};
use crate::pdu::{
    max_length_of, read_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderASCEReason,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, Pdu,
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

#[cfg(feature = "sync-tls")]
use crate::association::transport::ServerTlsStream;

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association request
    /// based on the recorded application entity titles and/or user identity.
    ///
    /// Returns Ok(()) if the requester node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// that match the called AE title with the node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title.trim_end() {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

type SharedPolicy = Arc<dyn PresentationContextSelectionPolicy + Send + Sync>;

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// The options are prepared once and reused for every accepted connection,
/// possibly from several threads at once.
///
/// ## Presentation context selection
///
/// Unless a policy is given through
/// [`selection_policy`](Self::selection_policy),
/// proposed presentation contexts are accepted
/// when their abstract syntax was added with
/// [`with_abstract_syntax`](Self::with_abstract_syntax)
/// (or with any abstract syntax in [promiscuous](Self::promiscuous) mode),
/// choosing the first proposed transfer syntax
/// which was added with [`with_transfer_syntax`](Self::with_transfer_syntax).
/// Without any transfer syntaxes added,
/// the first one supported by the transfer syntax registry is chosen.
///
/// ## Access control
///
/// - By default, any requester is accepted ([`AcceptAny`]).
/// - [`accept_called_ae_title`](Self::accept_called_ae_title)
///   only accepts requests naming this node's AE title
///   ([`AcceptCalledAeTitle`]).
/// - Any other policy can be implemented through the [`AccessControl`] trait.
///
/// ## Example
///
/// ```no_run
/// # use std::net::{TcpListener, TcpStream};
/// # use dicom_ulp::association::{AcceptorOptions, Association, HandlerControl, HandlerError};
/// # use dicom_ulp::pdu::PDataValue;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("0.0.0.0:11111")?;
/// let options = AcceptorOptions::new()
///     .ae_title("STORE-SCP")
///     .with_abstract_syntax("1.2.840.10008.1.1");
///
/// for stream in listener.incoming() {
///     let stream = stream?;
///     let options = options.clone();
///     std::thread::spawn(move || -> Result<(), dicom_ulp::association::Error> {
///         let mut association = options.establish(stream)?;
///         association.set_received_data_handler(
///             |_: &mut Association<TcpStream>,
///              values: Vec<PDataValue>|
///              -> Result<HandlerControl, HandlerError> {
///                 println!("received {} values", values.len());
///                 Ok(HandlerControl::Continue)
///             },
///         );
///         association.wait_for_pdata_pdus_until_handler_done()?;
///         Ok(())
///     });
/// }
/// # Ok(())
/// # }
/// ```
pub struct AcceptorOptions<'a, A = AcceptAny> {
    /// the application entity access control policy
    access_control: Arc<A>,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of requested abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the list of requested transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// a custom presentation context selection policy
    selection_policy: Option<SharedPolicy>,
    protocol_version: u16,
    /// the maximum PDU length
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    artim: ArtimTimer,
    #[cfg(feature = "sync-tls")]
    tls_config: Option<Arc<rustls::ServerConfig>>,
}

impl<A> Clone for AcceptorOptions<'_, A> {
    fn clone(&self) -> Self {
        AcceptorOptions {
            access_control: Arc::clone(&self.access_control),
            ae_title: self.ae_title.clone(),
            application_context_name: self.application_context_name.clone(),
            abstract_syntax_uids: self.abstract_syntax_uids.clone(),
            transfer_syntax_uids: self.transfer_syntax_uids.clone(),
            promiscuous: self.promiscuous,
            selection_policy: self.selection_policy.clone(),
            protocol_version: self.protocol_version,
            max_pdu_length: self.max_pdu_length,
            strict: self.strict,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            artim: self.artim,
            #[cfg(feature = "sync-tls")]
            tls_config: self.tls_config.clone(),
        }
    }
}

impl<A> fmt::Debug for AcceptorOptions<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorOptions")
            .field("ae_title", &self.ae_title)
            .field("application_context_name", &self.application_context_name)
            .field("abstract_syntax_uids", &self.abstract_syntax_uids)
            .field("transfer_syntax_uids", &self.transfer_syntax_uids)
            .field("promiscuous", &self.promiscuous)
            .field("selection_policy", &self.selection_policy.is_some())
            .field("protocol_version", &self.protocol_version)
            .field("max_pdu_length", &self.max_pdu_length)
            .field("strict", &self.strict)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("artim", &self.artim)
            .finish_non_exhaustive()
    }
}

impl Default for AcceptorOptions<'_, AcceptAny> {
    fn default() -> Self {
        AcceptorOptions {
            access_control: Arc::new(AcceptAny),
            ae_title: "THIS-SCP".into(),
            application_context_name: APPLICATION_CONTEXT_NAME.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            promiscuous: false,
            selection_policy: None,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            read_timeout: None,
            write_timeout: None,
            artim: ArtimTimer::default(),
            #[cfg(feature = "sync-tls")]
            tls_config: None,
        }
    }
}

impl AcceptorOptions<'_, AcceptAny> {
    /// Create a new set of options for accepting associations.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> AcceptorOptions<'a, A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> AcceptorOptions<'a, AcceptAny> {
        self.access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> AcceptorOptions<'a, AcceptCalledAeTitle> {
        self.access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn access_control<P>(self, access_control: P) -> AcceptorOptions<'a, P>
    where
        P: AccessControl,
    {
        let AcceptorOptions {
            access_control: _,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            promiscuous,
            selection_policy,
            protocol_version,
            max_pdu_length,
            strict,
            read_timeout,
            write_timeout,
            artim,
            #[cfg(feature = "sync-tls")]
            tls_config,
        } = self;

        AcceptorOptions {
            access_control: Arc::new(access_control),
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            promiscuous,
            selection_policy,
            protocol_version,
            max_pdu_length,
            strict,
            read_timeout,
            write_timeout,
            artim,
            #[cfg(feature = "sync-tls")]
            tls_config,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
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

    /// Include this abstract syntax
    /// in the list of admitted abstract syntaxes.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax
    /// in the list of admitted transfer syntaxes.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Decide on proposed presentation contexts with this policy
    /// instead of the admitted syntax lists.
    pub fn selection_policy<P>(mut self, policy: P) -> Self
    where
        P: PresentationContextSelectionPolicy + Send + Sync + 'static,
    {
        self.selection_policy = Some(Arc::new(policy));
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

    /// Set the TLS configuration for accepted connections.
    #[cfg(feature = "sync-tls")]
    pub fn tls_config(mut self, config: impl Into<Arc<rustls::ServerConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Negotiate an association with the given TCP stream.
    pub fn establish(&self, socket: TcpStream) -> Result<Association<TcpStream>> {
        self.validate()?;
        self.configure_socket(&socket)?;
        self.negotiate(socket, next_association_id())
    }

    /// Negotiate an association over a transport which is already connected.
    pub fn establish_with<S: Transport>(&self, transport: S) -> Result<Association<S>> {
        self.validate()?;
        self.negotiate(transport, next_association_id())
    }

    /// Negotiate an association with the given TCP stream,
    /// using the given identifier in diagnostics.
    pub fn establish_with_id<S: Transport>(&self, transport: S, id: u64) -> Result<Association<S>> {
        self.validate()?;
        self.negotiate(transport, id)
    }

    /// Negotiate an association with the given TCP stream using TLS.
    #[cfg(feature = "sync-tls")]
    pub fn establish_tls(&self, socket: TcpStream) -> Result<Association<ServerTlsStream>> {
        use crate::association::{TlsConfigMissingSnafu, TlsSnafu};
        use snafu::OptionExt;

        self.validate()?;
        let tls_config = self.tls_config.clone().context(TlsConfigMissingSnafu)?;
        self.configure_socket(&socket)?;
        let conn = rustls::ServerConnection::new(tls_config).context(TlsSnafu)?;
        self.negotiate(rustls::StreamOwned::new(conn, socket), next_association_id())
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.selection_policy.is_some()
                || !self.abstract_syntax_uids.is_empty()
                || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );
        ensure!(
            self.max_pdu_length == 0
                || (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&self.max_pdu_length),
            InvalidMaxPduSnafu {
                max_pdu_length: self.max_pdu_length
            }
        );
        Ok(())
    }

    fn configure_socket(&self, socket: &TcpStream) -> Result<()> {
        socket
            .set_read_timeout(self.read_timeout)
            .context(SetSocketOptionSnafu)?;
        socket
            .set_write_timeout(self.write_timeout)
            .context(SetSocketOptionSnafu)
    }

    /// The policy deciding on proposed presentation contexts.
    fn policy(&self) -> SharedPolicy {
        if let Some(policy) = &self.selection_policy {
            return Arc::clone(policy);
        }
        let policy = self
            .abstract_syntax_uids
            .iter()
            .fold(AcceptSupported::new(), |p, uid| p.with_abstract_syntax(uid));
        let policy = self
            .transfer_syntax_uids
            .iter()
            .fold(policy, |p, uid| p.with_transfer_syntax(uid));
        Arc::new(policy.promiscuous(self.promiscuous))
    }

    fn negotiate<S: Transport>(&self, mut transport: S, id: u64) -> Result<Association<S>> {
        debug!(association = id, state = ?State::AwaitingAssociateRequest, "Awaiting association request");
        let pdu = match read_pdu(&mut transport, self.max_pdu_length, self.strict) {
            Ok(pdu) => pdu,
            Err(e) => {
                if e.is_transport_failure() {
                    close_quietly(&mut transport, id);
                } else {
                    warn!(association = id, "Malformed association request: {}", e);
                    self.abort(&mut transport, AbortRQServiceProviderReason::InvalidPduParameter, id);
                }
                return Err(e).context(ReceivePduSnafu);
            }
        };
        trace!(association = id, "<< {}", pdu.short_description());

        match pdu {
            Pdu::AssociationRQ(rq) => self.associate(rq, transport, id),
            pdu @ Pdu::Unknown { .. } => {
                self.abort(&mut transport, AbortRQServiceProviderReason::UnrecognizedPdu, id);
                UnknownPduSnafu { pdu: Box::new(pdu) }.fail()
            }
            Pdu::AbortRQ { source } => {
                debug!(association = id, "Aborted before association: {}", source);
                close_quietly(&mut transport, id);
                crate::association::AbortedSnafu {
                    abort_source: source,
                }
                .fail()
            }
            pdu => {
                warn!(association = id, "Unexpected request {}", pdu.short_description());
                self.abort(&mut transport, AbortRQServiceProviderReason::UnexpectedPdu, id);
                UnexpectedPduSnafu {
                    pdu: Box::new(pdu),
                    state: State::AwaitingAssociateRequest,
                }
                .fail()
            }
        }
    }

    fn abort<S: Transport>(&self, transport: &mut S, reason: AbortRQServiceProviderReason, id: u64) {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(reason),
        };
        send_final_pdu_and_close(transport, &pdu, &self.artim, id);
    }

    fn reject<S: Transport>(&self, transport: &mut S, source: AssociationRJSource, id: u64) -> AssociationRJ {
        debug!(association = id, "Rejecting association: {}", source);
        let association_rj = AssociationRJ {
            result: AssociationRJResult::Permanent,
            source,
        };
        send_final_pdu_and_close(
            transport,
            &Pdu::AssociationRJ(association_rj.clone()),
            &self.artim,
            id,
        );
        association_rj
    }

    fn associate<S: Transport>(&self, rq: AssociationRQ, mut transport: S, id: u64) -> Result<Association<S>> {
        if rq.protocol_version & 0x0001 == 0 {
            self.reject(
                &mut transport,
                AssociationRJSource::ServiceProviderASCE(
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
                ),
                id,
            );
            return UnsupportedProtocolVersionSnafu {
                version: rq.protocol_version,
            }
            .fail();
        }

        if trim_uid(rq.application_context_name.as_str().into()) != self.application_context_name {
            let association_rj = self.reject(
                &mut transport,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                ),
                id,
            );
            return RejectedSnafu { association_rj }.fail();
        }

        let user_identity = rq.user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityItem(user_identity) => Some(user_identity),
            _ => None,
        });
        if let Err(reason) = self.access_control.check_access(
            &self.ae_title,
            &rq.calling_ae_title,
            &rq.called_ae_title,
            user_identity,
        ) {
            let association_rj =
                self.reject(&mut transport, AssociationRJSource::ServiceUser(reason), id);
            return RejectedSnafu { association_rj }.fail();
        }

        let policy = self.policy();
        let results: Vec<PresentationContextResult> = rq
            .presentation_contexts
            .iter()
            .map(|pc| checked_result(pc, policy.select(pc), id))
            .collect();
        let presentation_contexts: Vec<PresentationContextNegotiated> = rq
            .presentation_contexts
            .iter()
            .zip(&results)
            .filter_map(|(pc, result)| {
                let transfer_syntax = result
                    .transfer_syntax
                    .as_deref()
                    .filter(|_| result.is_accepted())?;
                Some(PresentationContextNegotiated {
                    id: pc.id,
                    reason: result.reason,
                    abstract_syntax: trim_uid(pc.abstract_syntax.as_str().into()).into_owned(),
                    transfer_syntax: trim_uid(transfer_syntax.into()).into_owned(),
                })
            })
            .collect();

        if presentation_contexts.is_empty() {
            self.reject(
                &mut transport,
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven),
                id,
            );
            return NoAcceptedPresentationContextsSnafu.fail();
        }

        // roles are only answered for abstract syntaxes in accepted contexts
        let role_selections: Vec<_> = rq
            .user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(role) => Some(role),
                _ => None,
            })
            .filter(|role| {
                let abstract_syntax = trim_uid(role.abstract_syntax.as_str().into());
                presentation_contexts
                    .iter()
                    .any(|pc| pc.abstract_syntax == abstract_syntax)
            })
            .filter_map(|role| policy.select_role(role))
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        ];
        user_variables.extend(
            role_selections
                .iter()
                .cloned()
                .map(UserVariableItem::RoleSelection),
        );
        user_variables.push(UserVariableItem::ImplementationVersionName(
            IMPLEMENTATION_VERSION_NAME.to_string(),
        ));
        if user_identity.is_some_and(|identity| identity.positive_response_requested()) {
            user_variables.push(UserVariableItem::UserIdentityAccept(Vec::new()));
        }

        let ac = Pdu::AssociationAC(AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts: results,
            user_variables,
        });
        let mut buffer = Vec::new();
        if let Err(e) = send_pdu_on(&mut transport, &mut buffer, &ac, id) {
            close_quietly(&mut transport, id);
            return Err(e);
        }
        debug!(
            association = id,
            calling = %rq.calling_ae_title.trim_end(),
            contexts = presentation_contexts.len(),
            "Association accepted"
        );

        let peer_max_pdu_length = max_length_of(&rq.user_variables).unwrap_or(DEFAULT_MAX_PDU);
        Ok(Association::new(
            Negotiated {
                id,
                role: Role::Acceptor,
                presentation_contexts,
                role_selections,
                local_max_pdu_length: self.max_pdu_length,
                peer_max_pdu_length,
                strict: self.strict,
                local_ae_title: self.ae_title.to_string(),
                peer_ae_title: rq.calling_ae_title.trim_end().to_string(),
                peer_user_variables: rq.user_variables,
                artim: self.artim,
            },
            transport,
        ))
    }
}

/// Turn an acceptance without a proposed transfer syntax
/// into a transfer syntax rejection,
/// so that the answer sent always matches the negotiated contexts.
fn checked_result(
    pc: &PresentationContextProposed,
    result: PresentationContextResult,
    id: u64,
) -> PresentationContextResult {
    if !result.is_accepted() {
        return result;
    }
    let proposed = result.transfer_syntax.as_deref().map_or(false, |chosen| {
        let chosen = trim_uid(chosen.into());
        pc.transfer_syntaxes
            .iter()
            .any(|ts| trim_uid(ts.as_str().into()) == chosen)
    });
    if proposed {
        return result;
    }
    warn!(
        association = id,
        "Selection policy accepted context {} with transfer syntax {:?}, which was not proposed",
        pc.id,
        result.transfer_syntax
    );
    PresentationContextResult {
        id: result.id,
        reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
        transfer_syntax: Some(IMPLICIT_VR_LE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::uid::{EXPLICIT_VR_LE, VERIFICATION};
    use crate::association::{Error, ErrorKind};
    use crate::pdu::{write_pdu, RoleSelection};
    use matches::assert_matches;
    use std::io::Write;
    use std::net::TcpListener;

    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    fn request(user_variables: Vec<UserVariableItem>) -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "THIS-SCP".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: VERIFICATION.to_string(),
                    transfer_syntaxes: vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()],
                },
                PresentationContextProposed {
                    id: 3,
                    abstract_syntax: CT_IMAGE_STORAGE.to_string(),
                    transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
                },
            ],
            user_variables,
        }
    }

    fn options() -> AcceptorOptions<'static> {
        AcceptorOptions::new()
            .with_abstract_syntax(VERIFICATION)
            .artim_timeout(Duration::from_millis(500))
    }

    /// Send a PDU from a raw requester
    /// and collect what the acceptor answered.
    fn exchange<A>(options: &AcceptorOptions<'_, A>, pdu: Pdu) -> (Result<Association>, Pdu)
    where
        A: AccessControl,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requester = std::thread::spawn(move || {
            let mut socket = TcpStream::connect(addr).unwrap();
            let mut bytes = Vec::new();
            write_pdu(&mut bytes, &pdu).unwrap();
            socket.write_all(&bytes).unwrap();
            read_pdu(&mut socket, MAXIMUM_PDU_SIZE, true).unwrap()
        });
        let (socket, _) = listener.accept().unwrap();
        let outcome = options.establish(socket);
        let response = requester.join().unwrap();
        (outcome, response)
    }

    #[test]
    fn called_ae_title_access_control() {
        assert_eq!(
            AcceptCalledAeTitle.check_access("THIS-SCP", "SCU", "THIS-SCP", None),
            Ok(())
        );
        assert_eq!(
            AcceptCalledAeTitle.check_access("THIS-SCP", "SCU", "OTHER-SCP", None),
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        );
        assert_eq!(AcceptAny.check_access("A", "B", "C", None), Ok(()));
    }

    #[test]
    fn accepts_known_abstract_syntax_only() {
        let (outcome, response) = exchange(&options(), request(vec![]).into());
        let association = outcome.unwrap();
        assert_eq!(association.role(), Role::Acceptor);
        assert_eq!(association.peer_ae_title(), "STORE-SCU");
        assert_eq!(
            association.presentation_contexts(),
            &[PresentationContextNegotiated {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntax: EXPLICIT_VR_LE.to_string(),
            }]
        );
        // no maximum length given by the requester
        assert_eq!(association.peer_max_pdu_length(), DEFAULT_MAX_PDU);

        match response {
            Pdu::AssociationAC(ac) => {
                assert_eq!(ac.calling_ae_title, "STORE-SCU");
                assert_eq!(ac.called_ae_title, "THIS-SCP");
                assert_eq!(ac.presentation_contexts.len(), 2);
                assert_eq!(
                    ac.presentation_contexts[1].reason,
                    PresentationContextResultReason::AbstractSyntaxNotSupported
                );
                assert_eq!(max_length_of(&ac.user_variables), Some(DEFAULT_MAX_PDU));
            }
            pdu => panic!("Expected AssociationAC, got {:?}", pdu),
        }
    }

    #[test]
    fn rejects_unknown_protocol_version() {
        let mut rq = request(vec![]);
        rq.protocol_version = 2;
        let (outcome, response) = exchange(&options(), rq.into());
        assert_matches!(
            outcome,
            Err(Error::UnsupportedProtocolVersion { version: 2, .. })
        );
        assert_eq!(
            response,
            Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderASCE(
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported
                ),
            })
        );
    }

    #[test]
    fn rejects_other_application_context() {
        let mut rq = request(vec![]);
        rq.application_context_name = "1.2.3.4".to_string();
        let (outcome, response) = exchange(&options(), rq.into());
        let err = outcome.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_matches!(
            response,
            Pdu::AssociationRJ(AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported
                ),
                ..
            })
        );
    }

    #[test]
    fn rejects_wrong_called_ae_title() {
        let mut rq = request(vec![]);
        rq.called_ae_title = "SOMEONE-ELSE".to_string();
        let options = options().accept_called_ae_title();
        let (outcome, response) = exchange(&options, rq.into());
        assert_matches!(outcome, Err(Error::Rejected { .. }));
        assert_matches!(
            response,
            Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized
                ),
            })
        );
    }

    #[test]
    fn rejects_when_nothing_is_accepted() {
        let options = AcceptorOptions::new()
            .with_abstract_syntax("1.2.3.4.5")
            .artim_timeout(Duration::from_millis(500));
        let (outcome, response) = exchange(&options, request(vec![]).into());
        let err = outcome.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NegotiationFailed);
        assert_matches!(response, Pdu::AssociationRJ(_));
    }

    #[test]
    fn answers_roles_and_user_identity() {
        let rq = request(vec![
            UserVariableItem::MaxLength(32768),
            UserVariableItem::RoleSelection(RoleSelection::new(VERIFICATION, true, true)),
            UserVariableItem::RoleSelection(RoleSelection::new(CT_IMAGE_STORAGE, false, true)),
            UserVariableItem::UserIdentityItem(UserIdentity::username("doctor", true)),
        ]);
        let (outcome, response) = exchange(&options(), rq.into());
        let association = outcome.unwrap();
        assert_eq!(association.peer_max_pdu_length(), 32768);
        assert_eq!(
            association.role_selections(),
            &[RoleSelection::new(VERIFICATION, true, true)]
        );

        match response {
            Pdu::AssociationAC(ac) => {
                let roles: Vec<_> = ac
                    .user_variables
                    .iter()
                    .filter(|item| matches!(item, UserVariableItem::RoleSelection(_)))
                    .collect();
                assert_eq!(roles.len(), 1);
                assert!(ac
                    .user_variables
                    .contains(&UserVariableItem::UserIdentityAccept(Vec::new())));
            }
            pdu => panic!("Expected AssociationAC, got {:?}", pdu),
        }
    }

    #[test]
    fn custom_policy_takes_over() {
        struct RejectAll;

        impl PresentationContextSelectionPolicy for RejectAll {
            fn select(&self, proposed: &PresentationContextProposed) -> PresentationContextResult {
                PresentationContextResult {
                    id: proposed.id,
                    reason: PresentationContextResultReason::UserRejection,
                    transfer_syntax: Some(IMPLICIT_VR_LE.to_string()),
                }
            }
        }

        let options = options().selection_policy(RejectAll);
        let (outcome, _) = exchange(&options, request(vec![]).into());
        assert_matches!(outcome, Err(Error::NoAcceptedPresentationContexts { .. }));
    }

    #[test]
    fn acceptance_without_proposed_transfer_syntax_is_refused() {
        struct Careless;

        impl PresentationContextSelectionPolicy for Careless {
            fn select(&self, proposed: &PresentationContextProposed) -> PresentationContextResult {
                PresentationContextResult {
                    id: proposed.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: if proposed.id == 1 {
                        None
                    } else {
                        Some(IMPLICIT_VR_LE.to_string())
                    },
                }
            }
        }

        let options = options().selection_policy(Careless);
        let (outcome, response) = exchange(&options, request(vec![]).into());
        let association = outcome.unwrap();
        assert_eq!(
            association.presentation_contexts(),
            &[PresentationContextNegotiated {
                id: 3,
                reason: PresentationContextResultReason::Acceptance,
                abstract_syntax: CT_IMAGE_STORAGE.to_string(),
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            }]
        );
        match response {
            Pdu::AssociationAC(ac) => assert_eq!(
                ac.presentation_contexts,
                vec![
                    PresentationContextResult {
                        id: 1,
                        reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                        transfer_syntax: Some(IMPLICIT_VR_LE.to_string()),
                    },
                    PresentationContextResult {
                        id: 3,
                        reason: PresentationContextResultReason::Acceptance,
                        transfer_syntax: Some(IMPLICIT_VR_LE.to_string()),
                    },
                ]
            ),
            pdu => panic!("Expected AssociationAC, got {:?}", pdu),
        }
    }

    #[test]
    fn aborts_on_unexpected_first_pdu() {
        let (outcome, response) = exchange(&options(), Pdu::ReleaseRQ);
        assert_matches!(
            outcome,
            Err(Error::UnexpectedPdu {
                state: State::AwaitingAssociateRequest,
                ..
            })
        );
        assert_eq!(
            response,
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu)
            }
        );
    }

    #[test]
    fn options_need_something_to_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (socket, _) = listener.accept().unwrap();
        let err = AcceptorOptions::new().establish(socket).unwrap_err();
        assert_matches!(err, Error::MissingAbstractSyntax { .. });
    }

    #[test]
    fn options_are_shareable() {
        fn assert_send_sync<T: Clone + Send + Sync>() {}
        assert_send_sync::<AcceptorOptions<'static>>();
        assert_send_sync::<AcceptorOptions<'static, AcceptCalledAeTitle>>();
    }
}
