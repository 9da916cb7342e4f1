//! Protocol Data Unit module
//!
//! This module comprises the data structures representing
//! the seven protocol data units (PDUs) of the upper layer protocol
//! and their nested items and sub-items,
//! as well as the codec turning them into bytes and back.
//!
//! - [`encode_pdu`] and [`decode_pdu`] work on in-memory buffers.
//! - [`write_pdu`] and [`read_pdu`] work on byte streams,
//!   reading exactly one PDU at a time.
pub mod reader;
pub mod writer;

use std::fmt::Display;

pub use reader::{
    decode_pdu, read_pdu, Error as ReadError, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
    MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
pub use writer::{encode_pdu, write_pdu, Error as WriteError};

/// Message component for a proposed presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier
    pub id: u8,
    /// the expected abstract syntax UID
    /// (commonly referring to the expected SOP class)
    pub abstract_syntax: String,
    /// a list of transfer syntax UIDs to support in this interaction
    pub transfer_syntaxes: Vec<String>,
}

/// Message component for the acceptor's answer to a proposed presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier
    pub id: u8,
    /// the outcome for this presentation context
    pub reason: PresentationContextResultReason,
    /// the transfer syntax chosen by the acceptor,
    /// only significant if the presentation context was accepted
    pub transfer_syntax: Option<String>,
}

impl PresentationContextResult {
    /// Whether the acceptor accepted this presentation context.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

/// A presentation context as it stands after negotiation,
/// combining what was proposed with what was accepted.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier
    pub id: u8,
    /// the outcome of negotiation
    pub reason: PresentationContextResultReason,
    /// the abstract syntax UID of the original proposal
    pub abstract_syntax: String,
    /// the transfer syntax UID accepted for this context
    pub transfer_syntax: String,
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(reason: u8) -> Option<PresentationContextResultReason> {
        let result = match reason {
            0 => PresentationContextResultReason::Acceptance,
            1 => PresentationContextResultReason::UserRejection,
            2 => PresentationContextResultReason::NoReason,
            3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
            4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
            _ => {
                return None;
            }
        };

        Some(result)
    }
}

impl Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            PresentationContextResultReason::Acceptance => "acceptance",
            PresentationContextResultReason::UserRejection => "user rejection",
            PresentationContextResultReason::NoReason => "no reason",
            PresentationContextResultReason::AbstractSyntaxNotSupported => {
                "abstract syntax not supported"
            }
            PresentationContextResultReason::TransferSyntaxesNotSupported => {
                "transfer syntaxes not supported"
            }
        };
        f.write_str(msg)
    }
}

/// SCU/SCP role selection for one abstract syntax.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    /// the SOP class UID the roles refer to
    pub abstract_syntax: String,
    /// whether the SCU role is supported
    pub scu_role: bool,
    /// whether the SCP role is supported
    pub scp_role: bool,
}

impl RoleSelection {
    pub fn new(abstract_syntax: impl Into<String>, scu_role: bool, scp_role: bool) -> Self {
        RoleSelection {
            abstract_syntax: abstract_syntax.into(),
            scu_role,
            scp_role,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

impl AssociationRJResult {
    fn from(value: u8) -> Option<AssociationRJResult> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderASCE(AssociationRJServiceProviderASCEReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from(source: u8, reason: u8) -> Option<AssociationRJSource> {
        let result = match (source, reason) {
            (1, 1) => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven)
            }
            (1, 2) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
            (1, 3) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ),
            (1, 7) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
            (1, x @ (4..=6 | 8..=10)) => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::Reserved(x))
            }
            (2, 1) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::NoReasonGiven,
            ),
            (2, 2) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ),
            (3, 1) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            ),
            (3, 2) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
            (3, x @ (0 | 3..=7)) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            ),
            _ => {
                return None;
            }
        };
        Some(result)
    }

    /// The source and reason codes as they go on the wire.
    pub fn to_codes(&self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(reason) => {
                let code = match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(code) => *code,
                };
                (1, code)
            }
            AssociationRJSource::ServiceProviderASCE(reason) => {
                let code = match reason {
                    AssociationRJServiceProviderASCEReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => 2,
                };
                (2, code)
            }
            AssociationRJSource::ServiceProviderPresentation(reason) => {
                let code = match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
                };
                (3, code)
            }
        }
    }
}

impl Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderASCE(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderPresentation(r) => Display::fmt(r, f),
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

impl Display for AssociationRJServiceUserReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceUserReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                f.write_str("application context name not supported")
            }
            AssociationRJServiceUserReason::CallingAETitleNotRecognized => {
                f.write_str("calling AE title not recognized")
            }
            AssociationRJServiceUserReason::CalledAETitleNotRecognized => {
                f.write_str("called AE title not recognized")
            }
            AssociationRJServiceUserReason::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderASCEReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl Display for AssociationRJServiceProviderASCEReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderASCEReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => {
                f.write_str("protocol version not supported")
            }
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl Display for AssociationRJServiceProviderPresentationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                f.write_str("temporary congestion")
            }
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                f.write_str("local limit exceeded")
            }
            AssociationRJServiceProviderPresentationReason::Reserved(code) => {
                write!(f, "reserved code {}", code)
            }
        }
    }
}

/// A presentation data value (PDV),
/// one fragment of a command or data set message.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl PDataValue {
    /// The message control header byte of this fragment.
    pub(crate) fn control_header(&self) -> u8 {
        control_header(self.value_type, self.is_last)
    }
}

/// Build the message control header for a PDV fragment.
pub(crate) fn control_header(value_type: PDataValueType, is_last: bool) -> u8 {
    let mut header = 0x00;
    if value_type == PDataValueType::Command {
        header |= 0x01;
    }
    if is_last {
        header |= 0x02;
    }
    header
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    fn from(source: u8, reason: u8) -> Option<AbortRQSource> {
        let result = match (source, reason) {
            (0, _) => AbortRQSource::ServiceUser,
            (1, _) => AbortRQSource::Reserved,
            (2, 0) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::ReasonNotSpecified)
            }
            (2, 1) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnrecognizedPdu),
            (2, 2) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
            (2, 3) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::Reserved),
            (2, 4) => AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            ),
            (2, 5) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPduParameter)
            }
            (2, 6) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::InvalidPduParameter)
            }
            (_, _) => {
                return None;
            }
        };

        Some(result)
    }

    /// The source and reason codes as they go on the wire.
    pub fn to_codes(&self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => {
                let code = match reason {
                    AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                    AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                    AbortRQServiceProviderReason::UnexpectedPdu => 2,
                    AbortRQServiceProviderReason::Reserved => 3,
                    AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                    AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                    AbortRQServiceProviderReason::InvalidPduParameter => 6,
                };
                (2, code)
            }
        }
    }
}

impl Display for AbortRQSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortRQSource::ServiceUser => f.write_str("service user"),
            AbortRQSource::Reserved => f.write_str("reserved source"),
            AbortRQSource::ServiceProvider(reason) => write!(f, "service provider: {}", reason),
        }
    }
}

/// An enumeration of supported A-ABORT PDU provider reasons.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// Reason Not Specified
    ReasonNotSpecified,
    /// Unrecognized PDU
    UnrecognizedPdu,
    /// Unexpected PDU
    UnexpectedPdu,
    /// Reserved
    Reserved,
    /// Unrecognized PDU parameter
    UnrecognizedPduParameter,
    /// Unexpected PDU parameter
    UnexpectedPduParameter,
    /// Invalid PDU parameter
    InvalidPduParameter,
}

impl Display for AbortRQServiceProviderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AbortRQServiceProviderReason::ReasonNotSpecified => "reason not specified",
            AbortRQServiceProviderReason::UnrecognizedPdu => "unrecognized PDU",
            AbortRQServiceProviderReason::UnexpectedPdu => "unexpected PDU",
            AbortRQServiceProviderReason::Reserved => "reserved code",
            AbortRQServiceProviderReason::UnrecognizedPduParameter => "unrecognized PDU parameter",
            AbortRQServiceProviderReason::UnexpectedPduParameter => "unexpected PDU parameter",
            AbortRQServiceProviderReason::InvalidPduParameter => "invalid PDU parameter",
        };
        f.write_str(msg)
    }
}

/// A variable item of an A-ASSOCIATE-RQ or A-ASSOCIATE-AC PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduVariableItem {
    /// An item of unrecognized type, skipped when decoding
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// A sub-item of unrecognized type, kept as raw bytes
    Unknown(u8, Vec<u8>),
    MaxLength(u32),
    ImplementationClassUID(String),
    ImplementationVersionName(String),
    RoleSelection(RoleSelection),
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    UserIdentityItem(UserIdentity),
    /// The server response of user identity negotiation
    UserIdentityAccept(Vec<u8>),
}

/// User identity negotiation request parameters.
///
/// Text fields are stored as their UTF-8 bytes.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    /// Identify by user name only.
    pub fn username(username: &str, positive_response_requested: bool) -> Self {
        Self::new(
            positive_response_requested,
            UserIdentityType::Username,
            username.as_bytes().to_vec(),
            Vec::new(),
        )
    }

    /// Identify by user name and passcode.
    pub fn username_password(
        username: &str,
        password: &str,
        positive_response_requested: bool,
    ) -> Self {
        Self::new(
            positive_response_requested,
            UserIdentityType::UsernamePassword,
            username.as_bytes().to_vec(),
            password.as_bytes().to_vec(),
        )
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
#[non_exhaustive]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

impl UserIdentityType {
    fn from(user_identity_type: u8) -> Option<Self> {
        match user_identity_type {
            1 => Some(Self::Username),
            2 => Some(Self::UsernamePassword),
            3 => Some(Self::KerberosServiceTicket),
            4 => Some(Self::SamlAssertion),
            5 => Some(Self::Jwt),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePassword => 2,
            Self::KerberosServiceTicket => 3,
            Self::SamlAssertion => 4,
            Self::Jwt => 5,
        }
    }
}

/// An in-memory representation of a full Protocol Data Unit (PDU).
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub enum Pdu {
    /// Unrecognized PDU type
    Unknown { pdu_type: u8, data: Vec<u8> },
    /// Association request (A-ASSOCIATE-RQ)
    AssociationRQ(AssociationRQ),
    /// Association acknowledgement (A-ASSOCIATE-AC)
    AssociationAC(AssociationAC),
    /// Association rejection (A-ASSOCIATE-RJ)
    AssociationRJ(AssociationRJ),
    /// P-Data
    PData { data: Vec<PDataValue> },
    /// Association release request (A-RELEASE-RQ)
    ReleaseRQ,
    /// Association release reply (A-RELEASE-RP)
    ReleaseRP,
    /// Association abort request (A-ABORT)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// The PDU type code on the wire.
    pub fn pdu_type(&self) -> u8 {
        match self {
            Pdu::Unknown { pdu_type, .. } => *pdu_type,
            Pdu::AssociationRQ(_) => 0x01,
            Pdu::AssociationAC(_) => 0x02,
            Pdu::AssociationRJ(_) => 0x03,
            Pdu::PData { .. } => 0x04,
            Pdu::ReleaseRQ => 0x05,
            Pdu::ReleaseRP => 0x06,
            Pdu::AbortRQ { .. } => 0x07,
        }
    }

    /// Provide a short description of the PDU.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::Unknown { pdu_type, data } => {
                write!(
                    f,
                    "Unknown {{pdu_type: {}, data: {} bytes }}",
                    pdu_type,
                    data.len()
                )
            }
            Pdu::AssociationRQ(rq) => write!(
                f,
                "AssociationRQ {{ {} -> {}, {} presentation contexts }}",
                rq.calling_ae_title,
                rq.called_ae_title,
                rq.presentation_contexts.len()
            ),
            Pdu::AssociationAC(ac) => write!(
                f,
                "AssociationAC {{ {} presentation contexts }}",
                ac.presentation_contexts.len()
            ),
            Pdu::AssociationRJ { .. }
            | Pdu::ReleaseRQ
            | Pdu::ReleaseRP
            | Pdu::AbortRQ { .. } => std::fmt::Debug::fmt(self.0, f),
            Pdu::PData { data } => match data.as_slice() {
                [one] => write!(f, "PData [({:?}, {} bytes)]", one.value_type, one.data.len()),
                [one, two] => write!(
                    f,
                    "PData [({:?}, {} bytes), ({:?}, {} bytes)]",
                    one.value_type,
                    one.data.len(),
                    two.value_type,
                    two.data.len(),
                ),
                _ => write!(f, "PData [{} p-data values]", data.len()),
            },
        }
    }
}

/// An in-memory representation of an association request
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An in-memory representation of an association acknowledgement
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// Find the maximum length sub-item among the given user variables.
pub fn max_length_of(user_variables: &[UserVariableItem]) -> Option<u32> {
    user_variables.iter().find_map(|item| match item {
        UserVariableItem::MaxLength(len) => Some(*len),
        _ => None,
    })
}
