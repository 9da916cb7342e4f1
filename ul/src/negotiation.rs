//! Presentation context negotiation
//!
//! This module covers both ends of negotiation:
//!
//! - the requester builds the presentation contexts to propose
//!   with a [`PresentationContextProposer`],
//!   then picks one of the accepted contexts with
//!   [`select_suitable_context_id`] or [`select_exact_context_id`];
//! - the acceptor answers each proposal through a
//!   [`PresentationContextSelectionPolicy`],
//!   [`AcceptSupported`] being the default one.
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, Backtrace, OptionExt, Snafu};

use crate::association::uid::{
    self, trim_uid, BZIP2_EXPLICIT_VR_LE, DEFLATED_EXPLICIT_VR_LE, EXPLICIT_VR_BE,
    EXPLICIT_VR_LE, IMPLICIT_VR_LE, LOSSLESS_TRANSFER_SYNTAXES, LOSSY_TRANSFER_SYNTAXES,
};
use crate::pdu::{
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// too many presentation contexts
    TooManyPresentationContexts { backtrace: Backtrace },

    #[snafu(display("no presentation context proposed for abstract syntax {}", abstract_syntax))]
    NoProposal {
        abstract_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("no presentation context for abstract syntax {}", abstract_syntax))]
    NoPresentationContext {
        abstract_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "no presentation context for abstract syntax {} with transfer syntax {}",
        abstract_syntax,
        transfer_syntax
    ))]
    NoExactPresentationContext {
        abstract_syntax: String,
        transfer_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid compression level {} (must be 0 to 4)", level))]
    InvalidCompressionLevel { level: u8, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How much compression the requester is willing to propose.
///
/// Each level includes the transfer syntaxes of the levels below it.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Compression {
    /// uncompressed transfer syntaxes only
    #[default]
    None = 0,
    /// add deflated explicit VR little endian
    Deflate = 1,
    /// add bzip2 compressed explicit VR little endian
    Bzip2 = 2,
    /// add lossless pixel data compression
    Lossless = 3,
    /// add lossy pixel data compression
    Lossy = 4,
}

impl TryFrom<u8> for Compression {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Deflate),
            2 => Ok(Compression::Bzip2),
            3 => Ok(Compression::Lossless),
            4 => Ok(Compression::Lossy),
            _ => InvalidCompressionLevelSnafu { level }.fail(),
        }
    }
}

impl Compression {
    /// The candidate transfer syntaxes at this level,
    /// in order of preference.
    pub fn transfer_syntaxes(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self >= Compression::Bzip2 {
            out.push(BZIP2_EXPLICIT_VR_LE);
        }
        if self >= Compression::Deflate {
            out.push(DEFLATED_EXPLICIT_VR_LE);
        }
        out.extend([EXPLICIT_VR_LE, IMPLICIT_VR_LE, EXPLICIT_VR_BE]);
        if self >= Compression::Lossless {
            out.extend(LOSSLESS_TRANSFER_SYNTAXES);
        }
        if self >= Compression::Lossy {
            out.extend(LOSSY_TRANSFER_SYNTAXES);
        }
        out
    }
}

/// Which presentation contexts to propose for one abstract syntax.
/// The strategies can be combined.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct ProposalStrategy {
    /// one context listing every candidate transfer syntax,
    /// leaving the choice to the acceptor
    pub their_choice: bool,
    /// one context with only the transfer syntax
    /// in which the data is already encoded
    pub as_encoded: bool,
    /// one context per candidate transfer syntax,
    /// so that the requester chooses after negotiation
    pub our_choice: bool,
}

impl Default for ProposalStrategy {
    fn default() -> Self {
        ProposalStrategy {
            their_choice: true,
            as_encoded: false,
            our_choice: false,
        }
    }
}

impl ProposalStrategy {
    pub fn their_choice() -> Self {
        Self::default()
    }

    pub fn as_encoded() -> Self {
        ProposalStrategy {
            their_choice: false,
            as_encoded: true,
            our_choice: false,
        }
    }

    pub fn our_choice() -> Self {
        ProposalStrategy {
            their_choice: false,
            as_encoded: false,
            our_choice: true,
        }
    }

    /// Combine with another strategy.
    pub fn and(self, other: ProposalStrategy) -> Self {
        ProposalStrategy {
            their_choice: self.their_choice || other.their_choice,
            as_encoded: self.as_encoded || other.as_encoded,
            our_choice: self.our_choice || other.our_choice,
        }
    }
}

/// Allocator of presentation context identifiers:
/// odd numbers from 1 up to 255, never reused.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContextIdAllocator {
    next: u16,
}

impl Default for ContextIdAllocator {
    fn default() -> Self {
        ContextIdAllocator { next: 1 }
    }
}

impl ContextIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Result<u8> {
        ensure!(self.next <= 255, TooManyPresentationContextsSnafu);
        let id = self.next as u8;
        self.next += 2;
        Ok(id)
    }
}

/// Builder of the presentation contexts proposed in an association request.
///
/// ```
/// # use dicom_ulp::negotiation::{Compression, PresentationContextProposer, ProposalStrategy};
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut proposer = PresentationContextProposer::new();
/// let ids = proposer.propose(
///     "1.2.840.10008.5.1.4.1.1.7",
///     Some("1.2.840.10008.1.2.1"),
///     Compression::None,
///     ProposalStrategy::their_choice().and(ProposalStrategy::as_encoded()),
/// )?;
/// assert_eq!(ids, vec![1, 3]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct PresentationContextProposer {
    ids: ContextIdAllocator,
    contexts: Vec<PresentationContextProposed>,
}

impl PresentationContextProposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one presentation context with an explicit list of transfer syntaxes,
    /// returning its identifier.
    pub fn push(
        &mut self,
        abstract_syntax: impl Into<String>,
        transfer_syntaxes: Vec<String>,
    ) -> Result<u8> {
        let id = self.ids.allocate()?;
        self.contexts.push(PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes,
        });
        Ok(id)
    }

    /// Add the presentation contexts for one abstract syntax
    /// following the given strategy,
    /// returning the identifiers allocated.
    ///
    /// `known_transfer_syntax` is the transfer syntax
    /// in which the data to send is already encoded, if any.
    pub fn propose(
        &mut self,
        abstract_syntax: &str,
        known_transfer_syntax: Option<&str>,
        compression: Compression,
        strategy: ProposalStrategy,
    ) -> Result<Vec<u8>> {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(ts) = known_transfer_syntax {
            candidates.push(ts.to_string());
        }
        for ts in compression.transfer_syntaxes() {
            if !candidates.iter().any(|c| c == ts) {
                candidates.push(ts.to_string());
            }
        }

        let mut ids = Vec::new();
        if strategy.their_choice {
            ids.push(self.push(abstract_syntax, candidates.clone())?);
        }
        if strategy.as_encoded {
            if let Some(ts) = known_transfer_syntax {
                ids.push(self.push(abstract_syntax, vec![ts.to_string()])?);
            }
        }
        if strategy.our_choice {
            for ts in candidates {
                ids.push(self.push(abstract_syntax, vec![ts])?);
            }
        }

        ensure!(!ids.is_empty(), NoProposalSnafu { abstract_syntax });
        Ok(ids)
    }

    /// The presentation contexts proposed so far.
    pub fn contexts(&self) -> &[PresentationContextProposed] {
        &self.contexts
    }

    pub fn into_contexts(self) -> Vec<PresentationContextProposed> {
        self.contexts
    }
}

/// Preference of a negotiated transfer syntax, lower is better.
fn preference(transfer_syntax: &str) -> u8 {
    let ts = transfer_syntax.trim_end_matches('\0');
    if ts == BZIP2_EXPLICIT_VR_LE {
        0
    } else if ts == DEFLATED_EXPLICIT_VR_LE {
        1
    } else if uid::is_explicit_vr_little_endian(ts) {
        2
    } else if uid::is_explicit_vr(ts) {
        3
    } else {
        4
    }
}

fn accepted_for<'a>(
    contexts: &'a [PresentationContextNegotiated],
    abstract_syntax: &'a str,
) -> impl Iterator<Item = &'a PresentationContextNegotiated> {
    let abstract_syntax = trim_uid(abstract_syntax.into());
    contexts.iter().filter(move |pc| {
        pc.reason == PresentationContextResultReason::Acceptance
            && trim_uid(pc.abstract_syntax.as_str().into()) == abstract_syntax
    })
}

/// Choose the best accepted presentation context for the abstract syntax.
///
/// Transfer syntaxes are preferred in this order:
/// bzip2 compressed, deflated, explicit VR little endian,
/// explicit VR in any byte order, and then anything else.
pub fn select_suitable_context_id(
    contexts: &[PresentationContextNegotiated],
    abstract_syntax: &str,
) -> Result<u8> {
    accepted_for(contexts, abstract_syntax)
        .min_by_key(|pc| preference(&pc.transfer_syntax))
        .map(|pc| pc.id)
        .context(NoPresentationContextSnafu { abstract_syntax })
}

/// Find the accepted presentation context with exactly
/// this abstract syntax and transfer syntax.
pub fn select_exact_context_id(
    contexts: &[PresentationContextNegotiated],
    abstract_syntax: &str,
    transfer_syntax: &str,
) -> Result<u8> {
    let wanted = trim_uid(transfer_syntax.into());
    accepted_for(contexts, abstract_syntax)
        .find(|pc| trim_uid(pc.transfer_syntax.as_str().into()) == wanted)
        .map(|pc| pc.id)
        .context(NoExactPresentationContextSnafu {
            abstract_syntax,
            transfer_syntax,
        })
}

/// Decision logic of an association acceptor
/// over the presentation contexts proposed to it.
pub trait PresentationContextSelectionPolicy {
    /// Accept or reject one proposed presentation context.
    fn select(&self, proposed: &PresentationContextProposed) -> PresentationContextResult;

    /// Answer a role selection proposed for an accepted abstract syntax.
    /// Returning `None` leaves it out of the response,
    /// which means that only the default roles apply.
    fn select_role(&self, proposed: &RoleSelection) -> Option<RoleSelection> {
        Some(proposed.clone())
    }
}

/// The default selection policy:
/// accept known abstract syntaxes
/// with the first proposed transfer syntax that is supported.
///
/// Transfer syntaxes are admitted
/// if they were explicitly listed,
/// or, when none were listed,
/// if they are supported by the main transfer syntax registry.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct AcceptSupported {
    abstract_syntax_uids: Vec<String>,
    transfer_syntax_uids: Vec<String>,
    promiscuous: bool,
}

impl AcceptSupported {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include this abstract syntax in the list of admitted ones.
    pub fn with_abstract_syntax(mut self, abstract_syntax_uid: impl AsRef<str>) -> Self {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.as_ref().into()).into_owned());
        self
    }

    /// Include this transfer syntax in the list of admitted ones.
    pub fn with_transfer_syntax(mut self, transfer_syntax_uid: impl AsRef<str>) -> Self {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.as_ref().into()).into_owned());
        self
    }

    /// Accept any abstract syntax.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    pub fn abstract_syntax_uids(&self) -> &[String] {
        &self.abstract_syntax_uids
    }

    pub fn is_promiscuous(&self) -> bool {
        self.promiscuous
    }

    fn choose_ts<'a>(&self, proposed: &'a [String]) -> Option<&'a String> {
        if self.transfer_syntax_uids.is_empty() {
            return choose_supported(proposed);
        }

        proposed.iter().find(|ts| {
            let ts = trim_uid(ts.as_str().into());
            self.transfer_syntax_uids.iter().any(|uid| *uid == ts)
        })
    }
}

impl PresentationContextSelectionPolicy for AcceptSupported {
    fn select(&self, proposed: &PresentationContextProposed) -> PresentationContextResult {
        let abstract_syntax = trim_uid(proposed.abstract_syntax.as_str().into());
        if !self.promiscuous && !self.abstract_syntax_uids.iter().any(|uid| *uid == abstract_syntax)
        {
            return PresentationContextResult {
                id: proposed.id,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: Some(IMPLICIT_VR_LE.to_string()),
            };
        }

        match self.choose_ts(&proposed.transfer_syntaxes) {
            Some(ts) => PresentationContextResult {
                id: proposed.id,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: Some(ts.clone()),
            },
            None => PresentationContextResult {
                id: proposed.id,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                transfer_syntax: Some(IMPLICIT_VR_LE.to_string()),
            },
        }
    }
}

/// Check that a transfer syntax repository
/// supports the given transfer syntax,
/// meaning that it can parse and decode DICOM data sets.
///
/// ```
/// # use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
/// # use dicom_ulp::negotiation::is_supported_with_repo;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported_with_repo(TransferSyntaxRegistry, "1.2.840.10008.1.2"));
/// ```
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// Check that the main transfer syntax registry
/// supports the given transfer syntax.
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}

/// From a sequence of transfer syntaxes,
/// choose the first transfer syntax to be supported
/// by the main transfer syntax registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter()
        .find(|ts| is_supported(&trim_uid(ts.as_ref().into())))
}
