//! Message passing between particle and fluid ranks.
//!
//! The engine talks to other ranks only through the [Transport] trait. Two
//! mechanisms are needed:
//!
//! - A one-sided request mailbox. Every rank owns a mailbox with one section of
//!   [Transport::mailbox_slots] slots per source rank. Requesters write the block ids
//!   they need into their section on the owner with a single bulk
//!   [Transport::put_requests]. The writes become visible after the collective
//!   [Transport::fence], after which the owner consumes them with
//!   [Transport::read_mailbox]. Reading resets the slots in place so that the
//!   mailbox can collect the next round's requests.
//! - Tagged non-blocking point to point messages carrying block headers and payloads.
//!
//! Backends are [local::LocalTransport] (ranks are threads of one process) and, with
//! the `mpi` feature, [mpi::MpiTransport].

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

use crate::{
    block::BlockHeader,
    error::TransportError,
    types::{BlockId, Tag},
};

/// A block id found in the own mailbox.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MailboxRequest {
    /// Rank that wrote the request.
    pub source: usize,
    /// Slot inside the source's section. Determines the reply tags.
    pub slot: usize,
    /// Requested block.
    pub block_id: BlockId,
}

/// Kind of a point to point message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A [BlockHeader].
    Header,
    /// A block payload.
    Payload,
}

impl MessageKind {
    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Header => "header",
            MessageKind::Payload => "payload",
        }
    }
}

/// A point to point message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Block header.
    Header(BlockHeader),
    /// Block payload.
    Payload(Vec<f64>),
}

impl Message {
    /// The kind of the message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Header(_) => MessageKind::Header,
            Message::Payload(_) => MessageKind::Payload,
        }
    }
}

/// Completion handle of a posted send.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SendHandle {
    /// Receiving rank.
    pub dest: usize,
    /// Message tag.
    pub tag: Tag,
}

/// Completion handle of a posted receive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecvHandle {
    /// Sending rank.
    pub source: usize,
    /// Message tag.
    pub tag: Tag,
    /// Expected kind.
    pub kind: MessageKind,
}

/// Tag of the header answering mailbox slot `slot`.
pub fn header_tag(slot: usize) -> Tag {
    (2 * slot) as Tag
}

/// Tag of the payload answering mailbox slot `slot`.
pub fn payload_tag(slot: usize) -> Tag {
    (2 * slot + 1) as Tag
}

/// Message layer used by the transfer engine.
pub trait Transport {
    /// Rank of this process.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Number of mailbox slots reserved for each source rank.
    fn mailbox_slots(&self) -> usize;

    /// Write `ids` into this rank's section of the mailbox on `dest`.
    ///
    /// The write is visible to `dest` after the next [Transport::fence].
    fn put_requests(&mut self, dest: usize, ids: &[BlockId]) -> Result<(), TransportError>;

    /// Collective fence completing all puts issued before it.
    fn fence(&mut self) -> Result<(), TransportError>;

    /// Consume all requests in the own mailbox, resetting the slots to empty.
    ///
    /// Requests are ordered by source rank and slot.
    fn read_mailbox(&mut self) -> Result<Vec<MailboxRequest>, TransportError>;

    /// Post a non-blocking send.
    fn post_send(
        &mut self,
        dest: usize,
        tag: Tag,
        message: Message,
    ) -> Result<SendHandle, TransportError>;

    /// Block until a posted send has completed.
    fn wait_send(&mut self, handle: SendHandle) -> Result<(), TransportError>;

    /// Post a non-blocking receive.
    fn post_receive(
        &mut self,
        source: usize,
        tag: Tag,
        kind: MessageKind,
    ) -> Result<RecvHandle, TransportError>;

    /// Test a posted receive without blocking.
    ///
    /// Returns the message once it has arrived. A handle must not be tested again
    /// after it returned a message.
    fn test_receive(&mut self, handle: &RecvHandle) -> Result<Option<Message>, TransportError>;

    /// Block until a posted receive has completed.
    fn wait_receive(&mut self, handle: &RecvHandle) -> Result<Message, TransportError>;

    /// Broadcast `values` from rank 0 to all ranks.
    fn broadcast(&mut self, values: &mut [i64]) -> Result<(), TransportError>;

    /// Collective logical or of `flag` over all ranks.
    fn any(&mut self, flag: bool) -> Result<bool, TransportError>;

    /// Terminate the whole run.
    fn abort(&self, code: i32) -> !;
}

/// Check that a received message has the expected kind.
pub(crate) fn expect_kind(
    handle: &RecvHandle,
    message: Message,
) -> Result<Message, TransportError> {
    if message.kind() == handle.kind {
        Ok(message)
    } else {
        Err(TransportError::UnexpectedMessage {
            expected: handle.kind.name(),
            source_rank: handle.source,
            tag: handle.tag,
        })
    }
}
