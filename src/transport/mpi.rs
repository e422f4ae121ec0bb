//! MPI transport.
//!
//! The request mailbox is realised with a fixed count all-to-all: every rank stages
//! its puts in an outbox with one section per destination, and the collective
//! exchange in [Transport::fence] delivers each section into the matching section of
//! the destination's mailbox. The collective doubles as the fence that closes the
//! round's puts.
//!
//! Block messages are buffered sends. They complete locally, so a rank that is both
//! fluid and particle owner can serve requests and wait for its own blocks without
//! ordering sends against receives. Receives are matched probes, which lets a
//! receive be tested without pinning a buffer for the duration of the round. A
//! send buffer large enough for a full round has to be attached with
//! [attach_send_buffer] before the first round.

use ::mpi::{
    collective::SystemOperation,
    environment::Universe,
    traits::{Communicator, CommunicatorCollectives, Destination, Root, Source},
};

use crate::{
    block::BlockHeader,
    config::StagingConfig,
    constants::{EMPTY_SLOT, RERUN_COORDINATOR},
    error::TransportError,
    types::{BlockId, Tag},
};

use super::{MailboxRequest, Message, MessageKind, RecvHandle, SendHandle, Transport};

/// Bytes reserved per buffered message on top of its data.
const BSEND_OVERHEAD: usize = 1024;

/// Attach a send buffer that holds every response a rank can send in one round.
///
/// A fluid rank answers at most `mailbox_slots` requests from every rank, each with a
/// header and a payload message.
pub fn attach_send_buffer(universe: &mut Universe, config: &StagingConfig, size: usize) {
    let per_block = config.max_block_bytes()
        + std::mem::size_of::<BlockHeader>()
        + 2 * BSEND_OVERHEAD;
    universe.set_buffer_size(size * config.max_requests_per_destination * per_block);
}

/// Transport over an MPI communicator.
pub struct MpiTransport<'c, C> {
    comm: &'c C,
    slots: usize,
    outbox: Vec<BlockId>,
    mailbox: Vec<BlockId>,
}

impl<'c, C: CommunicatorCollectives> MpiTransport<'c, C> {
    /// Create a transport over `comm` with `mailbox_slots` slots per source rank.
    pub fn new(comm: &'c C, mailbox_slots: usize) -> Self {
        let size = comm.size() as usize;
        Self {
            comm,
            slots: mailbox_slots,
            outbox: vec![EMPTY_SLOT; size * mailbox_slots],
            mailbox: vec![EMPTY_SLOT; size * mailbox_slots],
        }
    }

    fn check_rank(&self, rank: usize) -> Result<(), TransportError> {
        let size = self.comm.size() as usize;
        if rank < size {
            Ok(())
        } else {
            Err(TransportError::InvalidRank { rank, size })
        }
    }

    fn decode(handle: &RecvHandle, message: ::mpi::point_to_point::Message) -> Result<Message, TransportError> {
        match handle.kind {
            MessageKind::Header => {
                let (bytes, _status) = message.matched_receive_vec::<u8>();
                BlockHeader::from_bytes(&bytes)
                    .map(Message::Header)
                    .ok_or(TransportError::UnexpectedMessage {
                        expected: handle.kind.name(),
                        source_rank: handle.source,
                        tag: handle.tag,
                    })
            }
            MessageKind::Payload => {
                let (values, _status) = message.matched_receive_vec::<f64>();
                Ok(Message::Payload(values))
            }
        }
    }
}

impl<C: CommunicatorCollectives> Transport for MpiTransport<'_, C> {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn mailbox_slots(&self) -> usize {
        self.slots
    }

    fn put_requests(&mut self, dest: usize, ids: &[BlockId]) -> Result<(), TransportError> {
        self.check_rank(dest)?;
        if ids.len() > self.slots {
            return Err(TransportError::MailboxOverflow {
                count: ids.len(),
                slots: self.slots,
            });
        }
        let section = &mut self.outbox[dest * self.slots..(dest + 1) * self.slots];
        section[..ids.len()].copy_from_slice(ids);
        Ok(())
    }

    fn fence(&mut self) -> Result<(), TransportError> {
        self.comm.all_to_all_into(&self.outbox[..], &mut self.mailbox[..]);
        self.outbox.fill(EMPTY_SLOT);
        Ok(())
    }

    fn read_mailbox(&mut self) -> Result<Vec<MailboxRequest>, TransportError> {
        let slots = self.slots;
        let mut requests = Vec::new();
        for (position, entry) in self.mailbox.iter_mut().enumerate() {
            if *entry != EMPTY_SLOT {
                requests.push(MailboxRequest {
                    source: position / slots,
                    slot: position % slots,
                    block_id: *entry,
                });
                *entry = EMPTY_SLOT;
            }
        }
        Ok(requests)
    }

    fn post_send(
        &mut self,
        dest: usize,
        tag: Tag,
        message: Message,
    ) -> Result<SendHandle, TransportError> {
        self.check_rank(dest)?;
        let process = self.comm.process_at_rank(dest as i32);
        match &message {
            Message::Header(header) => process.buffered_send_with_tag(header.as_bytes(), tag),
            Message::Payload(values) => process.buffered_send_with_tag(&values[..], tag),
        }
        Ok(SendHandle { dest, tag })
    }

    fn wait_send(&mut self, _handle: SendHandle) -> Result<(), TransportError> {
        // Buffered sends complete locally.
        Ok(())
    }

    fn post_receive(
        &mut self,
        source: usize,
        tag: Tag,
        kind: MessageKind,
    ) -> Result<RecvHandle, TransportError> {
        self.check_rank(source)?;
        Ok(RecvHandle { source, tag, kind })
    }

    fn test_receive(&mut self, handle: &RecvHandle) -> Result<Option<Message>, TransportError> {
        let process = self.comm.process_at_rank(handle.source as i32);
        match process.immediate_matched_probe_with_tag(handle.tag) {
            Some((message, _status)) => Self::decode(handle, message).map(Some),
            None => Ok(None),
        }
    }

    fn wait_receive(&mut self, handle: &RecvHandle) -> Result<Message, TransportError> {
        let process = self.comm.process_at_rank(handle.source as i32);
        let (message, _status) = process.matched_probe_with_tag(handle.tag);
        Self::decode(handle, message)
    }

    fn broadcast(&mut self, values: &mut [i64]) -> Result<(), TransportError> {
        self.comm.process_at_rank(0).broadcast_into(values);
        Ok(())
    }

    fn any(&mut self, flag: bool) -> Result<bool, TransportError> {
        let coordinator = self.comm.process_at_rank(RERUN_COORDINATOR as i32);
        let mut result = false;
        if self.rank() == RERUN_COORDINATOR {
            coordinator.reduce_into_root(&flag, &mut result, SystemOperation::logical_or());
        } else {
            coordinator.reduce_into(&flag, SystemOperation::logical_or());
        }
        coordinator.broadcast_into(&mut result);
        Ok(result)
    }

    fn abort(&self, code: i32) -> ! {
        self.comm.abort(code)
    }
}
