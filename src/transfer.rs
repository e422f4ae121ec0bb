//! Block request and response protocol.
//!
//! A round has two halves. Particle ranks take the front of their request queues,
//! put the ids into the owners' mailboxes and post a header and a payload receive
//! for every id. After the collective fence the fluid ranks read their mailboxes,
//! pack every requested block and send header and payload back, tagged by the
//! mailbox slot the request occupied.

use log::{debug, trace};

use crate::{
    block::BlockHeader,
    cache::BlockCache,
    constants::VECTOR_LENGTH,
    error::{StagingError, StagingResult, TransportError},
    fluid::FluidField,
    spatial_index::SpatialIndex,
    transport::{header_tag, payload_tag, Message, MessageKind, RecvHandle, SendHandle, Transport},
    types::{BlockId, SubDomainId},
};

/// Header and payload of a completed receive.
#[derive(Debug)]
pub struct ArrivedBlock {
    /// Block header.
    pub header: BlockHeader,
    /// Block payload.
    pub payload: Vec<f64>,
}

/// An outstanding receive of one block.
#[derive(Debug)]
pub struct InFlightTransfer {
    block_id: BlockId,
    header_handle: RecvHandle,
    payload_handle: RecvHandle,
    header: Option<BlockHeader>,
    payload: Option<Vec<f64>>,
}

impl InFlightTransfer {
    /// True once header and payload have arrived.
    pub fn is_complete(&self) -> bool {
        self.header.is_some() && self.payload.is_some()
    }

    /// Move header and payload out of a completed transfer.
    ///
    /// Fails if the payload does not hold a whole number of at least
    /// [VECTOR_LENGTH] component fields of the size given by the header.
    pub fn take_arrived(&mut self) -> Result<Option<ArrivedBlock>, TransportError> {
        if !self.is_complete() {
            return Ok(None);
        }
        let (Some(header), Some(payload)) = (self.header.take(), self.payload.take()) else {
            return Ok(None);
        };

        let cells = header
            .block_size
            .iter()
            .try_fold(1_usize, |cells, &v| {
                usize::try_from(v).ok().and_then(|v| cells.checked_mul(v))
            })
            .unwrap_or(0);
        if cells == 0 || payload.len() % cells != 0 || payload.len() / cells < VECTOR_LENGTH {
            return Err(TransportError::Backend(format!(
                "payload of {} values from rank {} does not fit block {} of size {:?}",
                payload.len(),
                self.header_handle.source,
                self.block_id,
                header.block_size
            )));
        }

        Ok(Some(ArrivedBlock { header, payload }))
    }

    fn store(&mut self, message: Message) -> Result<(), TransportError> {
        match message {
            Message::Header(header) => {
                if header.block_id != self.block_id {
                    return Err(TransportError::Backend(format!(
                        "header for block {} from rank {} answers the request for block {}",
                        header.block_id, self.header_handle.source, self.block_id
                    )));
                }
                self.header = Some(header);
            }
            Message::Payload(payload) => self.payload = Some(payload),
        }
        Ok(())
    }
}

/// An outstanding send of one block.
#[derive(Debug)]
pub struct OutgoingTransfer {
    block_id: BlockId,
    header_handle: SendHandle,
    payload_handle: SendHandle,
}

/// Result of a request submission.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Submission {
    /// Number of requested blocks.
    pub submitted: usize,
    /// True if at least one queue held more ids than the per-round cap.
    pub need_rerun: bool,
}

/// Drives the non-blocking request and response protocol.
pub struct TransferEngine {
    max_per_destination: usize,
    vector_length: usize,
    fluid_rank_offset: usize,
    subdomain_count: usize,
    receives: Vec<InFlightTransfer>,
    sends: Vec<OutgoingTransfer>,
}

impl TransferEngine {
    /// Create an engine requesting at most `max_per_destination` blocks per rank and round.
    ///
    /// Subdomain `s` is served by rank `fluid_rank_offset + s`. Served fields may have
    /// at most `vector_length` components, the size the receivers budget their caches for.
    pub fn new(
        max_per_destination: usize,
        fluid_rank_offset: usize,
        subdomain_count: usize,
        vector_length: usize,
    ) -> Self {
        Self {
            max_per_destination,
            vector_length,
            fluid_rank_offset,
            subdomain_count,
            receives: Vec::new(),
            sends: Vec::new(),
        }
    }

    /// Rank serving a subdomain.
    pub fn rank_of_subdomain(&self, subdomain_id: SubDomainId) -> usize {
        self.fluid_rank_offset + subdomain_id as usize
    }

    /// Subdomain served by a rank, if the rank is a fluid rank.
    pub fn subdomain_of_rank(&self, rank: usize) -> Option<SubDomainId> {
        rank.checked_sub(self.fluid_rank_offset)
            .filter(|&s| s < self.subdomain_count)
            .map(|s| s as SubDomainId)
    }

    /// Number of receives that have not completed.
    pub fn pending_receives(&self) -> usize {
        self.receives.len()
    }

    /// Number of sends not yet drained.
    pub fn pending_sends(&self) -> usize {
        self.sends.len()
    }

    /// Request the front of every request queue and post the matching receives.
    ///
    /// Queues are deduplicated first. At most `max_per_destination` ids (and never
    /// more than the mailbox holds) are taken from each queue, the rest waits for the
    /// next round and raises [Submission::need_rerun].
    pub fn submit_requests_and_post_receives<T: Transport>(
        &mut self,
        transport: &mut T,
        cache: &mut BlockCache,
    ) -> Result<Submission, TransportError> {
        let cap = self.max_per_destination.min(transport.mailbox_slots());
        let mut submission = Submission::default();
        cache.dedup_queues();

        for subdomain in 0..self.subdomain_count {
            let (ids, remaining) = cache.take_requests(subdomain as SubDomainId, cap);
            submission.need_rerun |= remaining;
            if ids.is_empty() {
                continue;
            }

            let dest = self.rank_of_subdomain(subdomain as SubDomainId);
            transport.put_requests(dest, &ids)?;

            for (slot, &block_id) in ids.iter().enumerate() {
                let header_handle =
                    transport.post_receive(dest, header_tag(slot), MessageKind::Header)?;
                let payload_handle =
                    transport.post_receive(dest, payload_tag(slot), MessageKind::Payload)?;
                self.receives.push(InFlightTransfer {
                    block_id,
                    header_handle,
                    payload_handle,
                    header: None,
                    payload: None,
                });
            }

            trace!(
                "rank {}: requested {} blocks from rank {} (more queued: {})",
                transport.rank(),
                ids.len(),
                dest,
                remaining
            );
            submission.submitted += ids.len();
        }

        Ok(submission)
    }

    /// Serve the requests found in the own mailbox.
    ///
    /// Must be called after the fence closing the round's puts. Every requested block
    /// is packed from `field` with its halo and sent to the requester. Returns the
    /// number of blocks sent.
    pub fn pack_and_send<T: Transport>(
        &mut self,
        transport: &mut T,
        index: &SpatialIndex,
        field: Option<&FluidField>,
    ) -> StagingResult<usize> {
        let requests = transport.read_mailbox()?;
        if requests.is_empty() {
            return Ok(0);
        }

        let own_subdomain = self.subdomain_of_rank(transport.rank());
        let field = match (field, own_subdomain) {
            (Some(field), _) => field,
            (None, subdomain) => {
                return Err(StagingError::MissingFluidField {
                    subdomain: subdomain.unwrap_or(-1),
                })
            }
        };

        if field.vector_length() > self.vector_length {
            return Err(StagingError::FieldShape {
                subdomain: field.subdomain_id(),
                found: field.vector_length(),
                expected: self.vector_length,
            });
        }

        for request in &requests {
            if !index.is_valid_block(request.block_id)
                || index.find_subdomain_id_by_block(request.block_id) != field.subdomain_id()
            {
                return Err(StagingError::BlockOutsideSubdomain {
                    block: request.block_id,
                    subdomain: field.subdomain_id(),
                });
            }

            let geometry = index.block_geometry(request.block_id);
            let payload = field.pack_block(&geometry);
            let header = BlockHeader::new(&geometry, index.halo(), index.pitch());

            let header_handle =
                transport.post_send(request.source, header_tag(request.slot), Message::Header(header))?;
            let payload_handle = transport.post_send(
                request.source,
                payload_tag(request.slot),
                Message::Payload(payload),
            )?;
            self.sends.push(OutgoingTransfer {
                block_id: request.block_id,
                header_handle,
                payload_handle,
            });
        }

        debug!(
            "rank {}: serving {} block requests",
            transport.rank(),
            requests.len()
        );
        Ok(requests.len())
    }

    /// Advance one outstanding receive.
    ///
    /// While `budget` is positive every missing message is tested without blocking
    /// and each unsuccessful test uses up one unit of the budget. Once the budget is
    /// exhausted the missing messages are waited for. Returns true if the block has
    /// fully arrived.
    pub fn poll_or_wait<T: Transport>(
        transport: &mut T,
        transfer: &mut InFlightTransfer,
        budget: &mut usize,
    ) -> Result<bool, TransportError> {
        for handle in [transfer.header_handle, transfer.payload_handle] {
            let missing = match handle.kind {
                MessageKind::Header => transfer.header.is_none(),
                MessageKind::Payload => transfer.payload.is_none(),
            };
            if !missing {
                continue;
            }

            if *budget > 0 {
                match transport.test_receive(&handle)? {
                    Some(message) => transfer.store(message)?,
                    None => *budget -= 1,
                }
            } else {
                let message = transport.wait_receive(&handle)?;
                transfer.store(message)?;
            }
        }
        Ok(transfer.is_complete())
    }

    /// Poll every outstanding receive once and return the blocks that completed.
    ///
    /// Blocks are returned in the order their completion was observed.
    pub fn poll_arrivals<T: Transport>(
        &mut self,
        transport: &mut T,
        budget: &mut usize,
    ) -> Result<Vec<ArrivedBlock>, TransportError> {
        let mut arrived = Vec::new();
        let mut pending = Vec::with_capacity(self.receives.len());

        for mut transfer in self.receives.drain(..) {
            if Self::poll_or_wait(transport, &mut transfer, budget)? {
                arrived.extend(transfer.take_arrived()?);
            } else {
                pending.push(transfer);
            }
        }

        self.receives = pending;
        Ok(arrived)
    }

    /// Wait for every outstanding send and receive and release them.
    ///
    /// Returns the blocks of receives that were still outstanding.
    pub fn drain_and_free<T: Transport>(
        &mut self,
        transport: &mut T,
    ) -> Result<Vec<ArrivedBlock>, TransportError> {
        let mut budget = 0;
        let mut arrived = Vec::with_capacity(self.receives.len());
        for mut transfer in self.receives.drain(..) {
            Self::poll_or_wait(transport, &mut transfer, &mut budget)?;
            arrived.extend(transfer.take_arrived()?);
        }

        for transfer in self.sends.drain(..) {
            transport.wait_send(transfer.header_handle)?;
            transport.wait_send(transfer.payload_handle)?;
            trace!(
                "rank {}: block {} delivered to rank {}",
                transport.rank(),
                transfer.block_id,
                transfer.header_handle.dest
            );
        }

        Ok(arrived)
    }
}
