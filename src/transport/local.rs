//! In-process transport.
//!
//! Every rank is a thread of the same process. All ranks of a group share a fabric
//! holding the mailboxes, the in-flight messages and a barrier used for the
//! collective operations. Sends are buffered in the fabric and complete immediately.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Barrier},
};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::{
    constants::{EMPTY_SLOT, RERUN_COORDINATOR},
    error::TransportError,
    types::{BlockId, Tag},
};

use super::{
    expect_kind, MailboxRequest, Message, MessageKind, RecvHandle, SendHandle, Transport,
};

struct Fabric {
    size: usize,
    slots: usize,
    mailboxes: Vec<Mutex<Vec<BlockId>>>,
    messages: Mutex<HashMap<(usize, usize, Tag), VecDeque<Message>>>,
    delivered: Condvar,
    barrier: Barrier,
    flags: Mutex<Vec<bool>>,
    rerun: Mutex<bool>,
    broadcast: Mutex<Vec<i64>>,
}

/// One rank of an in-process transport group.
pub struct LocalTransport {
    rank: usize,
    fabric: Arc<Fabric>,
}

impl LocalTransport {
    /// Create a group of `size` connected ranks.
    ///
    /// Each rank's mailbox has `mailbox_slots` slots per source rank. The returned
    /// transports are meant to be moved into one thread each.
    pub fn group(size: usize, mailbox_slots: usize) -> Vec<LocalTransport> {
        assert!(size > 0, "a transport group needs at least one rank");
        let fabric = Arc::new(Fabric {
            size,
            slots: mailbox_slots,
            mailboxes: (0..size)
                .map(|_| Mutex::new(vec![EMPTY_SLOT; size * mailbox_slots]))
                .collect(),
            messages: Mutex::new(HashMap::new()),
            delivered: Condvar::new(),
            barrier: Barrier::new(size),
            flags: Mutex::new(vec![false; size]),
            rerun: Mutex::new(false),
            broadcast: Mutex::new(Vec::new()),
        });

        (0..size)
            .map(|rank| LocalTransport {
                rank,
                fabric: fabric.clone(),
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> Result<(), TransportError> {
        if rank < self.fabric.size {
            Ok(())
        } else {
            Err(TransportError::InvalidRank {
                rank,
                size: self.fabric.size,
            })
        }
    }

    fn take_message(&self, handle: &RecvHandle) -> Option<Message> {
        let mut messages = self.fabric.messages.lock();
        let key = (handle.source, self.rank, handle.tag);
        let queue = messages.get_mut(&key)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            messages.remove(&key);
        }
        message
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.size
    }

    fn mailbox_slots(&self) -> usize {
        self.fabric.slots
    }

    fn put_requests(&mut self, dest: usize, ids: &[BlockId]) -> Result<(), TransportError> {
        self.check_rank(dest)?;
        let slots = self.fabric.slots;
        if ids.len() > slots {
            return Err(TransportError::MailboxOverflow {
                count: ids.len(),
                slots,
            });
        }

        let mut mailbox = self.fabric.mailboxes[dest].lock();
        let section = &mut mailbox[self.rank * slots..(self.rank + 1) * slots];
        section[..ids.len()].copy_from_slice(ids);
        trace!("rank {}: put {} requests to rank {}", self.rank, ids.len(), dest);
        Ok(())
    }

    fn fence(&mut self) -> Result<(), TransportError> {
        self.fabric.barrier.wait();
        Ok(())
    }

    fn read_mailbox(&mut self) -> Result<Vec<MailboxRequest>, TransportError> {
        let slots = self.fabric.slots;
        let mut mailbox = self.fabric.mailboxes[self.rank].lock();

        let mut requests = Vec::new();
        for (position, entry) in mailbox.iter_mut().enumerate() {
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
        let mut messages = self.fabric.messages.lock();
        messages
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(message);
        self.fabric.delivered.notify_all();
        Ok(SendHandle { dest, tag })
    }

    fn wait_send(&mut self, _handle: SendHandle) -> Result<(), TransportError> {
        // Sends are buffered by the fabric.
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
        self.take_message(handle)
            .map(|message| expect_kind(handle, message))
            .transpose()
    }

    fn wait_receive(&mut self, handle: &RecvHandle) -> Result<Message, TransportError> {
        let key = (handle.source, self.rank, handle.tag);
        let mut messages = self.fabric.messages.lock();
        loop {
            if let Some(queue) = messages.get_mut(&key) {
                if let Some(message) = queue.pop_front() {
                    if queue.is_empty() {
                        messages.remove(&key);
                    }
                    return expect_kind(handle, message);
                }
            }
            self.fabric.delivered.wait(&mut messages);
        }
    }

    fn broadcast(&mut self, values: &mut [i64]) -> Result<(), TransportError> {
        if self.rank == 0 {
            *self.fabric.broadcast.lock() = values.to_vec();
        }
        self.fabric.barrier.wait();
        if self.rank != 0 {
            let root = self.fabric.broadcast.lock();
            if root.len() != values.len() {
                return Err(TransportError::Backend(format!(
                    "broadcast of {} values into a buffer of {}",
                    root.len(),
                    values.len()
                )));
            }
            values.copy_from_slice(&root);
        }
        self.fabric.barrier.wait();
        Ok(())
    }

    fn any(&mut self, flag: bool) -> Result<bool, TransportError> {
        // Every rank puts its flag into a slot of the coordinator. After the fence the
        // coordinator reduces the slots and publishes the result. The last barrier
        // keeps the next round's puts away from the reads.
        self.fabric.flags.lock()[self.rank] = flag;
        self.fabric.barrier.wait();
        if self.rank == RERUN_COORDINATOR {
            let flags = self.fabric.flags.lock();
            trace!("rank {}: collected rerun flags {:?}", self.rank, *flags);
            *self.fabric.rerun.lock() = flags.iter().any(|&f| f);
        }
        self.fabric.barrier.wait();
        let result = *self.fabric.rerun.lock();
        self.fabric.barrier.wait();
        Ok(result)
    }

    fn abort(&self, code: i32) -> ! {
        log::error!("rank {}: aborting with code {}", self.rank, code);
        std::process::abort()
    }
}

#[cfg(test)]
mod test {
    use super::LocalTransport;
    use crate::{
        block::BlockHeader,
        error::TransportError,
        transport::{MailboxRequest, Message, MessageKind, Transport},
    };

    #[test]
    fn test_single_rank_mailbox() {
        let mut transport = LocalTransport::group(1, 4).pop().unwrap();

        transport.put_requests(0, &[7, 3]).unwrap();
        transport.fence().unwrap();

        let requests = transport.read_mailbox().unwrap();
        assert_eq!(
            requests,
            vec![
                MailboxRequest {
                    source: 0,
                    slot: 0,
                    block_id: 7
                },
                MailboxRequest {
                    source: 0,
                    slot: 1,
                    block_id: 3
                },
            ]
        );

        // Reading resets the slots.
        assert!(transport.read_mailbox().unwrap().is_empty());

        assert!(matches!(
            transport.put_requests(0, &[1, 2, 3, 4, 5]),
            Err(TransportError::MailboxOverflow { count: 5, slots: 4 })
        ));
        assert!(matches!(
            transport.put_requests(1, &[1]),
            Err(TransportError::InvalidRank { rank: 1, size: 1 })
        ));
    }

    #[test]
    fn test_messages_between_threads() {
        let mut group = LocalTransport::group(2, 2);
        let mut second = group.pop().unwrap();
        let mut first = group.pop().unwrap();

        std::thread::scope(|s| {
            s.spawn(move || {
                first.put_requests(1, &[11]).unwrap();
                first.fence().unwrap();
                assert!(first.read_mailbox().unwrap().is_empty());
                let handle = first.post_receive(1, 1, MessageKind::Payload).unwrap();
                let message = first.wait_receive(&handle).unwrap();
                assert_eq!(message, Message::Payload(vec![1.0, 2.0]));
                assert!(first.any(false).unwrap());
            });
            s.spawn(move || {
                second.fence().unwrap();
                let requests = second.read_mailbox().unwrap();
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].source, 0);
                assert_eq!(requests[0].block_id, 11);
                let handle = second
                    .post_send(0, 1, Message::Payload(vec![1.0, 2.0]))
                    .unwrap();
                second.wait_send(handle).unwrap();
                assert!(second.any(true).unwrap());
            });
        });
    }

    #[test]
    fn test_unexpected_kind() {
        let mut transport = LocalTransport::group(1, 1).pop().unwrap();

        let handle = transport.post_receive(0, 0, MessageKind::Payload).unwrap();
        assert_eq!(transport.test_receive(&handle).unwrap(), None);

        transport
            .post_send(0, 0, Message::Header(BlockHeader::default()))
            .unwrap();
        assert!(matches!(
            transport.test_receive(&handle),
            Err(TransportError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn test_broadcast() {
        let group = LocalTransport::group(3, 1);
        std::thread::scope(|s| {
            for mut transport in group {
                s.spawn(move || {
                    let mut values = vec![transport.rank() as i64; 2];
                    transport.broadcast(&mut values).unwrap();
                    assert_eq!(values, vec![0, 0]);
                    let flag = transport.rank() == 2;
                    assert!(transport.any(flag).unwrap());
                    assert!(!transport.any(false).unwrap());
                });
            }
        });
    }
}
