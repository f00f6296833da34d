//! Two-phase sparse exchange and the collectives built on it.
//!
//! Every round is: (1) each rank sends a [`WireCount`] byte count to every other rank;
//! (2) payloads are sent only where the count is non-zero. Self-addressed buffers are
//! moved locally and never touch the communicator. All posted handles are drained
//! before the first error is returned so no rank is left with a dangling message.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{Packable, WireCount, cast_slice, cast_slice_mut};
use crate::mesh_error::MeshError;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// Per-destination send buffers and per-source receive buffers of one round.
pub struct CommSparse<'a, C: Communicator> {
    comm: &'a C,
    send: BTreeMap<usize, BytesMut>,
    recv: BTreeMap<usize, Bytes>,
}

impl<'a, C: Communicator> CommSparse<'a, C> {
    pub fn new(comm: &'a C) -> Self {
        Self {
            comm,
            send: BTreeMap::new(),
            recv: BTreeMap::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    /// Buffer for messages to `proc` (created on first use).
    pub fn send_buffer(&mut self, proc: usize) -> &mut BytesMut {
        self.send.entry(proc).or_default()
    }

    /// Pack `value` for `proc`.
    pub fn pack_to<T: Packable>(&mut self, proc: usize, value: &T) {
        value.pack(self.send_buffer(proc));
    }

    /// Run the size and data phases. Send buffers are consumed.
    pub fn communicate(&mut self, tag: CommTag) -> Result<(), MeshError> {
        let me = self.comm.rank();
        let size = self.comm.size();
        let mut send = std::mem::take(&mut self.send);
        self.recv.clear();
        if let Some(local) = send.remove(&me) {
            if !local.is_empty() {
                self.recv.insert(me, local.freeze());
            }
        }
        if size < 2 {
            return Ok(());
        }

        // 1) sizes, dense over peers
        let counts: Vec<WireCount> = (0..size)
            .map(|p| WireCount::new(send.get(&p).map_or(0, BytesMut::len)))
            .collect();
        let mut pending_sends = Vec::with_capacity(size);
        for p in (0..size).filter(|&p| p != me) {
            pending_sends.push(self.comm.isend(
                p,
                tag.base(),
                cast_slice(std::slice::from_ref(&counts[p])),
            ));
        }
        let mut incoming = BTreeMap::new();
        let mut maybe_err = None;
        for p in (0..size).filter(|&p| p != me) {
            let mut cnt = WireCount::new(0);
            let h = self
                .comm
                .irecv(p, tag.base(), cast_slice_mut(std::slice::from_mut(&mut cnt)));
            match h.wait() {
                Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                    cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                    if cnt.get() > 0 {
                        incoming.insert(p, cnt.get());
                    }
                }
                Some(data) => {
                    maybe_err.get_or_insert_with(|| {
                        MeshError::comm(p, format!("size header of {} bytes", data.len()))
                    });
                }
                None => {
                    maybe_err.get_or_insert_with(|| MeshError::comm(p, "no size header received"));
                }
            }
        }
        for s in pending_sends.drain(..) {
            let _ = s.wait();
        }

        // 2) payloads where non-empty
        let data_tag = tag.offset(1).base();
        for (p, buf) in send.iter().filter(|(p, b)| **p != me && !b.is_empty()) {
            pending_sends.push(self.comm.isend(*p, data_tag, buf));
        }
        for (p, n) in incoming {
            let mut buf = vec![0u8; n];
            let h = self.comm.irecv(p, data_tag, &mut buf);
            match h.wait() {
                Some(data) if data.len() == n => {
                    self.recv.insert(p, Bytes::from(data));
                }
                Some(data) => {
                    maybe_err.get_or_insert_with(|| {
                        MeshError::comm(p, format!("expected {n} bytes, got {}", data.len()))
                    });
                }
                None => {
                    maybe_err.get_or_insert_with(|| MeshError::comm(p, "no payload received"));
                }
            }
        }
        for s in pending_sends {
            let _ = s.wait();
        }
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ranks a payload was received from, ascending (may include this rank).
    pub fn recv_procs(&self) -> Vec<usize> {
        self.recv.keys().copied().collect()
    }

    pub fn recv_buffer(&mut self, proc: usize) -> Option<&mut Bytes> {
        self.recv.get_mut(&proc)
    }

    /// Take every received buffer, keyed by source rank.
    pub fn take_recv(&mut self) -> BTreeMap<usize, Bytes> {
        std::mem::take(&mut self.recv)
    }
}

/// Typed sparse exchange: send `outgoing[p]` to rank `p`, return what each rank sent here.
pub fn exchange<C, T>(
    comm: &C,
    tag: CommTag,
    outgoing: &BTreeMap<usize, Vec<T>>,
) -> Result<BTreeMap<usize, Vec<T>>, MeshError>
where
    C: Communicator,
    T: Packable,
{
    let mut sparse = CommSparse::new(comm);
    for (&p, items) in outgoing.iter().filter(|(_, v)| !v.is_empty()) {
        let buf = sparse.send_buffer(p);
        for item in items {
            item.pack(buf);
        }
    }
    sparse.communicate(tag)?;
    let mut out = BTreeMap::new();
    for (p, mut buf) in sparse.take_recv() {
        let mut items = Vec::new();
        while !buf.is_empty() {
            items.push(T::unpack(&mut buf)?);
        }
        out.insert(p, items);
    }
    Ok(out)
}

/// Gather one value from every rank, indexed by rank.
pub fn all_gather<C, T>(comm: &C, tag: CommTag, local: &T) -> Result<Vec<T>, MeshError>
where
    C: Communicator,
    T: Packable + Clone,
{
    let mut sparse = CommSparse::new(comm);
    for p in 0..comm.size() {
        sparse.pack_to(p, local);
    }
    sparse.communicate(tag)?;
    let mut recv = sparse.take_recv();
    (0..comm.size())
        .map(|p| {
            let buf = recv
                .get_mut(&p)
                .ok_or_else(|| MeshError::comm(p, "missing all_gather contribution"))?;
            T::unpack(buf)
        })
        .collect()
}

pub fn all_reduce_max_f64<C: Communicator>(comm: &C, tag: CommTag, v: f64) -> Result<f64, MeshError> {
    Ok(all_gather(comm, tag, &v)?
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max))
}

/// Component-wise sum of equally sized vectors.
pub fn all_reduce_sum_f64<C: Communicator>(comm: &C, tag: CommTag, v: &[f64]) -> Result<Vec<f64>, MeshError> {
    let gathered = all_gather(comm, tag, &v.to_vec())?;
    let mut out = vec![0.0; v.len()];
    for (p, contribution) in gathered.iter().enumerate() {
        if contribution.len() != v.len() {
            return Err(MeshError::comm(p, format!("sum of {} values, expected {}", contribution.len(), v.len())));
        }
        out.iter_mut().zip(contribution).for_each(|(o, c)| *o += c);
    }
    Ok(out)
}

pub fn all_reduce_max_u64<C: Communicator>(comm: &C, tag: CommTag, v: u64) -> Result<u64, MeshError> {
    Ok(all_gather(comm, tag, &v)?.into_iter().max().unwrap_or(v))
}

pub fn all_reduce_bitor_u64<C: Communicator>(comm: &C, tag: CommTag, v: u64) -> Result<u64, MeshError> {
    Ok(all_gather(comm, tag, &v)?.into_iter().fold(0, |a, b| a | b))
}

/// True if `flag` is true on at least one rank.
pub fn all_reduce_or<C: Communicator>(comm: &C, tag: CommTag, flag: bool) -> Result<bool, MeshError> {
    Ok(all_gather(comm, tag, &flag)?.into_iter().any(|b| b))
}
