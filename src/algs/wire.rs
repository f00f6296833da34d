//! Little-endian wire encoding for the sparse exchange rounds.
//!
//! Fixed-size headers are `bytemuck` Pod records (see [`WireCount`]); variable payloads
//! (ancestries, facets, field values) are written field by field through the
//! [`Packable`] trait into a `BytesMut` and read back from `Bytes`.

use crate::mesh_error::MeshError;
use crate::topology::entity::{EntityId, EntityKey, EntityRank};
use bytemuck::{Pod, Zeroable};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use nalgebra::Vector3;
use static_assertions::const_assert_eq;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Byte count announced in the size phase.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

const_assert_eq!(std::mem::size_of::<WireCount>(), 8);

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<(), MeshError> {
    if buf.remaining() < n {
        Err(MeshError::Wire(format!(
            "truncated buffer reading {what}: need {n}, have {}",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

/// Values that can be appended to / read from an exchange buffer.
pub trait Packable: Sized {
    fn pack(&self, buf: &mut BytesMut);
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError>;
}

macro_rules! packable_primitive {
    ($t:ty, $put:ident, $get:ident, $n:expr) => {
        impl Packable for $t {
            fn pack(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
            fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
                need(buf, $n, stringify!($t))?;
                Ok(buf.$get())
            }
        }
    };
}

packable_primitive!(u8, put_u8, get_u8, 1);
packable_primitive!(i8, put_i8, get_i8, 1);
packable_primitive!(u32, put_u32_le, get_u32_le, 4);
packable_primitive!(u64, put_u64_le, get_u64_le, 8);
packable_primitive!(f64, put_f64_le, get_f64_le, 8);

impl Packable for usize {
    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self as u64);
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        Ok(u64::unpack(buf)? as usize)
    }
}

impl Packable for bool {
    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        Ok(u8::unpack(buf)? != 0)
    }
}

impl Packable for EntityId {
    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.get());
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        EntityId::new(u64::unpack(buf)?)
    }
}

impl Packable for EntityKey {
    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u8(self.rank.as_u8());
        self.id.pack(buf);
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        let rank = EntityRank::from_u8(u8::unpack(buf)?)?;
        Ok(EntityKey::new(rank, EntityId::unpack(buf)?))
    }
}

impl Packable for Vector3<f64> {
    fn pack(&self, buf: &mut BytesMut) {
        for c in self.iter() {
            buf.put_f64_le(*c);
        }
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        Ok(Vector3::new(
            f64::unpack(buf)?,
            f64::unpack(buf)?,
            f64::unpack(buf)?,
        ))
    }
}

impl<T: Packable> Packable for Vec<T> {
    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        for item in self {
            item.pack(buf);
        }
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        let n = u32::unpack(buf)? as usize;
        // each element takes at least one byte
        need(buf, n, "vector body")?;
        (0..n).map(|_| T::unpack(buf)).collect()
    }
}

impl<A: Packable, B: Packable> Packable for (A, B) {
    fn pack(&self, buf: &mut BytesMut) {
        self.0.pack(buf);
        self.1.pack(buf);
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        Ok((A::unpack(buf)?, B::unpack(buf)?))
    }
}

impl<A: Packable, B: Packable, C: Packable> Packable for (A, B, C) {
    fn pack(&self, buf: &mut BytesMut) {
        self.0.pack(buf);
        self.1.pack(buf);
        self.2.pack(buf);
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        Ok((A::unpack(buf)?, B::unpack(buf)?, C::unpack(buf)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_payload_reads_back_in_order() {
        let mut out = BytesMut::new();
        let key = EntityKey::node(EntityId::new(42).unwrap());
        key.pack(&mut out);
        (-1i8).pack(&mut out);
        vec![0.25f64, 0.5].pack(&mut out);
        true.pack(&mut out);

        let mut inp = out.freeze();
        assert_eq!(EntityKey::unpack(&mut inp).unwrap(), key);
        assert_eq!(i8::unpack(&mut inp).unwrap(), -1);
        assert_eq!(Vec::<f64>::unpack(&mut inp).unwrap(), vec![0.25, 0.5]);
        assert!(bool::unpack(&mut inp).unwrap());
        assert!(!inp.has_remaining());
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut inp = Bytes::from_static(&[1, 2, 3]);
        assert!(matches!(u64::unpack(&mut inp), Err(MeshError::Wire(_))));
        let mut zero_id = Bytes::from(vec![0u8; 8]);
        assert!(EntityId::unpack(&mut zero_id).is_err());
    }
}
