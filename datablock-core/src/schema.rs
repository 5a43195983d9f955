//! Basic Layout Description String (BLDS) and the BLAKE2b-256 hashes
//! derived from it.
//!
//! A BLDS is a canonical, endianness-normalized description of a set of
//! fields (name, primitive type, count, alignment, byte offset). The core
//! never parses the bytes it moves through a slot or flexible zone; it only
//! hashes the BLDS that describes them, so two processes compiled from
//! different (but layout-compatible) struct definitions can still agree on
//! whether they mean the same thing.

use blake2::Blake2b;
use digest::consts::U32;
use digest::Digest;

/// BLAKE2b specialized to a 32-byte digest, per the fixed integrity
/// algorithm in the specification (the teacher's own hashing crate wraps
/// blake3 for its structural signatures; this layer is pinned to
/// BLAKE2b-256 instead, since that is the algorithm the wire format names).
type Blake2b256 = Blake2b<U32>;

/// The primitive type of one field in a [`BldsBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bytes,
}

impl FieldKind {
    fn tag(self) -> &'static str {
        match self {
            FieldKind::U8 => "u8",
            FieldKind::U16 => "u16",
            FieldKind::U32 => "u32",
            FieldKind::U64 => "u64",
            FieldKind::I8 => "i8",
            FieldKind::I16 => "i16",
            FieldKind::I32 => "i32",
            FieldKind::I64 => "i64",
            FieldKind::F32 => "f32",
            FieldKind::F64 => "f64",
            FieldKind::Bytes => "bytes",
        }
    }
}

/// One field description contributing to a BLDS.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub count: u32,
    pub align: u32,
    pub offset: u32,
}

/// Builds a canonical BLDS string from an ordered list of fields, then
/// hashes it. Field order is significant and must match the producer's and
/// consumer's compiled-in layout for the hashes to agree.
#[derive(Debug, Clone, Default)]
pub struct BldsBuilder {
    fields: Vec<Field>,
}

impl BldsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Render the canonical, endianness-normalized description string.
    /// Every integer in the string is little-endian decimal; this has
    /// nothing to do with the host's native endianness, only with making
    /// the string byte-for-byte reproducible across platforms.
    pub fn render(&self) -> String {
        let mut out = String::from("BLDS/1;");
        for field in &self.fields {
            out.push_str(field.name);
            out.push(':');
            out.push_str(field.kind.tag());
            out.push('x');
            out.push_str(&field.count.to_string());
            out.push('@');
            out.push_str(&field.offset.to_string());
            out.push('/');
            out.push_str(&field.align.to_string());
            out.push(';');
        }
        out
    }

    /// Hash the rendered BLDS with BLAKE2b-256.
    pub fn hash(&self) -> [u8; 32] {
        hash_bytes(self.render().as_bytes())
    }
}

/// The canonical empty hash, used for a zero-size flexible zone or any
/// other BLDS-less region. BLAKE2b-256 of the empty input.
pub fn empty_hash() -> [u8; 32] {
    hash_bytes(&[])
}

/// Hash arbitrary bytes with BLAKE2b-256. Used both for schema hashes and
/// for per-slot / flexible-zone payload checksums.
pub fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Hash the frozen configuration into `config_hash`. Only the fields that
/// affect wire-compatible layout are included; `shared_secret` is
/// deliberately excluded so rotating the secret doesn't require every
/// participant to recompute a config hash out of band.
pub fn hash_config(config: &crate::config::Config) -> [u8; 32] {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&(config.policy as u8).to_le_bytes());
    buf.extend_from_slice(&(config.consumer_sync_policy as u8).to_le_bytes());
    buf.extend_from_slice(&(config.checksum_policy as u8).to_le_bytes());
    buf.extend_from_slice(&config.ring_buffer_capacity.to_le_bytes());
    buf.extend_from_slice(&config.logical_unit_size.to_le_bytes());
    buf.extend_from_slice(&config.flex_zone_size.to_le_bytes());
    hash_bytes(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hash_is_stable() {
        assert_eq!(empty_hash(), hash_bytes(&[]));
    }

    #[test]
    fn blds_render_is_order_sensitive() {
        let a = BldsBuilder::new()
            .field(Field {
                name: "x",
                kind: FieldKind::U32,
                count: 1,
                align: 4,
                offset: 0,
            })
            .field(Field {
                name: "y",
                kind: FieldKind::U32,
                count: 1,
                align: 4,
                offset: 4,
            });
        let b = BldsBuilder::new()
            .field(Field {
                name: "y",
                kind: FieldKind::U32,
                count: 1,
                align: 4,
                offset: 4,
            })
            .field(Field {
                name: "x",
                kind: FieldKind::U32,
                count: 1,
                align: 4,
                offset: 0,
            });
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn same_fields_same_hash() {
        let build = || {
            BldsBuilder::new().field(Field {
                name: "counter",
                kind: FieldKind::U64,
                count: 1,
                align: 8,
                offset: 0,
            })
        };
        assert_eq!(build().hash(), build().hash());
    }
}
