use crate::cancel::CancelToken;
use crate::crypto::Key;
use crate::error::{CairnError, Result};
use crate::id::{BlobType, FileType, Handle, Id};
use crate::storage::Backend;

// Header entry type tags. Compressed variants exist only in version 2
// repositories and carry an extra uncompressed-length field.
const TYPE_DATA: u8 = 0;
const TYPE_TREE: u8 = 1;
const TYPE_COMPRESSED_DATA: u8 = 2;
const TYPE_COMPRESSED_TREE: u8 = 3;

/// Encoded size of one plain header entry: type + length + id.
pub const ENTRY_SIZE_PLAIN: usize = 1 + 4 + 32;
/// Encoded size of one compressed header entry: type + length +
/// uncompressed length + id.
pub const ENTRY_SIZE_COMPRESSED: usize = 1 + 4 + 4 + 32;

/// Sanity cap on the sealed header when parsing untrusted packs.
const MAX_HEADER_SIZE: u32 = 16 * 1024 * 1024;

/// One blob inside a pack: the blob descriptor of (type, id, offset,
/// ciphertext length, uncompressed length when compressed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBlob {
    pub blob_type: BlobType,
    pub id: Id,
    pub offset: u64,
    pub length: u32,
    pub uncompressed_length: Option<u32>,
}

/// A fully assembled pack ready for upload, named by the SHA-256 of its raw
/// bytes.
pub struct FinishedPack {
    pub id: Id,
    pub bytes: Vec<u8>,
    pub blobs: Vec<PackedBlob>,
}

/// Accumulates sealed blobs and assembles them into a pack:
///
/// ```text
/// [ sealed blob 0 ] ... [ sealed blob N-1 ] [ sealed header ] [ header_length : u32 LE ]
/// ```
///
/// The header is a sequence of fixed-width entries, itself sealed with the
/// same scheme as blobs; `header_length` is the sealed header's length
/// excluding the trailing four bytes. A packer is owned by one writer at a
/// time; the pool provides mutual exclusion.
pub struct Packer {
    buf: Vec<u8>,
    blobs: Vec<PackedBlob>,
}

impl Packer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            blobs: Vec::new(),
        }
    }

    /// Append one sealed blob. Returns the blob's offset inside the pack.
    pub fn add(
        &mut self,
        blob_type: BlobType,
        id: Id,
        sealed: &[u8],
        uncompressed_length: Option<u32>,
    ) -> u64 {
        let offset = self.buf.len() as u64;
        self.buf.extend_from_slice(sealed);
        self.blobs.push(PackedBlob {
            blob_type,
            id,
            offset,
            length: sealed.len() as u32,
            uncompressed_length,
        });
        offset
    }

    /// Bytes buffered so far (blob data only, header excluded).
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn count(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Assemble the buffered blobs into a finished pack and reset this packer
    /// for reuse. Does not write to storage; the caller uploads the bytes.
    pub fn finalize(&mut self, key: &Key) -> Result<FinishedPack> {
        if self.blobs.is_empty() {
            return Err(CairnError::Other("cannot finalize an empty packer".into()));
        }

        let mut bytes = std::mem::take(&mut self.buf);
        let blobs = std::mem::take(&mut self.blobs);

        let header = encode_header(&blobs);
        let sealed_header = key.seal(&header);
        bytes.extend_from_slice(&sealed_header);
        bytes.extend_from_slice(&(sealed_header.len() as u32).to_le_bytes());

        let id = Id::hash(&bytes);
        Ok(FinishedPack { id, bytes, blobs })
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_header(blobs: &[PackedBlob]) -> Vec<u8> {
    let size: usize = blobs
        .iter()
        .map(|b| {
            if b.uncompressed_length.is_some() {
                ENTRY_SIZE_COMPRESSED
            } else {
                ENTRY_SIZE_PLAIN
            }
        })
        .sum();
    let mut out = Vec::with_capacity(size);
    for blob in blobs {
        let tag = match (blob.blob_type, blob.uncompressed_length) {
            (BlobType::Data, None) => TYPE_DATA,
            (BlobType::Tree, None) => TYPE_TREE,
            (BlobType::Data, Some(_)) => TYPE_COMPRESSED_DATA,
            (BlobType::Tree, Some(_)) => TYPE_COMPRESSED_TREE,
        };
        out.push(tag);
        out.extend_from_slice(&blob.length.to_le_bytes());
        if let Some(uncompressed) = blob.uncompressed_length {
            out.extend_from_slice(&uncompressed.to_le_bytes());
        }
        out.extend_from_slice(blob.id.as_bytes());
    }
    out
}

/// Decode header entries. Blob offsets are implicit: entries appear in pack
/// order, so offsets are reconstructed by accumulating lengths from zero.
fn decode_header(header: &[u8]) -> Result<Vec<PackedBlob>> {
    let mut blobs = Vec::new();
    let mut pos = 0usize;
    let mut offset = 0u64;
    while pos < header.len() {
        let tag = header[pos];
        let (blob_type, compressed) = match tag {
            TYPE_DATA => (BlobType::Data, false),
            TYPE_TREE => (BlobType::Tree, false),
            TYPE_COMPRESSED_DATA => (BlobType::Data, true),
            TYPE_COMPRESSED_TREE => (BlobType::Tree, true),
            other => {
                return Err(CairnError::InvalidFormat(format!(
                    "unknown pack entry type {other}"
                )))
            }
        };
        let entry_size = if compressed {
            ENTRY_SIZE_COMPRESSED
        } else {
            ENTRY_SIZE_PLAIN
        };
        if pos + entry_size > header.len() {
            return Err(CairnError::InvalidFormat("truncated pack header entry".into()));
        }
        pos += 1;

        let length = u32::from_le_bytes(header[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let uncompressed_length = if compressed {
            let len = u32::from_le_bytes(header[pos..pos + 4].try_into().unwrap());
            pos += 4;
            Some(len)
        } else {
            None
        };
        let mut id = [0u8; 32];
        id.copy_from_slice(&header[pos..pos + 32]);
        pos += 32;

        blobs.push(PackedBlob {
            blob_type,
            id: Id(id),
            offset,
            length,
            uncompressed_length,
        });
        offset += length as u64;
    }
    Ok(blobs)
}

/// Parse the trailing header out of complete pack bytes.
pub fn parse_header(key: &Key, pack: &[u8]) -> Result<Vec<PackedBlob>> {
    if pack.len() < 4 {
        return Err(CairnError::InvalidFormat("pack too small".into()));
    }
    let len_offset = pack.len() - 4;
    let header_len = u32::from_le_bytes(pack[len_offset..].try_into().unwrap());
    if header_len > MAX_HEADER_SIZE || header_len as usize > len_offset {
        return Err(CairnError::InvalidFormat(format!(
            "invalid pack header length {header_len}"
        )));
    }
    let sealed = &pack[len_offset - header_len as usize..len_offset];
    let header = key.open(sealed)?;
    let blobs = decode_header(&header)?;

    let blob_bytes = (len_offset - header_len as usize) as u64;
    if blobs.iter().map(|b| b.length as u64).sum::<u64>() != blob_bytes {
        return Err(CairnError::InvalidFormat(
            "pack header does not cover the blob area".into(),
        ));
    }
    Ok(blobs)
}

/// Read and decrypt the trailing header of a stored pack with two partial
/// loads: four bytes for the length word, then the sealed header itself.
pub fn read_header(
    backend: &dyn Backend,
    cancel: &CancelToken,
    key: &Key,
    pack_id: &Id,
) -> Result<Vec<PackedBlob>> {
    let handle = Handle::new(FileType::Data, *pack_id);
    let size = backend.stat(cancel, &handle)?.size;
    if size < 4 {
        return Err(CairnError::InvalidFormat(format!(
            "pack {pack_id} too small: {size} bytes"
        )));
    }

    let len_bytes = backend.load(cancel, &handle, 4, size - 4)?;
    let header_len = u32::from_le_bytes(len_bytes[..].try_into().unwrap());
    if header_len > MAX_HEADER_SIZE || (header_len as u64) + 4 > size {
        return Err(CairnError::InvalidFormat(format!(
            "pack {pack_id}: invalid header length {header_len}"
        )));
    }

    let sealed = backend.load(cancel, &handle, header_len, size - 4 - header_len as u64)?;
    let header = key.open(&sealed)?;
    decode_header(&header)
}
