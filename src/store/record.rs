//! Durable record framing.
//!
//! Every entity is written as one self-describing frame:
//!
//! ```text
//! [id u64][tag u8][from u64][to u64][meaning u64][refs u32][len u32]
//! [ref u64; refs][bincode body; len bytes]
//! ```
//!
//! All integers are little-endian. Link endpoints are duplicated into the
//! frame header (zero for non-links), and so are the annotation references
//! a link's info list or a cluster's meaning holds. Scanning headers alone is
//! then enough to derive the reverse link direction and to find every
//! entity that names another one as a classifier, without decoding bodies.
//!
//! The aggregate file starts with a fixed [`FileHeader`]; stream files hold
//! exactly one frame and no file header.

use crate::error::{StoreError, StoreResult};
use crate::id::NeuronId;
use crate::neuron::{LinkEnds, NeuronBody, Payload, TypeTag};

pub(crate) const FILE_MAGIC: &[u8; 8] = b"NEUROGR\0";
pub(crate) const FILE_VERSION: u32 = 1;
pub(crate) const FILE_HEADER_SIZE: usize = 32;
/// Fixed part of a frame header; the annotation references follow it.
pub(crate) const FRAME_HEADER_SIZE: usize = 8 + 1 + 8 + 8 + 8 + 4 + 4;

/// Aggregate file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    /// First id the allocator may hand out after attaching this file.
    pub next_id: u64,
    pub record_count: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[..8].copy_from_slice(FILE_MAGIC);
        out[8..12].copy_from_slice(&FILE_VERSION.to_le_bytes());
        // 12..16 reserved
        out[16..24].copy_from_slice(&self.next_id.to_le_bytes());
        out[24..32].copy_from_slice(&self.record_count.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8], path: &str) -> StoreResult<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(StoreError::InvalidHeader {
                path: path.to_string(),
                message: format!("file is {} bytes, shorter than the header", bytes.len()),
            });
        }
        if &bytes[..8] != FILE_MAGIC {
            return Err(StoreError::InvalidHeader {
                path: path.to_string(),
                message: "bad magic".into(),
            });
        }
        let version = read_u32(bytes, 8);
        if version != FILE_VERSION {
            return Err(StoreError::InvalidHeader {
                path: path.to_string(),
                message: format!("version {version} != expected {FILE_VERSION}"),
            });
        }
        Ok(Self {
            next_id: read_u64(bytes, 16),
            record_count: read_u64(bytes, 24),
        })
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub id: NeuronId,
    /// Raw tag byte; may be unknown to this version.
    pub tag: u8,
    pub ends: Option<LinkEnds>,
    /// Link info entries, or the cluster meaning.
    pub refs: Vec<NeuronId>,
    pub body_len: usize,
}

impl FrameHeader {
    pub fn body_offset(&self) -> usize {
        FRAME_HEADER_SIZE + 8 * self.refs.len()
    }

    pub fn frame_len(&self) -> usize {
        self.body_offset() + self.body_len
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        TypeTag::from_u8(self.tag)
    }

    /// Every entity the record names as a classifier or annotation.
    pub fn annotations(&self) -> Vec<NeuronId> {
        let mut out: Vec<NeuronId> = self
            .ends
            .map(|e| e.meaning)
            .into_iter()
            .chain(self.refs.iter().copied())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Annotation references carried in the frame header.
fn header_refs(body: &NeuronBody) -> Vec<NeuronId> {
    match body.payload() {
        Payload::Link(l) => l.info().to_vec(),
        Payload::Cluster(c) => c.meaning().into_iter().collect(),
        Payload::Plain | Payload::Scalar(_) => Vec::new(),
    }
}

/// Outcome of reading a frame header at some offset.
#[derive(Debug)]
pub(crate) enum HeaderRead {
    Frame(FrameHeader),
    /// Not enough bytes left for a header or its body.
    Truncated,
    /// Header present but unusable (zero id, half-set link ends).
    Corrupt { id: u64, message: String },
}

/// Serialize one entity into a frame.
pub(crate) fn encode_frame(id: NeuronId, body: &NeuronBody) -> StoreResult<Vec<u8>> {
    let payload = bincode::serialize(body).map_err(|e| StoreError::Serialization {
        message: format!("failed to serialize entity {id}: {e}"),
    })?;
    let len = u32::try_from(payload.len()).map_err(|_| StoreError::Serialization {
        message: format!("entity {id} record exceeds 4 GiB"),
    })?;
    let ends = body.link().map(|l| l.ends());
    let refs = header_refs(body);
    let ref_count = u32::try_from(refs.len()).map_err(|_| StoreError::Serialization {
        message: format!("entity {id} has too many annotation references"),
    })?;

    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + 8 * refs.len() + payload.len());
    out.extend_from_slice(&id.get().to_le_bytes());
    out.push(body.payload().tag().as_u8());
    out.extend_from_slice(&ends.map_or(0, |e| e.from.get()).to_le_bytes());
    out.extend_from_slice(&ends.map_or(0, |e| e.to.get()).to_le_bytes());
    out.extend_from_slice(&ends.map_or(0, |e| e.meaning.get()).to_le_bytes());
    out.extend_from_slice(&ref_count.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    for r in &refs {
        out.extend_from_slice(&r.get().to_le_bytes());
    }
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Total length of the frame at `pos`, from its length fields alone.
///
/// `None` if the fixed header itself does not fit.
pub(crate) fn frame_len_at(bytes: &[u8], pos: usize) -> Option<usize> {
    if pos.checked_add(FRAME_HEADER_SIZE)? > bytes.len() {
        return None;
    }
    let ref_count = read_u32(bytes, pos + 33) as usize;
    let body_len = read_u32(bytes, pos + 37) as usize;
    FRAME_HEADER_SIZE
        .checked_add(ref_count.checked_mul(8)?)?
        .checked_add(body_len)
}

/// Read the frame header starting at `pos`.
pub(crate) fn read_header(bytes: &[u8], pos: usize) -> HeaderRead {
    let Some(frame_len) = frame_len_at(bytes, pos) else {
        return HeaderRead::Truncated;
    };
    if pos.saturating_add(frame_len) > bytes.len() {
        return HeaderRead::Truncated;
    }
    let raw_id = read_u64(bytes, pos);
    let tag = bytes[pos + 8];
    let from = read_u64(bytes, pos + 9);
    let to = read_u64(bytes, pos + 17);
    let meaning = read_u64(bytes, pos + 25);
    let ref_count = read_u32(bytes, pos + 33) as usize;
    let body_len = read_u32(bytes, pos + 37) as usize;
    let mut refs = Vec::with_capacity(ref_count);
    for i in 0..ref_count {
        let raw = read_u64(bytes, pos + FRAME_HEADER_SIZE + 8 * i);
        let Some(r) = NeuronId::new(raw).filter(|r| !r.is_temp()) else {
            return HeaderRead::Corrupt {
                id: raw_id,
                message: "invalid annotation reference".into(),
            };
        };
        refs.push(r);
    }
    let Some(id) = NeuronId::new(raw_id).filter(|id| !id.is_temp()) else {
        return HeaderRead::Corrupt {
            id: raw_id,
            message: "invalid id".into(),
        };
    };
    let ends = match (NeuronId::new(from), NeuronId::new(to), NeuronId::new(meaning)) {
        (Some(from), Some(to), Some(meaning)) => Some(LinkEnds { from, to, meaning }),
        (None, None, None) => None,
        _ => {
            return HeaderRead::Corrupt {
                id: raw_id,
                message: "partially set link endpoints".into(),
            };
        }
    };
    if (tag == TypeTag::Link.as_u8()) != ends.is_some() {
        return HeaderRead::Corrupt {
            id: raw_id,
            message: "link endpoints do not match the type tag".into(),
        };
    }
    let refs_fit = match TypeTag::from_u8(tag) {
        Some(TypeTag::Link) => true,
        Some(TypeTag::Cluster) => refs.len() <= 1,
        _ => refs.is_empty(),
    };
    if !refs_fit {
        return HeaderRead::Corrupt {
            id: raw_id,
            message: "annotation references do not match the type tag".into(),
        };
    }
    HeaderRead::Frame(FrameHeader {
        id,
        tag,
        ends,
        refs,
        body_len,
    })
}

/// Decode a whole frame, checking the body against its header.
pub(crate) fn decode_frame(frame: &[u8]) -> StoreResult<(NeuronId, NeuronBody)> {
    let header = match read_header(frame, 0) {
        HeaderRead::Frame(h) => h,
        HeaderRead::Truncated => {
            return Err(StoreError::Malformed {
                id: if frame.len() >= 8 { read_u64(frame, 0) } else { 0 },
                message: "truncated frame".into(),
            });
        }
        HeaderRead::Corrupt { id, message } => return Err(StoreError::Malformed { id, message }),
    };
    let id = header.id;
    let body: NeuronBody = bincode::deserialize(&frame[header.body_offset()..header.frame_len()])
        .map_err(|e| StoreError::Malformed {
            id: id.get(),
            message: e.to_string(),
        })?;
    if body.payload().tag().as_u8() != header.tag {
        return Err(StoreError::Malformed {
            id: id.get(),
            message: format!(
                "header tag {} does not match body kind {}",
                header.tag,
                body.payload().tag()
            ),
        });
    }
    if body.link().map(|l| l.ends()) != header.ends {
        return Err(StoreError::Malformed {
            id: id.get(),
            message: "link endpoints in header and body disagree".into(),
        });
    }
    if header_refs(&body) != header.refs {
        return Err(StoreError::Malformed {
            id: id.get(),
            message: "annotation references in header and body disagree".into(),
        });
    }
    Ok((id, body))
}

fn read_u64(bytes: &[u8], pos: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[pos..pos + 8]);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8], pos: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[pos..pos + 4]);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neuron::{LinkBody, Payload, ScalarValue};

    fn nid(raw: u64) -> NeuronId {
        NeuronId::new(raw).unwrap()
    }

    fn link_body() -> NeuronBody {
        NeuronBody::new(Payload::Link(LinkBody {
            ends: LinkEnds {
                from: nid(1),
                to: nid(2),
                meaning: nid(3),
            },
            info: vec![nid(4)],
        }))
    }

    #[test]
    fn link_frame_carries_endpoints_in_header() {
        let frame = encode_frame(nid(10), &link_body()).unwrap();
        let HeaderRead::Frame(header) = read_header(&frame, 0) else {
            panic!("expected a frame");
        };
        assert_eq!(header.id, nid(10));
        assert_eq!(header.type_tag(), Some(TypeTag::Link));
        assert_eq!(header.ends.unwrap().to, nid(2));
        assert_eq!(header.refs, vec![nid(4)]);
        assert_eq!(header.annotations(), vec![nid(3), nid(4)]);
        assert_eq!(header.frame_len(), frame.len());

        let (id, body) = decode_frame(&frame).unwrap();
        assert_eq!(id, nid(10));
        assert_eq!(body, link_body());
    }

    #[test]
    fn scalar_frame_has_no_endpoints() {
        let body = NeuronBody::new(Payload::Scalar(ScalarValue::Text("hi".into())));
        let frame = encode_frame(nid(5), &body).unwrap();
        let HeaderRead::Frame(header) = read_header(&frame, 0) else {
            panic!("expected a frame");
        };
        assert!(header.ends.is_none());
        assert_eq!(header.type_tag(), Some(TypeTag::Text));
    }

    #[test]
    fn cluster_meaning_travels_in_header() {
        let body = NeuronBody::new(Payload::Cluster(crate::neuron::ClusterBody {
            meaning: Some(nid(8)),
            children: vec![nid(1), nid(2)],
            ordered: true,
        }));
        let frame = encode_frame(nid(6), &body).unwrap();
        let HeaderRead::Frame(header) = read_header(&frame, 0) else {
            panic!("expected a frame");
        };
        assert!(header.ends.is_none());
        assert_eq!(header.annotations(), vec![nid(8)]);
        assert_eq!(frame_len_at(&frame, 0), Some(frame.len()));
        assert_eq!(decode_frame(&frame).unwrap().1, body);
    }

    #[test]
    fn header_refs_must_match_body() {
        let mut frame = encode_frame(nid(10), &link_body()).unwrap();
        // Rewrite the single info reference carried in the header.
        frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + 8].copy_from_slice(&5u64.to_le_bytes());
        assert!(matches!(
            decode_frame(&frame),
            Err(StoreError::Malformed { id: 10, .. })
        ));
    }

    #[test]
    fn short_input_is_truncated() {
        let frame = encode_frame(nid(5), &NeuronBody::new(Payload::Plain)).unwrap();
        assert!(matches!(
            read_header(&frame[..frame.len() - 1], 0),
            HeaderRead::Truncated
        ));
        assert!(matches!(read_header(&frame[..10], 0), HeaderRead::Truncated));
    }

    #[test]
    fn tag_mismatch_is_malformed() {
        let mut frame = encode_frame(nid(5), &NeuronBody::new(Payload::Plain)).unwrap();
        frame[8] = TypeTag::Cluster.as_u8();
        assert!(matches!(
            decode_frame(&frame),
            Err(StoreError::Malformed { id: 5, .. })
        ));
    }

    #[test]
    fn garbage_body_is_malformed() {
        let mut frame = encode_frame(nid(7), &link_body()).unwrap();
        for b in &mut frame[FRAME_HEADER_SIZE + 8..] {
            *b = 0xff;
        }
        assert!(matches!(
            decode_frame(&frame),
            Err(StoreError::Malformed { id: 7, .. })
        ));
    }

    #[test]
    fn file_header_round_trip_and_rejects_bad_magic() {
        let header = FileHeader {
            next_id: 42,
            record_count: 7,
        };
        let bytes = header.encode();
        assert_eq!(FileHeader::decode(&bytes, "x").unwrap(), header);

        let mut bad = bytes;
        bad[0] = b'X';
        assert!(matches!(
            FileHeader::decode(&bad, "x"),
            Err(StoreError::InvalidHeader { .. })
        ));
    }
}
