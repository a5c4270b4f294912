//! Extent-item encoding for relocated nodes: inline section under the
//! size budget, overflow items for the remainder.

use crate::graph::{Batch, RecordIdx};
use cbfs_error::{BalanceError, Result};
use cbfs_ondisk::{
    encode_ref_into, ExtentRecordHeader, NodeRef, EXTENT_RECORD_SIZE,
    EXTENT_RECORD_TRAILER_SIZE, INLINE_REF_SIZE,
};
use cbfs_types::{ItemKey, NodeSize, TYPE_EXTENT_RECORD, TYPE_METADATA_RECORD};

/// The serialized replacement extent record for one relocated node.
pub(crate) struct EncodedExtent {
    pub key: ItemKey,
    pub data: Vec<u8>,
    /// Overflow reference items, keyed `(new_address, tag, payload)`.
    pub overflow: Vec<(ItemKey, Vec<u8>)>,
}

/// Encode the record at `idx` against its new address.
///
/// The header carries the total refcount and the original generation and
/// flags unchanged. References are emitted inline until the next entry
/// would push the item past a quarter of the node size; that entry and
/// every one after it become overflow items. A shared reference's payload
/// is its parent's new address when the parent was relocated in this
/// batch (the bottom-up write order has already finalized it), and its
/// original parent address otherwise.
pub(crate) fn encode_extent_record(
    batch: &Batch,
    idx: RecordIdx,
    node_size: NodeSize,
    skinny: bool,
) -> Result<EncodedExtent> {
    let record = batch.get(idx);
    let new_address = record.new_address.ok_or_else(|| {
        BalanceError::storage(format!(
            "encoding extent record for {} before destination assignment",
            record.old_address
        ))
    })?;

    let mut entries = Vec::with_capacity(record.refs.len());
    for slot in &record.refs {
        let payload = match slot.target {
            NodeRef::TreeOwned { tree } => tree.0,
            NodeRef::SharedByParent { parent } => match slot.parent {
                Some(parent_idx) => {
                    batch
                        .get(parent_idx)
                        .new_address
                        .ok_or_else(|| {
                            BalanceError::storage(format!(
                                "shared parent of {} relocated but not yet finalized",
                                record.old_address
                            ))
                        })?
                        .0
                }
                None => parent.0,
            },
        };
        entries.push((slot.target.type_tag(), payload));
    }

    let budget = node_size.inline_budget();
    let base_len = if skinny {
        EXTENT_RECORD_SIZE
    } else {
        EXTENT_RECORD_SIZE + EXTENT_RECORD_TRAILER_SIZE
    };
    let mut inline_len = base_len;
    let mut inline_count = entries.len();
    for (pos, _) in entries.iter().enumerate() {
        if inline_len + INLINE_REF_SIZE > budget {
            inline_count = pos;
            break;
        }
        inline_len += INLINE_REF_SIZE;
    }

    let header = ExtentRecordHeader {
        refcount: record.refs.len() as u64,
        generation: record.extent.generation,
        flags: record.extent.flags,
    };
    let mut data = Vec::with_capacity(inline_len);
    header.encode_into(&mut data);
    if !skinny {
        // Reserved trailer; its content is not modeled and stays zero.
        data.resize(data.len() + EXTENT_RECORD_TRAILER_SIZE, 0);
    }
    for (tag, payload) in &entries[..inline_count] {
        encode_ref_into(&mut data, *tag, *payload);
    }

    let key = if skinny {
        ItemKey::new(
            new_address.0,
            TYPE_METADATA_RECORD,
            u64::from(record.level),
        )
    } else {
        ItemKey::new(new_address.0, TYPE_EXTENT_RECORD, node_size.as_u64())
    };

    let overflow = entries[inline_count..]
        .iter()
        .map(|(tag, payload)| {
            (
                ItemKey::new(new_address.0, *tag, *payload),
                payload.to_le_bytes().to_vec(),
            )
        })
        .collect();

    Ok(EncodedExtent {
        key,
        data,
        overflow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::batch_with_record;
    use cbfs_ondisk::decode_inline_refs;
    use cbfs_types::{LogicalAddress, TreeId, EXTENT_FLAG_TREE_NODE};

    fn decode_all(encoded: &EncodedExtent, skinny: bool) -> Vec<NodeRef> {
        let start = if skinny {
            EXTENT_RECORD_SIZE
        } else {
            EXTENT_RECORD_SIZE + EXTENT_RECORD_TRAILER_SIZE
        };
        let mut refs = decode_inline_refs(&encoded.data[start..]).expect("inline decode");
        for (key, data) in &encoded.overflow {
            let payload = u64::from_le_bytes(data.as_slice().try_into().expect("8 bytes"));
            assert_eq!(payload, key.offset);
            refs.push(NodeRef::from_tag_payload(key.item_type, payload).expect("tag"));
        }
        refs
    }

    #[test]
    fn all_inline_when_under_budget() {
        let refs = vec![
            NodeRef::TreeOwned { tree: TreeId(5) },
            NodeRef::TreeOwned { tree: TreeId(9) },
        ];
        let (batch, idx) = batch_with_record(refs.clone(), Some(LogicalAddress(0x8000)));
        let node_size = NodeSize::new(4096).unwrap();

        let encoded = encode_extent_record(&batch, idx, node_size, true).expect("encode");
        assert_eq!(encoded.key, ItemKey::new(0x8000, TYPE_METADATA_RECORD, 0));
        assert!(encoded.overflow.is_empty());
        let header = ExtentRecordHeader::parse(&encoded.data).expect("header");
        assert_eq!(header.refcount, 2);
        assert_eq!(header.flags, EXTENT_FLAG_TREE_NODE);
        assert_eq!(decode_all(&encoded, true), refs);
    }

    #[test]
    fn spills_to_overflow_past_quarter_node_budget() {
        // 4096/4 = 1024 budget; 24-byte header leaves room for 111 refs.
        let refs: Vec<NodeRef> = (0..120)
            .map(|i| NodeRef::TreeOwned { tree: TreeId(1000 + i) })
            .collect();
        let (batch, idx) = batch_with_record(refs.clone(), Some(LogicalAddress(0x8000)));
        let node_size = NodeSize::new(4096).unwrap();

        let encoded = encode_extent_record(&batch, idx, node_size, true).expect("encode");
        assert_eq!(encoded.overflow.len(), 9);
        assert!(encoded.data.len() <= node_size.inline_budget());
        let header = ExtentRecordHeader::parse(&encoded.data).expect("header");
        assert_eq!(header.refcount, 120);
        // Round-trip: inline + overflow reproduce the reference list.
        assert_eq!(decode_all(&encoded, true), refs);
    }

    #[test]
    fn legacy_shape_reserves_zero_trailer() {
        let refs = vec![NodeRef::TreeOwned { tree: TreeId(5) }];
        let (batch, idx) = batch_with_record(refs.clone(), Some(LogicalAddress(0x8000)));
        let node_size = NodeSize::new(4096).unwrap();

        let encoded = encode_extent_record(&batch, idx, node_size, false).expect("encode");
        assert_eq!(
            encoded.key,
            ItemKey::new(0x8000, TYPE_EXTENT_RECORD, node_size.as_u64())
        );
        let trailer =
            &encoded.data[EXTENT_RECORD_SIZE..EXTENT_RECORD_SIZE + EXTENT_RECORD_TRAILER_SIZE];
        assert!(trailer.iter().all(|byte| *byte == 0));
        assert_eq!(decode_all(&encoded, false), refs);
    }

    #[test]
    fn shared_ref_payload_follows_relocated_parent() {
        let parent_refs = vec![NodeRef::TreeOwned { tree: TreeId(5) }];
        let (mut batch, parent_idx) =
            batch_with_record(parent_refs, Some(LogicalAddress(0xB000)));
        let child_idx = crate::graph::tests::push_record(
            &mut batch,
            LogicalAddress(0x2000),
            vec![NodeRef::SharedByParent {
                parent: LogicalAddress(0xA000),
            }],
            Some(LogicalAddress(0x9000)),
        );
        crate::graph::tests::set_ref_parent(&mut batch, child_idx, 0, parent_idx);

        let node_size = NodeSize::new(4096).unwrap();
        let encoded = encode_extent_record(&batch, child_idx, node_size, true).expect("encode");
        let refs = decode_all(&encoded, true);
        assert_eq!(
            refs,
            vec![NodeRef::SharedByParent {
                parent: LogicalAddress(0xB000)
            }]
        );
    }

    #[test]
    fn encode_before_destination_assignment_is_an_error() {
        let (batch, idx) = batch_with_record(vec![NodeRef::TreeOwned { tree: TreeId(5) }], None);
        let node_size = NodeSize::new(4096).unwrap();
        assert!(encode_extent_record(&batch, idx, node_size, true).is_err());
    }
}
