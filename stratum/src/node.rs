//! B+ tree node layout and page body encoding.
//!
//! Nodes are value objects: they are materialized from a page on demand,
//! mutated in memory, and serialized back into the page when dirty. The
//! first byte of a page body discriminates leaf from internal.

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::page::PageId;
use crate::PAGE_SIZE;

pub const LEAF_NODE_KIND: u8 = 1;
pub const INTERNAL_NODE_KIND: u8 = 2;

/// A leaf holds the key/value pairs and a link to the next leaf in key
/// order; the chain drives range scans.
#[derive(Debug, Clone)]
pub struct LeafNode<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub next_leaf: PageId,
}

impl<K, V> LeafNode<K, V> {
    pub fn empty() -> Self {
        LeafNode {
            keys: Vec::new(),
            values: Vec::new(),
            next_leaf: PageId::INVALID,
        }
    }
}

/// An internal node holds `keys.len() + 1` child page ids. Every key in
/// `children[i]` is less than `keys[i]`; every key in `children[i + 1]` is
/// greater than or equal to it.
#[derive(Debug, Clone)]
pub struct InternalNode<K> {
    pub keys: Vec<K>,
    pub children: Vec<PageId>,
}

#[derive(Debug, Clone)]
pub enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Internal(InternalNode<K>),
}

impl<K, V> Node<K, V> {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn keys(&self) -> &[K] {
        match self {
            Node::Leaf(leaf) => &leaf.keys,
            Node::Internal(internal) => &internal.keys,
        }
    }
}

/// Serializes a node into a page body. All integers are big-endian; keys and
/// values are length-prefixed.
pub fn encode_node<K, V>(
    node: &Node<K, V>,
    key_codec: &dyn Codec<K>,
    value_codec: &dyn Codec<V>,
) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(PAGE_SIZE);

    let (kind, keys) = match node {
        Node::Leaf(leaf) => (LEAF_NODE_KIND, &leaf.keys),
        Node::Internal(internal) => (INTERNAL_NODE_KIND, &internal.keys),
    };
    buf.put_u8(kind);
    buf.put_u32(keys.len() as u32);
    for key in keys {
        let bytes = key_codec.encode(key)?;
        buf.put_u32(bytes.len() as u32);
        buf.put_slice(&bytes);
    }

    match node {
        Node::Leaf(leaf) => {
            buf.put_u64(leaf.next_leaf.to_raw());
            for value in &leaf.values {
                let bytes = value_codec.encode(value)?;
                buf.put_u32(bytes.len() as u32);
                buf.put_slice(&bytes);
            }
        }
        Node::Internal(internal) => {
            for child in &internal.children {
                buf.put_u64(child.to_raw());
            }
        }
    }

    if buf.len() > PAGE_SIZE {
        return Err(Error::PageOverflow { len: buf.len() });
    }
    Ok(buf.to_vec())
}

fn need(buf: &impl Buf, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::corruption(format!("node body truncated in {what}")));
    }
    Ok(())
}

/// Deserializes a page body into a node. An all-zero (never written) page
/// decodes as an empty leaf; any other unknown kind byte is corruption.
pub fn decode_node<K, V>(
    data: &[u8],
    key_codec: &dyn Codec<K>,
    value_codec: &dyn Codec<V>,
) -> Result<Node<K, V>> {
    let mut buf = data;
    if buf.remaining() == 0 {
        return Ok(Node::Leaf(LeafNode::empty()));
    }

    let kind = buf.get_u8();
    if kind == 0 {
        return Ok(Node::Leaf(LeafNode::empty()));
    }
    if kind != LEAF_NODE_KIND && kind != INTERNAL_NODE_KIND {
        return Err(Error::corruption(format!("invalid node kind byte {kind}")));
    }

    need(&buf, 4, "key count")?;
    let key_count = buf.get_u32() as usize;
    if key_count > PAGE_SIZE {
        return Err(Error::corruption(format!(
            "implausible key count {key_count}"
        )));
    }

    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        need(&buf, 4, "key length")?;
        let len = buf.get_u32() as usize;
        need(&buf, len, "key bytes")?;
        let bytes = buf.copy_to_bytes(len);
        keys.push(key_codec.decode(&bytes)?);
    }

    if kind == LEAF_NODE_KIND {
        need(&buf, 8, "next leaf pointer")?;
        let next_leaf = PageId::from_raw(buf.get_u64());

        let mut values = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            need(&buf, 4, "value length")?;
            let len = buf.get_u32() as usize;
            need(&buf, len, "value bytes")?;
            let bytes = buf.copy_to_bytes(len);
            values.push(value_codec.decode(&bytes)?);
        }

        Ok(Node::Leaf(LeafNode {
            keys,
            values,
            next_leaf,
        }))
    } else {
        let mut children = Vec::with_capacity(key_count + 1);
        for _ in 0..key_count + 1 {
            need(&buf, 8, "child pointer")?;
            children.push(PageId::from_raw(buf.get_u64()));
        }

        Ok(Node::Internal(InternalNode { keys, children }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{IntCodec, StringCodec};

    #[test]
    fn leaf_round_trip() {
        let leaf: Node<i32, String> = Node::Leaf(LeafNode {
            keys: vec![1, 5, 9],
            values: vec!["a".into(), "b".into(), "c".into()],
            next_leaf: PageId::new(17),
        });

        let bytes = encode_node(&leaf, &IntCodec, &StringCodec).unwrap();
        assert_eq!(bytes[0], LEAF_NODE_KIND);

        match decode_node::<i32, String>(&bytes, &IntCodec, &StringCodec).unwrap() {
            Node::Leaf(decoded) => {
                assert_eq!(decoded.keys, vec![1, 5, 9]);
                assert_eq!(decoded.values, vec!["a", "b", "c"]);
                assert_eq!(decoded.next_leaf, PageId::new(17));
            }
            Node::Internal(_) => panic!("expected leaf"),
        }
    }

    #[test]
    fn last_leaf_keeps_invalid_next_pointer() {
        let leaf: Node<i32, String> = Node::Leaf(LeafNode::empty());
        let bytes = encode_node(&leaf, &IntCodec, &StringCodec).unwrap();
        match decode_node::<i32, String>(&bytes, &IntCodec, &StringCodec).unwrap() {
            Node::Leaf(decoded) => assert_eq!(decoded.next_leaf, PageId::INVALID),
            Node::Internal(_) => panic!("expected leaf"),
        }
    }

    #[test]
    fn internal_round_trip() {
        let internal: Node<i32, String> = Node::Internal(InternalNode {
            keys: vec![10, 20],
            children: vec![PageId::new(1), PageId::new(2), PageId::new(3)],
        });

        let bytes = encode_node(&internal, &IntCodec, &StringCodec).unwrap();
        assert_eq!(bytes[0], INTERNAL_NODE_KIND);

        match decode_node::<i32, String>(&bytes, &IntCodec, &StringCodec).unwrap() {
            Node::Internal(decoded) => {
                assert_eq!(decoded.keys, vec![10, 20]);
                assert_eq!(
                    decoded.children,
                    vec![PageId::new(1), PageId::new(2), PageId::new(3)]
                );
            }
            Node::Leaf(_) => panic!("expected internal"),
        }
    }

    #[test]
    fn zero_page_decodes_as_empty_leaf() {
        let zeros = vec![0u8; 64];
        match decode_node::<i32, String>(&zeros, &IntCodec, &StringCodec).unwrap() {
            Node::Leaf(leaf) => {
                assert!(leaf.keys.is_empty());
                assert!(leaf.values.is_empty());
            }
            Node::Internal(_) => panic!("expected leaf"),
        }
    }

    #[test]
    fn bad_kind_byte_is_corruption() {
        let data = vec![9u8, 0, 0, 0, 0];
        assert!(matches!(
            decode_node::<i32, String>(&data, &IntCodec, &StringCodec),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn truncated_body_is_corruption() {
        let leaf: Node<i32, String> = Node::Leaf(LeafNode {
            keys: vec![1],
            values: vec!["value".into()],
            next_leaf: PageId::INVALID,
        });
        let bytes = encode_node(&leaf, &IntCodec, &StringCodec).unwrap();
        assert!(matches!(
            decode_node::<i32, String>(&bytes[..bytes.len() - 3], &IntCodec, &StringCodec),
            Err(Error::Corruption(_))
        ));
    }
}
