//! Content identifiers: generic blob identifiers and typed chunk/node dedup identifiers.
//!
//! Every identifier is `algorithm_result ‖ algorithm_id`: a digest of even length
//! followed by one tag byte. The canonical text form is the hex encoding of the
//! whole value, so the last two hex digits are the algorithm id.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

use crate::error::{DedupError, DedupResult};

/// Digest length of chunk and node identifiers
pub const DEDUP_HASH_LEN: usize = 32;

const MIN_ALGORITHM_RESULT_LEN: usize = 3;

/// Closed registry of identifier algorithms. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AlgorithmId {
    /// Whole-content VSO rolling hash
    Vso = 0,
    /// Chunk-level dedup hash (leaf)
    Chunk = 1,
    /// Node-level dedup hash (interior)
    Node = 2,
}

impl AlgorithmId {
    /// Tag byte stored at the end of the identifier value
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for AlgorithmId {
    type Error = DedupError;

    fn try_from(value: u8) -> DedupResult<Self> {
        match value {
            0 => Ok(AlgorithmId::Vso),
            1 => Ok(AlgorithmId::Chunk),
            2 => Ok(AlgorithmId::Node),
            other => Err(DedupError::UnsupportedAlgorithm(other)),
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmId::Vso => write!(f, "vso"),
            AlgorithmId::Chunk => write!(f, "chunk"),
            AlgorithmId::Node => write!(f, "node"),
        }
    }
}

/// Dedup granularity implied by an identifier's algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobDedupLevel {
    /// Whole-file hash
    FileLevel,
    /// Chunk or node hash
    ChunkLevel,
    /// Algorithm not in the registry
    Unknown,
}

/// 64-bit hash used for probabilistic set membership.
pub trait LongHash {
    /// Returns a well-distributed 64-bit hash of the value
    fn long_hash(&self) -> u64;
}

/// SHA-512 truncated to 32 bytes, the digest behind chunk and node identifiers.
pub fn dedup_hash(data: &[u8]) -> [u8; DEDUP_HASH_LEN] {
    let digest = Sha512::digest(data);
    let mut out = [0u8; DEDUP_HASH_LEN];
    out.copy_from_slice(&digest[..DEDUP_HASH_LEN]);
    out
}

fn validate_algorithm_result(bytes: &[u8]) -> DedupResult<()> {
    if bytes.len() < MIN_ALGORITHM_RESULT_LEN || bytes.len() % 2 != 0 {
        return Err(DedupError::InvalidHash { len: bytes.len() });
    }
    Ok(())
}

fn decode_hex(text: &str) -> DedupResult<Vec<u8>> {
    let trimmed = text.trim();
    hex::decode(trimmed).map_err(|_| DedupError::InvalidHash {
        len: trimmed.len() / 2,
    })
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

/// Generic identifier over any registered or foreign algorithm.
///
/// Equality and ordering are byte-wise over the full value, which is the same
/// order as a case-insensitive comparison of the hex forms.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlobIdentifier {
    value: Vec<u8>,
}

impl BlobIdentifier {
    /// Builds an identifier from a digest and its algorithm tag
    pub fn from_algorithm_result(algorithm_result: &[u8], algorithm_id: u8) -> DedupResult<Self> {
        validate_algorithm_result(algorithm_result)?;
        let mut value = Vec::with_capacity(algorithm_result.len() + 1);
        value.extend_from_slice(algorithm_result);
        value.push(algorithm_id);
        Ok(Self { value })
    }

    /// Builds an identifier from a full value (digest followed by tag byte)
    pub fn from_bytes(value: &[u8]) -> DedupResult<Self> {
        match value.split_last() {
            Some((&algorithm_id, algorithm_result)) => {
                Self::from_algorithm_result(algorithm_result, algorithm_id)
            }
            None => Err(DedupError::InvalidHash { len: 0 }),
        }
    }

    /// Parses the canonical hex form; either case is accepted
    pub fn deserialize(value_including_algorithm: &str) -> DedupResult<Self> {
        Self::from_bytes(&decode_hex(value_including_algorithm)?)
    }

    /// Canonical uppercase hex of the full value
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.value)
    }

    /// Alias of [`BlobIdentifier::to_hex`]
    pub fn value_string(&self) -> String {
        self.to_hex()
    }

    /// Digest bytes without the tag
    pub fn algorithm_result(&self) -> &[u8] {
        &self.value[..self.value.len() - 1]
    }

    /// Hex of the digest without the tag
    pub fn algorithm_result_string(&self) -> String {
        hex::encode_upper(self.algorithm_result())
    }

    /// Tag byte
    pub fn algorithm_id(&self) -> u8 {
        self.value[self.value.len() - 1]
    }

    /// Full value: digest followed by tag
    pub fn bytes(&self) -> &[u8] {
        &self.value
    }

    /// Dedup granularity for the tag
    pub fn dedup_level(&self) -> BlobDedupLevel {
        match AlgorithmId::try_from(self.algorithm_id()) {
            Ok(AlgorithmId::Vso) => BlobDedupLevel::FileLevel,
            Ok(AlgorithmId::Chunk) | Ok(AlgorithmId::Node) => BlobDedupLevel::ChunkLevel,
            Err(_) => BlobDedupLevel::Unknown,
        }
    }

    /// Maps the identifier onto `[first_value, first_value + count)`.
    ///
    /// The first four digest bytes, read big-endian, are scaled linearly into the
    /// range, so identifiers spread evenly across shards or partitions.
    pub fn map_to_integer_range(&self, first_value: u32, count: u32) -> DedupResult<u32> {
        if count == 0 {
            return Err(DedupError::InvalidArgument(
                "count must be greater than zero".into(),
            ));
        }
        if u32::MAX - count < first_value {
            return Err(DedupError::InvalidArgument(format!(
                "range starting at {first_value} with {count} values overflows u32"
            )));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.value[..4]);
        let position = u64::from(u32::from_be_bytes(word));
        let scaled = position * u64::from(count - 1) / u64::from(u32::MAX);
        Ok(first_value + scaled as u32)
    }

    /// Random 32-byte identifier. Not suitable for anything security relevant.
    pub fn random(algorithm_id: AlgorithmId) -> Self {
        let mut value = vec![0u8; DEDUP_HASH_LEN + 1];
        rand::thread_rng().fill_bytes(&mut value[..DEDUP_HASH_LEN]);
        value[DEDUP_HASH_LEN] = algorithm_id.as_byte();
        Self { value }
    }

    /// Smallest 32-byte identifier
    pub fn min_value() -> Self {
        Self {
            value: vec![u8::MIN; DEDUP_HASH_LEN + 1],
        }
    }

    /// Largest 32-byte identifier
    pub fn max_value() -> Self {
        Self {
            value: vec![u8::MAX; DEDUP_HASH_LEN + 1],
        }
    }
}

impl Hash for BlobIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(le_u32(&self.value));
    }
}

impl LongHash for BlobIdentifier {
    fn long_hash(&self) -> u64 {
        if self.value.len() >= 8 {
            le_u64(&self.value)
        } else {
            u64::from(le_u32(&self.value))
        }
    }
}

impl fmt::Display for BlobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob:{}", self.to_hex())
    }
}

impl fmt::Debug for BlobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobIdentifier({})", self.to_hex())
    }
}

impl Serialize for BlobIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        BlobIdentifier::deserialize(&text).map_err(serde::de::Error::custom)
    }
}

macro_rules! dedup_identifier_kind {
    ($(#[$meta:meta])* $name:ident => $variant:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            hash: [u8; DEDUP_HASH_LEN],
        }

        impl $name {
            /// Algorithm tag carried by this kind
            pub const ALGORITHM: AlgorithmId = AlgorithmId::$variant;

            /// Wraps a 32-byte digest
            pub const fn from_hash(hash: [u8; DEDUP_HASH_LEN]) -> Self {
                Self { hash }
            }

            /// Builds from a digest slice, which must be exactly 32 bytes
            pub fn from_algorithm_result(algorithm_result: &[u8]) -> DedupResult<Self> {
                let hash: [u8; DEDUP_HASH_LEN] =
                    algorithm_result
                        .try_into()
                        .map_err(|_| DedupError::InvalidHash {
                            len: algorithm_result.len(),
                        })?;
                Ok(Self { hash })
            }

            /// Digest bytes
            pub fn hash(&self) -> &[u8; DEDUP_HASH_LEN] {
                &self.hash
            }

            /// Full value: digest followed by tag
            pub fn value(&self) -> [u8; DEDUP_HASH_LEN + 1] {
                let mut value = [0u8; DEDUP_HASH_LEN + 1];
                value[..DEDUP_HASH_LEN].copy_from_slice(&self.hash);
                value[DEDUP_HASH_LEN] = Self::ALGORITHM.as_byte();
                value
            }

            /// Canonical uppercase hex of the full value
            pub fn to_hex(&self) -> String {
                hex::encode_upper(self.value())
            }
        }

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                state.write_u32(le_u32(&self.hash));
            }
        }

        impl LongHash for $name {
            fn long_hash(&self) -> u64 {
                le_u64(&self.hash)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.hash.cmp(&other.hash)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl From<$name> for DedupIdentifier {
            fn from(id: $name) -> Self {
                DedupIdentifier::$variant(id)
            }
        }
    };
}

dedup_identifier_kind! {
    /// Identifier of a leaf chunk (algorithm id 1)
    ChunkDedupIdentifier => Chunk
}

dedup_identifier_kind! {
    /// Identifier of an interior node (algorithm id 2)
    NodeDedupIdentifier => Node
}

impl ChunkDedupIdentifier {
    /// Hashes chunk content
    pub fn calculate(content: &[u8]) -> Self {
        Self::from_hash(dedup_hash(content))
    }
}

impl NodeDedupIdentifier {
    /// Hashes a serialized child list (see [`crate::dedup::DedupNode::serialize`])
    pub fn calculate_from_serialized_node(serialized_node: &[u8]) -> Self {
        Self::from_hash(dedup_hash(serialized_node))
    }
}

/// Dedup identifier: a chunk or a node, told apart only by the tag byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum DedupIdentifier {
    /// Leaf chunk
    Chunk(ChunkDedupIdentifier),
    /// Interior node
    Node(NodeDedupIdentifier),
}

impl DedupIdentifier {
    /// Builds the variant selected by `algorithm_id`
    pub fn create(algorithm_result: &[u8], algorithm_id: u8) -> DedupResult<Self> {
        match AlgorithmId::try_from(algorithm_id)? {
            AlgorithmId::Chunk => Ok(DedupIdentifier::Chunk(
                ChunkDedupIdentifier::from_algorithm_result(algorithm_result)?,
            )),
            AlgorithmId::Node => Ok(DedupIdentifier::Node(
                NodeDedupIdentifier::from_algorithm_result(algorithm_result)?,
            )),
            AlgorithmId::Vso => Err(DedupError::UnsupportedAlgorithm(algorithm_id)),
        }
    }

    /// Builds from a full value (digest followed by tag)
    pub fn create_from_value(value: &[u8]) -> DedupResult<Self> {
        match value.split_last() {
            Some((&algorithm_id, algorithm_result)) => Self::create(algorithm_result, algorithm_id),
            None => Err(DedupError::InvalidHash { len: 0 }),
        }
    }

    /// Parses the canonical hex form; either case is accepted
    pub fn deserialize(value_including_algorithm: &str) -> DedupResult<Self> {
        Self::create_from_value(&decode_hex(value_including_algorithm)?)
    }

    /// Algorithm of the variant
    pub fn algorithm_id(&self) -> AlgorithmId {
        match self {
            DedupIdentifier::Chunk(_) => AlgorithmId::Chunk,
            DedupIdentifier::Node(_) => AlgorithmId::Node,
        }
    }

    /// Digest bytes
    pub fn hash(&self) -> &[u8; DEDUP_HASH_LEN] {
        match self {
            DedupIdentifier::Chunk(id) => id.hash(),
            DedupIdentifier::Node(id) => id.hash(),
        }
    }

    /// Full value: digest followed by tag
    pub fn value(&self) -> [u8; DEDUP_HASH_LEN + 1] {
        match self {
            DedupIdentifier::Chunk(id) => id.value(),
            DedupIdentifier::Node(id) => id.value(),
        }
    }

    /// Canonical uppercase hex of the full value
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.value())
    }

    /// Fallible cast to a chunk identifier
    pub fn as_chunk(&self) -> DedupResult<ChunkDedupIdentifier> {
        match self {
            DedupIdentifier::Chunk(id) => Ok(*id),
            DedupIdentifier::Node(_) => Err(DedupError::WrongIdentifierKind {
                expected: AlgorithmId::Chunk,
                actual: AlgorithmId::Node.as_byte(),
            }),
        }
    }

    /// Fallible cast to a node identifier
    pub fn as_node(&self) -> DedupResult<NodeDedupIdentifier> {
        match self {
            DedupIdentifier::Node(id) => Ok(*id),
            DedupIdentifier::Chunk(_) => Err(DedupError::WrongIdentifierKind {
                expected: AlgorithmId::Node,
                actual: AlgorithmId::Chunk.as_byte(),
            }),
        }
    }

    /// True for node identifiers
    pub fn is_node(&self) -> bool {
        matches!(self, DedupIdentifier::Node(_))
    }

    /// Generic form of the same value
    pub fn to_blob_identifier(&self) -> BlobIdentifier {
        BlobIdentifier {
            value: self.value().to_vec(),
        }
    }
}

impl PartialOrd for DedupIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DedupIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value().cmp(&other.value())
    }
}

impl LongHash for DedupIdentifier {
    fn long_hash(&self) -> u64 {
        le_u64(self.hash())
    }
}

impl TryFrom<&BlobIdentifier> for DedupIdentifier {
    type Error = DedupError;

    fn try_from(blob_id: &BlobIdentifier) -> DedupResult<Self> {
        DedupIdentifier::create(blob_id.algorithm_result(), blob_id.algorithm_id())
    }
}

impl TryFrom<BlobIdentifier> for DedupIdentifier {
    type Error = DedupError;

    fn try_from(blob_id: BlobIdentifier) -> DedupResult<Self> {
        DedupIdentifier::try_from(&blob_id)
    }
}

impl From<DedupIdentifier> for BlobIdentifier {
    fn from(id: DedupIdentifier) -> Self {
        id.to_blob_identifier()
    }
}

impl fmt::Display for DedupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DedupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupIdentifier::Chunk(id) => fmt::Debug::fmt(id, f),
            DedupIdentifier::Node(id) => fmt::Debug::fmt(id, f),
        }
    }
}

impl Serialize for DedupIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DedupIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        DedupIdentifier::deserialize(&text).map_err(serde::de::Error::custom)
    }
}
