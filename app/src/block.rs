use crate::{
    crypto::{self, Hash, Keypair, PublicKey, Signature},
    schema::{self, Validator},
    serde_utils::{amount, hex_array},
    spec::ChainSpec,
    store::DbOp,
    transaction::{self, Transaction, TransactionError, TransactionLogic},
};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::*;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Failed to validate block schema: {0}")]
    Schema(String),
    #[error("Block validation failed. One of reward,totalFee,totalAmount is lt 0")]
    NegativeAmount,
    #[error("Invalid block body: {0}")]
    Malformed(String),
    #[error("Block totals overflow")]
    Overflow,
    #[error("Invalid previous block id {0}")]
    InvalidPreviousId(String),
    #[error("Invalid block id {actual}, expected {expected}")]
    InvalidId { expected: String, actual: String },
    #[error("Failed to verify block signature")]
    InvalidSignature,
    #[error("Invalid payload hash")]
    InvalidPayloadHash,
    #[error("Invalid payload length {actual}, expected {expected}")]
    InvalidPayloadLength { expected: u32, actual: u32 },
    #[error("Invalid number of transactions {actual}, expected {expected}")]
    InvalidTransactionCount { expected: u32, actual: u32 },
    #[error("Invalid total amount or total fee")]
    InvalidTotals,
    #[error("Invalid previous block {actual:?}, expected {expected}")]
    InvalidPreviousBlock { expected: String, actual: Option<String> },
    #[error("Invalid block height {actual}, expected {expected}")]
    InvalidHeight { expected: u64, actual: u64 },
    #[error("Invalid block timestamp {0}")]
    InvalidTimestamp(u32),
    #[error("Invalid block version {0}")]
    InvalidVersion(u32),
    #[error("Invalid block reward {actual}, expected {expected}")]
    InvalidReward { expected: u64, actual: u64 },
    #[error("Encountered duplicate transaction {0} in block")]
    DuplicateTransaction(String),
    #[error("Genesis block does not match the configured one")]
    GenesisMismatch,
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub id: String,
    pub version: u32,
    pub timestamp: u32,
    pub height: u64,
    /// Absent only at genesis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_block: Option<String>,
    pub number_of_transactions: u32,
    #[serde(with = "amount")]
    pub total_amount: u64,
    #[serde(with = "amount")]
    pub total_fee: u64,
    #[serde(with = "amount")]
    pub reward: u64,
    pub payload_length: u32,
    #[serde(with = "hex_array")]
    pub payload_hash: Hash,
    #[serde(with = "hex_array")]
    pub generator_public_key: PublicKey,
    #[serde(with = "hex_array")]
    pub block_signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub header: BlockHeader,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 1
    }
}

fn previous_bytes(previous: &Option<String>) -> Result<[u8; 8], BlockError> {
    match previous {
        Some(id) => crypto::id_to_u64(id)
            .map(u64::to_be_bytes)
            .ok_or_else(|| BlockError::InvalidPreviousId(id.clone())),
        None => Ok([0u8; 8]),
    }
}

/// Canonical header bytes.
pub fn bytes(header: &BlockHeader, include_signature: bool) -> Result<Vec<u8>, BlockError> {
    let mut out = Vec::with_capacity(180);
    out.extend_from_slice(&header.version.to_le_bytes());
    out.extend_from_slice(&header.timestamp.to_le_bytes());
    out.extend_from_slice(&previous_bytes(&header.previous_block)?);
    out.extend_from_slice(&header.number_of_transactions.to_le_bytes());
    out.extend_from_slice(&header.total_amount.to_le_bytes());
    out.extend_from_slice(&header.total_fee.to_le_bytes());
    out.extend_from_slice(&header.reward.to_le_bytes());
    out.extend_from_slice(&header.payload_length.to_le_bytes());
    out.extend_from_slice(&header.payload_hash);
    out.extend_from_slice(&header.generator_public_key);
    if include_signature {
        out.extend_from_slice(&header.block_signature);
    }
    Ok(out)
}

pub fn hash(header: &BlockHeader, include_signature: bool) -> Result<Hash, BlockError> {
    Ok(crypto::sha256(&bytes(header, include_signature)?))
}

pub fn id(header: &BlockHeader) -> Result<String, BlockError> {
    Ok(crypto::id_from_hash(&hash(header, true)?))
}

/// Totals and payload digest over an ordered transaction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub total_amount: u64,
    pub total_fee: u64,
    pub length: u32,
    pub hash: Hash,
}

impl Payload {
    pub fn compute(transactions: &[Transaction]) -> Result<Self, BlockError> {
        let mut total_amount = 0u64;
        let mut total_fee = 0u64;
        let mut payload = Vec::with_capacity(transactions.len() * 125);
        for tx in transactions {
            total_amount = total_amount.checked_add(tx.amount).ok_or(BlockError::Overflow)?;
            total_fee = total_fee.checked_add(tx.fee).ok_or(BlockError::Overflow)?;
            payload.extend_from_slice(&transaction::bytes(tx, true)?);
        }
        Ok(Self {
            total_amount,
            total_fee,
            length: u32::try_from(payload.len()).map_err(|_| BlockError::Overflow)?,
            hash: crypto::sha256(&payload),
        })
    }
}

/// A block whose header is complete except for its signature and id.
#[derive(Debug, Clone)]
pub struct BlockDraft {
    header: BlockHeader,
    transactions: Vec<Transaction>,
    unsigned: Vec<u8>,
}

impl BlockDraft {
    pub fn new(
        generator: &PublicKey,
        previous: Option<&BlockHeader>,
        version: u32,
        timestamp: u32,
        reward: u64,
        transactions: Vec<Transaction>,
    ) -> Result<Self, BlockError> {
        let payload = Payload::compute(&transactions)?;
        let header = BlockHeader {
            id: String::new(),
            version,
            timestamp,
            height: previous.map_or(1, |previous| previous.height + 1),
            previous_block: previous.map(|previous| previous.id.clone()),
            number_of_transactions: u32::try_from(transactions.len()).map_err(|_| BlockError::Overflow)?,
            total_amount: payload.total_amount,
            total_fee: payload.total_fee,
            reward,
            payload_length: payload.length,
            payload_hash: payload.hash,
            generator_public_key: *generator,
            block_signature: [0u8; 64],
        };
        let unsigned = bytes(&header, false)?;
        Ok(Self {
            header,
            transactions,
            unsigned,
        })
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn sign(self, keypair: &Keypair) -> Block {
        let mut header = self.header;
        header.block_signature = keypair.sign(&crypto::sha256(&self.unsigned));
        let mut signed = self.unsigned;
        signed.extend_from_slice(&header.block_signature);
        header.id = crypto::id_from_hash(&crypto::sha256(&signed));
        Block {
            header,
            transactions: self.transactions,
        }
    }
}

pub fn forge(
    keypair: &Keypair,
    previous: Option<&BlockHeader>,
    version: u32,
    timestamp: u32,
    reward: u64,
    transactions: Vec<Transaction>,
) -> Result<Block, BlockError> {
    Ok(BlockDraft::new(&keypair.public_key(), previous, version, timestamp, reward, transactions)?.sign(keypair))
}

pub struct BlockLogic {
    spec: Arc<ChainSpec>,
    transactions: Arc<TransactionLogic>,
    validator: Arc<dyn Validator>,
}

impl BlockLogic {
    pub fn new(spec: Arc<ChainSpec>, transactions: Arc<TransactionLogic>, validator: Arc<dyn Validator>) -> Self {
        Self {
            spec,
            transactions,
            validator,
        }
    }

    /// Next block on top of `previous`, with the reward the schedule assigns to its height.
    pub fn create(
        &self,
        keypair: &Keypair,
        previous: &BlockHeader,
        timestamp: u32,
        transactions: Vec<Transaction>,
    ) -> Result<Block, BlockError> {
        let reward = self.spec.reward_at(previous.height + 1);
        let block = forge(
            keypair,
            Some(previous),
            self.spec.block_version,
            timestamp,
            reward,
            transactions,
        )?;
        debug!(id = %block.header.id, height = block.header.height, "Created block");
        Ok(block)
    }

    pub fn get_bytes(&self, header: &BlockHeader, include_signature: bool) -> Result<Vec<u8>, BlockError> {
        bytes(header, include_signature)
    }

    pub fn get_hash(&self, header: &BlockHeader, include_signature: bool) -> Result<Hash, BlockError> {
        hash(header, include_signature)
    }

    pub fn get_id(&self, header: &BlockHeader) -> Result<String, BlockError> {
        id(header)
    }

    pub fn sign(&self, header: &BlockHeader, keypair: &Keypair) -> Result<Signature, BlockError> {
        Ok(keypair.sign(&hash(header, false)?))
    }

    pub fn verify_signature(&self, header: &BlockHeader) -> bool {
        match hash(header, false) {
            Ok(digest) => crypto::verify(&digest, &header.block_signature, &header.generator_public_key),
            Err(_) => false,
        }
    }

    /// Validates untrusted JSON into a typed block. Unknown properties are
    /// dropped; numeric amounts may arrive as decimal strings.
    pub fn object_normalize(&self, raw: &Value) -> Result<Block, BlockError> {
        self.validator
            .check(raw, &schema::BLOCK)
            .map_err(|error| BlockError::Schema(error.message))?;

        for field in ["reward", "totalFee", "totalAmount"] {
            let negative = match &raw[field] {
                Value::Number(n) => n.as_i64().map_or(false, |n| n < 0),
                Value::String(s) => s.starts_with('-'),
                _ => false,
            };
            if negative {
                return Err(BlockError::NegativeAmount);
            }
        }

        let mut header_value = raw.clone();
        let raw_transactions = header_value
            .as_object_mut()
            .and_then(|object| object.remove("transactions"))
            .unwrap_or(Value::Array(Vec::new()));
        let header: BlockHeader =
            serde_json::from_value(header_value).map_err(|e| BlockError::Malformed(e.to_string()))?;
        if header.height != 1 && header.previous_block.is_none() {
            return Err(BlockError::Schema("Missing required property: previousBlock".into()));
        }

        let transactions = raw_transactions
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|item| self.transactions.object_normalize(item))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Block { header, transactions })
    }

    /// Structural and cryptographic checks of `block` as the successor of `previous`.
    pub fn verify_block(&self, block: &Block, previous: &BlockHeader) -> Result<(), BlockError> {
        let header = &block.header;
        if header.version != self.spec.block_version {
            return Err(BlockError::InvalidVersion(header.version));
        }
        let expected_id = id(header)?;
        if expected_id != header.id {
            return Err(BlockError::InvalidId {
                expected: expected_id,
                actual: header.id.clone(),
            });
        }
        if !self.verify_signature(header) {
            return Err(BlockError::InvalidSignature);
        }
        if header.previous_block.as_deref() != Some(previous.id.as_str()) {
            return Err(BlockError::InvalidPreviousBlock {
                expected: previous.id.clone(),
                actual: header.previous_block.clone(),
            });
        }
        if header.height != previous.height + 1 {
            return Err(BlockError::InvalidHeight {
                expected: previous.height + 1,
                actual: header.height,
            });
        }
        if header.timestamp <= previous.timestamp {
            return Err(BlockError::InvalidTimestamp(header.timestamp));
        }
        let expected_reward = self.spec.reward_at(header.height);
        if header.reward != expected_reward {
            return Err(BlockError::InvalidReward {
                expected: expected_reward,
                actual: header.reward,
            });
        }
        self.verify_payload(block)
    }

    pub fn verify_payload(&self, block: &Block) -> Result<(), BlockError> {
        let header = &block.header;
        let count = u32::try_from(block.transactions.len()).map_err(|_| BlockError::Overflow)?;
        if count != header.number_of_transactions {
            return Err(BlockError::InvalidTransactionCount {
                expected: header.number_of_transactions,
                actual: count,
            });
        }
        let mut seen = HashSet::new();
        for tx in &block.transactions {
            if !seen.insert(tx.id.as_str()) {
                return Err(BlockError::DuplicateTransaction(tx.id.clone()));
            }
        }
        let payload = Payload::compute(&block.transactions)?;
        if payload.length != header.payload_length {
            return Err(BlockError::InvalidPayloadLength {
                expected: payload.length,
                actual: header.payload_length,
            });
        }
        if payload.hash != header.payload_hash {
            return Err(BlockError::InvalidPayloadHash);
        }
        if payload.total_amount != header.total_amount || payload.total_fee != header.total_fee {
            return Err(BlockError::InvalidTotals);
        }
        Ok(())
    }

    /// Header-only insert; transactions are stored through their own ops.
    pub fn db_save_op(&self, block: &Block) -> DbOp {
        DbOp::CreateBlock(block.header.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema::SchemaValidator, testing};
    use serde_json::json;

    const REFERENCE_ID: &str = "15158714392463150213";

    fn logic() -> BlockLogic {
        let spec = Arc::new(testing::spec());
        let validator: Arc<dyn Validator> = Arc::new(SchemaValidator);
        let transactions = Arc::new(TransactionLogic::new(spec.clone(), validator.clone()));
        BlockLogic::new(spec, transactions, validator)
    }

    fn reference_block() -> Block {
        let previous = BlockHeader {
            id: "1".into(),
            height: 10,
            ..testing::reference_header()
        };
        forge(
            &testing::generator(),
            Some(&previous),
            0,
            1000,
            30_000_000,
            testing::reference_transactions().to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn reference_block_matches_known_digests() {
        let block = reference_block();
        let header = &block.header;
        assert_eq!(header.height, 11);
        assert_eq!(header.payload_length, 375);
        assert_eq!(
            hex::encode(header.payload_hash),
            "86e7a3fba0217c29ae3b198d32963138c64e213d7e864ee0423c134f955dfc45"
        );
        assert_eq!(header.total_amount, 326_732_673_000_000);
        assert_eq!(header.total_fee, 11);
        assert_eq!(
            hex::encode(hash(header, false).unwrap()),
            "b21b9b93a0363e141d860559ff431761d0660df526ab4947f08d1d69faa6c023"
        );
        assert_eq!(
            hex::encode(header.block_signature),
            "57daddd767f3dd88c14dc3c38b972398ecf0b131ad9966052ff79bb690cd1ad6f9d8996d5d6fb892773db929aac760dfbfcca418e444cbdd95942d71a0caff0b"
        );
        assert_eq!(
            hex::encode(hash(header, true).unwrap()),
            "850c5ef66c925ed2ecf94c602ea01da5d5a0c821223d6191fd4a36c9996cbd34"
        );
        assert_eq!(header.id, REFERENCE_ID);
        assert!(logic().verify_signature(header));
    }

    #[test]
    fn signature_breaks_when_header_changes() {
        let logic = logic();
        let mut header = reference_block().header;
        header.total_fee += 1;
        assert!(!logic.verify_signature(&header));
    }

    #[test]
    fn normalize_round_trips_and_drops_unknown_fields() {
        let logic = logic();
        let block = reference_block();
        let mut raw = serde_json::to_value(&block).unwrap();
        raw["foo"] = json!("bar");
        raw["totalAmount"] = json!(block.header.total_amount.to_string());
        let normalized = logic.object_normalize(&raw).unwrap();
        assert_eq!(normalized, block);
        let again = logic
            .object_normalize(&serde_json::to_value(&normalized).unwrap())
            .unwrap();
        assert_eq!(again, normalized);
    }

    #[test]
    fn normalize_accepts_byte_arrays_for_buffers() {
        let block = reference_block();
        let mut raw = serde_json::to_value(&block).unwrap();
        raw["payloadHash"] = json!(block.header.payload_hash.to_vec());
        assert_eq!(logic().object_normalize(&raw).unwrap(), block);
    }

    #[test]
    fn normalize_reports_first_schema_error() {
        let logic = logic();
        let raw = serde_json::to_value(reference_block()).unwrap();
        let error_for = |mutate: &dyn Fn(&mut Value)| {
            let mut value = raw.clone();
            mutate(&mut value);
            logic.object_normalize(&value).unwrap_err().to_string()
        };

        assert_eq!(
            error_for(&|v| {
                v.as_object_mut().unwrap().remove("id");
            }),
            "Failed to validate block schema: Missing required property: id"
        );
        assert_eq!(
            error_for(&|v| v["height"] = json!(0)),
            "Failed to validate block schema: Value 0 is less than minimum 1"
        );
        assert!(error_for(&|v| v["id"] = json!("1".repeat(21))).contains("String is too long"));
        assert!(error_for(&|v| v["id"] = json!("")).contains("String is too short"));
        assert_eq!(
            error_for(&|v| v["id"] = json!("a1a")),
            "Failed to validate block schema: Object didn't pass validation for format id: a1a"
        );
        assert!(error_for(&|v| v["blockSignature"] = json!("aaaa"))
            .contains("Object didn't pass validation for format signatureBuf"));
        assert!(error_for(&|v| v["generatorPublicKey"] = json!("zz"))
            .contains("Object didn't pass validation for format publicKeyBuf"));
        assert!(error_for(&|v| v["payloadHash"] = json!("00"))
            .contains("Object didn't pass validation for format sha256Buf"));
        assert_eq!(
            error_for(&|v| v["blockSignature"] = Value::Null),
            "Failed to validate block schema: Missing required property: blockSignature"
        );
        assert_eq!(
            error_for(&|v| {
                v.as_object_mut().unwrap().remove("previousBlock");
            }),
            "Failed to validate block schema: Missing required property: previousBlock"
        );
    }

    #[test]
    fn normalize_rejects_negative_amounts() {
        let logic = logic();
        let raw = serde_json::to_value(reference_block()).unwrap();
        for field in ["reward", "totalFee", "totalAmount"] {
            let mut value = raw.clone();
            value[field] = json!(-1);
            assert_eq!(logic.object_normalize(&value), Err(BlockError::NegativeAmount));
            value[field] = json!("-5");
            assert_eq!(logic.object_normalize(&value), Err(BlockError::NegativeAmount));
        }
    }

    #[test]
    fn verify_block_checks_linkage_and_payload() {
        let logic = logic();
        let genesis = testing::spec().genesis_block;
        let block = logic
            .create(&testing::generator(), &genesis.header, 10, Vec::new())
            .unwrap();
        assert_eq!(logic.verify_block(&block, &genesis.header), Ok(()));

        let mut orphan = genesis.header.clone();
        orphan.id = "42".into();
        assert!(matches!(
            logic.verify_block(&block, &orphan),
            Err(BlockError::InvalidPreviousBlock { .. })
        ));

        let mut padded = block.clone();
        padded.transactions = testing::reference_transactions().to_vec();
        assert!(matches!(
            logic.verify_block(&padded, &genesis.header),
            Err(BlockError::InvalidTransactionCount { .. })
        ));
    }

    #[test]
    fn db_save_op_stores_header_only() {
        let block = reference_block();
        assert_eq!(logic().db_save_op(&block), DbOp::CreateBlock(block.header.clone()));
    }
}
