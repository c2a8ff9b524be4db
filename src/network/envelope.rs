use base64::Engine;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use stellar_xdr::curr::{
    AccountId, AlphaNum12, AlphaNum4, Asset, AssetCode12, AssetCode4, CreateAccountOp,
    DecoratedSignature, Duration as XdrDuration, FeeBumpTransaction, FeeBumpTransactionEnvelope,
    FeeBumpTransactionExt, FeeBumpTransactionInnerTx, Hash, LedgerBounds, Limits, Memo,
    MuxedAccount, Operation, OperationBody, PaymentOp, Preconditions, PreconditionsV2, PublicKey,
    ReadXdr, SequenceNumber, StringM, TimeBounds, TimePoint, Transaction, TransactionEnvelope,
    TransactionExt, TransactionSignaturePayload, TransactionSignaturePayloadTaggedTransaction,
    TransactionV1Envelope, Uint256, VecM, WriteXdr,
};

use crate::error::{AppError, AppResult, SubmissionError};
use crate::signing::keys::decode_public_key;
use crate::store::models::{LedgerWindow, MemoType};

pub const STROOPS_PER_UNIT: Decimal = dec!(10000000);
const MAX_AMOUNT_SCALE: u32 = 7;
/// Upper time bound on every transaction, on top of the ledger bounds.
pub const TX_TIMEOUT_SECS: u64 = 300;

fn rejected(code: &str, reason: impl Into<String>) -> AppError {
    SubmissionError::TerminalRejection {
        code: code.to_string(),
        reason: reason.into(),
    }
    .into()
}

// ========== HASHING ==========

pub fn network_id(passphrase: &str) -> Hash {
    Hash(Sha256::digest(passphrase.as_bytes()).into())
}

fn payload_hash(tagged: TransactionSignaturePayloadTaggedTransaction, passphrase: &str) -> AppResult<[u8; 32]> {
    let payload = TransactionSignaturePayload {
        network_id: network_id(passphrase),
        tagged_transaction: tagged,
    };
    let bytes = payload.to_xdr(Limits::none())?;
    Ok(Sha256::digest(&bytes).into())
}

pub fn transaction_hash(tx: &Transaction, passphrase: &str) -> AppResult<[u8; 32]> {
    payload_hash(TransactionSignaturePayloadTaggedTransaction::Tx(tx.clone()), passphrase)
}

pub fn fee_bump_hash(fee_bump: &FeeBumpTransaction, passphrase: &str) -> AppResult<[u8; 32]> {
    payload_hash(
        TransactionSignaturePayloadTaggedTransaction::TxFeeBump(fee_bump.clone()),
        passphrase,
    )
}

pub fn envelope_hash(envelope: &TransactionEnvelope, passphrase: &str) -> AppResult<[u8; 32]> {
    match envelope {
        TransactionEnvelope::Tx(v1) => transaction_hash(&v1.tx, passphrase),
        TransactionEnvelope::TxFeeBump(fb) => fee_bump_hash(&fb.tx, passphrase),
        TransactionEnvelope::TxV0(_) => Err(AppError::InvalidInput("v0 envelopes are not supported".into())),
    }
}

// ========== ENCODING ==========

pub fn encode_envelope(envelope: &TransactionEnvelope) -> AppResult<String> {
    let bytes = envelope.to_xdr(Limits::none())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

pub fn decode_envelope(encoded: &str) -> AppResult<TransactionEnvelope> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| AppError::InvalidInput(format!("envelope is not valid base64: {}", e)))?;
    Ok(TransactionEnvelope::from_xdr(bytes, Limits::none())?)
}

// ========== PARSING ==========

/// Decimal string to stroops. Zero, negative, or more than 7 fractional
/// digits are rejected; no floating point is involved.
pub fn to_stroops(amount: &str) -> AppResult<i64> {
    let value = Decimal::from_str(amount.trim())
        .map_err(|_| rejected("invalid_amount", format!("amount {:?} is not a decimal", amount)))?;
    if value <= Decimal::ZERO {
        return Err(rejected("invalid_amount", format!("amount {} must be positive", amount)));
    }
    if value.normalize().scale() > MAX_AMOUNT_SCALE {
        return Err(rejected(
            "invalid_amount",
            format!("amount {} has more than {} decimal places", amount, MAX_AMOUNT_SCALE),
        ));
    }
    (value * STROOPS_PER_UNIT)
        .to_i64()
        .ok_or_else(|| rejected("invalid_amount", format!("amount {} is out of range", amount)))
}

pub fn muxed_account(account: &str) -> AppResult<MuxedAccount> {
    Ok(MuxedAccount::Ed25519(Uint256(decode_public_key(account)?)))
}

pub fn account_id(account: &str) -> AppResult<AccountId> {
    Ok(AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(
        decode_public_key(account)?,
    ))))
}

fn destination(account: &str) -> AppResult<MuxedAccount> {
    decode_public_key(account)
        .map(|bytes| MuxedAccount::Ed25519(Uint256(bytes)))
        .map_err(|_| rejected("invalid_destination", format!("invalid destination account ({})", account)))
}

pub fn parse_asset(code: &str, issuer: Option<&str>) -> AppResult<Asset> {
    let issuer = issuer.filter(|i| !i.is_empty());
    if code.is_empty() {
        return Err(rejected("invalid_asset", "asset code cannot be empty"));
    }
    if code.eq_ignore_ascii_case("XLM") && issuer.is_none() {
        return Ok(Asset::Native);
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(rejected("invalid_asset", format!("invalid asset code {:?}", code)));
    }

    let issuer = issuer.ok_or_else(|| rejected("invalid_asset", format!("asset {} has no issuer", code)))?;
    let issuer = account_id(issuer)
        .map_err(|_| rejected("invalid_asset", format!("invalid asset issuer: {}", issuer)))?;

    let bytes = code.as_bytes();
    match bytes.len() {
        1..=4 => {
            let mut padded = [0u8; 4];
            padded[..bytes.len()].copy_from_slice(bytes);
            Ok(Asset::CreditAlphanum4(AlphaNum4 {
                asset_code: AssetCode4(padded),
                issuer,
            }))
        }
        5..=12 => {
            let mut padded = [0u8; 12];
            padded[..bytes.len()].copy_from_slice(bytes);
            Ok(Asset::CreditAlphanum12(AlphaNum12 {
                asset_code: AssetCode12(padded),
                issuer,
            }))
        }
        _ => Err(rejected("invalid_asset", format!("asset code {:?} is too long", code))),
    }
}

pub fn parse_memo(memo: Option<&str>, memo_type: Option<MemoType>) -> AppResult<Memo> {
    let memo = match memo {
        Some(m) if !m.is_empty() => m,
        _ => return Ok(Memo::None),
    };
    match memo_type.unwrap_or(MemoType::Text) {
        MemoType::Text => StringM::<28>::try_from(memo.as_bytes().to_vec())
            .map(Memo::Text)
            .map_err(|_| rejected("invalid_memo", format!("text memo {:?} exceeds 28 bytes", memo))),
        MemoType::Id => memo
            .parse::<u64>()
            .map(Memo::Id)
            .map_err(|_| rejected("invalid_memo", format!("id memo {:?} is not a u64", memo))),
        MemoType::Hash => {
            let bytes = hex::decode(memo)
                .map_err(|_| rejected("invalid_memo", format!("hash memo {:?} is not hex", memo)))?;
            let hash: [u8; 32] = bytes
                .try_into()
                .map_err(|_| rejected("invalid_memo", "hash memo must be 32 bytes"))?;
            Ok(Memo::Hash(Hash(hash)))
        }
    }
}

// ========== BUILDING ==========

/// Fields of a single payment transaction.
#[derive(Debug, Clone)]
pub struct PaymentParams<'a> {
    /// Transaction source, whose sequence number is consumed.
    pub source: &'a str,
    /// Account debited by the payment. `None` debits `source`.
    pub payment_source: Option<&'a str>,
    pub destination: &'a str,
    pub amount: &'a str,
    pub asset_code: &'a str,
    pub asset_issuer: Option<&'a str>,
    pub memo: Option<&'a str>,
    pub memo_type: Option<MemoType>,
    pub sequence: i64,
    pub base_fee: u32,
    pub window: LedgerWindow,
    pub max_time: u64,
}

pub fn max_time_from_now(timeout_secs: u64) -> u64 {
    (chrono::Utc::now().timestamp().max(0) as u64).saturating_add(timeout_secs)
}

pub fn build_transaction(
    source: &str,
    sequence: i64,
    base_fee: u32,
    window: LedgerWindow,
    max_time: u64,
    memo: Memo,
    operations: Vec<Operation>,
) -> AppResult<Transaction> {
    let fee = base_fee.saturating_mul(operations.len() as u32);
    Ok(Transaction {
        source_account: muxed_account(source)?,
        fee,
        seq_num: SequenceNumber(sequence),
        cond: Preconditions::V2(PreconditionsV2 {
            time_bounds: Some(TimeBounds {
                min_time: TimePoint(0),
                max_time: TimePoint(max_time),
            }),
            ledger_bounds: Some(LedgerBounds {
                min_ledger: window.min_ledger,
                max_ledger: window.max_ledger,
            }),
            min_seq_num: None,
            min_seq_age: XdrDuration(0),
            min_seq_ledger_gap: 0,
            extra_signers: VecM::default(),
        }),
        memo,
        operations: operations.try_into()?,
        ext: TransactionExt::V0,
    })
}

pub fn build_payment(params: &PaymentParams<'_>) -> AppResult<Transaction> {
    let payment_source = params
        .payment_source
        .filter(|account| *account != params.source)
        .map(muxed_account)
        .transpose()?;
    let operation = Operation {
        source_account: payment_source,
        body: OperationBody::Payment(PaymentOp {
            destination: destination(params.destination)?,
            asset: parse_asset(params.asset_code, params.asset_issuer)?,
            amount: to_stroops(params.amount)?,
        }),
    };
    build_transaction(
        params.source,
        params.sequence,
        params.base_fee,
        params.window,
        params.max_time,
        parse_memo(params.memo, params.memo_type)?,
        vec![operation],
    )
}

pub fn create_account_operation(destination: &str, starting_balance: &str) -> AppResult<Operation> {
    Ok(Operation {
        source_account: None,
        body: OperationBody::CreateAccount(CreateAccountOp {
            destination: account_id(destination)?,
            starting_balance: to_stroops(starting_balance)?,
        }),
    })
}

pub fn account_merge_operation(destination: &str) -> AppResult<Operation> {
    Ok(Operation {
        source_account: None,
        body: OperationBody::AccountMerge(muxed_account(destination)?),
    })
}

pub fn signed_envelope(tx: Transaction, signatures: Vec<DecoratedSignature>) -> AppResult<TransactionEnvelope> {
    Ok(TransactionEnvelope::Tx(TransactionV1Envelope {
        tx,
        signatures: signatures.try_into()?,
    }))
}

/// Appends the signatures of `other` to `envelope`. Both must carry the same transaction.
pub fn merge_signatures(envelope: TransactionEnvelope, other: TransactionEnvelope) -> AppResult<TransactionEnvelope> {
    match (envelope, other) {
        (TransactionEnvelope::Tx(mut base), TransactionEnvelope::Tx(extra)) if base.tx == extra.tx => {
            let mut signatures = base.signatures.to_vec();
            for signature in extra.signatures.iter() {
                if !signatures.contains(signature) {
                    signatures.push(signature.clone());
                }
            }
            base.signatures = signatures.try_into()?;
            Ok(TransactionEnvelope::Tx(base))
        }
        _ => Err(AppError::Internal("cannot merge signatures of different transactions".into())),
    }
}

/// Hash of the transaction every variant of a fee-bumped attempt shares.
pub fn inner_hash(envelope: &TransactionEnvelope, passphrase: &str) -> AppResult<[u8; 32]> {
    match envelope {
        TransactionEnvelope::TxFeeBump(fb) => match &fb.tx.inner_tx {
            FeeBumpTransactionInnerTx::Tx(inner) => transaction_hash(&inner.tx, passphrase),
        },
        other => envelope_hash(other, passphrase),
    }
}

/// Wraps a signed inner envelope with a higher fee, keeping its sequence number.
pub fn build_fee_bump(
    inner: &TransactionEnvelope,
    fee_source: &str,
    base_fee: u32,
    multiplier: u32,
) -> AppResult<FeeBumpTransaction> {
    let v1 = match inner {
        TransactionEnvelope::Tx(v1) => v1.clone(),
        _ => return Err(AppError::InvalidInput("only v1 envelopes can be fee-bumped".into())),
    };
    let operations = v1.tx.operations.len() as i64;
    let fee = (base_fee as i64) * (multiplier.max(1) as i64) * (operations + 1);
    let fee = fee.max(v1.tx.fee as i64 * 2);
    Ok(FeeBumpTransaction {
        fee_source: muxed_account(fee_source)?,
        fee,
        inner_tx: FeeBumpTransactionInnerTx::Tx(v1),
        ext: FeeBumpTransactionExt::V0,
    })
}

pub fn fee_bump_envelope(
    fee_bump: FeeBumpTransaction,
    signatures: Vec<DecoratedSignature>,
) -> AppResult<TransactionEnvelope> {
    Ok(TransactionEnvelope::TxFeeBump(FeeBumpTransactionEnvelope {
        tx: fee_bump,
        signatures: signatures.try_into()?,
    }))
}

/// Sequence number of the transaction inside any envelope.
pub fn envelope_sequence(envelope: &TransactionEnvelope) -> Option<i64> {
    match envelope {
        TransactionEnvelope::Tx(v1) => Some(v1.tx.seq_num.0),
        TransactionEnvelope::TxFeeBump(fb) => match &fb.tx.inner_tx {
            FeeBumpTransactionInnerTx::Tx(inner) => Some(inner.tx.seq_num.0),
        },
        TransactionEnvelope::TxV0(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::keys::KeyPair;
    use crate::config::TEST_NETWORK_PASSPHRASE;

    fn params<'a>(source: &'a str, destination: &'a str, amount: &'a str) -> PaymentParams<'a> {
        PaymentParams {
            source,
            payment_source: None,
            destination,
            amount,
            asset_code: "XLM",
            asset_issuer: None,
            memo: None,
            memo_type: None,
            sequence: 42,
            base_fee: 100,
            window: LedgerWindow::starting_at(12_340, 10),
            max_time: 1_900_000_000,
        }
    }

    #[test]
    fn test_to_stroops() {
        assert_eq!(to_stroops("10.0000000").unwrap(), 100_000_000);
        assert_eq!(to_stroops("0.0000001").unwrap(), 1);
        assert_eq!(to_stroops("1.50").unwrap(), 15_000_000);
        assert!(to_stroops("0").unwrap_err().is_terminal_rejection());
        assert!(to_stroops("-1").unwrap_err().is_terminal_rejection());
        assert!(to_stroops("0.00000001").unwrap_err().is_terminal_rejection());
        assert!(to_stroops("abc").unwrap_err().is_terminal_rejection());
    }

    #[test]
    fn test_parse_asset() {
        assert_eq!(parse_asset("XLM", None).unwrap(), Asset::Native);
        let issuer = KeyPair::random();
        assert!(matches!(
            parse_asset("USDC", Some(issuer.public_key())).unwrap(),
            Asset::CreditAlphanum4(_)
        ));
        assert!(matches!(
            parse_asset("LONGERCODE", Some(issuer.public_key())).unwrap(),
            Asset::CreditAlphanum12(_)
        ));
        assert!(parse_asset("USDC", None).is_err());
        assert!(parse_asset("USDC", Some("GBAD")).is_err());
        assert!(parse_asset("", None).is_err());
    }

    #[test]
    fn test_parse_memo() {
        assert_eq!(parse_memo(None, None).unwrap(), Memo::None);
        assert_eq!(parse_memo(Some("123"), Some(MemoType::Id)).unwrap(), Memo::Id(123));
        assert!(matches!(parse_memo(Some("hello"), None).unwrap(), Memo::Text(_)));
        assert!(parse_memo(Some(&"x".repeat(29)), Some(MemoType::Text)).is_err());
        assert!(parse_memo(Some("zz"), Some(MemoType::Hash)).is_err());
        let hash_hex = hex::encode([1u8; 32]);
        assert_eq!(
            parse_memo(Some(&hash_hex), Some(MemoType::Hash)).unwrap(),
            Memo::Hash(Hash([1u8; 32]))
        );
    }

    #[test]
    fn test_build_payment_sets_bounds_and_sequence() {
        let source = KeyPair::random();
        let dest = KeyPair::random();
        let tx = build_payment(&params(source.public_key(), dest.public_key(), "10.0000000")).unwrap();

        assert_eq!(tx.seq_num.0, 42);
        assert_eq!(tx.fee, 100);
        match &tx.cond {
            Preconditions::V2(cond) => {
                let bounds = cond.ledger_bounds.clone().unwrap();
                assert_eq!(bounds.min_ledger, 12_340);
                assert_eq!(bounds.max_ledger, 12_350);
            }
            other => panic!("unexpected preconditions {:?}", other),
        }
        match &tx.operations[0].body {
            OperationBody::Payment(op) => assert_eq!(op.amount, 100_000_000),
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_channel_source_debits_distribution_account() {
        let channel = KeyPair::random();
        let distribution = KeyPair::random();
        let dest = KeyPair::random();
        let tx = build_payment(&PaymentParams {
            payment_source: Some(distribution.public_key()),
            ..params(channel.public_key(), dest.public_key(), "5")
        })
        .unwrap();

        assert_eq!(tx.source_account, muxed_account(channel.public_key()).unwrap());
        assert_eq!(
            tx.operations[0].source_account,
            Some(muxed_account(distribution.public_key()).unwrap())
        );

        // same account as the transaction source needs no operation source
        let tx = build_payment(&PaymentParams {
            payment_source: Some(channel.public_key()),
            ..params(channel.public_key(), dest.public_key(), "5")
        })
        .unwrap();
        assert_eq!(tx.operations[0].source_account, None);
    }

    #[test]
    fn test_merge_signatures_from_two_signers() {
        let channel = KeyPair::random();
        let distribution = KeyPair::random();
        let dest = KeyPair::random();
        let tx = build_payment(&PaymentParams {
            payment_source: Some(distribution.public_key()),
            ..params(channel.public_key(), dest.public_key(), "1")
        })
        .unwrap();
        let hash = transaction_hash(&tx, TEST_NETWORK_PASSPHRASE).unwrap();
        let by_channel = signed_envelope(tx.clone(), vec![channel.sign_hash(&hash).unwrap()]).unwrap();
        let by_distribution = signed_envelope(tx.clone(), vec![distribution.sign_hash(&hash).unwrap()]).unwrap();

        let merged = merge_signatures(by_channel.clone(), by_distribution).unwrap();
        match &merged {
            TransactionEnvelope::Tx(v1) => assert_eq!(v1.signatures.len(), 2),
            other => panic!("unexpected envelope {:?}", other),
        }
        assert_eq!(envelope_hash(&merged, TEST_NETWORK_PASSPHRASE).unwrap(), hash);

        let other_tx = build_payment(&params(channel.public_key(), dest.public_key(), "2")).unwrap();
        let unrelated = signed_envelope(other_tx, vec![]).unwrap();
        assert!(merge_signatures(by_channel, unrelated).is_err());
    }

    #[test]
    fn test_inner_hash_is_shared_by_fee_bumps() {
        let source = KeyPair::random();
        let dest = KeyPair::random();
        let tx = build_payment(&params(source.public_key(), dest.public_key(), "1")).unwrap();
        let envelope = signed_envelope(tx, vec![]).unwrap();
        let bumped = fee_bump_envelope(build_fee_bump(&envelope, source.public_key(), 100, 10).unwrap(), vec![]).unwrap();

        let plain = inner_hash(&envelope, TEST_NETWORK_PASSPHRASE).unwrap();
        assert_eq!(plain, envelope_hash(&envelope, TEST_NETWORK_PASSPHRASE).unwrap());
        assert_eq!(inner_hash(&bumped, TEST_NETWORK_PASSPHRASE).unwrap(), plain);
    }

    #[test]
    fn test_invalid_destination_is_terminal() {
        let source = KeyPair::random();
        let err = build_payment(&params(source.public_key(), "GNOTANACCOUNT", "1")).unwrap_err();
        assert!(err.is_terminal_rejection());
    }

    #[test]
    fn test_envelope_round_trip_keeps_hash() {
        let source = KeyPair::random();
        let dest = KeyPair::random();
        let tx = build_payment(&params(source.public_key(), dest.public_key(), "1")).unwrap();
        let hash = transaction_hash(&tx, TEST_NETWORK_PASSPHRASE).unwrap();
        let sig = source.sign_hash(&hash).unwrap();
        let envelope = signed_envelope(tx, vec![sig]).unwrap();

        let decoded = decode_envelope(&encode_envelope(&envelope).unwrap()).unwrap();
        assert_eq!(envelope_hash(&decoded, TEST_NETWORK_PASSPHRASE).unwrap(), hash);
        assert_ne!(
            envelope_hash(&decoded, crate::config::PUBLIC_NETWORK_PASSPHRASE).unwrap(),
            hash
        );
    }

    #[test]
    fn test_fee_bump_keeps_sequence_and_raises_fee() {
        let source = KeyPair::random();
        let dest = KeyPair::random();
        let tx = build_payment(&params(source.public_key(), dest.public_key(), "1")).unwrap();
        let envelope = signed_envelope(tx, vec![]).unwrap();

        let fee_bump = build_fee_bump(&envelope, source.public_key(), 100, 10).unwrap();
        assert_eq!(fee_bump.fee, 2_000);
        let bumped = fee_bump_envelope(fee_bump, vec![]).unwrap();
        assert_eq!(envelope_sequence(&bumped), Some(42));
        assert_ne!(
            envelope_hash(&bumped, TEST_NETWORK_PASSPHRASE).unwrap(),
            envelope_hash(&envelope, TEST_NETWORK_PASSPHRASE).unwrap()
        );
    }
}
