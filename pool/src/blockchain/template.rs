/// Block template as returned by `getblocktemplate`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::algorithm::Algorithm;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub fee: i64,
}

impl TemplateTransaction {
    /// Transaction id in display order; `txid` wins over the witness `hash`.
    pub fn id(&self) -> &str {
        self.txid
            .as_deref()
            .or(self.hash.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,
    pub height: u64,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    pub target: String,
    pub bits: String,
    #[serde(rename = "curtime")]
    pub cur_time: u32,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
}

impl BlockTemplate {
    /// Parse from RPC response
    pub fn from_rpc_response(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    /// Same chain tip: previous hash and height both match.
    pub fn same_tip(&self, other: &BlockTemplate) -> bool {
        self.previous_block_hash == other.previous_block_hash && self.height == other.height
    }

    pub fn transaction_ids(&self) -> Vec<&str> {
        self.transactions.iter().map(TemplateTransaction::id).collect()
    }

    pub fn total_fees(&self) -> i64 {
        self.transactions.iter().map(|tx| tx.fee).sum()
    }

    pub fn network_difficulty(&self, algorithm: Algorithm) -> Option<f64> {
        algorithm.difficulty_for_target_hex(&self.target)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    pub fn template_json(height: u64, prev: &str, txids: &[&str]) -> Value {
        let txs: Vec<Value> = txids
            .iter()
            .map(|tag| {
                let id = format!("{:0>64}", tag);
                json!({"data": format!("0100000000{}", tag), "txid": id, "hash": id, "fee": 1000})
            })
            .collect();
        json!({
            "version": 0x20000000u32,
            "height": height,
            "previousblockhash": prev,
            "transactions": txs,
            "coinbasevalue": 500_000_000_000u64,
            "target": "00000000ffff0000000000000000000000000000000000000000000000000000",
            "bits": "1d00ffff",
            "curtime": 1_700_000_000u32,
            "mintime": 1_699_999_000u32,
        })
    }

    pub fn template(height: u64, prev: &str, txids: &[&str]) -> BlockTemplate {
        BlockTemplate::from_rpc_response(&template_json(height, prev, txids)).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    const PREV: &str = "000000000000000000000000000000000000000000000000000000000000abcd";

    #[test]
    fn parses_daemon_template_and_ignores_unknown_fields() {
        let t = template(1000, PREV, &["aa", "bb"]);
        assert_eq!(t.height, 1000);
        assert_eq!(t.previous_block_hash, PREV);
        let ids = t.transaction_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids[0].ends_with("aa") && ids[0].len() == 64);
        assert_eq!(t.total_fees(), 2000);
        assert!(t.default_witness_commitment.is_none());
    }

    #[test]
    fn same_tip_compares_prev_hash_and_height() {
        let a = template(1000, PREV, &["aa"]);
        let b = template(1000, PREV, &["bb"]);
        let c = template(1001, PREV, &["aa"]);
        assert!(a.same_tip(&b));
        assert!(!a.same_tip(&c));
    }

    #[test]
    fn network_difficulty_from_target() {
        let t = template(1, PREV, &[]);
        let diff = t.network_difficulty(Algorithm::KawPow).unwrap();
        assert!(diff > 0.99 && diff < 1.0);
    }

    #[test]
    fn missing_required_fields_fail() {
        let res = BlockTemplate::from_rpc_response(&serde_json::json!({"height": 1}));
        assert!(res.is_err());
    }
}
