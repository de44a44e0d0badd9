/// Generation (coinbase) transaction builder
///
/// Splits the block reward between the pool script and the configured
/// reward recipients.

use super::template::BlockTemplate;
use crate::util::{push_data, serialize_height, sha256d, var_int};

/// A reward recipient with its output script resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub address: String,
    pub percent: f64,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationTx {
    pub tx_hex: String,
    /// Double-SHA256 of the serialization, internal byte order.
    pub tx_hash: [u8; 32],
    pub reward_to_pool: u64,
}

impl GenerationTx {
    pub fn tx_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.tx_hex)
    }
}

pub trait GenerationBuilder: Send + Sync {
    fn build(
        &self,
        template: &BlockTemplate,
        block_reward: u64,
        recipients: &[Recipient],
        pool_script: &[u8],
    ) -> GenerationTx;
}

/// Version-1 coinbase with a BIP34 height and a coinbase tag in the scriptSig.
#[derive(Debug, Clone)]
pub struct StandardGenerationBuilder {
    coinbase_tag: Vec<u8>,
}

impl StandardGenerationBuilder {
    pub fn new(coinbase_tag: impl AsRef<[u8]>) -> Self {
        Self {
            coinbase_tag: coinbase_tag.as_ref().to_vec(),
        }
    }

    fn script_sig(&self, height: u64) -> Vec<u8> {
        let mut script = serialize_height(height);
        script.push(0x00); // OP_0
        script.extend_from_slice(&push_data(&self.coinbase_tag));
        script
    }
}

impl Default for StandardGenerationBuilder {
    fn default() -> Self {
        Self::new("kawpow")
    }
}

impl GenerationBuilder for StandardGenerationBuilder {
    fn build(
        &self,
        template: &BlockTemplate,
        block_reward: u64,
        recipients: &[Recipient],
        pool_script: &[u8],
    ) -> GenerationTx {
        let fee_percent: f64 = recipients.iter().map(|r| r.percent).sum();
        let reward_to_pool = (block_reward as f64 * (1.0 - fee_percent / 100.0)).floor() as u64;

        let mut outputs: Vec<(u64, Vec<u8>)> = Vec::with_capacity(recipients.len() + 2);
        outputs.push((reward_to_pool, pool_script.to_vec()));
        for r in recipients {
            let value = (block_reward as f64 * (r.percent / 100.0)).round() as u64;
            outputs.push((value, r.script.clone()));
        }
        if let Some(commitment) = &template.default_witness_commitment {
            match hex::decode(commitment) {
                Ok(script) => outputs.push((0, script)),
                Err(e) => tracing::warn!("Ignoring malformed witness commitment: {}", e),
            }
        }

        let script_sig = self.script_sig(template.height);

        let mut tx = Vec::with_capacity(128 + outputs.len() * 40);
        tx.extend_from_slice(&1u32.to_le_bytes());
        tx.extend_from_slice(&var_int(1));
        tx.extend_from_slice(&[0u8; 32]);
        tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
        tx.extend_from_slice(&var_int(script_sig.len() as u64));
        tx.extend_from_slice(&script_sig);
        tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
        tx.extend_from_slice(&var_int(outputs.len() as u64));
        for (value, script) in &outputs {
            tx.extend_from_slice(&value.to_le_bytes());
            tx.extend_from_slice(&var_int(script.len() as u64));
            tx.extend_from_slice(script);
        }
        tx.extend_from_slice(&0u32.to_le_bytes());

        GenerationTx {
            tx_hash: sha256d(&tx),
            tx_hex: hex::encode(&tx),
            reward_to_pool,
        }
    }
}
