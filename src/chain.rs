//! Blockchain collaborator.
//!
//! The coordinator only needs five lookups from a node; [`ChainBackend`]
//! names them and [`BitcoindClient`] serves them from bitcoind's JSON-RPC.

use crate::config::RpcClientConfig;
use crate::core::types::TxOutPoint;
use crate::error::BroadcastError;
use anyhow::{anyhow, bail, Context, Result};
use bitcoin::consensus::encode;
use bitcoin::{Address, Network, OutPoint, Transaction, Txid};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;

/// A transaction as seen by the node.
#[derive(Clone, Debug)]
pub struct ChainTransaction {
    pub tx: Transaction,
    /// 0 while unconfirmed.
    pub confirmations: u32,
    /// Block time (unix secs), `None` while unconfirmed.
    pub time: Option<u64>,
}

impl ChainTransaction {
    /// Details of output `index`, or `None` if it does not exist or pays to
    /// a script without an address form.
    pub fn outpoint(&self, index: u32, network: Network) -> Option<TxOutPoint> {
        let output = self.tx.output.get(index as usize)?;
        let address = Address::from_script(&output.script_pubkey, network).ok()?;
        Some(TxOutPoint {
            hash: self.tx.txid(),
            index,
            value: output.value,
            confirmations: self.confirmations,
            script_pubkey: output.script_pubkey.clone(),
            address: address.to_string(),
        })
    }
}

pub trait ChainBackend: Send + Sync {
    /// `Ok(None)` when the node does not know the transaction.
    fn get_transaction(&self, txid: &Txid) -> Result<Option<ChainTransaction>>;

    fn is_unspent(&self, outpoint: &OutPoint) -> Result<bool>;

    fn block_height(&self) -> Result<u64>;

    fn broadcast(&self, tx: &Transaction) -> std::result::Result<Txid, BroadcastError>;
}

// ─── bitcoind ───

/// bitcoind error code for an unknown transaction.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    hex: String,
    #[serde(default)]
    confirmations: u32,
    #[serde(default)]
    blocktime: Option<u64>,
}

/// Blocking JSON-RPC client. Must be built outside an async context.
pub struct BitcoindClient {
    client: reqwest::blocking::Client,
    config: RpcClientConfig,
}

impl BitcoindClient {
    pub fn new(config: RpcClientConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building rpc client")?;
        Ok(Self { client, config })
    }

    fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<std::result::Result<Option<T>, RpcError>> {
        let body = json!({ "jsonrpc": "1.0", "id": "whirlpool", "method": method, "params": params });
        let mut request = self.client.post(&self.config.url).json(&body);
        if !self.config.user.is_empty() {
            request = request.basic_auth(&self.config.user, Some(&self.config.password));
        }
        // bitcoind answers errors with HTTP 500 and a JSON body
        let response: RpcResponse<T> = request
            .send()
            .with_context(|| format!("rpc {} unreachable", method))?
            .json()
            .with_context(|| format!("rpc {}: malformed response", method))?;
        Ok(match response.error {
            Some(e) => Err(e),
            None => Ok(response.result),
        })
    }

    fn call_ok<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        self.call(method, params)?
            .map_err(|e| anyhow!("rpc {} failed ({}): {}", method, e.code, e.message))
    }
}

impl ChainBackend for BitcoindClient {
    fn get_transaction(&self, txid: &Txid) -> Result<Option<ChainTransaction>> {
        let raw: RawTransaction = match self.call("getrawtransaction", json!([txid.to_string(), true]))? {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) if e.code == RPC_INVALID_ADDRESS_OR_KEY => return Ok(None),
            Err(e) => bail!("getrawtransaction failed ({}): {}", e.code, e.message),
        };
        let bytes = hex::decode(&raw.hex).context("getrawtransaction: invalid hex")?;
        let tx: Transaction = encode::deserialize(&bytes).context("getrawtransaction: invalid tx")?;
        Ok(Some(ChainTransaction { tx, confirmations: raw.confirmations, time: raw.blocktime }))
    }

    fn is_unspent(&self, outpoint: &OutPoint) -> Result<bool> {
        let txout: Option<Value> =
            self.call_ok("gettxout", json!([outpoint.txid.to_string(), outpoint.vout, true]))?;
        Ok(txout.map_or(false, |v| !v.is_null()))
    }

    fn block_height(&self) -> Result<u64> {
        self.call_ok("getblockcount", json!([]))?
            .ok_or_else(|| anyhow!("getblockcount: empty result"))
    }

    fn broadcast(&self, tx: &Transaction) -> std::result::Result<Txid, BroadcastError> {
        let raw = encode::serialize_hex(tx);
        if self.config.mock_tx_broadcast {
            tracing::info!("mock_tx_broadcast: not pushing {} {}", tx.txid(), raw);
            return Ok(tx.txid());
        }
        let reason = match self.call::<String>("sendrawtransaction", json!([raw])) {
            Ok(Ok(Some(txid))) => {
                return Txid::from_str(&txid).map_err(|e| BroadcastError { reason: e.to_string() })
            }
            Ok(Ok(None)) => "empty result".to_string(),
            Ok(Err(e)) => e.message,
            Err(e) => e.to_string(),
        };
        Err(BroadcastError { reason })
    }
}
