#![allow(dead_code)]

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::util::misc::{signed_msg_hash, MessageSignature};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    Address, EcdsaSig, EcdsaSighashType, Network, OutPoint, PackedLockTime, PublicKey, Script, Transaction,
    TxOut, Txid,
};
use blind_rsa_signatures::BlindSignature;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use whirlpool_server::chain::{ChainBackend, ChainTransaction};
use whirlpool_server::config::{DelayConfig, MinerFeeConfig, PoolConfig, RegisterInputConfig, ServerConfig};
use whirlpool_server::coordinator::InputRegistration;
use whirlpool_server::core::crypto::blinding_options;
use whirlpool_server::core::transaction::find_input_index;
use whirlpool_server::error::BroadcastError;
use whirlpool_server::notify::{Notifier, ServerMessage};
use whirlpool_server::provenance::FeeOutputProvenance;
use whirlpool_server::storage::Storage;
use whirlpool_server::{Coordinator, CoordinatorResult, MixStatus, MixSummary, RegisteredInput};

pub const POOL_ID: &str = "0.01btc";
pub const DENOM: u64 = 1_000_000;
/// Must-mix value carrying 200 sats of miner fee.
pub const MUST_MIX: u64 = DENOM + 200;

// ─── Collaborators ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockChain {
    txs: Mutex<HashMap<Txid, ChainTransaction>>,
    spent: Mutex<HashSet<OutPoint>>,
    broadcast_error: Mutex<Option<String>>,
    unspent_failures: Mutex<usize>,
    pub broadcasted: Mutex<Vec<Transaction>>,
}

impl MockChain {
    /// Confirmed transaction with the given outputs; `nonce` keeps txids apart.
    pub fn fund(&self, nonce: u32, outputs: Vec<TxOut>) -> Txid {
        let tx = Transaction { version: 2, lock_time: PackedLockTime(nonce), input: vec![], output: outputs };
        let txid = tx.txid();
        self.txs.lock().insert(txid, ChainTransaction { tx, confirmations: 3, time: Some(1_000) });
        txid
    }

    pub fn spend(&self, outpoint: OutPoint) {
        self.spent.lock().insert(outpoint);
    }

    /// The next `n` unspent checks fail as if the node were unreachable.
    pub fn fail_unspent_checks(&self, n: usize) {
        *self.unspent_failures.lock() = n;
    }

    pub fn fail_broadcast(&self, reason: &str) {
        *self.broadcast_error.lock() = Some(reason.to_string());
    }
}

impl ChainBackend for MockChain {
    fn get_transaction(&self, txid: &Txid) -> anyhow::Result<Option<ChainTransaction>> {
        Ok(self.txs.lock().get(txid).cloned())
    }

    fn is_unspent(&self, outpoint: &OutPoint) -> anyhow::Result<bool> {
        {
            let mut failures = self.unspent_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("connection refused");
            }
        }
        let known = self
            .txs
            .lock()
            .get(&outpoint.txid)
            .map_or(false, |tx| (outpoint.vout as usize) < tx.tx.output.len());
        Ok(known && !self.spent.lock().contains(outpoint))
    }

    fn block_height(&self) -> anyhow::Result<u64> {
        Ok(100)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, BroadcastError> {
        if let Some(reason) = self.broadcast_error.lock().clone() {
            return Err(BroadcastError { reason });
        }
        self.broadcasted.lock().push(tx.clone());
        Ok(tx.txid())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, ServerMessage)>>,
}

impl RecordingNotifier {
    pub fn messages(&self, username: &str) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(u, _)| u == username)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn last<T>(&self, username: &str, pick: impl Fn(&ServerMessage) -> Option<T>) -> Option<T> {
        self.messages(username).iter().rev().find_map(|m| pick(m))
    }

    pub fn received(&self, username: &str, message: &ServerMessage) -> bool {
        self.messages(username).contains(message)
    }
}

impl Notifier for RecordingNotifier {
    fn send_private(&self, username: &str, message: ServerMessage) {
        self.sent.lock().push((username.to_string(), message));
    }
}

// ─── Keys ───────────────────────────────────────────────────────────────────

pub fn key(seed: u8) -> (SecretKey, PublicKey) {
    let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
    let pk = PublicKey::new(sk.public_key(&Secp256k1::new()));
    (sk, pk)
}

pub fn p2wpkh(pk: &PublicKey) -> Address {
    Address::p2wpkh(pk, Network::Regtest).unwrap()
}

pub fn sign_message(sk: &SecretKey, message: &str) -> String {
    let msg = Message::from_slice(&signed_msg_hash(message)[..]).unwrap();
    let sig = Secp256k1::new().sign_ecdsa_recoverable(&msg, sk);
    MessageSignature::new(sig, true).to_base64()
}

/// P2WPKH witness spending `value` at `outpoint` in `tx`.
pub fn witness(tx: &Transaction, outpoint: &OutPoint, sk: &SecretKey, pk: &PublicKey, value: u64) -> Vec<Vec<u8>> {
    let index = find_input_index(tx, outpoint).unwrap();
    let script_code = Script::new_p2pkh(&pk.pubkey_hash());
    let sighash = SighashCache::new(tx)
        .segwit_signature_hash(index, &script_code, value, EcdsaSighashType::All)
        .unwrap();
    let sig = Secp256k1::new().sign_ecdsa(&Message::from_slice(&sighash.into_inner()).unwrap(), sk);
    let sig = EcdsaSig { sig, hash_ty: EcdsaSighashType::All };
    vec![sig.to_vec(), pk.to_bytes()]
}

// ─── Config ─────────────────────────────────────────────────────────────────

pub fn test_config(anonymity_set: usize, must_mix_min: usize, liquidity_min: usize) -> ServerConfig {
    ServerConfig {
        network: Network::Regtest,
        test_mode: true,
        register_input: RegisterInputConfig { confirm_interval_secs: 0, ..Default::default() },
        miner_fees: MinerFeeConfig { min: 100, cap: 9_000, max: 10_000, min_relay_fee: 300 },
        pools: vec![PoolConfig {
            id: POOL_ID.into(),
            denomination: DENOM,
            fee_value: 50_000,
            fee_accept: BTreeMap::new(),
            miner_fees: None,
            must_mix_min,
            liquidity_min,
            anonymity_set,
            tx0_max_outputs: 70,
        }],
        delays: DelayConfig { invite_ms: 0, confirm_check_ms: 0 },
        ..Default::default()
    }
}

// ─── Client ─────────────────────────────────────────────────────────────────

pub struct TestUser {
    pub username: String,
    pub sk: SecretKey,
    pub pk: PublicKey,
    pub txid: Txid,
    pub value: u64,
    pub liquidity: bool,
    pub receive_address: String,
    pub bordereau: Vec<u8>,
    pub user_hash: String,
    pub unblinded: Option<Vec<u8>>,
}

impl TestUser {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, 0)
    }

    pub fn utxo_key(&self) -> String {
        format!("{}:0", self.txid)
    }

    pub fn address(&self) -> String {
        p2wpkh(&self.pk).to_string()
    }
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub chain: Arc<MockChain>,
    pub notifier: Arc<RecordingNotifier>,
    pub storage: Storage,
}

impl Harness {
    pub fn new(config: ServerConfig) -> Self {
        let storage = Storage::temporary().unwrap();
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: ServerConfig, storage: Storage) -> Self {
        let chain = Arc::new(MockChain::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let provenance =
            Arc::new(FeeOutputProvenance::new(config.fee_address.as_deref(), storage.clone()).unwrap());
        let coordinator =
            Coordinator::new(config, chain.clone(), provenance, notifier.clone(), storage.clone()).unwrap();
        Self { coordinator, chain, notifier, storage }
    }

    pub fn mix_id(&self) -> String {
        self.coordinator.current_mix_id(POOL_ID).unwrap()
    }

    pub fn status(&self, mix_id: &str) -> MixStatus {
        self.coordinator.mix_snapshot(mix_id).unwrap().status
    }

    pub fn summary(&self, mix_id: &str) -> MixSummary {
        self.storage.load_mix(mix_id).unwrap().expect("mix summary saved")
    }

    /// A user whose UTXO (output 0 of its own funding tx) is on chain.
    pub fn user(&self, n: u8, value: u64, liquidity: bool) -> TestUser {
        self.user_with_outputs(n, value, liquidity, Vec::new())
    }

    pub fn user_with_outputs(&self, n: u8, value: u64, liquidity: bool, extra: Vec<TxOut>) -> TestUser {
        let (sk, pk) = key(n);
        let (_, receive_pk) = key(n.wrapping_add(100));
        let mut outputs = vec![TxOut { value, script_pubkey: p2wpkh(&pk).script_pubkey() }];
        outputs.extend(extra);
        let txid = self.chain.fund(n as u32, outputs);
        TestUser {
            username: format!("user{}", n),
            sk,
            pk,
            txid,
            value,
            liquidity,
            receive_address: p2wpkh(&receive_pk).to_string(),
            bordereau: format!("bordereau-{}", n).into_bytes(),
            user_hash: format!("wallet-{}", n),
            unblinded: None,
        }
    }

    pub fn registration(&self, user: &TestUser) -> InputRegistration {
        InputRegistration {
            pool_id: POOL_ID.into(),
            username: user.username.clone(),
            signature: sign_message(&user.sk, POOL_ID),
            utxo_hash: user.txid.to_string(),
            utxo_index: 0,
            liquidity: user.liquidity,
            ip: "10.0.0.1".into(),
        }
    }

    pub fn register(&self, user: &TestUser) -> CoordinatorResult<RegisteredInput> {
        self.coordinator.register_input(&self.registration(user))
    }

    /// One watchdog pass; with a zero confirm interval this invites.
    pub fn invite(&self) {
        self.coordinator.tick();
    }

    pub fn invitation(&self, user: &TestUser) -> Option<(String, String)> {
        self.notifier.last(&user.username, |m| match m {
            ServerMessage::ConfirmInput { mix_id, public_key } => Some((mix_id.clone(), public_key.clone())),
            _ => None,
        })
    }

    /// Blind the bordereau, confirm, unblind the signature.
    pub fn confirm(&self, user: &mut TestUser) -> CoordinatorResult<()> {
        let (mix_id, public_key) = self.invitation(user).expect("invited");
        let pk = blind_rsa_signatures::PublicKey::from_der(&hex::decode(public_key).unwrap()).unwrap();
        let blinding = pk.blind(&user.bordereau, &blinding_options()).unwrap();
        let signed =
            self.coordinator
                .confirm_input(&mix_id, &user.username, &blinding.blind_msg.0, &user.user_hash)?;
        let sig = pk
            .finalize(&BlindSignature::new(signed), &blinding.secret, &user.bordereau, &blinding_options())
            .unwrap();
        user.unblinded = Some(sig.0);
        Ok(())
    }

    pub fn inputs_hash(&self, user: &TestUser) -> String {
        self.notifier
            .last(&user.username, |m| match m {
                ServerMessage::RegisterOutput { inputs_hash, .. } => Some(inputs_hash.clone()),
                _ => None,
            })
            .expect("REGISTER_OUTPUT notified")
    }

    pub fn register_output(&self, user: &TestUser) -> CoordinatorResult<()> {
        let unblinded = user.unblinded.clone().expect("confirmed");
        self.coordinator
            .register_output(&self.inputs_hash(user), &unblinded, &user.receive_address, &user.bordereau)
    }

    pub fn signing_tx(&self, user: &TestUser) -> Transaction {
        let raw = self
            .notifier
            .last(&user.username, |m| match m {
                ServerMessage::Signing { tx, .. } => Some(tx.clone()),
                _ => None,
            })
            .expect("SIGNING notified");
        bitcoin::consensus::encode::deserialize(&hex::decode(raw).unwrap()).unwrap()
    }

    pub fn sign(&self, user: &TestUser) -> CoordinatorResult<()> {
        let tx = self.signing_tx(user);
        let witness = witness(&tx, &user.outpoint(), &user.sk, &user.pk, user.value);
        self.coordinator.register_signature(&self.mix_id_of(user), &user.username, &witness)
    }

    /// Round the user was last invited to.
    pub fn mix_id_of(&self, user: &TestUser) -> String {
        self.invitation(user).expect("invited").0
    }

    /// Register, invite and confirm every user.
    pub fn reach_register_output(&self, users: &mut [TestUser]) -> String {
        for user in users.iter() {
            self.register(user).unwrap();
        }
        self.invite();
        let mix_id = self.mix_id();
        for user in users.iter_mut() {
            self.confirm(user).unwrap();
        }
        assert_eq!(self.status(&mix_id), MixStatus::RegisterOutput);
        mix_id
    }

    pub fn reach_signing(&self, users: &mut [TestUser]) -> String {
        let mix_id = self.reach_register_output(users);
        for user in users.iter() {
            self.register_output(user).unwrap();
        }
        assert_eq!(self.status(&mix_id), MixStatus::Signing);
        mix_id
    }
}
