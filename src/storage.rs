use crate::core::types::{BlameReason, MixSummary};
use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlameRecord {
    pub identifier: String,
    pub reason: BlameReason,
    pub mix_id: String,
    pub ip: String,
    pub created: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    pub identifier: String,
    pub created: u64,
    /// Millis timestamp; `None` is a permanent ban.
    pub expiration: Option<u64>,
    pub response: String,
    pub notes: Option<String>,
}

impl BanRecord {
    pub fn is_active(&self, now: u64) -> bool {
        self.expiration.map_or(true, |exp| exp > now)
    }

    /// Length of a temporary ban in millis.
    pub fn duration(&self) -> Option<u64> {
        self.expiration.map(|exp| exp.saturating_sub(self.created))
    }
}

/// sled-backed persistence: concluded rounds, the payout-address denylist,
/// successful mix txids, blames and bans.
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
    mixes: sled::Tree,
    mix_outputs: sled::Tree,
    mix_txids: sled::Tree,
    blames: sled::Tree,
    bans: sled::Tree,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store, gone when dropped.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            mixes: db.open_tree("mixes")?,
            mix_outputs: db.open_tree("mix_outputs")?,
            mix_txids: db.open_tree("mix_txids")?,
            blames: db.open_tree("blames")?,
            bans: db.open_tree("bans")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Mixes ───

    pub fn save_mix(&self, summary: &MixSummary) -> Result<()> {
        self.mixes.insert(summary.mix_id.as_bytes(), bincode::serialize(summary)?)?;
        Ok(())
    }

    pub fn load_mix(&self, mix_id: &str) -> Result<Option<MixSummary>> {
        match self.mixes.get(mix_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn count_mixes(&self) -> usize {
        self.mixes.len()
    }

    // ─── Output denylist ───

    pub fn has_mix_output(&self, address: &str) -> Result<bool> {
        Ok(self.mix_outputs.contains_key(address.as_bytes())?)
    }

    pub fn save_mix_output(&self, address: &str, mix_id: &str) -> Result<()> {
        self.mix_outputs.insert(address.as_bytes(), mix_id.as_bytes())?;
        Ok(())
    }

    pub fn delete_mix_output(&self, address: &str) -> Result<()> {
        self.mix_outputs.remove(address.as_bytes())?;
        Ok(())
    }

    // ─── Mix txids ───

    pub fn save_mix_txid(&self, txid: &str, denomination: u64) -> Result<()> {
        self.mix_txids.insert(txid.as_bytes(), &denomination.to_be_bytes())?;
        Ok(())
    }

    pub fn has_mix_txid(&self, txid: &str, denomination: u64) -> Result<bool> {
        Ok(match self.mix_txids.get(txid.as_bytes())? {
            Some(bytes) => bytes.as_ref() == denomination.to_be_bytes(),
            None => false,
        })
    }

    // ─── Blames & bans ───

    pub fn save_blame(&self, blame: &BlameRecord) -> Result<()> {
        insert_record(&self.blames, &blame.identifier, blame.created, blame)
    }

    pub fn find_blames(&self, identifier: &str) -> Result<Vec<BlameRecord>> {
        scan_records(&self.blames, identifier)
    }

    pub fn save_ban(&self, ban: &BanRecord) -> Result<()> {
        insert_record(&self.bans, &ban.identifier, ban.created, ban)
    }

    pub fn find_bans(&self, identifier: &str) -> Result<Vec<BanRecord>> {
        scan_records(&self.bans, identifier)
    }
}

/// Records are keyed `identifier \0 created(be) random(be)` so a prefix scan
/// returns one identifier's history in time order.
fn insert_record<T: Serialize>(tree: &sled::Tree, identifier: &str, created: u64, record: &T) -> Result<()> {
    let mut key = record_prefix(identifier);
    key.extend_from_slice(&created.to_be_bytes());
    key.extend_from_slice(&rand::random::<u64>().to_be_bytes());
    tree.insert(key, bincode::serialize(record)?)?;
    Ok(())
}

fn scan_records<T: DeserializeOwned>(tree: &sled::Tree, identifier: &str) -> Result<Vec<T>> {
    tree.scan_prefix(record_prefix(identifier))
        .map(|entry| {
            let (_, bytes) = entry?;
            Ok(bincode::deserialize(&bytes)?)
        })
        .collect()
}

fn record_prefix(identifier: &str) -> Vec<u8> {
    let mut prefix = identifier.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MixStatus;

    fn summary(id: &str) -> MixSummary {
        MixSummary {
            mix_id: id.into(),
            pool_id: "0.01btc".into(),
            status: MixStatus::Success,
            fail_reason: None,
            fail_info: None,
            nb_must_mix: 3,
            nb_liquidities: 2,
            anonymity_set: 5,
            amount_in: 5_000_600,
            amount_out: 5_000_000,
            txid: Some("ab".repeat(32)),
            duration_secs: 42,
            finished_at: 1,
        }
    }

    #[test]
    fn mix_summary_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.save_mix(&summary("m1")).unwrap();
            storage.flush().unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.load_mix("m1").unwrap(), Some(summary("m1")));
        assert_eq!(storage.load_mix("m2").unwrap(), None);
        assert_eq!(storage.count_mixes(), 1);
    }

    #[test]
    fn output_denylist() {
        let storage = Storage::temporary().unwrap();
        assert!(!storage.has_mix_output("tb1qa").unwrap());
        storage.save_mix_output("tb1qa", "m1").unwrap();
        assert!(storage.has_mix_output("tb1qa").unwrap());
        storage.delete_mix_output("tb1qa").unwrap();
        assert!(!storage.has_mix_output("tb1qa").unwrap());
    }

    #[test]
    fn mix_txids_are_per_denomination() {
        let storage = Storage::temporary().unwrap();
        storage.save_mix_txid("aa", 1_000_000).unwrap();
        assert!(storage.has_mix_txid("aa", 1_000_000).unwrap());
        assert!(!storage.has_mix_txid("aa", 100_000).unwrap());
        assert!(!storage.has_mix_txid("bb", 1_000_000).unwrap());
    }

    #[test]
    fn records_are_scoped_by_identifier() {
        let storage = Storage::temporary().unwrap();
        for (id, created) in [("abc", 1), ("abc", 2), ("abcd", 3)] {
            storage
                .save_blame(&BlameRecord {
                    identifier: id.into(),
                    reason: BlameReason::Signing,
                    mix_id: "m".into(),
                    ip: "1.1.1.1".into(),
                    created,
                })
                .unwrap();
        }
        let blames = storage.find_blames("abc").unwrap();
        assert_eq!(blames.iter().map(|b| b.created).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(storage.find_blames("abcd").unwrap().len(), 1);
        assert!(storage.find_bans("abc").unwrap().is_empty());
    }

    #[test]
    fn ban_activity() {
        let ban = BanRecord {
            identifier: "x".into(),
            created: 100,
            expiration: Some(200),
            response: "banned".into(),
            notes: None,
        };
        assert!(ban.is_active(150));
        assert!(!ban.is_active(200));
        assert_eq!(ban.duration(), Some(100));
        let permanent = BanRecord { expiration: None, ..ban };
        assert!(permanent.is_active(u64::MAX));
    }
}
