//! Identity & Key Store (component A).
//!
//! Stable node GUID plus a long-lived RSA-2048 keypair, persisted under the
//! `settings` table on first start. The display name is mutable; the GUID
//! and keypair are not.

use parking_lot::RwLock;
use rsa::{RsaPrivateKey, RsaPublicKey};
use uuid::Uuid;

use crate::crypto;
use crate::db::Db;
use crate::error::CoreResult;

const KEY_GUID: &str = "node_guid";
const KEY_PRIVATE_PEM: &str = "node_private_key_pem";
const KEY_DISPLAY_NAME: &str = "node_display_name";

/// `(GUID, public-key PEM, display-name)` — the shape returned to both
/// discovery's key-fetch responder and the UI's "who am I" query.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WhoAmI {
    pub guid: Uuid,
    pub public_key: String,
    pub name: String,
}

pub struct Identity {
    guid: Uuid,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    display_name: RwLock<String>,
}

impl Identity {
    /// Load the persisted identity, or generate and persist a new one.
    /// The GUID and keypair never change once created for a data directory.
    pub fn load_or_create(db: &Db, default_name: &str) -> CoreResult<Self> {
        let guid = match db.load_setting(KEY_GUID)? {
            Some(raw) => Uuid::parse_str(&raw).unwrap_or_else(|_| Uuid::new_v4()),
            None => {
                let guid = Uuid::new_v4();
                db.save_setting(KEY_GUID, &guid.to_string())?;
                guid
            }
        };

        let private_key = match db.load_setting(KEY_PRIVATE_PEM)? {
            Some(pem) => crypto::private_key_from_pem(&pem)?,
            None => {
                let (sk, _pk) = crypto::generate_keypair()?;
                let pem = crypto::private_key_to_pem(&sk)?;
                db.save_setting(KEY_PRIVATE_PEM, &pem)?;
                sk
            }
        };
        let public_key = RsaPublicKey::from(&private_key);

        let display_name = match db.load_setting(KEY_DISPLAY_NAME)? {
            Some(name) => name,
            None => {
                db.save_setting(KEY_DISPLAY_NAME, default_name)?;
                default_name.to_string()
            }
        };

        Ok(Self {
            guid,
            private_key,
            public_key,
            display_name: RwLock::new(display_name),
        })
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn display_name(&self) -> String {
        self.display_name.read().clone()
    }

    /// Update the mutable display name, persisting it. Callers (the
    /// discovery advertiser) are expected to rebuild their advertisement
    /// record after this changes.
    pub fn set_display_name(&self, db: &Db, name: String) -> CoreResult<()> {
        db.save_setting(KEY_DISPLAY_NAME, &name)?;
        *self.display_name.write() = name;
        Ok(())
    }

    pub fn whoami(&self) -> CoreResult<WhoAmI> {
        Ok(WhoAmI {
            guid: self.guid,
            public_key: crypto::public_key_to_pem(&self.public_key)?,
            name: self.display_name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_stable_across_reload() {
        let db = Db::open_memory().unwrap();
        let id1 = Identity::load_or_create(&db, "node-a").unwrap();
        let guid = id1.guid();
        let id2 = Identity::load_or_create(&db, "node-a").unwrap();
        assert_eq!(guid, id2.guid());
        assert_eq!(
            crypto::public_key_to_pem(id1.public_key()).unwrap(),
            crypto::public_key_to_pem(id2.public_key()).unwrap()
        );
    }

    #[test]
    fn whoami_key_decrypts_inbound() {
        let db = Db::open_memory().unwrap();
        let id = Identity::load_or_create(&db, "node-a").unwrap();
        let who = id.whoami().unwrap();
        let pk = crypto::public_key_from_pem(&who.public_key).unwrap();
        let wire = crypto::encrypt(b"hi", "m1", &pk).unwrap();
        let back = crypto::decrypt(&wire, "m1", id.private_key()).unwrap();
        assert_eq!(back, b"hi");
    }
}
